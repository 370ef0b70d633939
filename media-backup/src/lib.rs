//! Media backup library
//!
//! Exports every asset of a remote media store into a zip archive (optionally
//! encrypted), and restores such an archive back into the store.

pub mod archive;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod enumerator;
pub mod fs;
pub mod models;
pub mod notify;
pub mod provider;
pub mod record;
pub mod restore;
pub mod retry;
pub mod utils;

// Re-export commonly used types
pub use backup::{BackupOrchestrator, BackupSettings};
pub use crate::config::Config;
pub use models::{BackupOutcome, RestoreOutcome};
pub use notify::{DeliveryPolicy, NotificationQueue};
pub use provider::{CloudinaryStore, FakeMediaStore, MediaStore};
pub use record::{MemoryRecordStore, RecordStore};
pub use restore::{RestoreOptions, RestoreOrchestrator, RestoreRequest, RestoreResponse, RestoreSettings, SuccessPolicy};
pub use utils::errors::{BackupError, Result};
