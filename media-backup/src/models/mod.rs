//! Data carried between the pipeline stages.

pub mod asset;
pub mod manifest;
pub mod outcome;

pub use asset::{Asset, ResourceType};
pub use manifest::{FolderScope, Manifest, MANIFEST_FILE};
pub use outcome::{BackupOutcome, FileFailure, RestoreDetails, RestoreOutcome};
