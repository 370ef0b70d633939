//! Structured results returned by the orchestrators.
//!
//! Neither orchestrator raises past its own boundary; callers inspect these
//! values to render full, partial or failed runs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of one backup run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub success: bool,
    pub backup_dir: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub record_id: Option<String>,
    pub downloaded: usize,
    pub failed_downloads: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A file that could not be restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFailure {
    pub public_id: String,
    pub error: String,
}

/// Per-file bookkeeping behind the counts of a [`RestoreOutcome`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreDetails {
    pub failures: Vec<FileFailure>,
    /// Zero-byte files treated as incomplete exports
    pub empty_files: Vec<String>,
    /// Public ids already present in the media store
    pub existing: Vec<String>,
    /// Entries that could not be enumerated (not counted in totals)
    pub enumeration_errors: Vec<String>,
}

/// Aggregate result of a restore run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub uploaded_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub total_files: usize,
    pub success: bool,
    pub message: String,
    pub details: RestoreDetails,
}

impl RestoreOutcome {
    /// Outcome for a run that aborted before touching the media store.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            uploaded_count: 0,
            failed_count: 0,
            skipped_count: 0,
            total_files: 0,
            success: false,
            message: message.into(),
            details: RestoreDetails::default(),
        }
    }

    /// Number of files that reached a terminal state.
    pub fn processed(&self) -> usize {
        self.uploaded_count + self.failed_count + self.skipped_count
    }
}

/// Human-readable summary for a restore run.
pub fn summarize(uploaded: usize, failed: usize, skipped: usize) -> String {
    match (uploaded, failed, skipped) {
        (0, 0, 0) => "No files found in the backup to restore".to_string(),
        (0, 0, s) => format!("Nothing uploaded: all {} files were skipped (already present or empty)", s),
        (0, f, s) => format!("Restore failed: {} files failed to upload, {} skipped", f, s),
        (u, 0, 0) => format!("Restore completed successfully: {} files uploaded", u),
        (u, 0, s) => format!("Restore completed successfully: {} files uploaded, {} skipped", u, s),
        (u, f, s) => format!(
            "Restore partially completed: {} files uploaded, {} failed, {} skipped",
            u, f, s
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_wording() {
        assert!(summarize(0, 0, 0).starts_with("No files found"));
        assert!(summarize(0, 0, 4).starts_with("Nothing uploaded"));
        assert!(summarize(0, 3, 0).starts_with("Restore failed"));
        assert!(summarize(5, 0, 0).contains("successfully: 5 files uploaded"));
        assert!(summarize(5, 0, 2).contains("2 skipped"));
        assert!(summarize(3, 2, 0).starts_with("Restore partially completed"));
    }

    #[test]
    fn test_outcome_json_uses_camel_case() {
        let outcome = RestoreOutcome::aborted("Backup archive not found");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["uploadedCount"], 0);
        assert_eq!(json["skippedCount"], 0);
        assert_eq!(json["success"], false);
        assert!(json["details"]["enumerationErrors"].is_array());
    }
}
