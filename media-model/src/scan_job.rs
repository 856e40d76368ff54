use chrono::{DateTime, Utc};

use crate::ids::{LibraryId, ScanJobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, ScanStatus::Running | ScanStatus::Paused)
    }
}

/// Opaque resume cursor. Carries the lexicographically smallest
/// not-yet-fully-processed path across the worker pool, so the walker can
/// restart discovery exactly where it left off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanCheckpoint {
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanJob {
    pub id: ScanJobId,
    pub library_id: LibraryId,
    pub status: ScanStatus,
    pub files_found: u64,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub bytes_processed: u64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checkpoint: ScanCheckpoint,
}

impl ScanJob {
    pub fn new(library_id: LibraryId) -> Self {
        Self {
            id: ScanJobId::new(),
            library_id,
            status: ScanStatus::Pending,
            files_found: 0,
            files_processed: 0,
            files_skipped: 0,
            bytes_processed: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            checkpoint: ScanCheckpoint::default(),
        }
    }

    /// Progress percentage. An estimate until discovery has completed
    /// (`files_found` stops growing), after which it is exact.
    pub fn progress_pct(&self) -> f64 {
        if self.files_found == 0 {
            return 0.0;
        }
        100.0 * (self.files_processed as f64) / (self.files_found as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LibraryStats {
    pub total_files: u64,
    pub total_bytes: u64,
    pub last_scan_duration_secs: Option<f64>,
    pub last_scan_completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_zero_before_discovery() {
        let job = ScanJob::new(LibraryId::new());
        assert_eq!(job.progress_pct(), 0.0);
    }

    #[test]
    fn progress_reflects_processed_ratio() {
        let mut job = ScanJob::new(LibraryId::new());
        job.files_found = 100;
        job.files_processed = 40;
        assert_eq!(job.progress_pct(), 40.0);
    }
}
