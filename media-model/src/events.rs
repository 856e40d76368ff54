use chrono::{DateTime, Utc};

use crate::ids::{LibraryId, MediaFileId, ScanJobId, SessionId};

/// A typed event published by the core. The event bus transport itself is
/// out of scope here; this is only the payload shape components agree on.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    pub id: uuid::Uuid,
    pub source: &'static str,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "data"))]
pub enum EventKind {
    #[cfg_attr(feature = "serde", serde(rename = "scan.started"))]
    ScanStarted { job_id: ScanJobId, library_id: LibraryId },
    #[cfg_attr(feature = "serde", serde(rename = "scan.progress"))]
    ScanProgress {
        job_id: ScanJobId,
        files_processed: u64,
        files_found: u64,
    },
    #[cfg_attr(feature = "serde", serde(rename = "scan.paused"))]
    ScanPaused { job_id: ScanJobId },
    #[cfg_attr(feature = "serde", serde(rename = "scan.resumed"))]
    ScanResumed { job_id: ScanJobId },
    #[cfg_attr(feature = "serde", serde(rename = "scan.completed"))]
    ScanCompleted { job_id: ScanJobId, files_processed: u64 },
    #[cfg_attr(feature = "serde", serde(rename = "scan.failed"))]
    ScanFailed { job_id: ScanJobId, error: String },

    #[cfg_attr(feature = "serde", serde(rename = "media.file.found"))]
    MediaFileFound { file_id: MediaFileId, library_id: LibraryId },
    #[cfg_attr(feature = "serde", serde(rename = "media.metadata.enriched"))]
    MediaMetadataEnriched { file_id: MediaFileId },
    #[cfg_attr(feature = "serde", serde(rename = "media.file.deleted"))]
    MediaFileDeleted { file_id: MediaFileId },

    #[cfg_attr(feature = "serde", serde(rename = "transcode.requested"))]
    TranscodeRequested { session_id: SessionId, content_hash: String },
    #[cfg_attr(feature = "serde", serde(rename = "transcode.segment.ready"))]
    TranscodeSegmentReady { session_id: SessionId, segment_index: u32 },
    #[cfg_attr(feature = "serde", serde(rename = "transcode.completed"))]
    TranscodeCompleted { session_id: SessionId },
    #[cfg_attr(feature = "serde", serde(rename = "transcode.failed"))]
    TranscodeFailed { session_id: SessionId, error: String },

    #[cfg_attr(feature = "serde", serde(rename = "library.created"))]
    LibraryCreated { library_id: LibraryId },
    #[cfg_attr(feature = "serde", serde(rename = "library.deleted"))]
    LibraryDeleted { library_id: LibraryId },
}

impl Event {
    pub fn new(source: &'static str, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            source,
            timestamp: Utc::now(),
            kind,
        }
    }
}
