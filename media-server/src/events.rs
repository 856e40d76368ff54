//! Default [`EventPublisher`] for the CLI composition root: structured
//! logging, no external transport. A deployment that wants the event bus
//! wired to a message queue or webhook fan-out supplies its own
//! implementation at this same seam.

use async_trait::async_trait;
use media_contracts::EventPublisher;
use media_model::{Event, EventKind};
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: Event) {
        match &event.kind {
            EventKind::ScanStarted { job_id, library_id } => {
                info!(target: "media_server::events", %job_id, %library_id, "scan.started");
            }
            EventKind::ScanProgress { job_id, files_processed, files_found } => {
                info!(target: "media_server::events", %job_id, files_processed, files_found, "scan.progress");
            }
            EventKind::ScanPaused { job_id } => {
                info!(target: "media_server::events", %job_id, "scan.paused");
            }
            EventKind::ScanResumed { job_id } => {
                info!(target: "media_server::events", %job_id, "scan.resumed");
            }
            EventKind::ScanCompleted { job_id, files_processed } => {
                info!(target: "media_server::events", %job_id, files_processed, "scan.completed");
            }
            EventKind::ScanFailed { job_id, error } => {
                info!(target: "media_server::events", %job_id, error, "scan.failed");
            }
            EventKind::MediaFileFound { file_id, library_id } => {
                info!(target: "media_server::events", %file_id, %library_id, "media.file.found");
            }
            EventKind::MediaMetadataEnriched { file_id } => {
                info!(target: "media_server::events", %file_id, "media.metadata.enriched");
            }
            EventKind::MediaFileDeleted { file_id } => {
                info!(target: "media_server::events", %file_id, "media.file.deleted");
            }
            EventKind::TranscodeRequested { session_id, content_hash } => {
                info!(target: "media_server::events", %session_id, content_hash, "transcode.requested");
            }
            EventKind::TranscodeSegmentReady { session_id, segment_index } => {
                info!(target: "media_server::events", %session_id, segment_index, "transcode.segment.ready");
            }
            EventKind::TranscodeCompleted { session_id } => {
                info!(target: "media_server::events", %session_id, "transcode.completed");
            }
            EventKind::TranscodeFailed { session_id, error } => {
                info!(target: "media_server::events", %session_id, error, "transcode.failed");
            }
            EventKind::LibraryCreated { library_id } => {
                info!(target: "media_server::events", %library_id, "library.created");
            }
            EventKind::LibraryDeleted { library_id } => {
                info!(target: "media_server::events", %library_id, "library.deleted");
            }
        }
    }
}
