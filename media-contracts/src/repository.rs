use async_trait::async_trait;
use chrono::{DateTime, Utc};

use media_model::{
    DeviceProfile, Interaction, LibraryId, LibraryKind, LibraryStats, MediaFile, MediaFileId,
    MediaLibrary, ScanCheckpoint, ScanJob, ScanJobId, ScanStatus, SessionId, TranscodeSession,
    TranscodeStatus,
};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Filter for [`MediaFilesReadPort::list`]. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct MediaFileFilter {
    pub library_id: Option<LibraryId>,
    pub path_prefix: Option<String>,
    pub last_seen_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub id: MediaFileId,
    pub created: bool,
}

/// Persistence for libraries. Deletion cascades to media files and any
/// non-terminal scan job, mirroring the data model's ownership rules.
#[async_trait]
pub trait LibraryRepository: Send + Sync {
    async fn create(&self, library: MediaLibrary) -> Result<()>;
    async fn get(&self, id: LibraryId) -> Result<Option<MediaLibrary>>;
    async fn list(&self) -> Result<Vec<MediaLibrary>>;
    async fn list_by_kind(&self, kind: LibraryKind) -> Result<Vec<MediaLibrary>>;
    async fn delete(&self, id: LibraryId) -> Result<()>;
    async fn stats(&self, id: LibraryId) -> Result<LibraryStats>;
}

#[async_trait]
pub trait MediaFilesReadPort: Send + Sync {
    async fn get_by_id(&self, id: MediaFileId) -> Result<Option<MediaFile>>;
    async fn get_by_path(&self, library_id: LibraryId, path: &str) -> Result<Option<MediaFile>>;
    async fn list(&self, filter: MediaFileFilter, page: Page) -> Result<Vec<MediaFile>>;
}

#[async_trait]
pub trait MediaFilesWritePort: Send + Sync {
    async fn upsert(&self, file: MediaFile) -> Result<UpsertOutcome>;
    async fn delete_by_id(&self, id: MediaFileId) -> Result<()>;
    /// Removes files in `library_id` whose `last_seen` predates `threshold`,
    /// implementing the re-scan eviction policy (see `media-core`'s scan
    /// engine for the consecutive-absence bookkeeping built on top of this).
    async fn delete_stale(&self, library_id: LibraryId, threshold: DateTime<Utc>) -> Result<u64>;
}

/// Persistence for scan jobs. The Scan Engine is the sole writer; this trait
/// exists so the engine's state-machine logic can be tested against an
/// in-memory implementation without a database.
#[async_trait]
pub trait ScanJobRepository: Send + Sync {
    async fn create(&self, job: ScanJob) -> Result<()>;
    async fn get(&self, id: ScanJobId) -> Result<Option<ScanJob>>;
    async fn get_active_for_library(&self, library_id: LibraryId) -> Result<Option<ScanJob>>;
    async fn list(&self) -> Result<Vec<ScanJob>>;
    async fn update_status(&self, id: ScanJobId, status: ScanStatus) -> Result<()>;
    async fn update_progress(
        &self,
        id: ScanJobId,
        files_found: u64,
        files_processed: u64,
        files_skipped: u64,
        bytes_processed: u64,
    ) -> Result<()>;
    async fn set_checkpoint(&self, id: ScanJobId, checkpoint: ScanCheckpoint) -> Result<()>;
    async fn fail(&self, id: ScanJobId, error_message: String) -> Result<()>;
}

/// Persistence for transcode sessions. The Session Store is the sole
/// writer.
#[async_trait]
pub trait TranscodeSessionRepository: Send + Sync {
    async fn create(&self, session: TranscodeSession) -> Result<()>;
    async fn get(&self, id: SessionId) -> Result<Option<TranscodeSession>>;
    async fn get_active_by_content_hash(&self, content_hash: &str) -> Result<Option<TranscodeSession>>;
    async fn list_by_status(&self, status: TranscodeStatus) -> Result<Vec<TranscodeSession>>;
    async fn update_status(&self, id: SessionId, status: TranscodeStatus) -> Result<()>;
    async fn touch_last_accessed(&self, id: SessionId) -> Result<()>;
    async fn delete(&self, id: SessionId) -> Result<()>;
}

#[async_trait]
pub trait InteractionRepository: Send + Sync {
    async fn record(&self, interaction: Interaction) -> Result<()>;
}

#[async_trait]
pub trait DeviceProfileRepository: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<DeviceProfile>>;
    async fn upsert(&self, profile: DeviceProfile) -> Result<()>;
}

/// The full repository surface a `media-core` instance depends on. A single
/// type implementing all of these (in-memory, or backed by a real store) is
/// threaded through the Scan Engine, Session Store and Cleanup Service.
pub trait Repository:
    LibraryRepository
    + MediaFilesReadPort
    + MediaFilesWritePort
    + ScanJobRepository
    + TranscodeSessionRepository
    + InteractionRepository
    + DeviceProfileRepository
{
}

impl<T> Repository for T where
    T: LibraryRepository
        + MediaFilesReadPort
        + MediaFilesWritePort
        + ScanJobRepository
        + TranscodeSessionRepository
        + InteractionRepository
        + DeviceProfileRepository
{
}
