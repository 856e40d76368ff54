//! In-memory `Repository` implementation. Used by every in-process test in
//! this crate and available to `media-server` as the persistence option for
//! deployments with no database dialect in scope.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use media_contracts::{
    CoreError, DeviceProfileRepository, InteractionRepository, LibraryRepository,
    MediaFileFilter, MediaFilesReadPort, MediaFilesWritePort, Page, Result, ScanJobRepository,
    TranscodeSessionRepository, UpsertOutcome,
};
use media_model::{
    DeviceProfile, Interaction, LibraryId, LibraryKind, LibraryStats, MediaFile, MediaFileId,
    MediaLibrary, ScanCheckpoint, ScanJob, ScanJobId, ScanStatus, SessionId, TranscodeSession,
    TranscodeStatus,
};

#[derive(Default)]
struct State {
    libraries: HashMap<LibraryId, MediaLibrary>,
    scan_jobs: HashMap<ScanJobId, ScanJob>,
    media_files: HashMap<MediaFileId, MediaFile>,
    sessions: HashMap<SessionId, TranscodeSession>,
    interactions: Vec<Interaction>,
    device_profiles: HashMap<String, DeviceProfile>,
}

/// A single process-local store backing all six repository ports. Not
/// durable across restarts; every method takes an uncontended lock, which is
/// fine at the scale this implementation targets (tests, single-node
/// deployments with no external database configured).
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("in-memory repository mutex poisoned")
    }
}

#[async_trait]
impl LibraryRepository for InMemoryRepository {
    async fn create(&self, library: MediaLibrary) -> Result<()> {
        let mut state = self.state();
        if state.libraries.contains_key(&library.id) {
            return Err(CoreError::AlreadyExists(format!("library {}", library.id)));
        }
        state.libraries.insert(library.id, library);
        Ok(())
    }

    async fn get(&self, id: LibraryId) -> Result<Option<MediaLibrary>> {
        Ok(self.state().libraries.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<MediaLibrary>> {
        Ok(self.state().libraries.values().cloned().collect())
    }

    async fn list_by_kind(&self, kind: LibraryKind) -> Result<Vec<MediaLibrary>> {
        Ok(self
            .state()
            .libraries
            .values()
            .filter(|l| l.kind == kind)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: LibraryId) -> Result<()> {
        let mut state = self.state();
        state.libraries.remove(&id);
        state.media_files.retain(|_, f| f.library_id != id);
        state
            .scan_jobs
            .retain(|_, j| !(j.library_id == id && !j.status.is_terminal()));
        Ok(())
    }

    async fn stats(&self, id: LibraryId) -> Result<LibraryStats> {
        let state = self.state();
        let (total_files, total_bytes) = state
            .media_files
            .values()
            .filter(|f| f.library_id == id)
            .fold((0u64, 0u64), |(count, bytes), f| (count + 1, bytes + f.size));

        let last_job = state
            .scan_jobs
            .values()
            .filter(|j| j.library_id == id && j.started_at.is_some())
            .max_by_key(|j| j.started_at);

        let (last_scan_duration_secs, last_scan_completed) = match last_job {
            Some(job) => {
                let duration = match (job.started_at, job.completed_at) {
                    (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
                    _ => None,
                };
                (duration, job.status == ScanStatus::Completed)
            }
            None => (None, false),
        };

        Ok(LibraryStats {
            total_files,
            total_bytes,
            last_scan_duration_secs,
            last_scan_completed,
        })
    }
}

#[async_trait]
impl MediaFilesReadPort for InMemoryRepository {
    async fn get_by_id(&self, id: MediaFileId) -> Result<Option<MediaFile>> {
        Ok(self.state().media_files.get(&id).cloned())
    }

    async fn get_by_path(&self, library_id: LibraryId, path: &str) -> Result<Option<MediaFile>> {
        Ok(self
            .state()
            .media_files
            .values()
            .find(|f| f.library_id == library_id && f.path.to_string_lossy() == path)
            .cloned())
    }

    async fn list(&self, filter: MediaFileFilter, page: Page) -> Result<Vec<MediaFile>> {
        let state = self.state();
        let mut matching: Vec<MediaFile> = state
            .media_files
            .values()
            .filter(|f| {
                filter.library_id.map(|id| id == f.library_id).unwrap_or(true)
                    && filter
                        .path_prefix
                        .as_ref()
                        .map(|prefix| f.path.to_string_lossy().starts_with(prefix.as_str()))
                        .unwrap_or(true)
                    && filter
                        .last_seen_before
                        .map(|before| f.last_seen < before)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }
}

#[async_trait]
impl MediaFilesWritePort for InMemoryRepository {
    async fn upsert(&self, mut file: MediaFile) -> Result<UpsertOutcome> {
        let mut state = self.state();
        let existing_id = state
            .media_files
            .values()
            .find(|f| f.library_id == file.library_id && f.path == file.path)
            .map(|f| f.id);

        match existing_id {
            Some(id) => {
                file.id = id;
                state.media_files.insert(id, file);
                Ok(UpsertOutcome { id, created: false })
            }
            None => {
                let id = file.id;
                state.media_files.insert(id, file);
                Ok(UpsertOutcome { id, created: true })
            }
        }
    }

    async fn delete_by_id(&self, id: MediaFileId) -> Result<()> {
        self.state().media_files.remove(&id);
        Ok(())
    }

    async fn delete_stale(&self, library_id: LibraryId, threshold: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let stale: Vec<MediaFileId> = state
            .media_files
            .values()
            .filter(|f| f.library_id == library_id && f.last_seen < threshold)
            .map(|f| f.id)
            .collect();
        let count = stale.len() as u64;
        for id in stale {
            state.media_files.remove(&id);
        }
        Ok(count)
    }
}

#[async_trait]
impl ScanJobRepository for InMemoryRepository {
    async fn create(&self, job: ScanJob) -> Result<()> {
        let mut state = self.state();
        if state.scan_jobs.contains_key(&job.id) {
            return Err(CoreError::AlreadyExists(format!("scan job {}", job.id)));
        }
        state.scan_jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: ScanJobId) -> Result<Option<ScanJob>> {
        Ok(self.state().scan_jobs.get(&id).cloned())
    }

    async fn get_active_for_library(&self, library_id: LibraryId) -> Result<Option<ScanJob>> {
        Ok(self
            .state()
            .scan_jobs
            .values()
            .find(|j| j.library_id == library_id && j.status.is_active())
            .cloned())
    }

    async fn list(&self) -> Result<Vec<ScanJob>> {
        Ok(self.state().scan_jobs.values().cloned().collect())
    }

    async fn update_status(&self, id: ScanJobId, status: ScanStatus) -> Result<()> {
        let mut state = self.state();
        let job = state
            .scan_jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("scan job {id}")))?;
        if status == ScanStatus::Running && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        job.status = status;
        Ok(())
    }

    async fn update_progress(
        &self,
        id: ScanJobId,
        files_found: u64,
        files_processed: u64,
        files_skipped: u64,
        bytes_processed: u64,
    ) -> Result<()> {
        let mut state = self.state();
        let job = state
            .scan_jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("scan job {id}")))?;
        job.files_found = files_found;
        job.files_processed = files_processed;
        job.files_skipped = files_skipped;
        job.bytes_processed = bytes_processed;
        Ok(())
    }

    async fn set_checkpoint(&self, id: ScanJobId, checkpoint: ScanCheckpoint) -> Result<()> {
        let mut state = self.state();
        let job = state
            .scan_jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("scan job {id}")))?;
        job.checkpoint = checkpoint;
        Ok(())
    }

    async fn fail(&self, id: ScanJobId, error_message: String) -> Result<()> {
        let mut state = self.state();
        let job = state
            .scan_jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("scan job {id}")))?;
        job.status = ScanStatus::Failed;
        job.error_message = Some(error_message);
        job.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl TranscodeSessionRepository for InMemoryRepository {
    async fn create(&self, session: TranscodeSession) -> Result<()> {
        let mut state = self.state();
        if state.sessions.contains_key(&session.id) {
            return Err(CoreError::AlreadyExists(format!("session {}", session.id)));
        }
        state.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<TranscodeSession>> {
        Ok(self.state().sessions.get(&id).cloned())
    }

    async fn get_active_by_content_hash(&self, content_hash: &str) -> Result<Option<TranscodeSession>> {
        Ok(self
            .state()
            .sessions
            .values()
            .find(|s| s.content_hash == content_hash && !s.status.is_terminal())
            .cloned())
    }

    async fn list_by_status(&self, status: TranscodeStatus) -> Result<Vec<TranscodeSession>> {
        Ok(self
            .state()
            .sessions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: SessionId, status: TranscodeStatus) -> Result<()> {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("session {id}")))?;
        if status.is_terminal() {
            session.end_time = Some(Utc::now());
        }
        session.status = status;
        Ok(())
    }

    async fn touch_last_accessed(&self, id: SessionId) -> Result<()> {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("session {id}")))?;
        session.last_accessed = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: SessionId) -> Result<()> {
        self.state().sessions.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl InteractionRepository for InMemoryRepository {
    async fn record(&self, interaction: Interaction) -> Result<()> {
        self.state().interactions.push(interaction);
        Ok(())
    }
}

#[async_trait]
impl DeviceProfileRepository for InMemoryRepository {
    async fn get(&self, name: &str) -> Result<Option<DeviceProfile>> {
        Ok(self.state().device_profiles.get(name).cloned())
    }

    async fn upsert(&self, profile: DeviceProfile) -> Result<()> {
        self.state().device_profiles.insert(profile.name.clone(), profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deleting_library_cascades_to_files_and_active_jobs() {
        let repo = InMemoryRepository::new();
        let dir = tempfile::tempdir().unwrap();
        let library = MediaLibrary::new(dir.path().to_path_buf(), LibraryKind::Movie).unwrap();
        repo.create(library.clone()).await.unwrap();

        let file = MediaFile::discovered(library.id, dir.path().join("a.mkv"), 100);
        repo.upsert(file).await.unwrap();

        let mut job = ScanJob::new(library.id);
        job.status = ScanStatus::Running;
        repo.create(job.clone()).await.unwrap();

        repo.delete(library.id).await.unwrap();

        assert!(repo.get(library.id).await.unwrap().is_none());
        assert!(repo
            .list(MediaFileFilter::default(), Page::default())
            .await
            .unwrap()
            .is_empty());
        assert!(repo.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_matches_existing_file_by_library_and_path() {
        let repo = InMemoryRepository::new();
        let library_id = LibraryId::new();
        let path = std::path::PathBuf::from("/lib/movie.mkv");

        let first = MediaFile::discovered(library_id, path.clone(), 100);
        let outcome1 = repo.upsert(first).await.unwrap();
        assert!(outcome1.created);

        let mut second = MediaFile::discovered(library_id, path, 200);
        second.id = MediaFileId::new();
        let outcome2 = repo.upsert(second).await.unwrap();
        assert!(!outcome2.created);
        assert_eq!(outcome1.id, outcome2.id);
    }

    #[tokio::test]
    async fn delete_stale_only_removes_files_before_threshold() {
        let repo = InMemoryRepository::new();
        let library_id = LibraryId::new();
        let mut fresh = MediaFile::discovered(library_id, std::path::PathBuf::from("/a"), 1);
        let mut stale = MediaFile::discovered(library_id, std::path::PathBuf::from("/b"), 1);
        stale.last_seen = Utc::now() - chrono::Duration::hours(2);
        fresh.last_seen = Utc::now();
        repo.upsert(fresh).await.unwrap();
        repo.upsert(stale).await.unwrap();

        let removed = repo
            .delete_stale(library_id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
