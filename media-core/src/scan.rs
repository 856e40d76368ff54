//! Scan Engine: owns the `ScanJob` state machine, drives the File Walker
//! into a throttled worker pool, and persists progress through the
//! Repository Port.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use media_config::ScanConfig;
use media_contracts::{CoreError, EventPublisher, Repository, Result};
use media_model::{
    Event, EventKind, LibraryId, LibraryStats, MediaFile, MediaLibrary, ScanCheckpoint, ScanJob,
    ScanJobId, ScanStatus,
};

use crate::enrich::EnricherPool;
use crate::throttle::AdaptiveThrottle;
use crate::walker::{FileEntry, WalkFilter, Walker};

const COUNTER_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const PROGRESS_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Paused,
    Stopped,
}

struct RunHandle {
    library_id: LibraryId,
    cancel: CancellationToken,
    stop_reason: Mutex<Option<StopReason>>,
    quiesced: Arc<Notify>,
    files_processed: Arc<AtomicU64>,
    files_found: Arc<AtomicU64>,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

/// Point-in-time view of a job's progress, including derived throughput and
/// ETA, not persisted directly on the `ScanJob` row.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub job: ScanJob,
    pub files_per_second: f64,
    pub eta_seconds: Option<f64>,
}

/// Drives the library scan pipeline: walker → per-file processing → upsert
/// + events, resizing its worker pool against the [`AdaptiveThrottle`]'s
/// budget on every tick.
pub struct ScanEngine {
    repo: Arc<dyn Repository>,
    events: Arc<dyn EventPublisher>,
    enricher: Arc<EnricherPool>,
    throttle: Arc<AdaptiveThrottle>,
    config: ScanConfig,
    runs: DashMap<ScanJobId, Arc<RunHandle>>,
}

impl ScanEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<dyn EventPublisher>,
        enricher: Arc<EnricherPool>,
        throttle: Arc<AdaptiveThrottle>,
        config: ScanConfig,
    ) -> Self {
        Self {
            repo,
            events,
            enricher,
            throttle,
            config,
            runs: DashMap::new(),
        }
    }

    /// Start a scan for `library_id`. Rejected with `AlreadyActive` if a
    /// non-terminal job already exists for the library.
    #[instrument(skip(self))]
    pub async fn start(&self, library_id: LibraryId) -> Result<ScanJob> {
        if self.repo.get_active_for_library(library_id).await?.is_some() {
            return Err(CoreError::AlreadyActive(format!(
                "library {library_id} already has an active scan"
            )));
        }
        let library = self
            .repo
            .get(library_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("library {library_id}")))?;

        let mut job = ScanJob::new(library_id);
        job.status = ScanStatus::Running;
        job.started_at = Some(chrono::Utc::now());
        self.repo.create(job.clone()).await?;

        let previous_started_at = self.previous_completed_started_at(library_id, job.id).await?;
        self.spawn_pass(job.id, library, None, previous_started_at);

        self.events
            .publish(Event::new("media-core", EventKind::ScanStarted {
                job_id: job.id,
                library_id,
            }))
            .await;

        Ok(job)
    }

    async fn previous_completed_started_at(
        &self,
        library_id: LibraryId,
        excluding: ScanJobId,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let mut completed: Vec<ScanJob> = self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|j| j.library_id == library_id && j.id != excluding && j.status == ScanStatus::Completed)
            .collect();
        completed.sort_by_key(|j| j.started_at);
        Ok(completed.last().and_then(|j| j.started_at))
    }

    /// Pause a running job: workers drain in-flight items, a checkpoint is
    /// persisted, and the pass stops. `resume` restarts a fresh pass from
    /// that checkpoint.
    pub async fn pause(&self, job_id: ScanJobId) -> Result<()> {
        self.stop_pass(job_id, StopReason::Paused).await
    }

    /// Stop a job permanently; no resume is possible afterwards.
    pub async fn stop(&self, job_id: ScanJobId) -> Result<()> {
        self.stop_pass(job_id, StopReason::Stopped).await
    }

    async fn stop_pass(&self, job_id: ScanJobId, reason: StopReason) -> Result<()> {
        let handle = self
            .runs
            .get(&job_id)
            .map(|r| r.clone())
            .ok_or_else(|| CoreError::PreconditionFailed(format!("job {job_id} is not active")))?;

        *handle.stop_reason.lock().expect("run handle mutex poisoned") = Some(reason);
        handle.cancel.cancel();

        match tokio::time::timeout(Duration::from_secs(10), handle.quiesced.notified()).await {
            Ok(()) => {}
            Err(_) => warn!(job_id = %job_id, "pause/stop did not quiesce within 10s, forcing checkpoint"),
        }
        Ok(())
    }

    /// Resume a paused job from its persisted checkpoint.
    pub async fn resume(&self, job_id: ScanJobId) -> Result<()> {
        let job = self
            .repo
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("scan job {job_id}")))?;
        if job.status != ScanStatus::Paused {
            return Err(CoreError::PreconditionFailed(format!(
                "job {job_id} is not paused (status: {:?})",
                job.status
            )));
        }
        let library = self
            .repo
            .get(job.library_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("library {}", job.library_id)))?;

        self.repo.update_status(job_id, ScanStatus::Running).await?;
        let previous_started_at = self.previous_completed_started_at(job.library_id, job_id).await?;
        self.spawn_pass(job_id, library, job.checkpoint.cursor.clone(), previous_started_at);

        self.events
            .publish(Event::new("media-core", EventKind::ScanResumed { job_id }))
            .await;
        Ok(())
    }

    /// Force-stop every active job for `library_id` and wait (bounded) for
    /// acknowledgement. Used by library deletion.
    pub async fn terminate_for_library(&self, library_id: LibraryId) -> Result<()> {
        let job_ids: Vec<ScanJobId> = self
            .runs
            .iter()
            .filter(|e| e.value().library_id == library_id)
            .map(|e| *e.key())
            .collect();

        for job_id in job_ids {
            if let Some(handle) = self.runs.get(&job_id).map(|r| r.clone()) {
                *handle.stop_reason.lock().expect("run handle mutex poisoned") = Some(StopReason::Stopped);
                handle.cancel.cancel();
                let _ = tokio::time::timeout(Duration::from_secs(30), handle.quiesced.notified()).await;
            }
        }
        Ok(())
    }

    pub async fn progress(&self, job_id: ScanJobId) -> Result<ProgressSnapshot> {
        let job = self
            .repo
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("scan job {job_id}")))?;

        let (files_per_second, eta_seconds) = match self.runs.get(&job_id) {
            Some(handle) => {
                let samples = handle.samples.lock().expect("run handle mutex poisoned");
                Self::throughput(&samples, job.files_found, job.files_processed)
            }
            None => (0.0, None),
        };

        Ok(ProgressSnapshot {
            job,
            files_per_second,
            eta_seconds,
        })
    }

    fn throughput(
        samples: &VecDeque<(Instant, u64)>,
        files_found: u64,
        files_processed: u64,
    ) -> (f64, Option<f64>) {
        let Some((oldest_t, oldest_c)) = samples.front().copied() else {
            return (0.0, None);
        };
        let Some((newest_t, newest_c)) = samples.back().copied() else {
            return (0.0, None);
        };
        let elapsed = newest_t.duration_since(oldest_t).as_secs_f64();
        if elapsed <= 0.0 || newest_c <= oldest_c {
            return (0.0, None);
        }
        let rate = (newest_c - oldest_c) as f64 / elapsed;
        let remaining = files_found.saturating_sub(files_processed) as f64;
        let eta = if rate > 0.0 { Some(remaining / rate) } else { None };
        (rate, eta)
    }

    pub async fn list(&self) -> Result<Vec<ScanJob>> {
        self.repo.list().await
    }

    pub async fn stats(&self, library_id: LibraryId) -> Result<LibraryStats> {
        self.repo.stats(library_id).await
    }

    fn spawn_pass(
        &self,
        job_id: ScanJobId,
        library: MediaLibrary,
        resume_after: Option<String>,
        previous_started_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        let handle = Arc::new(RunHandle {
            library_id: library.id,
            cancel: CancellationToken::new(),
            stop_reason: Mutex::new(None),
            quiesced: Arc::new(Notify::new()),
            files_processed: Arc::new(AtomicU64::new(0)),
            files_found: Arc::new(AtomicU64::new(0)),
            samples: Mutex::new(VecDeque::new()),
        });
        self.runs.insert(job_id, handle.clone());

        let library_id = library.id;
        let repo = self.repo.clone();
        let events = self.events.clone();
        let enricher = self.enricher.clone();
        let throttle = self.throttle.clone();
        let config = self.config.clone();
        let runs = self.runs.clone();

        tokio::spawn(async move {
            let outcome = run_pass(
                job_id,
                library,
                resume_after,
                repo.clone(),
                events.clone(),
                enricher,
                throttle,
                config,
                handle.clone(),
            )
            .await;

            let stop_reason = *handle.stop_reason.lock().expect("run handle mutex poisoned");
            match (outcome, stop_reason) {
                (Ok(()), Some(StopReason::Paused)) => {
                    let _ = repo.update_status(job_id, ScanStatus::Paused).await;
                    events
                        .publish(Event::new("media-core", EventKind::ScanPaused { job_id }))
                        .await;
                }
                (Ok(()), Some(StopReason::Stopped)) => {
                    let _ = repo.update_status(job_id, ScanStatus::Cancelled).await;
                }
                (Ok(()), None) => {
                    let _ = repo.update_status(job_id, ScanStatus::Completed).await;
                    if let Some(threshold) = previous_started_at {
                        match repo.delete_stale(library_id, threshold).await {
                            Ok(removed) if removed > 0 => {
                                info!(library_id = %library_id, removed, "evicted files absent across two scans");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(library_id = %library_id, error = %err, "stale eviction failed"),
                        }
                    }
                    let processed = handle.files_processed.load(Ordering::SeqCst);
                    events
                        .publish(Event::new("media-core", EventKind::ScanCompleted {
                            job_id,
                            files_processed: processed,
                        }))
                        .await;
                }
                (Err(err), _) => {
                    warn!(job_id = %job_id, error = %err, "scan pass failed fatally");
                    let _ = repo.fail(job_id, err.to_string()).await;
                    events
                        .publish(Event::new("media-core", EventKind::ScanFailed {
                            job_id,
                            error: err.to_string(),
                        }))
                        .await;
                }
            }

            runs.remove(&job_id);
            handle.quiesced.notify_waiters();
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pass(
    job_id: ScanJobId,
    library: MediaLibrary,
    resume_after: Option<String>,
    repo: Arc<dyn Repository>,
    events: Arc<dyn EventPublisher>,
    enricher: Arc<EnricherPool>,
    throttle: Arc<AdaptiveThrottle>,
    config: ScanConfig,
    handle: Arc<RunHandle>,
) -> Result<()> {
    let mut filter = WalkFilter::for_library_kind(library.kind);
    filter.resume_after = resume_after;

    let walker_cancel = handle.cancel.clone();
    let stream = Walker::walk(
        library.root_path.clone(),
        filter,
        walker_cancel,
        handle.files_found.clone(),
    );
    let receiver = Arc::new(tokio::sync::Mutex::new(stream));

    let files_skipped = Arc::new(AtomicU64::new(0));
    let bytes_processed = Arc::new(AtomicU64::new(0));

    let worker_count = config.worker_count_max.max(1);
    // One cursor slot per worker; each worker only writes its own slot, so
    // the flushed checkpoint (the min across slots) can never be advanced
    // past a path a still-in-flight worker has not yet finished.
    let last_cursor_by_worker: Arc<Vec<Mutex<Option<String>>>> =
        Arc::new((0..worker_count).map(|_| Mutex::new(None)).collect());
    let mut workers = Vec::with_capacity(worker_count);

    for index in 0..worker_count {
        let receiver = receiver.clone();
        let repo = repo.clone();
        let events = events.clone();
        let enricher = enricher.clone();
        let throttle = throttle.clone();
        let cancel = handle.cancel.clone();
        let files_processed = handle.files_processed.clone();
        let files_skipped = files_skipped.clone();
        let bytes_processed = bytes_processed.clone();
        let last_cursor_by_worker = last_cursor_by_worker.clone();
        let library_id = library.id;

        workers.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let budget = throttle.sample();
                if budget.emergency_brake {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                if index >= budget.workers {
                    tokio::time::sleep(Duration::from_millis(budget.delay_ms.max(50))).await;
                    continue;
                }

                use futures::StreamExt;
                let entry = {
                    let mut rx = receiver.lock().await;
                    rx.next().await
                };
                let Some(entry) = entry else { return };

                match process_entry(&repo, &events, &enricher, library_id, &entry).await {
                    Ok(()) => {
                        files_processed.fetch_add(1, Ordering::SeqCst);
                        bytes_processed.fetch_add(entry.size, Ordering::SeqCst);
                    }
                    Err(err) => {
                        warn!(path = %entry.path.display(), error = %err, "skipping file after processing error");
                        files_skipped.fetch_add(1, Ordering::SeqCst);
                    }
                }

                let mut slot = last_cursor_by_worker[index]
                    .lock()
                    .expect("cursor mutex poisoned");
                *slot = Some(entry.path.to_string_lossy().to_string());
                drop(slot);

                if budget.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(budget.delay_ms)).await;
                }
            }
        }));
    }

    let flush_handle = handle.clone();
    let flush_repo = repo.clone();
    let flush_skipped = files_skipped.clone();
    let flush_bytes = bytes_processed.clone();
    let flush_cursors = last_cursor_by_worker.clone();
    let flush_cancel = handle.cancel.clone();
    let flusher = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = flush_cancel.cancelled() => break,
                _ = tokio::time::sleep(COUNTER_FLUSH_INTERVAL) => {}
            }
            flush_counters(&flush_repo, job_id, &flush_handle, &flush_skipped, &flush_bytes, &flush_cursors).await;
        }
    });

    for worker in workers {
        let _ = worker.await;
    }
    flush_cancel.cancel();
    let _ = flusher.await;

    flush_counters(&repo, job_id, &handle, &files_skipped, &bytes_processed, &last_cursor_by_worker).await;
    Ok(())
}

/// The safe resume cursor is the minimum last-processed path across
/// workers that have completed at least one item. A worker that has not
/// yet finished anything contributes no bound — it cannot have raced
/// ahead of the others, since the shared stream only ever hands out
/// entries in increasing sorted order.
fn min_cursor(last_cursor_by_worker: &[Mutex<Option<String>>]) -> Option<String> {
    last_cursor_by_worker
        .iter()
        .filter_map(|slot| slot.lock().expect("cursor mutex poisoned").clone())
        .min()
}

async fn flush_counters(
    repo: &Arc<dyn Repository>,
    job_id: ScanJobId,
    handle: &RunHandle,
    files_skipped: &AtomicU64,
    bytes_processed: &AtomicU64,
    last_cursor_by_worker: &[Mutex<Option<String>>],
) {
    let processed = handle.files_processed.load(Ordering::SeqCst);
    let found = handle.files_found.load(Ordering::SeqCst).max(processed);
    let skipped = files_skipped.load(Ordering::SeqCst);
    let bytes = bytes_processed.load(Ordering::SeqCst);

    if let Err(err) = repo.update_progress(job_id, found, processed, skipped, bytes).await {
        warn!(job_id = %job_id, error = %err, "failed to flush scan progress");
        return;
    }

    let cursor = min_cursor(last_cursor_by_worker);
    if cursor.is_some() {
        let _ = repo.set_checkpoint(job_id, ScanCheckpoint { cursor }).await;
    }

    let mut samples = handle.samples.lock().expect("run handle mutex poisoned");
    samples.push_back((Instant::now(), processed));
    while let Some((t, _)) = samples.front() {
        if t.elapsed() > PROGRESS_WINDOW {
            samples.pop_front();
        } else {
            break;
        }
    }
}

async fn process_entry(
    repo: &Arc<dyn Repository>,
    events: &Arc<dyn EventPublisher>,
    enricher: &Arc<EnricherPool>,
    library_id: LibraryId,
    entry: &FileEntry,
) -> Result<()> {
    let path_str = entry.path.to_string_lossy().to_string();
    let existing = repo.get_by_path(library_id, &path_str).await?;

    if let Some(mut file) = existing {
        if file.size == entry.size {
            file.touch();
            repo.upsert(file).await?;
            return Ok(());
        }
    }

    let hash = hash_file(&entry.path).await?;
    let probe = enricher.probe(&entry.path).await;

    let mut file = MediaFile::discovered(library_id, entry.path.clone(), entry.size);
    file.content_hash = Some(hash);
    file.media_type = probe.media_type;
    file.container = probe.container;
    file.streams = probe.streams;

    let outcome = repo.upsert(file.clone()).await?;
    if outcome.created {
        events
            .publish(Event::new("media-core", EventKind::MediaFileFound {
                file_id: outcome.id,
                library_id,
            }))
            .await;
    }
    events
        .publish(Event::new("media-core", EventKind::MediaMetadataEnriched {
            file_id: outcome.id,
        }))
        .await;

    Ok(())
}

async fn hash_file(path: &std::path::Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(CoreError::from)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(CoreError::from)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRepository;
    use media_config::ThrottleConfig;
    use media_contracts::{MediaFileFilter, NullEventPublisher, Page};
    use media_model::LibraryKind;
    use std::fs;

    fn engine(repo: Arc<dyn Repository>) -> ScanEngine {
        ScanEngine::new(
            repo,
            Arc::new(NullEventPublisher),
            Arc::new(EnricherPool::new(vec![], Duration::from_secs(60))),
            Arc::new(AdaptiveThrottle::new(ThrottleConfig::default(), 4, 64)),
            ScanConfig {
                parallel_enabled: true,
                worker_count_max: 2,
                batch_size_base: 8,
            },
        )
    }

    async fn wait_for_terminal(repo: &Arc<dyn Repository>, job_id: ScanJobId) -> ScanJob {
        for _ in 0..200 {
            if let Some(job) = repo.get(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("scan job {job_id} did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn starting_twice_is_already_active() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let dir = tempfile::tempdir().unwrap();
        let library = MediaLibrary::new(dir.path().to_path_buf(), LibraryKind::Movie).unwrap();
        repo.create(library.clone()).await.unwrap();

        let engine = engine(repo.clone());
        engine.start(library.id).await.unwrap();
        let err = engine.start(library.id).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyActive(_)));
    }

    #[tokio::test]
    async fn scan_processes_every_file_in_the_tree() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("movie{i}.mkv")), vec![0u8; 2048]).unwrap();
        }
        let library = MediaLibrary::new(dir.path().to_path_buf(), LibraryKind::Movie).unwrap();
        repo.create(library.clone()).await.unwrap();

        let engine = engine(repo.clone());
        let job = engine.start(library.id).await.unwrap();
        let finished = wait_for_terminal(&repo, job.id).await;

        assert_eq!(finished.status, ScanStatus::Completed);
        assert_eq!(finished.files_processed, 5);

        let files = repo
            .list(
                MediaFileFilter {
                    library_id: Some(library.id),
                    ..Default::default()
                },
                Page { limit: 100, offset: 0 },
            )
            .await
            .unwrap();
        assert_eq!(files.len(), 5);
    }

    #[test]
    fn throughput_is_zero_with_no_progress() {
        let samples = VecDeque::new();
        let (rate, eta) = ScanEngine::throughput(&samples, 10, 0);
        assert_eq!(rate, 0.0);
        assert_eq!(eta, None);
    }

    #[test]
    fn min_cursor_is_the_slowest_workers_progress_not_the_fastest() {
        let slots = vec![
            Mutex::new(Some("root/abc/z.mkv".to_string())),
            Mutex::new(Some("root/xyz.mkv".to_string())),
        ];
        // Worker 0 (still on an earlier path) bounds the safe cursor even
        // though worker 1 raced ahead and finished a later one.
        assert_eq!(min_cursor(&slots), Some("root/abc/z.mkv".to_string()));
    }

    #[test]
    fn min_cursor_ignores_workers_that_have_not_completed_anything() {
        let slots = vec![Mutex::new(None), Mutex::new(Some("root/a.mkv".to_string()))];
        assert_eq!(min_cursor(&slots), Some("root/a.mkv".to_string()));
    }

    #[test]
    fn min_cursor_is_none_when_nothing_has_completed() {
        let slots: Vec<Mutex<Option<String>>> = vec![Mutex::new(None), Mutex::new(None)];
        assert_eq!(min_cursor(&slots), None);
    }
}
