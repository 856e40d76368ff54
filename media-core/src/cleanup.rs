//! Cleanup Service: reclaims transcode session rows, their on-disk
//! directories and orphaned provider processes on two cadences, mirroring
//! the reference stack's `CacheManager`/`CacheCleaner` split between a pure
//! sweep and a background scheduler around it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use media_config::CleanupConfig;
use media_contracts::{CoreError, Repository, Result};
use media_model::{SessionId, TranscodeSession, TranscodeStatus};
use tracing::{info, instrument, warn};

use crate::registry::ProviderRegistry;

/// Tally of work performed by one sweep, returned so callers (and the spec's
/// idempotency property) can observe that a repeated run does nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions_deleted: u64,
    pub directories_removed: u64,
    pub processes_reaped: u64,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.sessions_deleted += other.sessions_deleted;
        self.directories_removed += other.directories_removed;
        self.processes_reaped += other.processes_reaped;
    }
}

/// A running session with no reported progress and no on-disk activity for
/// this long is considered stuck (dead provider process, or one that will
/// never finish) and is reaped by the normal sweep.
const STALL_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Sweeps expired `TranscodeSession`s, their directories, and orphaned
/// on-disk session directories with no matching repository row.
///
/// A session is "claimed" (via `claims`) before its row is deleted and
/// directory removed, so two sweeps racing on the same session never double
/// count or double-delete; the claim is released once the sweep that holds
/// it finishes, successful or not.
pub struct CleanupService {
    repo: Arc<dyn Repository>,
    registry: Arc<ProviderRegistry>,
    config: CleanupConfig,
    dir_root: PathBuf,
    claims: DashSet<SessionId>,
    signaled_pids: Arc<DashMap<i32, Instant>>,
}

impl CleanupService {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<ProviderRegistry>,
        config: CleanupConfig,
        dir_root: PathBuf,
    ) -> Self {
        Self {
            repo,
            registry,
            config,
            dir_root,
            claims: DashSet::new(),
            signaled_pids: Arc::new(DashMap::new()),
        }
    }

    /// Spawn the normal and deep cadence loops. Mirrors `CacheCleaner::start`:
    /// each loop just ticks an interval and logs sweep failures rather than
    /// propagating them, since a cleanup sweep is always retried next tick.
    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let normal = self.clone();
        let normal_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(normal.config.interval);
            loop {
                interval.tick().await;
                if let Err(err) = normal.run_normal().await {
                    warn!(error = %err, "normal cleanup sweep failed");
                }
            }
        });

        let deep = self;
        let deep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(deep.config.deep_interval);
            loop {
                interval.tick().await;
                if let Err(err) = deep.run_deep().await {
                    warn!(error = %err, "deep cleanup sweep failed");
                }
            }
        });

        (normal_handle, deep_handle)
    }

    /// Delete terminal sessions older than `session_max_age`, removing their
    /// directories. Failed sessions have their directory removed immediately
    /// regardless of age (see DESIGN.md's retention decision).
    #[instrument(skip(self))]
    pub async fn run_normal(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let now = Utc::now();

        for status in [
            TranscodeStatus::Completed,
            TranscodeStatus::Failed,
            TranscodeStatus::Cancelled,
        ] {
            for session in self.repo.list_by_status(status).await? {
                if !self.claims.insert(session.id) {
                    continue;
                }

                let age = now.signed_duration_since(session.last_accessed);
                let expired = age
                    .to_std()
                    .map(|d| d >= self.config.session_max_age)
                    .unwrap_or(true);
                let remove_dir_now = status == TranscodeStatus::Failed;

                if remove_dir_now && session.directory_path.exists() {
                    match tokio::fs::remove_dir_all(&session.directory_path).await {
                        Ok(()) => report.directories_removed += 1,
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => warn!(
                            session_id = %session.id,
                            error = %err,
                            "failed to remove failed session directory",
                        ),
                    }
                }

                if expired {
                    if session.directory_path.exists() {
                        match tokio::fs::remove_dir_all(&session.directory_path).await {
                            Ok(()) => report.directories_removed += 1,
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                            Err(err) => warn!(
                                session_id = %session.id,
                                error = %err,
                                "failed to remove expired session directory",
                            ),
                        }
                    }
                    self.repo.delete(session.id).await?;
                    report.sessions_deleted += 1;
                }

                self.claims.remove(&session.id);
            }
        }

        for session in self.repo.list_by_status(TranscodeStatus::Running).await? {
            if !self.claims.insert(session.id) {
                continue;
            }

            if self.is_stalled(&session, now).await {
                if session.directory_path.exists() {
                    match tokio::fs::remove_dir_all(&session.directory_path).await {
                        Ok(()) => report.directories_removed += 1,
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => warn!(
                            session_id = %session.id,
                            error = %err,
                            "failed to remove stalled session directory",
                        ),
                    }
                }
                self.repo.delete(session.id).await?;
                report.sessions_deleted += 1;
                warn!(
                    session_id = %session.id,
                    "reaped stalled transcode session with no progress for >= 10 minutes",
                );
            }

            self.claims.remove(&session.id);
        }

        report.processes_reaped = self.reap_orphaned_processes().await;

        info!(
            sessions_deleted = report.sessions_deleted,
            directories_removed = report.directories_removed,
            processes_reaped = report.processes_reaped,
            "normal cleanup sweep complete",
        );
        Ok(report)
    }

    /// Enforce the cache size cap (LRU by `last_accessed`) and remove
    /// directories under `dir_root` with no matching session row, if old
    /// enough to be safely considered orphaned rather than in-flight.
    #[instrument(skip(self))]
    pub async fn run_deep(&self) -> Result<CleanupReport> {
        let mut report = self.enforce_size_cap().await?;
        report.merge(self.sweep_orphan_directories().await?);
        info!(
            sessions_deleted = report.sessions_deleted,
            directories_removed = report.directories_removed,
            "deep cleanup sweep complete",
        );
        Ok(report)
    }

    /// A running session is stalled once both its last reported progress
    /// (`last_accessed`, bumped by the orchestrator on forward movement)
    /// and its directory's mtime predate [`STALL_THRESHOLD`]. Checking both
    /// avoids reaping a session whose provider is still writing segments
    /// but hasn't crossed a percent/segment boundary recently.
    async fn is_stalled(&self, session: &TranscodeSession, now: DateTime<Utc>) -> bool {
        let idle = now
            .signed_duration_since(session.last_accessed)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if idle < STALL_THRESHOLD {
            return false;
        }
        // A missing directory has no on-disk activity to point to, so it
        // can't excuse a stalled session; treat it as maximally stale
        // rather than reusing `dir_age`'s "unknown == fresh" fallback.
        let mtime_age = match tokio::fs::metadata(&session.directory_path)
            .await
            .and_then(|m| m.modified())
        {
            Ok(modified) => std::time::SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
            Err(_) => Duration::MAX,
        };
        mtime_age >= STALL_THRESHOLD
    }

    async fn enforce_size_cap(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let mut sessions = self.repo.list_by_status(TranscodeStatus::Completed).await?;
        let mut total_bytes = 0u64;
        for session in &sessions {
            total_bytes += dir_size(&session.directory_path).await;
        }

        if total_bytes <= self.config.cache_size_cap_bytes {
            return Ok(report);
        }

        sessions.sort_by_key(|s| s.last_accessed);
        for session in sessions {
            if total_bytes <= self.config.cache_size_cap_bytes {
                break;
            }
            if !self.claims.insert(session.id) {
                continue;
            }
            let freed = dir_size(&session.directory_path).await;
            if session.directory_path.exists() {
                match tokio::fs::remove_dir_all(&session.directory_path).await {
                    Ok(()) => report.directories_removed += 1,
                    Err(err) => warn!(session_id = %session.id, error = %err, "failed to evict cached session"),
                }
            }
            self.repo.delete(session.id).await?;
            report.sessions_deleted += 1;
            total_bytes = total_bytes.saturating_sub(freed);
            self.claims.remove(&session.id);
        }

        Ok(report)
    }

    async fn sweep_orphan_directories(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let known_provider_ids = self.registry.provider_ids();
        if known_provider_ids.is_empty() {
            return Ok(report);
        }
        let known_refs: Vec<&str> = known_provider_ids.iter().map(|s| s.as_str()).collect();

        let mut known_sessions: HashSet<String> = HashSet::new();
        for status in [
            TranscodeStatus::Queued,
            TranscodeStatus::Running,
            TranscodeStatus::Completed,
            TranscodeStatus::Failed,
            TranscodeStatus::Cancelled,
        ] {
            for session in self.repo.list_by_status(status).await? {
                known_sessions.insert(session.id.to_string());
            }
        }

        let mut entries = match tokio::fs::read_dir(&self.dir_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(CoreError::from(err)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(CoreError::from)? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let Some((_, _, session_id)) =
                media_model::transcode::parse_session_directory_name(&name, &known_refs)
            else {
                continue;
            };
            if known_sessions.contains(&session_id) {
                continue;
            }

            let age = dir_age(&path).await;
            if age < Duration::from_secs(30 * 60) {
                continue;
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    report.directories_removed += 1;
                    info!(directory = %path.display(), "removed orphaned transcode directory");
                }
                Err(err) => warn!(directory = %path.display(), error = %err, "failed to remove orphaned directory"),
            }
        }

        Ok(report)
    }

    /// Enumerate running processes whose command line references a
    /// directory under `dir_root`, match each against the sessions currently
    /// `Running`, and signal the process group of anything left over: a
    /// graceful `SIGTERM` on first sight, escalating to `SIGKILL` once it has
    /// been seen stuck for 30 minutes. No-op on non-unix targets, since there
    /// is no portable process-group signal.
    async fn reap_orphaned_processes(&self) -> u64 {
        let live_dirs: HashSet<PathBuf> = match self.repo.list_by_status(TranscodeStatus::Running).await {
            Ok(sessions) => sessions.into_iter().map(|s| s.directory_path).collect(),
            Err(err) => {
                warn!(error = %err, "could not list running sessions for process reaping");
                return 0;
            }
        };

        #[cfg(unix)]
        {
            let dir_root = self.dir_root.clone();
            let signaled = self.signaled_pids.clone();
            tokio::task::spawn_blocking(move || reap_blocking(dir_root, live_dirs, signaled))
                .await
                .unwrap_or(0)
        }
        #[cfg(not(unix))]
        {
            let _ = live_dirs;
            0
        }
    }
}

#[cfg(unix)]
fn reap_blocking(
    dir_root: PathBuf,
    live_dirs: HashSet<PathBuf>,
    signaled: Arc<DashMap<i32, Instant>>,
) -> u64 {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::{getpgid, Pid};

    let root_prefix = dir_root.to_string_lossy().to_string();
    let mut reaped = 0u64;

    let mut system = sysinfo::System::new_all();
    system.refresh_all();

    for (pid, process) in system.processes() {
        let references_root = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().starts_with(&root_prefix));
        if !references_root {
            continue;
        }
        let owned_by_live_session = process.cmd().iter().any(|arg| {
            let arg = arg.to_string_lossy();
            live_dirs.iter().any(|dir| arg.starts_with(&*dir.to_string_lossy()))
        });
        if owned_by_live_session {
            continue;
        }

        let raw_pid = pid.as_u32() as i32;
        let nix_pid = Pid::from_raw(raw_pid);
        let group = getpgid(Some(nix_pid)).unwrap_or(nix_pid);

        match signaled.get(&raw_pid).map(|e| *e) {
            Some(first_seen) if first_seen.elapsed() > Duration::from_secs(30 * 60) => {
                let _ = signal::kill(Pid::from_raw(-group.as_raw()), Signal::SIGKILL);
                signaled.remove(&raw_pid);
                reaped += 1;
            }
            Some(_) => {}
            None => {
                let _ = signal::kill(Pid::from_raw(-group.as_raw()), Signal::SIGTERM);
                signaled.insert(raw_pid, Instant::now());
            }
        }
    }

    reaped
}

async fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let p = entry.path();
            if p.is_dir() {
                stack.push(p);
            } else if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
    }
    total
}

async fn dir_age(path: &Path) -> Duration {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => std::time::SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
        Err(_) => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRepository;
    use async_trait::async_trait;
    use media_contracts::{HardwareAccelerator, Provider, ProviderHandle, ProviderInfo};
    use media_model::{TranscodeProgress, TranscodeRequest, TranscodeSession};
    use std::fs;

    struct StubProvider(&'static str);

    #[async_trait]
    impl Provider for StubProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: self.0.to_string(),
                priority: 1,
                supported_formats: vec!["mp4".to_string()],
                hardware_accelerators: Vec::<HardwareAccelerator>::new(),
            }
        }

        async fn start(
            &self,
            _session_id: SessionId,
            _request: &TranscodeRequest,
            _output_dir: &Path,
        ) -> Result<ProviderHandle> {
            Ok(ProviderHandle("h".to_string()))
        }

        async fn progress(&self, _handle: &ProviderHandle) -> Result<TranscodeProgress> {
            Ok(TranscodeProgress::default())
        }

        async fn cancel(&self, _handle: &ProviderHandle) -> Result<()> {
            Ok(())
        }
    }

    fn request() -> TranscodeRequest {
        TranscodeRequest {
            media_id: "media-1".to_string(),
            container: "mp4".to_string(),
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            quality: "default".to_string(),
            speed_preset: "fast".to_string(),
            resolution: None,
            adaptive_bitrate: false,
            video_bitrate_kbps: Some(4000),
            audio_bitrate_kbps: Some(128),
        }
    }

    fn service(repo: Arc<dyn Repository>, dir_root: PathBuf) -> CleanupService {
        CleanupService::new(
            repo,
            Arc::new(ProviderRegistry::new()),
            CleanupConfig {
                interval: Duration::from_secs(900),
                deep_interval: Duration::from_secs(3600),
                session_max_age: Duration::from_secs(0),
                cache_size_cap_bytes: u64::MAX,
            },
            dir_root,
        )
    }

    #[tokio::test]
    async fn expired_session_is_deleted_and_directory_removed() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());

        let mut session = TranscodeSession::new("dash_ffmpeg_software".to_string(), request(), dir.path());
        session.status = TranscodeStatus::Completed;
        session.last_accessed = Utc::now() - chrono::Duration::hours(48);
        fs::create_dir_all(&session.directory_path).unwrap();
        repo.create(session.clone()).await.unwrap();

        let svc = service(repo.clone(), dir.path().to_path_buf());
        let report = svc.run_normal().await.unwrap();

        assert_eq!(report.sessions_deleted, 1);
        assert_eq!(report.directories_removed, 1);
        assert!(repo.get(session.id).await.unwrap().is_none());
        assert!(!session.directory_path.exists());
    }

    #[tokio::test]
    async fn running_a_sweep_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());

        let mut session = TranscodeSession::new("dash_ffmpeg_software".to_string(), request(), dir.path());
        session.status = TranscodeStatus::Completed;
        session.last_accessed = Utc::now() - chrono::Duration::hours(48);
        fs::create_dir_all(&session.directory_path).unwrap();
        repo.create(session.clone()).await.unwrap();

        let svc = service(repo.clone(), dir.path().to_path_buf());
        let first = svc.run_normal().await.unwrap();
        let second = svc.run_normal().await.unwrap();

        assert_eq!(first.sessions_deleted, 1);
        assert_eq!(second.sessions_deleted, 0);
        assert_eq!(second.directories_removed, 0);
    }

    #[tokio::test]
    async fn orphan_directory_older_than_threshold_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());

        let session_id = SessionId::new();
        let orphan = dir.path().join(format!("dash_ffmpeg_software_{session_id}"));
        fs::create_dir_all(&orphan).unwrap();

        let svc = service(repo.clone(), dir.path().to_path_buf());
        svc.registry.register(Arc::new(StubProvider("dash_ffmpeg_software")));

        let old = std::time::SystemTime::now() - Duration::from_secs(60 * 60);
        let file = fs::File::open(&orphan).unwrap();
        file.set_modified(old).unwrap();

        let report = svc.run_deep().await.unwrap();
        assert_eq!(report.directories_removed, 1);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn fresh_orphan_directory_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());

        let session_id = SessionId::new();
        let orphan = dir.path().join(format!("dash_ffmpeg_software_{session_id}"));
        fs::create_dir_all(&orphan).unwrap();

        let svc = service(repo.clone(), dir.path().to_path_buf());
        svc.registry.register(Arc::new(StubProvider("dash_ffmpeg_software")));

        let report = svc.run_deep().await.unwrap();
        assert_eq!(report.directories_removed, 0);
        assert!(orphan.exists());
    }

    #[tokio::test]
    async fn running_session_stalled_past_threshold_with_stale_directory_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());

        let mut session = TranscodeSession::new("dash_ffmpeg_software".to_string(), request(), dir.path());
        session.status = TranscodeStatus::Running;
        session.last_accessed = Utc::now() - chrono::Duration::minutes(15);
        fs::create_dir_all(&session.directory_path).unwrap();
        let stale = std::time::SystemTime::now() - Duration::from_secs(15 * 60);
        let file = fs::File::open(&session.directory_path).unwrap();
        file.set_modified(stale).unwrap();
        repo.create(session.clone()).await.unwrap();

        let svc = service(repo.clone(), dir.path().to_path_buf());
        let report = svc.run_normal().await.unwrap();

        assert_eq!(report.sessions_deleted, 1);
        assert!(repo.get(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_session_with_recent_directory_activity_is_not_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());

        let mut session = TranscodeSession::new("dash_ffmpeg_software".to_string(), request(), dir.path());
        session.status = TranscodeStatus::Running;
        session.last_accessed = Utc::now() - chrono::Duration::minutes(15);
        fs::create_dir_all(&session.directory_path).unwrap();
        repo.create(session.clone()).await.unwrap();

        let svc = service(repo.clone(), dir.path().to_path_buf());
        let report = svc.run_normal().await.unwrap();

        assert_eq!(report.sessions_deleted, 0);
        assert!(repo.get(session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn running_session_with_recent_progress_is_not_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());

        let mut session = TranscodeSession::new("dash_ffmpeg_software".to_string(), request(), dir.path());
        session.status = TranscodeStatus::Running;
        fs::create_dir_all(&session.directory_path).unwrap();
        let stale = std::time::SystemTime::now() - Duration::from_secs(15 * 60);
        let file = fs::File::open(&session.directory_path).unwrap();
        file.set_modified(stale).unwrap();
        repo.create(session.clone()).await.unwrap();

        let svc = service(repo.clone(), dir.path().to_path_buf());
        let report = svc.run_normal().await.unwrap();

        assert_eq!(report.sessions_deleted, 0);
        assert!(repo.get(session.id).await.unwrap().is_some());
    }
}
