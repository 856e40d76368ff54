//! Session Store & Transcode Orchestrator: deduplicates transcode requests
//! by content hash, selects a provider, and fans a single dispatched
//! session out to every waiter that asked for the same output.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use media_contracts::{CoreError, EventPublisher, HardwareAccelerator, Repository, Result};
use media_model::{
    content_hash, Event, EventKind, SessionId, TranscodeRequest, TranscodeResult, TranscodeSession,
    TranscodeStatus,
};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ProviderRegistry;

type Waiter = oneshot::Sender<Result<TranscodeSession>>;

struct InFlight {
    session_id: SessionId,
    cancel: CancellationToken,
    waiters: Mutex<Vec<Waiter>>,
}

/// Owns all `TranscodeSession` mutations. Requests with identical content
/// hashes are coalesced onto a single provider invocation; every caller
/// that asked for the same output is notified once the session reaches a
/// terminal state.
pub struct TranscodeOrchestrator {
    repo: Arc<dyn Repository>,
    events: Arc<dyn EventPublisher>,
    registry: Arc<ProviderRegistry>,
    dir_root: PathBuf,
    waiter_deadline: Duration,
    by_hash: Arc<DashMap<String, Arc<InFlight>>>,
    by_session: Arc<DashMap<SessionId, Arc<InFlight>>>,
}

impl TranscodeOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<dyn EventPublisher>,
        registry: Arc<ProviderRegistry>,
        dir_root: PathBuf,
        waiter_deadline: Duration,
    ) -> Self {
        Self {
            repo,
            events,
            registry,
            dir_root,
            waiter_deadline,
            by_hash: Arc::new(DashMap::new()),
            by_session: Arc::new(DashMap::new()),
        }
    }

    /// Request a transcode. If an active session already exists for this
    /// request's content hash, attaches as a waiter instead of dispatching
    /// new work. Blocks (bounded by `waiter_deadline`) until the session
    /// reaches a terminal state.
    pub async fn request_transcode(
        &self,
        request: TranscodeRequest,
        accelerators: &[HardwareAccelerator],
    ) -> Result<TranscodeSession> {
        let hash = content_hash(&request);

        let (rx, is_new) = {
            if let Some(existing) = self.by_hash.get(&hash) {
                let (tx, rx) = oneshot::channel();
                existing.waiters.lock().await.push(tx);
                (rx, false)
            } else {
                let (tx, rx) = oneshot::channel();
                let in_flight = Arc::new(InFlight {
                    session_id: SessionId::new(),
                    cancel: CancellationToken::new(),
                    waiters: Mutex::new(vec![tx]),
                });
                self.by_hash.insert(hash.clone(), in_flight.clone());
                (rx, true)
            }
        };

        if is_new {
            let in_flight = self.by_hash.get(&hash).unwrap().clone();
            match self.dispatch(hash.clone(), request, accelerators, in_flight).await {
                Ok(()) => {}
                Err(err) => {
                    self.by_hash.remove(&hash);
                    return Err(err);
                }
            }
        }

        match tokio::time::timeout(self.waiter_deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Internal("session actor dropped waiter".to_string())),
            Err(_) => Err(CoreError::DeadlineExceeded(format!(
                "transcode waiter deadline of {:?} exceeded",
                self.waiter_deadline
            ))),
        }
    }

    async fn dispatch(
        &self,
        hash: String,
        request: TranscodeRequest,
        accelerators: &[HardwareAccelerator],
        in_flight: Arc<InFlight>,
    ) -> Result<()> {
        let provider = self.registry.select(&request.container, accelerators)?;
        let provider_id = provider.info().id;

        let mut session = TranscodeSession::new(provider_id.clone(), request.clone(), &self.dir_root);
        session.id = in_flight.session_id;
        session.content_hash = hash.clone();

        self.repo.create(session.clone()).await?;
        self.by_session.insert(session.id, in_flight.clone());
        self.registry.mark_session_started(&provider_id);
        self.events
            .publish(Event::new("media-core", EventKind::TranscodeRequested {
                session_id: session.id,
                content_hash: hash.clone(),
            }))
            .await;

        tokio::fs::create_dir_all(&session.directory_path)
            .await
            .map_err(CoreError::from)?;

        let handle = provider
            .start(session.id, &request, &session.directory_path)
            .await?;

        self.repo.update_status(session.id, TranscodeStatus::Running).await?;

        let repo = self.repo.clone();
        let events = self.events.clone();
        let registry = self.registry.clone();
        let by_hash = self.by_hash.clone();
        let by_session = self.by_session.clone();

        tokio::spawn(async move {
            let mut last_segments = 0;
            let mut last_percent = 0.0_f32;
            let outcome: Result<TranscodeResult> = loop {
                if in_flight.cancel.is_cancelled() {
                    let _ = provider.cancel(&handle).await;
                    break Err(CoreError::Cancelled(format!("session {} cancelled", session.id)));
                }

                tokio::select! {
                    _ = in_flight.cancel.cancelled() => {
                        let _ = provider.cancel(&handle).await;
                        break Err(CoreError::Cancelled(format!("session {} cancelled", session.id)));
                    }
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }

                let progress = match provider.progress(&handle).await {
                    Ok(p) => p,
                    Err(err) => break Err(err),
                };

                if progress.segments_ready > last_segments {
                    last_segments = progress.segments_ready;
                    events
                        .publish(Event::new("media-core", EventKind::TranscodeSegmentReady {
                            session_id: session.id,
                            segment_index: last_segments,
                        }))
                        .await;
                }

                // `last_accessed` doubles as the cleanup service's
                // last-progress timestamp, so only bump it when the
                // provider reports forward movement, not on every poll.
                if progress.percent > last_percent || progress.segments_ready > last_segments {
                    last_percent = progress.percent;
                    let _ = repo.touch_last_accessed(session.id).await;
                }

                if progress.percent >= 100.0 {
                    break Ok(TranscodeResult {
                        playlist_path: session.directory_path.join("playlist.m3u8"),
                        output_size_bytes: 0,
                    });
                }
            };

            registry.mark_session_finished(&provider_id);
            by_session.remove(&session.id);
            by_hash.remove(&hash);

            let final_result = match outcome {
                Ok(result) => {
                    let _ = repo.update_status(session.id, TranscodeStatus::Completed).await;
                    session.status = TranscodeStatus::Completed;
                    session.result = Some(result);
                    session.end_time = Some(chrono::Utc::now());
                    events
                        .publish(Event::new("media-core", EventKind::TranscodeCompleted {
                            session_id: session.id,
                        }))
                        .await;
                    Ok(session.clone())
                }
                Err(err) => {
                    let status = if matches!(err, CoreError::Cancelled(_)) {
                        TranscodeStatus::Cancelled
                    } else {
                        TranscodeStatus::Failed
                    };
                    let _ = repo.update_status(session.id, status).await;
                    warn!(session_id = %session.id, error = %err, "transcode session failed");
                    events
                        .publish(Event::new("media-core", EventKind::TranscodeFailed {
                            session_id: session.id,
                            error: err.to_string(),
                        }))
                        .await;
                    Err(err)
                }
            };

            let mut waiters = in_flight.waiters.lock().await;
            for waiter in waiters.drain(..) {
                let _ = waiter.send(match &final_result {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(CoreError::Internal(e.to_string())),
                });
            }
        });

        info!(session_id = %session.id, provider = %provider_id, "transcode dispatched");
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Result<Option<TranscodeSession>> {
        self.repo.get(id).await
    }

    /// Cancel a session outright. Any other callers waiting on the same
    /// content hash are notified with a `Cancelled` error.
    pub fn cancel(&self, id: SessionId) {
        if let Some(in_flight) = self.by_session.get(&id) {
            in_flight.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRepository;
    use async_trait::async_trait;
    use media_contracts::{NullEventPublisher, Provider, ProviderHandle, ProviderInfo};
    use media_model::TranscodeProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct InstantProvider {
        start_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider for InstantProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "instant".to_string(),
                priority: 1,
                supported_formats: vec!["mp4".to_string()],
                hardware_accelerators: vec![],
            }
        }

        async fn start(
            &self,
            _session_id: SessionId,
            _request: &TranscodeRequest,
            _output_dir: &std::path::Path,
        ) -> Result<ProviderHandle> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderHandle("h".to_string()))
        }

        async fn progress(&self, _handle: &ProviderHandle) -> Result<TranscodeProgress> {
            Ok(TranscodeProgress {
                percent: 100.0,
                segments_ready: 1,
                current_speed: None,
            })
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

    #[tokio::test]
    async fn duplicate_requests_coalesce_to_one_provider_start() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryRepository::new());
        let registry = Arc::new(ProviderRegistry::new());
        let start_calls = Arc::new(AtomicUsize::new(0));
        registry.register(Arc::new(InstantProvider {
            start_calls: start_calls.clone(),
        }));

        let orchestrator = Arc::new(TranscodeOrchestrator::new(
            repo,
            Arc::new(NullEventPublisher),
            registry,
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        ));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let orchestrator = orchestrator.clone();
            let req = request();
            handles.push(tokio::spawn(async move {
                orchestrator.request_transcode(req, &[]).await
            }));
        }

        let mut hashes = std::collections::HashSet::new();
        for handle in handles {
            let session = handle.await.unwrap().unwrap();
            hashes.insert(session.content_hash.clone());
        }

        assert_eq!(hashes.len(), 1);
        assert_eq!(start_calls.load(Ordering::SeqCst), 1);
    }
}
