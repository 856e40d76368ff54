//! Provider Registry: tracks transcoding providers and their live load,
//! and implements the capability-and-score selection algorithm.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use media_contracts::{HardwareAccelerator, Provider, ProviderInfo};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

struct Registration {
    provider: Arc<dyn Provider>,
    active_sessions: AtomicUsize,
}

/// No provider in the registry can satisfy the requested container.
#[derive(Debug, Error)]
#[error("no provider supports container '{container}' (registered: {registered:?})")]
pub struct NoCapableProvider {
    pub container: String,
    pub registered: Vec<(String, Vec<String>)>,
}

/// Read-mostly registry of transcoding providers. Registration acquires a
/// writer lock that never blocks capability queries, which take a snapshot
/// read.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Registration>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        let info = provider.info();
        info!(provider_id = %info.id, priority = info.priority, "provider registered");
        self.providers.write().insert(
            info.id,
            Registration {
                provider,
                active_sessions: AtomicUsize::new(0),
            },
        );
    }

    pub fn unregister(&self, provider_id: &str) {
        self.providers.write().remove(provider_id);
    }

    pub fn mark_session_started(&self, provider_id: &str) {
        if let Some(reg) = self.providers.read().get(provider_id) {
            reg.active_sessions.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn mark_session_finished(&self, provider_id: &str) {
        if let Some(reg) = self.providers.read().get(provider_id) {
            reg.active_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Score and select the best provider for `container`, optionally
    /// preferring one of `wanted_accelerators`. Ties break by lowest active
    /// session count, then by id lexicographically.
    pub fn select(
        &self,
        container: &str,
        wanted_accelerators: &[HardwareAccelerator],
    ) -> Result<Arc<dyn Provider>, NoCapableProvider> {
        let providers = self.providers.read();

        let mut candidates: Vec<(ProviderInfo, i64, usize)> = providers
            .values()
            .filter_map(|reg| {
                let info = reg.provider.info();
                if !info
                    .supported_formats
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(container))
                {
                    return None;
                }
                let active = reg.active_sessions.load(Ordering::SeqCst);
                let hw_match = info
                    .hardware_accelerators
                    .iter()
                    .any(|a| wanted_accelerators.contains(a));
                let score = info.priority as i64 * 100
                    + if hw_match { 500 } else { 0 }
                    - 10 * active as i64;
                Some((info, score, active))
            })
            .collect();

        if candidates.is_empty() {
            let registered = providers
                .values()
                .map(|reg| {
                    let info = reg.provider.info();
                    (info.id, info.supported_formats)
                })
                .collect();
            return Err(NoCapableProvider {
                container: container.to_string(),
                registered,
            });
        }

        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.id.cmp(&b.0.id))
        });

        let winner_id = candidates[0].0.id.clone();
        Ok(providers.get(&winner_id).unwrap().provider.clone())
    }

    /// Ids of every registered provider, used to disambiguate the
    /// directory-name grammar when inverting it back to a session.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use media_contracts::{ProviderHandle, Result};
    use media_model::{SessionId, TranscodeProgress, TranscodeRequest};

    struct FakeProvider {
        id: &'static str,
        priority: i32,
        formats: Vec<&'static str>,
        accelerators: Vec<HardwareAccelerator>,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: self.id.to_string(),
                priority: self.priority,
                supported_formats: self.formats.iter().map(|s| s.to_string()).collect(),
                hardware_accelerators: self.accelerators.clone(),
            }
        }

        async fn start(
            &self,
            _session_id: SessionId,
            _request: &TranscodeRequest,
            _output_dir: &std::path::Path,
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

    #[test]
    fn selects_highest_scoring_provider() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider {
            id: "low",
            priority: 1,
            formats: vec!["mp4"],
            accelerators: vec![],
        }));
        registry.register(Arc::new(FakeProvider {
            id: "high",
            priority: 10,
            formats: vec!["mp4"],
            accelerators: vec![],
        }));

        let selected = registry.select("mp4", &[]).unwrap();
        assert_eq!(selected.info().id, "high");
    }

    #[test]
    fn hardware_match_beats_higher_priority() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider {
            id: "software",
            priority: 10,
            formats: vec!["mp4"],
            accelerators: vec![],
        }));
        registry.register(Arc::new(FakeProvider {
            id: "hardware",
            priority: 1,
            formats: vec!["mp4"],
            accelerators: vec![HardwareAccelerator::Nvenc],
        }));

        let selected = registry
            .select("mp4", &[HardwareAccelerator::Nvenc])
            .unwrap();
        assert_eq!(selected.info().id, "hardware");
    }

    #[test]
    fn no_candidate_is_typed_error() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider {
            id: "only-mp4",
            priority: 1,
            formats: vec!["mp4"],
            accelerators: vec![],
        }));

        let err = registry.select("mkv", &[]).unwrap_err();
        assert_eq!(err.container, "mkv");
    }

    #[test]
    fn ties_break_by_active_sessions_then_id() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider {
            id: "b",
            priority: 5,
            formats: vec!["mp4"],
            accelerators: vec![],
        }));
        registry.register(Arc::new(FakeProvider {
            id: "a",
            priority: 5,
            formats: vec!["mp4"],
            accelerators: vec![],
        }));

        let selected = registry.select("mp4", &[]).unwrap();
        assert_eq!(selected.info().id, "a");
    }
}
