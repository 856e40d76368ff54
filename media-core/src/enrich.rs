//! Metadata Enricher Pool: technical probing of scanned files plus
//! rate-limited, cached lookups against external [`Enricher`] plug-ins.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use media_contracts::{Enricher, EnricherMatch};
use media_model::{MediaType, StreamInfo, StreamKind};
use tracing::{debug, warn};

/// Technical probe result, filled in on the scan worker's hot path before a
/// `MediaFile` is first persisted.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub media_type: MediaType,
    pub container: Option<String>,
    pub streams: Vec<StreamInfo>,
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Concurrent worker pool for metadata enrichment. Technical probing runs
/// inline (it is local file I/O, bounded by ffmpeg's own cost); external
/// enricher lookups are rate-limited per provider and cached by
/// `(provider, external_key)` for `cache_ttl`.
pub struct EnricherPool {
    enrichers: Vec<std::sync::Arc<dyn Enricher>>,
    cache: DashMap<(String, String), (Vec<EnricherMatch>, Instant)>,
    cache_ttl: Duration,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl EnricherPool {
    pub fn new(enrichers: Vec<std::sync::Arc<dyn Enricher>>, cache_ttl: Duration) -> Self {
        let mut buckets = HashMap::new();
        for e in &enrichers {
            buckets.insert(e.id().to_string(), TokenBucket::new(5.0, 1.0));
        }
        Self {
            enrichers,
            cache: DashMap::new(),
            cache_ttl,
            buckets: Mutex::new(buckets),
        }
    }

    /// Probe a file's technical metadata (container, streams, media type).
    /// Never blocks on network I/O; failures degrade to `MediaType::Unknown`
    /// rather than failing the scan.
    #[cfg(feature = "ffmpeg")]
    pub async fn probe(&self, path: &Path) -> ProbeResult {
        let path = path.to_path_buf();
        match tokio::task::spawn_blocking(move || Self::probe_blocking(&path)).await {
            Ok(Some(result)) => result,
            Ok(None) | Err(_) => ProbeResult::default(),
        }
    }

    #[cfg(feature = "ffmpeg")]
    fn probe_blocking(path: &Path) -> Option<ProbeResult> {
        ffmpeg_next::init().ok()?;
        let input = ffmpeg_next::format::input(&path).ok()?;
        let container = input
            .format()
            .name()
            .split(',')
            .next()
            .map(|s| s.to_string());

        let mut streams = Vec::new();
        let mut has_video = false;
        let mut has_audio = false;
        for (index, stream) in input.streams().enumerate() {
            let Ok(codec) =
                ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            else {
                continue;
            };
            match codec.medium() {
                ffmpeg_next::media::Type::Video => {
                    if let Ok(video) = codec.decoder().video() {
                        has_video = true;
                        streams.push(StreamInfo {
                            index: index as u32,
                            kind: StreamKind::Video,
                            codec: video.codec().map(|c| c.name().to_string()).unwrap_or_default(),
                            width: Some(video.width()),
                            height: Some(video.height()),
                            bitrate: if input.bit_rate() > 0 {
                                Some(input.bit_rate() as u64)
                            } else {
                                None
                            },
                            channels: None,
                            language: None,
                        });
                    }
                }
                ffmpeg_next::media::Type::Audio => {
                    if let Ok(audio) = codec.decoder().audio() {
                        has_audio = true;
                        streams.push(StreamInfo {
                            index: index as u32,
                            kind: StreamKind::Audio,
                            codec: audio.codec().map(|c| c.name().to_string()).unwrap_or_default(),
                            width: None,
                            height: None,
                            bitrate: None,
                            channels: Some(audio.channels() as u32),
                            language: None,
                        });
                    }
                }
                _ => {}
            }
        }

        let media_type = if has_video {
            MediaType::Video
        } else if has_audio {
            MediaType::Audio
        } else {
            MediaType::Unknown
        };

        Some(ProbeResult {
            media_type,
            container,
            streams,
        })
    }

    #[cfg(not(feature = "ffmpeg"))]
    pub async fn probe(&self, _path: &Path) -> ProbeResult {
        ProbeResult::default()
    }

    /// Search all registered external enrichers for `query`, respecting the
    /// per-provider token bucket and TTL cache. Errors from one enricher
    /// never block the others.
    pub async fn search_external(&self, query: &str) -> Vec<EnricherMatch> {
        let mut results = Vec::new();
        for enricher in &self.enrichers {
            let id = enricher.id().to_string();
            let key = (id.clone(), query.to_string());

            if let Some(entry) = self.cache.get(&key) {
                if entry.1.elapsed() < self.cache_ttl {
                    results.extend(entry.0.clone());
                    continue;
                }
            }

            let allowed = {
                let mut buckets = self.buckets.lock().expect("enricher bucket mutex poisoned");
                buckets
                    .entry(id.clone())
                    .or_insert_with(|| TokenBucket::new(5.0, 1.0))
                    .try_take()
            };
            if !allowed {
                debug!(provider = %id, "enricher rate limit exceeded, skipping this round");
                continue;
            }

            match enricher.search(query).await {
                Ok(matches) => {
                    self.cache.insert(key, (matches.clone(), Instant::now()));
                    results.extend(matches);
                }
                Err(err) => warn!(provider = %id, error = %err, "external enricher search failed"),
            }
        }
        results
    }

    pub fn provider_count(&self) -> usize {
        self.enrichers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_contracts::Result;

    struct CountingEnricher {
        id: String,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Enricher for CountingEnricher {
        fn id(&self) -> &str {
            &self.id
        }

        async fn search(&self, _query: &str) -> Result<Vec<EnricherMatch>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(vec![EnricherMatch {
                external_key: "1".to_string(),
                title: "Example".to_string(),
                score: 0.9,
            }])
        }

        async fn health(&self) -> media_contracts::EnricherHealth {
            media_contracts::EnricherHealth::Ok
        }
    }

    #[tokio::test]
    async fn caches_results_within_ttl() {
        let enricher = std::sync::Arc::new(CountingEnricher {
            id: "test".to_string(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let pool = EnricherPool::new(vec![enricher.clone()], Duration::from_secs(60));

        pool.search_external("Movie").await;
        pool.search_external("Movie").await;

        assert_eq!(enricher.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_skips_without_failing() {
        let enricher = std::sync::Arc::new(CountingEnricher {
            id: "test".to_string(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let pool = EnricherPool::new(vec![enricher.clone()], Duration::from_millis(1));
        {
            let mut buckets = pool.buckets.lock().unwrap();
            buckets.insert("test".to_string(), TokenBucket::new(1.0, 0.0));
            buckets.get_mut("test").unwrap().tokens = 0.0;
        }
        let results = pool.search_external("Movie").await;
        assert!(results.is_empty());
        assert_eq!(enricher.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
