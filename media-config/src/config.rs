use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    pub parallel_enabled: bool,
    pub worker_count_max: usize,
    pub batch_size_base: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            parallel_enabled: true,
            worker_count_max: num_cpus::get().max(1),
            batch_size_base: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub cpu_target_pct: f32,
    pub mem_target_pct: f32,
    pub net_target_mbps: f32,
    pub emergency_brake_pct: f32,
    pub io_wait_target_pct: f32,
    /// Load average, normalized by worker-count cores, above which the
    /// host is considered saturated (1.0 == fully loaded).
    pub load_average_target: f32,
    pub dns_latency_target_ms: f32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cpu_target_pct: 70.0,
            mem_target_pct: 80.0,
            net_target_mbps: 80.0,
            emergency_brake_pct: 95.0,
            io_wait_target_pct: 10.0,
            load_average_target: 1.0,
            dns_latency_target_ms: 200.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub deep_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub session_max_age: Duration,
    pub cache_size_cap_bytes: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            deep_interval: Duration::from_secs(60 * 60),
            session_max_age: Duration::from_secs(24 * 60 * 60),
            cache_size_cap_bytes: 50 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TranscodeConfig {
    #[serde(with = "humantime_serde")]
    pub waiter_deadline: Duration,
    pub dir_root: PathBuf,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            waiter_deadline: Duration::from_secs(10 * 60),
            dir_root: PathBuf::from("/var/lib/media-server/transcode"),
        }
    }
}

/// Top-level typed configuration for the core. Deserialized from TOML (or
/// JSON, for convenience) and otherwise fully usable via `Default`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub scan: ScanConfig,
    pub throttle: ThrottleConfig,
    pub cleanup: CleanupConfig,
    pub transcode: TranscodeConfig,
    pub log_json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = CoreConfig::default();
        let toml_str = toml::to_string(&cfg).unwrap();
        let parsed: CoreConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed: CoreConfig = toml::from_str(
            r#"
            [throttle]
            cpu_target_pct = 50.0
            "#,
        )
        .unwrap();
        assert_eq!(parsed.throttle.cpu_target_pct, 50.0);
        assert_eq!(parsed.scan.batch_size_base, 64);
    }
}
