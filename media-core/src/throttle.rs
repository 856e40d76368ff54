//! Adaptive throttle: samples host load and emits a work budget that the
//! Scan Engine's worker pool is resized against on every tick.
//!
//! Inside a container, host-wide CPU/memory percentages are misleading —
//! `sysinfo` sees the node's full core count and RAM, not the cgroup's
//! quota. Where a cgroup limit is detectable, it is preferred over the
//! raw host metric for CPU and memory.

use std::collections::VecDeque;
use std::sync::Mutex;

use sysinfo::{Networks, System};
use tracing::{debug, warn};

use media_config::config::ThrottleConfig;

const WINDOW_LEN: usize = 60;

/// One resource observation at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleSample {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub net_mbps: f32,
    pub io_wait_pct: f32,
    pub load_average: f64,
    /// Round-trip time of a bounded DNS resolution, used as a proxy for
    /// network health beyond raw throughput. `None` when the probe could
    /// not complete (no network, resolver unreachable).
    pub dns_latency_ms: Option<f32>,
}

/// The throttle's output: how much work the caller should schedule next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub workers: usize,
    pub batch_size: usize,
    pub delay_ms: u64,
    pub emergency_brake: bool,
}

impl Budget {
    fn baseline(workers_max: usize, batch_size_base: usize) -> Self {
        Self {
            workers: workers_max.max(1),
            batch_size: batch_size_base.max(1),
            delay_ms: 0,
            emergency_brake: false,
        }
    }
}

/// Which cgroup hierarchy (if any) the process is confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CgroupVersion {
    None,
    V1,
    V2,
}

/// Cgroup-reported limits resolved once at startup (limits are not
/// expected to change over a process's lifetime).
#[derive(Debug, Clone, Copy)]
struct CgroupLimits {
    version: CgroupVersion,
    /// Number of cores implied by the CPU quota, if a quota is set.
    cpu_quota_cores: Option<f32>,
}

impl CgroupLimits {
    #[cfg(target_os = "linux")]
    fn detect() -> Self {
        use std::path::Path;

        if Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            let cpu_quota_cores = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
                .ok()
                .and_then(|contents| {
                    let mut parts = contents.split_whitespace();
                    let quota = parts.next()?;
                    let period: f32 = parts.next()?.parse().ok()?;
                    if quota == "max" || period == 0.0 {
                        None
                    } else {
                        Some(quota.parse::<f32>().ok()? / period)
                    }
                });
            return Self {
                version: CgroupVersion::V2,
                cpu_quota_cores,
            };
        }

        if Path::new("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").exists()
            || Path::new("/sys/fs/cgroup/memory/memory.limit_in_bytes").exists()
        {
            let quota: Option<i64> = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
                .ok()
                .and_then(|s| s.trim().parse().ok());
            let period: Option<f32> = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
                .ok()
                .and_then(|s| s.trim().parse().ok());
            let cpu_quota_cores = match (quota, period) {
                (Some(quota), Some(period)) if quota > 0 && period > 0.0 => {
                    Some(quota as f32 / period)
                }
                _ => None,
            };
            return Self {
                version: CgroupVersion::V1,
                cpu_quota_cores,
            };
        }

        Self {
            version: CgroupVersion::None,
            cpu_quota_cores: None,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn detect() -> Self {
        Self {
            version: CgroupVersion::None,
            cpu_quota_cores: None,
        }
    }

    fn mem_pct(&self) -> Option<f32> {
        match self.version {
            #[cfg(target_os = "linux")]
            CgroupVersion::V2 => {
                let max = std::fs::read_to_string("/sys/fs/cgroup/memory.max").ok()?;
                let max = max.trim();
                if max == "max" {
                    return None;
                }
                let max: u64 = max.parse().ok()?;
                let current: u64 = std::fs::read_to_string("/sys/fs/cgroup/memory.current")
                    .ok()?
                    .trim()
                    .parse()
                    .ok()?;
                if max == 0 {
                    return None;
                }
                Some(current as f32 / max as f32 * 100.0)
            }
            #[cfg(target_os = "linux")]
            CgroupVersion::V1 => {
                let limit: u64 = std::fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes")
                    .ok()?
                    .trim()
                    .parse()
                    .ok()?;
                // An unset v1 limit reads back as a near-u64::MAX sentinel.
                if limit == 0 || limit > (1u64 << 62) {
                    return None;
                }
                let usage: u64 = std::fs::read_to_string("/sys/fs/cgroup/memory/memory.usage_in_bytes")
                    .ok()?
                    .trim()
                    .parse()
                    .ok()?;
                Some(usage as f32 / limit as f32 * 100.0)
            }
            _ => None,
        }
    }
}

struct Inner {
    sys: System,
    networks: Networks,
    window: VecDeque<ThrottleSample>,
    last_budget: Budget,
    stale_samples: u32,
    /// `(iowait_jiffies, total_jiffies)` from the previous `/proc/stat`
    /// read, used to compute the io-wait delta between samples.
    prev_proc_stat: Option<(u64, u64)>,
}

/// Samples CPU, memory, network, I/O-wait, load average and DNS health,
/// and derives a [`Budget`].
///
/// Failures in the underlying sampler never propagate: the previous valid
/// budget is reused and the staleness counter is incremented, matching the
/// documented failure model (sampling errors are never fatal to a scan).
pub struct AdaptiveThrottle {
    config: ThrottleConfig,
    workers_max: usize,
    batch_size_base: usize,
    cgroup: CgroupLimits,
    inner: Mutex<Inner>,
}

impl AdaptiveThrottle {
    pub fn new(config: ThrottleConfig, workers_max: usize, batch_size_base: usize) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        let cgroup = CgroupLimits::detect();
        debug!(cgroup_version = ?cgroup.version, cpu_quota_cores = ?cgroup.cpu_quota_cores, "cgroup detection");
        Self {
            config,
            workers_max,
            batch_size_base,
            cgroup,
            inner: Mutex::new(Inner {
                sys,
                networks: Networks::new_with_refreshed_list(),
                window: VecDeque::with_capacity(WINDOW_LEN),
                last_budget: Budget::baseline(workers_max, batch_size_base),
                stale_samples: 0,
                prev_proc_stat: None,
            }),
        }
    }

    /// Feed a synthetic sample directly, bypassing `sysinfo`. Used by tests
    /// to exercise the policy without depending on real host load.
    pub fn observe(&self, sample: ThrottleSample) -> Budget {
        let mut inner = self.inner.lock().expect("throttle mutex poisoned");
        Self::push(&mut inner.window, sample);
        let budget = self.derive(&inner.window, inner.last_budget);
        inner.last_budget = budget;
        inner.stale_samples = 0;
        budget
    }

    /// Sample the host and return the resulting budget. On sampling failure
    /// the last valid budget is returned unchanged and staleness is noted.
    pub fn sample(&self) -> Budget {
        let mut inner = self.inner.lock().expect("throttle mutex poisoned");
        match self.read_host(&mut inner.sys, &mut inner.networks, &mut inner.prev_proc_stat) {
            Some(sample) => {
                Self::push(&mut inner.window, sample);
                let budget = self.derive(&inner.window, inner.last_budget);
                inner.last_budget = budget;
                inner.stale_samples = 0;
                budget
            }
            None => {
                inner.stale_samples += 1;
                warn!(
                    stale_samples = inner.stale_samples,
                    "throttle sampling failed, reusing last budget"
                );
                inner.last_budget
            }
        }
    }

    fn read_host(
        &self,
        sys: &mut System,
        networks: &mut Networks,
        prev_proc_stat: &mut Option<(u64, u64)>,
    ) -> Option<ThrottleSample> {
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        networks.refresh();

        let cpus = sys.cpus();
        if cpus.is_empty() {
            return None;
        }
        let host_cpu_pct = cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32;
        let cpu_pct = match self.cgroup.cpu_quota_cores {
            Some(allotted) if allotted > 0.0 => {
                (host_cpu_pct * cpus.len() as f32 / allotted).min(100.0)
            }
            _ => host_cpu_pct,
        };

        let total_mem = sys.total_memory();
        if total_mem == 0 {
            return None;
        }
        let host_mem_pct = sys.used_memory() as f32 / total_mem as f32 * 100.0;
        let mem_pct = self.cgroup.mem_pct().unwrap_or(host_mem_pct);

        let bytes_per_s: u64 = networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();
        let net_mbps = bytes_per_s as f32 * 8.0 / 1_000_000.0;

        let io_wait_pct = read_proc_stat_iowait(prev_proc_stat).unwrap_or(0.0);
        let load_average = System::load_average().one;
        let dns_latency_ms = probe_dns_latency();

        Some(ThrottleSample {
            cpu_pct,
            mem_pct,
            net_mbps,
            io_wait_pct,
            load_average,
            dns_latency_ms,
        })
    }

    fn push(window: &mut VecDeque<ThrottleSample>, sample: ThrottleSample) {
        if window.len() >= WINDOW_LEN {
            window.pop_front();
        }
        window.push_back(sample);
    }

    fn derive(&self, window: &VecDeque<ThrottleSample>, previous: Budget) -> Budget {
        let Some(latest) = window.back().copied() else {
            return previous;
        };

        let cores = self.workers_max.max(1) as f64;
        let normalized_load = latest.load_average / cores;
        let dns_over = latest
            .dns_latency_ms
            .map(|ms| ms > self.config.dns_latency_target_ms)
            .unwrap_or(false);
        let dns_under = latest
            .dns_latency_ms
            .map(|ms| ms < self.config.dns_latency_target_ms * 0.85)
            .unwrap_or(true);

        let over_target = latest.cpu_pct > self.config.cpu_target_pct
            || latest.mem_pct > self.config.mem_target_pct
            || latest.net_mbps > self.config.net_target_mbps
            || latest.io_wait_pct > self.config.io_wait_target_pct
            || normalized_load > self.config.load_average_target as f64
            || dns_over;
        let under_target = latest.cpu_pct < self.config.cpu_target_pct * 0.85
            && latest.mem_pct < self.config.mem_target_pct * 0.85
            && latest.net_mbps < self.config.net_target_mbps * 0.85
            && latest.io_wait_pct < self.config.io_wait_target_pct * 0.85
            && normalized_load < (self.config.load_average_target as f64) * 0.85
            && dns_under;

        let emergency_brake = latest.cpu_pct > self.config.emergency_brake_pct
            || latest.mem_pct > self.config.emergency_brake_pct
            || latest.io_wait_pct > self.config.emergency_brake_pct;

        let mut workers = previous.workers;
        let mut delay_ms = previous.delay_ms;
        if over_target {
            workers = (workers / 2).max(1);
            delay_ms = (delay_ms * 2).clamp(50, 5_000);
        } else if under_target {
            workers = (workers + 1).min(self.workers_max.max(1));
            delay_ms = (delay_ms / 2).max(if workers >= self.workers_max { 0 } else { 0 });
        }

        let free_mem_ratio = (1.0 - latest.mem_pct / 100.0).clamp(0.1, 1.0);
        let batch_size = ((self.batch_size_base as f32 * free_mem_ratio) as usize)
            .clamp(1, self.batch_size_base.max(1) * 2);

        debug!(
            cpu_pct = latest.cpu_pct,
            mem_pct = latest.mem_pct,
            net_mbps = latest.net_mbps,
            io_wait_pct = latest.io_wait_pct,
            load_average = latest.load_average,
            dns_latency_ms = ?latest.dns_latency_ms,
            workers,
            batch_size,
            emergency_brake,
            "throttle tick"
        );

        Budget {
            workers,
            batch_size,
            delay_ms,
            emergency_brake,
        }
    }
}

/// Computes I/O-wait percentage from the delta between two `/proc/stat`
/// reads. Returns `None` (treated as 0%) off Linux or when `/proc/stat`
/// is unreadable, e.g. under a restrictive sandbox.
#[cfg(target_os = "linux")]
fn read_proc_stat_iowait(prev: &mut Option<(u64, u64)>) -> Option<f32> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    let line = content.lines().next()?;
    let mut parts = line.split_whitespace();
    if parts.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = parts.filter_map(|v| v.parse().ok()).collect();
    if values.len() < 5 {
        return None;
    }
    let idle = values[3];
    let iowait = values[4];
    let total: u64 = values.iter().sum();

    let result = match *prev {
        Some((prev_iowait, prev_total)) => {
            let delta_total = total.saturating_sub(prev_total);
            let delta_iowait = iowait.saturating_sub(prev_iowait);
            if delta_total == 0 {
                None
            } else {
                Some(delta_iowait as f32 / delta_total as f32 * 100.0)
            }
        }
        None => None,
    };
    let _ = idle;
    *prev = Some((iowait, total));
    result
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stat_iowait(_prev: &mut Option<(u64, u64)>) -> Option<f32> {
    None
}

/// Resolves a fixed external hostname with a bounded timeout and reports
/// the round-trip as a network-health proxy. Run off-thread so a stalled
/// resolver cannot hold up the throttle's sampling lock indefinitely.
fn probe_dns_latency() -> Option<f32> {
    use std::net::ToSocketAddrs;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let start = Instant::now();
        let ok = "one.one.one.one:443".to_socket_addrs().is_ok();
        let _ = tx.send(ok.then(|| start.elapsed()));
    });

    match rx.recv_timeout(Duration::from_millis(500)) {
        Ok(Some(elapsed)) => Some(elapsed.as_secs_f32() * 1000.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu_pct: f32, mem_pct: f32, net_mbps: f32) -> ThrottleSample {
        ThrottleSample {
            cpu_pct,
            mem_pct,
            net_mbps,
            io_wait_pct: 0.0,
            load_average: 0.0,
            dns_latency_ms: Some(10.0),
        }
    }

    fn throttle() -> AdaptiveThrottle {
        AdaptiveThrottle::new(ThrottleConfig::default(), 8, 64)
    }

    #[test]
    fn light_load_grows_workers_up_to_max() {
        let t = throttle();
        let mut budget = Budget::baseline(8, 64);
        for _ in 0..20 {
            budget = t.observe(sample(10.0, 10.0, 1.0));
        }
        assert_eq!(budget.workers, 8);
        assert!(!budget.emergency_brake);
    }

    #[test]
    fn heavy_load_trips_emergency_brake() {
        let t = throttle();
        let budget = t.observe(sample(98.0, 50.0, 1.0));
        assert!(budget.emergency_brake);
    }

    #[test]
    fn brake_clears_once_load_recovers() {
        let t = throttle();
        t.observe(sample(98.0, 50.0, 1.0));
        let budget = t.observe(sample(40.0, 40.0, 1.0));
        assert!(!budget.emergency_brake);
    }

    #[test]
    fn over_target_halves_workers() {
        let t = throttle();
        t.observe(sample(10.0, 10.0, 1.0));
        let budget = t.observe(sample(90.0, 90.0, 1.0));
        assert_eq!(budget.workers, 1.max(budget.workers));
        assert!(budget.workers <= 8);
    }

    #[test]
    fn high_io_wait_is_treated_as_over_target() {
        let t = throttle();
        t.observe(sample(10.0, 10.0, 1.0));
        let mut s = sample(10.0, 10.0, 1.0);
        s.io_wait_pct = 50.0;
        let budget = t.observe(s);
        assert!(budget.workers <= 8 && budget.workers > 0);
        assert!(budget.delay_ms > 0);
    }

    #[test]
    fn high_load_average_is_treated_as_over_target() {
        let t = throttle();
        t.observe(sample(10.0, 10.0, 1.0));
        let mut s = sample(10.0, 10.0, 1.0);
        s.load_average = 64.0; // far above 8 workers * load_average_target
        let budget = t.observe(s);
        assert!(budget.delay_ms > 0);
    }

    #[test]
    fn slow_dns_is_treated_as_over_target() {
        let t = throttle();
        t.observe(sample(10.0, 10.0, 1.0));
        let mut s = sample(10.0, 10.0, 1.0);
        s.dns_latency_ms = Some(5_000.0);
        let budget = t.observe(s);
        assert!(budget.delay_ms > 0);
    }

    #[test]
    fn stale_sample_reuses_last_budget() {
        let t = AdaptiveThrottle::new(ThrottleConfig::default(), 8, 64);
        let before = t.inner.lock().unwrap().last_budget;
        // System::cpus() is never empty in practice, so directly exercise
        // the reuse path via the internal derive helper instead.
        let window: VecDeque<ThrottleSample> = VecDeque::new();
        let budget = t.derive(&window, before);
        assert_eq!(budget, before);
    }
}
