//! Periodic host and guest sampling
//!
//! The sampler runs on its own interval and only takes the session for the
//! RPCs it needs. Results land in read-mostly caches with their own locks so
//! request handlers never wait on the transport to report usage.

use crate::config::TelemetryConfig;
use crate::hypervisor::MemoryStats;
use crate::session::Session;
use chrono::{DateTime, Utc};
use kvmdeck_common::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Aggregate jiffies from the first line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

pub fn parse_proc_stat(text: &str) -> Result<CpuTimes> {
    let line = text
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| Error::Validation("no aggregate cpu line in stat".to_string()))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Validation(format!("bad cpu counter: {}", e)))?;
    if fields.len() < 4 {
        return Err(Error::Validation("too few cpu counters".to_string()));
    }
    // iowait counts as busy
    Ok(CpuTimes {
        idle: fields[3],
        total: fields.iter().sum(),
    })
}

fn round_percent(value: f64) -> f64 {
    ((value * 10.0).round() / 10.0).clamp(0.0, 100.0)
}

/// Busy share between two readings, one decimal, 0 when no time passed
pub fn cpu_percent_between(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle).min(total);
    round_percent((total - idle) as f64 / total as f64 * 100.0)
}

/// Guest CPU use as a share of its allocated vcpus
pub fn guest_cpu_percent(prev_ns: u64, cur_ns: u64, elapsed: Duration, vcpus: u32) -> f64 {
    let wall_ns = elapsed.as_nanos() as f64 * f64::from(vcpus.max(1));
    if wall_ns == 0.0 {
        return 0.0;
    }
    round_percent(cur_ns.saturating_sub(prev_ns) as f64 / wall_ns * 100.0)
}

/// Balloon estimate of memory in use
pub fn guest_memory_used_mib(stats: MemoryStats) -> Option<u64> {
    match (stats.available_kib, stats.unused_kib) {
        (Some(available), Some(unused)) => Some(available.saturating_sub(unused) / 1024),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HostCpuSample {
    pub percent: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Latest host CPU reading
#[derive(Clone, Default)]
pub struct HostCpuCache {
    inner: Arc<RwLock<Option<HostCpuSample>>>,
}

impl HostCpuCache {
    pub fn get(&self) -> Option<HostCpuSample> {
        *self.inner.read()
    }

    pub fn percent(&self) -> f64 {
        self.get().map(|s| s.percent).unwrap_or(0.0)
    }

    pub fn set(&self, percent: f64) {
        *self.inner.write() = Some(HostCpuSample {
            percent,
            sampled_at: Utc::now(),
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GuestUsage {
    /// Absent on the first observation
    pub cpu_percent: Option<f64>,
    pub mem_used_mib: Option<u64>,
    cpu_time_ns: u64,
    observed: Instant,
}

/// Latest per-machine readings, running machines only
#[derive(Clone, Default)]
pub struct GuestUsageCache {
    inner: Arc<RwLock<HashMap<String, GuestUsage>>>,
}

impl GuestUsageCache {
    pub fn get(&self, name: &str) -> Option<GuestUsage> {
        self.inner.read().get(name).copied()
    }

    fn snapshot(&self) -> HashMap<String, GuestUsage> {
        self.inner.read().clone()
    }

    fn replace(&self, samples: HashMap<String, GuestUsage>) {
        *self.inner.write() = samples;
    }
}

/// Raw readings of one running guest
#[derive(Debug, Clone, Copy)]
struct GuestReading {
    cpu_time_ns: u64,
    vcpus: u32,
    memory: MemoryStats,
}

pub struct TelemetrySampler {
    session: Session,
    config: TelemetryConfig,
    host: HostCpuCache,
    guests: GuestUsageCache,
}

impl TelemetrySampler {
    pub fn new(session: Session, config: TelemetryConfig, host: HostCpuCache, guests: GuestUsageCache) -> Self {
        Self {
            session,
            config,
            host,
            guests,
        }
    }

    async fn read_stat(&self) -> Result<CpuTimes> {
        let text = tokio::fs::read_to_string(self.config.proc_root.join("stat")).await?;
        parse_proc_stat(&text)
    }

    /// Two stat readings separated by the configured delay
    pub async fn sample_host(&self) -> Result<f64> {
        let before = self.read_stat().await?;
        sleep(Duration::from_millis(self.config.host_sample_delay_ms)).await;
        let after = self.read_stat().await?;
        let percent = cpu_percent_between(before, after);
        self.host.set(percent);
        trace!("Host CPU {:.1}%", percent);
        Ok(percent)
    }

    async fn read_guests(&self) -> Result<HashMap<String, GuestReading>> {
        let hv = self.session.acquire().await?;
        let mut readings = HashMap::new();
        for name in hv.list_domains().await? {
            // Machines can vanish between list and query
            let state = match hv.domain_state(&name).await {
                Ok(state) => state,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            if !state.is_running() {
                continue;
            }
            let stats = match hv.domain_stats(&name).await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            let memory = hv.memory_stats(&name).await.unwrap_or_default();
            readings.insert(
                name,
                GuestReading {
                    cpu_time_ns: stats.cpu_time_ns,
                    vcpus: stats.vcpus,
                    memory,
                },
            );
        }
        Ok(readings)
    }

    pub async fn sample_guests(&self) -> Result<usize> {
        let readings = self.read_guests().await?;
        let now = Instant::now();
        let previous = self.guests.snapshot();

        let samples: HashMap<String, GuestUsage> = readings
            .into_iter()
            .map(|(name, r)| {
                let cpu_percent = previous.get(&name).map(|p| {
                    guest_cpu_percent(p.cpu_time_ns, r.cpu_time_ns, now - p.observed, r.vcpus)
                });
                let usage = GuestUsage {
                    cpu_percent,
                    mem_used_mib: guest_memory_used_mib(r.memory),
                    cpu_time_ns: r.cpu_time_ns,
                    observed: now,
                };
                (name, usage)
            })
            .collect();
        let count = samples.len();
        self.guests.replace(samples);
        Ok(count)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("Telemetry sampler started ({} ms)", self.config.interval_ms);
        let mut ticker = interval(Duration::from_millis(self.config.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sample_host().await {
                warn!("Host sample failed: {}", e);
            }
            if let Err(e) = self.sample_guests().await {
                warn!("Guest sample failed: {}", e);
            }
        }
        info!("Telemetry sampler stopped");
    }
}
