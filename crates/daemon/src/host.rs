//! Host information

use crate::session::Session;
use crate::telemetry::HostCpuCache;
use kvmdeck_common::{DiskUsage, Error, HostInfo, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::warn;

const GIB: u64 = 1024 * 1024 * 1024;

pub fn parse_cpu_model(cpuinfo: &str) -> Option<String> {
    cpuinfo
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(key, _)| key.trim() == "model name")
        .map(|(_, value)| value.trim().to_string())
}

/// `(MemTotal, MemAvailable)` in KiB
pub fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let field = |name: &str| {
        meminfo
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(key, _)| key.trim() == name)
            .and_then(|(_, value)| value.split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    (field("MemTotal"), field("MemAvailable"))
}

/// Whole seconds since boot
pub fn parse_uptime(uptime: &str) -> u64 {
    uptime
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|secs| secs as u64)
        .unwrap_or(0)
}

pub fn parse_loadavg(loadavg: &str) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (slot, value) in out.iter_mut().zip(loadavg.split_whitespace()) {
        *slot = value.parse().unwrap_or(0.0);
    }
    out
}

/// Parse `df -P -B1` output, keeping block-device filesystems
pub fn parse_df(output: &str) -> Vec<DiskUsage> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 6 || !cols[0].starts_with("/dev/") {
                return None;
            }
            let bytes = |i: usize| cols[i].parse::<u64>().ok();
            let (total, used, available) = (bytes(1)?, bytes(2)?, bytes(3)?);
            Some(DiskUsage {
                mount: cols[5..].join(" "),
                device: cols[0].to_string(),
                total: total / GIB,
                used: used / GIB,
                available: available / GIB,
                percent: cols[4].trim_end_matches('%').parse().unwrap_or(0),
            })
        })
        .collect()
}

async fn disk_usage() -> Result<Vec<DiskUsage>> {
    let output = Command::new("df").args(["-P", "-B1"]).output().await?;
    if !output.status.success() {
        return Err(Error::Storage(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }
    Ok(parse_df(&String::from_utf8_lossy(&output.stdout)))
}

pub struct HostInspector {
    session: Session,
    proc_root: PathBuf,
    cpu: HostCpuCache,
}

impl HostInspector {
    pub fn new(session: Session, proc_root: PathBuf, cpu: HostCpuCache) -> Self {
        Self {
            session,
            proc_root,
            cpu,
        }
    }

    async fn proc_file(&self, file: &str) -> String {
        match tokio::fs::read_to_string(self.proc_root.join(file)).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read {}: {}", file, e);
                String::new()
            }
        }
    }

    pub async fn host_info(&self) -> Result<HostInfo> {
        let (hostname, node, vm_total, vm_running) = {
            let hv = self.session.acquire().await?;
            let hostname = hv.hostname().await?;
            let node = hv.node_info().await?;
            let names = hv.list_domains().await?;
            let mut running = 0;
            for name in &names {
                if hv.domain_state(name).await.map(|s| s.is_running()).unwrap_or(false) {
                    running += 1;
                }
            }
            (hostname, node, names.len(), running)
        };

        let (_, mem_available) = parse_meminfo(&self.proc_file("meminfo").await);
        let cpu_model = parse_cpu_model(&self.proc_file("cpuinfo").await).unwrap_or(node.cpu_model);
        let disks = disk_usage().await.unwrap_or_else(|e| {
            warn!("Failed to read filesystem usage: {}", e);
            Vec::new()
        });

        Ok(HostInfo {
            hostname,
            cpu_model,
            cpu_count: node.cpus,
            cpu_usage: self.cpu.percent(),
            memory_total: node.memory_kib / 1024,
            memory_free: mem_available / 1024,
            vm_running,
            vm_total,
            uptime: parse_uptime(&self.proc_file("uptime").await),
            load_avg: parse_loadavg(&self.proc_file("loadavg").await),
            disks,
        })
    }
}
