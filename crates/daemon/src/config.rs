//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address
    pub listen: String,

    /// `text` or `json`
    pub log_format: String,

    /// Hypervisor connection
    pub hypervisor: HypervisorConfig,

    /// Disk and media locations
    pub storage: StorageConfig,

    /// Background sampling
    pub telemetry: TelemetryConfig,

    /// External clone utility
    pub clone: CloneConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            log_format: "text".to_string(),
            hypervisor: HypervisorConfig::default(),
            storage: StorageConfig::default(),
            telemetry: TelemetryConfig::default(),
            clone: CloneConfig::default(),
        }
    }
}

/// Hypervisor transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Connection URI
    pub uri: String,

    /// Status files written by the network driver's DHCP server
    pub lease_dir: PathBuf,

    /// Bound on liveness checks and reconnects
    pub connect_timeout_ms: u64,

    /// Bound on a single RPC
    pub rpc_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            lease_dir: PathBuf::from("/var/lib/libvirt/dnsmasq"),
            connect_timeout_ms: 2000,
            rpc_timeout_secs: 60,
        }
    }
}

impl HypervisorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root that all machine disk images must live under
    pub storage_root: PathBuf,

    /// Root that installation and driver media must live under
    pub media_root: PathBuf,

    /// Root that directory-backed pools must live under
    pub pool_root: PathBuf,

    /// Path to qemu-img
    pub qemu_img_binary: String,

    /// Listen address written into graphics stanzas
    pub graphics_listen: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_root: kvmdeck_common::default_storage_root(),
            media_root: kvmdeck_common::default_media_root(),
            pool_root: kvmdeck_common::default_pool_root(),
            qemu_img_binary: "qemu-img".to_string(),
            graphics_listen: "127.0.0.1".to_string(),
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Sampling period
    pub interval_ms: u64,

    /// Gap between the two host CPU readings of one sample
    pub host_sample_delay_ms: u64,

    /// Mount point of procfs
    pub proc_root: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            host_sample_delay_ms: 200,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Clone utility configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    /// Path to virt-clone
    pub binary: String,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            binary: "virt-clone".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
