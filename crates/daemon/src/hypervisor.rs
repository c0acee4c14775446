//! Hypervisor transport interface
//!
//! Every call here is one RPC against the management daemon. Callers reach a
//! transport only through [`crate::session::Session::acquire`], which
//! serializes them.

use async_trait::async_trait;
use kvmdeck_common::{MachineState, ModifyScope, PowerAction, Result, XmlScope};

/// Host node capacity as reported by the daemon
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub cpu_model: String,
    pub cpus: u32,
    pub memory_kib: u64,
}

/// Cumulative CPU counters of one domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainStats {
    pub cpu_time_ns: u64,
    pub vcpus: u32,
}

/// Balloon driver statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub available_kib: Option<u64>,
    pub unused_kib: Option<u64>,
}

/// Pool state and sizes in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolInfo {
    pub active: bool,
    pub capacity: u64,
    pub allocation: u64,
    pub available: u64,
}

/// Volume kind code and sizes in bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    pub kind: u32,
    pub path: String,
    pub capacity: u64,
    pub allocation: u64,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Cheap round trip used as a liveness check
    async fn ping(&self) -> Result<()>;

    async fn hostname(&self) -> Result<String>;
    async fn node_info(&self) -> Result<NodeInfo>;

    /// Names of all defined domains, running or not
    async fn list_domains(&self) -> Result<Vec<String>>;
    async fn domain_uuid(&self, name: &str) -> Result<String>;
    async fn domain_state(&self, name: &str) -> Result<MachineState>;
    async fn domain_stats(&self, name: &str) -> Result<DomainStats>;
    async fn domain_xml(&self, name: &str, scope: XmlScope) -> Result<String>;

    async fn define_xml(&self, xml: &str) -> Result<()>;
    /// Undefine including snapshot metadata
    async fn undefine(&self, name: &str) -> Result<()>;
    async fn power(&self, name: &str, action: PowerAction) -> Result<()>;
    async fn autostart(&self, name: &str) -> Result<bool>;
    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()>;
    async fn rename(&self, name: &str, new_name: &str) -> Result<()>;

    async fn attach_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()>;
    async fn detach_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()>;
    async fn update_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()>;

    async fn memory_stats(&self, name: &str) -> Result<MemoryStats>;

    async fn list_snapshots(&self, name: &str) -> Result<Vec<String>>;
    async fn current_snapshot(&self, name: &str) -> Result<Option<String>>;
    async fn snapshot_xml(&self, name: &str, snapshot: &str) -> Result<String>;
    async fn create_snapshot(&self, name: &str, xml: &str) -> Result<()>;
    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;
    async fn revert_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    async fn list_networks(&self) -> Result<Vec<String>>;
    async fn network_active(&self, name: &str) -> Result<bool>;
    async fn network_xml(&self, name: &str) -> Result<String>;
    async fn define_network(&self, xml: &str) -> Result<()>;
    async fn start_network(&self, name: &str) -> Result<()>;
    async fn stop_network(&self, name: &str) -> Result<()>;
    async fn undefine_network(&self, name: &str) -> Result<()>;

    async fn list_pools(&self) -> Result<Vec<String>>;
    async fn pool_info(&self, name: &str) -> Result<PoolInfo>;
    async fn pool_xml(&self, name: &str) -> Result<String>;
    async fn define_pool(&self, xml: &str) -> Result<()>;
    async fn start_pool(&self, name: &str) -> Result<()>;
    async fn stop_pool(&self, name: &str) -> Result<()>;
    async fn undefine_pool(&self, name: &str) -> Result<()>;
    /// Rescan the pool's target for volumes created outside the daemon
    async fn refresh_pool(&self, name: &str) -> Result<()>;

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;
    async fn volume_info(&self, pool: &str, name: &str) -> Result<VolumeInfo>;
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()>;
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;

    /// Release the transport before it is discarded
    async fn close(&self) {}
}

/// Establishes fresh transports for the session supervisor
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Hypervisor>>;
}
