//! libvirt-backed hypervisor transport
//!
//! Holds one persistent connection opened through the `virt` bindings. The
//! bindings block, so every call runs on the blocking pool, bounded by the
//! RPC timeout, while the caller keeps its session guard.

use crate::config::HypervisorConfig;
use crate::hypervisor::{Connector, DomainStats, Hypervisor, MemoryStats, NodeInfo, PoolInfo, VolumeInfo};
use async_trait::async_trait;
use kvmdeck_common::{Error, MachineState, ModifyScope, PowerAction, Result, XmlScope};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

type VirtResult<T> = std::result::Result<T, virt::error::Error>;

/// Objects a call names, used to label not-found and conflict errors
type Subject<'a> = &'a [(&'static str, &'a str)];

const CONNECT_FAILURES: &[&str] = &[
    "failed to connect to the hypervisor",
    "Failed to connect socket",
    "End of file while reading data",
    "no connection driver available",
    "Cannot recv data",
    "client socket is closed",
    "internal error: client",
];

const NOT_FOUND: &[(&str, &str)] = &[
    ("Domain snapshot not found", "snapshot"),
    ("Domain not found", "machine"),
    ("Network not found", "network"),
    ("Storage pool not found", "pool"),
    ("Storage volume not found", "volume"),
];

const NO_CURRENT_SNAPSHOT: &str = "does not have a current snapshot";

/// Map a binding error message onto the error taxonomy
fn classify(message: &str, subject: Subject<'_>) -> Error {
    let id_of = |kind: &str| {
        subject
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| id.to_string())
            .unwrap_or_else(|| message.to_string())
    };

    if CONNECT_FAILURES.iter().any(|p| message.contains(p)) {
        return Error::Connectivity(message.to_string());
    }
    if let Some((_, kind)) = NOT_FOUND.iter().find(|(p, _)| message.contains(p)) {
        return Error::not_found(kind, id_of(kind));
    }
    if message.contains("already exists") {
        if let Some((kind, id)) = subject.first() {
            let id: &str = if id.is_empty() { message } else { id };
            return Error::conflict(kind, id);
        }
    }
    Error::Hypervisor(message.to_string())
}

fn state_of(state: sys::virDomainState) -> MachineState {
    MachineState::from_code(state as i32)
}

fn device_flags(scope: ModifyScope) -> u32 {
    match scope {
        ModifyScope::Config => sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG,
        ModifyScope::LiveAndConfig => {
            sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE | sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG
        }
    }
}

fn xml_flags(scope: XmlScope) -> u32 {
    match scope {
        XmlScope::Current => 0,
        XmlScope::Inactive => sys::VIR_DOMAIN_XML_INACTIVE,
    }
}

fn memory_from(stats: &[virt::domain::MemoryStat]) -> MemoryStats {
    let find = |tag: u32| stats.iter().find(|s| s.tag == tag).map(|s| s.val);
    MemoryStats {
        available_kib: find(sys::VIR_DOMAIN_MEMORY_STAT_AVAILABLE as u32),
        unused_kib: find(sys::VIR_DOMAIN_MEMORY_STAT_UNUSED as u32),
    }
}

fn domain(conn: &Connect, name: &str) -> VirtResult<Domain> {
    Domain::lookup_by_name(conn, name)
}

fn snapshot(conn: &Connect, name: &str, snap: &str) -> VirtResult<DomainSnapshot> {
    DomainSnapshot::lookup_by_name(&domain(conn, name)?, snap, 0)
}

fn pool(conn: &Connect, name: &str) -> VirtResult<StoragePool> {
    StoragePool::lookup_by_name(conn, name)
}

fn volume(conn: &Connect, pool_name: &str, name: &str) -> VirtResult<StorageVol> {
    StorageVol::lookup_by_name(&pool(conn, pool_name)?, name)
}

fn power(dom: &Domain, action: PowerAction) -> VirtResult<()> {
    match action {
        PowerAction::Start => dom.create().map(|_| ()),
        PowerAction::Shutdown => dom.shutdown().map(|_| ()),
        PowerAction::Destroy => dom.destroy().map(|_| ()),
        PowerAction::Reboot => dom.reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT).map(|_| ()),
        PowerAction::Suspend => dom.suspend().map(|_| ()),
        PowerAction::Resume => dom.resume().map(|_| ()),
    }
}

/// One open connection to the management daemon
pub struct LibvirtTransport {
    conn: Mutex<Option<Arc<Connect>>>,
    uri: String,
    rpc_timeout: Duration,
}

impl LibvirtTransport {
    fn new(conn: Connect, config: &HypervisorConfig) -> Self {
        Self {
            conn: Mutex::new(Some(Arc::new(conn))),
            uri: config.uri.clone(),
            rpc_timeout: config.rpc_timeout(),
        }
    }

    /// Run one binding call on the blocking pool
    async fn call<T, F>(&self, op: &'static str, subject: Subject<'_>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connect) -> VirtResult<T> + Send + 'static,
    {
        let conn = self
            .conn
            .lock()
            .clone()
            .ok_or_else(|| Error::Connectivity(format!("connection to {} is closed", self.uri)))?;
        trace!("libvirt {}", op);

        let task = tokio::task::spawn_blocking(move || f(&conn));
        match timeout(self.rpc_timeout, task).await {
            Err(_) => Err(Error::Timeout {
                seconds: self.rpc_timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(Error::Hypervisor(format!("{} did not complete: {}", op, e))),
            Ok(Ok(Err(e))) => {
                let message = e.to_string();
                debug!("libvirt {} failed: {}", op, message);
                Err(classify(&message, subject))
            }
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

#[async_trait]
impl Hypervisor for LibvirtTransport {
    async fn ping(&self) -> Result<()> {
        let alive = self.call("is_alive", &[], |conn| conn.is_alive()).await?;
        if alive {
            Ok(())
        } else {
            Err(Error::Connectivity(format!("connection to {} is dead", self.uri)))
        }
    }

    async fn hostname(&self) -> Result<String> {
        self.call("hostname", &[], |conn| conn.get_hostname()).await
    }

    async fn node_info(&self) -> Result<NodeInfo> {
        self.call("node_info", &[], |conn| {
            let info = conn.get_node_info()?;
            Ok(NodeInfo {
                cpu_model: info.model,
                cpus: info.cpus,
                memory_kib: info.memory,
            })
        })
        .await
    }

    async fn list_domains(&self) -> Result<Vec<String>> {
        self.call("list_domains", &[], |conn| {
            let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
            conn.list_all_domains(flags)?
                .iter()
                .map(|d| d.get_name())
                .collect()
        })
        .await
    }

    async fn domain_uuid(&self, name: &str) -> Result<String> {
        let n = name.to_string();
        self.call("domain_uuid", &[("machine", name)], move |conn| {
            domain(conn, &n)?.get_uuid_string()
        })
        .await
    }

    async fn domain_state(&self, name: &str) -> Result<MachineState> {
        let n = name.to_string();
        self.call("domain_state", &[("machine", name)], move |conn| {
            let (state, _reason) = domain(conn, &n)?.get_state()?;
            Ok(state_of(state))
        })
        .await
    }

    async fn domain_stats(&self, name: &str) -> Result<DomainStats> {
        let n = name.to_string();
        self.call("domain_stats", &[("machine", name)], move |conn| {
            let info = domain(conn, &n)?.get_info()?;
            Ok(DomainStats {
                cpu_time_ns: info.cpu_time,
                vcpus: info.nr_virt_cpu,
            })
        })
        .await
    }

    async fn domain_xml(&self, name: &str, scope: XmlScope) -> Result<String> {
        let n = name.to_string();
        self.call("domain_xml", &[("machine", name)], move |conn| {
            domain(conn, &n)?.get_xml_desc(xml_flags(scope))
        })
        .await
    }

    async fn define_xml(&self, xml: &str) -> Result<()> {
        let doc = xml.to_string();
        self.call("define_xml", &[], move |conn| Domain::define_xml(conn, &doc).map(|_| ()))
            .await
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        let n = name.to_string();
        self.call("undefine", &[("machine", name)], move |conn| {
            let dom = domain(conn, &n)?;
            match dom.undefine_flags(sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA) {
                Ok(_) => Ok(()),
                Err(e) => {
                    warn!("Undefine with snapshot metadata failed for {}: {}", n, e);
                    dom.undefine().map(|_| ())
                }
            }
        })
        .await
    }

    async fn power(&self, name: &str, action: PowerAction) -> Result<()> {
        let n = name.to_string();
        self.call("power", &[("machine", name)], move |conn| power(&domain(conn, &n)?, action))
            .await
    }

    async fn autostart(&self, name: &str) -> Result<bool> {
        let n = name.to_string();
        self.call("autostart", &[("machine", name)], move |conn| {
            domain(conn, &n)?.get_autostart()
        })
        .await
    }

    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        let n = name.to_string();
        self.call("set_autostart", &[("machine", name)], move |conn| {
            domain(conn, &n)?.set_autostart(enabled).map(|_| ())
        })
        .await
    }

    async fn rename(&self, name: &str, new_name: &str) -> Result<()> {
        let (n, to) = (name.to_string(), new_name.to_string());
        self.call("rename", &[("machine", new_name)], move |conn| {
            domain(conn, &n)?.rename(&to, 0).map(|_| ())
        })
        .await
    }

    async fn attach_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()> {
        let (n, doc) = (name.to_string(), xml.to_string());
        self.call("attach_device", &[("machine", name)], move |conn| {
            domain(conn, &n)?
                .attach_device_flags(&doc, device_flags(scope))
                .map(|_| ())
        })
        .await
    }

    async fn detach_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()> {
        let (n, doc) = (name.to_string(), xml.to_string());
        self.call("detach_device", &[("machine", name)], move |conn| {
            domain(conn, &n)?
                .detach_device_flags(&doc, device_flags(scope))
                .map(|_| ())
        })
        .await
    }

    async fn update_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()> {
        let (n, doc) = (name.to_string(), xml.to_string());
        self.call("update_device", &[("machine", name)], move |conn| {
            domain(conn, &n)?
                .update_device_flags(&doc, device_flags(scope))
                .map(|_| ())
        })
        .await
    }

    async fn memory_stats(&self, name: &str) -> Result<MemoryStats> {
        let n = name.to_string();
        self.call("memory_stats", &[("machine", name)], move |conn| {
            Ok(memory_from(&domain(conn, &n)?.memory_stats(0)?))
        })
        .await
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<String>> {
        let n = name.to_string();
        self.call("list_snapshots", &[("machine", name)], move |conn| {
            domain(conn, &n)?
                .list_all_snapshots(0)?
                .iter()
                .map(|s| s.get_name())
                .collect()
        })
        .await
    }

    async fn current_snapshot(&self, name: &str) -> Result<Option<String>> {
        let n = name.to_string();
        let current = self
            .call("current_snapshot", &[("machine", name)], move |conn| {
                let dom = domain(conn, &n)?;
                match DomainSnapshot::current(&dom, 0) {
                    Ok(snap) => snap.get_name().map(Some),
                    Err(e) if e.to_string().contains(NO_CURRENT_SNAPSHOT) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await;
        match current {
            Err(Error::NotFound { ref kind, .. }) if kind == "snapshot" => Ok(None),
            other => other,
        }
    }

    async fn snapshot_xml(&self, name: &str, snap: &str) -> Result<String> {
        let (n, s) = (name.to_string(), snap.to_string());
        self.call("snapshot_xml", &[("machine", name), ("snapshot", snap)], move |conn| {
            snapshot(conn, &n, &s)?.get_xml_desc(0)
        })
        .await
    }

    async fn create_snapshot(&self, name: &str, xml: &str) -> Result<()> {
        let (n, doc) = (name.to_string(), xml.to_string());
        self.call("create_snapshot", &[("machine", name)], move |conn| {
            DomainSnapshot::create_xml(&domain(conn, &n)?, &doc, 0).map(|_| ())
        })
        .await
    }

    async fn delete_snapshot(&self, name: &str, snap: &str) -> Result<()> {
        let (n, s) = (name.to_string(), snap.to_string());
        self.call("delete_snapshot", &[("machine", name), ("snapshot", snap)], move |conn| {
            snapshot(conn, &n, &s)?.delete(0).map(|_| ())
        })
        .await
    }

    async fn revert_snapshot(&self, name: &str, snap: &str) -> Result<()> {
        let (n, s) = (name.to_string(), snap.to_string());
        self.call("revert_snapshot", &[("machine", name), ("snapshot", snap)], move |conn| {
            snapshot(conn, &n, &s)?.revert(0).map(|_| ())
        })
        .await
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.call("list_networks", &[], |conn| {
            conn.list_all_networks(0)?.iter().map(|n| n.get_name()).collect()
        })
        .await
    }

    async fn network_active(&self, name: &str) -> Result<bool> {
        let n = name.to_string();
        self.call("network_active", &[("network", name)], move |conn| {
            Network::lookup_by_name(conn, &n)?.is_active()
        })
        .await
    }

    async fn network_xml(&self, name: &str) -> Result<String> {
        let n = name.to_string();
        self.call("network_xml", &[("network", name)], move |conn| {
            Network::lookup_by_name(conn, &n)?.get_xml_desc(0)
        })
        .await
    }

    async fn define_network(&self, xml: &str) -> Result<()> {
        let doc = xml.to_string();
        self.call("define_network", &[("network", "")], move |conn| {
            Network::define_xml(conn, &doc).map(|_| ())
        })
        .await
    }

    async fn start_network(&self, name: &str) -> Result<()> {
        let n = name.to_string();
        self.call("start_network", &[("network", name)], move |conn| {
            Network::lookup_by_name(conn, &n)?.create().map(|_| ())
        })
        .await
    }

    async fn stop_network(&self, name: &str) -> Result<()> {
        let n = name.to_string();
        self.call("stop_network", &[("network", name)], move |conn| {
            Network::lookup_by_name(conn, &n)?.destroy().map(|_| ())
        })
        .await
    }

    async fn undefine_network(&self, name: &str) -> Result<()> {
        let n = name.to_string();
        self.call("undefine_network", &[("network", name)], move |conn| {
            Network::lookup_by_name(conn, &n)?.undefine().map(|_| ())
        })
        .await
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        self.call("list_pools", &[], |conn| {
            conn.list_all_storage_pools(0)?.iter().map(|p| p.get_name()).collect()
        })
        .await
    }

    async fn pool_info(&self, name: &str) -> Result<PoolInfo> {
        let n = name.to_string();
        self.call("pool_info", &[("pool", name)], move |conn| {
            let info = pool(conn, &n)?.get_info()?;
            Ok(PoolInfo {
                active: info.state == sys::VIR_STORAGE_POOL_RUNNING,
                capacity: info.capacity,
                allocation: info.allocation,
                available: info.available,
            })
        })
        .await
    }

    async fn pool_xml(&self, name: &str) -> Result<String> {
        let n = name.to_string();
        self.call("pool_xml", &[("pool", name)], move |conn| pool(conn, &n)?.get_xml_desc(0))
            .await
    }

    async fn define_pool(&self, xml: &str) -> Result<()> {
        let doc = xml.to_string();
        self.call("define_pool", &[("pool", "")], move |conn| {
            StoragePool::define_xml(conn, &doc, 0).map(|_| ())
        })
        .await
    }

    async fn start_pool(&self, name: &str) -> Result<()> {
        let n = name.to_string();
        self.call("start_pool", &[("pool", name)], move |conn| {
            pool(conn, &n)?.create(0).map(|_| ())
        })
        .await
    }

    async fn stop_pool(&self, name: &str) -> Result<()> {
        let n = name.to_string();
        self.call("stop_pool", &[("pool", name)], move |conn| {
            pool(conn, &n)?.destroy().map(|_| ())
        })
        .await
    }

    async fn undefine_pool(&self, name: &str) -> Result<()> {
        let n = name.to_string();
        self.call("undefine_pool", &[("pool", name)], move |conn| {
            pool(conn, &n)?.undefine().map(|_| ())
        })
        .await
    }

    async fn refresh_pool(&self, name: &str) -> Result<()> {
        let n = name.to_string();
        self.call("refresh_pool", &[("pool", name)], move |conn| {
            pool(conn, &n)?.refresh(0).map(|_| ())
        })
        .await
    }

    async fn list_volumes(&self, pool_name: &str) -> Result<Vec<String>> {
        let p = pool_name.to_string();
        self.call("list_volumes", &[("pool", pool_name)], move |conn| {
            pool(conn, &p)?
                .list_all_volumes(0)?
                .iter()
                .map(|v| v.get_name())
                .collect()
        })
        .await
    }

    async fn volume_info(&self, pool_name: &str, name: &str) -> Result<VolumeInfo> {
        let (p, n) = (pool_name.to_string(), name.to_string());
        self.call("volume_info", &[("pool", pool_name), ("volume", name)], move |conn| {
            let vol = volume(conn, &p, &n)?;
            let info = vol.get_info()?;
            Ok(VolumeInfo {
                kind: info.kind as u32,
                path: vol.get_path()?,
                capacity: info.capacity,
                allocation: info.allocation,
            })
        })
        .await
    }

    async fn create_volume(&self, pool_name: &str, xml: &str) -> Result<()> {
        let (p, doc) = (pool_name.to_string(), xml.to_string());
        self.call("create_volume", &[("volume", ""), ("pool", pool_name)], move |conn| {
            StorageVol::create_xml(&pool(conn, &p)?, &doc, 0).map(|_| ())
        })
        .await
    }

    async fn delete_volume(&self, pool_name: &str, name: &str) -> Result<()> {
        let (p, n) = (pool_name.to_string(), name.to_string());
        self.call("delete_volume", &[("pool", pool_name), ("volume", name)], move |conn| {
            volume(conn, &p, &n)?.delete(0).map(|_| ())
        })
        .await
    }

    async fn close(&self) {
        let Some(conn) = self.conn.lock().take() else {
            return;
        };
        let uri = self.uri.clone();
        let closed = tokio::task::spawn_blocking(move || match Arc::try_unwrap(conn) {
            Ok(mut conn) => conn.close().map(|_| ()),
            // A call still holds a reference; the last one drops it
            Err(_) => Ok(()),
        })
        .await;
        match closed {
            Ok(Ok(())) => debug!("Closed connection to {}", uri),
            Ok(Err(e)) => warn!("Closing connection to {} failed: {}", uri, e),
            Err(e) => warn!("Closing connection to {} did not complete: {}", uri, e),
        }
    }
}

/// Opens connections for the session supervisor
pub struct LibvirtConnector {
    config: HypervisorConfig,
}

impl LibvirtConnector {
    pub fn new(config: HypervisorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for LibvirtConnector {
    async fn connect(&self) -> Result<Box<dyn Hypervisor>> {
        let uri = self.config.uri.clone();
        let bound = self.config.connect_timeout();

        let opening = tokio::task::spawn_blocking(move || Connect::open(Some(uri.as_str())));
        let conn = match timeout(bound, opening).await {
            Ok(Ok(Ok(conn))) => conn,
            Ok(Ok(Err(e))) => {
                return Err(Error::Connectivity(format!(
                    "cannot open {}: {}",
                    self.config.uri, e
                )))
            }
            Ok(Err(e)) => return Err(Error::Connectivity(format!("connect did not complete: {}", e))),
            Err(_) => {
                return Err(Error::Connectivity(format!(
                    "no answer from {} within {:?}",
                    self.config.uri, bound
                )))
            }
        };

        info!("Connected to hypervisor at {}", self.config.uri);
        Ok(Box::new(LibvirtTransport::new(conn, &self.config)))
    }
}
