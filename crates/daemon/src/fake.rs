//! In-memory hypervisor for tests

use crate::clone::Cloner;
use crate::hypervisor::{Connector, DomainStats, Hypervisor, MemoryStats, NodeInfo, PoolInfo, VolumeInfo};
use crate::images::ImageTool;
use crate::session::Session;
use async_trait::async_trait;
use kvmdeck_common::definition::{self, Definition};
use kvmdeck_common::resources;
use kvmdeck_common::{Error, MachineState, ModifyScope, PowerAction, Result, XmlScope};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub xml: String,
    pub state: MachineState,
    pub autostart: bool,
    pub stats: DomainStats,
    pub memory: MemoryStats,
    /// Snapshot name to snapshot document, in creation order
    pub snapshots: Vec<(String, String)>,
    pub current: Option<String>,
}

impl FakeDomain {
    fn new(xml: String, state: MachineState) -> Self {
        Self {
            xml,
            state,
            autostart: false,
            stats: DomainStats {
                cpu_time_ns: 0,
                vcpus: 1,
            },
            memory: MemoryStats::default(),
            snapshots: Vec::new(),
            current: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeNetwork {
    pub xml: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct FakePool {
    pub xml: String,
    pub info: PoolInfo,
    pub refreshes: u32,
    pub volumes: BTreeMap<String, VolumeInfo>,
}

#[derive(Default)]
struct FakeState {
    domains: BTreeMap<String, FakeDomain>,
    networks: BTreeMap<String, FakeNetwork>,
    pools: BTreeMap<String, FakePool>,
    calls: Vec<String>,
    failing: HashSet<String>,
    broken: HashSet<u64>,
    refuse: bool,
    connects: u64,
    closed: u64,
    active: u32,
    max_active: u32,
}

/// A fake hypervisor daemon; clones share state
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    state: Arc<Mutex<FakeState>>,
}

pub fn domain_xml(name: &str, body: &str) -> String {
    format!(
        "<domain type='kvm'>\n  <name>{}</name>\n  <uuid>00000000-0000-0000-0000-{:012}</uuid>\n  <memory unit='KiB'>1048576</memory>\n  <vcpu placement='static'>1</vcpu>\n  <os>\n    <type arch='x86_64' machine='pc-i440fx-8.0'>hvm</type>\n    <boot dev='hd'/>\n  </os>\n  <devices>\n{}  </devices>\n</domain>\n",
        name,
        name.len(),
        body
    )
}

pub fn network_xml(name: &str, bridge: &str) -> String {
    format!(
        "<network>\n  <name>{}</name>\n  <uuid>11111111-0000-0000-0000-{:012}</uuid>\n  <forward mode='nat'/>\n  <bridge name='{}' stp='on' delay='0'/>\n  <ip address='192.168.122.1' netmask='255.255.255.0'/>\n</network>\n",
        name,
        name.len(),
        bridge
    )
}

pub fn pool_xml(name: &str, path: &str) -> String {
    format!(
        "<pool type='dir'>\n  <name>{}</name>\n  <uuid>22222222-0000-0000-0000-{:012}</uuid>\n  <target>\n    <path>{}</path>\n  </target>\n</pool>\n",
        name,
        name.len(),
        path
    )
}

/// Text of the first `<tag>` element, enough for the documents built here
fn element_text(xml: &str, tag: &str) -> Option<String> {
    let open = xml.find(&format!("<{}", tag))?;
    let start = open + xml[open..].find('>')? + 1;
    let end = start + xml[start..].find(&format!("</{}>", tag))?;
    Some(xml[start..end].trim().to_string())
}

fn wrap_fragment(fragment: &str) -> String {
    format!("<domain><memory>0</memory><devices>{}</devices></domain>", fragment)
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Session {
        Session::new(Arc::new(self.clone()), Duration::from_millis(500))
    }

    pub fn add_domain(&self, name: &str, xml: String, state: MachineState) {
        self.state
            .lock()
            .domains
            .insert(name.to_string(), FakeDomain::new(xml, state));
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.state.lock().domains.get(name).cloned()
    }

    pub fn update<F: FnOnce(&mut FakeDomain)>(&self, name: &str, f: F) {
        if let Some(d) = self.state.lock().domains.get_mut(name) {
            f(d);
        }
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.state.lock().domains.contains_key(name)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make the named operation fail until cleared; `"op target"` fails it
    /// for one target only
    pub fn fail(&self, op: &str) {
        self.state.lock().failing.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.state.lock().failing.remove(op);
    }

    pub fn break_connections(&self) {
        let mut s = self.state.lock();
        let ids: Vec<u64> = (1..=s.connects).collect();
        s.broken.extend(ids);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    pub fn closed_connections(&self) -> u64 {
        self.state.lock().closed
    }

    pub fn enter(&self) {
        let mut s = self.state.lock();
        s.active += 1;
        s.max_active = s.max_active.max(s.active);
    }

    pub fn leave(&self) {
        self.state.lock().active -= 1;
    }

    pub fn max_concurrency(&self) -> u32 {
        self.state.lock().max_active
    }

    pub fn add_network(&self, name: &str, xml: String, active: bool) {
        self.state
            .lock()
            .networks
            .insert(name.to_string(), FakeNetwork { xml, active });
    }

    pub fn network(&self, name: &str) -> Option<FakeNetwork> {
        self.state.lock().networks.get(name).cloned()
    }

    pub fn add_pool(&self, name: &str, xml: String, info: PoolInfo) {
        self.state.lock().pools.insert(
            name.to_string(),
            FakePool {
                xml,
                info,
                refreshes: 0,
                volumes: BTreeMap::new(),
            },
        );
    }

    pub fn pool(&self, name: &str) -> Option<FakePool> {
        self.state.lock().pools.get(name).cloned()
    }

    pub fn add_volume(&self, pool: &str, name: &str, info: VolumeInfo) {
        if let Some(p) = self.state.lock().pools.get_mut(pool) {
            p.volumes.insert(name.to_string(), info);
        }
    }

    /// Copy a domain under a new name, as a clone utility would
    pub fn clone_domain(&self, source: &str, new_name: &str) -> Result<()> {
        let mut s = self.state.lock();
        let src = s
            .domains
            .get(source)
            .cloned()
            .ok_or_else(|| Error::not_found("machine", source))?;
        let xml = definition::patch_scalar(&src.xml, "name", new_name)?;
        s.domains.insert(
            new_name.to_string(),
            FakeDomain {
                xml,
                state: MachineState::Shutoff,
                snapshots: Vec::new(),
                current: None,
                ..src
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Connector for FakeHypervisor {
    async fn connect(&self) -> Result<Box<dyn Hypervisor>> {
        let mut s = self.state.lock();
        if s.refuse {
            return Err(Error::Connectivity("connection refused".to_string()));
        }
        s.connects += 1;
        Ok(Box::new(FakeConnection {
            id: s.connects,
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    id: u64,
    state: Arc<Mutex<FakeState>>,
}

fn scope_label(scope: ModifyScope) -> &'static str {
    match scope {
        ModifyScope::Config => "config",
        ModifyScope::LiveAndConfig => "live+config",
    }
}

impl FakeConnection {
    /// Record a call and apply failure injection, by operation or by call
    fn call(&self, op: &str, detail: &str) -> Result<parking_lot::MutexGuard<'_, FakeState>> {
        let mut s = self.state.lock();
        let entry = format!("{} {}", op, detail).trim_end().to_string();
        let rejected = s.failing.contains(op) || s.failing.contains(&entry);
        s.calls.push(entry);
        if rejected {
            return Err(Error::Hypervisor(format!("{} rejected", op)));
        }
        Ok(s)
    }

    fn with_domain<T>(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&mut FakeDomain) -> Result<T>,
    ) -> Result<T> {
        let mut s = self.call(op, name)?;
        let d = s
            .domains
            .get_mut(name)
            .ok_or_else(|| Error::not_found("machine", name))?;
        f(d)
    }

    fn with_network<T>(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&mut FakeNetwork) -> Result<T>,
    ) -> Result<T> {
        let mut s = self.call(op, name)?;
        let n = s
            .networks
            .get_mut(name)
            .ok_or_else(|| Error::not_found("network", name))?;
        f(n)
    }

    fn with_pool<T>(
        &self,
        op: &str,
        detail: &str,
        name: &str,
        f: impl FnOnce(&mut FakePool) -> Result<T>,
    ) -> Result<T> {
        let mut s = self.call(op, detail)?;
        let p = s
            .pools
            .get_mut(name)
            .ok_or_else(|| Error::not_found("pool", name))?;
        f(p)
    }

    fn device_call<T>(
        &self,
        op: &str,
        name: &str,
        scope: ModifyScope,
        f: impl FnOnce(&mut FakeDomain) -> Result<T>,
    ) -> Result<T> {
        let mut s = self.call(op, &format!("{} {}", name, scope_label(scope)))?;
        let d = s
            .domains
            .get_mut(name)
            .ok_or_else(|| Error::not_found("machine", name))?;
        if scope.is_live() && !d.state.is_running() {
            return Err(Error::Hypervisor("domain is not running".to_string()));
        }
        f(d)
    }
}

#[async_trait]
impl Hypervisor for FakeConnection {
    async fn ping(&self) -> Result<()> {
        if self.state.lock().broken.contains(&self.id) {
            return Err(Error::Connectivity("broken pipe".to_string()));
        }
        Ok(())
    }

    async fn hostname(&self) -> Result<String> {
        Ok("fakehost".to_string())
    }

    async fn node_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo {
            cpu_model: "x86_64".to_string(),
            cpus: 8,
            memory_kib: 16 * 1024 * 1024,
        })
    }

    async fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().domains.keys().cloned().collect())
    }

    async fn domain_uuid(&self, name: &str) -> Result<String> {
        self.with_domain("domuuid", name, |d| {
            Ok(Definition::parse(&d.xml)?.uuid().unwrap_or_default())
        })
    }

    async fn domain_state(&self, name: &str) -> Result<MachineState> {
        self.with_domain("domstate", name, |d| Ok(d.state))
    }

    async fn domain_stats(&self, name: &str) -> Result<DomainStats> {
        self.with_domain("domstats", name, |d| Ok(d.stats))
    }

    async fn domain_xml(&self, name: &str, _scope: XmlScope) -> Result<String> {
        self.with_domain("dumpxml", name, |d| Ok(d.xml.clone()))
    }

    async fn define_xml(&self, xml: &str) -> Result<()> {
        let name = Definition::parse(xml)?
            .name()
            .ok_or_else(|| Error::Definition("missing <name>".to_string()))?;
        let mut s = self.call("define", &name)?;
        if let Some(d) = s.domains.get_mut(&name) {
            d.xml = xml.to_string();
            return Ok(());
        }
        s.domains
            .insert(name, FakeDomain::new(xml.to_string(), MachineState::Shutoff));
        Ok(())
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        let mut s = self.call("undefine", name)?;
        s.domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("machine", name))
    }

    async fn power(&self, name: &str, action: PowerAction) -> Result<()> {
        self.with_domain(&format!("power:{}", action), name, |d| {
            d.state = match (action, d.state) {
                (PowerAction::Start, MachineState::Running) => {
                    return Err(Error::Hypervisor("domain is already active".to_string()))
                }
                (PowerAction::Start, _) | (PowerAction::Resume, _) | (PowerAction::Reboot, _) => {
                    MachineState::Running
                }
                (PowerAction::Suspend, _) => MachineState::Paused,
                (PowerAction::Shutdown, _) | (PowerAction::Destroy, _) => MachineState::Shutoff,
            };
            Ok(())
        })
    }

    async fn autostart(&self, name: &str) -> Result<bool> {
        self.with_domain("autostart", name, |d| Ok(d.autostart))
    }

    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        self.with_domain("set_autostart", name, |d| {
            d.autostart = enabled;
            Ok(())
        })
    }

    async fn rename(&self, name: &str, new_name: &str) -> Result<()> {
        let mut s = self.call("rename", name)?;
        if s.domains.contains_key(new_name) {
            return Err(Error::conflict("machine", new_name));
        }
        let mut d = s
            .domains
            .remove(name)
            .ok_or_else(|| Error::not_found("machine", name))?;
        d.xml = definition::patch_scalar(&d.xml, "name", new_name)?;
        s.domains.insert(new_name.to_string(), d);
        Ok(())
    }

    async fn attach_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()> {
        self.device_call("attach_device", name, scope, |d| {
            let at = d
                .xml
                .rfind("</devices>")
                .ok_or_else(|| Error::Definition("missing <devices>".to_string()))?;
            d.xml.insert_str(at, &format!("{}\n  ", xml.trim_end()));
            Ok(())
        })
    }

    async fn detach_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()> {
        self.device_call("detach_device", name, scope, |d| {
            if !d.xml.contains(xml) {
                return Err(Error::Hypervisor("device not found".to_string()));
            }
            d.xml = d.xml.replacen(xml, "", 1);
            Ok(())
        })
    }

    async fn update_device(&self, name: &str, xml: &str, scope: ModifyScope) -> Result<()> {
        self.device_call("update_device", name, scope, |d| {
            let wrapped = wrap_fragment(xml);
            let target = Definition::parse(&wrapped)?
                .disks()
                .into_iter()
                .next()
                .map(|disk| disk.target)
                .ok_or_else(|| Error::Hypervisor("not a disk".to_string()))?;
            let existing = Definition::parse(&d.xml)?
                .disk_fragment(&target)
                .ok_or_else(|| Error::Hypervisor(format!("no disk at {}", target)))?;
            d.xml = d.xml.replacen(&existing, xml.trim_end(), 1);
            Ok(())
        })
    }

    async fn memory_stats(&self, name: &str) -> Result<MemoryStats> {
        self.with_domain("dommemstat", name, |d| Ok(d.memory))
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<String>> {
        self.with_domain("snapshot_list", name, |d| {
            Ok(d.snapshots.iter().map(|(n, _)| n.clone()).collect())
        })
    }

    async fn current_snapshot(&self, name: &str) -> Result<Option<String>> {
        self.with_domain("snapshot_current", name, |d| Ok(d.current.clone()))
    }

    async fn snapshot_xml(&self, name: &str, snapshot: &str) -> Result<String> {
        self.with_domain("snapshot_xml", name, |d| {
            d.snapshots
                .iter()
                .find(|(n, _)| n == snapshot)
                .map(|(_, xml)| xml.clone())
                .ok_or_else(|| Error::not_found("snapshot", snapshot))
        })
    }

    async fn create_snapshot(&self, name: &str, xml: &str) -> Result<()> {
        self.with_domain("snapshot_create", name, |d| {
            let meta = definition::parse_snapshot(xml)?;
            if d.snapshots.iter().any(|(n, _)| *n == meta.name) {
                return Err(Error::conflict("snapshot", meta.name));
            }
            let stored = xml.replace(
                "</domainsnapshot>",
                &format!(
                    "  <state>{}</state>\n  <creationTime>{}</creationTime>\n</domainsnapshot>",
                    d.state,
                    1_700_000_000 + d.snapshots.len() as i64
                ),
            );
            d.snapshots.push((meta.name.clone(), stored));
            d.current = Some(meta.name);
            Ok(())
        })
    }

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        self.with_domain("snapshot_delete", name, |d| {
            let before = d.snapshots.len();
            d.snapshots.retain(|(n, _)| n != snapshot);
            if d.snapshots.len() == before {
                return Err(Error::not_found("snapshot", snapshot));
            }
            if d.current.as_deref() == Some(snapshot) {
                d.current = None;
            }
            Ok(())
        })
    }

    async fn revert_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        self.with_domain("snapshot_revert", name, |d| {
            if !d.snapshots.iter().any(|(n, _)| n == snapshot) {
                return Err(Error::not_found("snapshot", snapshot));
            }
            d.current = Some(snapshot.to_string());
            Ok(())
        })
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.call("net_list", "")?.networks.keys().cloned().collect())
    }

    async fn network_active(&self, name: &str) -> Result<bool> {
        self.with_network("net_active", name, |n| Ok(n.active))
    }

    async fn network_xml(&self, name: &str) -> Result<String> {
        self.with_network("net_xml", name, |n| Ok(n.xml.clone()))
    }

    async fn define_network(&self, xml: &str) -> Result<()> {
        let name = element_text(xml, "name")
            .ok_or_else(|| Error::Definition("missing <name>".to_string()))?;
        let mut s = self.call("net_define", &name)?;
        if s.networks.contains_key(&name) {
            return Err(Error::conflict("network", name));
        }
        s.networks.insert(
            name,
            FakeNetwork {
                xml: xml.to_string(),
                active: false,
            },
        );
        Ok(())
    }

    async fn start_network(&self, name: &str) -> Result<()> {
        self.with_network("net_start", name, |n| {
            if n.active {
                return Err(Error::Hypervisor("network is already active".to_string()));
            }
            n.active = true;
            Ok(())
        })
    }

    async fn stop_network(&self, name: &str) -> Result<()> {
        self.with_network("net_stop", name, |n| {
            if !n.active {
                return Err(Error::Hypervisor("network is not active".to_string()));
            }
            n.active = false;
            Ok(())
        })
    }

    async fn undefine_network(&self, name: &str) -> Result<()> {
        let mut s = self.call("net_undefine", name)?;
        s.networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("network", name))
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(self.call("pool_list", "")?.pools.keys().cloned().collect())
    }

    async fn pool_info(&self, name: &str) -> Result<PoolInfo> {
        self.with_pool("pool_info", name, name, |p| Ok(p.info))
    }

    async fn pool_xml(&self, name: &str) -> Result<String> {
        self.with_pool("pool_xml", name, name, |p| Ok(p.xml.clone()))
    }

    async fn define_pool(&self, xml: &str) -> Result<()> {
        let name = element_text(xml, "name")
            .ok_or_else(|| Error::Definition("missing <name>".to_string()))?;
        let mut s = self.call("pool_define", &name)?;
        if s.pools.contains_key(&name) {
            return Err(Error::conflict("pool", name));
        }
        s.pools.insert(
            name,
            FakePool {
                xml: xml.to_string(),
                info: PoolInfo::default(),
                refreshes: 0,
                volumes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn start_pool(&self, name: &str) -> Result<()> {
        self.with_pool("pool_start", name, name, |p| {
            p.info.active = true;
            Ok(())
        })
    }

    async fn stop_pool(&self, name: &str) -> Result<()> {
        self.with_pool("pool_stop", name, name, |p| {
            if !p.info.active {
                return Err(Error::Hypervisor("storage pool is not active".to_string()));
            }
            p.info.active = false;
            Ok(())
        })
    }

    async fn undefine_pool(&self, name: &str) -> Result<()> {
        let mut s = self.call("pool_undefine", name)?;
        s.pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("pool", name))
    }

    async fn refresh_pool(&self, name: &str) -> Result<()> {
        self.with_pool("pool_refresh", name, name, |p| {
            p.refreshes += 1;
            Ok(())
        })
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        self.with_pool("vol_list", pool, pool, |p| Ok(p.volumes.keys().cloned().collect()))
    }

    async fn volume_info(&self, pool: &str, name: &str) -> Result<VolumeInfo> {
        self.with_pool("vol_info", &format!("{} {}", pool, name), pool, |p| {
            p.volumes
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found("volume", name))
        })
    }

    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        let name = element_text(xml, "name")
            .ok_or_else(|| Error::Definition("missing <name>".to_string()))?;
        let gib: u64 = element_text(xml, "capacity")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        self.with_pool("vol_create", &format!("{} {}", pool, name), pool, |p| {
            if p.volumes.contains_key(&name) {
                return Err(Error::conflict("volume", name.clone()));
            }
            let root = resources::parse_pool(&p.xml)?.path;
            p.volumes.insert(
                name.clone(),
                VolumeInfo {
                    kind: 0,
                    path: format!("{}/{}", root, name),
                    capacity: gib << 30,
                    allocation: 196_608,
                },
            );
            Ok(())
        })
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.with_pool("vol_delete", &format!("{} {}", pool, name), pool, |p| {
            p.volumes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::not_found("volume", name))
        })
    }

    async fn close(&self) {
        self.state.lock().closed += 1;
    }
}

/// Clone utility that copies the fake domain table
pub struct FakeCloner {
    hypervisor: FakeHypervisor,
}

impl FakeCloner {
    pub fn new(hypervisor: FakeHypervisor) -> Self {
        Self { hypervisor }
    }
}

#[async_trait]
impl Cloner for FakeCloner {
    async fn clone_machine(&self, source: &str, new_name: &str) -> Result<()> {
        {
            let mut s = self.hypervisor.state.lock();
            s.calls.push(format!("virt-clone {} {}", source, new_name));
            if s.failing.contains("clone") {
                return Err(Error::Clone("ERROR    Disk image is busy".to_string()));
            }
        }
        self.hypervisor.clone_domain(source, new_name)
    }
}

/// Image tool that writes small placeholder files
#[derive(Default)]
pub struct FakeImages {
    created: Mutex<Vec<String>>,
    truncate: AtomicBool,
}

impl FakeImages {
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Leave a partial file behind and report failure
    pub fn fail_after_write(&self) {
        self.truncate.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageTool for FakeImages {
    async fn create(&self, path: &Path, size_gib: u64) -> Result<()> {
        if self.truncate.load(Ordering::SeqCst) {
            std::fs::write(path, b"qcow2")?;
            return Err(Error::Storage("No space left on device".to_string()));
        }
        std::fs::write(path, format!("qcow2 {}G", size_gib))?;
        self.created.lock().push(path.display().to_string());
        Ok(())
    }
}
