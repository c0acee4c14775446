//! Machine lifecycle
//!
//! Reads and power transitions on defined machines. Each operation runs its
//! whole RPC sequence under one session guard; clone and file removal run
//! outside it.

use crate::clone::Cloner;
use crate::config::StorageConfig;
use crate::devices;
use crate::hypervisor::Hypervisor;
use crate::session::Session;
use crate::telemetry::GuestUsageCache;
use kvmdeck_common::definition::{self, Definition};
use kvmdeck_common::validate::{contained_path, validate_name};
use kvmdeck_common::{
    BatchAction, BatchReport, BatchRequest, Error, ErrorKind, MachineState, PowerAction, Result,
    UpdateOutcome, UpdateVmRequest, VmDetail, VmSummary, XmlScope,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const INSTALL_BOOT: [&str; 2] = ["cdrom", "hd"];
const INSTALLED_BOOT: [&str; 2] = ["hd", "cdrom"];

pub struct Machines {
    session: Session,
    storage: StorageConfig,
    usage: GuestUsageCache,
    cloner: Arc<dyn Cloner>,
}

async fn summary(hv: &dyn Hypervisor, usage: &GuestUsageCache, name: &str) -> Result<VmSummary> {
    let state = hv.domain_state(name).await?;
    let xml = hv.domain_xml(name, XmlScope::Current).await?;
    let def = Definition::parse(&xml)?;
    let uuid = match def.uuid() {
        Some(uuid) => uuid,
        None => hv.domain_uuid(name).await?,
    };
    let sample = usage.get(name).filter(|_| state.is_running());
    Ok(VmSummary {
        name: name.to_string(),
        uuid,
        state,
        cpu: def.vcpus()?,
        memory: def.memory_mib()?,
        cpu_usage: sample.and_then(|s| s.cpu_percent),
        mem_used: sample.and_then(|s| s.mem_used_mib),
    })
}

async fn require_offline(hv: &dyn Hypervisor, name: &str) -> Result<MachineState> {
    let state = hv.domain_state(name).await?;
    if !state.is_offline() {
        return Err(Error::Precondition(format!("{} must be shut off, it is {}", name, state)));
    }
    Ok(state)
}

async fn require_undefined(hv: &dyn Hypervisor, name: &str) -> Result<()> {
    if hv.list_domains().await?.iter().any(|d| d == name) {
        return Err(Error::conflict("machine", name));
    }
    Ok(())
}

/// Move the disk ahead of the optical drive once an installer has booted
async fn flip_install_boot(hv: &dyn Hypervisor, name: &str) -> Result<bool> {
    let xml = hv.domain_xml(name, XmlScope::Inactive).await?;
    if Definition::parse(&xml)?.boot_order() != INSTALL_BOOT {
        return Ok(false);
    }
    let patched = definition::set_boot_order(&xml, &INSTALLED_BOOT)?;
    hv.define_xml(&patched).await?;
    Ok(true)
}

async fn remove_unreferenced(files: Vec<String>, referenced: HashSet<String>, storage_root: &Path) {
    for file in files {
        let path = match contained_path(storage_root, &file) {
            Ok(path) if !referenced.contains(&file) => path,
            _ => {
                info!("Keeping {}", file);
                continue;
            }
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed {}", file),
            Err(e) => warn!("Failed to remove {}: {}", file, e),
        }
    }
}

impl Machines {
    pub fn new(session: Session, storage: StorageConfig, usage: GuestUsageCache, cloner: Arc<dyn Cloner>) -> Self {
        Self {
            session,
            storage,
            usage,
            cloner,
        }
    }

    pub async fn list(&self) -> Result<Vec<VmSummary>> {
        let hv = self.session.acquire().await?;
        let mut out = Vec::new();
        for name in hv.list_domains().await? {
            match summary(&**hv, &self.usage, &name).await {
                Ok(s) => out.push(s),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub async fn get(&self, name: &str) -> Result<VmSummary> {
        let hv = self.session.acquire().await?;
        summary(&**hv, &self.usage, name).await
    }

    pub async fn detail(&self, name: &str) -> Result<VmDetail> {
        let hv = self.session.acquire().await?;
        let state = hv.domain_state(name).await?;
        let xml = hv.domain_xml(name, XmlScope::Current).await?;
        let def = Definition::parse(&xml)?;
        let uuid = match def.uuid() {
            Some(uuid) => uuid,
            None => hv.domain_uuid(name).await?,
        };
        Ok(VmDetail {
            name: name.to_string(),
            uuid,
            state,
            cpu: def.vcpus()?,
            memory: def.memory_mib()?,
            arch: def.arch(),
            machine: def.machine_type(),
            boot: def.boot_order(),
            disks: def.disks(),
            nics: def.interfaces(),
            vnc_port: def.graphics().and_then(|g| g.port),
        })
    }

    /// Start, then flip an install boot order so later boots use the disk
    pub async fn start(&self, name: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        hv.power(name, PowerAction::Start).await?;
        info!("Started {}", name);
        match flip_install_boot(&**hv, name).await {
            Ok(true) => info!("Boot order of {} switched to disk first", name),
            Ok(false) => {}
            Err(e) => warn!("Failed to update boot order of {}: {}", name, e),
        }
        Ok(())
    }

    async fn power(&self, name: &str, action: PowerAction) -> Result<()> {
        let hv = self.session.acquire().await?;
        hv.power(name, action).await?;
        info!("{} {}", action, name);
        Ok(())
    }

    pub async fn shutdown(&self, name: &str) -> Result<()> {
        self.power(name, PowerAction::Shutdown).await
    }

    pub async fn destroy(&self, name: &str) -> Result<()> {
        self.power(name, PowerAction::Destroy).await
    }

    pub async fn reboot(&self, name: &str) -> Result<()> {
        self.power(name, PowerAction::Reboot).await
    }

    pub async fn suspend(&self, name: &str) -> Result<()> {
        self.power(name, PowerAction::Suspend).await
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        self.power(name, PowerAction::Resume).await
    }

    /// Force off, undefine, then remove disk files nothing else uses
    pub async fn delete(&self, name: &str) -> Result<()> {
        let (files, referenced) = {
            let hv = self.session.acquire().await?;
            let xml = hv.domain_xml(name, XmlScope::Inactive).await?;
            let files = Definition::parse(&xml)?.backing_files();

            if hv.domain_state(name).await? != MachineState::Shutoff {
                hv.power(name, PowerAction::Destroy).await?;
            }
            hv.undefine(name).await?;
            info!("Undefined {}", name);

            let mut referenced = HashSet::new();
            for other in hv.list_domains().await? {
                match hv.domain_xml(&other, XmlScope::Inactive).await {
                    Ok(xml) => {
                        if let Ok(def) = Definition::parse(&xml) {
                            referenced.extend(def.backing_files());
                        }
                    }
                    Err(e) => warn!("Failed to read {}: {}", other, e),
                }
            }
            (files, referenced)
        };

        remove_unreferenced(files, referenced, &self.storage.storage_root).await;
        Ok(())
    }

    pub async fn autostart(&self, name: &str) -> Result<bool> {
        let hv = self.session.acquire().await?;
        hv.autostart(name).await
    }

    pub async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        let hv = self.session.acquire().await?;
        hv.set_autostart(name, enabled).await
    }

    pub async fn rename(&self, name: &str, new_name: &str) -> Result<()> {
        validate_name("machine", new_name)?;
        let hv = self.session.acquire().await?;
        require_offline(&**hv, name).await?;
        require_undefined(&**hv, new_name).await?;
        hv.rename(name, new_name).await?;
        info!("Renamed {} to {}", name, new_name);
        Ok(())
    }

    /// Patch vcpus and memory in the persisted definition; zero keeps a value
    pub async fn update(&self, name: &str, req: &UpdateVmRequest) -> Result<UpdateOutcome> {
        if req.cpu == 0 && req.memory == 0 {
            return Err(Error::Validation("nothing to update".to_string()));
        }
        let hv = self.session.acquire().await?;
        let xml = hv.domain_xml(name, XmlScope::Inactive).await?;
        let mut patched = xml.clone();
        if req.cpu > 0 {
            patched = definition::patch_scalar(&patched, "vcpu", &req.cpu.to_string())?;
        }
        if req.memory > 0 {
            patched = definition::patch_memory(&patched, req.memory)?;
        }
        if patched == xml {
            return Ok(UpdateOutcome::Unchanged);
        }
        hv.define_xml(&patched).await?;
        info!("Updated {}: cpu={} memory={}MiB", name, req.cpu, req.memory);
        Ok(UpdateOutcome::Applied)
    }

    /// Eject the installer and boot from disk only
    pub async fn finish_install(&self, name: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        match devices::eject_media(&**hv, name).await {
            Err(Error::NotFound { ref kind, .. }) if kind == "optical drive" => {}
            other => other?,
        }
        let xml = hv.domain_xml(name, XmlScope::Inactive).await?;
        let patched = definition::set_boot_order(&xml, &["hd"])?;
        if patched != xml {
            hv.define_xml(&patched).await?;
        }
        info!("Finished installation of {}", name);
        Ok(())
    }

    /// Copy a shut off machine with the external clone utility
    pub async fn clone_vm(&self, source: &str, new_name: &str) -> Result<()> {
        validate_name("machine", new_name)?;
        {
            let hv = self.session.acquire().await?;
            require_offline(&**hv, source).await?;
            require_undefined(&**hv, new_name).await?;
        }

        info!("Cloning {} to {}", source, new_name);
        self.cloner.clone_machine(source, new_name).await?;

        let hv = self.session.acquire().await?;
        if !hv.list_domains().await?.iter().any(|d| d == new_name) {
            return Err(Error::Clone(format!("{} is not defined after cloning", new_name)));
        }
        info!("Cloned {} to {}", source, new_name);
        Ok(())
    }

    /// Apply one action to many machines, collecting failures by name
    pub async fn batch(&self, req: &BatchRequest) -> BatchReport {
        let mut report = BatchReport::default();
        for name in &req.names {
            let result = match req.action {
                BatchAction::Start => self.start(name).await,
                BatchAction::Shutdown => self.shutdown(name).await,
                BatchAction::Destroy => self.destroy(name).await,
                BatchAction::Delete => self.delete(name).await,
            };
            if let Err(e) = result {
                warn!("Batch {:?} failed for {}: {}", req.action, name, e);
                report.errors.insert(name.clone(), e.to_string());
            }
        }
        report
    }

    /// Local console port of a running machine
    pub async fn console_port(&self, name: &str) -> Result<u16> {
        let hv = self.session.acquire().await?;
        let state = hv.domain_state(name).await?;
        if !state.is_running() {
            return Err(Error::Precondition(format!("{} is not running", name)));
        }
        let xml = hv.domain_xml(name, XmlScope::Current).await?;
        Definition::parse(&xml)?
            .graphics()
            .and_then(|g| g.port)
            .ok_or_else(|| Error::not_found("console", name))
    }
}
