//! Device reconfiguration
//!
//! Every change is a minimal fragment submitted with a scope picked from the
//! machine state at submission time. Detach resolves the attached fragment
//! from the current definition first, since the daemon matches on shape.

use crate::config::StorageConfig;
use crate::fragments::{DiskSpec, NetAttachment, NicSpec};
use crate::hypervisor::Hypervisor;
use crate::session::Session;
use crate::slots;
use kvmdeck_common::definition::{self, Definition};
use kvmdeck_common::types::parse_optional;
use kvmdeck_common::validate::{contained_path, image_format, validate_mac};
use kvmdeck_common::{
    AttachDiskRequest, AttachNicRequest, Chipset, DiskBus, Error, ModifyScope, NetMode, NicModel,
    Result, XmlScope,
};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

async fn modify_scope(hv: &dyn Hypervisor, name: &str) -> Result<ModifyScope> {
    Ok(ModifyScope::for_state(hv.domain_state(name).await?))
}

fn taken_targets(def: &Definition<'_>) -> HashSet<String> {
    def.disks().into_iter().map(|d| d.target).collect()
}

pub(crate) async fn attach_disk(
    hv: &dyn Hypervisor,
    storage_root: &Path,
    name: &str,
    req: &AttachDiskRequest,
) -> Result<String> {
    let source = contained_path(storage_root, &req.source)?;
    if !tokio::fs::try_exists(&source).await? {
        return Err(Error::not_found("disk", source.display().to_string()));
    }
    let bus = parse_optional::<DiskBus>(req.bus.as_deref())?.unwrap_or(DiskBus::Virtio);

    let xml = hv.domain_xml(name, XmlScope::Current).await?;
    let def = Definition::parse(&xml)?;
    let chipset = Chipset::from_machine_type(def.machine_type().as_deref());
    let rule = slots::disk_rule(bus, chipset)?;
    let taken = taken_targets(&def);

    let target = match req.target.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) if taken.contains(t) => return Err(Error::conflict("disk target", t)),
        Some(t) if rule.contains(t) => t.to_string(),
        Some(t) => {
            return Err(Error::Validation(format!(
                "target {} does not belong to the {} bus",
                t, bus
            )))
        }
        None => rule
            .next_free(&taken)
            .ok_or_else(|| Error::Precondition(format!("no free {} slot on {}", bus, name)))?,
    };

    let fragment = DiskSpec::disk(&source.to_string_lossy(), &target, bus, image_format(&source)).render();
    let scope = modify_scope(hv, name).await?;
    debug!("Attaching to {} ({:?}):\n{}", name, scope, fragment);
    hv.attach_device(name, &fragment, scope).await?;
    info!("Attached {} to {} as {}", source.display(), name, target);
    Ok(target)
}

pub(crate) async fn detach_disk(hv: &dyn Hypervisor, name: &str, target: &str) -> Result<()> {
    let xml = hv.domain_xml(name, XmlScope::Current).await?;
    let fragment = Definition::parse(&xml)?
        .disk_fragment(target)
        .ok_or_else(|| Error::not_found("disk", target))?;
    let scope = modify_scope(hv, name).await?;
    hv.detach_device(name, &fragment, scope).await?;
    info!("Detached disk {} from {}", target, name);
    Ok(())
}

pub(crate) async fn attach_nic(hv: &dyn Hypervisor, name: &str, req: &AttachNicRequest) -> Result<()> {
    let mode = parse_optional::<NetMode>(req.mode.as_deref())?.unwrap_or(NetMode::Network);
    let model = parse_optional::<NicModel>(req.model.as_deref())?.unwrap_or(NicModel::Virtio);
    let mac = match req.mac.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(mac) => {
            validate_mac(mac)?;
            Some(mac.to_ascii_lowercase())
        }
        None => None,
    };
    let fragment = NicSpec {
        attachment: NetAttachment::resolve(mode, Some(&req.network))?,
        model,
        mac,
    }
    .render();

    let scope = modify_scope(hv, name).await?;
    hv.attach_device(name, &fragment, scope).await?;
    info!("Attached {} interface to {}", mode, name);
    Ok(())
}

pub(crate) async fn detach_nic(hv: &dyn Hypervisor, name: &str, mac: &str) -> Result<()> {
    let xml = hv.domain_xml(name, XmlScope::Current).await?;
    let fragment = Definition::parse(&xml)?
        .interface_fragment(mac)
        .ok_or_else(|| Error::not_found("interface", mac))?;
    let scope = modify_scope(hv, name).await?;
    hv.detach_device(name, &fragment, scope).await?;
    info!("Detached interface {} from {}", mac, name);
    Ok(())
}

/// Insert media into the existing optical drive, or add one in the chipset's
/// default slot, then make sure the boot order can reach it
pub(crate) async fn attach_media(hv: &dyn Hypervisor, media_root: &Path, name: &str, path: &str) -> Result<()> {
    let media = contained_path(media_root, path)?;
    if !tokio::fs::try_exists(&media).await? {
        return Err(Error::not_found("media", media.display().to_string()));
    }
    let media = media.to_string_lossy().into_owned();

    let xml = hv.domain_xml(name, XmlScope::Inactive).await?;
    let def = Definition::parse(&xml)?;
    let scope = modify_scope(hv, name).await?;
    match def.optical_drive() {
        Some(drive) => {
            let fragment = DiskSpec::optical(Some(&media), &drive.target, &drive.bus).render();
            hv.update_device(name, &fragment, scope).await?;
        }
        None => {
            let chipset = Chipset::from_machine_type(def.machine_type().as_deref());
            let rule = slots::optical_rule(chipset)?;
            let target = rule
                .next_free(&taken_targets(&def))
                .ok_or_else(|| Error::Precondition(format!("no free optical slot on {}", name)))?;
            let fragment = DiskSpec::optical(Some(&media), &target, rule.bus.as_str()).render();
            hv.attach_device(name, &fragment, scope).await?;
        }
    }

    let xml = hv.domain_xml(name, XmlScope::Inactive).await?;
    let patched = definition::ensure_boot_entry(&xml, "cdrom")?;
    if patched != xml {
        hv.define_xml(&patched).await?;
    }
    info!("Inserted {} into {}", media, name);
    Ok(())
}

/// Empty the primary optical drive; a drive that is already empty is left alone
pub(crate) async fn eject_media(hv: &dyn Hypervisor, name: &str) -> Result<()> {
    let xml = hv.domain_xml(name, XmlScope::Inactive).await?;
    let drive = Definition::parse(&xml)?
        .optical_drive()
        .ok_or_else(|| Error::not_found("optical drive", name))?;
    if drive.source.is_none() {
        return Ok(());
    }
    let fragment = DiskSpec::optical(None, &drive.target, &drive.bus).render();
    let scope = modify_scope(hv, name).await?;
    hv.update_device(name, &fragment, scope).await?;
    info!("Ejected media from {}", name);
    Ok(())
}

/// Disk, NIC and optical media reconfiguration
#[derive(Clone)]
pub struct DeviceEngine {
    session: Session,
    storage: StorageConfig,
}

impl DeviceEngine {
    pub fn new(session: Session, storage: StorageConfig) -> Self {
        Self { session, storage }
    }

    pub async fn attach_disk(&self, name: &str, req: &AttachDiskRequest) -> Result<String> {
        let hv = self.session.acquire().await?;
        attach_disk(&**hv, &self.storage.storage_root, name, req).await
    }

    pub async fn detach_disk(&self, name: &str, target: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        detach_disk(&**hv, name, target).await
    }

    pub async fn attach_nic(&self, name: &str, req: &AttachNicRequest) -> Result<()> {
        let hv = self.session.acquire().await?;
        attach_nic(&**hv, name, req).await
    }

    pub async fn detach_nic(&self, name: &str, mac: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        detach_nic(&**hv, name, mac).await
    }

    pub async fn attach_media(&self, name: &str, path: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        attach_media(&**hv, &self.storage.media_root, name, path).await
    }

    pub async fn eject_media(&self, name: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        eject_media(&**hv, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{domain_xml, FakeHypervisor};
    use kvmdeck_common::{ErrorKind, MachineState};
    use tempfile::TempDir;

    const DATA_DISK: &str = "    <disk type='file' device='disk'>\n      <driver name='qemu' type='qcow2'/>\n      <source file='/var/lib/libvirt/images/vm1.qcow2'/>\n      <target dev='vda' bus='virtio'/>\n    </disk>\n";
    const CDROM: &str = "    <disk type='file' device='cdrom'>\n      <driver name='qemu' type='raw'/>\n      <target dev='hda' bus='ide'/>\n      <readonly/>\n    </disk>\n";
    const NIC: &str = "    <interface type='network'>\n      <mac address='52:54:00:aa:bb:cc'/>\n      <source network='default'/>\n      <model type='virtio'/>\n    </interface>\n";

    struct Fixture {
        dir: TempDir,
        fake: FakeHypervisor,
        engine: DeviceEngine,
    }

    fn fixture(body: &str, state: MachineState) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            storage_root: dir.path().join("images"),
            media_root: dir.path().join("iso"),
            ..Default::default()
        };
        std::fs::create_dir_all(&storage.storage_root).unwrap();
        std::fs::create_dir_all(&storage.media_root).unwrap();
        std::fs::write(storage.storage_root.join("data.qcow2"), b"").unwrap();
        std::fs::write(storage.media_root.join("install.iso"), b"").unwrap();

        let fake = FakeHypervisor::new();
        fake.add_domain("vm1", domain_xml("vm1", body), state);
        let engine = DeviceEngine::new(fake.session(), storage);
        Fixture { dir, fake, engine }
    }

    fn disk_request(f: &Fixture) -> AttachDiskRequest {
        AttachDiskRequest {
            source: f.dir.path().join("images/data.qcow2").display().to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scope_follows_machine_state() {
        let f = fixture(DATA_DISK, MachineState::Shutoff);
        f.engine.attach_disk("vm1", &disk_request(&f)).await.unwrap();
        f.fake.update("vm1", |d| d.state = MachineState::Running);
        f.engine.detach_disk("vm1", "vdb").await.unwrap();

        let calls = f.fake.calls();
        assert!(calls.contains(&"attach_device vm1 config".to_string()));
        assert!(calls.contains(&"detach_device vm1 live+config".to_string()));
    }

    #[tokio::test]
    async fn test_attach_disk_picks_next_free_target() {
        let f = fixture(DATA_DISK, MachineState::Shutoff);
        let target = f.engine.attach_disk("vm1", &disk_request(&f)).await.unwrap();
        assert_eq!(target, "vdb");

        let mut explicit = disk_request(&f);
        explicit.target = Some("vda".to_string());
        let err = f.engine.attach_disk("vm1", &explicit).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        for bogus in ["sdz", "vd$", "vdA", "vdaa"] {
            explicit.target = Some(bogus.to_string());
            let err = f.engine.attach_disk("vm1", &explicit).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{}", bogus);
        }

        explicit.target = Some("vdz".to_string());
        assert_eq!(f.engine.attach_disk("vm1", &explicit).await.unwrap(), "vdz");
    }

    #[tokio::test]
    async fn test_attach_disk_outside_storage_root() {
        let f = fixture(DATA_DISK, MachineState::Shutoff);
        let req = AttachDiskRequest {
            source: "/etc/passwd".to_string(),
            ..Default::default()
        };
        assert_eq!(f.engine.attach_disk("vm1", &req).await.unwrap_err().kind(), ErrorKind::Validation);
        assert!(f.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_detach_unknown_device_is_not_found() {
        let f = fixture(&format!("{}{}", DATA_DISK, NIC), MachineState::Running);
        let before = f.fake.domain("vm1").unwrap().xml;

        let err = f.engine.detach_disk("vm1", "vdz").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = f.engine.detach_nic("vm1", "52:54:00:00:00:01").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(f.fake.domain("vm1").unwrap().xml, before);
        assert!(!f.fake.calls().iter().any(|c| c.starts_with("detach_device")));
    }

    #[tokio::test]
    async fn test_detach_submits_existing_fragment() {
        let f = fixture(&format!("{}{}", DATA_DISK, NIC), MachineState::Shutoff);
        f.engine.detach_nic("vm1", "52:54:00:AA:BB:CC").await.unwrap();
        f.engine.detach_disk("vm1", "vda").await.unwrap();

        let xml = f.fake.domain("vm1").unwrap().xml;
        let def = Definition::parse(&xml).unwrap();
        assert!(def.interfaces().is_empty());
        assert!(def.disks().is_empty());
    }

    #[tokio::test]
    async fn test_attach_nic_modes() {
        let f = fixture("", MachineState::Shutoff);
        let req = AttachNicRequest {
            network: "br1".to_string(),
            mode: Some("bridge".to_string()),
            model: Some("e1000".to_string()),
            mac: Some("52:54:00:12:34:56".to_string()),
        };
        f.engine.attach_nic("vm1", &req).await.unwrap();
        let nic = &Definition::parse(&f.fake.domain("vm1").unwrap().xml).unwrap().interfaces()[0];
        assert_eq!(nic.kind, "bridge");
        assert_eq!(nic.source.as_deref(), Some("br1"));
        assert_eq!(nic.model.as_deref(), Some("e1000"));

        let bad = AttachNicRequest {
            mac: Some("52:54:00".to_string()),
            ..req
        };
        assert_eq!(f.engine.attach_nic("vm1", &bad).await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_attach_media_reuses_existing_drive() {
        let f = fixture(&format!("{}{}", DATA_DISK, CDROM), MachineState::Shutoff);
        let iso = f.dir.path().join("iso/install.iso").display().to_string();
        f.engine.attach_media("vm1", &iso).await.unwrap();

        let xml = f.fake.domain("vm1").unwrap().xml;
        let def = Definition::parse(&xml).unwrap();
        let drive = def.optical_drive().unwrap();
        assert_eq!(drive.target, "hda");
        assert_eq!(drive.source.as_deref(), Some(iso.as_str()));
        assert_eq!(def.boot_order(), vec!["cdrom", "hd"]);
        assert!(f.fake.calls().contains(&"update_device vm1 config".to_string()));

        // A second insert leaves the boot order alone
        f.engine.attach_media("vm1", &iso).await.unwrap();
        let xml = f.fake.domain("vm1").unwrap().xml;
        assert_eq!(Definition::parse(&xml).unwrap().boot_order(), vec!["cdrom", "hd"]);
        assert_eq!(f.fake.calls().iter().filter(|c| c.starts_with("define")).count(), 1);
    }

    #[tokio::test]
    async fn test_attach_media_adds_drive_for_chipset() {
        let f = fixture("", MachineState::Shutoff);
        f.fake.update("vm1", |d| d.xml = d.xml.replace("pc-i440fx-8.0", "pc-q35-8.0"));
        let iso = f.dir.path().join("iso/install.iso").display().to_string();
        f.engine.attach_media("vm1", &iso).await.unwrap();

        let drive = Definition::parse(&f.fake.domain("vm1").unwrap().xml)
            .unwrap()
            .optical_drive()
            .unwrap();
        assert_eq!((drive.target.as_str(), drive.bus.as_str()), ("sdb", "sata"));
    }

    #[tokio::test]
    async fn test_eject_media() {
        let f = fixture(DATA_DISK, MachineState::Shutoff);
        assert_eq!(f.engine.eject_media("vm1").await.unwrap_err().kind(), ErrorKind::NotFound);

        let iso = f.dir.path().join("iso/install.iso").display().to_string();
        f.engine.attach_media("vm1", &iso).await.unwrap();
        f.engine.eject_media("vm1").await.unwrap();
        let drive = Definition::parse(&f.fake.domain("vm1").unwrap().xml)
            .unwrap()
            .optical_drive()
            .unwrap();
        assert_eq!(drive.source, None);
        assert_eq!(drive.target, "hda");
    }
}
