//! Domain synthesizer
//!
//! Turns creation and import requests into complete machine definitions:
//! presets are resolved per OS family, explicit fields override them, and the
//! rendered document is checked again before anything is submitted.

use crate::config::StorageConfig;
use crate::fragments::{self, DiskSpec, NetAttachment, NicSpec};
use crate::images::ImageTool;
use crate::saga::Saga;
use crate::session::Session;
use crate::slots;
use kvmdeck_common::definition::{escape_text, Definition};
use kvmdeck_common::types::parse_optional;
use kvmdeck_common::validate::{contained_path, image_format, validate_name};
use kvmdeck_common::{
    Chipset, ClockOffset, CpuMode, CreateVmRequest, DiskBus, Error, ImageFormat, ImportVmRequest,
    NetMode, NicModel, OsFamily, Result,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Hardware choices for one machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hardware {
    pub disk_bus: DiskBus,
    pub nic_model: NicModel,
    pub chipset: Chipset,
    pub cpu_mode: CpuMode,
    pub clock: ClockOffset,
    /// rtc/pit/hpet/hypervclock tuning for guests that expect it
    pub compat_timers: bool,
}

impl Hardware {
    pub fn preset(family: OsFamily) -> Self {
        match family {
            OsFamily::Generic => Hardware {
                disk_bus: DiskBus::Virtio,
                nic_model: NicModel::Virtio,
                chipset: Chipset::I440fx,
                cpu_mode: CpuMode::Emulated,
                clock: ClockOffset::Utc,
                compat_timers: false,
            },
            OsFamily::ModernDesktop => Hardware {
                disk_bus: DiskBus::Sata,
                nic_model: NicModel::E1000,
                chipset: Chipset::Q35,
                cpu_mode: CpuMode::HostPassthrough,
                clock: ClockOffset::Localtime,
                compat_timers: true,
            },
            OsFamily::Legacy => Hardware {
                disk_bus: DiskBus::Ide,
                nic_model: NicModel::Rtl8139,
                chipset: Chipset::I440fx,
                cpu_mode: CpuMode::Emulated,
                clock: ClockOffset::Utc,
                compat_timers: false,
            },
        }
    }

    fn resolve(
        os_type: Option<&str>,
        disk_bus: Option<&str>,
        net_model: Option<&str>,
        machine: Option<&str>,
        cpu_model: Option<&str>,
        clock: Option<&str>,
    ) -> Result<Self> {
        let family = parse_optional::<OsFamily>(os_type)?.unwrap_or(OsFamily::Generic);
        let mut hw = Hardware::preset(family);
        if let Some(bus) = parse_optional(disk_bus)? {
            hw.disk_bus = bus;
        }
        if let Some(model) = parse_optional(net_model)? {
            hw.nic_model = model;
        }
        if let Some(chipset) = parse_optional(machine)? {
            hw.chipset = chipset;
        }
        if let Some(mode) = parse_optional(cpu_model)? {
            hw.cpu_mode = mode;
        }
        if let Some(offset) = parse_optional(clock)? {
            hw.clock = offset;
        }
        Ok(hw)
    }
}

/// Everything needed to render one definition
#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub cpu: u32,
    pub memory_mib: u64,
    pub hardware: Hardware,
    pub disk_path: PathBuf,
    pub disk_format: ImageFormat,
    pub disk_target: String,
    pub install_media: Option<PathBuf>,
    pub driver_media: Option<PathBuf>,
    pub net: NetAttachment,
    pub boot: Vec<&'static str>,
}

pub struct Synthesizer {
    session: Session,
    storage: StorageConfig,
    images: Arc<dyn ImageTool>,
}

fn check_sizes(cpu: u32, memory: u64) -> Result<()> {
    if cpu == 0 {
        return Err(Error::Validation("cpu count must be at least 1".to_string()));
    }
    if memory == 0 {
        return Err(Error::Validation("memory must be at least 1 MiB".to_string()));
    }
    Ok(())
}

impl Synthesizer {
    pub fn new(session: Session, storage: StorageConfig, images: Arc<dyn ImageTool>) -> Self {
        Self {
            session,
            storage,
            images,
        }
    }

    fn media(&self, path: Option<&str>) -> Result<Option<PathBuf>> {
        match path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => contained_path(&self.storage.media_root, p).map(Some),
            None => Ok(None),
        }
    }

    /// Validate a creation request and resolve every choice it leaves open
    pub fn plan_create(&self, req: &CreateVmRequest) -> Result<Plan> {
        validate_name("machine", &req.name)?;
        check_sizes(req.cpu, req.memory)?;
        if req.disk == 0 {
            return Err(Error::Validation("disk size must be at least 1 GiB".to_string()));
        }

        let hardware = Hardware::resolve(
            req.os_type.as_deref(),
            req.disk_bus.as_deref(),
            req.net_model.as_deref(),
            req.machine.as_deref(),
            req.cpu_model.as_deref(),
            req.clock.as_deref(),
        )?;
        let disk_target = slots::boot_disk_target(hardware.disk_bus, hardware.chipset)?;

        let mode = parse_optional::<NetMode>(req.net_mode.as_deref())?.unwrap_or(NetMode::Network);
        let source = match mode {
            NetMode::Network => req.network.as_deref(),
            NetMode::Bridge => req.bridge_name.as_deref(),
            NetMode::Direct => req.direct_dev.as_deref(),
        };
        let net = NetAttachment::resolve(mode, source)?;

        let disk_path = contained_path(
            &self.storage.storage_root,
            &self.storage.storage_root.join(format!("{}.qcow2", req.name)).to_string_lossy(),
        )?;

        Ok(Plan {
            name: req.name.clone(),
            cpu: req.cpu,
            memory_mib: req.memory,
            hardware,
            disk_path,
            disk_format: ImageFormat::Qcow2,
            disk_target,
            install_media: self.media(req.iso.as_deref())?,
            driver_media: self.media(req.virtio_iso.as_deref())?,
            net,
            boot: vec!["cdrom", "hd"],
        })
    }

    /// Validate an import request around an existing image
    pub fn plan_import(&self, req: &ImportVmRequest) -> Result<Plan> {
        validate_name("machine", &req.name)?;
        check_sizes(req.cpu, req.memory)?;

        let hardware = Hardware::resolve(
            req.os_type.as_deref(),
            req.disk_bus.as_deref(),
            req.net_model.as_deref(),
            req.machine.as_deref(),
            None,
            None,
        )?;
        let disk_target = slots::boot_disk_target(hardware.disk_bus, hardware.chipset)?;
        let disk_path = contained_path(&self.storage.storage_root, &req.disk_path)?;
        let disk_format = image_format(&disk_path);

        Ok(Plan {
            name: req.name.clone(),
            cpu: req.cpu,
            memory_mib: req.memory,
            hardware,
            disk_path,
            disk_format,
            disk_target,
            install_media: None,
            driver_media: None,
            net: NetAttachment::Network("default".to_string()),
            boot: vec!["hd"],
        })
    }

    /// Render a plan as a full definition document
    pub fn render(&self, plan: &Plan) -> Result<String> {
        let hw = &plan.hardware;
        let (optical, install_target, driver_target) = slots::optical_targets(hw.chipset)?;
        let optical_bus = optical.bus.to_string();
        let machine = match hw.chipset {
            Chipset::I440fx => "pc",
            Chipset::Q35 => "q35",
        };

        let mut devices = String::new();
        devices.push_str(
            &DiskSpec::disk(
                &plan.disk_path.to_string_lossy(),
                &plan.disk_target,
                hw.disk_bus,
                plan.disk_format,
            )
            .render(),
        );
        let install = plan.install_media.as_ref().map(|p| p.to_string_lossy().into_owned());
        devices.push_str(&DiskSpec::optical(install.as_deref(), &install_target, &optical_bus).render());
        if let Some(driver) = &plan.driver_media {
            devices.push_str(
                &DiskSpec::optical(Some(&driver.to_string_lossy()), &driver_target, &optical_bus).render(),
            );
        }
        if hw.disk_bus == DiskBus::Scsi {
            devices.push_str("<controller type='scsi' index='0' model='virtio-scsi'/>\n");
        }
        devices.push_str(
            &NicSpec {
                attachment: plan.net.clone(),
                model: hw.nic_model,
                mac: None,
            }
            .render(),
        );
        devices.push_str(&fragments::graphics(&self.storage.graphics_listen));
        devices.push_str("<video>\n  <model type='qxl'/>\n</video>\n");
        devices.push_str("<input type='tablet' bus='usb'/>\n");
        devices.push_str("<console type='pty'/>\n");

        let mut xml = String::from("<domain type='kvm'>\n");
        xml.push_str(&format!("  <name>{}</name>\n", escape_text(&plan.name)));
        xml.push_str(&format!("  <memory unit='MiB'>{}</memory>\n", plan.memory_mib));
        xml.push_str(&format!("  <currentMemory unit='MiB'>{}</currentMemory>\n", plan.memory_mib));
        xml.push_str(&format!("  <vcpu placement='static'>{}</vcpu>\n", plan.cpu));
        xml.push_str("  <os>\n");
        xml.push_str(&format!("    <type arch='x86_64' machine='{}'>hvm</type>\n", machine));
        for dev in &plan.boot {
            xml.push_str(&format!("    <boot dev='{}'/>\n", dev));
        }
        xml.push_str("  </os>\n");
        xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
        match hw.cpu_mode {
            CpuMode::HostPassthrough => xml.push_str("  <cpu mode='host-passthrough' check='none'/>\n"),
            CpuMode::HostModel => xml.push_str("  <cpu mode='host-model'/>\n"),
            CpuMode::Emulated => {}
        }
        if hw.compat_timers {
            xml.push_str(&format!("  <clock offset='{}'>\n", hw.clock));
            xml.push_str("    <timer name='rtc' tickpolicy='catchup'/>\n");
            xml.push_str("    <timer name='pit' tickpolicy='delay'/>\n");
            xml.push_str("    <timer name='hpet' present='no'/>\n");
            xml.push_str("    <timer name='hypervclock' present='yes'/>\n");
            xml.push_str("  </clock>\n");
        } else {
            xml.push_str(&format!("  <clock offset='{}'/>\n", hw.clock));
        }
        xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
        xml.push_str("  <on_reboot>restart</on_reboot>\n");
        xml.push_str("  <on_crash>destroy</on_crash>\n");
        xml.push_str("  <devices>\n");
        xml.push_str(&fragments::indent(&devices, 4));
        xml.push_str("  </devices>\n</domain>\n");
        Ok(xml)
    }

    /// Re-read a rendered document and check the invariants it must hold
    fn verify(&self, plan: &Plan, xml: &str) -> Result<()> {
        let def = Definition::parse(xml)?;

        let mut seen = HashSet::new();
        for disk in def.disks() {
            if !seen.insert(disk.target.clone()) {
                return Err(Error::Definition(format!("duplicate target {}", disk.target)));
            }
        }

        let backing = def.backing_files();
        let root = &self.storage.storage_root;
        match backing.as_slice() {
            [only] if Path::new(only).starts_with(root) && Path::new(only) == plan.disk_path => {}
            _ => {
                return Err(Error::Definition(format!(
                    "expected one backing file under {}, found {:?}",
                    root.display(),
                    backing
                )))
            }
        }

        if def.vcpus()? != plan.cpu || def.memory_mib()? != plan.memory_mib {
            return Err(Error::Definition("rendered sizes do not match the request".to_string()));
        }
        Ok(())
    }

    /// Plan, render and verify without side effects
    pub fn synthesize(&self, req: &CreateVmRequest) -> Result<(Plan, String)> {
        let plan = self.plan_create(req)?;
        let xml = self.render(&plan)?;
        self.verify(&plan, &xml)?;
        Ok((plan, xml))
    }

    async fn ensure_undefined(&self, name: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        if hv.list_domains().await?.iter().any(|d| d == name) {
            return Err(Error::conflict("machine", name));
        }
        Ok(())
    }

    /// Allocate the disk and define the machine, removing the disk again if
    /// the definition is rejected
    pub async fn create(&self, req: &CreateVmRequest) -> Result<Plan> {
        let (plan, xml) = self.synthesize(req)?;
        debug!("Synthesized definition for {}:\n{}", plan.name, xml);

        self.ensure_undefined(&plan.name).await?;
        if tokio::fs::try_exists(&plan.disk_path).await? {
            return Err(Error::conflict("disk", plan.disk_path.display().to_string()));
        }

        // Covers a half-written image as well as a complete one
        let mut saga = Saga::new("create machine");
        let disk = plan.disk_path.clone();
        saga.on_failure("allocate disk", async move {
            match tokio::fs::remove_file(&disk).await {
                Ok(()) => info!("Removed {}", disk.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            Ok::<(), Error>(())
        });

        // Allocation can take a while; the session is not held
        if let Err(e) = self.images.create(&plan.disk_path, req.disk).await {
            return Err(saga.abort("allocate disk", e).await);
        }

        let defined = async {
            let hv = self.session.acquire().await?;
            hv.define_xml(&xml).await
        }
        .await;

        match defined {
            Ok(()) => {
                saga.complete().await;
                info!("Created machine {}", plan.name);
                Ok(plan)
            }
            Err(e) => Err(saga.abort("define", e).await),
        }
    }

    /// Define a machine around an image already under the storage root
    pub async fn import(&self, req: &ImportVmRequest) -> Result<Plan> {
        let plan = self.plan_import(req)?;
        if !tokio::fs::try_exists(&plan.disk_path).await? {
            return Err(Error::not_found("disk", plan.disk_path.display().to_string()));
        }
        let xml = self.render(&plan)?;
        self.verify(&plan, &xml)?;

        let hv = self.session.acquire().await?;
        if hv.list_domains().await?.iter().any(|d| d == &plan.name) {
            return Err(Error::conflict("machine", plan.name));
        }
        hv.define_xml(&xml).await?;
        info!("Imported machine {} from {}", plan.name, plan.disk_path.display());
        Ok(plan)
    }
}
