//! Core types for kvmdeck

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Runtime state of a defined machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Shutoff,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Crashed,
    Suspended,
    Unknown,
}

impl MachineState {
    /// Map a libvirt `virDomainState` code
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => MachineState::Running,
            2 => MachineState::Blocked,
            3 => MachineState::Paused,
            4 => MachineState::Shutdown,
            5 => MachineState::Shutoff,
            6 => MachineState::Crashed,
            7 => MachineState::Suspended,
            _ => MachineState::Unknown,
        }
    }

    /// Only a shut-off machine is safe to rename or to clone from
    pub fn is_offline(self) -> bool {
        self == MachineState::Shutoff
    }

    pub fn is_running(self) -> bool {
        self == MachineState::Running
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::Shutoff => "shutoff",
            MachineState::Running => "running",
            MachineState::Blocked => "blocked",
            MachineState::Paused => "paused",
            MachineState::Shutdown => "shutdown",
            MachineState::Crashed => "crashed",
            MachineState::Suspended => "pmsuspended",
            MachineState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Which copy of a definition a device change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyScope {
    /// Persisted definition only, effective on next start
    Config,
    /// Running instance and persisted definition
    LiveAndConfig,
}

impl ModifyScope {
    pub fn for_state(state: MachineState) -> Self {
        if state.is_running() {
            ModifyScope::LiveAndConfig
        } else {
            ModifyScope::Config
        }
    }

    pub fn is_live(self) -> bool {
        self == ModifyScope::LiveAndConfig
    }
}

/// Which rendition of a definition to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlScope {
    /// Live definition while running, persisted otherwise
    Current,
    /// Persisted definition for next start
    Inactive,
}

/// Power transitions passed through to the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Start,
    Shutdown,
    Destroy,
    Reboot,
    Suspend,
    Resume,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerAction::Start => "start",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Destroy => "destroy",
            PowerAction::Reboot => "reboot",
            PowerAction::Suspend => "suspend",
            PowerAction::Resume => "resume",
        };
        f.write_str(name)
    }
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal, { $($variant:ident => $text:literal $(| $alias:literal)*),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text $(| $alias)* => Ok($name::$variant),)+
                    other => Err(Error::Validation(format!("unsupported {}: {}", $label, other))),
                }
            }
        }
    };
}

string_enum!(
    /// Disk controller bus
    DiskBus, "disk bus", {
        Virtio => "virtio",
        Sata => "sata",
        Scsi => "scsi",
        Ide => "ide",
    }
);

string_enum!(
    /// Emulated NIC model
    NicModel, "net model", {
        Virtio => "virtio",
        E1000 => "e1000",
        Rtl8139 => "rtl8139",
    }
);

string_enum!(
    /// Machine chipset
    Chipset, "machine", {
        I440fx => "i440fx" | "pc",
        Q35 => "q35",
    }
);

string_enum!(
    /// Guest CPU model selection
    CpuMode, "cpu model", {
        Emulated => "qemu64" | "default",
        HostPassthrough => "host-passthrough",
        HostModel => "host-model",
    }
);

string_enum!(
    /// Guest RTC base
    ClockOffset, "clock", {
        Utc => "utc",
        Localtime => "localtime",
    }
);

string_enum!(
    /// OS family presets
    OsFamily, "os type", {
        Generic => "linux" | "generic",
        ModernDesktop => "windows" | "modern-desktop",
        Legacy => "legacy",
    }
);

string_enum!(
    /// How a NIC is attached to the host
    NetMode, "net mode", {
        Network => "network" | "nat",
        Bridge => "bridge",
        Direct => "macvtap" | "direct",
    }
);

string_enum!(
    /// Disk image format
    ImageFormat, "image format", {
        Qcow2 => "qcow2",
        Raw => "raw",
    }
);

impl Chipset {
    /// Detect the chipset from a `machine` attribute such as `pc-q35-7.2`
    pub fn from_machine_type(machine: Option<&str>) -> Self {
        match machine {
            Some(m) if m.contains("q35") => Chipset::Q35,
            _ => Chipset::I440fx,
        }
    }
}

/// Parse an optional enum field, treating an empty string as absent
pub fn parse_optional<T: FromStr<Err = Error>>(value: Option<&str>) -> Result<Option<T>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v.parse().map(Some),
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Machine creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateVmRequest {
    pub name: String,
    pub cpu: u32,
    /// MiB
    pub memory: u64,
    /// GiB
    pub disk: u64,
    pub os_type: Option<String>,
    pub disk_bus: Option<String>,
    pub net_model: Option<String>,
    pub machine: Option<String>,
    pub cpu_model: Option<String>,
    pub clock: Option<String>,
    /// Installation medium, must live under the media root
    pub iso: Option<String>,
    /// Secondary read-only medium (driver injection)
    pub virtio_iso: Option<String>,
    pub net_mode: Option<String>,
    pub network: Option<String>,
    pub bridge_name: Option<String>,
    pub direct_dev: Option<String>,
}

/// Define a machine around an existing disk image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportVmRequest {
    pub name: String,
    pub cpu: u32,
    pub memory: u64,
    pub disk_path: String,
    pub os_type: Option<String>,
    pub disk_bus: Option<String>,
    pub net_model: Option<String>,
    pub machine: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateVmRequest {
    pub cpu: u32,
    /// MiB
    pub memory: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachDiskRequest {
    pub source: String,
    pub target: Option<String>,
    pub bus: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachNicRequest {
    pub network: String,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachMediaRequest {
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneVmRequest {
    pub new_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenameVmRequest {
    pub new_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevertToNewRequest {
    pub new_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    Start,
    Shutdown,
    Destroy,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub action: BatchAction,
    pub names: Vec<String>,
}

/// Per-name failures of a batch; empty when every machine succeeded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub errors: BTreeMap<String, String>,
}

// ============================================================================
// Views
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub name: String,
    pub uuid: String,
    pub state: MachineState,
    pub cpu: u32,
    /// MiB
    pub memory: u64,
    /// Percent of allocated vcpus, absent until two samples exist
    pub cpu_usage: Option<f64>,
    /// MiB, only while running with a balloon driver
    pub mem_used: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDisk {
    pub device: String,
    pub source: Option<String>,
    pub target: String,
    pub bus: String,
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmNic {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: Option<String>,
    pub mac: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDetail {
    pub name: String,
    pub uuid: String,
    pub state: MachineState,
    pub cpu: u32,
    pub memory: u64,
    pub arch: Option<String>,
    pub machine: Option<String>,
    pub boot: Vec<String>,
    pub disks: Vec<VmDisk>,
    pub nics: Vec<VmNic>,
    pub vnc_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub description: String,
    pub state: String,
    pub created_at: i64,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount: String,
    pub device: String,
    /// GiB
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub cpu_model: String,
    pub cpu_count: u32,
    pub cpu_usage: f64,
    /// MiB
    pub memory_total: u64,
    pub memory_free: u64,
    pub vm_running: usize,
    pub vm_total: usize,
    pub uptime: u64,
    pub load_avg: [f64; 3],
    pub disks: Vec<DiskUsage>,
}

/// Whether an update produced a new definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied,
    Unchanged,
}

// ============================================================================
// Networks, pools and media
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub uuid: String,
    pub active: bool,
    /// Forward mode, empty for isolated networks
    pub forward: String,
    pub bridge: String,
    /// `address/prefix` of the first IPv4 range
    pub subnet: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    #[serde(default)]
    pub bridge: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub dhcp_start: String,
    #[serde(default)]
    pub dhcp_end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub ip: String,
    pub mac: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub uuid: String,
    pub active: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    /// GiB, only reported while active
    pub capacity: u64,
    pub allocation: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateStoragePoolRequest {
    pub name: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// GiB
    pub capacity: u64,
    pub allocation: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    #[serde(default)]
    pub pool: String,
    pub name: String,
    /// GiB, defaults to 20
    #[serde(default)]
    pub capacity: u64,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoFile {
    pub name: String,
    pub path: String,
    /// Bytes
    pub size: u64,
}

// ============================================================================
// Port forwarding
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A host-to-guest forwarding rule, persisted and programmed elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub protocol: Protocol,
    pub host_port: u16,
    /// Inclusive end of a host port range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port_end: Option<u16>,
    pub guest_ip: String,
    pub guest_port: u16,
    #[serde(default)]
    pub comment: String,
}

impl PortForwardRule {
    pub fn host_range(&self) -> (u16, u16) {
        (self.host_port, self.host_port_end.unwrap_or(self.host_port))
    }

    pub fn id(&self) -> String {
        let (start, end) = self.host_range();
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        format!("{}-{}-{}-{}-{}", proto, start, end, self.guest_ip, self.guest_port)
    }
}
