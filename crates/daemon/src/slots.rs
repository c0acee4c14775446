//! Device slot assignment
//!
//! Target names follow the guest device-addressing scheme: each bus family
//! owns a name prefix and hands out letters in order. IDE offers two
//! channels with two units each (`hda`..`hdd`); the optical drives occupy
//! the first channel on i440fx, so an IDE disk lands on `hdc`. q35 has no
//! IDE controller, its optical drives sit on SATA after the first port.

use kvmdeck_common::{Chipset, DiskBus, Error, Result};
use std::collections::HashSet;

/// A bus and the target-name range it allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRule {
    pub bus: DiskBus,
    pub prefix: &'static str,
    pub first: u8,
    pub last: u8,
}

impl SlotRule {
    pub fn target(&self, index: u8) -> String {
        format!("{}{}", self.prefix, (b'a' + index) as char)
    }

    /// Whether `target` is one of the names this rule hands out
    pub fn contains(&self, target: &str) -> bool {
        (self.first..=self.last).any(|i| self.target(i) == target)
    }

    /// First target of the rule not in `taken`
    pub fn next_free(&self, taken: &HashSet<String>) -> Option<String> {
        (self.first..=self.last)
            .map(|i| self.target(i))
            .find(|t| !taken.contains(t))
    }
}

const IDE_LAST: u8 = 3;
const NAMESPACE_LAST: u8 = 25;

const DISK_SLOTS: &[(DiskBus, Chipset, SlotRule)] = &[
    (DiskBus::Virtio, Chipset::I440fx, SlotRule { bus: DiskBus::Virtio, prefix: "vd", first: 0, last: NAMESPACE_LAST }),
    (DiskBus::Virtio, Chipset::Q35, SlotRule { bus: DiskBus::Virtio, prefix: "vd", first: 0, last: NAMESPACE_LAST }),
    (DiskBus::Sata, Chipset::I440fx, SlotRule { bus: DiskBus::Sata, prefix: "sd", first: 0, last: NAMESPACE_LAST }),
    (DiskBus::Sata, Chipset::Q35, SlotRule { bus: DiskBus::Sata, prefix: "sd", first: 0, last: NAMESPACE_LAST }),
    (DiskBus::Scsi, Chipset::I440fx, SlotRule { bus: DiskBus::Scsi, prefix: "sd", first: 0, last: NAMESPACE_LAST }),
    (DiskBus::Scsi, Chipset::Q35, SlotRule { bus: DiskBus::Scsi, prefix: "sd", first: 0, last: NAMESPACE_LAST }),
    (DiskBus::Ide, Chipset::I440fx, SlotRule { bus: DiskBus::Ide, prefix: "hd", first: 2, last: IDE_LAST }),
];

/// Primary (install) and secondary (driver) optical slots per chipset
const OPTICAL_SLOTS: &[(Chipset, SlotRule)] = &[
    (Chipset::I440fx, SlotRule { bus: DiskBus::Ide, prefix: "hd", first: 0, last: 1 }),
    (Chipset::Q35, SlotRule { bus: DiskBus::Sata, prefix: "sd", first: 1, last: 2 }),
];

pub fn disk_rule(bus: DiskBus, chipset: Chipset) -> Result<SlotRule> {
    DISK_SLOTS
        .iter()
        .find(|(b, c, _)| *b == bus && *c == chipset)
        .map(|(_, _, rule)| *rule)
        .ok_or_else(|| {
            Error::Unsupported(format!("{} disks on the {} chipset", bus, chipset))
        })
}

pub fn optical_rule(chipset: Chipset) -> Result<SlotRule> {
    OPTICAL_SLOTS
        .iter()
        .find(|(c, _)| *c == chipset)
        .map(|(_, rule)| *rule)
        .ok_or_else(|| Error::Unsupported(format!("optical drives on the {} chipset", chipset)))
}

/// Target of the first disk of a fresh definition
pub fn boot_disk_target(bus: DiskBus, chipset: Chipset) -> Result<String> {
    let rule = disk_rule(bus, chipset)?;
    Ok(rule.target(rule.first))
}

/// Install and driver media targets of a fresh definition
pub fn optical_targets(chipset: Chipset) -> Result<(SlotRule, String, String)> {
    let rule = optical_rule(chipset)?;
    Ok((rule, rule.target(rule.first), rule.target(rule.first + 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_disk_targets() {
        assert_eq!(boot_disk_target(DiskBus::Virtio, Chipset::I440fx).unwrap(), "vda");
        assert_eq!(boot_disk_target(DiskBus::Sata, Chipset::Q35).unwrap(), "sda");
        assert_eq!(boot_disk_target(DiskBus::Scsi, Chipset::I440fx).unwrap(), "sda");
        assert_eq!(boot_disk_target(DiskBus::Ide, Chipset::I440fx).unwrap(), "hdc");
    }

    #[test]
    fn test_ide_on_q35_is_unsupported() {
        let err = boot_disk_target(DiskBus::Ide, Chipset::Q35).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_optical_targets_by_chipset() {
        let (rule, install, driver) = optical_targets(Chipset::I440fx).unwrap();
        assert_eq!((rule.bus, install.as_str(), driver.as_str()), (DiskBus::Ide, "hda", "hdb"));
        let (rule, install, driver) = optical_targets(Chipset::Q35).unwrap();
        assert_eq!((rule.bus, install.as_str(), driver.as_str()), (DiskBus::Sata, "sdb", "sdc"));
    }

    #[test]
    fn test_fresh_targets_never_collide() {
        for chipset in [Chipset::I440fx, Chipset::Q35] {
            let (_, install, driver) = optical_targets(chipset).unwrap();
            for bus in [DiskBus::Virtio, DiskBus::Sata, DiskBus::Scsi, DiskBus::Ide] {
                if let Ok(disk) = boot_disk_target(bus, chipset) {
                    assert_ne!(disk, install);
                    assert_ne!(disk, driver);
                }
            }
        }
    }

    #[test]
    fn test_next_free_skips_taken() {
        let rule = disk_rule(DiskBus::Virtio, Chipset::Q35).unwrap();
        let taken: HashSet<String> = ["vda", "vdb"].iter().map(|s| s.to_string()).collect();
        assert_eq!(rule.next_free(&taken).as_deref(), Some("vdc"));

        let ide = disk_rule(DiskBus::Ide, Chipset::I440fx).unwrap();
        let full: HashSet<String> = ["hdc", "hdd"].iter().map(|s| s.to_string()).collect();
        assert_eq!(ide.next_free(&full), None);
    }

    #[test]
    fn test_rule_membership() {
        let sata = disk_rule(DiskBus::Sata, Chipset::Q35).unwrap();
        assert!(sata.contains("sda") && sata.contains("sdz"));
        assert!(!sata.contains("sd$") && !sata.contains("sd") && !sata.contains("vda"));

        let ide = disk_rule(DiskBus::Ide, Chipset::I440fx).unwrap();
        assert!(ide.contains("hdc"));
        assert!(!ide.contains("hda"));
    }
}
