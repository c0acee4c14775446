//! Semantic validation of caller-supplied values

use crate::types::{ImageFormat, PortForwardRule};
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};

/// Names may only use letters, digits, dot, dash and underscore
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation(format!("{} name must not be empty", kind)));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !ok {
        return Err(Error::Validation(format!("invalid {} name: {}", kind, name)));
    }
    Ok(())
}

fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `candidate` lexically and require it to sit strictly below `root`
pub fn contained_path(root: &Path, candidate: &str) -> Result<PathBuf> {
    if candidate.chars().any(|c| matches!(c, '<' | '>' | '&' | '\'' | '"')) {
        return Err(Error::Validation(format!("invalid characters in path: {}", candidate)));
    }
    let path = Path::new(candidate);
    if !path.is_absolute() {
        return Err(Error::Validation(format!("path must be absolute: {}", candidate)));
    }

    let root = clean(root);
    let resolved = clean(path);
    if resolved == root || !resolved.starts_with(&root) {
        return Err(Error::Validation(format!(
            "path {} is outside {}",
            candidate,
            root.display()
        )));
    }
    Ok(resolved)
}

/// Image format implied by a file extension
pub fn image_format(path: &Path) -> ImageFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("raw") | Some("img") => ImageFormat::Raw,
        _ => ImageFormat::Qcow2,
    }
}

pub fn validate_mac(mac: &str) -> Result<()> {
    let octets: Vec<&str> = mac.split(':').collect();
    let ok = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !ok {
        return Err(Error::Validation(format!("invalid MAC address: {}", mac)));
    }
    Ok(())
}

impl PortForwardRule {
    pub fn validate(&self) -> Result<()> {
        if self.host_port == 0 || self.guest_port == 0 {
            return Err(Error::Validation("ports must be between 1 and 65535".to_string()));
        }
        if let Some(end) = self.host_port_end {
            if end < self.host_port {
                return Err(Error::Validation(format!(
                    "host port range end {} is below start {}",
                    end, self.host_port
                )));
            }
        }
        self.guest_ip
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::Validation(format!("invalid guest IP: {}", self.guest_ip)))?;
        Ok(())
    }

    /// Whether both rules claim a common host port for the same protocol
    pub fn overlaps(&self, other: &PortForwardRule) -> bool {
        let (a_start, a_end) = self.host_range();
        let (b_start, b_end) = other.host_range();
        self.protocol == other.protocol && a_start <= b_end && b_start <= a_end
    }
}

/// Validate `rule` and check it against the rules already in place
pub fn check_port_forward(rule: &PortForwardRule, existing: &[PortForwardRule]) -> Result<()> {
    rule.validate()?;
    match existing.iter().find(|r| r.overlaps(rule)) {
        Some(clash) => Err(Error::conflict("port forward", clash.id())),
        None => Ok(()),
    }
}
