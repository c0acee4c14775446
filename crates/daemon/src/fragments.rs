//! Device description fragments

use kvmdeck_common::definition::escape_attr;
use kvmdeck_common::{DiskBus, Error, ImageFormat, NetMode, NicModel, Result};

/// A writable disk or an optical drive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub optical: bool,
    pub source: Option<String>,
    pub target: String,
    pub bus: String,
    pub format: ImageFormat,
}

impl DiskSpec {
    pub fn disk(source: &str, target: &str, bus: DiskBus, format: ImageFormat) -> Self {
        Self {
            optical: false,
            source: Some(source.to_string()),
            target: target.to_string(),
            bus: bus.to_string(),
            format,
        }
    }

    /// Optical drive on an already known bus; `None` leaves it empty
    pub fn optical(source: Option<&str>, target: &str, bus: &str) -> Self {
        Self {
            optical: true,
            source: source.map(str::to_string),
            target: target.to_string(),
            bus: bus.to_string(),
            format: ImageFormat::Raw,
        }
    }

    pub fn render(&self) -> String {
        let device = if self.optical { "cdrom" } else { "disk" };
        let mut out = format!("<disk type='file' device='{}'>\n", device);
        out.push_str(&format!("  <driver name='qemu' type='{}'/>\n", self.format));
        if let Some(source) = &self.source {
            out.push_str(&format!("  <source file='{}'/>\n", escape_attr(source)));
        }
        out.push_str(&format!(
            "  <target dev='{}' bus='{}'/>\n",
            escape_attr(&self.target),
            escape_attr(&self.bus)
        ));
        if self.optical {
            out.push_str("  <readonly/>\n");
        }
        out.push_str("</disk>\n");
        out
    }
}

/// Where a NIC is plugged in on the host side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAttachment {
    Network(String),
    Bridge(String),
    Direct(String),
}

impl NetAttachment {
    /// Pick the source for `mode`; direct attachment has no sensible default
    pub fn resolve(mode: NetMode, source: Option<&str>) -> Result<Self> {
        let source = source.map(str::trim).filter(|s| !s.is_empty());
        Ok(match mode {
            NetMode::Network => NetAttachment::Network(source.unwrap_or("default").to_string()),
            NetMode::Bridge => NetAttachment::Bridge(source.unwrap_or("br0").to_string()),
            NetMode::Direct => NetAttachment::Direct(
                source
                    .ok_or_else(|| {
                        Error::Validation("direct attachment requires a host device".to_string())
                    })?
                    .to_string(),
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSpec {
    pub attachment: NetAttachment,
    pub model: NicModel,
    pub mac: Option<String>,
}

impl NicSpec {
    pub fn render(&self) -> String {
        let (kind, source) = match &self.attachment {
            NetAttachment::Network(n) => ("network", format!("<source network='{}'/>", escape_attr(n))),
            NetAttachment::Bridge(b) => ("bridge", format!("<source bridge='{}'/>", escape_attr(b))),
            NetAttachment::Direct(d) => (
                "direct",
                format!("<source dev='{}' mode='bridge'/>", escape_attr(d)),
            ),
        };
        let mut out = format!("<interface type='{}'>\n", kind);
        if let Some(mac) = &self.mac {
            out.push_str(&format!("  <mac address='{}'/>\n", escape_attr(mac)));
        }
        out.push_str(&format!("  {}\n", source));
        out.push_str(&format!("  <model type='{}'/>\n", self.model));
        out.push_str("</interface>\n");
        out
    }
}

pub fn graphics(listen: &str) -> String {
    format!(
        "<graphics type='vnc' port='-1' autoport='yes' listen='{}'/>\n",
        escape_attr(listen)
    )
}

/// Indent every line of `fragment` by `width` spaces
pub fn indent(fragment: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    fragment
        .lines()
        .map(|l| if l.is_empty() { String::new() } else { format!("{}{}\n", pad, l) })
        .collect()
}
