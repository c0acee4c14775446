//! Machine definition codec
//!
//! Reads only the fields a caller asks for and edits documents by splicing
//! byte ranges of the parsed tree, so untouched content keeps its exact
//! formatting.

use crate::types::{VmDisk, VmNic};
use crate::{Error, Result};
use roxmltree::{Document, Node};
use std::ops::Range;

/// A parsed machine definition borrowed from its source text
pub struct Definition<'a> {
    source: &'a str,
    doc: Document<'a>,
}

/// Graphics endpoint of a definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graphics {
    pub kind: String,
    /// Only allocated while the machine runs
    pub port: Option<u16>,
    pub listen: Option<String>,
}

/// First optical drive found in a definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpticalDrive {
    pub target: String,
    pub bus: String,
    pub source: Option<String>,
}

/// Fields read back from a snapshot document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub name: String,
    pub description: String,
    pub state: String,
    pub created_at: i64,
}

fn malformed(err: roxmltree::Error) -> Error {
    Error::Definition(format!("malformed document: {}", err))
}

fn child<'a, 'i>(node: Node<'a, 'i>, tag: &str) -> Option<Node<'a, 'i>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == tag)
}

fn children<'a, 'i: 'a>(node: Node<'a, 'i>, tag: &'a str) -> impl Iterator<Item = Node<'a, 'i>> + 'a {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == tag)
}

fn text_of(node: Node<'_, '_>) -> String {
    node.text().map(|t| t.trim().to_string()).unwrap_or_default()
}

/// Convert a libvirt memory quantity to MiB
pub fn to_mib(value: u64, unit: Option<&str>) -> Result<u64> {
    let bytes_per_unit: u64 = match unit.unwrap_or("KiB") {
        "b" | "bytes" => 1,
        "KB" => 1_000,
        "k" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "G" | "GiB" => 1 << 30,
        "TB" => 1_000_000_000_000,
        "T" | "TiB" => 1 << 40,
        other => return Err(Error::Definition(format!("unknown memory unit: {}", other))),
    };
    Ok(value.saturating_mul(bytes_per_unit) / (1 << 20))
}

impl<'a> Definition<'a> {
    pub fn parse(xml: &'a str) -> Result<Self> {
        let doc = Document::parse(xml).map_err(malformed)?;
        if doc.root_element().tag_name().name() != "domain" {
            return Err(Error::Definition("root element is not <domain>".to_string()));
        }
        Ok(Self { source: xml, doc })
    }

    fn domain(&self) -> Node<'_, 'a> {
        self.doc.root_element()
    }

    fn devices(&self) -> impl Iterator<Item = Node<'_, 'a>> {
        child(self.domain(), "devices")
            .into_iter()
            .flat_map(|d| d.children().filter(|n| n.is_element()))
    }

    pub fn name(&self) -> Option<String> {
        child(self.domain(), "name").map(text_of)
    }

    pub fn uuid(&self) -> Option<String> {
        child(self.domain(), "uuid").map(text_of)
    }

    pub fn vcpus(&self) -> Result<u32> {
        match child(self.domain(), "vcpu") {
            Some(node) => text_of(node)
                .parse()
                .map_err(|_| Error::Definition(format!("bad vcpu count: {}", text_of(node)))),
            None => Ok(1),
        }
    }

    pub fn memory_mib(&self) -> Result<u64> {
        let node = child(self.domain(), "memory")
            .ok_or_else(|| Error::Definition("missing <memory>".to_string()))?;
        let value: u64 = text_of(node)
            .parse()
            .map_err(|_| Error::Definition(format!("bad memory size: {}", text_of(node))))?;
        to_mib(value, node.attribute("unit"))
    }

    pub fn arch(&self) -> Option<String> {
        child(self.domain(), "os")
            .and_then(|os| child(os, "type"))
            .and_then(|t| t.attribute("arch"))
            .map(str::to_string)
    }

    pub fn machine_type(&self) -> Option<String> {
        child(self.domain(), "os")
            .and_then(|os| child(os, "type"))
            .and_then(|t| t.attribute("machine"))
            .map(str::to_string)
    }

    /// `dev` values of the os-level boot list, in order
    pub fn boot_order(&self) -> Vec<String> {
        child(self.domain(), "os")
            .map(|os| {
                children(os, "boot")
                    .filter_map(|b| b.attribute("dev"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn disks(&self) -> Vec<VmDisk> {
        self.devices()
            .filter(|n| n.tag_name().name() == "disk")
            .map(|disk| {
                let target = child(disk, "target");
                VmDisk {
                    device: disk.attribute("device").unwrap_or("disk").to_string(),
                    source: child(disk, "source")
                        .and_then(|s| s.attribute("file").or_else(|| s.attribute("dev")))
                        .map(str::to_string),
                    target: target
                        .and_then(|t| t.attribute("dev"))
                        .unwrap_or_default()
                        .to_string(),
                    bus: target
                        .and_then(|t| t.attribute("bus"))
                        .unwrap_or_default()
                        .to_string(),
                    format: child(disk, "driver")
                        .and_then(|d| d.attribute("type"))
                        .map(str::to_string),
                }
            })
            .collect()
    }

    pub fn interfaces(&self) -> Vec<VmNic> {
        self.devices()
            .filter(|n| n.tag_name().name() == "interface")
            .map(|nic| VmNic {
                kind: nic.attribute("type").unwrap_or_default().to_string(),
                source: child(nic, "source")
                    .and_then(|s| {
                        s.attribute("network")
                            .or_else(|| s.attribute("bridge"))
                            .or_else(|| s.attribute("dev"))
                    })
                    .map(str::to_string),
                mac: child(nic, "mac")
                    .and_then(|m| m.attribute("address"))
                    .map(str::to_string),
                model: child(nic, "model")
                    .and_then(|m| m.attribute("type"))
                    .map(str::to_string),
            })
            .collect()
    }

    pub fn graphics(&self) -> Option<Graphics> {
        self.devices()
            .find(|n| n.tag_name().name() == "graphics")
            .map(|g| Graphics {
                kind: g.attribute("type").unwrap_or_default().to_string(),
                port: g
                    .attribute("port")
                    .and_then(|p| p.parse::<i32>().ok())
                    .filter(|p| *p > 0)
                    .and_then(|p| u16::try_from(p).ok()),
                listen: g.attribute("listen").map(str::to_string),
            })
    }

    pub fn optical_drive(&self) -> Option<OpticalDrive> {
        self.disks()
            .into_iter()
            .find(|d| d.device == "cdrom")
            .map(|d| OpticalDrive {
                target: d.target,
                bus: d.bus,
                source: d.source,
            })
    }

    /// Backing paths of writable disks, excluding optical media
    pub fn backing_files(&self) -> Vec<String> {
        self.disks()
            .into_iter()
            .filter(|d| d.device == "disk")
            .filter_map(|d| d.source)
            .collect()
    }

    fn fragment<F>(&self, tag: &str, matches: F) -> Option<String>
    where
        F: Fn(Node<'_, 'a>) -> bool,
    {
        self.devices()
            .find(|n| n.tag_name().name() == tag && matches(*n))
            .map(|n| self.source[n.range()].to_string())
    }

    /// Exact source text of the disk attached at `target`
    pub fn disk_fragment(&self, target: &str) -> Option<String> {
        self.fragment("disk", |disk| {
            child(disk, "target").and_then(|t| t.attribute("dev")) == Some(target)
        })
    }

    /// Exact source text of the interface with hardware address `mac`
    pub fn interface_fragment(&self, mac: &str) -> Option<String> {
        self.fragment("interface", |nic| {
            child(nic, "mac")
                .and_then(|m| m.attribute("address"))
                .map(|a| a.eq_ignore_ascii_case(mac))
                .unwrap_or(false)
        })
    }
}

pub fn parse_snapshot(xml: &str) -> Result<SnapshotMeta> {
    let doc = Document::parse(xml).map_err(malformed)?;
    let root = doc.root_element();
    let field = |tag: &str| child(root, tag).map(text_of).unwrap_or_default();
    Ok(SnapshotMeta {
        name: field("name"),
        description: field("description"),
        state: field("state"),
        created_at: field("creationTime").parse().unwrap_or(0),
    })
}

/// Document submitted to create a snapshot
pub fn snapshot_document(name: &str, description: &str) -> String {
    format!(
        "<domainsnapshot>\n  <name>{}</name>\n  <description>{}</description>\n</domainsnapshot>\n",
        escape_text(name),
        escape_text(description)
    )
}

pub fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_attr(value: &str) -> String {
    escape_text(value)
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

// ============================================================================
// Surgical edits
// ============================================================================

struct Splice {
    range: Range<usize>,
    text: String,
}

fn apply(xml: &str, mut edits: Vec<Splice>) -> String {
    edits.sort_by(|a, b| b.range.start.cmp(&a.range.start));
    let mut out = xml.to_string();
    for edit in edits {
        out.replace_range(edit.range, &edit.text);
    }
    out
}

/// Byte offset just past the `>` closing the start tag of `node`
fn start_tag_end(xml: &str, node: Node<'_, '_>) -> Result<usize> {
    let start = node.range().start;
    xml[start..]
        .find('>')
        .map(|i| start + i + 1)
        .ok_or_else(|| Error::Definition(format!("unterminated <{}>", node.tag_name().name())))
}

fn leading_indent(xml: &str, offset: usize) -> Option<&str> {
    let line_start = xml[..offset].rfind('\n').map(|i| i + 1)?;
    let indent = &xml[line_start..offset];
    indent
        .chars()
        .all(|c| c == ' ' || c == '\t')
        .then_some(indent)
}

/// Rewrite a text-only element, forcing `attr` when given
fn rewrite_scalar(
    xml: &str,
    node: Node<'_, '_>,
    attr: Option<(&str, &str)>,
    value: &str,
) -> Result<Vec<Splice>> {
    if node.children().any(|c| c.is_element()) {
        return Err(Error::Definition(format!(
            "<{}> is not a scalar element",
            node.tag_name().name()
        )));
    }

    let tag = node.tag_name().name();
    let value = escape_text(value);
    let attr_differs = attr
        .map(|(k, v)| node.attribute(k) != Some(v))
        .unwrap_or(false);

    if attr_differs {
        let mut start = format!("<{}", tag);
        let mut forced = false;
        for a in node.attributes() {
            match attr {
                Some((k, v)) if a.name() == k => {
                    start.push_str(&format!(" {}='{}'", k, escape_attr(v)));
                    forced = true;
                }
                _ => start.push_str(&format!(" {}='{}'", a.name(), escape_attr(a.value()))),
            }
        }
        if let (false, Some((k, v))) = (forced, attr) {
            start.push_str(&format!(" {}='{}'", k, escape_attr(v)));
        }
        return Ok(vec![Splice {
            range: node.range(),
            text: format!("{}>{}</{}>", start, value, tag),
        }]);
    }

    if node.text().map(str::trim) == Some(value.as_str()) {
        return Ok(Vec::new());
    }

    let tag_end = start_tag_end(xml, node)?;
    let splice = match (node.first_child(), node.last_child()) {
        (Some(first), Some(last)) => Splice {
            range: first.range().start..last.range().end,
            text: value,
        },
        _ if xml[..tag_end].ends_with("/>") => Splice {
            range: tag_end - 2..tag_end,
            text: format!(">{}</{}>", value, tag),
        },
        _ => Splice {
            range: tag_end..tag_end,
            text: value,
        },
    };
    Ok(vec![splice])
}

/// Replace the text of the first `tag` element, keeping its attributes.
/// Returns the input unchanged when the value is already in place.
pub fn patch_scalar(xml: &str, tag: &str, value: &str) -> Result<String> {
    let doc = Document::parse(xml).map_err(malformed)?;
    let node = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == tag)
        .ok_or_else(|| Error::Definition(format!("missing <{}>", tag)))?;
    let edits = rewrite_scalar(xml, node, None, value)?;
    Ok(apply(xml, edits))
}

/// Set maximum and current memory to `mib`, normalising both to KiB
pub fn patch_memory(xml: &str, mib: u64) -> Result<String> {
    let doc = Document::parse(xml).map_err(malformed)?;
    let domain = doc.root_element();
    let memory = child(domain, "memory")
        .ok_or_else(|| Error::Definition("missing <memory>".to_string()))?;
    let kib = mib.saturating_mul(1024).to_string();

    let mut edits = rewrite_scalar(xml, memory, Some(("unit", "KiB")), &kib)?;
    match child(domain, "currentMemory") {
        Some(current) => edits.extend(rewrite_scalar(xml, current, Some(("unit", "KiB")), &kib)?),
        None => {
            let at = memory.range().end;
            let separator = leading_indent(xml, memory.range().start)
                .map(|indent| format!("\n{}", indent))
                .unwrap_or_default();
            edits.push(Splice {
                range: at..at,
                text: format!("{}<currentMemory unit='KiB'>{}</currentMemory>", separator, kib),
            });
        }
    }
    Ok(apply(xml, edits))
}

/// Replace the os-level boot list with `devices`
pub fn set_boot_order(xml: &str, devices: &[&str]) -> Result<String> {
    let doc = Document::parse(xml).map_err(malformed)?;
    let os = child(doc.root_element(), "os")
        .ok_or_else(|| Error::Definition("missing <os>".to_string()))?;
    let boots: Vec<_> = children(os, "boot").collect();

    let current: Vec<&str> = boots.iter().filter_map(|b| b.attribute("dev")).collect();
    if current == devices {
        return Ok(xml.to_string());
    }

    let anchor = boots.first().copied().or_else(|| child(os, "type"));
    let indent = anchor
        .and_then(|n| leading_indent(xml, n.range().start))
        .unwrap_or("");
    let list = devices
        .iter()
        .map(|d| format!("<boot dev='{}'/>", escape_attr(d)))
        .collect::<Vec<_>>()
        .join(&format!("\n{}", indent));

    let mut edits = Vec::new();
    match boots.split_first() {
        Some((first, rest)) => {
            edits.push(Splice {
                range: first.range(),
                text: list,
            });
            for boot in rest {
                let end = boot.range().end;
                let start = xml[..boot.range().start].trim_end().len();
                edits.push(Splice {
                    range: start..end,
                    text: String::new(),
                });
            }
        }
        None => {
            let at = match child(os, "type") {
                Some(t) => t.range().end,
                None => start_tag_end(xml, os)?,
            };
            edits.push(Splice {
                range: at..at,
                text: format!("\n{}{}", indent, list),
            });
        }
    }
    Ok(apply(xml, edits))
}

/// Put `dev` in the boot list ahead of the disk unless it is already listed
pub fn ensure_boot_entry(xml: &str, dev: &str) -> Result<String> {
    let order = Definition::parse(xml)?.boot_order();
    if order.iter().any(|d| d == dev) {
        return Ok(xml.to_string());
    }
    let mut next: Vec<&str> = order.iter().map(String::as_str).collect();
    match next.iter().position(|d| *d == "hd") {
        Some(i) => next.insert(i, dev),
        None => {
            next.push(dev);
            next.push("hd");
        }
    }
    set_boot_order(xml, &next)
}
