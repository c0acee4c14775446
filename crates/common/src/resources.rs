//! Network, storage pool and volume documents

use crate::definition::{escape_attr, escape_text};
use crate::{Error, Result};
use roxmltree::{Document, Node};
use std::net::Ipv4Addr;

const GIB: u64 = 1 << 30;

/// Fields read from a network document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkMeta {
    pub uuid: String,
    pub forward: String,
    pub bridge: String,
    pub subnet: String,
}

/// Fields read from a storage pool document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMeta {
    pub uuid: String,
    pub kind: String,
    pub path: String,
}

/// Addressing of a NAT network with one DHCP range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatNetwork {
    pub name: String,
    pub bridge: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
}

fn parse(xml: &str) -> Result<Document<'_>> {
    Document::parse(xml).map_err(|e| Error::Definition(format!("malformed document: {}", e)))
}

fn child<'a, 'i>(node: Node<'a, 'i>, tag: &str) -> Option<Node<'a, 'i>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == tag)
}

fn text(node: Option<Node<'_, '_>>) -> String {
    node.and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

fn attr(node: Option<Node<'_, '_>>, name: &str) -> String {
    node.and_then(|n| n.attribute(name))
        .unwrap_or_default()
        .to_string()
}

/// Prefix length of a contiguous IPv4 netmask
pub fn netmask_prefix(mask: Ipv4Addr) -> Option<u32> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    (bits.checked_shl(ones).unwrap_or(0) == 0).then_some(ones)
}

pub fn parse_network(xml: &str) -> Result<NetworkMeta> {
    let doc = parse(xml)?;
    let root = doc.root_element();
    let ip = root
        .children()
        .find(|n| n.has_tag_name("ip") && n.attribute("family").map_or(true, |f| f == "ipv4"));

    let address = attr(ip, "address");
    let prefix = ip.and_then(|n| {
        n.attribute("prefix")
            .and_then(|p| p.parse::<u32>().ok())
            .or_else(|| {
                n.attribute("netmask")
                    .and_then(|m| m.parse::<Ipv4Addr>().ok())
                    .and_then(netmask_prefix)
            })
    });
    let subnet = match prefix {
        Some(prefix) if !address.is_empty() => format!("{}/{}", address, prefix),
        _ => address,
    };

    Ok(NetworkMeta {
        uuid: text(child(root, "uuid")),
        forward: attr(child(root, "forward"), "mode"),
        bridge: attr(child(root, "bridge"), "name"),
        subnet,
    })
}

impl NatNetwork {
    pub fn document(&self) -> String {
        format!(
            "<network>\n  <name>{}</name>\n  <forward mode='nat'/>\n  <bridge name='{}' stp='on' delay='0'/>\n  <ip address='{}' netmask='{}'>\n    <dhcp>\n      <range start='{}' end='{}'/>\n    </dhcp>\n  </ip>\n</network>\n",
            escape_text(&self.name),
            escape_attr(&self.bridge),
            self.address,
            self.netmask,
            self.dhcp_start,
            self.dhcp_end
        )
    }
}

pub fn parse_pool(xml: &str) -> Result<PoolMeta> {
    let doc = parse(xml)?;
    let root = doc.root_element();
    Ok(PoolMeta {
        uuid: text(child(root, "uuid")),
        kind: root.attribute("type").unwrap_or_default().to_string(),
        path: text(child(root, "target").and_then(|t| child(t, "path"))),
    })
}

/// Directory-backed pool
pub fn dir_pool_document(name: &str, path: &str) -> String {
    format!(
        "<pool type='dir'>\n  <name>{}</name>\n  <target>\n    <path>{}</path>\n  </target>\n</pool>\n",
        escape_text(name),
        escape_text(path)
    )
}

pub fn volume_document(name: &str, capacity_gib: u64, format: &str) -> String {
    format!(
        "<volume>\n  <name>{}</name>\n  <capacity unit='G'>{}</capacity>\n  <target><format type='{}'/></target>\n</volume>\n",
        escape_text(name),
        capacity_gib,
        escape_attr(format)
    )
}

/// Label of a volume kind code
pub fn volume_kind(code: u32) -> &'static str {
    match code {
        0 => "file",
        1 => "block",
        2 => "dir",
        3 => "network",
        _ => "unknown",
    }
}

pub fn gib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

pub fn gib_floor(bytes: u64) -> u64 {
    bytes / GIB
}
