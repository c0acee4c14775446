//! Virtual networks and their DHCP leases

use crate::hypervisor::Hypervisor;
use crate::session::Session;
use kvmdeck_common::resources::{self, NatNetwork};
use kvmdeck_common::validate::validate_name;
use kvmdeck_common::{CreateNetworkRequest, DhcpLease, Error, ErrorKind, Network, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const DEFAULT_ADDRESS: &str = "192.168.100.1";
const DEFAULT_NETMASK: &str = "255.255.255.0";
const DEFAULT_DHCP_START: &str = "192.168.100.100";
const DEFAULT_DHCP_END: &str = "192.168.100.200";

/// One entry of the DHCP server's status file
#[derive(Debug, Deserialize)]
struct LeaseEntry {
    #[serde(rename = "ip-address")]
    ip: String,
    #[serde(rename = "mac-address")]
    mac: String,
    #[serde(default)]
    hostname: String,
    #[serde(rename = "expiry-time", default)]
    expiry: i64,
}

pub struct Networks {
    session: Session,
    lease_dir: PathBuf,
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

fn address(value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::Validation(format!("invalid IP address: {}", value)))
}

/// Apply defaults and validate a creation request
pub fn plan_network(req: &CreateNetworkRequest) -> Result<NatNetwork> {
    validate_name("network", &req.name)?;
    let bridge = if req.bridge.is_empty() {
        format!("virbr-{}", req.name)
    } else {
        req.bridge.clone()
    };
    validate_name("bridge", &bridge)?;

    Ok(NatNetwork {
        name: req.name.clone(),
        bridge,
        address: address(or_default(&req.subnet, DEFAULT_ADDRESS))?,
        netmask: address(or_default(&req.netmask, DEFAULT_NETMASK))?,
        dhcp_start: address(or_default(&req.dhcp_start, DEFAULT_DHCP_START))?,
        dhcp_end: address(or_default(&req.dhcp_end, DEFAULT_DHCP_END))?,
    })
}

/// Parse a status file, keeping live IPv4 leases
fn parse_leases(content: &str, now: i64) -> Result<Vec<DhcpLease>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<LeaseEntry> = serde_json::from_str(content)?;
    Ok(entries
        .into_iter()
        .filter(|e| e.ip.parse::<Ipv4Addr>().is_ok())
        .filter(|e| e.expiry == 0 || e.expiry > now)
        .map(|e| DhcpLease {
            ip: e.ip,
            mac: e.mac,
            hostname: e.hostname,
        })
        .collect())
}

async fn describe(hv: &dyn Hypervisor, name: &str) -> Result<Network> {
    let active = hv.network_active(name).await?;
    let meta = resources::parse_network(&hv.network_xml(name).await?)?;
    Ok(Network {
        name: name.to_string(),
        uuid: meta.uuid,
        active,
        forward: meta.forward,
        bridge: meta.bridge,
        subnet: meta.subnet,
    })
}

impl Networks {
    pub fn new(session: Session, lease_dir: PathBuf) -> Self {
        Self { session, lease_dir }
    }

    /// Networks that vanish or fail to describe mid-listing are skipped
    pub async fn list(&self) -> Result<Vec<Network>> {
        let hv = self.session.acquire().await?;
        let mut out = Vec::new();
        for name in hv.list_networks().await? {
            match describe(&**hv, &name).await {
                Ok(net) => out.push(net),
                Err(e) if e.kind() == ErrorKind::Connectivity => return Err(e),
                Err(e) => debug!("Skipping network {}: {}", name, e),
            }
        }
        Ok(out)
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.session.acquire().await?.start_network(name).await?;
        info!("Started network {}", name);
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.session.acquire().await?.stop_network(name).await?;
        info!("Stopped network {}", name);
        Ok(())
    }

    /// Stop if running, then remove the definition
    pub async fn delete(&self, name: &str) -> Result<()> {
        let hv = self.session.acquire().await?;
        if let Err(e) = hv.stop_network(name).await {
            if e.kind() == ErrorKind::NotFound {
                return Err(e);
            }
            debug!("Network {} was not running: {}", name, e);
        }
        hv.undefine_network(name).await?;
        info!("Deleted network {}", name);
        Ok(())
    }

    /// Define a NAT network and try to start it; a failed start leaves it
    /// defined and inactive
    pub async fn create(&self, req: &CreateNetworkRequest) -> Result<()> {
        let plan = plan_network(req)?;
        let hv = self.session.acquire().await?;
        hv.define_network(&plan.document()).await?;
        info!("Defined network {} on {}", plan.name, plan.bridge);
        if let Err(e) = hv.start_network(&plan.name).await {
            warn!("Network {} defined but not started: {}", plan.name, e);
        }
        Ok(())
    }

    /// Current leases from the status file of the network's bridge
    pub async fn leases(&self, name: &str) -> Result<Vec<DhcpLease>> {
        let bridge = {
            let hv = self.session.acquire().await?;
            resources::parse_network(&hv.network_xml(name).await?)?.bridge
        };
        if bridge.is_empty() {
            return Ok(Vec::new());
        }
        let path = self.lease_dir.join(format!("{}.status", bridge));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        parse_leases(&content, chrono::Utc::now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{network_xml, FakeHypervisor};

    const STATUS: &str = r#"[
  {
    "ip-address": "192.168.122.50",
    "mac-address": "52:54:00:aa:bb:01",
    "hostname": "web",
    "client-id": "01:52:54:00:aa:bb:01",
    "expiry-time": 4102444800
  },
  {
    "ip-address": "192.168.122.51",
    "mac-address": "52:54:00:aa:bb:02",
    "expiry-time": 1000
  },
  {
    "ip-address": "fd00::50",
    "mac-address": "52:54:00:aa:bb:03",
    "expiry-time": 4102444800
  }
]"#;

    fn networks(fake: &FakeHypervisor, lease_dir: PathBuf) -> Networks {
        Networks::new(fake.session(), lease_dir)
    }

    #[test]
    fn test_plan_applies_defaults() {
        let plan = plan_network(&CreateNetworkRequest {
            name: "lab".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(plan.bridge, "virbr-lab");
        assert_eq!(plan.address, Ipv4Addr::new(192, 168, 100, 1));
        assert_eq!(plan.dhcp_end, Ipv4Addr::new(192, 168, 100, 200));
    }

    #[test]
    fn test_plan_rejects_bad_values() {
        let req = |name: &str, bridge: &str, subnet: &str| CreateNetworkRequest {
            name: name.to_string(),
            bridge: bridge.to_string(),
            subnet: subnet.to_string(),
            ..Default::default()
        };
        for bad in [req("lab net", "", ""), req("lab", "br0;", ""), req("lab", "", "300.1.1.1")] {
            let err = plan_network(&bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[test]
    fn test_parse_leases_keeps_live_ipv4() {
        let leases = parse_leases(STATUS, 1_700_000_000).unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].ip, "192.168.122.50");
        assert_eq!(leases[0].hostname, "web");
        assert!(parse_leases("", 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_reads_documents() {
        let fake = FakeHypervisor::new();
        fake.add_network("default", network_xml("default", "virbr0"), true);
        fake.add_network("lab", network_xml("lab", "virbr-lab"), false);

        let list = networks(&fake, PathBuf::from("/nonexistent")).list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "default");
        assert!(list[0].active);
        assert_eq!(list[0].forward, "nat");
        assert_eq!(list[0].subnet, "192.168.122.1/24");
        assert_eq!(list[1].bridge, "virbr-lab");
        assert!(!list[1].active);
    }

    #[tokio::test]
    async fn test_create_defines_and_starts() {
        let fake = FakeHypervisor::new();
        let nets = networks(&fake, PathBuf::from("/nonexistent"));
        nets.create(&CreateNetworkRequest {
            name: "lab".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let net = fake.network("lab").unwrap();
        assert!(net.active);
        assert!(net.xml.contains("<bridge name='virbr-lab' stp='on' delay='0'/>"));

        let err = nets
            .create(&CreateNetworkRequest {
                name: "lab".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_failed_start_keeps_definition() {
        let fake = FakeHypervisor::new();
        fake.fail("net_start");
        networks(&fake, PathBuf::from("/nonexistent"))
            .create(&CreateNetworkRequest {
                name: "lab".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!fake.network("lab").unwrap().active);
    }

    #[tokio::test]
    async fn test_delete_stops_then_undefines() {
        let fake = FakeHypervisor::new();
        fake.add_network("idle", network_xml("idle", "virbr9"), false);
        fake.add_network("busy", network_xml("busy", "virbr8"), true);
        let nets = networks(&fake, PathBuf::from("/nonexistent"));

        nets.delete("idle").await.unwrap();
        nets.delete("busy").await.unwrap();
        assert!(fake.network("idle").is_none());
        assert!(fake.network("busy").is_none());
        assert!(fake.calls().contains(&"net_stop busy".to_string()));

        let err = nets.delete("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let fake = FakeHypervisor::new();
        fake.add_network("lab", network_xml("lab", "virbr-lab"), false);
        let nets = networks(&fake, PathBuf::from("/nonexistent"));

        nets.start("lab").await.unwrap();
        assert!(fake.network("lab").unwrap().active);
        nets.stop("lab").await.unwrap();
        assert!(!fake.network("lab").unwrap().active);
        assert!(nets.stop("lab").await.is_err());
    }

    #[tokio::test]
    async fn test_leases_follow_the_bridge() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("virbr0.status"), STATUS).unwrap();
        let fake = FakeHypervisor::new();
        fake.add_network("default", network_xml("default", "virbr0"), true);
        fake.add_network("quiet", network_xml("quiet", "virbr5"), true);
        let nets = networks(&fake, dir.path().to_path_buf());

        let leases = nets.leases("default").await.unwrap();
        assert_eq!(leases[0].mac, "52:54:00:aa:bb:01");
        assert!(nets.leases("quiet").await.unwrap().is_empty());
        assert_eq!(nets.leases("ghost").await.unwrap_err().kind(), ErrorKind::NotFound);
    }
}
