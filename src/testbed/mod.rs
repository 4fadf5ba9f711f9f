//! Testbed model: SUT and TG nodes, their ports, the links between them and
//! the fixed IPv4 addressing plan.

pub mod linux;
pub mod session;
pub mod tg;

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::packet::verify::LinkAddresses;
use crate::packet::{Packet, PacketError};
use session::SessionError;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("expected exactly 2 links between SUT and TG ports, found {found}")]
    LinkCount { found: usize },
}

#[derive(Debug, Error)]
pub enum TestbedError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("interface {name} not found on the traffic generator host")]
    InterfaceNotFound { name: String },

    #[error("datalink channel on {name} is not an Ethernet channel")]
    UnsupportedChannel { name: String },

    #[error("datalink error on {name}: {source}")]
    Datalink {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("capture interrupted by operator")]
    Interrupted,
}

/// A physical port on a testbed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Identifier of this port, unique across the testbed (e.g. PCI address).
    pub identifier: String,
    /// Identifier of the port on the other node this port is cabled to.
    pub peer: String,
    #[serde(rename = "mac")]
    pub mac_address: MacAddr,
    /// Interface name the node's OS uses for this port.
    pub os_name: String,
}

/// One SUT port cabled to one TG port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLink {
    pub sut_port: Port,
    pub tg_port: Port,
}

/// An IPv4 address with its prefix length, as assigned to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl InterfaceAddress {
    pub const fn new(ip: Ipv4Addr, prefix_len: u8) -> Self {
        Self { ip, prefix_len }
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

pub const SUT_INGRESS_ADDRESS: InterfaceAddress =
    InterfaceAddress::new(Ipv4Addr::new(192, 168, 100, 2), 24);
pub const SUT_EGRESS_ADDRESS: InterfaceAddress =
    InterfaceAddress::new(Ipv4Addr::new(192, 168, 101, 2), 24);
pub const TG_EGRESS_ADDRESS: InterfaceAddress =
    InterfaceAddress::new(Ipv4Addr::new(192, 168, 100, 3), 24);
pub const TG_INGRESS_ADDRESS: InterfaceAddress =
    InterfaceAddress::new(Ipv4Addr::new(192, 168, 101, 3), 24);

/// Capabilities shared by the SUT and TG nodes.
pub trait Node {
    fn name(&self) -> &str;

    fn ports(&self) -> &[Port];

    fn configure_port_address(
        &mut self,
        address: &InterfaceAddress,
        port: &Port,
        delete: bool,
    ) -> Result<(), TestbedError>;

    fn configure_port_state(&mut self, port: &Port, enabled: bool) -> Result<(), TestbedError>;

    /// Most recent commands issued on this node, oldest first.
    fn recent_commands(&self) -> Vec<String> {
        Vec::new()
    }
}

pub trait SutNode: Node {
    fn configure_ipv4_forwarding(&mut self, enabled: bool) -> Result<(), TestbedError>;

    /// Stop every process the test suites may have started on the SUT.
    fn terminate_managed_processes(&mut self) -> Result<(), TestbedError>;
}

pub trait TrafficGenerator {
    /// Send `packet` out of `egress` and return what arrived on `ingress`
    /// within `duration`.
    fn transmit_and_capture(
        &mut self,
        packet: &Packet,
        egress: &Port,
        ingress: &Port,
        duration: Duration,
    ) -> Result<Vec<Packet>, TestbedError>;
}

pub trait TgNode: Node + TrafficGenerator {}

impl<T: Node + TrafficGenerator> TgNode for T {}

/// The pair of nodes a run executes against.
pub struct Testbed {
    pub sut: Box<dyn SutNode>,
    pub tg: Box<dyn TgNode>,
}

/// Find every SUT/TG port pair whose identifiers point at each other.
pub fn find_links(sut_ports: &[Port], tg_ports: &[Port]) -> Vec<PortLink> {
    let mut links = Vec::new();
    for sut_port in sut_ports {
        for tg_port in tg_ports {
            if sut_port.identifier == tg_port.peer && sut_port.peer == tg_port.identifier {
                links.push(PortLink {
                    sut_port: sut_port.clone(),
                    tg_port: tg_port.clone(),
                });
            }
        }
    }
    links
}

/// Roles of the four linked ports. The first link (in SUT port order)
/// carries TG -> SUT traffic, the second SUT -> TG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub sut_ingress: Port,
    pub sut_egress: Port,
    pub tg_ingress: Port,
    pub tg_egress: Port,
}

impl Topology {
    pub fn discover(sut_ports: &[Port], tg_ports: &[Port]) -> Result<Self, TopologyError> {
        let links = find_links(sut_ports, tg_ports);
        debug!(links = links.len(), "Discovered SUT/TG port links");
        match <[PortLink; 2]>::try_from(links) {
            Ok([inbound, outbound]) => Ok(Self {
                sut_ingress: inbound.sut_port,
                tg_egress: inbound.tg_port,
                sut_egress: outbound.sut_port,
                tg_ingress: outbound.tg_port,
            }),
            Err(links) => Err(TopologyError::LinkCount { found: links.len() }),
        }
    }

    pub fn link_addresses(&self) -> LinkAddresses {
        LinkAddresses {
            sut_ingress_mac: self.sut_ingress.mac_address,
            sut_egress_mac: self.sut_egress.mac_address,
            tg_ingress_mac: self.tg_ingress.mac_address,
            tg_egress_mac: self.tg_egress.mac_address,
            tg_ingress_ip: TG_INGRESS_ADDRESS.ip,
            tg_egress_ip: TG_EGRESS_ADDRESS.ip,
        }
    }
}
