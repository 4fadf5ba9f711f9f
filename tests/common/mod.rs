//! In-memory testbed nodes for integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use pnet::util::MacAddr;

use dataplanerunner::packet::{Layer, Packet};
use dataplanerunner::testbed::session::SessionError;
use dataplanerunner::testbed::{
    InterfaceAddress, Node, Port, SutNode, Testbed, TestbedError, Topology, TrafficGenerator,
};

pub type EventLog = Rc<RefCell<Vec<String>>>;

pub const SUT_INGRESS_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x01);
pub const SUT_EGRESS_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x02);
pub const TG_INGRESS_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x03);
pub const TG_EGRESS_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x04);

fn port(identifier: &str, peer: &str, mac: MacAddr, os_name: &str) -> Port {
    Port {
        identifier: identifier.to_string(),
        peer: peer.to_string(),
        mac_address: mac,
        os_name: os_name.to_string(),
    }
}

pub fn sut_ports() -> Vec<Port> {
    vec![
        port("sut0", "tg0", SUT_INGRESS_MAC, "sut-in"),
        port("sut1", "tg1", SUT_EGRESS_MAC, "sut-out"),
    ]
}

pub fn tg_ports() -> Vec<Port> {
    vec![
        port("tg1", "sut1", TG_INGRESS_MAC, "tg-in"),
        port("tg0", "sut0", TG_EGRESS_MAC, "tg-out"),
    ]
}

pub fn topology() -> Topology {
    Topology::discover(&sut_ports(), &tg_ports()).unwrap()
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.borrow().clone()
}

pub struct MockSut {
    pub ports: Vec<Port>,
    pub log: EventLog,
    pub fail_terminate: bool,
}

impl MockSut {
    pub fn new(log: EventLog) -> Self {
        Self {
            ports: sut_ports(),
            log,
            fail_terminate: false,
        }
    }

    fn record(&self, event: String) {
        self.log.borrow_mut().push(event);
    }
}

impl Node for MockSut {
    fn name(&self) -> &str {
        "mock-sut"
    }

    fn ports(&self) -> &[Port] {
        &self.ports
    }

    fn configure_port_address(
        &mut self,
        address: &InterfaceAddress,
        port: &Port,
        delete: bool,
    ) -> Result<(), TestbedError> {
        let action = if delete { "del" } else { "add" };
        self.record(format!("sut {} {} {}", action, address, port.os_name));
        Ok(())
    }

    fn configure_port_state(&mut self, port: &Port, enabled: bool) -> Result<(), TestbedError> {
        let state = if enabled { "up" } else { "down" };
        self.record(format!("sut {} {}", port.os_name, state));
        Ok(())
    }

    fn recent_commands(&self) -> Vec<String> {
        self.log.borrow().iter().rev().take(10).rev().cloned().collect()
    }
}

impl SutNode for MockSut {
    fn configure_ipv4_forwarding(&mut self, enabled: bool) -> Result<(), TestbedError> {
        self.record(format!("sut forwarding {}", if enabled { "on" } else { "off" }));
        Ok(())
    }

    fn terminate_managed_processes(&mut self) -> Result<(), TestbedError> {
        self.record("sut terminate".to_string());
        if self.fail_terminate {
            return Err(SessionError::CommandFailed {
                command: "pkill -f testpmd".to_string(),
                exit_code: 2,
                stderr: "pkill: permission denied".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// What the mock TG sees come back after sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TgBehavior {
    /// The SUT routes the packet back out of its egress port.
    Forward,
    /// Nothing comes back.
    Blackhole,
    /// The sent frame comes back unchanged, as if the ports were looped.
    Loopback,
}

pub struct MockTg {
    pub ports: Vec<Port>,
    pub log: EventLog,
    pub behavior: TgBehavior,
    pub sent: Rc<RefCell<Vec<Packet>>>,
}

impl MockTg {
    pub fn new(log: EventLog, behavior: TgBehavior) -> Self {
        Self {
            ports: tg_ports(),
            log,
            behavior,
            sent: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn record(&self, event: String) {
        self.log.borrow_mut().push(event);
    }
}

impl Node for MockTg {
    fn name(&self) -> &str {
        "mock-tg"
    }

    fn ports(&self) -> &[Port] {
        &self.ports
    }

    fn configure_port_address(
        &mut self,
        address: &InterfaceAddress,
        port: &Port,
        delete: bool,
    ) -> Result<(), TestbedError> {
        let action = if delete { "del" } else { "add" };
        self.record(format!("tg {} {} {}", action, address, port.os_name));
        Ok(())
    }

    fn configure_port_state(&mut self, port: &Port, enabled: bool) -> Result<(), TestbedError> {
        let state = if enabled { "up" } else { "down" };
        self.record(format!("tg {} {}", port.os_name, state));
        Ok(())
    }
}

fn padded(packet: &Packet) -> Result<Packet, TestbedError> {
    let mut bytes = packet.build()?;
    if bytes.len() < 60 {
        bytes.resize(60, 0);
    }
    Ok(Packet::dissect(&bytes))
}

impl TrafficGenerator for MockTg {
    fn transmit_and_capture(
        &mut self,
        packet: &Packet,
        egress: &Port,
        ingress: &Port,
        _duration: Duration,
    ) -> Result<Vec<Packet>, TestbedError> {
        self.record(format!("tg send {} -> {}", egress.os_name, ingress.os_name));
        self.sent.borrow_mut().push(packet.clone());

        // Unrelated traffic seen on the ingress port.
        let noise = Packet::new()
            .with(dataplanerunner::packet::Ether {
                src: MacAddr(0x02, 0xff, 0, 0, 0, 0x01),
                dst: MacAddr::broadcast(),
                ethertype: None,
            })
            .with(Layer::Raw(vec![0; 28]));

        let reply = match self.behavior {
            TgBehavior::Blackhole => None,
            TgBehavior::Loopback => Some(padded(packet)?),
            TgBehavior::Forward => {
                let mut layers = packet.layers().to_vec();
                if let Some(Layer::Ether(ether)) = layers.get_mut(0) {
                    ether.src = SUT_EGRESS_MAC;
                    ether.dst = ingress.mac_address;
                }
                if let Some(Layer::Ipv4(ip)) = layers.get_mut(1) {
                    ip.ttl -= 1;
                }
                Some(padded(&Packet::from_layers(layers))?)
            }
        };

        Ok(std::iter::once(padded(&noise)?).chain(reply).collect())
    }
}

/// A testbed of mock nodes sharing one event log.
pub fn testbed(behavior: TgBehavior) -> (Testbed, EventLog) {
    let log = EventLog::default();
    let testbed = Testbed {
        sut: Box::new(MockSut::new(log.clone())),
        tg: Box::new(MockTg::new(log.clone(), behavior)),
    };
    (testbed, log)
}
