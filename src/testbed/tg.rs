//! Traffic generator on the local host using `pnet` layer 2 channels.

use std::io;
use std::time::{Duration, Instant};

use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use tracing::{debug, info, warn};

use super::linux::LinuxNode;
use super::{InterfaceAddress, Node, Port, TestbedError, TrafficGenerator};
use crate::interrupt::Interrupt;
use crate::packet::Packet;

const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// TG node whose ports are local interfaces. Configuration commands go
/// through the wrapped [`LinuxNode`], traffic through raw sockets.
pub struct PnetTrafficGenerator {
    node: LinuxNode,
    interrupt: Interrupt,
}

impl PnetTrafficGenerator {
    pub fn new(node: LinuxNode, interrupt: Interrupt) -> Self {
        Self { node, interrupt }
    }
}

fn find_interface(name: &str) -> Result<NetworkInterface, TestbedError> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| TestbedError::InterfaceNotFound {
            name: name.to_string(),
        })
}

fn open_channel(
    port: &Port,
) -> Result<(Box<dyn DataLinkSender>, Box<dyn DataLinkReceiver>), TestbedError> {
    let interface = find_interface(&port.os_name)?;
    let config = Config {
        read_timeout: Some(READ_TIMEOUT),
        promiscuous: true,
        ..Default::default()
    };
    match datalink::channel(&interface, config) {
        Ok(Channel::Ethernet(tx, rx)) => Ok((tx, rx)),
        Ok(_) => Err(TestbedError::UnsupportedChannel {
            name: port.os_name.clone(),
        }),
        Err(source) => Err(TestbedError::Datalink {
            name: port.os_name.clone(),
            source,
        }),
    }
}

impl Node for PnetTrafficGenerator {
    fn name(&self) -> &str {
        self.node.name()
    }

    fn ports(&self) -> &[Port] {
        self.node.ports()
    }

    fn configure_port_address(
        &mut self,
        address: &InterfaceAddress,
        port: &Port,
        delete: bool,
    ) -> Result<(), TestbedError> {
        self.node.configure_port_address(address, port, delete)
    }

    fn configure_port_state(&mut self, port: &Port, enabled: bool) -> Result<(), TestbedError> {
        self.node.configure_port_state(port, enabled)
    }

    fn recent_commands(&self) -> Vec<String> {
        self.node.recent_commands()
    }
}

impl TrafficGenerator for PnetTrafficGenerator {
    fn transmit_and_capture(
        &mut self,
        packet: &Packet,
        egress: &Port,
        ingress: &Port,
        duration: Duration,
    ) -> Result<Vec<Packet>, TestbedError> {
        let frame = packet.build()?;

        // Start capturing before sending so a fast reply is not missed.
        let (_, mut rx) = open_channel(ingress)?;
        let (mut tx, _) = open_channel(egress)?;

        info!(
            egress = %egress.os_name,
            ingress = %ingress.os_name,
            packet = %packet.summary(),
            "Sending packet"
        );
        match tx.send_to(&frame, None) {
            Some(Ok(())) => {}
            Some(Err(source)) => {
                return Err(TestbedError::Datalink {
                    name: egress.os_name.clone(),
                    source,
                })
            }
            None => warn!(egress = %egress.os_name, "Send buffer too small, packet not sent"),
        }

        let mut received = Vec::new();
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.interrupt.should_stop() {
                return Err(TestbedError::Interrupted);
            }
            match rx.next() {
                Ok(bytes) => {
                    let captured = Packet::dissect(bytes);
                    debug!(packet = %captured.summary(), "Captured packet");
                    received.push(captured);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
                Err(source) => {
                    return Err(TestbedError::Datalink {
                        name: ingress.os_name.clone(),
                        source,
                    })
                }
            }
        }

        info!(count = received.len(), ingress = %ingress.os_name, "Capture finished");
        Ok(received)
    }
}
