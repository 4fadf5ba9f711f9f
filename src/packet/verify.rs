//! Direction-aware address injection and comparison of captured traffic.
//!
//! Assumes two links between SUT and TG: one carrying TG -> SUT traffic, the
//! other SUT -> TG. Sent packets get TG egress / SUT ingress link addresses,
//! expected packets get SUT egress / TG ingress link addresses. The IPv4 pair
//! is TG egress -> TG ingress in both directions, so the SUT routes between
//! its two ports.

use std::net::Ipv4Addr;

use pnet::util::MacAddr;
use tracing::debug;

use super::{Ether, Ipv4, Layer, LayerKind, Packet, PacketError};

/// Link and network addresses of the four testbed interfaces the verifier
/// needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddresses {
    pub sut_ingress_mac: MacAddr,
    pub sut_egress_mac: MacAddr,
    pub tg_ingress_mac: MacAddr,
    pub tg_egress_mac: MacAddr,
    pub tg_ingress_ip: Ipv4Addr,
    pub tg_egress_ip: Ipv4Addr,
}

#[derive(Debug, Clone)]
pub struct PacketVerifier {
    addresses: LinkAddresses,
}

impl PacketVerifier {
    pub fn new(addresses: LinkAddresses) -> Self {
        Self { addresses }
    }

    pub fn addresses(&self) -> &LinkAddresses {
        &self.addresses
    }

    /// Copy `template` with testbed addresses injected into its outermost
    /// Ethernet header and the IPv4 header right after it.
    ///
    /// `expected == false` is the TG -> SUT direction (what gets sent),
    /// `expected == true` the SUT -> TG direction (what should come back).
    /// The result is rebuilt from wire bytes so lengths and checksums match
    /// the new addresses.
    pub fn adjust_addresses(&self, template: &Packet, expected: bool) -> Result<Packet, PacketError> {
        let a = &self.addresses;
        let (src_mac, dst_mac) = if expected {
            (a.sut_egress_mac, a.tg_ingress_mac)
        } else {
            (a.tg_egress_mac, a.sut_ingress_mac)
        };

        let mut packet = template.clone();
        let mut layers = packet.layers_mut().iter_mut();
        match layers.next() {
            Some(Layer::Ether(ether)) => {
                ether.src = src_mac;
                ether.dst = dst_mac;
            }
            Some(other) => return Err(PacketError::NotEthernet { found: other.kind() }),
            None => return Err(PacketError::Empty),
        }

        // Same network pair for both directions.
        if let Some(Layer::Ipv4(ip)) = layers.next() {
            ip.src = a.tg_egress_ip;
            ip.dst = a.tg_ingress_ip;
        }

        Ok(Packet::dissect(&packet.build()?))
    }

    /// Whether `received` carries the same structure and addressing as
    /// `expected`, ignoring trailing padding on `received`.
    pub fn equivalent(&self, expected: &Packet, received: &Packet) -> bool {
        debug!(expected = %expected, received = %received, "Comparing packets");

        let l3 = expected.has_layer(LayerKind::Ipv4);
        for (exp, recv) in expected.layers().iter().zip(received.layers()) {
            let matched = match (exp, recv) {
                (Layer::Ether(_), Layer::Ether(frame)) => self.verify_l2_frame(frame, l3),
                (Layer::Ipv4(exp_ip), Layer::Ipv4(recv_ip)) => verify_l3_packet(recv_ip, exp_ip),
                _ if exp.kind() == recv.kind() => true,
                _ => {
                    debug!(expected = %exp.kind(), received = %recv.kind(), "Layers differ");
                    false
                }
            };
            if !matched {
                return false;
            }
        }

        let paired = expected.layers().len().min(received.layers().len());
        if let Some(missing) = expected.layers().get(paired) {
            debug!(layer = %missing, "The received packet did not contain an expected layer");
            return false;
        }
        if received.layers()[paired..]
            .iter()
            .any(|l| l.kind() != LayerKind::Padding)
        {
            debug!("The received packet had extra layers which were not padding");
            return false;
        }
        true
    }

    /// Whether any of `received` is equivalent to `expected`.
    pub fn verify_packet_present(&self, expected: &Packet, received: &[Packet]) -> bool {
        received.iter().any(|r| self.equivalent(expected, r))
    }

    fn verify_l2_frame(&self, received: &Ether, l3: bool) -> bool {
        let a = &self.addresses;
        debug!(
            received = %received.dst,
            expected = %a.tg_ingress_mac,
            "Comparing destination MAC"
        );
        if received.dst != a.tg_ingress_mac {
            return false;
        }

        // A network layer means the frame was routed through the SUT.
        let expected_src = if l3 { a.sut_egress_mac } else { a.tg_egress_mac };
        debug!(
            received = %received.src,
            expected = %expected_src,
            "Comparing source MAC"
        );
        received.src == expected_src
    }
}

fn verify_l3_packet(received: &Ipv4, expected: &Ipv4) -> bool {
    received.src == expected.src && received.dst == expected.dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Udp;

    fn verifier() -> PacketVerifier {
        PacketVerifier::new(LinkAddresses {
            sut_ingress_mac: MacAddr::new(0x02, 0, 0, 0, 0, 0x01),
            sut_egress_mac: MacAddr::new(0x02, 0, 0, 0, 0, 0x02),
            tg_ingress_mac: MacAddr::new(0x02, 0, 0, 0, 0, 0x03),
            tg_egress_mac: MacAddr::new(0x02, 0, 0, 0, 0, 0x04),
            tg_ingress_ip: Ipv4Addr::new(192, 168, 101, 3),
            tg_egress_ip: Ipv4Addr::new(192, 168, 100, 3),
        })
    }

    fn ether_ip() -> Packet {
        Packet::new().with(Ether::default()).with(Ipv4::default())
    }

    #[test]
    fn test_adjust_outbound_direction() {
        let v = verifier();
        let sent = v.adjust_addresses(&Packet::udp_datagram(), false).unwrap();
        match &sent.layers()[..2] {
            [Layer::Ether(e), Layer::Ipv4(ip)] => {
                assert_eq!(e.src, v.addresses().tg_egress_mac);
                assert_eq!(e.dst, v.addresses().sut_ingress_mac);
                assert_eq!(ip.src, Ipv4Addr::new(192, 168, 100, 3));
                assert_eq!(ip.dst, Ipv4Addr::new(192, 168, 101, 3));
            }
            other => panic!("unexpected layers: {:?}", other),
        }
    }

    #[test]
    fn test_adjust_expected_direction_keeps_network_pair() {
        let v = verifier();
        let outbound = v.adjust_addresses(&Packet::udp_datagram(), false).unwrap();
        let expected = v.adjust_addresses(&Packet::udp_datagram(), true).unwrap();
        match (&outbound.layers()[..2], &expected.layers()[..2]) {
            ([Layer::Ether(_), Layer::Ipv4(out_ip)], [Layer::Ether(e), Layer::Ipv4(exp_ip)]) => {
                assert_eq!(e.src, v.addresses().sut_egress_mac);
                assert_eq!(e.dst, v.addresses().tg_ingress_mac);
                assert_eq!((out_ip.src, out_ip.dst), (exp_ip.src, exp_ip.dst));
            }
            other => panic!("unexpected layers: {:?}", other),
        }
    }

    #[test]
    fn test_adjust_requires_ethernet_outermost() {
        let template = Packet::new().with(Ipv4::default());
        let err = verifier().adjust_addresses(&template, true).unwrap_err();
        assert!(matches!(err, PacketError::NotEthernet { found: LayerKind::Ipv4 }));
    }

    #[test]
    fn test_adjusted_packet_is_equivalent_to_itself() {
        let v = verifier();
        let templates = [
            Packet::udp_datagram(),
            ether_ip(),
            Packet::udp_datagram().with(Layer::Raw(vec![7; 32])),
            Packet::udp_datagram().with(Layer::Padding(vec![0; 18])),
        ];
        for template in templates {
            let a = v.adjust_addresses(&template, true).unwrap();
            let b = v.adjust_addresses(&template, true).unwrap();
            assert!(v.equivalent(&a, &b), "not reflexive for {}", template);
        }
    }

    #[test]
    fn test_trailing_padding_is_ignored() {
        let v = verifier();
        let expected = v.adjust_addresses(&ether_ip(), true).unwrap();
        let received = expected.clone().with(Layer::Padding(vec![0; 26]));
        assert!(v.equivalent(&expected, &received));
    }

    #[test]
    fn test_trailing_payload_is_rejected() {
        let v = verifier();
        let expected = v.adjust_addresses(&ether_ip(), true).unwrap();
        let received = expected.clone().with(Layer::Raw(vec![0xde, 0xad]));
        assert!(!v.equivalent(&expected, &received));
    }

    #[test]
    fn test_missing_layer_is_rejected() {
        let v = verifier();
        let expected = v.adjust_addresses(&ether_ip(), true).unwrap();
        let received = Packet::from_layers(expected.layers()[..1].to_vec());
        assert!(!v.equivalent(&expected, &received));
    }

    #[test]
    fn test_layer_type_mismatch_is_rejected() {
        let v = verifier();
        let expected = v.adjust_addresses(&Packet::udp_datagram(), true).unwrap();
        let mut layers = expected.layers().to_vec();
        layers[2] = Layer::Raw(vec![0; 8]);
        assert!(!v.equivalent(&expected, &Packet::from_layers(layers)));
    }

    #[test]
    fn test_wrong_destination_mac_is_rejected() {
        let v = verifier();
        let expected = v.adjust_addresses(&Packet::udp_datagram(), true).unwrap();
        let mut layers = expected.layers().to_vec();
        if let Layer::Ether(e) = &mut layers[0] {
            e.dst = MacAddr::broadcast();
        }
        assert!(!v.equivalent(&expected, &Packet::from_layers(layers)));
    }

    #[test]
    fn test_source_mac_depends_on_network_layer() {
        let v = verifier();
        let l2_only = Packet::new().with(Ether {
            src: v.addresses().tg_egress_mac,
            dst: v.addresses().tg_ingress_mac,
            ethertype: None,
        });
        assert!(v.equivalent(&l2_only, &l2_only));

        // With IPv4 in the expected packet the frame must come from the SUT.
        let routed = Packet::from_layers(vec![
            l2_only.layers()[0].clone(),
            Layer::Ipv4(Ipv4::default()),
        ]);
        assert!(!v.equivalent(&routed, &routed));
    }

    #[test]
    fn test_network_addresses_must_match() {
        let v = verifier();
        let expected = v.adjust_addresses(&Packet::udp_datagram(), true).unwrap();
        let mut layers = expected.layers().to_vec();
        if let Layer::Ipv4(ip) = &mut layers[1] {
            ip.dst = Ipv4Addr::new(10, 0, 0, 1);
        }
        assert!(!v.equivalent(&expected, &Packet::from_layers(layers)));
    }

    #[test]
    fn test_transport_fields_are_not_compared() {
        let v = verifier();
        let expected = v.adjust_addresses(&Packet::udp_datagram(), true).unwrap();
        let mut layers = expected.layers().to_vec();
        layers[2] = Layer::Udp(Udp {
            source: 1000,
            destination: 2000,
        });
        assert!(v.equivalent(&expected, &Packet::from_layers(layers)));
    }

    #[test]
    fn test_packet_present_among_received() {
        let v = verifier();
        let expected = v.adjust_addresses(&Packet::udp_datagram(), true).unwrap();
        let noise = v.adjust_addresses(&Packet::udp_datagram(), false).unwrap();
        assert!(!v.verify_packet_present(&expected, &[noise.clone()]));
        assert!(v.verify_packet_present(&expected, &[noise, expected.clone()]));
        assert!(!v.verify_packet_present(&expected, &[]));
    }
}
