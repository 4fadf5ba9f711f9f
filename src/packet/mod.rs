//! Layered packet model on top of `pnet` headers.
//!
//! A [`Packet`] is an ordered list of layers, outermost first. Packets are
//! built into wire bytes with lengths and checksums filled in, and captured
//! frames are dissected back into layers. Bytes past the end of an IPv4
//! datagram (Ethernet minimum-size fill) become a trailing `Padding` layer.

pub mod verify;

use std::fmt;
use std::net::Ipv4Addr;

use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::util::MacAddr;
use serde::Serialize;
use thiserror::Error;

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

// EtherType used when nothing known follows the Ethernet header.
const ETHERTYPE_LOOPBACK: EtherType = EtherType(0x9000);

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet has no layers")]
    Empty,

    #[error("outermost layer is {found}, expected Ether")]
    NotEthernet { found: LayerKind },

    #[error("{layer} payload of {len} bytes exceeds the length field")]
    TooLong { layer: LayerKind, len: usize },

    #[error("failed to build {layer} header")]
    Build { layer: LayerKind },
}

/// Layer type tag, used for positional comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LayerKind {
    Ether,
    Ipv4,
    Udp,
    Raw,
    Padding,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Ether => write!(f, "Ether"),
            LayerKind::Ipv4 => write!(f, "IP"),
            LayerKind::Udp => write!(f, "UDP"),
            LayerKind::Raw => write!(f, "Raw"),
            LayerKind::Padding => write!(f, "Padding"),
        }
    }
}

/// Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ether {
    pub src: MacAddr,
    pub dst: MacAddr,
    /// `None` derives the EtherType from the next layer at build time.
    pub ethertype: Option<EtherType>,
}

impl Default for Ether {
    fn default() -> Self {
        Self {
            src: MacAddr::zero(),
            dst: MacAddr::broadcast(),
            ethertype: None,
        }
    }
}

/// IPv4 header without options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4 {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub identification: u16,
    /// `None` derives the protocol from the next layer at build time.
    pub protocol: Option<IpNextHeaderProtocol>,
}

impl Default for Ipv4 {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::LOCALHOST,
            dst: Ipv4Addr::LOCALHOST,
            ttl: 64,
            identification: 1,
            protocol: None,
        }
    }
}

/// UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Udp {
    pub source: u16,
    pub destination: u16,
}

impl Default for Udp {
    fn default() -> Self {
        Self {
            source: 53,
            destination: 53,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    Ether(Ether),
    Ipv4(Ipv4),
    Udp(Udp),
    Raw(Vec<u8>),
    Padding(Vec<u8>),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Ether(_) => LayerKind::Ether,
            Layer::Ipv4(_) => LayerKind::Ipv4,
            Layer::Udp(_) => LayerKind::Udp,
            Layer::Raw(_) => LayerKind::Raw,
            Layer::Padding(_) => LayerKind::Padding,
        }
    }
}

impl From<Ether> for Layer {
    fn from(layer: Ether) -> Self {
        Layer::Ether(layer)
    }
}

impl From<Ipv4> for Layer {
    fn from(layer: Ipv4) -> Self {
        Layer::Ipv4(layer)
    }
}

impl From<Udp> for Layer {
    fn from(layer: Udp) -> Self {
        Layer::Udp(layer)
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Ether(e) => write!(f, "Ether {} > {}", e.src, e.dst),
            Layer::Ipv4(ip) => write!(f, "IP {} > {}", ip.src, ip.dst),
            Layer::Udp(u) => write!(f, "UDP {} > {}", u.source, u.destination),
            Layer::Raw(data) => write!(f, "Raw({})", data.len()),
            Layer::Padding(data) => write!(f, "Padding({})", data.len()),
        }
    }
}

/// An ordered stack of layers, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    layers: Vec<Layer>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_layers(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// Append `layer` as the new innermost layer.
    pub fn with(mut self, layer: impl Into<Layer>) -> Self {
        self.layers.push(layer.into());
        self
    }

    /// Ether / IPv4 / UDP with default header fields.
    pub fn udp_datagram() -> Self {
        Self::new()
            .with(Ether::default())
            .with(Ipv4::default())
            .with(Udp::default())
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn has_layer(&self, kind: LayerKind) -> bool {
        self.layers.iter().any(|l| l.kind() == kind)
    }

    /// One-line description of every layer.
    pub fn summary(&self) -> String {
        self.layers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" / ")
    }

    /// Serialize into wire bytes, computing lengths, derived type fields and
    /// checksums.
    pub fn build(&self) -> Result<Vec<u8>, PacketError> {
        if self.layers.is_empty() {
            return Err(PacketError::Empty);
        }

        // Trailing padding sits after the outermost datagram, not inside it.
        let body_len = self
            .layers
            .iter()
            .rposition(|l| l.kind() != LayerKind::Padding)
            .map_or(0, |idx| idx + 1);
        let (body, trailer) = self.layers.split_at(body_len);

        // Nearest enclosing IPv4 endpoints, needed for UDP checksums.
        let mut enclosing = Vec::with_capacity(body.len());
        let mut current = None;
        for layer in body {
            enclosing.push(current);
            if let Layer::Ipv4(ip) = layer {
                current = Some((ip.src, ip.dst));
            }
        }

        let mut bytes = Vec::new();
        for (idx, layer) in body.iter().enumerate().rev() {
            let next = body.get(idx + 1).map(Layer::kind);
            bytes = match layer {
                Layer::Ether(ether) => build_ether(ether, &bytes, next)?,
                Layer::Ipv4(ip) => build_ipv4(ip, &bytes, next)?,
                Layer::Udp(udp) => build_udp(udp, &bytes, enclosing[idx])?,
                Layer::Raw(data) | Layer::Padding(data) => {
                    let mut out = data.clone();
                    out.extend_from_slice(&bytes);
                    out
                }
            };
        }

        for layer in trailer {
            if let Layer::Padding(data) = layer {
                bytes.extend_from_slice(data);
            }
        }
        Ok(bytes)
    }

    /// Dissect an Ethernet frame into layers. Never fails: anything that
    /// cannot be decoded ends up in a `Raw` layer.
    pub fn dissect(bytes: &[u8]) -> Self {
        let mut layers = Vec::new();
        dissect_ether(bytes, &mut layers);
        Self { layers }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

fn build_ether(ether: &Ether, payload: &[u8], next: Option<LayerKind>) -> Result<Vec<u8>, PacketError> {
    let mut buf = vec![0u8; ETHERNET_HEADER_SIZE + payload.len()];
    let mut frame = MutableEthernetPacket::new(&mut buf).ok_or(PacketError::Build {
        layer: LayerKind::Ether,
    })?;
    let ethertype = ether.ethertype.unwrap_or(match next {
        Some(LayerKind::Ipv4) => EtherTypes::Ipv4,
        _ => ETHERTYPE_LOOPBACK,
    });
    frame.set_destination(ether.dst);
    frame.set_source(ether.src);
    frame.set_ethertype(ethertype);
    frame.set_payload(payload);
    Ok(buf)
}

fn build_ipv4(ip: &Ipv4, payload: &[u8], next: Option<LayerKind>) -> Result<Vec<u8>, PacketError> {
    let total = IPV4_HEADER_SIZE + payload.len();
    let total_length = u16::try_from(total).map_err(|_| PacketError::TooLong {
        layer: LayerKind::Ipv4,
        len: payload.len(),
    })?;
    let protocol = ip.protocol.unwrap_or(match next {
        Some(LayerKind::Udp) => IpNextHeaderProtocols::Udp,
        _ => IpNextHeaderProtocols::Hopopt,
    });

    let mut buf = vec![0u8; total];
    let mut header = MutableIpv4Packet::new(&mut buf).ok_or(PacketError::Build {
        layer: LayerKind::Ipv4,
    })?;
    header.set_version(4);
    header.set_header_length((IPV4_HEADER_SIZE / 4) as u8);
    header.set_total_length(total_length);
    header.set_identification(ip.identification);
    header.set_ttl(ip.ttl);
    header.set_next_level_protocol(protocol);
    header.set_source(ip.src);
    header.set_destination(ip.dst);
    header.set_payload(payload);
    let checksum = ipv4::checksum(&header.to_immutable());
    header.set_checksum(checksum);
    Ok(buf)
}

fn build_udp(
    udp: &Udp,
    payload: &[u8],
    endpoints: Option<(Ipv4Addr, Ipv4Addr)>,
) -> Result<Vec<u8>, PacketError> {
    let total = UDP_HEADER_SIZE + payload.len();
    let length = u16::try_from(total).map_err(|_| PacketError::TooLong {
        layer: LayerKind::Udp,
        len: payload.len(),
    })?;

    let mut buf = vec![0u8; total];
    let mut header = MutableUdpPacket::new(&mut buf).ok_or(PacketError::Build {
        layer: LayerKind::Udp,
    })?;
    header.set_source(udp.source);
    header.set_destination(udp.destination);
    header.set_length(length);
    header.set_payload(payload);
    if let Some((src, dst)) = endpoints {
        let checksum = udp::ipv4_checksum(&header.to_immutable(), &src, &dst);
        header.set_checksum(checksum);
    }
    Ok(buf)
}

fn push_raw(bytes: &[u8], layers: &mut Vec<Layer>) {
    if !bytes.is_empty() {
        layers.push(Layer::Raw(bytes.to_vec()));
    }
}

fn dissect_ether(bytes: &[u8], layers: &mut Vec<Layer>) {
    let Some(frame) = EthernetPacket::new(bytes) else {
        push_raw(bytes, layers);
        return;
    };
    let ethertype = frame.get_ethertype();
    layers.push(Layer::Ether(Ether {
        src: frame.get_source(),
        dst: frame.get_destination(),
        ethertype: Some(ethertype),
    }));

    let payload = &bytes[ETHERNET_HEADER_SIZE..];
    if ethertype == EtherTypes::Ipv4 {
        dissect_ipv4(payload, layers);
    } else {
        push_raw(payload, layers);
    }
}

fn dissect_ipv4(bytes: &[u8], layers: &mut Vec<Layer>) {
    let header = match Ipv4Packet::new(bytes) {
        Some(h) if h.get_version() == 4 => h,
        _ => {
            push_raw(bytes, layers);
            return;
        }
    };
    let header_len = usize::from(header.get_header_length()) * 4;
    let total_len = usize::from(header.get_total_length()).min(bytes.len());
    if header_len < IPV4_HEADER_SIZE || header_len > total_len {
        push_raw(bytes, layers);
        return;
    }

    let protocol = header.get_next_level_protocol();
    layers.push(Layer::Ipv4(Ipv4 {
        src: header.get_source(),
        dst: header.get_destination(),
        ttl: header.get_ttl(),
        identification: header.get_identification(),
        protocol: Some(protocol),
    }));

    let payload = &bytes[header_len..total_len];
    if protocol == IpNextHeaderProtocols::Udp {
        dissect_udp(payload, layers);
    } else {
        push_raw(payload, layers);
    }

    if total_len < bytes.len() {
        layers.push(Layer::Padding(bytes[total_len..].to_vec()));
    }
}

fn dissect_udp(bytes: &[u8], layers: &mut Vec<Layer>) {
    let Some(header) = UdpPacket::new(bytes) else {
        push_raw(bytes, layers);
        return;
    };
    let len = usize::from(header.get_length()).clamp(UDP_HEADER_SIZE, bytes.len());
    layers.push(Layer::Udp(Udp {
        source: header.get_source(),
        destination: header.get_destination(),
    }));
    push_raw(&bytes[UDP_HEADER_SIZE..len], layers);
    if len < bytes.len() {
        layers.push(Layer::Padding(bytes[len..].to_vec()));
    }
}
