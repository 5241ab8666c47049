//! Endpoint and neighbor-record types shared by all payloads.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use alloy_rlp::{Decodable, Encodable, Error as RlpError, Header};
use bytes::Buf;

use crate::EncodedPubkey;

/// An `[ip, udp-port, tcp-port]` triple as it appears in ping and pong
/// payloads. The TCP port is carried for the benefit of the transport
/// protocol; discovery itself only uses the UDP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    /// Builds the endpoint a datagram's source address maps to, preferring
    /// the IPv4 form for IPv4-mapped addresses.
    pub fn from_udp_addr(addr: &SocketAddr, tcp_port: u16) -> Self {
        Endpoint {
            address: canonical_ip(addr.ip()),
            udp_port: addr.port(),
            tcp_port,
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.udp_port)
    }
}

/// A single entry of a neighbors payload: an endpoint plus the node's
/// encoded public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborRecord {
    pub address: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub id: EncodedPubkey,
}

impl NeighborRecord {
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Addresses travel as raw 4- or 16-byte strings.
fn ip_length(ip: &IpAddr) -> usize {
    match ip {
        IpAddr::V4(addr) => addr.octets().as_slice().length(),
        IpAddr::V6(addr) => addr.octets().as_slice().length(),
    }
}

fn encode_ip(ip: &IpAddr, out: &mut dyn alloy_rlp::BufMut) {
    match ip {
        IpAddr::V4(addr) => addr.octets().as_slice().encode(out),
        IpAddr::V6(addr) => addr.octets().as_slice().encode(out),
    }
}

fn decode_ip(buf: &mut &[u8]) -> alloy_rlp::Result<IpAddr> {
    let header = Header::decode(buf)?;
    if header.list {
        return Err(RlpError::UnexpectedList);
    }
    let ip = match header.payload_length {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[..4]);
            IpAddr::from(octets)
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            canonical_ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => return Err(RlpError::UnexpectedLength),
    };
    buf.advance(header.payload_length);
    Ok(ip)
}

impl Encodable for Endpoint {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length =
            ip_length(&self.address) + self.udp_port.length() + self.tcp_port.length();
        Header { list: true, payload_length }.encode(out);
        encode_ip(&self.address, out);
        self.udp_port.encode(out);
        self.tcp_port.encode(out);
    }
}

impl Decodable for Endpoint {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(RlpError::UnexpectedString);
        }
        let started_len = buf.len();

        let address = decode_ip(buf)?;
        let udp_port = u16::decode(buf)?;
        let tcp_port = u16::decode(buf)?;

        skip_trailing(buf, started_len, header.payload_length)?;
        Ok(Endpoint { address, udp_port, tcp_port })
    }
}

impl Encodable for NeighborRecord {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = ip_length(&self.address)
            + self.udp_port.length()
            + self.tcp_port.length()
            + self.id.length();
        Header { list: true, payload_length }.encode(out);
        encode_ip(&self.address, out);
        self.udp_port.encode(out);
        self.tcp_port.encode(out);
        self.id.encode(out);
    }
}

impl Decodable for NeighborRecord {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(RlpError::UnexpectedString);
        }
        let started_len = buf.len();

        let address = decode_ip(buf)?;
        let udp_port = u16::decode(buf)?;
        let tcp_port = u16::decode(buf)?;
        let id = EncodedPubkey::decode(buf)?;

        skip_trailing(buf, started_len, header.payload_length)?;
        Ok(NeighborRecord { address, udp_port, tcp_port, id })
    }
}

/// Consumes list items past the known fields. Peers running a newer protocol
/// revision may append fields; they must not break decoding.
pub(crate) fn skip_trailing(
    buf: &mut &[u8],
    started_len: usize,
    payload_length: usize,
) -> alloy_rlp::Result<()> {
    let consumed = started_len - buf.len();
    if consumed > payload_length {
        return Err(RlpError::ListLengthMismatch { expected: payload_length, got: consumed });
    }
    buf.advance(payload_length - consumed);
    Ok(())
}

/// Why a peer-declared address was rejected relative to the datagram's
/// source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayIpError {
    /// The declared address is unspecified (0.0.0.0 or ::).
    Unspecified,
    /// Multicast or broadcast address.
    SpecialPurpose,
    /// A loopback address declared by a non-loopback sender.
    LoopbackFromRemote,
    /// A LAN-range address declared by a sender outside the LAN.
    LanFromRemote,
}

impl fmt::Display for RelayIpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Unspecified => "unspecified address",
            Self::SpecialPurpose => "multicast or broadcast address",
            Self::LoopbackFromRemote => "loopback address from non-loopback sender",
            Self::LanFromRemote => "LAN address from non-LAN sender",
        };
        f.write_str(reason)
    }
}

impl std::error::Error for RelayIpError {}

/// Checks that `declared`, an address a peer claims to be reachable at, is
/// plausible coming from `sender`. Rejecting these prevents a remote peer
/// from steering traffic at reserved ranges it cannot legitimately hold.
pub fn check_relay_ip(sender: IpAddr, declared: IpAddr) -> Result<(), RelayIpError> {
    if declared.is_unspecified() {
        return Err(RelayIpError::Unspecified);
    }
    if declared.is_multicast() || is_broadcast(declared) {
        return Err(RelayIpError::SpecialPurpose);
    }
    if declared.is_loopback() {
        if !sender.is_loopback() {
            return Err(RelayIpError::LoopbackFromRemote);
        }
    } else if is_lan(declared) && !is_lan(sender) && !sender.is_loopback() {
        return Err(RelayIpError::LanFromRemote);
    }
    Ok(())
}

fn is_broadcast(ip: IpAddr) -> bool {
    matches!(ip, IpAddr::V4(v4) if v4.is_broadcast())
}

fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        // fe80::/10 link-local and fc00::/7 unique-local
        IpAddr::V6(v6) => {
            (v6.segments()[0] & 0xffc0) == 0xfe80 || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}
