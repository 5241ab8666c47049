//! The four discovery payloads and their RLP forms.
//!
//! Decoders skip unknown trailing list items so that packets from newer
//! protocol revisions still parse; the leading fields are authoritative.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::Bytes;
use alloy_rlp::{Decodable, Encodable, Error as RlpError, Header, RlpEncodable};

use crate::endpoint::{skip_trailing, Endpoint, NeighborRecord};
use crate::EncodedPubkey;

/// How far in the future outbound packets expire.
pub const EXPIRATION_SECS: u64 = 20;

/// Assigned packet type bytes. Values 5 through 12 are reserved; a receiver
/// must treat them as unknown.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Ping = 1,
    Pong = 2,
    FindNode = 3,
    Neighbors = 4,
}

/// The highest reserved type byte. Sending under this tag exercises a
/// target's handling of unassigned packet types.
pub const MAX_RESERVED_KIND: u8 = 12;

impl PacketKind {
    pub fn from_u8(byte: u8) -> Result<Self, u8> {
        match byte {
            1 => Ok(PacketKind::Ping),
            2 => Ok(PacketKind::Pong),
            3 => Ok(PacketKind::FindNode),
            4 => Ok(PacketKind::Neighbors),
            other => Err(other),
        }
    }
}

/// Endpoint probe. A correct receiver answers with a pong echoing the
/// packet hash, regardless of what the `from` and `to` fields claim.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable)]
pub struct Ping {
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

/// A ping carrying extra fields after the defined ones, as a future
/// protocol revision would. Encodes under the ping type byte and must be
/// accepted by receivers that only understand [`Ping`].
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable)]
pub struct PingExtended {
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
    pub junk_a: u64,
    pub junk_b: Bytes,
}

/// Reply to ping. `echo` carries the hash of the ping packet being
/// answered, which is what binds a pong to its request.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable)]
pub struct Pong {
    pub to: Endpoint,
    pub echo: Bytes,
    pub expiration: u64,
}

/// Query for nodes near `target` in the DHT keyspace.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable)]
pub struct FindNode {
    pub target: EncodedPubkey,
    pub expiration: u64,
}

/// Reply to findnode. Large result sets span several packets, each kept
/// under the datagram size cap.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable)]
pub struct Neighbors {
    pub nodes: Vec<NeighborRecord>,
    pub expiration: u64,
}

impl Decodable for Ping {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(RlpError::UnexpectedString);
        }
        let started_len = buf.len();

        let this = Ping {
            version: u32::decode(buf)?,
            from: Endpoint::decode(buf)?,
            to: Endpoint::decode(buf)?,
            expiration: u64::decode(buf)?,
        };

        skip_trailing(buf, started_len, header.payload_length)?;
        Ok(this)
    }
}

impl Decodable for Pong {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(RlpError::UnexpectedString);
        }
        let started_len = buf.len();

        let this = Pong {
            to: Endpoint::decode(buf)?,
            echo: Bytes::decode(buf)?,
            expiration: u64::decode(buf)?,
        };

        skip_trailing(buf, started_len, header.payload_length)?;
        Ok(this)
    }
}

impl Decodable for FindNode {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(RlpError::UnexpectedString);
        }
        let started_len = buf.len();

        let this = FindNode {
            target: EncodedPubkey::decode(buf)?,
            expiration: u64::decode(buf)?,
        };

        skip_trailing(buf, started_len, header.payload_length)?;
        Ok(this)
    }
}

impl Decodable for Neighbors {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(RlpError::UnexpectedString);
        }
        let started_len = buf.len();

        let this = Neighbors {
            nodes: Vec::<NeighborRecord>::decode(buf)?,
            expiration: u64::decode(buf)?,
        };

        skip_trailing(buf, started_len, header.payload_length)?;
        Ok(this)
    }
}

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
}

impl Message {
    pub fn kind(&self) -> PacketKind {
        match self {
            Message::Ping(_) => PacketKind::Ping,
            Message::Pong(_) => PacketKind::Pong,
            Message::FindNode(_) => PacketKind::FindNode,
            Message::Neighbors(_) => PacketKind::Neighbors,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Message::Ping(p) => p.expiration,
            Message::Pong(p) => p.expiration,
            Message::FindNode(p) => p.expiration,
            Message::Neighbors(p) => p.expiration,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Expiration timestamp for an outbound packet.
pub fn future_expiration() -> u64 {
    unix_now() + EXPIRATION_SECS
}

/// A timestamp that is already past, for probing how targets treat stale
/// packets.
pub fn past_expiration() -> u64 {
    unix_now().saturating_sub(EXPIRATION_SECS)
}

/// Whether an inbound packet's expiration has passed. The boundary second
/// counts as expired.
pub fn expired(timestamp: u64) -> bool {
    timestamp <= unix_now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_endpoint(last_octet: u8, port: u16) -> Endpoint {
        Endpoint {
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
            udp_port: port,
            tcp_port: port,
        }
    }

    #[test]
    fn ping_roundtrip() {
        let ping = Ping {
            version: 4,
            from: sample_endpoint(1, 30303),
            to: sample_endpoint(2, 30304),
            expiration: 1_700_000_000,
        };
        let mut buf = Vec::new();
        ping.encode(&mut buf);
        assert_eq!(Ping::decode(&mut buf.as_slice()).unwrap(), ping);
    }

    #[test]
    fn pong_roundtrip() {
        let pong = Pong {
            to: sample_endpoint(3, 30303),
            echo: Bytes::from(vec![0x11; 32]),
            expiration: 1_700_000_000,
        };
        let mut buf = Vec::new();
        pong.encode(&mut buf);
        assert_eq!(Pong::decode(&mut buf.as_slice()).unwrap(), pong);
    }

    #[test]
    fn extended_ping_decodes_as_ping() {
        let extended = PingExtended {
            version: 4,
            from: sample_endpoint(1, 30303),
            to: sample_endpoint(2, 30304),
            expiration: 1_700_000_000,
            junk_a: 42,
            junk_b: Bytes::from(vec![9, 8, 7, 6, 5, 4, 3, 2, 1]),
        };
        let mut buf = Vec::new();
        extended.encode(&mut buf);

        let ping = Ping::decode(&mut buf.as_slice()).expect("extra fields are skipped");
        assert_eq!(ping.version, extended.version);
        assert_eq!(ping.from, extended.from);
        assert_eq!(ping.to, extended.to);
        assert_eq!(ping.expiration, extended.expiration);
    }

    #[test]
    fn pong_with_trailing_sequence_number() {
        // Clients implementing record exchange append their sequence number.
        let pong = Pong {
            to: sample_endpoint(4, 30303),
            echo: Bytes::from(vec![0x22; 32]),
            expiration: 1_700_000_000,
        };
        let seq = 17u64;
        let mut buf = Vec::new();
        let payload_length =
            pong.to.length() + pong.echo.length() + pong.expiration.length() + seq.length();
        Header { list: true, payload_length }.encode(&mut buf);
        pong.to.encode(&mut buf);
        pong.echo.encode(&mut buf);
        pong.expiration.encode(&mut buf);
        seq.encode(&mut buf);

        assert_eq!(Pong::decode(&mut buf.as_slice()).unwrap(), pong);
    }

    #[test]
    fn neighbors_roundtrip() {
        let neighbors = Neighbors {
            nodes: vec![
                NeighborRecord {
                    address: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                    udp_port: 30303,
                    tcp_port: 30303,
                    id: EncodedPubkey::repeat_byte(0x0f),
                },
                NeighborRecord {
                    address: "2001:db8::7".parse().unwrap(),
                    udp_port: 40000,
                    tcp_port: 40001,
                    id: EncodedPubkey::repeat_byte(0xf0),
                },
            ],
            expiration: 1_700_000_000,
        };
        let mut buf = Vec::new();
        neighbors.encode(&mut buf);
        assert_eq!(Neighbors::decode(&mut buf.as_slice()).unwrap(), neighbors);
    }

    #[test]
    fn boundary_second_is_expired() {
        assert!(expired(unix_now()));
        assert!(expired(unix_now() - 20));
        assert!(!expired(unix_now() + 20));
    }

    #[test]
    fn reserved_kinds_do_not_parse() {
        for byte in [0u8, 5, 9, 12, 13, 255] {
            assert_eq!(PacketKind::from_u8(byte), Err(byte));
        }
        assert_eq!(PacketKind::from_u8(1), Ok(PacketKind::Ping));
        assert_eq!(PacketKind::from_u8(4), Ok(PacketKind::Neighbors));
    }
}
