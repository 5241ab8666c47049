//! Framing: signing, hashing and sender recovery around the RLP payloads.
//!
//! This is the only module that touches the cryptographic primitives. It is
//! pure and stateless; callers hold the socket and the timers.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::LazyLock;

use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Decodable, Encodable};
use bytes::Bytes;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};

use crate::endpoint::NeighborRecord;
use crate::message::{FindNode, Message, Neighbors, PacketKind, Ping, Pong};
use crate::{encode_pubkey, node_id, EncodedPubkey, NodeId, HEAD_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};

/// A fully decoded and authenticated inbound frame.
#[derive(Debug, Clone)]
pub struct Packet {
    pub message: Message,
    /// Sender's public key, recovered from the signature.
    pub recovered: EncodedPubkey,
    /// keccak256 of the sender id.
    pub node_id: NodeId,
    /// The frame's hash prefix; a pong answering this packet echoes it.
    pub hash: B256,
}

/// Why an inbound datagram was not accepted as a packet.
#[derive(Debug)]
pub enum DecodeError {
    /// Shorter than the fixed header plus type byte.
    PacketTooSmall,
    /// The keccak prefix does not cover the rest of the frame.
    HashMismatch,
    /// The type byte is unassigned. The sender could still be identified.
    UnknownPacketType { kind: u8, from: EncodedPubkey },
    /// Signature parsing or key recovery failed.
    Secp256k1(k256::ecdsa::Error),
    /// The payload is not well-formed RLP for the declared type.
    Rlp(alloy_rlp::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooSmall => write!(f, "packet too small"),
            Self::HashMismatch => write!(f, "hash prefix mismatch"),
            Self::UnknownPacketType { kind, from } => {
                write!(f, "unknown packet type {kind} from {from}")
            }
            Self::Secp256k1(err) => write!(f, "signature recovery failed: {err}"),
            Self::Rlp(err) => write!(f, "invalid payload: {err}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<alloy_rlp::Error> for DecodeError {
    fn from(err: alloy_rlp::Error) -> Self {
        Self::Rlp(err)
    }
}

/// Frames and signs a payload under the given type byte.
///
/// Returns the wire bytes and the frame hash; the hash is the value a
/// correct receiver echoes back in its pong.
pub fn encode_packet<P: Encodable>(
    key: &SigningKey,
    kind: u8,
    payload: &P,
) -> Result<(Bytes, B256), k256::ecdsa::Error> {
    let mut signed_region = Vec::with_capacity(MAX_PACKET_SIZE - HEAD_SIZE);
    signed_region.push(kind);
    payload.encode(&mut signed_region);

    let (signature, recovery_id) =
        key.sign_prehash_recoverable(keccak256(&signed_region).as_slice())?;

    let mut wire = Vec::with_capacity(HEAD_SIZE + signed_region.len());
    wire.extend_from_slice(&[0u8; 32]);
    wire.extend_from_slice(&signature.to_bytes());
    wire.push(recovery_id.to_byte());
    wire.extend_from_slice(&signed_region);

    let hash = keccak256(&wire[32..]);
    wire[..32].copy_from_slice(hash.as_slice());

    Ok((wire.into(), hash))
}

/// Parses and authenticates an inbound frame.
pub fn decode_packet(packet: &[u8]) -> Result<Packet, DecodeError> {
    if packet.len() < MIN_PACKET_SIZE {
        return Err(DecodeError::PacketTooSmall);
    }

    let hash = B256::from_slice(&packet[..32]);
    if keccak256(&packet[32..]) != hash {
        return Err(DecodeError::HashMismatch);
    }

    let signature = Signature::from_slice(&packet[32..96]).map_err(DecodeError::Secp256k1)?;
    let recovery_id = RecoveryId::try_from(packet[96]).map_err(DecodeError::Secp256k1)?;
    let prehash = keccak256(&packet[97..]);
    let verifying_key =
        VerifyingKey::recover_from_prehash(prehash.as_slice(), &signature, recovery_id)
            .map_err(DecodeError::Secp256k1)?;
    let recovered = encode_pubkey(&verifying_key);

    let kind = packet[97];
    let payload = &mut &packet[98..];
    let message = match PacketKind::from_u8(kind) {
        Ok(PacketKind::Ping) => Message::Ping(Ping::decode(payload)?),
        Ok(PacketKind::Pong) => Message::Pong(Pong::decode(payload)?),
        Ok(PacketKind::FindNode) => Message::FindNode(FindNode::decode(payload)?),
        Ok(PacketKind::Neighbors) => Message::Neighbors(Neighbors::decode(payload)?),
        Err(kind) => return Err(DecodeError::UnknownPacketType { kind, from: recovered }),
    };

    Ok(Packet { message, node_id: node_id(&recovered), recovered, hash })
}

/// The largest node count for which a neighbors packet still fits in a
/// datagram, assuming worst-case record sizes (16-byte addresses and
/// maximal ports). Found by stuffing a packet until it grows too large.
pub fn max_neighbors() -> usize {
    static MAX_NEIGHBORS: LazyLock<usize> = LazyLock::new(|| {
        let filler = NeighborRecord {
            address: IpAddr::V6(Ipv6Addr::from([0xff; 16])),
            udp_port: u16::MAX,
            tcp_port: u16::MAX,
            id: EncodedPubkey::repeat_byte(0xff),
        };
        let mut packet = Neighbors { nodes: Vec::new(), expiration: u64::MAX };
        loop {
            packet.nodes.push(filler);
            let framed = HEAD_SIZE + 1 + packet.length();
            if framed > MAX_PACKET_SIZE {
                return packet.nodes.len() - 1;
            }
        }
    });
    *MAX_NEIGHBORS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::message::{future_expiration, PingExtended, MAX_RESERVED_KIND};
    use pretty_assertions::assert_eq;
    use rand::{Rng, RngCore};

    fn rng_endpoint(rng: &mut impl Rng) -> Endpoint {
        let address = if rng.gen() {
            let mut octets = [0u8; 4];
            rng.fill_bytes(&mut octets);
            IpAddr::from(octets)
        } else {
            // avoid the v4-mapped range so roundtrips stay v6
            let mut octets = [0u8; 16];
            rng.fill_bytes(&mut octets);
            octets[0] = 0x20;
            IpAddr::from(octets)
        };
        Endpoint { address, udp_port: rng.gen(), tcp_port: rng.gen() }
    }

    fn rng_record(rng: &mut impl RngCore) -> NeighborRecord {
        let Endpoint { address, udp_port, tcp_port } = rng_endpoint(rng);
        let mut id = [0u8; 64];
        rng.fill_bytes(&mut id);
        NeighborRecord { address, udp_port, tcp_port, id: id.into() }
    }

    fn sample_ping(rng: &mut impl Rng) -> Ping {
        Ping {
            version: 4,
            from: rng_endpoint(rng),
            to: rng_endpoint(rng),
            expiration: future_expiration(),
        }
    }

    #[test]
    fn frame_roundtrip_every_kind() {
        let mut rng = rand::thread_rng();
        let key = SigningKey::random(&mut rng);
        let sender = encode_pubkey(key.verifying_key());

        let ping = sample_ping(&mut rng);
        let pong = Pong {
            to: rng_endpoint(&mut rng),
            echo: alloy_primitives::Bytes::from(vec![0x3c; 32]),
            expiration: future_expiration(),
        };
        let findnode =
            FindNode { target: EncodedPubkey::repeat_byte(0x77), expiration: future_expiration() };
        let neighbors = Neighbors {
            nodes: (0..4).map(|_| rng_record(&mut rng)).collect(),
            expiration: future_expiration(),
        };

        let cases: Vec<(u8, Message, Bytes)> = vec![
            (1, Message::Ping(ping.clone()), encode_packet(&key, 1, &ping).unwrap().0),
            (2, Message::Pong(pong.clone()), encode_packet(&key, 2, &pong).unwrap().0),
            (3, Message::FindNode(findnode.clone()), encode_packet(&key, 3, &findnode).unwrap().0),
            (4, Message::Neighbors(neighbors.clone()), encode_packet(&key, 4, &neighbors).unwrap().0),
        ];

        for (kind, expected, wire) in cases {
            let packet = decode_packet(&wire).unwrap();
            assert_eq!(packet.message, expected, "kind {kind}");
            assert_eq!(packet.recovered, sender);
            assert_eq!(packet.node_id, node_id(&sender));
            assert_eq!(packet.hash, B256::from_slice(&wire[..32]));
        }
    }

    #[test]
    fn hash_prefix_covers_the_rest() {
        let mut rng = rand::thread_rng();
        let key = SigningKey::random(&mut rng);
        let (wire, hash) = encode_packet(&key, 1, &sample_ping(&mut rng)).unwrap();
        assert_eq!(keccak256(&wire[32..]), B256::from_slice(&wire[..32]));
        assert_eq!(hash, B256::from_slice(&wire[..32]));
    }

    #[test]
    fn corrupt_byte_fails_hash_check() {
        let mut rng = rand::thread_rng();
        let key = SigningKey::random(&mut rng);
        let (wire, _) = encode_packet(&key, 1, &sample_ping(&mut rng)).unwrap();

        let mut corrupt = wire.to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        assert!(matches!(decode_packet(&corrupt), Err(DecodeError::HashMismatch)));
    }

    #[test]
    fn tampered_payload_does_not_recover_sender() {
        // Fixing up the hash after tampering gets past the prefix check, but
        // the signature no longer matches the payload: decoding either fails
        // or recovers some other key.
        let mut rng = rand::thread_rng();
        let key = SigningKey::random(&mut rng);
        let sender = encode_pubkey(key.verifying_key());
        let (wire, _) = encode_packet(&key, 1, &sample_ping(&mut rng)).unwrap();

        let mut tampered = wire.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let hash = keccak256(&tampered[32..]);
        tampered[..32].copy_from_slice(hash.as_slice());

        match decode_packet(&tampered) {
            Ok(packet) => assert_ne!(packet.recovered, sender),
            Err(DecodeError::Secp256k1(_)) | Err(DecodeError::Rlp(_)) => {}
            Err(other) => panic!("unexpected decode failure: {other}"),
        }
    }

    #[test]
    fn short_datagram_rejected() {
        assert!(matches!(decode_packet(&[0u8; 97]), Err(DecodeError::PacketTooSmall)));
        assert!(matches!(decode_packet(&[]), Err(DecodeError::PacketTooSmall)));
    }

    #[test]
    fn reserved_type_identifies_sender() {
        let mut rng = rand::thread_rng();
        let key = SigningKey::random(&mut rng);
        let sender = encode_pubkey(key.verifying_key());
        let (wire, _) =
            encode_packet(&key, MAX_RESERVED_KIND, &sample_ping(&mut rng)).unwrap();

        match decode_packet(&wire) {
            Err(DecodeError::UnknownPacketType { kind, from }) => {
                assert_eq!(kind, MAX_RESERVED_KIND);
                assert_eq!(from, sender);
            }
            other => panic!("expected unknown packet type, got {other:?}"),
        }
    }

    #[test]
    fn extended_ping_frame_decodes_as_ping() {
        let mut rng = rand::thread_rng();
        let key = SigningKey::random(&mut rng);
        let extended = PingExtended {
            version: 4,
            from: rng_endpoint(&mut rng),
            to: rng_endpoint(&mut rng),
            expiration: future_expiration(),
            junk_a: 42,
            junk_b: alloy_primitives::Bytes::from(vec![9, 8, 7, 6, 5, 4, 3, 2, 1]),
        };
        let (wire, _) = encode_packet(&key, 1, &extended).unwrap();

        let packet = decode_packet(&wire).unwrap();
        match packet.message {
            Message::Ping(ping) => {
                assert_eq!(ping.from, extended.from);
                assert_eq!(ping.to, extended.to);
                assert_eq!(ping.expiration, extended.expiration);
            }
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn max_neighbors_is_tight() {
        let filler = NeighborRecord {
            address: IpAddr::V6(Ipv6Addr::from([0xff; 16])),
            udp_port: u16::MAX,
            tcp_port: u16::MAX,
            id: EncodedPubkey::repeat_byte(0xff),
        };
        let fits = Neighbors {
            nodes: vec![filler; max_neighbors()],
            expiration: u64::MAX,
        };
        let overflows = Neighbors {
            nodes: vec![filler; max_neighbors() + 1],
            expiration: u64::MAX,
        };
        assert!(HEAD_SIZE + 1 + fits.length() <= MAX_PACKET_SIZE);
        assert!(HEAD_SIZE + 1 + overflows.length() > MAX_PACKET_SIZE);
    }

    #[test]
    fn max_neighbors_frame_stays_under_cap() {
        let mut rng = rand::thread_rng();
        let key = SigningKey::random(&mut rng);
        let neighbors = Neighbors {
            nodes: (0..max_neighbors()).map(|_| rng_record(&mut rng)).collect(),
            expiration: u64::MAX,
        };
        let (wire, _) = encode_packet(&key, 4, &neighbors).unwrap();
        assert!(wire.len() <= MAX_PACKET_SIZE, "{} bytes", wire.len());
    }
}
