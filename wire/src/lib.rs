//! Wire format of the discv4 node-discovery protocol.
//!
//! Every datagram is a signed, hash-prefixed frame carrying one of four
//! RLP-encoded payloads:
//!
//! ```text
//! [  0 .. 32 )  hash      = keccak256(signature || type || payload)
//! [ 32 .. 97 )  signature = 65-byte recoverable ECDSA over keccak256(type || payload)
//! [ 97 ]        type      = 1 byte
//! [ 98 .. )     payload   = RLP
//! ```
//!
//! The hash prefix is not authenticating, it merely identifies the packet
//! (a pong echoes it to bind reply to request). Authentication comes from
//! the signature, from which the sender's public key is recovered.

use alloy_primitives::{keccak256, B256, B512};

pub mod codec;
pub mod endpoint;
pub mod enode;
pub mod message;
pub mod netlist;

pub use codec::{decode_packet, encode_packet, max_neighbors, DecodeError, Packet};
pub use endpoint::{check_relay_ip, Endpoint, NeighborRecord, RelayIpError};
pub use enode::EnodeUrl;
pub use message::{
    expired, future_expiration, past_expiration, FindNode, Message, Neighbors, PacketKind, Ping,
    PingExtended, Pong, EXPIRATION_SECS, MAX_RESERVED_KIND,
};
pub use netlist::Netlist;

/// Discovery packets are defined to be no larger than 1280 bytes. Larger
/// datagrams are truncated on receipt and fail the hash check.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Hash prefix plus recoverable signature.
pub const HEAD_SIZE: usize = 32 + 65;

/// The smallest well-formed frame: header plus the type byte.
pub const MIN_PACKET_SIZE: usize = HEAD_SIZE + 1;

/// A node's identity on the wire: the uncompressed secp256k1 point (X || Y),
/// without the SEC1 `0x04` prefix.
pub type EncodedPubkey = B512;

/// keccak256 of the encoded public key. Derivable from [`EncodedPubkey`],
/// never authoritative on its own.
pub type NodeId = B256;

/// Derives the node id from an encoded public key.
pub fn node_id(pubkey: &EncodedPubkey) -> NodeId {
    keccak256(pubkey.as_slice())
}

/// Encodes a secp256k1 public key into its 64-byte wire form.
pub fn encode_pubkey(key: &k256::ecdsa::VerifyingKey) -> EncodedPubkey {
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    let point = key.to_encoded_point(false);
    B512::from_slice(&point.as_bytes()[1..])
}

/// Parses the 64-byte wire form back into a public key, rejecting byte
/// strings that are not a point on the curve.
pub fn decode_pubkey(pubkey: &EncodedPubkey) -> Result<k256::ecdsa::VerifyingKey, k256::ecdsa::Error> {
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(pubkey.as_slice());
    k256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    #[test]
    fn pubkey_roundtrip() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let encoded = encode_pubkey(key.verifying_key());
        let decoded = decode_pubkey(&encoded).expect("valid curve point");
        assert_eq!(&decoded, key.verifying_key());
    }

    #[test]
    fn invalid_pubkey_rejected() {
        assert!(decode_pubkey(&B512::ZERO).is_err());
    }

    #[test]
    fn node_id_is_keccak_of_pubkey() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let encoded = encode_pubkey(key.verifying_key());
        assert_eq!(node_id(&encoded), keccak256(encoded.as_slice()));
    }
}
