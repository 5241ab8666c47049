//! The probe battery.
//!
//! Each probe builds one request, arms a reply expectation keyed on the
//! target's node id, transmits, and blocks until the matcher resolves the
//! expectation. Probes therefore run one at a time from the caller's point
//! of view, and return the target's recovered public key on success.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use alloy_primitives::Bytes;
use anyhow::Result;
use k256::ecdsa::SigningKey;
use tracing::debug;

use wire::{
    encode_packet, encode_pubkey, future_expiration, past_expiration, EncodedPubkey, Endpoint,
    FindNode, NeighborRecord, Neighbors, NodeId, PacketKind, Ping, PingExtended,
    MAX_RESERVED_KIND,
};

use crate::error::ProbeError;
use crate::matcher::Expectation;
use crate::service::ProbeService;

/// How long to wait after bonding before relying on it. The target may have
/// its own settling to do and we cannot observe whether it was bonded
/// already.
pub const BOND_SETTLE: Duration = Duration::from_secs(2);

/// The deliberately wrong endpoint used by the mangled-field probes.
fn bogus_endpoint() -> Endpoint {
    Endpoint {
        address: IpAddr::V4(Ipv4Addr::new(0, 1, 2, 3)),
        udp_port: 1,
        tcp_port: 0,
    }
}

fn junk_bytes() -> Bytes {
    Bytes::from(vec![9, 8, 7, 6, 5, 4, 3, 2, 1])
}

impl ProbeService {
    /// Sends a well-formed ping and expects a pong echoing the request
    /// hash. With `validate`, the pong must also come from `node`.
    pub async fn ping(
        &self,
        node: NodeId,
        addr: SocketAddr,
        validate: bool,
    ) -> Result<EncodedPubkey> {
        let request = Ping {
            version: 4,
            from: self.local_endpoint,
            to: Endpoint::from_udp_addr(&addr, 0),
            expiration: future_expiration(),
        };
        let (wire_bytes, hash) =
            encode_packet(&self.signing_key, PacketKind::Ping as u8, &request)?;
        let expect = Expectation::Pong { token: hash, expected_id: validate.then_some(node) };
        self.request(node, addr, "ping", &wire_bytes, expect).await
    }

    /// Ping with a garbage `from` endpoint. A correct target ignores the
    /// field and answers exactly as for [`ProbeService::ping`].
    pub async fn ping_wrong_from(
        &self,
        node: NodeId,
        addr: SocketAddr,
        validate: bool,
    ) -> Result<EncodedPubkey> {
        let request = Ping {
            version: 4,
            from: bogus_endpoint(),
            to: Endpoint::from_udp_addr(&addr, 0),
            expiration: future_expiration(),
        };
        let (wire_bytes, hash) =
            encode_packet(&self.signing_key, PacketKind::Ping as u8, &request)?;
        let expect = Expectation::Pong { token: hash, expected_id: validate.then_some(node) };
        self.request(node, addr, "ping-wrong-from", &wire_bytes, expect).await
    }

    /// Ping with a garbage `to` endpoint. Any pong counts as success since
    /// a correct target pongs regardless of what `to` claims.
    pub async fn ping_wrong_to(&self, node: NodeId, addr: SocketAddr) -> Result<EncodedPubkey> {
        let request = Ping {
            version: 4,
            from: self.local_endpoint,
            to: bogus_endpoint(),
            expiration: future_expiration(),
        };
        let (wire_bytes, _) =
            encode_packet(&self.signing_key, PacketKind::Ping as u8, &request)?;
        self.request(node, addr, "ping-wrong-to", &wire_bytes, Expectation::AnyPong)
            .await
    }

    /// Ping in a future packet format with extra trailing fields. Forward
    /// compatibility demands the usual pong.
    pub async fn ping_extra_data(
        &self,
        node: NodeId,
        addr: SocketAddr,
        validate: bool,
    ) -> Result<EncodedPubkey> {
        let request = PingExtended {
            version: 4,
            from: self.local_endpoint,
            to: Endpoint::from_udp_addr(&addr, 0),
            expiration: future_expiration(),
            junk_a: 42,
            junk_b: junk_bytes(),
        };
        let (wire_bytes, hash) =
            encode_packet(&self.signing_key, PacketKind::Ping as u8, &request)?;
        let expect = Expectation::Pong { token: hash, expected_id: validate.then_some(node) };
        self.request(node, addr, "ping-extra-data", &wire_bytes, expect).await
    }

    /// Extra trailing fields and a garbage `from` at the same time.
    pub async fn ping_extra_data_wrong_from(
        &self,
        node: NodeId,
        addr: SocketAddr,
        validate: bool,
    ) -> Result<EncodedPubkey> {
        let request = PingExtended {
            version: 4,
            from: bogus_endpoint(),
            to: Endpoint::from_udp_addr(&addr, 0),
            expiration: future_expiration(),
            junk_a: 42,
            junk_b: junk_bytes(),
        };
        let (wire_bytes, hash) =
            encode_packet(&self.signing_key, PacketKind::Ping as u8, &request)?;
        let expect = Expectation::Pong { token: hash, expected_id: validate.then_some(node) };
        self.request(node, addr, "ping-extra-data-wrong-from", &wire_bytes, expect)
            .await
    }

    /// A valid ping payload sent under a reserved type byte. The target
    /// must not react with any recognisable packet; the probe succeeds by
    /// timing out.
    pub async fn ping_wrong_packet_type(
        &self,
        node: NodeId,
        addr: SocketAddr,
    ) -> Result<EncodedPubkey> {
        let request = Ping {
            version: 4,
            from: self.local_endpoint,
            to: Endpoint::from_udp_addr(&addr, 0),
            expiration: future_expiration(),
        };
        let (wire_bytes, _) = encode_packet(&self.signing_key, MAX_RESERVED_KIND, &request)?;
        self.request(node, addr, "ping-wrong-packet-type", &wire_bytes, Expectation::NoPongOrPing)
            .await
    }

    /// Findnode without a prior ping. A correct target refuses to answer
    /// queries from peers without an endpoint proof, since the large
    /// neighbors reply would make it a traffic amplifier for spoofed
    /// sources. The probe succeeds by timing out.
    pub async fn findnode_without_bond(
        &self,
        node: NodeId,
        addr: SocketAddr,
        target: EncodedPubkey,
    ) -> Result<EncodedPubkey> {
        let request = FindNode { target, expiration: future_expiration() };
        let (wire_bytes, _) =
            encode_packet(&self.signing_key, PacketKind::FindNode as u8, &request)?;
        self.request(node, addr, "findnode-without-bond", &wire_bytes, Expectation::Nothing)
            .await
    }

    /// Bonds first, then sends a ping with a garbage `from`. Being bonded
    /// must not make the target any more trusting of the field.
    pub async fn ping_bonded_with_mangled_from(
        &self,
        node: NodeId,
        addr: SocketAddr,
        validate: bool,
    ) -> Result<EncodedPubkey> {
        self.bond(node, addr).await?;
        self.ping_wrong_from(node, addr, validate).await
    }

    /// Bonds, injects a spoofed unsolicited neighbors packet carrying a
    /// fabricated node, then queries. The reply must not contain the
    /// fabricated entry; the target accepting it would mean its table is
    /// poisonable by anyone able to send a datagram.
    pub async fn bonded_findnode(
        &self,
        node: NodeId,
        addr: SocketAddr,
        target: EncodedPubkey,
    ) -> Result<EncodedPubkey> {
        self.bond(node, addr).await?;

        let fake_key = SigningKey::random(&mut rand::thread_rng());
        let fake_id = encode_pubkey(fake_key.verifying_key());
        let spoof = Neighbors {
            nodes: vec![NeighborRecord {
                address: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                udp_port: 123,
                tcp_port: 123,
                id: fake_id,
            }],
            expiration: future_expiration(),
        };
        let (spoof_bytes, _) =
            encode_packet(&self.signing_key, PacketKind::Neighbors as u8, &spoof)?;
        self.send(addr, "spoofed-neighbors", &spoof_bytes).await?;

        let request = FindNode { target, expiration: future_expiration() };
        let (wire_bytes, _) =
            encode_packet(&self.signing_key, PacketKind::FindNode as u8, &request)?;
        self.request(
            node,
            addr,
            "findnode",
            &wire_bytes,
            Expectation::Neighbors { banned: Some(fake_id) },
        )
        .await
    }

    /// Ping whose expiration already passed. Answering it would mean the
    /// target replays stale traffic; the probe succeeds by timing out.
    pub async fn ping_past_expiration(
        &self,
        node: NodeId,
        addr: SocketAddr,
    ) -> Result<EncodedPubkey> {
        let request = Ping {
            version: 4,
            from: self.local_endpoint,
            to: Endpoint::from_udp_addr(&addr, 0),
            expiration: past_expiration(),
        };
        let (wire_bytes, _) =
            encode_packet(&self.signing_key, PacketKind::Ping as u8, &request)?;
        self.request(node, addr, "ping-past-expiration", &wire_bytes, Expectation::NoPong)
            .await
    }

    /// Bonds, then sends a findnode whose expiration already passed.
    /// Succeeds by timing out.
    pub async fn findnode_past_expiration(
        &self,
        node: NodeId,
        addr: SocketAddr,
        target: EncodedPubkey,
    ) -> Result<EncodedPubkey> {
        self.bond(node, addr).await?;

        let request = FindNode { target, expiration: past_expiration() };
        let (wire_bytes, _) =
            encode_packet(&self.signing_key, PacketKind::FindNode as u8, &request)?;
        self.request(node, addr, "findnode-past-expiration", &wire_bytes, Expectation::NoNeighbors)
            .await
    }

    /// Establishes the endpoint proof with a plain ping, then waits out the
    /// target's settling time.
    async fn bond(&self, node: NodeId, addr: SocketAddr) -> Result<()> {
        self.ping(node, addr, false).await?;
        debug!(%node, "bonded, letting the target settle");
        tokio::time::sleep(BOND_SETTLE).await;
        Ok(())
    }

    /// Arms the expectation, transmits, and waits for the outcome. Arming
    /// happens first so a fast reply cannot slip past the matcher.
    async fn request(
        &self,
        node: NodeId,
        addr: SocketAddr,
        what: &'static str,
        wire_bytes: &[u8],
        expect: Expectation,
    ) -> Result<EncodedPubkey> {
        let outcome = self.matcher.arm(node, expect).await;
        self.send(addr, what, wire_bytes).await?;
        match outcome.await {
            Ok(Ok(recovered)) => Ok(recovered),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(ProbeError::Closed.into()),
        }
    }
}
