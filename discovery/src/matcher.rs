//! The pending-reply matcher.
//!
//! A probe arms an expectation before transmitting its request; inbound
//! packets are then offered to every armed expectation for the same node, in
//! arming order. Several replies may arrive for one request and several
//! requests may be in flight to the same node (a neighbors packet cannot be
//! attributed to one particular findnode), so an expectation that does not
//! recognise a packet leaves it for the next one rather than consuming it.
//!
//! All pending state lives in one task and is only reachable through
//! messages, which keeps delivery order deterministic and needs no locks.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use wire::{EncodedPubkey, Message, NodeId};

use crate::error::ProbeError;

/// How long an armed expectation waits for a matching reply.
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Consecutive deadline expiries tolerated before suspecting the local
/// clock rather than the target.
const CONTINUOUS_TIMEOUT_WARNING: u32 = 32;

/// What a resolved pending yields: the sender's recovered key on success.
pub(crate) type ProbeOutcome = Result<EncodedPubkey, ProbeError>;

/// A decoded inbound packet attributed to a node.
pub(crate) struct Reply {
    pub node: NodeId,
    pub recovered: EncodedPubkey,
    pub message: Message,
}

/// What a probe expects back. Replacing stored callbacks with data keeps
/// every matching rule auditable in [`Expectation::judge`] and the payload
/// is shared by reference across all pendings it is offered to.
#[derive(Debug, Clone)]
pub(crate) enum Expectation {
    /// A pong echoing the request hash, optionally from a known identity.
    Pong { token: alloy_primitives::B256, expected_id: Option<NodeId> },
    /// Any pong at all.
    AnyPong,
    /// A pong would be a protocol violation; everything else is left to
    /// other pendings and the deadline.
    NoPong,
    /// As [`Expectation::NoPong`], and an inbound ping is a violation too.
    NoPongOrPing,
    /// A neighbors reply, which must not contain the banned entry.
    Neighbors { banned: Option<EncodedPubkey> },
    /// A neighbors reply would be a protocol violation.
    NoNeighbors,
    /// Any reply at all is a protocol violation.
    Nothing,
}

/// Per-pending decision about one inbound reply.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The reply satisfies the expectation; the pending is done.
    Accept,
    /// Not the packet this pending is waiting for. Leave it armed.
    Mismatch,
    /// The reply proves misbehaviour; fail the pending.
    Reject(ProbeError),
}

impl Expectation {
    pub(crate) fn judge(&self, reply: &Reply) -> Verdict {
        match self {
            Expectation::Pong { token, expected_id } => match &reply.message {
                Message::Pong(pong) => {
                    if pong.echo.as_ref() != token.as_slice() {
                        return Verdict::Reject(ProbeError::UnsolicitedReply);
                    }
                    if let Some(expected) = expected_id {
                        if reply.node != *expected {
                            return Verdict::Reject(ProbeError::UnknownNode);
                        }
                    }
                    Verdict::Accept
                }
                _ => Verdict::Mismatch,
            },
            Expectation::AnyPong => match reply.message {
                Message::Pong(_) => Verdict::Accept,
                _ => Verdict::Mismatch,
            },
            Expectation::NoPong => match reply.message {
                Message::Pong(_) => Verdict::Reject(ProbeError::UnsolicitedReply),
                _ => Verdict::Mismatch,
            },
            Expectation::NoPongOrPing => match reply.message {
                Message::Pong(_) | Message::Ping(_) => {
                    Verdict::Reject(ProbeError::UnsolicitedReply)
                }
                _ => Verdict::Mismatch,
            },
            Expectation::Neighbors { banned } => match &reply.message {
                Message::Neighbors(neighbors) => {
                    if let Some(banned) = banned {
                        if neighbors.nodes.iter().any(|record| record.id == *banned) {
                            return Verdict::Reject(ProbeError::CorruptDht);
                        }
                    }
                    Verdict::Accept
                }
                _ => Verdict::Reject(ProbeError::UnsolicitedReply),
            },
            Expectation::NoNeighbors => match reply.message {
                Message::Neighbors(_) => Verdict::Reject(ProbeError::UnsolicitedReply),
                _ => Verdict::Mismatch,
            },
            Expectation::Nothing => Verdict::Reject(ProbeError::UnsolicitedReply),
        }
    }
}

struct Pending {
    node: NodeId,
    deadline: Instant,
    expect: Expectation,
    resolve: oneshot::Sender<ProbeOutcome>,
}

struct ArmRequest {
    node: NodeId,
    expect: Expectation,
    resolve: oneshot::Sender<ProbeOutcome>,
    /// Tests inject deadlines directly; regular arming derives the deadline
    /// from the arrival time.
    deadline: Option<Instant>,
}

struct InboundReply {
    reply: Reply,
    claimed: oneshot::Sender<bool>,
}

/// Handle for talking to the matcher task.
#[derive(Clone)]
pub(crate) struct MatcherHandle {
    arm_tx: mpsc::Sender<ArmRequest>,
    reply_tx: mpsc::Sender<InboundReply>,
}

impl MatcherHandle {
    pub(crate) fn spawn(close: watch::Receiver<bool>, response_timeout: Duration) -> Self {
        let (arm_tx, arm_rx) = mpsc::channel(16);
        let (reply_tx, reply_rx) = mpsc::channel(16);
        let matcher = Matcher { arm_rx, reply_rx, close, response_timeout };
        tokio::spawn(matcher.run());
        MatcherHandle { arm_tx, reply_tx }
    }

    /// Registers an expectation keyed on `node`. The returned receiver
    /// yields the outcome; a dropped channel means the matcher shut down.
    pub(crate) async fn arm(
        &self,
        node: NodeId,
        expect: Expectation,
    ) -> oneshot::Receiver<ProbeOutcome> {
        self.arm_inner(node, expect, None).await
    }

    #[cfg(test)]
    pub(crate) async fn arm_at(
        &self,
        node: NodeId,
        expect: Expectation,
        deadline: Instant,
    ) -> oneshot::Receiver<ProbeOutcome> {
        self.arm_inner(node, expect, Some(deadline)).await
    }

    async fn arm_inner(
        &self,
        node: NodeId,
        expect: Expectation,
        deadline: Option<Instant>,
    ) -> oneshot::Receiver<ProbeOutcome> {
        let (resolve, outcome) = oneshot::channel();
        let request = ArmRequest { node, expect, resolve, deadline };
        // A failed send drops the resolve end, which the caller observes as
        // a closed outcome.
        let _ = self.arm_tx.send(request).await;
        outcome
    }

    /// Offers an inbound reply to the armed expectations. Returns whether
    /// anyone claimed it; the await is what serialises the reader behind
    /// the matcher.
    pub(crate) async fn submit(&self, reply: Reply) -> bool {
        let (claimed_tx, claimed_rx) = oneshot::channel();
        if self
            .reply_tx
            .send(InboundReply { reply, claimed: claimed_tx })
            .await
            .is_err()
        {
            return false;
        }
        claimed_rx.await.unwrap_or(false)
    }
}

struct Matcher {
    arm_rx: mpsc::Receiver<ArmRequest>,
    reply_rx: mpsc::Receiver<InboundReply>,
    close: watch::Receiver<bool>,
    response_timeout: Duration,
}

impl Matcher {
    async fn run(mut self) {
        let mut pendings: Vec<Pending> = Vec::new();
        let mut continuous_timeouts: u32 = 0;

        loop {
            // A deadline beyond twice the response timeout cannot have been
            // assigned against the current clock; the clock moved backwards
            // underneath us. Fail those pendings rather than sleeping on a
            // corrupted timing base.
            while let Some(head) = pendings.first() {
                if head.deadline > Instant::now() + 2 * self.response_timeout {
                    let pending = pendings.remove(0);
                    debug!(node = %pending.node, "pending deadline out of range, resolving as clock warp");
                    let _ = pending.resolve.send(Err(ProbeError::ClockWarp));
                } else {
                    break;
                }
            }
            let next_deadline = pendings.first().map(|pending| pending.deadline);

            tokio::select! {
                // Poll in a fixed order so that arming always lands before a
                // reply that was queued behind it.
                biased;

                _ = self.close.changed() => {
                    for pending in pendings.drain(..) {
                        let _ = pending.resolve.send(Err(ProbeError::Closed));
                    }
                    return;
                }

                Some(request) = self.arm_rx.recv() => {
                    let deadline = request
                        .deadline
                        .unwrap_or_else(|| Instant::now() + self.response_timeout);
                    pendings.push(Pending {
                        node: request.node,
                        deadline,
                        expect: request.expect,
                        resolve: request.resolve,
                    });
                }

                Some(inbound) = self.reply_rx.recv() => {
                    let reply = inbound.reply;
                    let mut claimed = false;
                    let mut accepted = false;

                    let mut index = 0;
                    while index < pendings.len() {
                        if pendings[index].node != reply.node {
                            index += 1;
                            continue;
                        }
                        match pendings[index].expect.judge(&reply) {
                            Verdict::Mismatch => index += 1,
                            Verdict::Accept => {
                                claimed = true;
                                accepted = true;
                                let pending = pendings.remove(index);
                                let _ = pending.resolve.send(Ok(reply.recovered));
                            }
                            Verdict::Reject(error) => {
                                claimed = true;
                                let pending = pendings.remove(index);
                                let _ = pending.resolve.send(Err(error));
                            }
                        }
                    }

                    if accepted {
                        continuous_timeouts = 0;
                    }
                    let _ = inbound.claimed.send(claimed);
                }

                _ = deadline_tick(next_deadline) => {
                    let now = Instant::now();
                    let mut index = 0;
                    while index < pendings.len() {
                        if pendings[index].deadline <= now {
                            let pending = pendings.remove(index);
                            let _ = pending.resolve.send(Err(ProbeError::Timeout));
                            continuous_timeouts += 1;
                        } else {
                            index += 1;
                        }
                    }
                    if continuous_timeouts >= CONTINUOUS_TIMEOUT_WARNING {
                        warn!(
                            count = continuous_timeouts,
                            "continuous reply timeouts, the local clock may be off"
                        );
                        continuous_timeouts = 0;
                    }
                }
            }
        }
    }
}

async fn deadline_tick(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, B256};
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};
    use wire::{Endpoint, NeighborRecord, Neighbors, Pong};

    const FAST: Duration = Duration::from_millis(50);

    fn spawn_fast() -> (MatcherHandle, watch::Sender<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        (MatcherHandle::spawn(close_rx, FAST), close_tx)
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            udp_port: 30303,
            tcp_port: 30303,
        }
    }

    fn pong_reply(node: NodeId, echo: &[u8]) -> Reply {
        Reply {
            node,
            recovered: EncodedPubkey::repeat_byte(0x11),
            message: Message::Pong(Pong {
                to: endpoint(),
                echo: Bytes::from(echo.to_vec()),
                expiration: u64::MAX,
            }),
        }
    }

    fn neighbors_reply(node: NodeId, ids: &[EncodedPubkey]) -> Reply {
        Reply {
            node,
            recovered: EncodedPubkey::repeat_byte(0x22),
            message: Message::Neighbors(Neighbors {
                nodes: ids
                    .iter()
                    .map(|id| NeighborRecord {
                        address: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                        udp_port: 30303,
                        tcp_port: 30303,
                        id: *id,
                    })
                    .collect(),
                expiration: u64::MAX,
            }),
        }
    }

    #[tokio::test]
    async fn fanout_stops_each_pending_on_first_non_mismatch() {
        let (handle, _close) = spawn_fast();
        let node = B256::repeat_byte(0x09);

        let rejects = handle.arm(node, Expectation::NoPong).await;
        let accepts = handle.arm(node, Expectation::AnyPong).await;
        let stays = handle.arm(node, Expectation::NoNeighbors).await;

        let claimed = handle.submit(pong_reply(node, &[0xaa; 32])).await;
        assert!(claimed);

        assert_eq!(rejects.await.unwrap(), Err(ProbeError::UnsolicitedReply));
        assert!(matches!(accepts.await.unwrap(), Ok(_)));

        // The pong was a mismatch for the third pending, which stays armed
        // until its deadline.
        assert_eq!(stays.await.unwrap(), Err(ProbeError::Timeout));
    }

    #[tokio::test]
    async fn reply_from_other_node_is_not_claimed() {
        let (handle, _close) = spawn_fast();
        let armed_for = B256::repeat_byte(0x01);
        let other = B256::repeat_byte(0x02);

        let outcome = handle.arm(armed_for, Expectation::AnyPong).await;
        assert!(!handle.submit(pong_reply(other, &[0xbb; 32])).await);
        assert_eq!(outcome.await.unwrap(), Err(ProbeError::Timeout));
    }

    #[tokio::test]
    async fn each_deadline_fires_exactly_one_timeout() {
        let (handle, _close) = spawn_fast();
        let node = B256::repeat_byte(0x03);

        let first = handle.arm(node, Expectation::AnyPong).await;
        let second = handle.arm(node, Expectation::AnyPong).await;

        assert_eq!(first.await.unwrap(), Err(ProbeError::Timeout));
        assert_eq!(second.await.unwrap(), Err(ProbeError::Timeout));
    }

    #[tokio::test]
    async fn reply_after_deadline_is_not_claimed() {
        let (handle, _close) = spawn_fast();
        let node = B256::repeat_byte(0x04);

        let outcome = handle.arm(node, Expectation::AnyPong).await;
        assert_eq!(outcome.await.unwrap(), Err(ProbeError::Timeout));

        assert!(!handle.submit(pong_reply(node, &[0xcc; 32])).await);
    }

    #[tokio::test]
    async fn out_of_range_deadline_resolves_as_clock_warp() {
        let (handle, _close) = spawn_fast();
        let node = B256::repeat_byte(0x05);

        let warped = handle
            .arm_at(node, Expectation::AnyPong, Instant::now() + 10 * FAST)
            .await;
        let sane = handle.arm(node, Expectation::NoPong).await;

        assert_eq!(warped.await.unwrap(), Err(ProbeError::ClockWarp));
        // The sane pending behind it is unaffected.
        assert_eq!(sane.await.unwrap(), Err(ProbeError::Timeout));
    }

    #[tokio::test]
    async fn close_drains_every_pending() {
        let (handle, close) = spawn_fast();
        let node = B256::repeat_byte(0x06);

        let first = handle.arm(node, Expectation::AnyPong).await;
        let second = handle.arm(B256::repeat_byte(0x07), Expectation::Nothing).await;

        close.send(true).unwrap();

        assert_eq!(first.await.unwrap(), Err(ProbeError::Closed));
        assert_eq!(second.await.unwrap(), Err(ProbeError::Closed));
    }

    #[tokio::test]
    async fn arm_after_shutdown_resolves_promptly() {
        let (handle, close) = spawn_fast();
        close.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = handle.arm(B256::repeat_byte(0x08), Expectation::AnyPong).await;
        // The matcher is gone; the dropped channel stands for Closed.
        assert!(outcome.await.is_err());
    }

    #[test]
    fn judge_checks_the_reply_token() {
        let node = B256::repeat_byte(0x0a);
        let token = B256::repeat_byte(0xee);
        let expect = Expectation::Pong { token, expected_id: None };

        assert_eq!(expect.judge(&pong_reply(node, token.as_slice())), Verdict::Accept);
        assert_eq!(
            expect.judge(&pong_reply(node, &[0u8; 32])),
            Verdict::Reject(ProbeError::UnsolicitedReply)
        );
    }

    #[test]
    fn judge_checks_the_expected_identity() {
        let node = B256::repeat_byte(0x0b);
        let token = B256::repeat_byte(0xee);
        let expect =
            Expectation::Pong { token, expected_id: Some(B256::repeat_byte(0x0c)) };

        assert_eq!(
            expect.judge(&pong_reply(node, token.as_slice())),
            Verdict::Reject(ProbeError::UnknownNode)
        );
    }

    #[test]
    fn judge_flags_spoofed_neighbors() {
        let node = B256::repeat_byte(0x0d);
        let fake = EncodedPubkey::repeat_byte(0x66);
        let expect = Expectation::Neighbors { banned: Some(fake) };

        let clean = neighbors_reply(node, &[EncodedPubkey::repeat_byte(0x55)]);
        assert_eq!(expect.judge(&clean), Verdict::Accept);

        let tainted = neighbors_reply(node, &[EncodedPubkey::repeat_byte(0x55), fake]);
        assert_eq!(expect.judge(&tainted), Verdict::Reject(ProbeError::CorruptDht));

        let wrong_kind = pong_reply(node, &[0u8; 32]);
        assert_eq!(
            expect.judge(&wrong_kind),
            Verdict::Reject(ProbeError::UnsolicitedReply)
        );
    }
}
