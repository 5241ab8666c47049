//! The probe client: a bound UDP socket, the background reader and the
//! matcher task, plus the inbound packet handlers.
//!
//! The socket has one reader, the spawned task; probes and the ping
//! responder write concurrently and the kernel serialises them. The reader
//! hands every decoded reply to the matcher and waits for its verdict
//! before touching the next datagram, so dispatch order follows arrival
//! order.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use k256::ecdsa::SigningKey;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use wire::{
    check_relay_ip, decode_packet, decode_pubkey, encode_packet, expired, future_expiration,
    DecodeError, Endpoint, Message, NeighborRecord, Netlist, PacketKind, Ping, Pong,
    MAX_PACKET_SIZE,
};

use crate::config::{Config, NatMode};
use crate::matcher::{MatcherHandle, Reply, RESPONSE_TIMEOUT};

/// A datagram the service could not account for, forwarded to the
/// configured observer.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// Client for probing a discovery target. Construction binds the socket and
/// starts the reader and matcher; both run until [`ProbeService::close`].
pub struct ProbeService {
    socket: Arc<UdpSocket>,
    pub(crate) signing_key: SigningKey,
    pub(crate) local_endpoint: Endpoint,
    pub(crate) matcher: MatcherHandle,
    close: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

impl ProbeService {
    pub async fn bind(config: Config) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .with_context(|| format!("binding udp listener on {}", config.listen_addr))?;
        let local_addr = socket.local_addr().context("reading bound address")?;
        let announced = announced_addr(&config, local_addr);
        let local_endpoint = Endpoint::from_udp_addr(&announced, announced.port());
        info!(local = %local_addr, announced = %announced, "UDP listener up");

        let socket = Arc::new(socket);
        let (close_tx, close_rx) = watch::channel(false);
        let matcher = MatcherHandle::spawn(close_rx, RESPONSE_TIMEOUT);

        let reader = Reader {
            socket: Arc::clone(&socket),
            signing_key: config.signing_key.clone(),
            matcher: matcher.clone(),
            net_restrict: config.net_restrict,
            unhandled: config.unhandled,
        };
        let reader = tokio::spawn(reader.run());

        Ok(ProbeService {
            socket,
            signing_key: config.signing_key,
            local_endpoint,
            matcher,
            close: close_tx,
            reader,
        })
    }

    /// The endpoint written into outbound `from` fields.
    pub fn local_endpoint(&self) -> Endpoint {
        self.local_endpoint
    }

    /// Stops the reader and fails every in-flight probe as closed.
    pub fn close(&self) {
        let _ = self.close.send(true);
        self.reader.abort();
    }

    pub(crate) async fn send(
        &self,
        to: SocketAddr,
        what: &'static str,
        wire_bytes: &[u8],
    ) -> Result<()> {
        self.socket
            .send_to(wire_bytes, to)
            .await
            .with_context(|| format!("sending {what} to {to}"))?;
        trace!(addr = %to, what, ">> packet");
        Ok(())
    }
}

impl Drop for ProbeService {
    fn drop(&mut self) {
        self.close();
    }
}

fn announced_addr(config: &Config, local_addr: SocketAddr) -> SocketAddr {
    if let Some(addr) = config.announce_addr {
        return addr;
    }
    match config.nat {
        NatMode::ExtIp(ip) => SocketAddr::new(ip, local_addr.port()),
        NatMode::None => local_addr,
        mode => {
            debug!(%mode, "port mapping not performed, announcing the bind address");
            local_addr
        }
    }
}

/// Why an inbound datagram was dropped instead of dispatched.
enum HandleError {
    Decode(DecodeError),
    Expired,
    Unsolicited,
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(err) => err.fmt(f),
            Self::Expired => f.write_str("expired"),
            Self::Unsolicited => f.write_str("unsolicited reply"),
        }
    }
}

struct Reader {
    socket: Arc<UdpSocket>,
    signing_key: SigningKey,
    matcher: MatcherHandle,
    net_restrict: Option<Netlist>,
    unhandled: Option<mpsc::Sender<RawPacket>>,
}

impl Reader {
    async fn run(self) {
        // Datagrams beyond the protocol cap are cut off here; the hash
        // check then rejects them.
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(err) if is_transient(&err) => {
                    debug!(%err, "temporary udp read error");
                    continue;
                }
                Err(err) => {
                    debug!(%err, "udp read error, stopping reader");
                    return;
                }
            };

            let datagram = &buf[..len];
            if let Err(reason) = self.handle_datagram(from, datagram).await {
                debug!(addr = %from, %reason, "dropping packet");
                if let Some(unhandled) = &self.unhandled {
                    let _ = unhandled.try_send(RawPacket { data: datagram.to_vec(), from });
                }
            }
        }
    }

    async fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) -> Result<(), HandleError> {
        let packet = decode_packet(datagram).map_err(HandleError::Decode)?;
        let kind = packet.message.kind();
        trace!(addr = %from, ?kind, node = %packet.node_id, "<< packet");

        if expired(packet.message.expiration()) {
            return Err(HandleError::Expired);
        }

        match &packet.message {
            Message::Ping(ping) => self.answer_ping(from, ping, packet.hash).await,
            Message::FindNode(_) => {
                // This client keeps no routing table and never serves
                // neighbors, so the query itself is the whole event.
                return Ok(());
            }
            Message::Neighbors(neighbors) => {
                for record in &neighbors.nodes {
                    if let Err(reason) = self.vet_neighbor(from.ip(), record) {
                        debug!(
                            addr = %from,
                            entry = %record.udp_addr(),
                            %reason,
                            "implausible neighbor entry"
                        );
                    }
                }
            }
            Message::Pong(_) => {}
        }

        let claimed = self
            .matcher
            .submit(Reply {
                node: packet.node_id,
                recovered: packet.recovered,
                message: packet.message,
            })
            .await;

        if kind == PacketKind::Neighbors && !claimed {
            return Err(HandleError::Unsolicited);
        }
        Ok(())
    }

    /// Completes the target's endpoint proof: every valid inbound ping is
    /// answered with a pong echoing the ping's hash.
    async fn answer_ping(&self, from: SocketAddr, ping: &Ping, echo: alloy_primitives::B256) {
        let pong = Pong {
            to: Endpoint::from_udp_addr(&from, ping.from.tcp_port),
            echo: echo.to_vec().into(),
            expiration: future_expiration(),
        };
        match encode_packet(&self.signing_key, PacketKind::Pong as u8, &pong) {
            Ok((wire_bytes, _)) => {
                if let Err(err) = self.socket.send_to(&wire_bytes, from).await {
                    debug!(addr = %from, %err, "failed to answer ping");
                } else {
                    trace!(addr = %from, ">> pong");
                }
            }
            Err(err) => debug!(%err, "failed to sign pong"),
        }
    }

    fn vet_neighbor(&self, sender: IpAddr, record: &NeighborRecord) -> Result<()> {
        if record.udp_port <= 1024 {
            bail!("low port {}", record.udp_port);
        }
        check_relay_ip(sender, record.address)?;
        if let Some(netlist) = &self.net_restrict {
            if !netlist.contains(&record.address) {
                bail!("address {} not in the whitelist", record.address);
            }
        }
        decode_pubkey(&record.id).map_err(|_| anyhow!("id is not a valid public key"))?;
        Ok(())
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
    )
}
