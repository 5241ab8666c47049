//! `enode://` URIs, the textual form of a node's identity and address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::{decode_pubkey, node_id, EncodedPubkey, NodeId};

/// A parsed `enode://<pubkey>@<ip>:<tcp-port>[?discport=<udp-port>]` URI.
///
/// The hostname part must be a literal IP address. When no `discport` query
/// is present the UDP port equals the TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnodeUrl {
    pubkey: EncodedPubkey,
    address: IpAddr,
    tcp_port: u16,
    udp_port: u16,
}

impl EnodeUrl {
    pub fn pubkey(&self) -> EncodedPubkey {
        self.pubkey
    }

    pub fn node_id(&self) -> NodeId {
        node_id(&self.pubkey)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }

    /// Replaces the address, keeping identity and ports. Used when the URI
    /// was produced inside a container and reports an unreachable IP.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.address = ip;
        self
    }
}

impl FromStr for EnodeUrl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("enode://")
            .ok_or_else(|| "missing enode:// scheme".to_string())?;
        let (id_hex, location) = rest
            .split_once('@')
            .ok_or_else(|| "missing @ separator".to_string())?;

        let mut id = [0u8; 64];
        if id_hex.len() != 128 {
            return Err(format!("node id must be 128 hex characters, got {}", id_hex.len()));
        }
        hex::decode_to_slice(id_hex, &mut id).map_err(|err| format!("bad node id: {err}"))?;
        let pubkey = EncodedPubkey::from(id);
        decode_pubkey(&pubkey).map_err(|_| "node id is not a valid public key".to_string())?;

        let (host, query) = match location.split_once('?') {
            Some((host, query)) => (host, Some(query)),
            None => (location, None),
        };
        let addr: SocketAddr = host
            .parse()
            .map_err(|_| format!("bad address {host:?}, expected ip:port"))?;

        let mut udp_port = addr.port();
        if let Some(query) = query {
            for pair in query.split('&') {
                match pair.split_once('=') {
                    Some(("discport", value)) => {
                        udp_port = value
                            .parse()
                            .map_err(|_| format!("bad discport {value:?}"))?;
                    }
                    _ => return Err(format!("unknown query parameter {pair:?}")),
                }
            }
        }

        Ok(EnodeUrl { pubkey, address: addr.ip(), tcp_port: addr.port(), udp_port })
    }
}

impl fmt::Display for EnodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enode://{}@{}",
            hex::encode(self.pubkey.as_slice()),
            SocketAddr::new(self.address, self.tcp_port)
        )?;
        if self.udp_port != self.tcp_port {
            write!(f, "?discport={}", self.udp_port)?;
        }
        Ok(())
    }
}
