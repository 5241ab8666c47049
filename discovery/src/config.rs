//! Service configuration.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use k256::ecdsa::SigningKey;
use tokio::sync::mpsc;

use wire::Netlist;

use crate::service::RawPacket;

/// The conventional discovery port.
pub const DEFAULT_PORT: u16 = 30303;

/// Settings for [`crate::ProbeService::bind`].
#[derive(Clone)]
pub struct Config {
    /// Key signing every outbound packet. The matching public key is the
    /// identity the target will see.
    pub signing_key: SigningKey,
    /// Local UDP listen address.
    pub listen_addr: SocketAddr,
    /// Externally visible address to put into outbound `from` endpoints,
    /// when it differs from the bind address.
    pub announce_addr: Option<SocketAddr>,
    /// Port-mapping behaviour. Only `extip` affects the announced endpoint.
    pub nat: NatMode,
    /// CIDR whitelist applied to peer-declared addresses.
    pub net_restrict: Option<Netlist>,
    /// Datagrams that decode but match nothing, or fail to decode, are
    /// forwarded here when the channel is set.
    pub unhandled: Option<mpsc::Sender<RawPacket>>,
}

impl Config {
    pub fn new(signing_key: SigningKey) -> Self {
        Config {
            signing_key,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            announce_addr: None,
            nat: NatMode::None,
            net_restrict: None,
            unhandled: None,
        }
    }
}

/// Requested NAT handling. Mapping protocols are recognised for interface
/// compatibility but not driven; announcing an external address is the only
/// traversal this client performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatMode {
    Any,
    #[default]
    None,
    Upnp,
    Pmp,
    ExtIp(IpAddr),
}

impl FromStr for NatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(NatMode::None),
            "any" | "auto" => Ok(NatMode::Any),
            "upnp" => Ok(NatMode::Upnp),
            "pmp" | "natpmp" => Ok(NatMode::Pmp),
            other => match other.strip_prefix("extip:") {
                Some(ip) => ip
                    .parse()
                    .map(NatMode::ExtIp)
                    .map_err(|_| format!("bad external ip {ip:?}")),
                None => Err(format!(
                    "unknown nat mode {s:?}, expected any|none|upnp|pmp|extip:<ip>"
                )),
            },
        }
    }
}

impl fmt::Display for NatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatMode::Any => f.write_str("any"),
            NatMode::None => f.write_str("none"),
            NatMode::Upnp => f.write_str("upnp"),
            NatMode::Pmp => f.write_str("pmp"),
            NatMode::ExtIp(ip) => write!(f, "extip:{ip}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_mode_parsing() {
        assert_eq!("none".parse::<NatMode>(), Ok(NatMode::None));
        assert_eq!("ANY".parse::<NatMode>(), Ok(NatMode::Any));
        assert_eq!("upnp".parse::<NatMode>(), Ok(NatMode::Upnp));
        assert_eq!("pmp".parse::<NatMode>(), Ok(NatMode::Pmp));
        assert_eq!(
            "extip:203.0.113.8".parse::<NatMode>(),
            Ok(NatMode::ExtIp("203.0.113.8".parse().unwrap()))
        );
        assert!("extip:nonsense".parse::<NatMode>().is_err());
        assert!("fullcone".parse::<NatMode>().is_err());
    }
}
