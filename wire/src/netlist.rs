//! CIDR whitelist applied to peer-declared addresses.

use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CidrBlock {
    network: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let shift = 32 - u32::from(self.prefix);
                if shift == 32 {
                    return true;
                }
                u32::from(network) >> shift == u32::from(*ip) >> shift
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let shift = 128 - u32::from(self.prefix);
                if shift == 128 {
                    return true;
                }
                u128::from(network) >> shift == u128::from(*ip) >> shift
            }
            _ => false,
        }
    }
}

impl FromStr for CidrBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in {s:?}"))?;
        let network: IpAddr = addr.trim().parse().map_err(|_| format!("bad address in {s:?}"))?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| format!("bad prefix in {s:?}"))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix /{prefix} too long for {addr}"));
        }
        Ok(CidrBlock { network, prefix })
    }
}

/// A set of CIDR blocks, parsed from a comma-separated list such as
/// `"10.0.0.0/8,fe80::/10"`. Peers declaring addresses outside the set are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Netlist(Vec<CidrBlock>);

impl Netlist {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.iter().any(|block| block.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Netlist {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(CidrBlock::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Netlist)
    }
}
