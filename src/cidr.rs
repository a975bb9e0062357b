//! CIDR allow-list for incoming alive claims.
//!
//! When configured, an alive message claiming an address outside every listed
//! network is logged and ignored, keeping nodes from other environments (or
//! spoofed sources) out of the member map.

use crate::error::{Error, Result};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `a.b.c.d/len` or `addr/len` for IPv6. A bare address is treated
    /// as a host route (/32 or /128).
    pub fn parse(s: &str) -> Result<Self> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };

        let network: IpAddr = addr_part
            .trim()
            .parse()
            .map_err(|_| Error::InvalidCidr(s.to_string()))?;

        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|&p| p <= max)
                .ok_or_else(|| Error::InvalidCidr(s.to_string()))?,
            None => max,
        };

        Ok(Self { network, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

/// Parse the configured allow-list. An empty input allows every address.
pub fn parse_cidrs(specs: &[String]) -> Result<Vec<Cidr>> {
    specs.iter().map(|s| Cidr::parse(s)).collect()
}

/// Whether `ip` is acceptable under the allow-list.
pub fn ip_allowed(allowed: &[Cidr], ip: &IpAddr) -> bool {
    allowed.is_empty() || allowed.iter().any(|c| c.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_match_v4() {
        let cidr = Cidr::parse("10.0.0.0/8").unwrap();
        assert!(cidr.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!cidr.contains(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_bare_address_is_host_route() {
        let cidr = Cidr::parse("192.168.1.5").unwrap();
        assert!(cidr.contains(&"192.168.1.5".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn test_v6() {
        let cidr = Cidr::parse("fd00::/8").unwrap();
        assert!(cidr.contains(&"fd12::1".parse().unwrap()));
        assert!(!cidr.contains(&"fe80::1".parse().unwrap()));
        // Families never cross-match.
        assert!(!cidr.contains(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_zero_prefix_matches_all() {
        let cidr = Cidr::parse("0.0.0.0/0").unwrap();
        assert!(cidr.contains(&"203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Cidr::parse("not-an-addr/8").is_err());
        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_empty_list_allows_everything() {
        assert!(ip_allowed(&[], &"1.2.3.4".parse().unwrap()));
        let list = parse_cidrs(&["127.0.0.0/8".to_string()]).unwrap();
        assert!(ip_allowed(&list, &"127.0.0.1".parse().unwrap()));
        assert!(!ip_allowed(&list, &"1.2.3.4".parse().unwrap()));
    }
}
