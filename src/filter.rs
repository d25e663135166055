//! Packet filtering
//!
//! Subnet, port, protocol and DNS-domain predicates evaluated against a
//! compiled snapshot of [`FilterCriteria`]. Every predicate passes everything
//! when its list is not configured.

use std::collections::HashSet;
use std::net::IpAddr;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Protocol names accepted in `filter.protocol`
pub const PROTOCOL_NAMES: &[&str] = &["tcp", "udp", "icmp", "ip", "arp", "all"];

/// Filter section of the configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    /// Raw capture filter expression, handed to the capture layer untouched
    pub expression: String,
    /// Source subnets (CIDR or single address)
    pub source: Option<Vec<String>>,
    /// Destination subnets (CIDR or single address)
    pub destination: Option<Vec<String>>,
    /// Require both source and destination to match
    pub strict: bool,
    /// Allowed ports
    pub port: Option<Vec<u16>>,
    /// Allowed protocol names
    pub protocol: Option<Vec<String>>,
    /// Payload filters
    pub payload: PayloadFilter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadFilter {
    pub dns: DnsFilter,
}

/// DNS query annotation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsFilter {
    pub enabled: bool,
    /// Destination ports treated as DNS
    pub ports: Option<Vec<u16>>,
    /// Glob patterns matched against the queried domain
    #[serde(rename = "match")]
    pub patterns: Vec<String>,
}

/// Which address list a subnet check runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

/// Compiled filter, cheap to query per packet
#[derive(Debug, Clone)]
pub struct FlowFilter {
    source: Option<Vec<IpNetwork>>,
    destination: Option<Vec<IpNetwork>>,
    strict: bool,
    ports: Option<HashSet<u16>>,
    protocols: Option<HashSet<String>>,
    dns_enabled: bool,
    dns_ports: Option<HashSet<u16>>,
    dns_patterns: Option<GlobSet>,
}

impl FlowFilter {
    /// Compile the criteria; invalid networks or glob patterns are errors
    pub fn new(criteria: &FilterCriteria) -> Result<Self> {
        let dns = &criteria.payload.dns;

        Ok(Self {
            source: criteria.source.as_deref().map(parse_networks).transpose()?,
            destination: criteria.destination.as_deref().map(parse_networks).transpose()?,
            strict: criteria.strict,
            ports: non_empty(&criteria.port).map(|p| p.iter().copied().collect()),
            protocols: non_empty(&criteria.protocol)
                .map(|p| p.iter().map(|s| s.trim().to_lowercase()).collect()),
            dns_enabled: dns.enabled,
            dns_ports: non_empty(&dns.ports).map(|p| p.iter().copied().collect()),
            dns_patterns: build_glob_set(&dns.patterns)?,
        })
    }

    /// Filter that lets everything through
    pub fn allow_all() -> Self {
        Self {
            source: None,
            destination: None,
            strict: false,
            ports: None,
            protocols: None,
            dns_enabled: false,
            dns_ports: None,
            dns_patterns: None,
        }
    }

    fn subnets_configured(&self) -> bool {
        let non_empty = |list: &Option<Vec<IpNetwork>>| list.as_ref().is_some_and(|l| !l.is_empty());
        non_empty(&self.source) || non_empty(&self.destination)
    }

    /// Check one address against one side's subnet list
    ///
    /// Unparseable addresses never match.
    pub fn match_subnet(&self, ip: &str, side: Side) -> bool {
        if !self.subnets_configured() {
            return true;
        }

        let list = match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        };
        let Some(networks) = list.as_ref().filter(|l| !l.is_empty()) else {
            return false;
        };

        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => networks.iter().any(|net| net.contains(addr)),
            Err(_) => false,
        }
    }

    /// Subnet gate for a packet; strict mode needs both sides to match
    pub fn match_addresses(&self, src_ip: &str, dst_ip: &str) -> bool {
        let src = self.match_subnet(src_ip, Side::Source);
        let dst = self.match_subnet(dst_ip, Side::Destination);
        if self.strict {
            src && dst
        } else {
            src || dst
        }
    }

    pub fn match_port(&self, port: u16) -> bool {
        self.ports.as_ref().map_or(true, |ports| ports.contains(&port))
    }

    /// Case-insensitive protocol membership; `all` admits every protocol
    pub fn match_protocol(&self, protocol: &str) -> bool {
        match &self.protocols {
            None => true,
            Some(list) => list.contains("all") || list.contains(&protocol.to_lowercase()),
        }
    }

    pub fn dns_enabled(&self) -> bool {
        self.dns_enabled
    }

    /// Whether a destination port is one of the DNS candidate ports
    pub fn match_dns_port(&self, port: u16) -> bool {
        self.dns_ports.as_ref().map_or(true, |ports| ports.contains(&port))
    }

    /// Case-insensitive glob match of a queried domain
    ///
    /// Passes everything when DNS filtering is disabled or no pattern is set.
    pub fn match_domain(&self, domain: &str) -> bool {
        if !self.dns_enabled {
            return true;
        }
        match &self.dns_patterns {
            None => true,
            Some(set) => set.is_match(domain.trim().to_lowercase()),
        }
    }
}

impl Default for FlowFilter {
    fn default() -> Self {
        Self::allow_all()
    }
}

/// Parse a CIDR range or a single address
pub fn parse_network(value: &str) -> Result<IpNetwork> {
    value.trim().parse::<IpNetwork>().map_err(|e| FlowError::InvalidNetwork {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// An empty list counts as not configured
fn non_empty<T>(list: &Option<Vec<T>>) -> Option<&[T]> {
    list.as_deref().filter(|l| !l.is_empty())
}

fn parse_networks(list: &[String]) -> Result<Vec<IpNetwork>> {
    list.iter().map(|s| parse_network(s)).collect()
}

fn build_glob_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let normalized = pattern.trim().to_lowercase();
        let glob = GlobBuilder::new(&normalized)
            .case_insensitive(true)
            .build()
            .map_err(|e| FlowError::InvalidGlob {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        builder.add(glob);
    }

    builder.build().map(Some).map_err(|e| FlowError::InvalidGlob {
        pattern: patterns.join(","),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Option<Vec<String>> {
        Some(items.iter().map(|s| s.to_string()).collect())
    }

    fn criteria_with_subnets(strict: bool) -> FilterCriteria {
        FilterCriteria {
            source: strings(&["192.168.1.0/24"]),
            destination: strings(&["10.0.0.5"]),
            strict,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_subnets_passes_everything() {
        let filter = FlowFilter::new(&FilterCriteria::default()).unwrap();
        assert!(filter.match_addresses("1.2.3.4", "5.6.7.8"));
        assert!(filter.match_subnet("garbage", Side::Source));
    }

    #[test]
    fn test_non_strict_needs_one_side() {
        let filter = FlowFilter::new(&criteria_with_subnets(false)).unwrap();
        assert!(filter.match_addresses("192.168.1.7", "8.8.8.8"));
        assert!(filter.match_addresses("172.16.0.1", "10.0.0.5"));
        assert!(!filter.match_addresses("172.16.0.1", "8.8.8.8"));
    }

    #[test]
    fn test_strict_needs_both_sides() {
        let filter = FlowFilter::new(&criteria_with_subnets(true)).unwrap();
        assert!(filter.match_addresses("192.168.1.7", "10.0.0.5"));
        assert!(!filter.match_addresses("192.168.1.7", "8.8.8.8"));
        assert!(!filter.match_addresses("172.16.0.1", "10.0.0.5"));
    }

    #[test]
    fn test_unconfigured_side_never_matches() {
        let criteria = FilterCriteria {
            source: strings(&["192.168.1.0/24"]),
            ..Default::default()
        };
        let filter = FlowFilter::new(&criteria).unwrap();
        assert!(!filter.match_subnet("10.0.0.5", Side::Destination));
        assert!(filter.match_addresses("192.168.1.1", "10.0.0.5"));
    }

    #[test]
    fn test_unparseable_address_fails_closed() {
        let filter = FlowFilter::new(&criteria_with_subnets(false)).unwrap();
        assert!(!filter.match_subnet("not-an-ip", Side::Source));
        assert!(!filter.match_subnet("", Side::Destination));
    }

    #[test]
    fn test_ipv6_subnets() {
        let criteria = FilterCriteria {
            source: strings(&["fd00::/8"]),
            ..Default::default()
        };
        let filter = FlowFilter::new(&criteria).unwrap();
        assert!(filter.match_subnet("fd12::1", Side::Source));
        assert!(!filter.match_subnet("2001:db8::1", Side::Source));
    }

    #[test]
    fn test_invalid_network_is_rejected() {
        let criteria = FilterCriteria {
            source: strings(&["10.0.0.0/99"]),
            ..Default::default()
        };
        assert!(matches!(
            FlowFilter::new(&criteria),
            Err(FlowError::InvalidNetwork { .. })
        ));
    }

    #[test]
    fn test_port_filter() {
        let open = FlowFilter::allow_all();
        assert!(open.match_port(12345));

        let criteria = FilterCriteria {
            port: Some(vec![53, 443]),
            ..Default::default()
        };
        let filter = FlowFilter::new(&criteria).unwrap();
        assert!(filter.match_port(443));
        assert!(!filter.match_port(80));
    }

    #[test]
    fn test_protocol_filter_case_insensitive() {
        let criteria = FilterCriteria {
            protocol: strings(&["TCP", "icmp"]),
            ..Default::default()
        };
        let filter = FlowFilter::new(&criteria).unwrap();
        assert!(filter.match_protocol("tcp"));
        assert!(filter.match_protocol("ICMP"));
        assert!(!filter.match_protocol("udp"));
        assert!(FlowFilter::allow_all().match_protocol("udp"));

        let criteria = FilterCriteria {
            protocol: strings(&["all"]),
            ..Default::default()
        };
        assert!(FlowFilter::new(&criteria).unwrap().match_protocol("udp"));
    }

    #[test]
    fn test_domain_glob_match() {
        let mut criteria = FilterCriteria::default();
        criteria.payload.dns = DnsFilter {
            enabled: true,
            ports: Some(vec![53]),
            patterns: vec!["*.Example.com".into(), "api?.test.org".into()],
        };
        let filter = FlowFilter::new(&criteria).unwrap();

        assert!(filter.match_domain("www.example.com"));
        assert!(filter.match_domain("A.B.EXAMPLE.COM"));
        assert!(filter.match_domain("api1.test.org"));
        assert!(!filter.match_domain("example.com"));
        assert!(!filter.match_domain("other.net"));
        assert!(filter.match_dns_port(53));
        assert!(!filter.match_dns_port(5353));
    }

    #[test]
    fn test_domain_match_passes_without_patterns() {
        let mut criteria = FilterCriteria::default();
        criteria.payload.dns.enabled = true;
        let filter = FlowFilter::new(&criteria).unwrap();
        assert!(filter.match_domain("anything.example"));
    }

    #[test]
    fn test_empty_lists_are_ignored() {
        let criteria = FilterCriteria {
            port: Some(vec![]),
            protocol: Some(vec![]),
            source: Some(vec![]),
            ..Default::default()
        };
        let filter = FlowFilter::new(&criteria).unwrap();
        assert!(filter.match_port(80));
        assert!(filter.match_protocol("udp"));
        assert!(filter.match_addresses("1.2.3.4", "5.6.7.8"));
    }
}
