//! Frame decoding
//!
//! Slices link, network and transport headers with etherparse and keeps only
//! what the classifier needs. UDP datagrams to or from a DNS port also get
//! their first question name extracted.

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use tracing::trace;

use crate::core::{DecodedPacket, IpLayer, TcpFlags, Transport};
use crate::error::{DecodeFault, Result};

/// DNS header length
const DNS_HEADER_LEN: usize = 12;

/// Maximum compression pointers followed while reading a name
const MAX_POINTER_DEPTH: usize = 10;

/// Link layer of the frames handed to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4/IPv6 packets
    RawIp,
    /// Linux "cooked" capture (`any` interface)
    LinuxSll,
}

impl LinkType {
    /// Map a pcap DLT number
    pub fn from_dlt(dlt: u32) -> std::result::Result<Self, DecodeFault> {
        match dlt {
            1 => Ok(LinkType::Ethernet),
            12 | 101 | 228 | 229 => Ok(LinkType::RawIp),
            113 => Ok(LinkType::LinuxSll),
            other => Err(DecodeFault::UnsupportedLinkType(other)),
        }
    }
}

/// Frame decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    link: LinkType,
    dns_ports: Vec<u16>,
}

impl Decoder {
    /// `dns_ports` selects the UDP datagrams whose payload is parsed as DNS
    pub fn new(link: LinkType, dns_ports: Vec<u16>) -> Self {
        Self { link, dns_ports }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<DecodedPacket> {
        let sliced = match self.link {
            LinkType::Ethernet => SlicedPacket::from_ethernet(frame),
            LinkType::RawIp => SlicedPacket::from_ip(frame),
            LinkType::LinuxSll => SlicedPacket::from_linux_sll(frame),
        }
        .map_err(|e| DecodeFault::Truncated(e.to_string()))?;

        let ip = match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => IpLayer {
                src: ipv4.header().source_addr().to_string(),
                dst: ipv4.header().destination_addr().to_string(),
                protocol: ipv4.payload().ip_number.0,
            },
            Some(NetSlice::Ipv6(ipv6)) => IpLayer {
                src: ipv6.header().source_addr().to_string(),
                dst: ipv6.header().destination_addr().to_string(),
                protocol: ipv6.payload().ip_number.0,
            },
            // ARP and other non-IP frames
            _ => return Err(DecodeFault::MissingIpLayer.into()),
        };

        let mut dns_query = None;
        let transport = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => Transport::Tcp {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                flags: TcpFlags {
                    fin: tcp.fin(),
                    syn: tcp.syn(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    ack: tcp.ack(),
                    urg: tcp.urg(),
                    ece: tcp.ece(),
                    cwr: tcp.cwr(),
                },
            },
            Some(TransportSlice::Udp(udp)) => {
                let (src_port, dst_port) = (udp.source_port(), udp.destination_port());
                if self.is_dns_port(src_port) || self.is_dns_port(dst_port) {
                    dns_query = match parse_dns_query(udp.payload()) {
                        Ok(name) => name,
                        Err(fault) => {
                            trace!(src_port, dst_port, "no DNS question: {}", fault);
                            None
                        }
                    };
                }
                Transport::Udp { src_port, dst_port }
            }
            Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => Transport::Icmp,
            _ => Transport::Other,
        };

        Ok(DecodedPacket {
            ip: Some(ip),
            transport,
            dns_query,
        })
    }

    fn is_dns_port(&self, port: u16) -> bool {
        self.dns_ports.contains(&port)
    }
}

/// First question name of a DNS message, without the trailing dot
///
/// `Ok(None)` when the message carries no question.
pub fn parse_dns_query(payload: &[u8]) -> std::result::Result<Option<String>, DecodeFault> {
    if payload.len() < DNS_HEADER_LEN {
        return Err(DecodeFault::MalformedDns);
    }

    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    if qdcount == 0 {
        return Ok(None);
    }

    let name = read_name(payload, DNS_HEADER_LEN).ok_or(DecodeFault::MalformedDns)?;
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        return Ok(None);
    }
    Ok(Some(name.to_string()))
}

fn read_name(payload: &[u8], mut offset: usize) -> Option<String> {
    let mut name = String::new();
    let mut depth = 0;

    loop {
        let len = *payload.get(offset)? as usize;

        if len == 0 {
            return Some(name);
        }

        // compression pointer
        if len & 0xC0 == 0xC0 {
            let low = *payload.get(offset + 1)? as usize;
            depth += 1;
            if depth > MAX_POINTER_DEPTH {
                return None;
            }
            offset = ((len & 0x3F) << 8) | low;
            continue;
        }

        let label = payload.get(offset + 1..offset + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        offset += 1 + len;
    }
}
