//! Per-packet classification
//!
//! Runs on the capture thread. Applies the subnet gate, then the first
//! matching protocol path (UDP, TCP, ICMP), feeding the session tables and
//! turning their observations into events.

use std::sync::Arc;

use tracing::trace;

use crate::core::{DecodedPacket, FlowEvent, IpLayer, IpProtocol, TcpFlags, Transport};
use crate::error::{DecodeFault, Result};
use crate::filter::FlowFilter;
use crate::flow::{TcpSessionTable, UdpSessionTable};

pub struct Classifier {
    filter: FlowFilter,
    tcp: Arc<TcpSessionTable>,
    udp: Arc<UdpSessionTable>,
}

impl Classifier {
    pub fn new(filter: FlowFilter, tcp: Arc<TcpSessionTable>, udp: Arc<UdpSessionTable>) -> Self {
        Self { filter, tcp, udp }
    }

    pub fn tcp_table(&self) -> &Arc<TcpSessionTable> {
        &self.tcp
    }

    pub fn udp_table(&self) -> &Arc<UdpSessionTable> {
        &self.udp
    }

    /// Classify one packet
    ///
    /// `Ok(None)` means the packet was filtered out or produced no state
    /// change. A packet without an IP layer is a decode fault.
    pub fn inspect(&self, packet: &DecodedPacket) -> Result<Option<FlowEvent>> {
        let ip = packet.ip.as_ref().ok_or(DecodeFault::MissingIpLayer)?;

        if !self.filter.match_addresses(&ip.src, &ip.dst) {
            trace!(src = %ip.src, dst = %ip.dst, "outside configured subnets");
            return Ok(None);
        }

        let event = match packet.transport {
            Transport::Udp { src_port, dst_port } if self.filter.match_protocol("udp") => {
                self.inspect_udp(ip, src_port, dst_port, packet.dns_query.as_deref())
            }
            Transport::Tcp { src_port, dst_port, flags } if self.filter.match_protocol("tcp") => {
                self.inspect_tcp(ip, src_port, dst_port, flags)
            }
            Transport::Icmp if self.filter.match_protocol("icmp") => {
                Some(FlowEvent::icmp(&ip.src, &ip.dst, ip.protocol))
            }
            _ => None,
        };

        Ok(event)
    }

    fn inspect_udp(
        &self,
        ip: &IpLayer,
        src_port: u16,
        dst_port: u16,
        dns_query: Option<&str>,
    ) -> Option<FlowEvent> {
        if !self.filter.match_port(dst_port) {
            return None;
        }

        let obs = self.udp.observe(&ip.src, src_port, &ip.dst, dst_port);
        // known flow: reported again only when it expires
        let state = obs.state?;

        let event = FlowEvent::session(
            &ip.src,
            src_port,
            &ip.dst,
            dst_port,
            ip.protocol,
            IpProtocol::Udp,
            state,
            obs.session_id,
        );

        let domain = dns_query.filter(|domain| {
            self.filter.dns_enabled()
                && self.filter.match_dns_port(dst_port)
                && self.filter.match_domain(domain)
        });

        Some(match domain {
            Some(domain) => event.with_dns(domain),
            None => event,
        })
    }

    fn inspect_tcp(
        &self,
        ip: &IpLayer,
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
    ) -> Option<FlowEvent> {
        // either side may carry the service port depending on direction
        if !self.filter.match_port(dst_port) && !self.filter.match_port(src_port) {
            return None;
        }

        let obs = self.tcp.observe(&ip.src, src_port, &ip.dst, dst_port, flags);
        let state = obs.state?;

        Some(FlowEvent::session(
            &ip.src,
            src_port,
            &ip.dst,
            dst_port,
            ip.protocol,
            IpProtocol::Tcp,
            state,
            obs.session_id,
        ))
    }
}
