//! Decoded packet representation
//!
//! The boundary record handed over by the capture layer: only the fields the
//! classifier needs, already extracted from the wire.

use serde::{Deserialize, Serialize};

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl IpProtocol {
    /// Protocol name as carried on emitted events
    pub fn name(&self) -> &'static str {
        match self {
            IpProtocol::Icmp | IpProtocol::Icmpv6 => "ICMP",
            IpProtocol::Tcp => "TCP",
            IpProtocol::Udp => "UDP",
            IpProtocol::Other(_) => "IP",
        }
    }

    pub fn number(&self) -> u8 {
        u8::from(*self)
    }
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;

    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        if self.ece { flags |= 0x40; }
        if self.cwr { flags |= 0x80; }
        flags
    }

    /// SYN without ACK: the opening packet of a handshake
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    pub fn is_rst(&self) -> bool {
        self.rst
    }
}

impl From<u8> for TcpFlags {
    fn from(flags: u8) -> Self {
        TcpFlags::from_u8(flags)
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if self.ece { s.push('E'); }
        if self.cwr { s.push('C'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Network layer fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLayer {
    /// Source address as rendered by the decoder
    pub src: String,
    /// Destination address as rendered by the decoder
    pub dst: String,
    /// IP protocol number (next header for IPv6)
    pub protocol: u8,
}

/// Transport layer fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp {
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    /// ICMP is tracked by presence only
    Icmp,
    Other,
}

/// A packet as delivered by the capture layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    /// IP layer, absent for ARP and other non-IP frames
    pub ip: Option<IpLayer>,
    /// Transport layer
    pub transport: Transport,
    /// First DNS query name, dot-trimmed, when the decoder was asked for it
    pub dns_query: Option<String>,
}

impl DecodedPacket {
    pub fn tcp(src: &str, src_port: u16, dst: &str, dst_port: u16, flags: u8) -> Self {
        Self {
            ip: Some(IpLayer {
                src: src.to_string(),
                dst: dst.to_string(),
                protocol: 6,
            }),
            transport: Transport::Tcp {
                src_port,
                dst_port,
                flags: TcpFlags::from_u8(flags),
            },
            dns_query: None,
        }
    }

    pub fn udp(src: &str, src_port: u16, dst: &str, dst_port: u16) -> Self {
        Self {
            ip: Some(IpLayer {
                src: src.to_string(),
                dst: dst.to_string(),
                protocol: 17,
            }),
            transport: Transport::Udp { src_port, dst_port },
            dns_query: None,
        }
    }

    pub fn icmp(src: &str, dst: &str) -> Self {
        Self {
            ip: Some(IpLayer {
                src: src.to_string(),
                dst: dst.to_string(),
                protocol: 1,
            }),
            transport: Transport::Icmp,
            dns_query: None,
        }
    }

    /// Attach a DNS query name
    pub fn with_dns_query(mut self, name: impl Into<String>) -> Self {
        self.dns_query = Some(name.into());
        self
    }

    pub fn src_port(&self) -> Option<u16> {
        match self.transport {
            Transport::Tcp { src_port, .. } | Transport::Udp { src_port, .. } => Some(src_port),
            _ => None,
        }
    }

    pub fn dst_port(&self) -> Option<u16> {
        match self.transport {
            Transport::Tcp { dst_port, .. } | Transport::Udp { dst_port, .. } => Some(dst_port),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_flags_roundtrip_bits() {
        let flags = TcpFlags::from_u8(TcpFlags::SYN | TcpFlags::ACK);
        assert!(flags.syn && flags.ack);
        assert!(!flags.is_syn());
        assert!(flags.is_syn_ack());
        assert_eq!(flags.to_u8(), 0x12);
        assert_eq!(flags.to_string(), "SA");
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(IpProtocol::from(6).name(), "TCP");
        assert_eq!(IpProtocol::from(17).name(), "UDP");
        assert_eq!(IpProtocol::from(1).name(), "ICMP");
        assert_eq!(IpProtocol::Udp.number(), 17);
    }

    #[test]
    fn test_packet_ports() {
        let pkt = DecodedPacket::udp("10.0.0.1", 5353, "10.0.0.2", 53);
        assert_eq!(pkt.src_port(), Some(5353));
        assert_eq!(pkt.dst_port(), Some(53));
        assert_eq!(DecodedPacket::icmp("10.0.0.1", "10.0.0.2").dst_port(), None);
    }
}
