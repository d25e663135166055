//! Packet sources
//!
//! Everything that turns frames on the wire (or in a capture file) into
//! [`DecodedPacket`]s for the classifier. Sources are synchronous and are
//! driven from a dedicated capture thread.

pub mod decode;
pub mod file;
#[cfg(feature = "live")]
pub mod live;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::DecodedPacket;
use crate::error::Result;

pub use decode::{parse_dns_query, Decoder, LinkType};
pub use file::PcapFileSource;
#[cfg(feature = "live")]
pub use live::LiveSource;

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Replay this capture file instead of sniffing an interface
    pub pcap_file: Option<String>,
    /// Snapshot length
    pub snaplen: u32,
    /// Put the interface into promiscuous mode
    pub promiscuous: bool,
    /// Read timeout in milliseconds
    pub timeout_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pcap_file: None,
            snaplen: 65535,
            promiscuous: true,
            timeout_ms: 100,
        }
    }
}

/// Source of decoded packets
///
/// `Ok(None)` ends the capture. An `Err` that
/// [`is_decode_fault`](crate::error::FlowError::is_decode_fault) only skips
/// the current frame; any other error stops capture.
pub trait PacketSource: Send {
    fn next_packet(&mut self) -> Result<Option<DecodedPacket>>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// In-memory source, mostly for tests and replaying synthetic traffic
#[derive(Debug, Default)]
pub struct MemorySource {
    packets: VecDeque<Result<DecodedPacket>>,
}

impl MemorySource {
    pub fn new<I>(packets: I) -> Self
    where
        I: IntoIterator<Item = DecodedPacket>,
    {
        Self {
            packets: packets.into_iter().map(Ok).collect(),
        }
    }

    /// Queue a packet
    pub fn push(&mut self, packet: DecodedPacket) {
        self.packets.push_back(Ok(packet));
    }

    /// Queue a failure, returned in order with the packets
    pub fn push_error(&mut self, error: crate::error::FlowError) {
        self.packets.push_back(Err(error));
    }

    pub fn remaining(&self) -> usize {
        self.packets.len()
    }
}

impl PacketSource for MemorySource {
    fn next_packet(&mut self) -> Result<Option<DecodedPacket>> {
        self.packets.pop_front().transpose()
    }

    fn describe(&self) -> String {
        format!("memory ({} packets)", self.packets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DecodeFault, FlowError};

    #[test]
    fn test_memory_source_order() {
        let mut source = MemorySource::new([
            DecodedPacket::udp("10.0.0.2", 5000, "10.0.0.1", 53),
            DecodedPacket::icmp("10.0.0.2", "10.0.0.1"),
        ]);
        source.push_error(FlowError::Decode(DecodeFault::MissingIpLayer));

        assert_eq!(source.next_packet().unwrap().unwrap().dst_port(), Some(53));
        assert_eq!(source.next_packet().unwrap().unwrap().dst_port(), None);
        assert!(source.next_packet().unwrap_err().is_decode_fault());
        assert!(source.next_packet().unwrap().is_none());
    }
}
