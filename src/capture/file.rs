//! Capture file replay

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use pcap_file::pcap::PcapReader;
use tracing::info;

use crate::core::DecodedPacket;
use crate::error::{FlowError, Result};

use super::decode::{Decoder, LinkType};
use super::PacketSource;

/// Replays a classic pcap file
pub struct PcapFileSource {
    reader: PcapReader<BufReader<File>>,
    decoder: Decoder,
    path: String,
    frames: u64,
}

impl PcapFileSource {
    /// Open `path`; the link type comes from the file header
    pub fn open(path: impl AsRef<Path>, dns_ports: Vec<u16>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = PcapReader::new(BufReader::new(file))
            .map_err(|e| FlowError::Capture(format!("{}: {}", path.display(), e)))?;

        let dlt = u32::from(reader.header().datalink);
        let link = LinkType::from_dlt(dlt)?;

        info!(path = %path.display(), ?link, "opened capture file");

        Ok(Self {
            reader,
            decoder: Decoder::new(link, dns_ports),
            path: path.display().to_string(),
            frames: 0,
        })
    }

    /// Frames read so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Option<DecodedPacket>> {
        let Some(packet) = self.reader.next_packet() else {
            return Ok(None);
        };
        let packet = packet.map_err(|e| FlowError::Capture(e.to_string()))?;
        self.frames += 1;
        self.decoder.decode(&packet.data).map(Some)
    }

    fn describe(&self) -> String {
        format!("file {}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use etherparse::PacketBuilder;
    use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
    use pcap_file::DataLink;

    fn write_capture(path: &Path, frames: &[Vec<u8>]) {
        let file = File::create(path).unwrap();
        let header = PcapHeader {
            datalink: DataLink::ETHERNET,
            ..Default::default()
        };
        let mut writer = PcapWriter::with_header(file, header).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let packet = PcapPacket::new(Duration::from_millis(i as u64), frame.len() as u32, frame);
            writer.write_packet(&packet).unwrap();
        }
    }

    fn syn_frame(src_port: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 2], [10, 0, 0, 1], 64)
            .tcp(src_port, 80, 1, 1024)
            .syn();
        let mut frame = Vec::new();
        builder.write(&mut frame, &[]).unwrap();
        frame
    }

    #[test]
    fn test_replay_file() {
        let path = std::env::temp_dir().join(format!("flowtap-replay-{}.pcap", std::process::id()));
        write_capture(&path, &[syn_frame(40000), vec![0u8; 4], syn_frame(40001)]);

        let mut source = PcapFileSource::open(&path, vec![53]).unwrap();
        assert_eq!(source.next_packet().unwrap().unwrap().src_port(), Some(40000));
        // a runt frame is a per-packet fault
        assert!(source.next_packet().unwrap_err().is_decode_fault());
        assert_eq!(source.next_packet().unwrap().unwrap().src_port(), Some(40001));
        assert!(source.next_packet().unwrap().is_none());
        assert_eq!(source.frames(), 3);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            PcapFileSource::open("/nonexistent/flowtap.pcap", vec![]),
            Err(FlowError::Io(_))
        ));
    }
}
