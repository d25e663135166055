//! Live interface capture through libpcap

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pcap::{Active, Capture, Device};
use tracing::info;

use crate::core::DecodedPacket;
use crate::error::{FlowError, Result};

use super::decode::{Decoder, LinkType};
use super::{CaptureConfig, PacketSource};

pub struct LiveSource {
    capture: Capture<Active>,
    decoder: Decoder,
    interface: String,
    running: Arc<AtomicBool>,
}

impl LiveSource {
    /// Open `interface`, optionally installing a BPF filter
    ///
    /// Reads return `Ok(None)` once `running` is cleared.
    pub fn open(
        interface: &str,
        config: &CaptureConfig,
        bpf: Option<&str>,
        dns_ports: Vec<u16>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        ensure_interface(interface)?;

        let mut capture = Capture::from_device(interface)
            .map_err(|e| FlowError::Capture(e.to_string()))?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen as i32)
            .timeout(config.timeout_ms as i32)
            .open()
            .map_err(|e| FlowError::Capture(format!("{}: {}", interface, e)))?;

        if let Some(expr) = bpf.filter(|e| !e.trim().is_empty()) {
            capture
                .filter(expr, true)
                .map_err(|e| FlowError::Capture(format!("filter '{}': {}", expr, e)))?;
        }

        let link = LinkType::from_dlt(capture.get_datalink().0 as u32)?;
        info!(interface, ?link, filter = bpf.unwrap_or(""), "capturing on interface");

        Ok(Self {
            capture,
            decoder: Decoder::new(link, dns_ports),
            interface: interface.to_string(),
            running,
        })
    }
}

/// Fail unless libpcap knows the interface
pub fn ensure_interface(interface: &str) -> Result<()> {
    let devices = Device::list().map_err(|e| FlowError::Capture(e.to_string()))?;
    if devices.iter().any(|d| d.name == interface) {
        Ok(())
    } else {
        Err(FlowError::Capture(format!("interface '{}' not found", interface)))
    }
}

impl PacketSource for LiveSource {
    fn next_packet(&mut self) -> Result<Option<DecodedPacket>> {
        while self.running.load(Ordering::SeqCst) {
            match self.capture.next_packet() {
                Ok(packet) => return self.decoder.decode(packet.data).map(Some),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(FlowError::Capture(e.to_string())),
            }
        }
        Ok(None)
    }

    fn describe(&self) -> String {
        format!("interface {}", self.interface)
    }
}
