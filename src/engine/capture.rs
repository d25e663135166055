//! Capture thread
//!
//! A dedicated OS thread runs `source -> classifier -> queue` for the
//! lifetime of the capture. It never yields to the async runtime; when the
//! queue is full it blocks, which stalls capture instead of losing events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::capture::PacketSource;
use crate::error::{FlowError, Result};

use super::classifier::Classifier;
use super::pipeline::EventSender;

/// Counters updated by the capture thread
#[derive(Debug, Default)]
pub struct EngineStats {
    packets_seen: AtomicU64,
    decode_faults: AtomicU64,
    events_emitted: AtomicU64,
}

impl EngineStats {
    pub fn packets_seen(&self) -> u64 {
        self.packets_seen.load(Ordering::Relaxed)
    }

    pub fn decode_faults(&self) -> u64 {
        self.decode_faults.load(Ordering::Relaxed)
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            packets_seen: self.packets_seen(),
            decode_faults: self.decode_faults(),
            events_emitted: self.events_emitted(),
        }
    }
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub packets_seen: u64,
    pub decode_faults: u64,
    pub events_emitted: u64,
}

pub struct CaptureThread {
    handle: JoinHandle<Result<()>>,
    running: Arc<AtomicBool>,
}

impl CaptureThread {
    /// Start capturing; `done` fires when the loop exits for any reason
    pub fn spawn(
        source: Box<dyn PacketSource>,
        classifier: Classifier,
        events: EventSender,
        stats: Arc<EngineStats>,
        running: Arc<AtomicBool>,
        done: oneshot::Sender<()>,
    ) -> Result<Self> {
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("flowtap-capture".to_string())
            .spawn(move || {
                let result = capture_loop(source, &classifier, &events, &stats, &flag);
                if let Err(e) = &result {
                    error!("capture stopped: {}", e);
                }
                let _ = done.send(());
                result
            })?;

        Ok(Self { handle, running })
    }

    /// Ask the loop to stop after the current packet
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and return its result
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| FlowError::Capture("capture thread panicked".to_string()))?
    }
}

fn capture_loop(
    mut source: Box<dyn PacketSource>,
    classifier: &Classifier,
    events: &EventSender,
    stats: &EngineStats,
    running: &AtomicBool,
) -> Result<()> {
    info!(source = %source.describe(), "capture started");

    while running.load(Ordering::SeqCst) {
        let packet = match source.next_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) if e.is_decode_fault() => {
                stats.decode_faults.fetch_add(1, Ordering::Relaxed);
                debug!("skipping packet: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        stats.packets_seen.fetch_add(1, Ordering::Relaxed);

        match classifier.inspect(&packet) {
            Ok(Some(event)) => {
                events.send_blocking(event)?;
                stats.events_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) if e.is_decode_fault() => {
                stats.decode_faults.fetch_add(1, Ordering::Relaxed);
                debug!("skipping packet: {}", e);
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        packets = stats.packets_seen(),
        faults = stats.decode_faults(),
        events = stats.events_emitted(),
        "capture finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::capture::MemorySource;
    use crate::core::{DecodedPacket, SessionState, TcpFlags};
    use crate::error::DecodeFault;
    use crate::filter::FlowFilter;
    use crate::flow::{TcpSessionTable, UdpSessionTable};
    use crate::engine::pipeline::{bounded, QueueDiscipline};

    fn classifier() -> Classifier {
        Classifier::new(
            FlowFilter::allow_all(),
            Arc::new(TcpSessionTable::new(Duration::from_secs(60))),
            Arc::new(UdpSessionTable::default()),
        )
    }

    #[tokio::test]
    async fn test_capture_skips_faults_and_signals_done() {
        let mut source = MemorySource::new([DecodedPacket::tcp("10.0.0.2", 40000, "10.0.0.1", 80, TcpFlags::SYN)]);
        source.push_error(FlowError::Decode(DecodeFault::Truncated("runt".into())));
        source.push(DecodedPacket::tcp("10.0.0.1", 80, "10.0.0.2", 40000, TcpFlags::SYN | TcpFlags::ACK));

        let (tx, mut rx) = bounded(8, QueueDiscipline::Block);
        let stats = Arc::new(EngineStats::default());
        let (done_tx, done_rx) = oneshot::channel();

        let capture = CaptureThread::spawn(
            Box::new(source),
            classifier(),
            tx,
            stats.clone(),
            Arc::new(AtomicBool::new(true)),
            done_tx,
        )
        .unwrap();

        done_rx.await.unwrap();
        capture.join().unwrap();

        assert_eq!(rx.recv().await.unwrap().state, Some(SessionState::New));
        assert_eq!(rx.recv().await.unwrap().state, Some(SessionState::Established));
        assert!(rx.recv().await.is_none());
        assert_eq!(
            stats.snapshot(),
            CaptureStats { packets_seen: 2, decode_faults: 1, events_emitted: 2 }
        );
    }

    #[tokio::test]
    async fn test_capture_stops_when_queue_closed() {
        let source = MemorySource::new([DecodedPacket::icmp("10.0.0.2", "10.0.0.1")]);
        let (tx, rx) = bounded(8, QueueDiscipline::Block);
        drop(rx);
        let (done_tx, done_rx) = oneshot::channel();

        let capture = CaptureThread::spawn(
            Box::new(source),
            classifier(),
            tx,
            Arc::new(EngineStats::default()),
            Arc::new(AtomicBool::new(true)),
            done_tx,
        )
        .unwrap();

        done_rx.await.unwrap();
        assert!(matches!(capture.join(), Err(FlowError::PipelineClosed)));
    }

    #[test]
    fn test_cleared_flag_reads_nothing() {
        let source = MemorySource::new([DecodedPacket::icmp("10.0.0.2", "10.0.0.1")]);
        let (tx, _rx) = bounded(8, QueueDiscipline::Block);
        let stats = Arc::new(EngineStats::default());
        let (done_tx, _done_rx) = oneshot::channel();

        let capture = CaptureThread::spawn(
            Box::new(source),
            classifier(),
            tx,
            stats.clone(),
            Arc::new(AtomicBool::new(false)),
            done_tx,
        )
        .unwrap();

        capture.join().unwrap();
        assert_eq!(stats.packets_seen(), 0);
    }
}
