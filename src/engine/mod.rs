//! Flow engine
//!
//! Wires the capture thread, the session sweepers and the dispatch loop
//! around one bounded event queue.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Capture   │───▶│  Classifier  │───▶│    Queue     │───▶│  Dispatcher  │──▶ consumer
//! │ (OS thread) │    │ (TCP / UDP)  │    │  (bounded)   │    │ (async task) │
//! └─────────────┘    └──────────────┘    └──────────────┘    └──────────────┘
//!                                               ▲
//!                    ┌──────────────┐           │
//!                    │   Sweepers   │───────────┘
//!                    │ (async tasks)│  EXPIRED events
//!                    └──────────────┘
//! ```

pub mod capture;
pub mod classifier;
pub mod dispatch;
pub mod pipeline;

pub use capture::{CaptureStats, CaptureThread, EngineStats};
pub use classifier::Classifier;
pub use dispatch::{DispatchConfig, DispatchStats, Dispatcher};
pub use pipeline::{bounded, EventReceiver, EventSender, QueueDiscipline};

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

use crate::capture::PacketSource;
use crate::config::Config;
use crate::consumer::EventConsumer;
use crate::filter::FlowFilter;
use crate::flow::{Sweeper, TcpSessionTable, UdpSessionTable};

/// Totals reported when the engine stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineSummary {
    pub capture: CaptureStats,
    pub events_dropped: u64,
    pub sessions_expired: u64,
    pub dispatch: DispatchStats,
}

pub struct FlowEngine {
    config: Arc<Config>,
    running: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
}

impl FlowEngine {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flag cleared on shutdown; blocking sources poll it between reads
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run until the source is exhausted or Ctrl-C
    pub async fn run(
        self,
        source: Box<dyn PacketSource>,
        consumer: Arc<dyn EventConsumer>,
    ) -> anyhow::Result<EngineSummary> {
        self.run_until(source, consumer, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Interrupt received, shutting down");
        })
        .await
    }

    /// Run until the source is exhausted or `stop` completes
    ///
    /// Shutdown order: stop capture, stop the sweepers, then let the
    /// dispatcher drain whatever is still queued.
    pub async fn run_until<F>(
        self,
        source: Box<dyn PacketSource>,
        consumer: Arc<dyn EventConsumer>,
        stop: F,
    ) -> anyhow::Result<EngineSummary>
    where
        F: Future<Output = ()>,
    {
        let config = self.config.clone();
        let filter = FlowFilter::new(&config.filter).context("Invalid filter configuration")?;

        let tcp = Arc::new(TcpSessionTable::new(config.session.tcp_timeout()));
        let udp = Arc::new(UdpSessionTable::new(config.session.udp_timeouts()));

        let (events, receiver) = bounded(config.queue_size, config.dispatch.discipline);
        let queue_counters = events.shared_counters();
        let (shutdown_tx, _) = broadcast::channel(1);

        // Sweepers
        let interval = config.session.sweep_interval();
        let tcp_sweeper = Arc::new(Sweeper::new(tcp.clone(), events.clone(), interval));
        let udp_sweeper = Arc::new(Sweeper::new(udp.clone(), events.clone(), interval));
        let sweeper_handles = vec![
            tokio::spawn(tcp_sweeper.clone().run(shutdown_tx.subscribe())),
            tokio::spawn(udp_sweeper.clone().run(shutdown_tx.subscribe())),
        ];

        // Dispatcher
        let mut dispatcher = Dispatcher::new(receiver, consumer, config.dispatch.poll_delay());
        if config.plugin.pass_config {
            dispatcher = dispatcher.with_config(config.clone());
        }
        let dispatch_handle = tokio::spawn(dispatcher.run());

        // Capture
        let (done_tx, done_rx) = oneshot::channel();
        let capture = CaptureThread::spawn(
            source,
            Classifier::new(filter, tcp, udp),
            events,
            self.stats.clone(),
            self.running.clone(),
            done_tx,
        )
        .context("Failed to start capture thread")?;

        info!(queue_size = config.queue_size, "Flow engine running");

        tokio::select! {
            _ = stop => {}
            _ = done_rx => {}
        }

        capture.stop();
        let capture_result = tokio::task::spawn_blocking(move || capture.join())
            .await
            .context("Capture thread join failed")?;

        let _ = shutdown_tx.send(());
        for handle in sweeper_handles {
            if let Err(e) = handle.await {
                warn!("Sweeper task failed: {}", e);
            }
        }
        let sessions_expired = tcp_sweeper.expired_total() + udp_sweeper.expired_total();
        // the sweepers hold the last senders
        drop(tcp_sweeper);
        drop(udp_sweeper);

        let dispatch = dispatch_handle.await.context("Dispatcher task failed")?;

        let summary = EngineSummary {
            capture: self.stats.snapshot(),
            events_dropped: queue_counters.dropped(),
            sessions_expired,
            dispatch,
        };
        info!(
            packets = summary.capture.packets_seen,
            faults = summary.capture.decode_faults,
            events = summary.capture.events_emitted,
            dropped = summary.events_dropped,
            expired = summary.sessions_expired,
            dispatched = summary.dispatch.dispatched,
            "Flow engine stopped"
        );

        capture_result.context("Capture failed")?;
        Ok(summary)
    }
}
