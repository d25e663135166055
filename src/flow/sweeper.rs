//! Expiration sweeper
//!
//! One sweeper runs per session table. Each tick harvests the table under its
//! lock, releases the lock, then publishes one EXPIRED event per removed
//! session. A second, coarse async mutex keeps two sweeps of the same table
//! from interleaving their publishing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::FlowEvent;
use crate::engine::pipeline::EventSender;
use crate::error::Result;

use super::ExpiringTable;

pub struct Sweeper<T: ExpiringTable> {
    table: Arc<T>,
    events: EventSender,
    interval: Duration,
    guard: Mutex<()>,
    expired_total: AtomicU64,
}

impl<T: ExpiringTable> Sweeper<T> {
    pub fn new(table: Arc<T>, events: EventSender, interval: Duration) -> Self {
        Self {
            table,
            events,
            interval,
            guard: Mutex::new(()),
            expired_total: AtomicU64::new(0),
        }
    }

    pub fn table(&self) -> &Arc<T> {
        &self.table
    }

    /// Sessions expired over the sweeper's lifetime
    pub fn expired_total(&self) -> u64 {
        self.expired_total.load(Ordering::Relaxed)
    }

    /// Sweep once against the current time
    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(Instant::now()).await
    }

    /// Sweep once; returns the number of EXPIRED events published
    pub async fn sweep_at(&self, now: Instant) -> Result<usize> {
        let _guard = self.guard.lock().await;

        let (expired, stats) = self.table.harvest(now);
        if stats.stale > 0 {
            debug!(
                protocol = %self.table.protocol(),
                stale = stats.stale,
                "discarded stale expiration entries"
            );
        }

        let protocol = self.table.protocol();
        let count = expired.len();
        // harvested sessions are gone from the table even if publishing fails
        self.expired_total.fetch_add(count as u64, Ordering::Relaxed);
        for (key, session_id) in expired {
            debug!(protocol = %protocol, flow = %key, session = %session_id, "session expired");
            self.events
                .send(FlowEvent::expired(&key, protocol, session_id))
                .await?;
        }
        Ok(count)
    }

    /// Sweep on every tick until shutdown or until the queue closes
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let protocol = self.table.protocol();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(protocol = %protocol, interval = ?self.interval, "sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(protocol = %protocol, "sweeper stopping: {}", e);
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        info!(
            protocol = %protocol,
            expired = self.expired_total(),
            "sweeper stopped"
        );
    }
}
