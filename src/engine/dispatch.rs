//! Dispatch loop
//!
//! The single consumer of the event queue. Forwards events, in queue order,
//! to the configured [`EventConsumer`]. A failing consumer is logged and the
//! loop moves on to the next event.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::consumer::EventConsumer;
use crate::core::FlowEvent;

use super::pipeline::{EventReceiver, QueueDiscipline};

/// Dispatch section of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Sleep between polls of an empty queue (milliseconds)
    pub poll_delay_ms: u64,
    /// Wait on the queue directly instead of polling
    pub bypass_poll_delay: bool,
    /// Producer behaviour when the queue is full
    pub discipline: QueueDiscipline,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_delay_ms: 10,
            bypass_poll_delay: false,
            discipline: QueueDiscipline::Block,
        }
    }
}

impl DispatchConfig {
    /// `None` when polling is bypassed
    pub fn poll_delay(&self) -> Option<Duration> {
        if self.bypass_poll_delay || self.poll_delay_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.poll_delay_ms))
        }
    }
}

/// Dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Events handed to the consumer
    pub dispatched: u64,
    /// Events the consumer reported an error for
    pub failed: u64,
}

pub struct Dispatcher {
    receiver: EventReceiver,
    consumer: Arc<dyn EventConsumer>,
    config: Option<Arc<Config>>,
    poll_delay: Option<Duration>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        receiver: EventReceiver,
        consumer: Arc<dyn EventConsumer>,
        poll_delay: Option<Duration>,
    ) -> Self {
        Self {
            receiver,
            consumer,
            config: None,
            poll_delay,
            stats: DispatchStats::default(),
        }
    }

    /// Hand this configuration snapshot to the consumer with every event
    pub fn with_config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Drain the queue until every producer is gone, then close the consumer
    pub async fn run(mut self) -> DispatchStats {
        info!(
            consumer = self.consumer.name(),
            poll_delay = ?self.poll_delay,
            "dispatcher started"
        );

        loop {
            let event = match self.poll_delay {
                None => match self.receiver.recv().await {
                    Some(event) => event,
                    None => break,
                },
                Some(delay) => match self.receiver.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => break,
                },
            };
            self.deliver(event).await;
        }

        if let Err(e) = self.consumer.close().await {
            warn!(consumer = self.consumer.name(), "failed to close consumer: {:#}", e);
        }

        info!(
            dispatched = self.stats.dispatched,
            failed = self.stats.failed,
            "dispatcher stopped"
        );
        self.stats
    }

    async fn deliver(&mut self, event: FlowEvent) {
        self.stats.dispatched += 1;
        if let Err(e) = self.consumer.handle(&event, self.config.as_deref()).await {
            self.stats.failed += 1;
            warn!(consumer = self.consumer.name(), "consumer failed: {:#}", e);
            debug!(event = %event, "failed event");
        }
    }
}
