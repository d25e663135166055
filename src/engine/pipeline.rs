//! Event pipeline
//!
//! A bounded multi-producer, single-consumer queue between the capture thread
//! (a plain OS thread that blocks when the queue is full) and the async
//! dispatch loop. The sweepers are async producers on the same queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::warn;

use crate::core::FlowEvent;
use crate::error::{FlowError, Result};

/// Default queue capacity
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// What a producer does when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDiscipline {
    /// Wait for room; capture stalls instead of losing events
    #[default]
    Block,
    /// Drop the event and count it
    Drop,
}

/// Queue counters shared by every handle
#[derive(Debug, Default)]
pub struct QueueCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    dequeued: AtomicU64,
}

impl QueueCounters {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }
}

/// Create a bounded event queue
pub fn bounded(capacity: usize, discipline: QueueDiscipline) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(QueueCounters::default());

    (
        EventSender {
            tx,
            discipline,
            counters: counters.clone(),
        },
        EventReceiver { rx, counters },
    )
}

/// Producer handle; clone one per producer
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<FlowEvent>,
    discipline: QueueDiscipline,
    counters: Arc<QueueCounters>,
}

impl EventSender {
    /// Enqueue from a synchronous thread
    ///
    /// Must not be called from inside the async runtime when the discipline
    /// is [`QueueDiscipline::Block`].
    pub fn send_blocking(&self, event: FlowEvent) -> Result<()> {
        match self.discipline {
            QueueDiscipline::Block => {
                self.tx
                    .blocking_send(event)
                    .map_err(|_| FlowError::PipelineClosed)?;
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            QueueDiscipline::Drop => self.try_enqueue(event),
        }
    }

    /// Enqueue from an async task
    pub async fn send(&self, event: FlowEvent) -> Result<()> {
        match self.discipline {
            QueueDiscipline::Block => {
                self.tx
                    .send(event)
                    .await
                    .map_err(|_| FlowError::PipelineClosed)?;
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            QueueDiscipline::Drop => self.try_enqueue(event),
        }
    }

    fn try_enqueue(&self, event: FlowEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(
                        dropped,
                        session = ?event.session_id,
                        "event queue full, dropping events"
                    );
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(FlowError::PipelineClosed),
        }
    }

    pub fn discipline(&self) -> QueueDiscipline {
        self.discipline
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }

    /// Counters handle that does not keep the queue open
    pub fn shared_counters(&self) -> Arc<QueueCounters> {
        self.counters.clone()
    }

    /// Whether the consumer side is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer handle
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<FlowEvent>,
    counters: Arc<QueueCounters>,
}

impl EventReceiver {
    /// Wait for the next event; `None` once every sender is gone and the
    /// queue is drained
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    /// Take an event if one is ready
    pub fn try_recv(&mut self) -> std::result::Result<FlowEvent, TryRecvError> {
        let event = self.rx.try_recv();
        if event.is_ok() {
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }
}
