//! flowtap
//!
//! Passive flow classification and TCP/UDP session tracking. Decoded packets
//! are filtered, run through per-protocol session tables, and turned into
//! flow events that a single dispatch loop hands to a consumer.

pub mod capture;
pub mod config;
pub mod consumer;
pub mod core;
pub mod engine;
pub mod error;
pub mod filter;
pub mod flow;

pub use config::{Config, ValidationReport};
pub use consumer::EventConsumer;
pub use crate::core::{DecodedPacket, FlowEvent, FlowKey, SessionId, SessionState};
pub use engine::{EngineSummary, FlowEngine};
pub use error::{DecodeFault, FlowError, Result};
