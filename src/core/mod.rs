//! Core shared types for flow tracking
//!
//! - `DecodedPacket`: the record supplied by the capture layer
//! - `FlowKey`, `SessionId`, `SessionState`: session identity and lifecycle
//! - `FlowEvent`: the unit carried through the event pipeline

pub mod packet;
pub mod flow;
pub mod event;

pub use packet::{DecodedPacket, IpLayer, IpProtocol, TcpFlags, Transport};
pub use flow::{Endpoint, FlowKey, Observation, SessionId, SessionState};
pub use event::{now_micros, EventPayload, FlowEvent};
