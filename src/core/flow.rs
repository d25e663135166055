//! Flow identity and session state
//!
//! Keys, session ids and lifecycle states shared by the session tables and
//! the event pipeline.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key identifying a tracked flow
///
/// TCP keys are canonical (the smaller `(ip, port)` endpoint first) so both
/// directions of a connection land on one entry. UDP keys keep the observed
/// direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub ip_a: String,
    pub port_a: u16,
    pub ip_b: String,
    pub port_b: u16,
}

impl FlowKey {
    /// Key in the observed direction
    pub fn directional(src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> Self {
        Self {
            ip_a: src_ip.to_string(),
            port_a: src_port,
            ip_b: dst_ip.to_string(),
            port_b: dst_port,
        }
    }

    /// Key normalized so the smaller endpoint is always first
    pub fn canonical(src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> Self {
        if (src_ip, src_port) < (dst_ip, dst_port) {
            Self::directional(src_ip, src_port, dst_ip, dst_port)
        } else {
            Self::directional(dst_ip, dst_port, src_ip, src_port)
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}:{}", self.ip_a, self.port_a, self.ip_b, self.port_b)
    }
}

/// One side of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: &str, port: u16) -> Self {
        Self { ip: ip.to_string(), port }
    }

    pub fn is(&self, ip: &str, port: u16) -> bool {
        self.port == port && self.ip == ip
    }
}

/// Opaque, time-ordered session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh id; v7 UUIDs sort by creation time
    pub fn new() -> Self {
        SessionId(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Lifecycle state carried on an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    /// First packet of a flow
    New,
    /// TCP handshake answered by the peer
    Established,
    /// TCP FIN seen
    Close,
    /// TCP RST seen
    Abort,
    /// Removed by the expiration sweep
    Expired,
}

impl SessionState {
    /// CLOSE, ABORT and EXPIRED remove the session from its table
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Close | SessionState::Abort | SessionState::Expired)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::New => write!(f, "NEW"),
            SessionState::Established => write!(f, "ESTABLISHED"),
            SessionState::Close => write!(f, "CLOSE"),
            SessionState::Abort => write!(f, "ABORT"),
            SessionState::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Result of feeding one packet to a session table
///
/// `state` is `None` when no event should be emitted. A known session with
/// no state change still reports its id for UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub state: Option<SessionState>,
    pub session_id: Option<SessionId>,
}

impl Observation {
    pub const NONE: Observation = Observation { state: None, session_id: None };

    pub fn event(state: SessionState, session_id: SessionId) -> Self {
        Self { state: Some(state), session_id: Some(session_id) }
    }

    pub fn known(session_id: SessionId) -> Self {
        Self { state: None, session_id: Some(session_id) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key_symmetry() {
        let fwd = FlowKey::canonical("10.0.0.2", 40000, "10.0.0.1", 80);
        let rev = FlowKey::canonical("10.0.0.1", 80, "10.0.0.2", 40000);
        assert_eq!(fwd, rev);
        assert_eq!(fwd.ip_a, "10.0.0.1");
        assert_eq!(fwd.port_a, 80);
    }

    #[test]
    fn test_canonical_key_same_ip_orders_by_port() {
        let key = FlowKey::canonical("127.0.0.1", 9000, "127.0.0.1", 22);
        assert_eq!(key.port_a, 22);
        assert_eq!(key.port_b, 9000);
    }

    #[test]
    fn test_directional_key_keeps_order() {
        let fwd = FlowKey::directional("10.0.0.2", 5000, "10.0.0.1", 53);
        let rev = FlowKey::directional("10.0.0.1", 53, "10.0.0.2", 5000);
        assert_ne!(fwd, rev);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn test_state_display_and_terminal() {
        assert_eq!(SessionState::Established.to_string(), "ESTABLISHED");
        assert!(SessionState::Expired.is_terminal());
        assert!(!SessionState::New.is_terminal());
        assert_eq!(
            serde_json::to_string(&SessionState::Abort).unwrap(),
            "\"ABORT\""
        );
    }
}
