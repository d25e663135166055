//! Flow events
//!
//! The unit that crosses the event pipeline from producers to the consumer.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::flow::{FlowKey, SessionId, SessionState};
use super::packet::IpProtocol;

/// Optional payload annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Queried domain of a DNS request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
}

/// A flow event, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol_num: u8,
    pub protocol_name: String,
    /// `None` for stateless ICMP events
    pub state: Option<SessionState>,
    #[serde(with = "micros")]
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<SessionId>,
    pub payload: Option<EventPayload>,
}

impl FlowEvent {
    /// Event for a TCP or UDP session transition
    pub fn session(
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        protocol_num: u8,
        protocol: IpProtocol,
        state: SessionState,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            src_ip: src_ip.to_string(),
            dst_ip: dst_ip.to_string(),
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            protocol_num,
            protocol_name: protocol.name().to_string(),
            state: Some(state),
            timestamp: now_micros(),
            session_id,
            payload: None,
        }
    }

    /// Stateless ICMP event
    pub fn icmp(src_ip: &str, dst_ip: &str, protocol_num: u8) -> Self {
        Self {
            src_ip: src_ip.to_string(),
            dst_ip: dst_ip.to_string(),
            src_port: None,
            dst_port: None,
            protocol_num,
            protocol_name: IpProtocol::Icmp.name().to_string(),
            state: None,
            timestamp: now_micros(),
            session_id: None,
            payload: None,
        }
    }

    /// EXPIRED event synthesized by the sweeper from a table key
    pub fn expired(key: &FlowKey, protocol: IpProtocol, session_id: SessionId) -> Self {
        Self::session(
            &key.ip_a,
            key.port_a,
            &key.ip_b,
            key.port_b,
            protocol.number(),
            protocol,
            SessionState::Expired,
            Some(session_id),
        )
    }

    /// Attach a DNS query annotation
    pub fn with_dns(mut self, domain: impl Into<String>) -> Self {
        self.payload = Some(EventPayload { dns: Some(domain.into()) });
        self
    }

    pub fn dns_query(&self) -> Option<&str> {
        self.payload.as_ref().and_then(|p| p.dns.as_deref())
    }

    pub fn is_icmp(&self) -> bool {
        self.protocol_name.eq_ignore_ascii_case("icmp")
    }

    /// Timestamp in wire format
    pub fn timestamp_str(&self) -> String {
        self.timestamp.format(micros::FORMAT).to_string()
    }
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.timestamp_str())?;
        match (self.src_port, self.dst_port) {
            (Some(sp), Some(dp)) => write!(f, "{}:{} -> {}:{}", self.src_ip, sp, self.dst_ip, dp)?,
            _ => write!(f, "{} -> {}", self.src_ip, self.dst_ip)?,
        }
        write!(f, " {} ({})", self.protocol_name, self.protocol_num)?;
        if let Some(state) = self.state {
            write!(f, " {}", state)?;
        }
        if let Some(id) = self.session_id {
            write!(f, " session={}", id)?;
        }
        if let Some(dns) = self.dns_query() {
            write!(f, " dns={}", dns)?;
        }
        Ok(())
    }
}

/// Current UTC time at microsecond precision
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Timestamps travel as `YYYY-MM-DDTHH:MM:SS.ffffff` (UTC, no offset suffix)
mod micros {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_event_uses_key_and_protocol() {
        let key = FlowKey::canonical("10.0.0.9", 41000, "10.0.0.1", 443);
        let id = SessionId::new();
        let event = FlowEvent::expired(&key, IpProtocol::Tcp, id);

        assert_eq!(event.src_ip, "10.0.0.1");
        assert_eq!(event.src_port, Some(443));
        assert_eq!(event.protocol_num, 6);
        assert_eq!(event.protocol_name, "TCP");
        assert_eq!(event.state, Some(SessionState::Expired));
        assert_eq!(event.session_id, Some(id));
    }

    #[test]
    fn test_icmp_event_has_no_ports_or_state() {
        let event = FlowEvent::icmp("10.0.0.1", "8.8.8.8", 1);
        assert!(event.is_icmp());
        assert_eq!(event.src_port, None);
        assert_eq!(event.state, None);
        assert_eq!(event.session_id, None);
    }

    #[test]
    fn test_json_shape() {
        let event = FlowEvent::session(
            "10.0.0.2", 5353, "10.0.0.1", 53, 17, IpProtocol::Udp, SessionState::New, None,
        )
        .with_dns("example.com");

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["state"], "NEW");
        assert_eq!(value["protocol_name"], "UDP");
        assert_eq!(value["payload"]["dns"], "example.com");

        // microsecond precision, no offset suffix
        let ts = value["timestamp"].as_str().unwrap();
        assert_eq!(ts.len(), "2025-01-01T00:00:00.000000".len());

        let back: FlowEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_display_line() {
        let event = FlowEvent::icmp("10.0.0.1", "10.0.0.2", 1);
        let line = event.to_string();
        assert!(line.contains("10.0.0.1 -> 10.0.0.2 ICMP (1)"));
    }
}
