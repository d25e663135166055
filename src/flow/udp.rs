//! UDP session table
//!
//! Directional: each `(src, sport, dst, dport)` tuple is its own session.
//! Sessions are only ever removed by expiration.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::{FlowKey, IpProtocol, Observation, SessionId, SessionState};

use super::expiry::{deadline, Expiring, HarvestStats, SessionStore};
use super::{ExpiringTable, SessionConfig};

/// Idle timeouts for UDP flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpTimeouts {
    /// Timeout for flows towards the DNS port
    pub dns: Duration,
    /// Timeout for everything else
    pub idle: Duration,
    /// Destination port that selects the DNS timeout
    pub dns_port: u16,
}

impl UdpTimeouts {
    /// Timeout class for a destination port
    pub fn for_port(&self, dst_port: u16) -> Duration {
        if dst_port == self.dns_port {
            self.dns
        } else {
            self.idle
        }
    }
}

impl Default for UdpTimeouts {
    fn default() -> Self {
        Self {
            dns: Duration::from_secs(30),
            idle: Duration::from_secs(120),
            dns_port: 53,
        }
    }
}

impl From<&SessionConfig> for UdpTimeouts {
    fn from(config: &SessionConfig) -> Self {
        Self {
            dns: Duration::from_secs(config.udp_dns_timeout_secs),
            idle: Duration::from_secs(config.udp_timeout_secs),
            dns_port: config.dns_port,
        }
    }
}

/// Tracked UDP flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSession {
    pub session_id: SessionId,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub packet_count: u64,
    pub expires_at: Instant,
}

impl Expiring for UdpSession {
    fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Lock-guarded UDP session map and expiration heap
pub struct UdpSessionTable {
    store: Mutex<SessionStore<FlowKey, UdpSession>>,
    timeouts: UdpTimeouts,
}

impl UdpSessionTable {
    pub fn new(timeouts: UdpTimeouts) -> Self {
        Self {
            store: Mutex::new(SessionStore::new()),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> UdpTimeouts {
        self.timeouts
    }

    /// Apply one datagram to the table
    ///
    /// The first datagram of a tuple reports NEW; later ones report no state
    /// but still carry the session id.
    pub fn observe(&self, src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> Observation {
        self.observe_at(src_ip, src_port, dst_ip, dst_port, Instant::now())
    }

    /// [`observe`](Self::observe) with an explicit clock reading
    pub fn observe_at(
        &self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        now: Instant,
    ) -> Observation {
        let key = FlowKey::directional(src_ip, src_port, dst_ip, dst_port);
        let expires_at = deadline(now, self.timeouts.for_port(dst_port));
        let mut store = self.store.lock();

        if let Some(session) = store.get_mut(&key) {
            session.last_seen = now;
            session.packet_count += 1;
            session.expires_at = expires_at;
            let session_id = session.session_id;
            store.schedule(key, expires_at);
            return Observation::known(session_id);
        }

        let session_id = SessionId::new();
        store.insert(
            key,
            UdpSession {
                session_id,
                first_seen: now,
                last_seen: now,
                packet_count: 1,
                expires_at,
            },
        );
        Observation::event(SessionState::New, session_id)
    }

    /// Snapshot of a session in the observed direction
    pub fn get(&self, src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> Option<UdpSession> {
        let key = FlowKey::directional(src_ip, src_port, dst_ip, dst_port);
        self.store.lock().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }
}

impl Default for UdpSessionTable {
    fn default() -> Self {
        Self::new(UdpTimeouts::default())
    }
}

impl ExpiringTable for UdpSessionTable {
    fn protocol(&self) -> IpProtocol {
        IpProtocol::Udp
    }

    fn harvest(&self, now: Instant) -> (Vec<(FlowKey, SessionId)>, HarvestStats) {
        let (expired, stats) = self.store.lock().harvest(now);
        let expired = expired
            .into_iter()
            .map(|(key, session)| (key, session.session_id))
            .collect();
        (expired, stats)
    }
}
