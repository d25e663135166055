//! TCP session table
//!
//! Tracks connections by canonical key through NEW and ESTABLISHED and
//! reports CLOSE/ABORT on FIN/RST. Rules are evaluated in a fixed order and
//! only the first matching rule fires for a packet:
//!
//! 1. SYN without ACK opens a session (a repeated SYN is ignored)
//! 2. any packet from the peer of a NEW session establishes it
//! 3. FIN closes
//! 4. RST aborts

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::core::{Endpoint, FlowKey, IpProtocol, Observation, SessionId, SessionState, TcpFlags};

use super::expiry::{deadline, Expiring, HarvestStats, SessionStore};
use super::ExpiringTable;

/// Tracked TCP connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSession {
    pub session_id: SessionId,
    /// Endpoint that sent the opening SYN
    pub initiator: Endpoint,
    /// NEW or ESTABLISHED
    pub state: SessionState,
    pub expires_at: Instant,
}

impl Expiring for TcpSession {
    fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Lock-guarded TCP session map and expiration heap
pub struct TcpSessionTable {
    store: Mutex<SessionStore<FlowKey, TcpSession>>,
    timeout: Duration,
}

impl TcpSessionTable {
    /// Create a table; `timeout` applies uniformly to every session
    pub fn new(timeout: Duration) -> Self {
        Self {
            store: Mutex::new(SessionStore::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Apply one packet to the table
    pub fn observe(
        &self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        flags: TcpFlags,
    ) -> Observation {
        self.observe_at(src_ip, src_port, dst_ip, dst_port, flags, Instant::now())
    }

    /// [`observe`](Self::observe) with an explicit clock reading
    pub fn observe_at(
        &self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        flags: TcpFlags,
        now: Instant,
    ) -> Observation {
        let key = FlowKey::canonical(src_ip, src_port, dst_ip, dst_port);
        let mut store = self.store.lock();

        if flags.is_syn() {
            if store.contains(&key) {
                trace!(flow = %key, "duplicate SYN ignored");
                return Observation::NONE;
            }
            let session_id = SessionId::new();
            store.insert(
                key,
                TcpSession {
                    session_id,
                    initiator: Endpoint::new(src_ip, src_port),
                    state: SessionState::New,
                    expires_at: deadline(now, self.timeout),
                },
            );
            return Observation::event(SessionState::New, session_id);
        }

        let Some(session) = store.get_mut(&key) else {
            return Observation::NONE;
        };

        if session.state == SessionState::New && !session.initiator.is(src_ip, src_port) {
            session.state = SessionState::Established;
            session.expires_at = deadline(now, self.timeout);
            let (session_id, expires_at) = (session.session_id, session.expires_at);
            store.schedule(key, expires_at);
            return Observation::event(SessionState::Established, session_id);
        }

        if flags.is_fin() {
            let session_id = session.session_id;
            store.remove(&key);
            return Observation::event(SessionState::Close, session_id);
        }

        if flags.is_rst() {
            let session_id = session.session_id;
            store.remove(&key);
            return Observation::event(SessionState::Abort, session_id);
        }

        Observation::NONE
    }

    /// Snapshot of a session, looked up in either direction
    pub fn get(&self, src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> Option<TcpSession> {
        let key = FlowKey::canonical(src_ip, src_port, dst_ip, dst_port);
        self.store.lock().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }
}

impl ExpiringTable for TcpSessionTable {
    fn protocol(&self) -> IpProtocol {
        IpProtocol::Tcp
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::MAX_TIMEOUT;

    const CLIENT: &str = "192.168.1.100";
    const SERVER: &str = "10.0.0.1";

    fn flags(bits: u8) -> TcpFlags {
        TcpFlags::from_u8(bits)
    }

    fn table() -> TcpSessionTable {
        TcpSessionTable::new(Duration::from_secs(60))
    }

    #[test]
    fn test_syn_creates_new_session() {
        let table = table();
        let obs = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN));

        assert_eq!(obs.state, Some(SessionState::New));
        assert!(obs.session_id.is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_huge_timeout_is_capped() {
        let table = TcpSessionTable::new(Duration::from_secs(u64::MAX));
        let now = Instant::now();
        let obs = table.observe_at(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN), now);
        assert_eq!(obs.state, Some(SessionState::New));

        let ack = table.observe_at(SERVER, 80, CLIENT, 54321, flags(TcpFlags::SYN | TcpFlags::ACK), now);
        assert_eq!(ack.state, Some(SessionState::Established));

        let session = table.get(CLIENT, 54321, SERVER, 80).unwrap();
        assert_eq!(session.expires_at, now + MAX_TIMEOUT);
    }

    #[test]
    fn test_duplicate_syn_suppressed() {
        let table = table();
        let first = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN));
        let again = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN));

        assert_eq!(again, Observation::NONE);
        let session = table.get(CLIENT, 54321, SERVER, 80).unwrap();
        assert_eq!(Some(session.session_id), first.session_id);
        assert_eq!(session.state, SessionState::New);
    }

    #[test]
    fn test_canonical_symmetry() {
        let table = table();
        let syn = table.observe(SERVER, 80, CLIENT, 54321, flags(TcpFlags::SYN));
        // peer answers with source/destination swapped
        let ack = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::ACK));

        assert_eq!(ack.state, Some(SessionState::Established));
        assert_eq!(ack.session_id, syn.session_id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_lifecycle() {
        let table = table();
        let new = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN));
        let est = table.observe(SERVER, 80, CLIENT, 54321, flags(TcpFlags::SYN | TcpFlags::ACK));
        let data = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::ACK));
        let close = table.observe(SERVER, 80, CLIENT, 54321, flags(TcpFlags::FIN | TcpFlags::ACK));

        assert_eq!(new.state, Some(SessionState::New));
        assert_eq!(est.state, Some(SessionState::Established));
        assert_eq!(data, Observation::NONE);
        assert_eq!(close.state, Some(SessionState::Close));
        assert_eq!(new.session_id, est.session_id);
        assert_eq!(est.session_id, close.session_id);
        assert!(table.get(CLIENT, 54321, SERVER, 80).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_initiator_ack_does_not_establish() {
        let table = table();
        table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN));
        let obs = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::ACK));

        assert_eq!(obs, Observation::NONE);
        assert_eq!(table.get(CLIENT, 54321, SERVER, 80).unwrap().state, SessionState::New);
    }

    #[test]
    fn test_rst_aborts_from_any_state() {
        let table = table();
        let new = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN));
        let abort = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::RST));
        assert_eq!(abort, Observation::event(SessionState::Abort, new.session_id.unwrap()));
        assert!(table.is_empty());

        table.observe(CLIENT, 40000, SERVER, 443, flags(TcpFlags::SYN));
        table.observe(SERVER, 443, CLIENT, 40000, flags(TcpFlags::SYN | TcpFlags::ACK));
        let abort = table.observe(SERVER, 443, CLIENT, 40000, flags(TcpFlags::RST));
        assert_eq!(abort.state, Some(SessionState::Abort));
        assert!(table.is_empty());
    }

    #[test]
    fn test_peer_fin_in_new_state_establishes_first() {
        // rule 2 outranks rule 3: a FIN from the peer of a NEW session establishes it
        let table = table();
        table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN));
        let obs = table.observe(SERVER, 80, CLIENT, 54321, flags(TcpFlags::FIN));

        assert_eq!(obs.state, Some(SessionState::Established));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_syn_with_fin_opens_session() {
        // rule 1 outranks rule 3
        let table = table();
        let obs = table.observe(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN | TcpFlags::FIN));
        assert_eq!(obs.state, Some(SessionState::New));
    }

    #[test]
    fn test_untracked_packets_are_ignored() {
        let table = table();
        assert_eq!(table.observe(CLIENT, 1, SERVER, 2, flags(TcpFlags::FIN)), Observation::NONE);
        assert_eq!(table.observe(CLIENT, 1, SERVER, 2, flags(TcpFlags::RST)), Observation::NONE);
        assert_eq!(table.observe(CLIENT, 1, SERVER, 2, flags(TcpFlags::ACK)), Observation::NONE);
        assert!(table.is_empty());
    }

    #[test]
    fn test_expiry_after_timeout() {
        let table = table();
        let t0 = Instant::now();
        let new = table.observe_at(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN), t0);

        let (expired, _) = table.harvest(t0 + Duration::from_secs(59));
        assert!(expired.is_empty());

        let (expired, _) = table.harvest(t0 + Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(Some(expired[0].1), new.session_id);
        assert!(table.is_empty());
    }

    #[test]
    fn test_established_refresh_defers_expiry() {
        let table = table();
        let t0 = Instant::now();
        table.observe_at(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN), t0);
        table.observe_at(
            SERVER, 80, CLIENT, 54321,
            flags(TcpFlags::SYN | TcpFlags::ACK),
            t0 + Duration::from_secs(30),
        );

        // the SYN-time heap entry is stale now
        let (expired, stats) = table.harvest(t0 + Duration::from_secs(60));
        assert!(expired.is_empty());
        assert_eq!(stats.stale, 1);
        assert_eq!(table.len(), 1);

        let (expired, _) = table.harvest(t0 + Duration::from_secs(90));
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn test_closed_session_never_expires() {
        let table = table();
        let t0 = Instant::now();
        table.observe_at(CLIENT, 54321, SERVER, 80, flags(TcpFlags::SYN), t0);
        table.observe_at(CLIENT, 54321, SERVER, 80, flags(TcpFlags::FIN), t0);

        let (expired, stats) = table.harvest(t0 + Duration::from_secs(600));
        assert!(expired.is_empty());
        assert_eq!(stats.stale, 1);
    }
}
