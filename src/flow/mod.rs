//! Session tracking engine
//!
//! TCP and UDP session tables sharing one expiration mechanism, plus the
//! periodic sweeper that turns expired sessions into EXPIRED events.
//!
//! # Example
//!
//! ```ignore
//! use flowtap::flow::{TcpSessionTable, SessionConfig};
//!
//! let config = SessionConfig::default();
//! let tcp = TcpSessionTable::new(config.tcp_timeout());
//!
//! let obs = tcp.observe("10.0.0.2", 40000, "10.0.0.1", 80, TcpFlags::from_u8(0x02));
//! assert_eq!(obs.state, Some(SessionState::New));
//! ```

pub mod expiry;
pub mod sweeper;
pub mod tcp;
pub mod udp;

pub use expiry::{deadline, ExpirationEntry, Expiring, HarvestStats, SessionStore, MAX_TIMEOUT};
pub use sweeper::Sweeper;
pub use tcp::{TcpSession, TcpSessionTable};
pub use udp::{UdpSession, UdpSessionTable, UdpTimeouts};

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::{FlowKey, IpProtocol, SessionId};

/// Configuration for session tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// TCP session timeout (seconds)
    pub tcp_timeout_secs: u64,

    /// UDP idle timeout (seconds)
    pub udp_timeout_secs: u64,

    /// UDP timeout for flows towards the DNS port (seconds)
    pub udp_dns_timeout_secs: u64,

    /// Destination port that selects the DNS timeout
    pub dns_port: u16,

    /// Expiration sweep interval (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_secs: 60,
            udp_timeout_secs: 120,
            udp_dns_timeout_secs: 30,
            dns_port: 53,
            sweep_interval_secs: 1,
        }
    }
}

impl SessionConfig {
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }

    pub fn udp_timeouts(&self) -> UdpTimeouts {
        UdpTimeouts::from(self)
    }

    /// Sweep interval, between 100ms and [`MAX_TIMEOUT`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs).clamp(Duration::from_millis(100), MAX_TIMEOUT)
    }
}

/// A session table the sweeper can harvest
pub trait ExpiringTable: Send + Sync + 'static {
    /// Protocol stamped on the EXPIRED events of this table
    fn protocol(&self) -> IpProtocol;

    /// Remove every session whose current deadline is at or before `now`
    fn harvest(&self, now: Instant) -> (Vec<(FlowKey, SessionId)>, HarvestStats);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.tcp_timeout(), Duration::from_secs(60));
        assert_eq!(config.udp_timeouts().for_port(53), Duration::from_secs(30));
        assert_eq!(config.udp_timeouts().for_port(123), Duration::from_secs(120));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
