use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// Tunables for one [`Connection`](crate::connection::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Silence longer than this drops the connection.
    pub timeout: Duration,
    /// Silence longer than this (but below `timeout`) reports lagging.
    pub lag_threshold: Duration,
    /// Upper bound on an outgoing datagram, header included.
    pub max_datagram_size: usize,
    /// Queued plus unacknowledged messages allowed before overflow.
    pub max_queued_messages: usize,
    /// Malformed datagrams in a row before the peer is dropped.
    pub max_consecutive_malformed: u32,
    /// A header-only datagram goes out when nothing was sent for this long.
    pub heartbeat_interval: Duration,
    /// Floor for the reliable resend interval; the RTT raises it.
    pub min_resend_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            lag_threshold: Duration::from_secs(1),
            max_datagram_size: 1200,
            max_queued_messages: 4096,
            max_consecutive_malformed: 5,
            heartbeat_interval: Duration::from_millis(250),
            min_resend_interval: Duration::from_millis(50),
        }
    }
}

impl ConnectionConfig {
    /// Wait before the unacknowledged reliable window is sent again.
    pub fn resend_interval(&self, rtt: Duration) -> Duration {
        self.min_resend_interval.max(rtt + rtt / 2)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub group: SocketAddrV4,
    pub advertise_interval: Duration,
    /// Entries not refreshed within this are evicted.
    pub discovery_timeout: Duration,
}

pub const DEFAULT_DISCOVERY_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 42, 99), 27961);

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_DISCOVERY_GROUP,
            advertise_interval: Duration::from_secs(1),
            discovery_timeout: Duration::from_secs(5),
        }
    }
}
