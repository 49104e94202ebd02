//! LAN server discovery over multicast.
//!
//! Servers periodically send a fixed 39-byte advertisement:
//!
//! ```text
//! [app_identifier u32 BE][protocol_revision u8][port u16 BE][name: 32 bytes UTF-8, zero padded]
//! ```
//!
//! Listeners keep a [`ServerList`] keyed by `(endpoint, name)`. Nothing here
//! is reliable; a lost advertisement is repaired by the next one.

use crate::codec::{put_u16_be, put_u32_be, put_u8, truncate_utf8, WireReader};
use crate::config::DiscoveryConfig;
use crate::transport::Transport;
use crate::{APP_IDENTIFIER, MAX_NAME_LEN, PROTOCOL_REVISION};
use log::{debug, info, trace};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

pub const ADVERTISEMENT_LEN: usize = 4 + 1 + 2 + MAX_NAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Game port on the advertising host.
    pub port: u16,
    pub name: String,
}

impl Advertisement {
    /// Names longer than the fixed field are cut at a character boundary.
    pub fn new(port: u16, name: &str) -> Self {
        Self {
            port,
            name: truncate_utf8(name, MAX_NAME_LEN).to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ADVERTISEMENT_LEN);
        put_u32_be(&mut out, APP_IDENTIFIER);
        put_u8(&mut out, PROTOCOL_REVISION);
        put_u16_be(&mut out, self.port);
        let name = truncate_utf8(&self.name, MAX_NAME_LEN).as_bytes();
        out.extend_from_slice(name);
        out.resize(ADVERTISEMENT_LEN, 0);
        out
    }

    /// `None` for anything that is not one of our advertisements: wrong
    /// length, another application's identifier, another protocol revision,
    /// or a name that is not UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ADVERTISEMENT_LEN {
            return None;
        }
        let mut reader = WireReader::new(bytes);
        if reader.read_u32_be("app identifier").ok()? != APP_IDENTIFIER {
            return None;
        }
        if reader.read_u8("protocol revision").ok()? != PROTOCOL_REVISION {
            return None;
        }
        let port = reader.read_u16_be("port").ok()?;
        let field = reader.read_bytes(MAX_NAME_LEN, "server name").ok()?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let name = std::str::from_utf8(&field[..end]).ok()?;
        Some(Self {
            port,
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub endpoint: SocketAddr,
    pub name: String,
    pub last_seen: Instant,
}

/// Servers heard recently, keyed by `(endpoint, name)`.
#[derive(Debug)]
pub struct ServerList {
    timeout: Duration,
    entries: HashMap<(SocketAddr, String), Instant>,
}

impl ServerList {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
        }
    }

    /// Adds a server or refreshes its last-seen time. Returns `true` when the
    /// entry is new.
    pub fn record(&mut self, endpoint: SocketAddr, name: &str, now: Instant) -> bool {
        self.entries
            .insert((endpoint, name.to_string()), now)
            .is_none()
    }

    /// Removes entries not refreshed within the timeout. Returns how many.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let timeout = self.timeout;
        self.entries
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) <= timeout);
        before - self.entries.len()
    }

    /// Current entries ordered by name, then endpoint.
    pub fn servers(&self) -> Vec<DiscoveredServer> {
        let mut servers: Vec<DiscoveredServer> = self
            .entries
            .iter()
            .map(|((endpoint, name), last_seen)| DiscoveredServer {
                endpoint: *endpoint,
                name: name.clone(),
                last_seen: *last_seen,
            })
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name).then(a.endpoint.cmp(&b.endpoint)));
        servers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sends the advertisement to the group on a fixed interval.
pub struct DiscoveryBroadcaster<T: Transport> {
    transport: T,
    group: SocketAddr,
    interval: Duration,
    payload: Vec<u8>,
    last_sent: Option<Instant>,
}

impl DiscoveryBroadcaster<UdpSocket> {
    pub async fn bind(config: &DiscoveryConfig, advertisement: &Advertisement) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(true)?;
        info!(
            "Advertising \"{}\" on port {} to {}",
            advertisement.name, advertisement.port, config.group
        );
        Ok(Self::new(socket, config, advertisement))
    }
}

impl<T: Transport> DiscoveryBroadcaster<T> {
    pub fn new(transport: T, config: &DiscoveryConfig, advertisement: &Advertisement) -> Self {
        Self {
            transport,
            group: SocketAddr::V4(config.group),
            interval: config.advertise_interval,
            payload: advertisement.encode(),
            last_sent: None,
        }
    }

    /// Sends the advertisement if the interval has elapsed. Returns whether
    /// one went out.
    pub fn poll(&mut self, now: Instant) -> io::Result<bool> {
        let due = match self.last_sent {
            Some(at) => now.saturating_duration_since(at) >= self.interval,
            None => true,
        };
        if !due {
            return Ok(false);
        }
        self.last_sent = Some(now);
        match self.transport.send_datagram(&self.payload, self.group) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("advertisement skipped, socket busy");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Collects advertisements into a [`ServerList`].
pub struct DiscoveryListener<T: Transport> {
    transport: T,
    servers: ServerList,
}

impl DiscoveryListener<UdpSocket> {
    pub async fn bind(config: &DiscoveryConfig) -> io::Result<Self> {
        let socket =
            UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.group.port())).await?;
        socket.join_multicast_v4(*config.group.ip(), Ipv4Addr::UNSPECIFIED)?;
        info!("Listening for servers on {}", config.group);
        Ok(Self::new(socket, config))
    }
}

impl<T: Transport> DiscoveryListener<T> {
    pub fn new(transport: T, config: &DiscoveryConfig) -> Self {
        Self {
            transport,
            servers: ServerList::new(config.discovery_timeout),
        }
    }

    /// Drains waiting advertisements, then evicts expired entries. Returns
    /// the number of advertisements accepted.
    pub fn poll(&mut self, now: Instant) -> io::Result<usize> {
        let mut buf = [0u8; 512];
        let mut accepted = 0;
        while let Some((len, from)) = self.transport.recv_datagram(&mut buf)? {
            let Some(advertisement) = Advertisement::decode(&buf[..len]) else {
                trace!("ignoring {} byte datagram from {}", len, from);
                continue;
            };
            let endpoint = SocketAddr::new(from.ip(), advertisement.port);
            if self.servers.record(endpoint, &advertisement.name, now) {
                debug!("found server \"{}\" at {}", advertisement.name, endpoint);
            }
            accepted += 1;
        }
        self.servers.evict_expired(now);
        Ok(accepted)
    }

    pub fn servers(&self) -> &ServerList {
        &self.servers
    }
}
