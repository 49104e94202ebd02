use arena_shared::{ConnectionConfig, DiscoveryConfig, PROTOCOL_REVISION};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Advertised name, also shown in logs.
    pub name: String,
    pub max_players: usize,
    /// Simulation steps per second.
    pub tick_rate: u16,
    /// Every this many ticks all entities are sent, changed or not.
    pub refresh_interval_ticks: u32,
    /// Handshakes in progress at once; further unknown senders are ignored.
    pub max_pending_handshakes: usize,
    /// Revision clients must match to be admitted.
    pub protocol_revision: u8,
    pub connection: ConnectionConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Arena".to_string(),
            max_players: 16,
            tick_rate: 30,
            refresh_interval_ticks: 30,
            max_pending_handshakes: 64,
            protocol_revision: PROTOCOL_REVISION,
            connection: ConnectionConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Fixed simulation step in seconds.
    pub fn tick_seconds(&self) -> f32 {
        1.0 / f32::from(self.tick_rate.max(1))
    }
}
