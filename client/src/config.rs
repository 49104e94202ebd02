use arena_shared::{ConnectionConfig, DiscoveryConfig, PROTOCOL_REVISION};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name sent with the connect request.
    pub name: String,
    pub protocol_revision: u8,
    pub connection: ConnectionConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "Player".to_string(),
            protocol_revision: PROTOCOL_REVISION,
            connection: ConnectionConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}
