//! Client session: connects, applies the join snapshot, then streams input
//! while mirroring the world.
//!
//! ```text
//! Connecting --ConnectAccept--> Syncing --own PlayerJoin--> Synced
//!      |                           |                          |
//!      +------- ConnectReject, ServerQuit, connection error --+--> Faulted
//!                                                disconnect() --> Disconnected
//! ```
//!
//! The server sends the snapshot reliably and in order and ends it with the
//! client's own `PlayerJoin`, so observing that message means every earlier
//! snapshot message has been applied.

use crate::config::ClientConfig;
use crate::game::ClientWorld;
use crate::input::InputManager;
use arena_shared::codec::truncate_utf8;
use arena_shared::message::{Chat, ClientConnect};
use arena_shared::{
    Connection, ConnectionError, ConnectionStats, Message, MessageHandler, PlayerId, RejectReason,
    Transport, UnsupportedMessage, MAX_CHAT_LEN, MAX_NAME_LEN,
};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a session ended without the client asking it to
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFault {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("rejected by server: {0:?}")]
    Rejected(RejectReason),
    #[error("server shut down")]
    ServerEnded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Connect request sent, waiting for accept or reject
    Connecting,
    /// Accepted, applying the join snapshot
    Syncing,
    /// Snapshot applied; input flows and the mirror tracks the server
    Synced,
    /// Left voluntarily
    Disconnected,
    Faulted(SessionFault),
}

impl SyncState {
    /// True while the session can still make progress.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Connecting | SyncState::Syncing | SyncState::Synced)
    }
}

/// Applies server messages to the session state and the mirror.
struct SyncHandler<'a> {
    state: &'a mut SyncState,
    player: &'a mut Option<PlayerId>,
    tick_rate: &'a mut Option<u16>,
    world: &'a mut ClientWorld,
    /// Set when the own `PlayerJoin` completes the snapshot
    completed_sync: bool,
}

impl MessageHandler for SyncHandler<'_> {
    fn handle_message(&mut self, message: Message) -> Result<(), UnsupportedMessage> {
        if !self.state.is_active() {
            debug!("ignoring {:?} after session end", message.kind());
            return Ok(());
        }

        match message {
            Message::ConnectAccept(accept) => {
                if *self.state == SyncState::Connecting {
                    info!("Accepted as {} at {} Hz", accept.player, accept.tick_rate);
                    *self.player = Some(accept.player);
                    *self.tick_rate = Some(accept.tick_rate);
                    *self.state = SyncState::Syncing;
                } else {
                    warn!("duplicate accept as {} ignored", accept.player);
                }
            }
            Message::ConnectReject(reason) => {
                warn!("Connection rejected: {:?}", reason);
                *self.state = SyncState::Faulted(SessionFault::Rejected(reason));
            }
            Message::PlayerJoin(join) => {
                let own = Some(join.player) == *self.player;
                self.world.apply(&Message::PlayerJoin(join));
                if own && *self.state == SyncState::Syncing {
                    info!(
                        "Synced: {} players, {} entities",
                        self.world.player_count(),
                        self.world.entity_count()
                    );
                    *self.state = SyncState::Synced;
                    self.completed_sync = true;
                }
            }
            Message::ServerQuit => {
                info!("Server shut down");
                *self.state = SyncState::Faulted(SessionFault::ServerEnded);
            }

            Message::PlayerLeave(_)
            | Message::Chat(_)
            | Message::EntityAdd(_)
            | Message::EntityRemove(_)
            | Message::Kill(_)
            | Message::PlayerStats(_)
            | Message::TransformUpdate(_)
            | Message::CircleUpdate(_)
            | Message::OrbUpdate(_)
            | Message::LightningUpdate(_)
            | Message::EntityCollision(_) => {
                self.world.apply(&message);
            }

            Message::ClientConnect(_)
            | Message::ClientSynced
            | Message::ClientLeave
            | Message::PlayerInput(_) => return Err(UnsupportedMessage(message.kind())),
        }
        Ok(())
    }
}

/// One client's session with one server over a dedicated transport
pub struct ClientSession<T: Transport> {
    transport: T,
    server: SocketAddr,
    config: ClientConfig,
    connection: Connection,
    state: SyncState,
    player: Option<PlayerId>,
    tick_rate: Option<u16>,
    world: ClientWorld,
    input: InputManager,
    rng: StdRng,
    last_tick: Option<Instant>,
}

impl<T: Transport> ClientSession<T> {
    /// Opens a session and sends the connect request.
    pub fn connect(transport: T, server: SocketAddr, config: ClientConfig, now: Instant) -> Self {
        let mut rng = StdRng::from_entropy();
        let connection = Connection::with_session(server, config.connection.clone(), rng.gen(), now);
        let mut session = Self {
            transport,
            server,
            config,
            connection,
            state: SyncState::Connecting,
            player: None,
            tick_rate: None,
            world: ClientWorld::new(),
            input: InputManager::new(),
            rng,
            last_tick: None,
        };
        session.send_connect(now);
        session
    }

    fn send_connect(&mut self, now: Instant) {
        info!("Connecting to {} as \"{}\"", self.server, self.config.name);
        let request = Message::ClientConnect(ClientConnect {
            protocol_revision: self.config.protocol_revision,
            name: truncate_utf8(&self.config.name, MAX_NAME_LEN).to_string(),
        });
        let sent = self
            .connection
            .enqueue_message(&request)
            .and_then(|_| self.connection.send_queued_messages(&self.transport, now));
        if let Err(e) = sent {
            self.fault(e);
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        self.player
    }

    /// Server tick rate from the accept, once known.
    pub fn tick_rate(&self) -> Option<u16> {
        self.tick_rate
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn world(&self) -> &ClientWorld {
        &self.world
    }

    pub fn input_mut(&mut self) -> &mut InputManager {
        &mut self.input
    }

    pub fn stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    pub fn rtt(&self) -> Duration {
        self.connection.rtt()
    }

    /// The "waiting for server" hint: the server has gone quiet but the
    /// session has not timed out yet.
    pub fn is_lagging(&self, now: Instant) -> bool {
        self.state.is_active() && self.connection.is_lagging(now)
    }

    /// Runs one client tick: receive, apply, extrapolate, send input, flush.
    pub fn tick(&mut self, now: Instant) {
        if !self.state.is_active() {
            return;
        }
        let dt = self
            .last_tick
            .map(|last| now.saturating_duration_since(last).as_secs_f32())
            .unwrap_or(0.0);
        self.last_tick = Some(now);

        if let Err(e) = self.connection.poll_transport(&self.transport, now) {
            self.fault(e);
            return;
        }

        let mut handler = SyncHandler {
            state: &mut self.state,
            player: &mut self.player,
            tick_rate: &mut self.tick_rate,
            world: &mut self.world,
            completed_sync: false,
        };
        let dispatched = self.connection.dispatch_received_messages(&mut handler, now);
        let completed_sync = handler.completed_sync;
        if let Err(e) = dispatched {
            self.fault(e);
            return;
        }

        match self.state {
            SyncState::Faulted(_) => {
                self.connection.close();
                return;
            }
            SyncState::Synced => {
                if completed_sync {
                    self.enqueue(&Message::ClientSynced);
                }
                self.world.extrapolate(dt);
                if let Some(player) = self.player {
                    let input = self.input.next_input(player);
                    self.enqueue(&Message::PlayerInput(input));
                }
            }
            SyncState::Connecting | SyncState::Syncing | SyncState::Disconnected => {}
        }

        if self.state.is_active() {
            if let Err(e) = self.connection.send_queued_messages(&self.transport, now) {
                self.fault(e);
            }
        }
    }

    /// Queues a chat line; the server stamps it with this player's id.
    pub fn send_chat(&mut self, text: &str) -> Result<(), ConnectionError> {
        let player = self.player.unwrap_or(PlayerId(0));
        self.connection.enqueue_message(&Message::Chat(Chat {
            player,
            text: truncate_utf8(text, MAX_CHAT_LEN).to_string(),
        }))
    }

    /// Leaves voluntarily: `ClientLeave` is flushed and the session ends.
    pub fn disconnect(&mut self, now: Instant) {
        if !self.state.is_active() {
            return;
        }
        let sent = self
            .connection
            .enqueue_message(&Message::ClientLeave)
            .and_then(|_| self.connection.send_queued_messages(&self.transport, now));
        if let Err(e) = sent {
            debug!("leave not sent: {}", e);
        }
        self.connection.close();
        self.state = SyncState::Disconnected;
        info!("Disconnected from {}", self.server);
    }

    /// Starts over with a fresh connection. Sequence state, the mirror and
    /// the input counter are all discarded.
    pub fn reconnect(&mut self, now: Instant) {
        if self.state.is_active() {
            self.disconnect(now);
        }
        self.connection = Connection::with_session(
            self.server,
            self.config.connection.clone(),
            self.rng.gen(),
            now,
        );
        self.state = SyncState::Connecting;
        self.player = None;
        self.tick_rate = None;
        self.world.clear();
        self.input.reset();
        self.last_tick = None;
        self.send_connect(now);
    }

    fn enqueue(&mut self, message: &Message) {
        if let Err(e) = self.connection.enqueue_message(message) {
            if e.is_fatal() {
                self.fault(e);
            } else {
                warn!("{:?} not sent: {}", message.kind(), e);
            }
        }
    }

    fn fault(&mut self, error: ConnectionError) {
        warn!("Connection to {} lost: {}", self.server, error);
        self.connection.close();
        self.state = SyncState::Faulted(SessionFault::ConnectionLost(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::message::{ConnectAccept, EntityAdd, PlayerJoin};
    use arena_shared::{ConnectionConfig, EntityId, EntityKind, EntityState, MemoryEndpoint, MemoryNetwork};

    const TICK: Duration = Duration::from_millis(33);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[derive(Default)]
    struct Inbox(Vec<Message>);

    impl MessageHandler for Inbox {
        fn handle_message(&mut self, message: Message) -> Result<(), UnsupportedMessage> {
            self.0.push(message);
            Ok(())
        }
    }

    /// The server end of one client, driven by hand
    struct FakeServer {
        end: MemoryEndpoint,
        connection: Connection,
        inbox: Inbox,
    }

    impl FakeServer {
        fn new(network: &MemoryNetwork, now: Instant) -> Self {
            Self {
                end: network.bind(addr(27960)),
                connection: Connection::new(addr(5000), ConnectionConfig::default(), now),
                inbox: Inbox::default(),
            }
        }

        fn send(&mut self, messages: &[Message], now: Instant) {
            for message in messages {
                self.connection.enqueue_message(message).unwrap();
            }
            self.connection.send_queued_messages(&self.end, now).unwrap();
        }

        fn receive(&mut self, now: Instant) -> Vec<Message> {
            self.connection.poll_transport(&self.end, now).unwrap();
            self.connection
                .dispatch_received_messages(&mut self.inbox, now)
                .unwrap();
            std::mem::take(&mut self.inbox.0)
        }
    }

    fn setup() -> (MemoryNetwork, FakeServer, ClientSession<MemoryEndpoint>, Instant) {
        let now = Instant::now();
        let network = MemoryNetwork::new();
        let server = FakeServer::new(&network, now);
        let client = ClientSession::connect(
            network.bind(addr(5000)),
            addr(27960),
            ClientConfig {
                name: "alice".to_string(),
                ..ClientConfig::default()
            },
            now,
        );
        (network, server, client, now)
    }

    fn snapshot(own: u32) -> Vec<Message> {
        vec![
            Message::ConnectAccept(ConnectAccept {
                player: PlayerId(own),
                tick_rate: 30,
            }),
            Message::PlayerJoin(PlayerJoin {
                player: PlayerId(1),
                name: "bob".to_string(),
            }),
            Message::EntityAdd(EntityAdd {
                entity: EntityId(1),
                kind: EntityKind::Avatar,
                owner: Some(PlayerId(1)),
                state: EntityState::default(),
            }),
            Message::PlayerJoin(PlayerJoin {
                player: PlayerId(own),
                name: "alice".to_string(),
            }),
        ]
    }

    #[test]
    fn test_connect_sends_request() {
        let (_network, mut server, client, now) = setup();
        assert_eq!(*client.state(), SyncState::Connecting);
        assert!(!client.is_synced());

        let received = server.receive(now);
        match &received[..] {
            [Message::ClientConnect(request)] => {
                assert_eq!(request.name, "alice");
                assert_eq!(request.protocol_revision, arena_shared::PROTOCOL_REVISION);
            }
            other => panic!("Unexpected messages {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_then_own_join_completes_sync() {
        let (_network, mut server, mut client, mut now) = setup();
        server.receive(now);

        // Accept alone only moves to syncing.
        server.send(&snapshot(2)[..1], now);
        now += TICK;
        client.tick(now);
        assert_eq!(*client.state(), SyncState::Syncing);
        assert_eq!(client.player_id(), Some(PlayerId(2)));
        assert_eq!(client.tick_rate(), Some(30));

        server.send(&snapshot(2)[1..], now);
        now += TICK;
        client.tick(now);
        assert!(client.is_synced());
        assert_eq!(client.world().player_count(), 2);
        assert_eq!(client.world().entity_count(), 1);

        let received = server.receive(now);
        assert_eq!(received[0], Message::ClientSynced);
        match &received[1] {
            Message::PlayerInput(input) => {
                assert_eq!(input.player, PlayerId(2));
                assert_eq!(input.sequence, 1);
            }
            other => panic!("Unexpected message {:?}", other),
        }

        now += TICK;
        client.tick(now);
        let received = server.receive(now);
        assert!(!received.contains(&Message::ClientSynced));
        assert!(matches!(&received[0], Message::PlayerInput(input) if input.sequence == 2));
    }

    #[test]
    fn test_reject_faults_session() {
        let (_network, mut server, mut client, mut now) = setup();
        server.receive(now);
        server.send(
            &[Message::ConnectReject(RejectReason::ServerFull { capacity: 4 })],
            now,
        );
        now += TICK;
        client.tick(now);

        assert_eq!(
            *client.state(),
            SyncState::Faulted(SessionFault::Rejected(RejectReason::ServerFull { capacity: 4 }))
        );
        assert!(!client.is_lagging(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_server_quit_is_not_a_connection_loss() {
        let (_network, mut server, mut client, mut now) = setup();
        server.receive(now);
        let mut messages = snapshot(2);
        messages.push(Message::ServerQuit);
        server.send(&messages, now);
        now += TICK;
        client.tick(now);

        assert_eq!(*client.state(), SyncState::Faulted(SessionFault::ServerEnded));
    }

    #[test]
    fn test_silence_faults_with_connection_lost() {
        let (_network, mut server, mut client, mut now) = setup();
        server.receive(now);
        server.send(&snapshot(2), now);
        now += TICK;
        client.tick(now);
        assert!(client.is_synced());

        now += Duration::from_secs(2);
        assert!(client.is_lagging(now));

        now += Duration::from_secs(9);
        client.tick(now);
        assert!(matches!(
            client.state(),
            SyncState::Faulted(SessionFault::ConnectionLost(_))
        ));
        assert!(!client.is_lagging(now));
    }

    #[test]
    fn test_disconnect_flushes_leave() {
        let (_network, mut server, mut client, mut now) = setup();
        server.receive(now);
        server.send(&snapshot(2), now);
        now += TICK;
        client.tick(now);
        server.receive(now);

        client.disconnect(now);
        assert_eq!(*client.state(), SyncState::Disconnected);
        assert!(server.receive(now).contains(&Message::ClientLeave));

        // Further ticks do nothing.
        client.tick(now + TICK);
        assert!(server.receive(now + TICK).is_empty());
    }

    #[test]
    fn test_reconnect_discards_sequence_state() {
        let (network, mut server, mut client, mut now) = setup();
        server.receive(now);
        server.send(&snapshot(2), now);
        now += TICK;
        client.tick(now);
        let old_session = server.connection.session();
        assert!(old_session.is_some());

        client.reconnect(now);
        assert_eq!(*client.state(), SyncState::Connecting);
        assert_eq!(client.player_id(), None);
        assert_eq!(client.world().entity_count(), 0);

        // The old server connection no longer hears this client.
        let leftovers = server.receive(now);
        assert!(!leftovers
            .iter()
            .any(|m| matches!(m, Message::ClientConnect(_))));
        assert!(server.connection.stats().foreign_datagrams > 0);

        // The old connection swallowed the first request; the resend reaches
        // the new server.
        drop(server);
        let mut server = FakeServer::new(&network, now);
        now += Duration::from_millis(200);
        client.tick(now);
        let received = server.receive(now);
        assert!(matches!(&received[..], [Message::ClientConnect(_)]));
        assert_ne!(server.connection.session(), old_session);

        server.send(&snapshot(3), now);
        now += TICK;
        client.tick(now);
        assert!(client.is_synced());
        let received = server.receive(now);
        assert!(matches!(&received[1], Message::PlayerInput(input) if input.sequence == 1));
    }
}
