//! Server network layer: admission, per-tick dispatch and broadcast
//!
//! The server owns one socket. Every tick it:
//!
//! 1. drains the socket and routes each datagram by sender address, either to
//!    an admitted session or to a provisional handshake connection
//! 2. runs admission for completed handshakes
//! 3. dispatches every session in id order and applies the resulting events
//! 4. removes dropped sessions, broadcasting `PlayerLeave` and `EntityRemove`
//! 5. steps the simulation
//! 6. broadcasts topology changes reliably and entity deltas unreliably
//! 7. flushes every connection

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::game::{GameState, InputCommand, WorldEvent};
use arena_shared::connection::RECV_BUFFER_LEN;
use arena_shared::packet::peek_header;
use arena_shared::message::{
    Chat, ClientConnect, ConnectAccept, EntityCollision, Kill, PlayerInput, PlayerJoin, PlayerLeave,
};
use arena_shared::transport::{is_transient_receive_error, MAX_TRANSIENT_ERRORS};
use arena_shared::{
    ChannelKey, ChannelSubject, Connection, ConnectionError, LeaveReason, Message, MessageHandler,
    MessageKind, PlayerId, RejectReason, SequenceCounters, Transport, UnsupportedMessage,
};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;

/// Ended session ids remembered per address.
const RETIRED_PER_ADDR: usize = 4;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// What a session's messages asked the server to do this tick
#[derive(Debug, Clone, PartialEq)]
enum ClientEvent {
    Synced(PlayerId),
    Input(PlayerId, InputCommand),
    Chat(PlayerId, String),
    Leave(PlayerId),
    Kick(PlayerId),
}

/// Handler for admitted sessions
struct SessionHandler<'a> {
    player: PlayerId,
    events: &'a mut Vec<ClientEvent>,
}

impl MessageHandler for SessionHandler<'_> {
    fn handle_message(&mut self, message: Message) -> Result<(), UnsupportedMessage> {
        match message {
            Message::ClientSynced => self.events.push(ClientEvent::Synced(self.player)),
            Message::PlayerInput(input) => {
                if input.player != self.player {
                    warn!("{} sent input for {}", self.player, input.player);
                    self.events.push(ClientEvent::Kick(self.player));
                } else {
                    self.events
                        .push(ClientEvent::Input(self.player, InputCommand::from(&input)));
                }
            }
            Message::Chat(chat) => self.events.push(ClientEvent::Chat(self.player, chat.text)),
            Message::ClientLeave => self.events.push(ClientEvent::Leave(self.player)),

            Message::ClientConnect(_)
            | Message::ConnectAccept(_)
            | Message::ConnectReject(_)
            | Message::PlayerJoin(_)
            | Message::PlayerLeave(_)
            | Message::EntityAdd(_)
            | Message::EntityRemove(_)
            | Message::Kill(_)
            | Message::PlayerStats(_)
            | Message::ServerQuit
            | Message::TransformUpdate(_)
            | Message::CircleUpdate(_)
            | Message::OrbUpdate(_)
            | Message::LightningUpdate(_)
            | Message::EntityCollision(_) => return Err(UnsupportedMessage(message.kind())),
        }
        Ok(())
    }
}

/// Handler for provisional connections. Only a connect request matters;
/// anything else from an unadmitted address is ignored.
#[derive(Default)]
struct HandshakeHandler {
    request: Option<ClientConnect>,
}

impl MessageHandler for HandshakeHandler {
    fn handle_message(&mut self, message: Message) -> Result<(), UnsupportedMessage> {
        match message {
            Message::ClientConnect(request) => {
                if self.request.is_none() {
                    self.request = Some(request);
                }
            }
            Message::ConnectAccept(_)
            | Message::ConnectReject(_)
            | Message::PlayerJoin(_)
            | Message::PlayerLeave(_)
            | Message::Chat(_)
            | Message::EntityAdd(_)
            | Message::EntityRemove(_)
            | Message::Kill(_)
            | Message::PlayerStats(_)
            | Message::ClientSynced
            | Message::ClientLeave
            | Message::ServerQuit
            | Message::TransformUpdate(_)
            | Message::CircleUpdate(_)
            | Message::OrbUpdate(_)
            | Message::LightningUpdate(_)
            | Message::EntityCollision(_)
            | Message::PlayerInput(_) => {
                debug!("ignoring {:?} before admission", message.kind());
            }
        }
        Ok(())
    }
}

/// Authoritative server over any datagram transport
pub struct Server<T: Transport> {
    transport: T,
    config: ServerConfig,
    clients: ClientManager,
    /// Handshakes from addresses with no session yet
    pending: HashMap<SocketAddr, Connection>,
    /// Sessions that ended at each address; their late datagrams are ignored
    retired: HashMap<SocketAddr, VecDeque<u32>>,
    game: GameState,
    counters: SequenceCounters,
    /// Sessions to remove at the next opportunity
    dropped: Vec<(PlayerId, LeaveReason)>,
    ticks: u64,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: ServerConfig) -> Self {
        Self::with_game(transport, config, GameState::new())
    }

    pub fn with_game(transport: T, config: ServerConfig, game: GameState) -> Self {
        Self {
            transport,
            clients: ClientManager::new(config.max_players),
            config,
            pending: HashMap::new(),
            retired: HashMap::new(),
            game,
            counters: SequenceCounters::new(),
            dropped: Vec::new(),
            ticks: 0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn player_count(&self) -> usize {
        self.clients.len()
    }

    pub fn pending_handshakes(&self) -> usize {
        self.pending.len()
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    /// Runs one full server tick.
    pub fn tick(&mut self, now: Instant) -> Result<(), ServerError> {
        self.ticks += 1;

        self.receive(now)?;
        self.process_handshakes(now);
        self.dispatch_sessions(now);
        self.remove_dropped();

        self.game.step(self.config.tick_seconds());
        self.broadcast_world_events();
        self.broadcast_deltas();

        let failed = self.clients.flush_all(&self.transport, now);
        self.note_failures(failed);
        Ok(())
    }

    /// Tells every client the server is going away and flushes.
    pub fn shutdown(&mut self, now: Instant) {
        info!("Shutting down \"{}\" with {} players", self.config.name, self.clients.len());
        let failed = self.clients.broadcast(&Message::ServerQuit, None);
        self.note_failures(failed);
        let failed = self.clients.flush_all(&self.transport, now);
        self.note_failures(failed);
        for id in self.clients.ids() {
            self.clients.remove_client(id);
        }
        self.pending.clear();
    }

    fn receive(&mut self, now: Instant) -> Result<(), ServerError> {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let mut transient = 0;
        loop {
            let (len, from) = match self.transport.recv_datagram(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) if is_transient_receive_error(&e) => {
                    debug!("ignoring receive error: {}", e);
                    transient += 1;
                    if transient >= MAX_TRANSIENT_ERRORS {
                        warn!("{} receive errors in one tick, draining next tick", transient);
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let bytes = &buf[..len];
            if self.is_retired(from, bytes) {
                debug!("ignoring datagram from ended session at {}", from);
                continue;
            }
            if let Some(id) = self.clients.find_client_by_addr(from) {
                if !self.restarted(id, bytes) {
                    if let Some(session) = self.clients.get_mut(id) {
                        session.connection.receive_datagram(bytes, now);
                    }
                    continue;
                }
                // The client started over from the same address. The old
                // session goes before the new handshake is admitted.
                info!("{} restarted from {}, replacing session", id, from);
                self.dropped.push((id, LeaveReason::TimedOut));
                self.remove_dropped();
            }

            if !self.pending.contains_key(&from)
                && self.pending.len() >= self.config.max_pending_handshakes
            {
                debug!("handshake table full, ignoring {}", from);
                continue;
            }
            let config = self.config.connection.clone();
            self.pending
                .entry(from)
                .or_insert_with(|| Connection::new(from, config, now))
                .receive_datagram(bytes, now);
        }
        Ok(())
    }

    /// True when `bytes` carry the id of a session that already ended at
    /// `from`.
    fn is_retired(&self, from: SocketAddr, bytes: &[u8]) -> bool {
        let Some(sessions) = self.retired.get(&from) else {
            return false;
        };
        matches!(peek_header(bytes), Ok(header) if sessions.contains(&header.session))
    }

    fn retire(&mut self, addr: SocketAddr, session: Option<u32>) {
        let Some(session) = session else {
            return;
        };
        let sessions = self.retired.entry(addr).or_default();
        if sessions.len() == RETIRED_PER_ADDR {
            sessions.pop_front();
        }
        sessions.push_back(session);
    }

    /// True when `bytes` carry a different session id than the one the
    /// player's connection was opened with.
    fn restarted(&self, id: PlayerId, bytes: &[u8]) -> bool {
        let Some(current) = self.clients.get(id).and_then(|s| s.connection.session()) else {
            return false;
        };
        matches!(peek_header(bytes), Ok(header) if header.session != current)
    }

    fn process_handshakes(&mut self, now: Instant) {
        let addrs: Vec<SocketAddr> = self.pending.keys().copied().collect();
        for addr in addrs {
            let Some(mut connection) = self.pending.remove(&addr) else {
                continue;
            };
            let mut handler = HandshakeHandler::default();
            if let Err(e) = connection.dispatch_received_messages(&mut handler, now) {
                debug!("dropping handshake from {}: {}", addr, e);
                continue;
            }
            match handler.request {
                Some(request) => self.admit(connection, request, now),
                None => {
                    self.pending.insert(addr, connection);
                }
            }
        }
    }

    fn admit(&mut self, mut connection: Connection, request: ClientConnect, now: Instant) {
        let addr = connection.remote_addr();

        let rejection = if request.protocol_revision != self.config.protocol_revision {
            Some(RejectReason::ProtocolMismatch {
                server_revision: self.config.protocol_revision,
            })
        } else if self.clients.is_full() {
            Some(RejectReason::ServerFull {
                capacity: u16::try_from(self.clients.capacity()).unwrap_or(u16::MAX),
            })
        } else {
            None
        };

        if let Some(reason) = rejection {
            info!("Rejecting {} (\"{}\"): {:?}", addr, request.name, reason);
            let sent = connection
                .enqueue_message(&Message::ConnectReject(reason))
                .and_then(|_| connection.send_queued_messages(&self.transport, now));
            if let Err(e) = sent {
                debug!("reject to {} not sent: {}", addr, e);
            }
            return;
        }

        let name = match request.name.trim() {
            "" => format!("Player {}", self.clients.next_id().0),
            trimmed => trimmed.to_string(),
        };

        let id = match self.clients.add_client(name.clone(), connection) {
            Ok(id) => id,
            Err(connection) => {
                warn!("{} admitted past capacity check", connection.remote_addr());
                return;
            }
        };
        self.game.add_player(id);

        let join = Message::PlayerJoin(PlayerJoin {
            player: id,
            name: name.clone(),
        });
        let failed = self.clients.broadcast(&join, Some(id));
        self.note_failures(failed);

        let mut snapshot = vec![Message::ConnectAccept(ConnectAccept {
            player: id,
            tick_rate: self.config.tick_rate,
        })];
        for session in self.clients.iter().filter(|s| s.id != id) {
            snapshot.push(Message::PlayerJoin(PlayerJoin {
                player: session.id,
                name: session.name.clone(),
            }));
            if let Some(stats) = self.game.stats(session.id) {
                snapshot.push(Message::PlayerStats(stats));
            }
        }
        snapshot.extend(self.game.snapshot().into_iter().map(Message::EntityAdd));
        snapshot.push(join);

        if let Some(session) = self.clients.get_mut(id) {
            for message in &snapshot {
                if let Err(e) = session.connection.enqueue_message(message) {
                    warn!("{}: snapshot incomplete: {}", id, e);
                    if e.is_fatal() {
                        self.dropped.push((id, LeaveReason::Kicked));
                        break;
                    }
                }
            }
        }
    }

    fn dispatch_sessions(&mut self, now: Instant) {
        let mut events = Vec::new();
        for session in self.clients.iter_mut() {
            let mut handler = SessionHandler {
                player: session.id,
                events: &mut events,
            };
            if let Err(e) = session.connection.dispatch_received_messages(&mut handler, now) {
                let reason = leave_reason(&e);
                info!("{} dropped: {}", session.id, e);
                self.dropped.push((session.id, reason));
            }
        }

        for event in events {
            match event {
                ClientEvent::Synced(id) => {
                    if let Some(session) = self.clients.get_mut(id) {
                        if !session.synced {
                            session.synced = true;
                            info!("{} synced", id);
                            self.game.spawn_avatar(id);
                        }
                    }
                }
                ClientEvent::Input(id, input) => {
                    if let Some(session) = self.clients.get_mut(id) {
                        session.last_input = Some(now);
                    }
                    self.game.apply_input(id, input);
                }
                ClientEvent::Chat(id, text) => {
                    let failed = self.clients.broadcast(&Message::Chat(Chat { player: id, text }), None);
                    self.note_failures(failed);
                }
                ClientEvent::Leave(id) => self.dropped.push((id, LeaveReason::Left)),
                ClientEvent::Kick(id) => self.dropped.push((id, LeaveReason::Kicked)),
            }
        }
    }

    fn remove_dropped(&mut self) {
        while !self.dropped.is_empty() {
            let dropped = std::mem::take(&mut self.dropped);
            for (id, reason) in dropped {
                let Some(session) = self.clients.remove_client(id) else {
                    continue;
                };
                self.retire(session.addr(), session.connection.session());
                self.game.remove_player(id);
                let leave = Message::PlayerLeave(PlayerLeave { player: id, reason });
                let failed = self.clients.broadcast(&leave, None);
                self.note_failures(failed);
            }
            // Entity removals for the departed players go out now, not after
            // the next simulation step.
            self.broadcast_world_events();
        }
    }

    fn broadcast_world_events(&mut self) {
        for event in self.game.drain_events() {
            let message = match event {
                WorldEvent::EntityAdded(add) => Message::EntityAdd(add),
                WorldEvent::EntityRemoved(entity) => {
                    self.counters.remove_subject(ChannelSubject::Entity(entity));
                    Message::EntityRemove(entity)
                }
                WorldEvent::Kill { killer, victim } => Message::Kill(Kill { killer, victim }),
                WorldEvent::StatsChanged(player) => match self.game.stats(player) {
                    Some(stats) => Message::PlayerStats(stats),
                    None => continue,
                },
                WorldEvent::Collision {
                    entity,
                    other,
                    impulse,
                } => Message::EntityCollision(EntityCollision {
                    sequence: self
                        .counters
                        .next(ChannelKey::entity(MessageKind::EntityCollision, entity)),
                    entity,
                    other,
                    impulse,
                }),
            };
            let failed = self.clients.broadcast(&message, None);
            self.note_failures(failed);
        }
    }

    fn broadcast_deltas(&mut self) {
        let refresh = self.config.refresh_interval_ticks > 0
            && self.ticks % u64::from(self.config.refresh_interval_ticks) == 0;
        for message in self.game.delta_messages(refresh, &mut self.counters) {
            let failed = self.clients.broadcast(&message, None);
            self.note_failures(failed);
        }
    }

    fn note_failures(&mut self, failed: Vec<(PlayerId, ConnectionError)>) {
        for (id, e) in failed {
            info!("{} dropped: {}", id, e);
            self.dropped.push((id, leave_reason(&e)));
        }
    }
}

fn leave_reason(error: &ConnectionError) -> LeaveReason {
    match error {
        ConnectionError::TimedOut(_) | ConnectionError::Closed | ConnectionError::Io(_) => {
            LeaveReason::TimedOut
        }
        ConnectionError::QueueOverflow { .. }
        | ConnectionError::MalformedFlood { .. }
        | ConnectionError::Unsupported(_)
        | ConnectionError::MessageTooLarge { .. }
        | ConnectionError::Encode(_) => LeaveReason::Kicked,
    }
}
