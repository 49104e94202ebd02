//! Server-side roster of admitted players
//!
//! This module tracks every player the server has accepted:
//! - Stable player ids, assigned in admission order starting from 1
//! - The per-player `Connection` that carries all traffic for that player
//! - Capacity enforcement for admission
//! - Address lookup for routing datagrams from the shared socket
//!
//! Sessions are iterated in id order so every tick processes players in the
//! same sequence.

use arena_shared::{Connection, ConnectionError, Message, PlayerId, Transport};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Instant;

/// One admitted player
///
/// A session exclusively owns its connection. It is created when the server
/// accepts a `ClientConnect` and destroyed on leave, timeout, or kick.
pub struct ClientSession {
    /// Stable identity assigned at accept time
    pub id: PlayerId,
    /// Display name from the connect request
    pub name: String,
    /// Transport session for this player; owns its sequence channels
    pub connection: Connection,
    /// Set once the client confirms it has applied the join snapshot
    pub synced: bool,
    /// When the last `PlayerInput` from this player was applied
    pub last_input: Option<Instant>,
}

impl ClientSession {
    pub fn new(id: PlayerId, name: String, connection: Connection) -> Self {
        Self {
            id,
            name,
            connection,
            synced: false,
            last_input: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }
}

/// Manages all admitted players
///
/// The ClientManager owns every `ClientSession`, hands out player ids, and
/// enforces the server's player limit. Address lookups let the server route
/// each datagram from its single listening socket to the right connection.
pub struct ClientManager {
    /// Admitted sessions indexed by player id
    sessions: BTreeMap<PlayerId, ClientSession>,
    /// Remote address of every session, for datagram routing
    by_addr: HashMap<SocketAddr, PlayerId>,
    /// Next id to hand out; ids are never reused while the server runs
    next_player_id: u32,
    /// Maximum number of concurrent players allowed
    max_players: usize,
}

impl ClientManager {
    /// Creates an empty roster with the given player limit
    ///
    /// Player ids start from 1 and increment with each admission.
    pub fn new(max_players: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            by_addr: HashMap::new(),
            next_player_id: 1,
            max_players,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_players
    }

    /// The id the next admitted player will receive
    pub fn next_id(&self) -> PlayerId {
        PlayerId(self.next_player_id)
    }

    /// Returns true when no further players can be admitted
    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_players
    }

    /// Admits a player over an established connection
    ///
    /// Returns the new player's id, or hands the connection back if the
    /// server is at capacity so the caller can still send a rejection on it.
    pub fn add_client(&mut self, name: String, connection: Connection) -> Result<PlayerId, Connection> {
        if self.is_full() {
            return Err(connection);
        }

        let id = PlayerId(self.next_player_id);
        self.next_player_id += 1;

        let session = ClientSession::new(id, name, connection);
        info!("{} \"{}\" joined from {}", id, session.name, session.addr());
        self.by_addr.insert(session.addr(), id);
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Removes a player and returns their session
    ///
    /// Returns None if the player was already gone. The session's connection
    /// is closed before it is handed back.
    pub fn remove_client(&mut self, id: PlayerId) -> Option<ClientSession> {
        let mut session = self.sessions.remove(&id)?;
        if self.by_addr.get(&session.addr()) == Some(&id) {
            self.by_addr.remove(&session.addr());
        }
        session.connection.close();
        info!("{} \"{}\" removed", id, session.name);
        Some(session)
    }

    /// Finds the player whose connection talks to the given address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.by_addr.get(&addr).copied()
    }

    pub fn get(&self, id: PlayerId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id)
    }

    /// All player ids in ascending order
    pub fn ids(&self) -> Vec<PlayerId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.sessions.values_mut()
    }

    /// Enqueues a message on every session except `exclude`
    ///
    /// Returns the players whose connections failed fatally; the caller must
    /// remove them. Non-fatal failures are logged and skipped.
    pub fn broadcast(
        &mut self,
        message: &Message,
        exclude: Option<PlayerId>,
    ) -> Vec<(PlayerId, ConnectionError)> {
        let mut failed = Vec::new();
        for session in self.sessions.values_mut() {
            if Some(session.id) == exclude {
                continue;
            }
            if let Err(e) = session.connection.enqueue_message(message) {
                if e.is_fatal() {
                    failed.push((session.id, e));
                } else {
                    warn!("{}: {:?} not sent: {}", session.id, message.kind(), e);
                }
            }
        }
        failed
    }

    /// Flushes every session's outbound queue
    ///
    /// Returns the players whose connections failed fatally.
    pub fn flush_all<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        now: Instant,
    ) -> Vec<(PlayerId, ConnectionError)> {
        let mut failed = Vec::new();
        for session in self.sessions.values_mut() {
            if let Err(e) = session.connection.send_queued_messages(transport, now) {
                failed.push((session.id, e));
            }
        }
        failed
    }

    /// Returns the number of admitted players
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no players are admitted
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
