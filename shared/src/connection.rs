//! One peer's session over a datagram [`Transport`].
//!
//! A `Connection` queues outbound messages, packs them into datagrams,
//! resends unacknowledged reliable messages, buffers inbound datagrams until
//! the owner dispatches them, and tracks round-trip time and silence. It
//! never spawns tasks; the owner drives it once per tick:
//!
//! 1. [`Connection::poll_transport`] or [`Connection::receive_datagram`]
//! 2. [`Connection::dispatch_received_messages`]
//! 3. [`Connection::enqueue_message`] as the simulation produces output
//! 4. [`Connection::send_queued_messages`]

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, MalformedMessage, UnsupportedMessage};
use crate::message::{encode, Message, MessageKind};
use crate::packet::{
    decode_datagram, empty_datagram, peek_header, DatagramHeader, DatagramPacker, EchoStamp,
};
use crate::reliable::{ReceiveOutcome, ReliableReceiver, ReliableSender};
use crate::sequence::{classify, sequence_greater_than, Reliability, SequenceChannels};
use crate::transport::{is_transient_receive_error, Transport, MAX_TRANSIENT_ERRORS};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Receive buffer size; larger datagrams arrive truncated and fail to decode.
pub const RECV_BUFFER_LEN: usize = 2048;

const INITIAL_RTT_MS: f32 = 100.0;

/// Receives every message a connection releases, in delivery order.
///
/// Implementations match exhaustively on [`Message`] and return
/// [`UnsupportedMessage`] for kinds their role never accepts.
pub trait MessageHandler {
    fn handle_message(&mut self, message: Message) -> Result<(), UnsupportedMessage>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    /// Sends that hit `WouldBlock` and were treated as lost.
    pub send_would_block: u64,
    pub reliable_resends: u64,
    pub duplicate_reliable: u64,
    pub malformed_datagrams: u64,
    pub stale_updates: u64,
    /// Datagrams stamped with another session, from an earlier connection.
    pub foreign_datagrams: u64,
    pub messages_dispatched: u64,
}

struct QueuedFrame {
    kind: MessageKind,
    frame: Vec<u8>,
}

pub struct Connection {
    remote: SocketAddr,
    config: ConnectionConfig,
    /// Chosen by the opening side; `None` until adopted from the first
    /// datagram on the accepting side.
    session: Option<u32>,
    epoch: Instant,
    outbound: VecDeque<QueuedFrame>,
    inbound: VecDeque<Vec<u8>>,
    sender: ReliableSender,
    receiver: ReliableReceiver,
    channels: SequenceChannels,
    last_received: Instant,
    last_sent: Option<Instant>,
    ack_owed: bool,
    /// Latest stamp from the peer and when it arrived.
    peer_stamp: Option<(u32, Instant)>,
    rtt_ms: f32,
    malformed_streak: u32,
    stats: ConnectionStats,
    closed: bool,
}

impl Connection {
    /// A connection that adopts its session id from the peer's first
    /// datagram. Used by the accepting side.
    pub fn new(remote: SocketAddr, config: ConnectionConfig, now: Instant) -> Self {
        Self::create(remote, config, None, now)
    }

    /// A connection that opens a new session. Datagrams stamped with any
    /// other session id are ignored.
    pub fn with_session(remote: SocketAddr, config: ConnectionConfig, session: u32, now: Instant) -> Self {
        Self::create(remote, config, Some(session), now)
    }

    fn create(remote: SocketAddr, config: ConnectionConfig, session: Option<u32>, now: Instant) -> Self {
        Self {
            remote,
            config,
            session,
            epoch: now,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            sender: ReliableSender::new(),
            receiver: ReliableReceiver::new(),
            channels: SequenceChannels::new(),
            last_received: now,
            last_sent: None,
            ack_owed: false,
            peer_stamp: None,
            rtt_ms: INITIAL_RTT_MS,
            malformed_streak: 0,
            stats: ConnectionStats::default(),
            closed: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn session(&self) -> Option<u32> {
        self.session
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_secs_f32(self.rtt_ms / 1000.0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reliable messages sent but not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.sender.len()
    }

    /// Messages enqueued but not yet sent.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// True while the peer has been silent past the lag threshold but not yet
    /// past the timeout.
    pub fn is_lagging(&self, now: Instant) -> bool {
        if self.closed {
            return false;
        }
        let silence = now.saturating_duration_since(self.last_received);
        silence > self.config.lag_threshold && silence <= self.config.timeout
    }

    /// Stops all further work and drops buffered data.
    pub fn close(&mut self) {
        self.closed = true;
        self.outbound.clear();
        self.inbound.clear();
    }

    pub fn enqueue_message(&mut self, message: &Message) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let limit = self.config.max_queued_messages;
        if self.outbound.len() + self.sender.len() >= limit {
            warn!("{}: outbound queue overflow at {} messages", self.remote, limit);
            self.closed = true;
            return Err(ConnectionError::QueueOverflow { limit });
        }

        let kind = message.kind();
        let mut frame = Vec::new();
        encode(message, &mut frame)?;

        let budget = DatagramPacker::new(self.config.max_datagram_size).frame_budget();
        if frame.len() > budget {
            return Err(ConnectionError::MessageTooLarge {
                kind,
                size: frame.len(),
            });
        }

        self.outbound.push_back(QueuedFrame { kind, frame });
        Ok(())
    }

    /// Packs and transmits everything queued, plus the reliable window when
    /// it is due for a resend. Returns the number of datagrams handed to the
    /// transport.
    pub fn send_queued_messages<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        now: Instant,
    ) -> Result<usize, ConnectionError> {
        self.check_open(now)?;

        let mut packer = DatagramPacker::new(self.config.max_datagram_size);
        let resend_interval = self.config.resend_interval(self.rtt());
        if self.sender.is_due(now, resend_interval) {
            for pending in self.sender.resend_all(now) {
                packer.push(&pending.frame, Some(pending.ordinal));
                self.stats.reliable_resends += 1;
            }
        }

        while let Some(QueuedFrame { kind, frame }) = self.outbound.pop_front() {
            match classify(kind) {
                Reliability::Reliable => {
                    packer.push(&frame, Some(self.sender.next_ordinal()));
                    self.sender.push(kind, frame, now);
                }
                Reliability::UnreliableSequenced => packer.push(&frame, None),
            }
        }

        let header = DatagramHeader {
            session: self.session.unwrap_or(0),
            ack: self.receiver.ack(),
            reliable_start: self.sender.next_ordinal(),
            stamp: self.stamp(now),
            echo: self.echo(now),
        };

        let datagrams = if !packer.is_empty() {
            packer.finish(header)?
        } else if self.ack_owed || self.heartbeat_due(now) {
            vec![empty_datagram(&header)?]
        } else {
            return Ok(0);
        };

        let mut sent = 0;
        for datagram in &datagrams {
            match transport.send_datagram(datagram, self.remote) {
                Ok(()) => sent += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!("{}: send would block, datagram lost", self.remote);
                    self.stats.send_would_block += 1;
                }
                Err(e) => {
                    warn!("{}: send failed: {}", self.remote, e);
                    self.closed = true;
                    return Err(ConnectionError::Io(e));
                }
            }
        }
        self.stats.datagrams_sent += sent as u64;
        self.ack_owed = false;
        self.last_sent = Some(now);
        Ok(sent)
    }

    /// Buffers a datagram the owner received on this peer's behalf.
    pub fn receive_datagram(&mut self, bytes: &[u8], now: Instant) {
        if self.closed {
            return;
        }
        if self.is_foreign(bytes) {
            return;
        }
        self.inbound.push_back(bytes.to_vec());
        self.last_received = now;
    }

    /// Drains every datagram waiting on a transport dedicated to this peer.
    /// Datagrams from other addresses are ignored.
    pub fn poll_transport<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        now: Instant,
    ) -> Result<usize, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let mut received = 0;
        let mut transient = 0;
        loop {
            match transport.recv_datagram(&mut buf) {
                Ok(Some((len, from))) => {
                    if from != self.remote {
                        debug!("ignoring {} bytes from unknown peer {}", len, from);
                        continue;
                    }
                    self.receive_datagram(&buf[..len], now);
                    received += 1;
                }
                Ok(None) => return Ok(received),
                Err(e) if is_transient_receive_error(&e) => {
                    debug!("{}: ignoring receive error: {}", self.remote, e);
                    transient += 1;
                    if transient >= MAX_TRANSIENT_ERRORS {
                        return Ok(received);
                    }
                }
                Err(e) => {
                    warn!("{}: receive failed: {}", self.remote, e);
                    self.closed = true;
                    return Err(ConnectionError::Io(e));
                }
            }
        }
    }

    /// Decodes buffered datagrams and hands every message that should apply
    /// to `handler`. Returns the number of messages handed over.
    pub fn dispatch_received_messages<H: MessageHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        now: Instant,
    ) -> Result<usize, ConnectionError> {
        self.check_open(now)?;

        let mut dispatched = 0;
        while let Some(bytes) = self.inbound.pop_front() {
            self.stats.datagrams_received += 1;
            let datagram = match decode_datagram(&bytes) {
                Ok(datagram) => datagram,
                Err(e) => {
                    self.note_malformed(e)?;
                    continue;
                }
            };

            match self.session {
                None => self.session = Some(datagram.header.session),
                Some(session) if session != datagram.header.session => {
                    self.stats.foreign_datagrams += 1;
                    continue;
                }
                Some(_) => {}
            }
            self.apply_header(&datagram.header, now);

            let mut ordinal = datagram.header.reliable_start;
            for message in datagram.messages {
                match message.reliability() {
                    Reliability::Reliable => {
                        self.ack_owed = true;
                        if self.receiver.receive(ordinal, message) == ReceiveOutcome::Discarded {
                            self.stats.duplicate_reliable += 1;
                        }
                        ordinal = ordinal.wrapping_add(1);
                        while let Some(ready) = self.receiver.pop_ready() {
                            self.deliver(handler, ready)?;
                            dispatched += 1;
                        }
                    }
                    Reliability::UnreliableSequenced => {
                        let fresh = match (message.channel_key(), message.sequence()) {
                            (Some(key), Some(sequence)) => self.channels.accept(key, sequence),
                            _ => true,
                        };
                        if fresh {
                            self.deliver(handler, message)?;
                            dispatched += 1;
                        } else {
                            trace!("{}: stale {:?} dropped", self.remote, message.kind());
                            self.stats.stale_updates += 1;
                        }
                    }
                }
            }

            match datagram.error {
                Some(e) => self.note_malformed(e)?,
                None => self.malformed_streak = 0,
            }
        }
        Ok(dispatched)
    }

    fn deliver<H: MessageHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        message: Message,
    ) -> Result<(), ConnectionError> {
        let retired = message.retired_subject();
        if let Err(unsupported) = handler.handle_message(message) {
            warn!("{}: {}", self.remote, unsupported);
            self.closed = true;
            return Err(unsupported.into());
        }
        if let Some(subject) = retired {
            self.channels.remove_subject(subject);
        }
        self.stats.messages_dispatched += 1;
        Ok(())
    }

    fn apply_header(&mut self, header: &DatagramHeader, now: Instant) {
        self.sender.acknowledge(header.ack);

        if let Some(echo) = header.echo {
            if let Some(elapsed) = self.stamp(now).checked_sub(echo.stamp) {
                let sample = elapsed.saturating_sub(u32::from(echo.held_ms)) as f32;
                self.rtt_ms += (sample - self.rtt_ms) / 8.0;
            }
        }

        let newer = match self.peer_stamp {
            Some((last, _)) => sequence_greater_than(header.stamp, last),
            None => true,
        };
        if newer {
            self.peer_stamp = Some((header.stamp, now));
        }
    }

    /// True for a well-formed datagram from a different session. Bad headers
    /// are left for dispatch to count as malformed.
    fn is_foreign(&mut self, bytes: &[u8]) -> bool {
        let (Some(session), Ok(header)) = (self.session, peek_header(bytes)) else {
            return false;
        };
        if header.session == session {
            return false;
        }
        debug!(
            "{}: ignoring datagram from session {:#x}, expected {:#x}",
            self.remote, header.session, session
        );
        self.stats.foreign_datagrams += 1;
        true
    }

    fn note_malformed(&mut self, error: MalformedMessage) -> Result<(), ConnectionError> {
        self.stats.malformed_datagrams += 1;
        self.malformed_streak += 1;
        debug!("{}: malformed datagram: {}", self.remote, error);

        if self.malformed_streak >= self.config.max_consecutive_malformed {
            warn!(
                "{}: dropping peer after {} malformed datagrams",
                self.remote, self.malformed_streak
            );
            self.closed = true;
            return Err(ConnectionError::MalformedFlood {
                count: self.malformed_streak,
                last: error,
            });
        }
        Ok(())
    }

    fn check_open(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let silence = now.saturating_duration_since(self.last_received);
        if silence > self.config.timeout {
            warn!("{}: timed out after {:?} of silence", self.remote, silence);
            self.close();
            return Err(ConnectionError::TimedOut(silence));
        }
        Ok(())
    }

    fn heartbeat_due(&self, now: Instant) -> bool {
        match self.last_sent {
            Some(at) => now.saturating_duration_since(at) >= self.config.heartbeat_interval,
            None => true,
        }
    }

    fn stamp(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }

    fn echo(&self, now: Instant) -> Option<EchoStamp> {
        self.peer_stamp.map(|(stamp, at)| {
            let held = now.saturating_duration_since(at).as_millis();
            EchoStamp {
                stamp,
                held_ms: held.min(u128::from(u16::MAX)) as u16,
            }
        })
    }
}
