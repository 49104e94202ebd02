//! Application-level reliability for the reliable message kinds.
//!
//! Each reliable message gets a per-connection ordinal when it is first
//! transmitted. The receiver acknowledges cumulatively with the next ordinal
//! it expects, so the sender's unacknowledged window is always a contiguous
//! run of ordinals. When the oldest entry has waited longer than the resend
//! interval the whole window goes out again.

use crate::message::{Message, MessageKind};
use crate::sequence::{sequence_diff, sequence_greater_than, sequence_less_than};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// How far past the next expected ordinal the receiver will buffer.
pub const MAX_RELIABLE_AHEAD: u32 = 1024;

#[derive(Debug, Clone)]
pub struct PendingReliable {
    pub ordinal: u32,
    pub kind: MessageKind,
    /// Encoded frame, kept so resends skip re-encoding.
    pub frame: Vec<u8>,
    pub last_sent: Instant,
    pub sends: u32,
}

#[derive(Debug, Default)]
pub struct ReliableSender {
    next_ordinal: u32,
    window: VecDeque<PendingReliable>,
}

impl ReliableSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a first transmission and returns the ordinal assigned to it.
    pub fn push(&mut self, kind: MessageKind, frame: Vec<u8>, now: Instant) -> u32 {
        let ordinal = self.next_ordinal;
        self.next_ordinal = self.next_ordinal.wrapping_add(1);
        self.window.push_back(PendingReliable {
            ordinal,
            kind,
            frame,
            last_sent: now,
            sends: 1,
        });
        ordinal
    }

    /// Drops every entry below the cumulative `ack`. Returns how many went.
    ///
    /// Acks claiming ordinals that were never sent are ignored.
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        if sequence_greater_than(ack, self.next_ordinal) {
            debug!("ignoring ack {} beyond next ordinal {}", ack, self.next_ordinal);
            return 0;
        }
        let mut popped = 0;
        while let Some(front) = self.window.front() {
            if sequence_less_than(front.ordinal, ack) {
                self.window.pop_front();
                popped += 1;
            } else {
                break;
            }
        }
        popped
    }

    pub fn is_due(&self, now: Instant, resend_interval: Duration) -> bool {
        match self.window.front() {
            Some(oldest) => now.saturating_duration_since(oldest.last_sent) >= resend_interval,
            None => false,
        }
    }

    /// The whole window, stamped as sent again at `now`.
    pub fn resend_all(&mut self, now: Instant) -> impl Iterator<Item = &PendingReliable> {
        for pending in self.window.iter_mut() {
            pending.last_sent = now;
            pending.sends += 1;
        }
        self.window.iter()
    }

    pub fn next_ordinal(&self) -> u32 {
        self.next_ordinal
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Released to the ready queue, possibly along with buffered successors.
    Delivered,
    /// Ahead of a gap; held until the gap fills.
    Buffered,
    /// Already delivered, already buffered, or too far ahead.
    Discarded,
}

#[derive(Debug, Default)]
pub struct ReliableReceiver {
    next_expected: u32,
    out_of_order: HashMap<u32, Message>,
    ready: VecDeque<Message>,
}

impl ReliableReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative ack to send back: every ordinal below this arrived.
    pub fn ack(&self) -> u32 {
        self.next_expected
    }

    pub fn receive(&mut self, ordinal: u32, message: Message) -> ReceiveOutcome {
        let ahead = sequence_diff(ordinal, self.next_expected);
        if ahead < 0 || ahead as u32 > MAX_RELIABLE_AHEAD {
            return ReceiveOutcome::Discarded;
        }
        if ahead > 0 {
            if self.out_of_order.contains_key(&ordinal) {
                return ReceiveOutcome::Discarded;
            }
            self.out_of_order.insert(ordinal, message);
            return ReceiveOutcome::Buffered;
        }

        self.ready.push_back(message);
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.out_of_order.remove(&self.next_expected) {
            self.ready.push_back(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        ReceiveOutcome::Delivered
    }

    pub fn pop_ready(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }
}
