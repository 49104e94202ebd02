//! Datagram layout: one header followed by packed message frames.
//!
//! ```text
//! [DatagramHeader (bincode)][frame][frame]...
//! ```
//!
//! Reliable frames inside one datagram carry consecutive ordinals starting at
//! `reliable_start`, so ordinals never need to be written per frame.
//!
//! `session` is chosen by the side that opens the connection and stamped on
//! every datagram in both directions. A new session from a known address
//! means the peer started over.

use crate::codec::WireReader;
use crate::error::MalformedMessage;
use crate::message::{decode, Message};
use serde::{Deserialize, Serialize};

/// Encoded size of a header with an echo present; the packing budget.
pub const MAX_HEADER_LEN: usize = 23;

/// The peer's most recent stamp, reflected back with how long it was held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoStamp {
    pub stamp: u32,
    pub held_ms: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramHeader {
    pub session: u32,
    /// Every reliable ordinal below this has been received.
    pub ack: u32,
    /// Ordinal of the first reliable frame in this datagram.
    pub reliable_start: u32,
    /// Sender's clock in milliseconds since its connection began.
    pub stamp: u32,
    pub echo: Option<EchoStamp>,
}

#[derive(Debug)]
pub struct DecodedDatagram {
    pub header: DatagramHeader,
    /// Frames decoded before the end of the datagram or the first error.
    pub messages: Vec<Message>,
    /// Set when decoding stopped early; the remainder was discarded.
    pub error: Option<MalformedMessage>,
}

/// Reads only the header, leaving the frames untouched.
pub fn peek_header(bytes: &[u8]) -> Result<DatagramHeader, MalformedMessage> {
    let mut rest = bytes;
    bincode::deserialize_from(&mut rest).map_err(|_| MalformedMessage::BadHeader)
}

/// Splits a datagram into its header and frames.
///
/// Only a bad header fails outright. A bad frame keeps everything decoded
/// before it and reports the error alongside.
pub fn decode_datagram(bytes: &[u8]) -> Result<DecodedDatagram, MalformedMessage> {
    let mut rest = bytes;
    let header: DatagramHeader =
        bincode::deserialize_from(&mut rest).map_err(|_| MalformedMessage::BadHeader)?;

    let mut reader = WireReader::new(rest);
    let mut messages = Vec::new();
    let mut error = None;
    while !reader.is_empty() {
        match decode(&mut reader) {
            Ok(message) => messages.push(message),
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    Ok(DecodedDatagram {
        header,
        messages,
        error,
    })
}

#[derive(Debug, Default)]
struct PendingDatagram {
    body: Vec<u8>,
    reliable_start: Option<u32>,
    next_reliable: u32,
}

/// Packs frames, in the order given, into datagrams no larger than the
/// configured maximum.
#[derive(Debug)]
pub struct DatagramPacker {
    budget: usize,
    done: Vec<PendingDatagram>,
    current: PendingDatagram,
}

impl DatagramPacker {
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            budget: max_datagram_size.saturating_sub(MAX_HEADER_LEN),
            done: Vec::new(),
            current: PendingDatagram::default(),
        }
    }

    /// Largest frame that fits in a datagram on its own.
    pub fn frame_budget(&self) -> usize {
        self.budget
    }

    /// Appends a frame. `reliable_ordinal` is `Some` for reliable frames.
    pub fn push(&mut self, frame: &[u8], reliable_ordinal: Option<u32>) {
        let overflows = self.current.body.len() + frame.len() > self.budget;
        let breaks_run = match (reliable_ordinal, self.current.reliable_start) {
            (Some(ordinal), Some(_)) => ordinal != self.current.next_reliable,
            _ => false,
        };
        if (overflows || breaks_run) && !self.current.body.is_empty() {
            self.done.push(std::mem::take(&mut self.current));
        }

        if let Some(ordinal) = reliable_ordinal {
            if self.current.reliable_start.is_none() {
                self.current.reliable_start = Some(ordinal);
            }
            self.current.next_reliable = ordinal.wrapping_add(1);
        }
        self.current.body.extend_from_slice(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty() && self.current.body.is_empty()
    }

    /// Prefixes each datagram with a copy of `header`, its `reliable_start`
    /// replaced by the datagram's first reliable ordinal. Datagrams without
    /// reliable frames keep the template's value.
    pub fn finish(mut self, header: DatagramHeader) -> Result<Vec<Vec<u8>>, bincode::Error> {
        if !self.current.body.is_empty() {
            self.done.push(self.current);
        }

        let mut datagrams = Vec::with_capacity(self.done.len());
        for pending in self.done {
            let header = DatagramHeader {
                reliable_start: pending.reliable_start.unwrap_or(header.reliable_start),
                ..header
            };
            let mut bytes = Vec::with_capacity(MAX_HEADER_LEN + pending.body.len());
            bincode::serialize_into(&mut bytes, &header)?;
            bytes.extend_from_slice(&pending.body);
            datagrams.push(bytes);
        }
        Ok(datagrams)
    }
}

/// A header-only datagram, used for bare acks and heartbeats.
pub fn empty_datagram(header: &DatagramHeader) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Chat;
    use crate::types::{EntityId, PlayerId};

    fn header() -> DatagramHeader {
        DatagramHeader {
            session: 0xdead_beef,
            ack: 3,
            reliable_start: 10,
            stamp: 500,
            echo: Some(EchoStamp {
                stamp: 480,
                held_ms: 4,
            }),
        }
    }

    fn template(next_ordinal: u32) -> DatagramHeader {
        DatagramHeader {
            session: 1,
            ack: 0,
            reliable_start: next_ordinal,
            stamp: 0,
            echo: None,
        }
    }

    fn frame(message: &Message) -> Vec<u8> {
        message.to_bytes().unwrap()
    }

    #[test]
    fn test_max_header_len_matches_encoding() {
        assert_eq!(bincode::serialize(&header()).unwrap().len(), MAX_HEADER_LEN);
        let bare = DatagramHeader {
            echo: None,
            ..header()
        };
        assert!(bincode::serialize(&bare).unwrap().len() < MAX_HEADER_LEN);
    }

    #[test]
    fn test_header_only_datagram_decodes_empty() {
        let bytes = empty_datagram(&header()).unwrap();
        let decoded = decode_datagram(&bytes).unwrap();
        assert_eq!(decoded.header, header());
        assert!(decoded.messages.is_empty());
        assert!(decoded.error.is_none());
    }

    #[test]
    fn test_peek_header_ignores_frames() {
        let mut bytes = empty_datagram(&header()).unwrap();
        bytes.extend([0xfe, 0x00]);
        assert_eq!(peek_header(&bytes).unwrap(), header());
        assert!(decode_datagram(&bytes).unwrap().error.is_some());
    }

    #[test]
    fn test_bad_header_rejects_datagram() {
        assert_eq!(
            decode_datagram(&[1, 2, 3]).unwrap_err(),
            MalformedMessage::BadHeader
        );
    }

    #[test]
    fn test_frames_before_an_error_survive() {
        let mut bytes = empty_datagram(&header()).unwrap();
        bytes.extend(frame(&Message::EntityRemove(EntityId(4))));
        bytes.extend(frame(&Message::ServerQuit));
        bytes.extend([0xfe, 0x00, 0x00]);
        bytes.extend(frame(&Message::ClientSynced));

        let decoded = decode_datagram(&bytes).unwrap();
        assert_eq!(
            decoded.messages,
            vec![Message::EntityRemove(EntityId(4)), Message::ServerQuit]
        );
        assert_eq!(decoded.error, Some(MalformedMessage::UnknownTag { tag: 0xfe }));
    }

    #[test]
    fn test_packer_splits_at_budget() {
        let chat = Message::Chat(Chat {
            player: PlayerId(1),
            text: "x".repeat(100),
        });
        let chat_frame = frame(&chat);
        let mut packer = DatagramPacker::new(MAX_HEADER_LEN + chat_frame.len() * 2);
        for ordinal in 0..5 {
            packer.push(&chat_frame, Some(ordinal));
        }
        let datagrams = packer.finish(template(5)).unwrap();
        assert_eq!(datagrams.len(), 3);

        let starts: Vec<u32> = datagrams
            .iter()
            .map(|d| decode_datagram(d).unwrap().header.reliable_start)
            .collect();
        assert_eq!(starts, vec![0, 2, 4]);
        for datagram in &datagrams {
            assert!(datagram.len() <= MAX_HEADER_LEN + chat_frame.len() * 2);
        }
    }

    #[test]
    fn test_packer_breaks_on_ordinal_gap() {
        let quit = frame(&Message::ServerQuit);
        let mut packer = DatagramPacker::new(1200);
        packer.push(&quit, Some(3));
        packer.push(&quit, Some(7));
        let datagrams = packer.finish(template(8)).unwrap();
        assert_eq!(datagrams.len(), 2);
    }

    #[test]
    fn test_unreliable_only_datagram_reports_next_ordinal() {
        let update = frame(&Message::EntityCollision(crate::message::EntityCollision {
            sequence: 1,
            entity: EntityId(1),
            other: EntityId(2),
            impulse: 1.0,
        }));
        let mut packer = DatagramPacker::new(1200);
        packer.push(&update, None);
        let datagrams = packer.finish(template(42)).unwrap();
        assert_eq!(decode_datagram(&datagrams[0]).unwrap().header.reliable_start, 42);
    }
}
