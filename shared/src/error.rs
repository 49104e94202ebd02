use crate::message::MessageKind;
use std::time::Duration;
use thiserror::Error;

/// A buffer that does not decode as a message or datagram.
///
/// Always a protocol violation by the sender; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    #[error("unknown message tag {tag}")]
    UnknownTag { tag: u8 },

    #[error("buffer ended while reading {field}")]
    Truncated { field: &'static str },

    #[error("declared payload length {declared} exceeds the remaining {remaining} bytes")]
    LengthOverrun { declared: usize, remaining: usize },

    #[error("varint runs past 5 bytes")]
    VarintOverflow,

    #[error("{kind:?} payload does not decode")]
    BadPayload { kind: MessageKind },

    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("datagram header does not decode")]
    BadHeader,
}

/// Returned by a [`MessageHandler`](crate::connection::MessageHandler) for a
/// kind its role never accepts, e.g. a server receiving `ConnectAccept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0:?} is not accepted by this endpoint")]
pub struct UnsupportedMessage(pub MessageKind);

/// Failures surfaced by a [`Connection`](crate::connection::Connection).
///
/// Everything except [`ConnectionError::MessageTooLarge`] and
/// [`ConnectionError::Encode`] is fatal. After a fatal error the connection
/// refuses further work and the owner must tear it down.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no datagram received for {0:?}")]
    TimedOut(Duration),

    #[error("connection is closed")]
    Closed,

    #[error("outbound queue exceeded {limit} messages")]
    QueueOverflow { limit: usize },

    #[error("{count} consecutive malformed datagrams, last: {last}")]
    MalformedFlood { count: u32, last: MalformedMessage },

    #[error("protocol violation: {0}")]
    Unsupported(#[from] UnsupportedMessage),

    #[error("{kind:?} encodes to {size} bytes, more than one datagram holds")]
    MessageTooLarge { kind: MessageKind, size: usize },

    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConnectionError::MessageTooLarge { .. } | ConnectionError::Encode(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_oversized_messages_are_recoverable() {
        let oversized = ConnectionError::MessageTooLarge {
            kind: MessageKind::Chat,
            size: 9000,
        };
        assert!(!oversized.is_fatal());
        assert!(ConnectionError::Closed.is_fatal());
        assert!(ConnectionError::TimedOut(Duration::from_secs(5)).is_fatal());
        assert!(ConnectionError::QueueOverflow { limit: 4 }.is_fatal());
    }

    #[test]
    fn test_error_message_formatting() {
        let err = ConnectionError::from(UnsupportedMessage(MessageKind::ConnectAccept));
        assert_eq!(
            err.to_string(),
            "protocol violation: ConnectAccept is not accepted by this endpoint"
        );

        let malformed = MalformedMessage::LengthOverrun {
            declared: 40,
            remaining: 3,
        };
        assert!(malformed.to_string().contains("40"));
    }
}
