//! Error types for the wire codec and the peer session.

use std::io;

use thiserror::Error;

use crate::session::Phase;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while framing, decoding or driving a session.
///
/// The session treats every error it sees as fatal for the connection, except
/// [`Error::UnknownCommand`] which the dispatcher swallows and
/// [`Error::ProtocolSequence`] which is logged and dropped during the handshake.
#[derive(Debug, Error)]
pub enum Error {
    /// Zero bytes were available where the next envelope should start.
    #[error("connection reset: no magic bytes read")]
    ConnectionReset,

    #[error("magic mismatch: expected {}, got {}", hex::encode(expected), hex::encode(actual))]
    MagicMismatch { expected: [u8; 4], actual: [u8; 4] },

    /// The stream ended inside the 24-byte envelope header.
    #[error("truncated envelope header")]
    TruncatedHeader,

    #[error("truncated payload: expected {expected} bytes, received {received}")]
    TruncatedPayload { expected: u32, received: u64 },

    /// A payload ended before the named field could be read.
    #[error("truncated input while reading {0}")]
    TruncatedInput(&'static str),

    #[error("checksum mismatch: header says {}, payload hashes to {}", hex::encode(expected), hex::encode(actual))]
    ChecksumMismatch { expected: [u8; 4], actual: [u8; 4] },

    #[error("command is {0} bytes, at most 12 allowed")]
    CommandTooLong(usize),

    #[error("payload of {0} bytes does not fit a 32-bit length")]
    PayloadTooLarge(usize),

    #[error("value {value} does not fit in {width} bytes")]
    ValueTooLarge { value: u128, width: usize },

    #[error("integer width must be 1..=8 bytes, got {0}")]
    InvalidWidth(usize),

    #[error("varint is not in its shortest form")]
    NonCanonicalVarint,

    #[error("{what}: {count} entries exceeds the limit of {limit}")]
    LimitExceeded {
        what: &'static str,
        count: u64,
        limit: u64,
    },

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("unexpected {command:?} message while {phase:?}")]
    ProtocolSequence { phase: Phase, command: String },

    #[error("session is closed")]
    SessionClosed,

    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
}

/// Coarse grouping of [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Magic mismatch, truncated header/payload/field, connection reset.
    Framing,
    Checksum,
    /// Command too long, payload too large, integer out of range, limits.
    EncodingConstraint,
    UnknownCommand,
    ProtocolSequence,
    Io,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ConnectionReset
            | Error::MagicMismatch { .. }
            | Error::TruncatedHeader
            | Error::TruncatedPayload { .. }
            | Error::TruncatedInput(_) => ErrorCategory::Framing,
            Error::ChecksumMismatch { .. } => ErrorCategory::Checksum,
            Error::CommandTooLong(_)
            | Error::PayloadTooLarge(_)
            | Error::ValueTooLarge { .. }
            | Error::InvalidWidth(_)
            | Error::NonCanonicalVarint
            | Error::LimitExceeded { .. } => ErrorCategory::EncodingConstraint,
            Error::UnknownCommand(_) => ErrorCategory::UnknownCommand,
            Error::ProtocolSequence { .. } => ErrorCategory::ProtocolSequence,
            Error::SessionClosed | Error::Io(_) => ErrorCategory::Io,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Maps an I/O error met while reading `context` into a decode error.
///
/// End-of-input becomes [`Error::TruncatedInput`], anything else stays an I/O error.
pub(crate) fn eof(context: &'static str) -> impl Fn(io::Error) -> Error {
    move |err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::TruncatedInput(context)
        } else {
            Error::Io(err)
        }
    }
}
