//! Error types shared by the transport, the payload codec and the client.
//!
//! Negative application results (wrong password, duplicate username, absent
//! key) are not errors and never show up here: they travel as `false` or
//! `None` inside a successful response.

use std::io;

use thiserror::Error;

use crate::frame::RequestKind;

/// Failures while encoding or decoding a request/response payload.
#[derive(Debug, Error)]
pub enum WireError {
    /// The payload ended before a field could be read in full.
    #[error("payload truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    /// A length prefix was negative where only an absent marker (-1) is allowed, or not at all.
    #[error("invalid length prefix {0}")]
    InvalidLength(i32),

    #[error("string field is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Strings carry a `u16` length prefix.
    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),

    #[error("value of {0} bytes does not fit an i32 length prefix")]
    ValueTooLong(usize),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("unknown request kind {0}")]
    UnknownKind(u16),

    /// Fire-and-forget kinds have no response payload to decode.
    #[error("request kind {0:?} has no response")]
    NoResponse(RequestKind),
}

/// Failures of a tagged connection or of the demultiplexer on top of it.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer closed the stream, or the connection was closed locally.
    #[error("connection closed")]
    Closed,

    /// A frame header carried a length the codec refuses to read.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// No frame arrived for the tag within the caller's bound.
    #[error("timed out waiting for a response")]
    TimedOut,

    #[error("connection i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Failures surfaced to callers of [`crate::client::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid payload: {0}")]
    Wire(#[from] WireError),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Connection(ConnectionError::Io(err))
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The session that issued a conditional read went away while it was waiting.
    #[error("conditional read cancelled")]
    Cancelled,
}
