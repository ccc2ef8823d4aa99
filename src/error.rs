/*!
 * Error Taxonomy
 *
 * Every fallible operation in the crate returns [`Error`]. Format errors mean
 * the byte cursor can no longer be trusted and the whole parse is aborted.
 * I/O errors come from files, sockets and deadlines. Protocol errors are
 * raised during the replication handshake before any data flows.
 */

use std::io;

/// Errors produced while decoding, streaming or loading a snapshot
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unsupported RDB content
    #[error("format error: {0}")]
    Format(String),

    /// Underlying read/write failure, deadline expiry or early end of stream
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected reply during the handshake with a source server
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error reply returned by a destination store
    #[error("destination error: {0}")]
    Destination(String),

    /// The cancel token fired; not a corruption
    #[error("context ended")]
    Cancelled,

    /// The loader stopped admitting records after a worker failed
    #[error("loader stopped after a worker failure")]
    Stopped,
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for building a [`Error::Format`]
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// True when the error signals deliberate shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for errors a caller may reasonably retry
    ///
    /// Destination replies and socket failures qualify; format and protocol
    /// errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Destination(_))
    }
}
