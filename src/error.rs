//! Error types shared by the accepter, the listeners and the connection manager.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the multiplexed I/O subsystem.
#[derive(Debug, Error)]
pub enum Error {
    /// An operating system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Every socket listener rejected the connection because it is full.
    #[error("all {listeners} socket listeners are at capacity")]
    AtCapacity {
        /// Number of listeners that were tried.
        listeners: usize,
    },

    /// The accepter did not confirm its unbind before the configured ceiling.
    #[error("accepter on {address} did not unbind within {waited:?}")]
    UnbindTimeout {
        /// Address the accepter was bound to.
        address: SocketAddr,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The connection manager has already closed its selectors.
    #[error("connection manager is closed")]
    Closed,

    /// No accepter is bound to the given address.
    #[error("no accepter is bound to {0}")]
    NotBound(SocketAddr),

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A connection handler reported a protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A dedicated worker thread panicked.
    #[error("worker thread `{0}` panicked")]
    WorkerPanicked(String),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Returns `true` when the error means the peer went away.
    ///
    /// Peer-initiated closes are expected during normal operation and are
    /// logged at a lower severity than other failures.
    pub fn is_peer_disconnect(&self) -> bool {
        match self {
            Self::Io(err) => is_peer_disconnect(err),
            _ => false,
        }
    }
}

pub(crate) fn is_peer_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
