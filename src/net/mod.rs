//! Per-connection I/O.
//!
//! - [`connection`]: connection state and the cross-thread [`ConnectionHandle`]
//! - [`write`]: write buffers, write actions and the per-connection queue
//! - [`buffer`]: pooled buffers backing copied write data
//! - `action`: the queue carrying writes and closes to the owning listener
//!
//! [`ConnectionHandle`]: connection::ConnectionHandle

pub(crate) mod action;
pub mod buffer;
pub mod connection;
pub mod write;
