//! Selector-driven TCP accept and multiplexed connection I/O.
//!
//! A dedicated accepter thread binds a listening socket and hands accepted
//! connections, round robin, to a fixed pool of socket listeners. Each
//! listener runs its own event loop over a readiness selector, reading into
//! the protocol's connection handlers and flushing their write queues.
//! Writes and closes requested from any thread are queued for the owning
//! listener, so a socket is only ever touched by one thread.
//!
//! # Architecture
//!
//! - **Server**: binds ports and owns the connection manager's lifetime
//! - **ServerSocketAccepter**: accepts on a private selector
//! - **ConnectionManager**: the listener array, round robin and heartbeat
//! - **SocketListener**: per-thread loop owning a set of connections
//! - **Connection**: write queue, close and terminate of one socket
//! - **Protocol / ConnectionHandler**: the hooks user code implements
//!
//! # Example
//!
//! ```ignore
//! let server = ServerBuilder::new()
//!     .listeners(4)
//!     .build(EchoProtocol)?;
//! let address = server.bind()?;
//! ```

mod builder;
pub mod config;
pub mod error;
pub mod handler;
pub mod net;
pub mod reactor;
pub mod runtime;
pub mod server;
mod utils;

pub use builder::ServerBuilder;
pub use config::{ServerConfig, UnbindPolicy};
pub use error::{Error, Result};
pub use handler::{
    ConnectionContext, ConnectionHandler, IdleContext, Protocol, ReadContext, WriteContext,
};
pub use net::buffer::BufferPool;
pub use net::connection::{ConnectionHandle, ConnectionId};
pub use net::write::{WriteAction, WriteBuffer, WriteQueue};
pub use reactor::socket::AcceptedSocket;
pub use server::Server;
pub use server::manager::ConnectionManager;
