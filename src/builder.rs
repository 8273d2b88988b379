//! Fluent builder for server construction.
//!
//! Provides a builder pattern interface for assembling a [`ServerConfig`] and
//! the [`Server`] that runs it.

use crate::config::{ServerConfig, UnbindPolicy};
use crate::error::Result;
use crate::handler::Protocol;
use crate::server::Server;

use std::net::SocketAddr;
use std::time::Duration;

/// Builder for constructing [`Server`] instances with a fluent API.
///
/// Every setter consumes and returns the builder. Unset values fall back to
/// [`ServerConfig::default`].
///
/// # Example
/// ```ignore
/// let server = ServerBuilder::new()
///     .address("127.0.0.1:8080".parse()?)
///     .listeners(4)
///     .build(EchoProtocol)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Creates a new builder holding the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the address the accepter binds to.
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.config.address = address;
        self
    }

    /// Sets the number of socket listeners.
    pub fn listeners(mut self, count: usize) -> Self {
        self.config.listener_count = count;
        self
    }

    /// Caps the connections a single listener accepts, `0` for unbounded.
    pub fn max_connections_per_listener(mut self, max: usize) -> Self {
        self.config.max_connections_per_listener = max;
        self
    }

    /// Sets the `listen(2)` backlog.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Sets `SO_SNDBUF` for accepted sockets.
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.config.send_buffer_size = size;
        self
    }

    /// Sets `SO_RCVBUF` for accepted sockets and the listener read buffer size.
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.config.receive_buffer_size = size;
        self
    }

    /// Sets the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Sets the upper bound on one blocking `select`.
    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.config.select_timeout = timeout;
        self
    }

    /// Sets how long unbinding waits for the accepter and what happens after.
    pub fn unbind(mut self, timeout: Duration, policy: UnbindPolicy) -> Self {
        self.config.unbind_timeout = timeout;
        self.config.unbind_policy = policy;
        self
    }

    /// Sets the pooled write buffer size and how many idle buffers are kept.
    pub fn write_pool(mut self, buffer_size: usize, capacity: usize) -> Self {
        self.config.write_buffer_size = buffer_size;
        self.config.write_pool_capacity = capacity;
        self
    }

    /// Validates and returns the assembled configuration.
    pub fn config(self) -> Result<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Builds a [`Server`] serving `protocol` with the current configuration.
    ///
    /// Nothing is bound yet; call [`Server::bind`] to start accepting.
    ///
    /// # Example
    /// ```ignore
    /// let server = ServerBuilder::new().listeners(2).build(EchoProtocol)?;
    /// let addr = server.bind()?;
    /// ```
    pub fn build<P: Protocol>(self, protocol: P) -> Result<Server<P>> {
        Ok(Server::new(self.config()?, protocol))
    }
}
