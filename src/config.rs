//! Resolved server configuration.
//!
//! Values arrive here already resolved; loading them from files or the
//! environment is the caller's business. Use [`ServerBuilder`](crate::ServerBuilder)
//! to assemble one fluently.

use crate::error::{Error, Result};

use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

/// Default bound on a single blocking `select`.
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ceiling for the accepter's cooperative unbind.
pub const DEFAULT_UNBIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between heartbeat ticks.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default size of a pooled write buffer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// What [`unbind`](crate::server::Server::unbind) does when the accepter fails
/// to confirm its shutdown within the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnbindPolicy {
    /// Log a warning and carry on with shutdown.
    #[default]
    Proceed,
    /// Report [`Error::UnbindTimeout`].
    Fail,
}

/// Configuration surface of the accepter, the listeners and the manager.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the accepter binds to.
    pub address: SocketAddr,
    /// Number of socket listeners (and listener threads).
    pub listener_count: usize,
    /// Maximum connections per listener, `0` for unbounded.
    pub max_connections_per_listener: usize,
    /// Backlog passed to `listen(2)`.
    pub backlog: u32,
    /// `SO_SNDBUF` for accepted sockets, `0` keeps the OS default.
    pub send_buffer_size: usize,
    /// `SO_RCVBUF` for accepted sockets, `0` keeps the OS default.
    ///
    /// Also sizes each listener's read buffer.
    pub receive_buffer_size: usize,
    /// Interval between heartbeat ticks across all listeners.
    pub heartbeat_interval: Duration,
    /// Upper bound on one blocking `select`.
    pub select_timeout: Duration,
    /// Ceiling for the accepter's cooperative unbind.
    pub unbind_timeout: Duration,
    /// Behaviour when the unbind ceiling is reached.
    pub unbind_policy: UnbindPolicy,
    /// Size of each pooled write buffer.
    pub write_buffer_size: usize,
    /// Maximum number of idle buffers the pool retains.
    pub write_pool_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            listener_count: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            max_connections_per_listener: 0,
            backlog: DEFAULT_BACKLOG,
            send_buffer_size: 0,
            receive_buffer_size: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            unbind_timeout: DEFAULT_UNBIND_TIMEOUT,
            unbind_policy: UnbindPolicy::default(),
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            write_pool_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Checks the configuration for values the subsystem cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.listener_count == 0 {
            return Err(Error::InvalidConfig(
                "at least one socket listener is required".into(),
            ));
        }
        if self.backlog == 0 {
            return Err(Error::InvalidConfig("backlog must be positive".into()));
        }
        if self.write_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "write buffer size must be positive".into(),
            ));
        }
        if self.select_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "select timeout must be positive".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Size of the buffer each listener reads into.
    pub(crate) fn read_buffer_size(&self) -> usize {
        if self.receive_buffer_size == 0 {
            DEFAULT_WRITE_BUFFER_SIZE
        } else {
            self.receive_buffer_size
        }
    }
}
