//! Protocol hooks.
//!
//! A [`Protocol`] is shared by every connection of a server. For each accepted
//! socket it creates a [`ConnectionHandler`], which is then called on the
//! owning listener's thread with a context describing what happened:
//!
//! - [`ReadContext`] when bytes arrived,
//! - [`WriteContext`] when the write queue drained,
//! - [`IdleContext`] on cycles in which the connection saw no readiness.
//!
//! Every context dereferences to a [`ConnectionContext`], through which a
//! handler queues writes directly on the connection. Closes always go through
//! the listener's action queue so they land after writes already requested
//! through the handle.
//!
//! # Example
//!
//! ```ignore
//! struct Echo;
//! struct EchoHandler;
//!
//! impl Protocol for Echo {
//!     type Request = ();
//!     type Handler = EchoHandler;
//!
//!     fn create_connection_handler(&self, _: &ConnectionHandle) -> EchoHandler {
//!         EchoHandler
//!     }
//!
//!     fn process_request(&self, _: &ConnectionHandle, _: ()) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! impl ConnectionHandler<Echo> for EchoHandler {
//!     fn handle_read(&mut self, context: &mut ReadContext<'_, Echo>) -> Result<()> {
//!         let data = context.data();
//!         context.write_data(&[WriteBuffer::copy(data)]);
//!         Ok(())
//!     }
//! }
//! ```

use crate::error::Result;
use crate::net::connection::{ConnectionHandle, ConnectionState};
use crate::net::write::{WriteAction, WriteBuffer};

use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Server-wide protocol: creates handlers and processes decoded requests.
pub trait Protocol: Send + Sync + Sized + 'static {
    /// A request decoded by a handler.
    type Request;

    /// Per-connection handler type.
    type Handler: ConnectionHandler<Self>;

    /// Creates the handler for a newly adopted connection.
    fn create_connection_handler(&self, connection: &ConnectionHandle) -> Self::Handler;

    /// Processes one request decoded from `connection`.
    ///
    /// Runs on the listener thread that owns the connection, under the same
    /// restrictions as [`ConnectionHandler`] hooks. An error terminates the
    /// connection.
    fn process_request(&self, connection: &ConnectionHandle, request: Self::Request) -> Result<()>;
}

/// Per-connection protocol state.
///
/// Returning an error from any hook terminates the connection.
///
/// Hooks run on the listener thread while the listener's monitor is held.
/// They must not call back into the
/// [`ConnectionManager`](crate::ConnectionManager) directly: doing so
/// re-enters that monitor or takes the array monitor out of order. Hand such
/// work to another thread and reply through the [`ConnectionHandle`].
pub trait ConnectionHandler<P: Protocol>: Send + 'static {
    /// Called with each chunk of bytes read from the socket.
    fn handle_read(&mut self, context: &mut ReadContext<'_, P>) -> Result<()>;

    /// Called when the write queue drained after a write.
    fn handle_write(&mut self, _context: &mut WriteContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once per listener cycle in which the connection had no readiness.
    fn handle_idle_connection(&mut self, _context: &mut IdleContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Access to the connection from inside a handler hook.
pub struct ConnectionContext<'a> {
    handle: &'a ConnectionHandle,
    state: &'a mut ConnectionState,
}

impl<'a> ConnectionContext<'a> {
    pub(crate) fn new(handle: &'a ConnectionHandle, state: &'a mut ConnectionState) -> Self {
        Self { handle, state }
    }

    /// The handle of the connection, cloneable to other threads.
    pub fn connection(&self) -> &ConnectionHandle {
        self.handle
    }

    /// Queues `buffers` directly on the connection.
    ///
    /// Ignored, with a warning, once the connection is closed.
    pub fn write_data(&mut self, buffers: &[WriteBuffer<'_>]) {
        if self.state.closed || self.handle.is_closed() {
            tracing::warn!(connection = %self.handle.id(), "write after close ignored");
            return;
        }

        let action = WriteAction::new(self.handle.pool(), buffers);
        self.state.enqueue(self.handle.id(), action);
    }

    /// Closes the connection once writes queued so far have flushed.
    ///
    /// The close travels through the listener's action queue, behind any
    /// write already requested through the handle.
    pub fn close(&mut self) {
        self.handle.close();
    }

    /// Whether the connection is closed or closing.
    pub fn is_closed(&self) -> bool {
        self.state.closed || self.handle.is_closed()
    }

    /// Bytes queued and not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.state.writes.pending_bytes()
    }
}

/// Context of [`ConnectionHandler::handle_read`].
pub struct ReadContext<'a, P> {
    data: &'a [u8],
    protocol: &'a P,
    inner: ConnectionContext<'a>,
}

impl<'a, P: Protocol> ReadContext<'a, P> {
    pub(crate) fn new(data: &'a [u8], protocol: &'a P, inner: ConnectionContext<'a>) -> Self {
        Self {
            data,
            protocol,
            inner,
        }
    }

    /// Bytes read by this call. Only valid for the duration of the hook.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Hands a decoded request to [`Protocol::process_request`].
    pub fn process_request(&mut self, request: P::Request) -> Result<()> {
        self.protocol.process_request(self.inner.handle, request)
    }
}

impl<'a, P> Deref for ReadContext<'a, P> {
    type Target = ConnectionContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<P> DerefMut for ReadContext<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Context of [`ConnectionHandler::handle_write`].
pub struct WriteContext<'a> {
    inner: ConnectionContext<'a>,
}

impl<'a> WriteContext<'a> {
    pub(crate) fn new(inner: ConnectionContext<'a>) -> Self {
        Self { inner }
    }
}

impl<'a> Deref for WriteContext<'a> {
    type Target = ConnectionContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for WriteContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Context of [`ConnectionHandler::handle_idle_connection`].
pub struct IdleContext<'a> {
    idle_for: Duration,
    inner: ConnectionContext<'a>,
}

impl<'a> IdleContext<'a> {
    pub(crate) fn new(idle_for: Duration, inner: ConnectionContext<'a>) -> Self {
        Self { idle_for, inner }
    }

    /// Time since the connection last read or finished writing.
    pub fn idle_duration(&self) -> Duration {
        self.idle_for
    }
}

impl<'a> Deref for IdleContext<'a> {
    type Target = ConnectionContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for IdleContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
