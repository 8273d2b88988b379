//! Per-socket connection state.
//!
//! A [`Connection`] lives inside exactly one socket listener and is only ever
//! touched by that listener's thread. Everyone else talks to it through a
//! cloneable [`ConnectionHandle`], which turns writes and closes into actions
//! for the owning listener.
//!
//! Lifecycle: open, then closing once a close is requested (queued writes
//! still flush), then terminated (deregistered, socket closed, buffers
//! released).

use crate::error::Result;
use crate::handler::{
    ConnectionContext, ConnectionHandler, IdleContext, Protocol, ReadContext, WriteContext,
};
use crate::net::action::{ActionQueue, ConnectionAction};
use crate::net::buffer::BufferPool;
use crate::net::write::{WriteAction, WriteBuffer, WriteQueue};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Identifies a connection within the process.
///
/// The serial distinguishes connections that reuse the same listener slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    listener: usize,
    index: usize,
    serial: u64,
}

impl ConnectionId {
    pub(crate) fn new(listener: usize, index: usize, serial: u64) -> Self {
        Self {
            listener,
            index,
            serial,
        }
    }

    /// Index of the socket listener that owns the connection.
    pub fn listener(&self) -> usize {
        self.listener
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.index)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.listener, self.serial)
    }
}

/// Cross-thread handle to a connection.
///
/// Writes and closes requested through a handle never perform I/O on the
/// calling thread. They are queued for the owning listener, which executes
/// them on its next wakeup.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    actions: Arc<ActionQueue>,
    pool: Arc<BufferPool>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        actions: Arc<ActionQueue>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            closed: Arc::new(AtomicBool::new(false)),
            actions,
            pool,
        }
    }

    /// The connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether a close has been requested or the connection has terminated.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues `buffers` to be written, in order, after everything queued before.
    ///
    /// Copied slices are coalesced into pooled buffers on the calling thread;
    /// shared buffers are referenced without copying. Writing to a closed
    /// connection does nothing apart from logging a warning.
    pub fn write_data(&self, buffers: &[WriteBuffer<'_>]) {
        if self.is_closed() {
            warn!(connection = %self.id, "write after close ignored");
            return;
        }

        let action = WriteAction::new(&self.pool, buffers);
        self.actions.push(ConnectionAction::Write {
            id: self.id,
            action,
        });
    }

    /// Requests a close: writes queued so far still flush, later writes are ignored.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.actions.push(ConnectionAction::Close { id: self.id });
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Write queue and close flags of a connection.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub(crate) writes: WriteQueue,
    pub(crate) closed: bool,
    pub(crate) terminate_after_writes: bool,
    pub(crate) terminated: bool,
}

impl ConnectionState {
    pub(crate) fn enqueue(&mut self, id: ConnectionId, action: WriteAction) {
        if self.closed {
            warn!(connection = %id, "write after close ignored");
            return;
        }

        self.writes.push(action);
    }

    pub(crate) fn queue_close(&mut self) {
        self.closed = true;
        self.terminate_after_writes = true;
    }
}

/// An accepted socket adopted by a listener, with its protocol handler.
pub(crate) struct Connection<H> {
    handle: ConnectionHandle,
    stream: TcpStream,
    interest: Interest,
    handler: H,
    state: ConnectionState,
    last_activity: Instant,
}

impl<H> Connection<H> {
    pub(crate) fn new(handle: ConnectionHandle, stream: TcpStream, handler: H) -> Self {
        Self {
            handle,
            stream,
            interest: Interest::READABLE,
            handler,
            state: ConnectionState::default(),
            last_activity: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Registers the socket, with `WRITE` interest only if data is already queued.
    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.interest = self.desired_interest();
        let token = self.id().token();
        registry.register(&mut self.stream, token, self.interest)
    }

    /// Re-registers the socket if the wanted interest changed.
    pub(crate) fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.desired_interest();
        if interest == self.interest {
            return Ok(());
        }

        let token = self.id().token();
        registry.reregister(&mut self.stream, token, interest)?;
        self.interest = interest;

        Ok(())
    }

    fn desired_interest(&self) -> Interest {
        if self.state.writes.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    pub(crate) fn enqueue(&mut self, action: WriteAction) {
        self.state.enqueue(self.handle.id, action);
    }

    pub(crate) fn queue_close(&mut self) {
        self.state.queue_close();
        self.handle.mark_closed();
    }

    /// Whether a close was applied or requested through the handle.
    pub(crate) fn is_closed(&self) -> bool {
        self.state.closed || self.handle.is_closed()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state.terminated
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.state.terminate_after_writes
    }

    pub(crate) fn writes_drained(&self) -> bool {
        self.state.writes.is_empty()
    }

    /// Hard stop: closes the socket and drops every queued write.
    ///
    /// Safe to call more than once.
    pub(crate) fn terminate(&mut self, registry: &Registry) {
        if self.state.terminated {
            return;
        }

        self.state.closed = true;
        self.state.terminate_after_writes = true;
        self.state.terminated = true;
        self.handle.mark_closed();

        if let Err(err) = registry.deregister(&mut self.stream) {
            trace!(connection = %self.id(), ?err, "deregister failed");
        }
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            trace!(connection = %self.id(), ?err, "shutdown failed");
        }

        self.state.writes.clear();
    }
}

impl<H> Connection<H> {
    /// Reads until the socket would block, handing each chunk to the handler.
    ///
    /// Stops early once the connection is closed. End of stream is reported
    /// as [`io::ErrorKind::UnexpectedEof`].
    pub(crate) fn read_available<P>(&mut self, buffer: &mut [u8], protocol: &P) -> Result<()>
    where
        P: Protocol<Handler = H>,
        H: ConnectionHandler<P>,
    {
        while !self.is_closed() {
            match self.stream.read(buffer) {
                Ok(0) => {
                    return Err(
                        io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection")
                            .into(),
                    );
                }
                Ok(count) => {
                    trace!(connection = %self.id(), count, "read from socket");
                    self.last_activity = Instant::now();

                    let mut context = ReadContext::new(
                        &buffer[..count],
                        protocol,
                        ConnectionContext::new(&self.handle, &mut self.state),
                    );
                    self.handler.handle_read(&mut context)?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Gives the handler its idle tick for a cycle without readiness.
    pub(crate) fn idle_tick<P>(&mut self) -> Result<()>
    where
        P: Protocol<Handler = H>,
        H: ConnectionHandler<P>,
    {
        let mut context = IdleContext::new(
            self.idle_for(),
            ConnectionContext::new(&self.handle, &mut self.state),
        );
        self.handler.handle_idle_connection(&mut context)
    }

    /// Flushes queued writes; tells the handler when the queue empties.
    ///
    /// # Returns
    /// `true` when nothing is left to write
    pub(crate) fn flush<P>(&mut self) -> Result<bool>
    where
        P: Protocol<Handler = H>,
        H: ConnectionHandler<P>,
    {
        if self.state.writes.is_empty() {
            return Ok(true);
        }

        if !self.state.writes.process(&mut self.stream)? {
            return Ok(false);
        }

        self.last_activity = Instant::now();
        trace!(connection = %self.id(), "write queue drained");

        let mut context = WriteContext::new(ConnectionContext::new(&self.handle, &mut self.state));
        self.handler.handle_write(&mut context)?;

        Ok(self.state.writes.is_empty())
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}
