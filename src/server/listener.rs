//! Socket listener: the per-thread event loop.
//!
//! Each listener owns a selector and the connections assigned to it. The
//! half other threads see, [`ListenerShared`], carries the monitor (state,
//! registered count, sockets waiting to be adopted) and the action queue
//! through which writes and closes reach the loop thread.
//!
//! A listener starts with one bootstrap socket and completes once its
//! registered count drops to zero, handing its selector back to the
//! connection manager for reuse.

use crate::error::{Error, Result};
use crate::handler::Protocol;
use crate::net::action::{ActionQueue, ConnectionAction};
use crate::net::buffer::BufferPool;
use crate::net::connection::{Connection, ConnectionHandle, ConnectionId};
use crate::reactor::selector::{Readiness, Selector};
use crate::reactor::socket::AcceptedSocket;
use crate::runtime::{Work, WorkStatus};
use crate::server::manager::ConnectionManager;
use crate::utils::slab::Slab;

use mio::{Registry, Token};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Lifecycle of a listener as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerState {
    /// Accepting new connections.
    Running,
    /// Every connection terminated; the listener is completing.
    Draining,
    /// Shutdown requested; connections are being terminated.
    Closing,
}

/// Why a listener refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    Draining,
    AtCapacity,
}

/// A refused connection, handed back to the caller.
#[derive(Debug)]
pub(crate) struct Rejected {
    pub(crate) reason: Registration,
    pub(crate) socket: AcceptedSocket,
}

pub(crate) struct ListenerMonitor {
    state: ListenerState,
    registered: i64,
    pending: Vec<AcceptedSocket>,
}

/// The thread-safe half of a socket listener.
pub(crate) struct ListenerShared {
    index: usize,
    monitor: Mutex<ListenerMonitor>,
    actions: Arc<ActionQueue>,
    max_connections: usize,
}

impl ListenerShared {
    /// Creates the shared half of a listener about to adopt its bootstrap socket.
    ///
    /// The bootstrap socket is already counted as registered.
    ///
    /// # Arguments
    /// * `index` - Slot of the listener in the manager's array
    /// * `actions` - Queue woken through the listener's selector
    /// * `max_connections` - Capacity, `0` for unbounded
    pub(crate) fn new(index: usize, actions: Arc<ActionQueue>, max_connections: usize) -> Self {
        Self {
            index,
            monitor: Mutex::new(ListenerMonitor {
                state: ListenerState::Running,
                registered: 1,
                pending: Vec::new(),
            }),
            actions,
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `socket` for adoption by the loop thread.
    ///
    /// # Returns
    /// The socket back if the listener is draining, closing or full
    pub(crate) fn register_connection(&self, socket: AcceptedSocket) -> Result<(), Rejected> {
        let mut monitor = self.lock();

        if monitor.state != ListenerState::Running || monitor.registered <= 0 {
            return Err(Rejected {
                reason: Registration::Draining,
                socket,
            });
        }
        if self.max_connections > 0 && monitor.registered as usize >= self.max_connections {
            return Err(Rejected {
                reason: Registration::AtCapacity,
                socket,
            });
        }

        trace!(listener = self.index, peer_addr = %socket.peer_addr(), "connection registered");
        monitor.pending.push(socket);
        monitor.registered += 1;
        drop(monitor);

        self.actions.wake();
        Ok(())
    }

    /// Wakes the loop so idle connections get their tick.
    pub(crate) fn do_heart_beat(&self) {
        self.actions.wake();
    }

    /// Asks the loop to terminate every connection and complete.
    pub(crate) fn shutdown(&self) {
        let mut monitor = self.lock();
        if monitor.state == ListenerState::Running {
            monitor.state = ListenerState::Closing;
        }
        drop(monitor);

        self.actions.wake();
    }

    /// Connections assigned to the listener and not yet terminated.
    pub(crate) fn registered_count(&self) -> usize {
        self.lock().registered.max(0) as usize
    }
}

/// The loop-thread half of a socket listener.
pub(crate) struct SocketListener<P: Protocol> {
    shared: Arc<ListenerShared>,
    selector: Option<Selector>,
    bootstrap: Option<AcceptedSocket>,
    connections: Slab<Connection<P::Handler>>,
    protocol: Arc<P>,
    pool: Arc<BufferPool>,
    read_buffer: Vec<u8>,
    select_timeout: Duration,
    next_serial: u64,
    manager: Weak<ConnectionManager<P>>,
}

impl<P: Protocol> SocketListener<P> {
    pub(crate) fn new(
        shared: Arc<ListenerShared>,
        selector: Selector,
        bootstrap: AcceptedSocket,
        manager: &ConnectionManager<P>,
    ) -> Self {
        let config = manager.config();

        Self {
            shared,
            selector: Some(selector),
            bootstrap: Some(bootstrap),
            connections: Slab::new(),
            protocol: Arc::clone(manager.protocol()),
            pool: Arc::clone(manager.pool()),
            read_buffer: vec![0; config.read_buffer_size()],
            select_timeout: config.select_timeout,
            next_serial: 0,
            manager: manager.downgrade(),
        }
    }

    fn select(&mut self) -> bool {
        let Some(selector) = self.selector.as_mut() else {
            return false;
        };

        match selector.select(self.select_timeout) {
            Ok(count) => {
                trace!(listener = self.shared.index, count, "selected");
                true
            }
            Err(err) => {
                error!(listener = self.shared.index, ?err, "select failed, closing listener");
                false
            }
        }
    }

    /// Executes writes and closes queued by other threads, in order.
    fn apply_actions(&mut self) {
        for action in self.shared.actions.drain() {
            let id = match &action {
                ConnectionAction::Write { id, .. } | ConnectionAction::Close { id } => *id,
            };

            let Some(connection) = self
                .connections
                .get_mut(id.index())
                .filter(|connection| connection.id() == id)
            else {
                trace!(listener = self.shared.index, connection = %id, "action for finished connection dropped");
                continue;
            };

            match action {
                ConnectionAction::Write { action, .. } => connection.enqueue(action),
                ConnectionAction::Close { .. } => connection.queue_close(),
            }
        }
    }

    /// Turns an accepted socket into a registered connection.
    fn adopt(&mut self, socket: AcceptedSocket, monitor: &mut ListenerMonitor) {
        let Some(selector) = self.selector.as_ref() else {
            monitor.registered -= 1;
            return;
        };

        let listener = self.shared.index;
        let serial = self.next_serial;
        self.next_serial += 1;

        let AcceptedSocket { stream, peer_addr } = socket;
        let index = self.connections.insert_with(|index| {
            let handle = ConnectionHandle::new(
                ConnectionId::new(listener, index, serial),
                peer_addr,
                Arc::clone(&self.shared.actions),
                Arc::clone(&self.pool),
            );
            let handler = self.protocol.create_connection_handler(&handle);
            Connection::new(handle, stream, handler)
        });

        let Some(connection) = self.connections.get_mut(index) else {
            return;
        };

        match connection.register(selector.registry()) {
            Ok(()) => {
                debug!(listener, connection = %connection.id(), %peer_addr, "connection adopted");
            }
            Err(err) => {
                warn!(listener, %peer_addr, ?err, "failed to register connection");
                connection.terminate(selector.registry());
                self.connections.remove(index);
                monitor.registered -= 1;
            }
        }
    }

    /// Services every registered connection once.
    fn process_keys(&mut self, monitor: &mut ListenerMonitor) {
        let Some(selector) = self.selector.as_ref() else {
            return;
        };
        let registry = selector.registry();
        let ready = selector.selected();

        for index in self.connections.indices() {
            let Some(connection) = self.connections.get_mut(index) else {
                continue;
            };

            let outcome = service::<P>(
                connection,
                ready.get(&Token(index)),
                &mut self.read_buffer,
                &self.protocol,
                registry,
            );
            if let Err(err) = outcome {
                log_failure(connection.id(), &err);
                connection.terminate(registry);
            } else if connection.close_requested() && connection.writes_drained() {
                debug!(connection = %connection.id(), "connection closed");
                connection.terminate(registry);
            }

            if connection.is_terminated() {
                self.connections.remove(index);
                monitor.registered -= 1;
            }
        }
    }

    fn terminate_all(&mut self, monitor: &mut ListenerMonitor) {
        let dropped = monitor.pending.len();
        monitor.pending.clear();
        monitor.registered -= dropped as i64;

        let Some(selector) = self.selector.as_ref() else {
            return;
        };

        for index in self.connections.indices() {
            if let Some(mut connection) = self.connections.remove(index) {
                connection.terminate(selector.registry());
                monitor.registered -= 1;
            }
        }
    }

    /// Leaves the loop and hands the selector back to the manager.
    fn finish(&mut self, recycle: bool) -> WorkStatus {
        let selector = self.selector.take().filter(|_| recycle);

        debug!(listener = self.shared.index, "socket listener completed");
        if let Some(manager) = self.manager.upgrade() {
            manager.listener_finished(self.shared.index, &self.shared, selector);
        }

        WorkStatus::Complete
    }
}

impl<P: Protocol> Work for SocketListener<P> {
    fn run(&mut self) -> WorkStatus {
        if let Some(socket) = self.bootstrap.take() {
            let shared = Arc::clone(&self.shared);
            let mut monitor = shared.lock();
            self.adopt(socket, &mut monitor);
        }

        let selected = self.select();
        self.apply_actions();

        let shared = Arc::clone(&self.shared);
        let mut monitor = shared.lock();
        if !selected {
            monitor.state = ListenerState::Closing;
        }

        if monitor.state == ListenerState::Closing {
            self.terminate_all(&mut monitor);
        } else {
            self.process_keys(&mut monitor);

            let pending = std::mem::take(&mut monitor.pending);
            for socket in pending {
                self.adopt(socket, &mut monitor);
            }
        }

        if monitor.registered > 0 {
            return WorkStatus::Continue;
        }

        monitor.registered = 0;
        if monitor.state == ListenerState::Running {
            monitor.state = ListenerState::Draining;
        }
        drop(monitor);

        self.finish(selected)
    }
}

/// Reads, ticks and flushes one connection.
fn service<P: Protocol>(
    connection: &mut Connection<P::Handler>,
    readiness: Option<&Readiness>,
    buffer: &mut [u8],
    protocol: &P,
    registry: &Registry,
) -> Result<()> {
    match readiness {
        Some(readiness) if readiness.readable && !connection.is_closed() => {
            connection.read_available(buffer, protocol)?;
        }
        Some(_) => {}
        None if connection.is_closed() => {}
        None => connection.idle_tick::<P>()?,
    }

    connection.flush::<P>()?;
    connection.update_interest(registry)?;

    Ok(())
}

fn log_failure(id: ConnectionId, err: &Error) {
    if err.is_peer_disconnect() {
        debug!(connection = %id, %err, "peer closed connection");
    } else {
        warn!(connection = %id, %err, "connection failed");
    }
}
