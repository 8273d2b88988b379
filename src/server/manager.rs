//! Connection manager: the fixed array of socket listeners.
//!
//! Accepted sockets are assigned round robin. A slot holds either a parked
//! selector, waiting for its first connection, or a running listener. When a
//! listener drains it vacates its slot and parks its selector again, so the
//! next connection assigned to the slot starts a fresh listener on it.
//!
//! Lock order: the array monitor is taken before any listener monitor, and a
//! listener reports its completion only after releasing its own monitor.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::Protocol;
use crate::net::action::ActionQueue;
use crate::net::buffer::BufferPool;
use crate::reactor::selector::{Selector, SelectorFactory};
use crate::reactor::socket::AcceptedSocket;
use crate::runtime::{Driver, DriverHandle};
use crate::server::heartbeat::Heartbeat;
use crate::server::listener::{ListenerShared, Registration, Rejected, SocketListener};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, trace, warn};

#[derive(Default)]
struct ListenerSlot {
    selector: Option<Selector>,
    active: Option<Arc<ListenerShared>>,
    driver: Option<DriverHandle>,
}

struct ListenerArray {
    slots: Vec<ListenerSlot>,
    cursor: usize,
}

/// Owns the socket listeners of one server and assigns connections to them.
pub struct ConnectionManager<P: Protocol> {
    protocol: Arc<P>,
    config: Arc<ServerConfig>,
    pool: Arc<BufferPool>,
    factory: SelectorFactory,
    listeners: Mutex<ListenerArray>,
    heartbeat: Mutex<Option<DriverHandle>>,
    closed: AtomicBool,
    this: Weak<Self>,
}

impl<P: Protocol> ConnectionManager<P> {
    /// Creates a manager with one empty slot per configured listener.
    ///
    /// No selector is opened and no thread is started until
    /// [`open_socket_selectors`](Self::open_socket_selectors).
    pub fn new(config: Arc<ServerConfig>, protocol: Arc<P>) -> Arc<Self> {
        let slots = (0..config.listener_count.max(1))
            .map(|_| ListenerSlot::default())
            .collect();
        let pool = BufferPool::new(config.write_buffer_size, config.write_pool_capacity);

        Arc::new_cyclic(|this| Self {
            protocol,
            config,
            pool,
            factory: SelectorFactory,
            listeners: Mutex::new(ListenerArray { slots, cursor: 0 }),
            heartbeat: Mutex::new(None),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ListenerArray> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens one selector per listener slot and starts the heartbeat.
    ///
    /// Must run before any connection is handed to the manager.
    ///
    /// # Returns
    /// `Err(Error::Closed)` once closed, or the OS error from opening a selector
    pub fn open_socket_selectors(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut array = self.lock();
        for slot in array.slots.iter_mut() {
            if slot.selector.is_none() && slot.active.is_none() {
                slot.selector = Some(self.factory.create_selector()?);
            }
        }
        let listeners = array.slots.len();
        drop(array);

        let mut heartbeat = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if heartbeat.is_none() {
            let work = Heartbeat::new(self.downgrade(), self.config.heartbeat_interval);
            *heartbeat = Some(Driver::spawn("socket-heartbeat", work)?);
        }

        info!(listeners, "socket selectors opened");
        Ok(())
    }

    /// Assigns an accepted socket to the next listener, round robin.
    ///
    /// A vacant slot, or one whose listener is draining, gets a fresh
    /// listener with the socket as its first connection. A full listener
    /// passes the socket on to the next slot.
    ///
    /// # Returns
    /// `Err(Error::AtCapacity)` when every listener is full, in which case the
    /// socket is closed
    pub fn manage_connection(&self, socket: AcceptedSocket) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut array = self.lock();
        let count = array.slots.len();
        let mut socket = socket;

        for _ in 0..count {
            let index = array.cursor;
            array.cursor = (index + 1) % count;
            let slot = &mut array.slots[index];

            let Some(listener) = slot.active.as_ref() else {
                return self.start_listener(index, slot, socket);
            };

            match listener.register_connection(socket) {
                Ok(()) => return Ok(()),
                Err(Rejected {
                    reason: Registration::Draining,
                    socket,
                }) => return self.start_listener(index, slot, socket),
                Err(Rejected {
                    reason: Registration::AtCapacity,
                    socket: rejected,
                }) => {
                    trace!(listener = index, "socket listener at capacity, trying next");
                    socket = rejected;
                }
            }
        }

        warn!(peer_addr = %socket.peer_addr(), "every socket listener is at capacity, dropping connection");
        Err(Error::AtCapacity { listeners: count })
    }

    /// Starts a listener on `slot` with `socket` as its bootstrap connection.
    fn start_listener(
        &self,
        index: usize,
        slot: &mut ListenerSlot,
        socket: AcceptedSocket,
    ) -> Result<()> {
        let selector = match slot.selector.take() {
            Some(selector) => selector,
            None => self.factory.create_selector()?,
        };

        let actions = Arc::new(ActionQueue::new(selector.waker()));
        let shared = Arc::new(ListenerShared::new(
            index,
            actions,
            self.config.max_connections_per_listener,
        ));
        let listener = SocketListener::new(Arc::clone(&shared), selector, socket, self);
        let driver = Driver::spawn(format!("socket-listener-{index}"), listener)?;

        // A draining predecessor finishes on its own.
        slot.active = Some(shared);
        slot.driver = Some(driver);

        debug!(listener = index, "socket listener started");
        Ok(())
    }

    /// Completion handshake of a listener.
    ///
    /// Vacates the slot if `listener` still occupies it and parks `selector`
    /// for the next listener, unless the manager is closed or the slot
    /// already has one.
    pub(crate) fn listener_finished(
        &self,
        index: usize,
        listener: &Arc<ListenerShared>,
        selector: Option<Selector>,
    ) {
        let mut array = self.lock();
        let Some(slot) = array.slots.get_mut(index) else {
            return;
        };

        if slot
            .active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, listener))
        {
            slot.active = None;
            slot.driver = None;
        }

        if self.is_closed() || slot.selector.is_some() || slot.active.is_some() {
            return;
        }

        slot.selector = match selector {
            Some(selector) => Some(selector),
            None => match self.factory.create_selector() {
                Ok(selector) => Some(selector),
                Err(err) => {
                    warn!(listener = index, ?err, "failed to open replacement selector");
                    None
                }
            },
        };
        trace!(listener = index, "selector parked");
    }

    /// Wakes every running listener so idle connections get their tick.
    pub fn do_heart_beat(&self) {
        let array = self.lock();
        for listener in array.slots.iter().filter_map(|slot| slot.active.as_ref()) {
            listener.do_heart_beat();
        }
    }

    /// Stops the heartbeat, terminates every connection and joins all
    /// listener threads. Calling it again does nothing.
    pub fn close_socket_selectors(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut drivers = Vec::new();

        if let Some(heartbeat) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            heartbeat.stop();
            heartbeat.unpark();
            drivers.push(heartbeat);
        }

        {
            let mut array = self.lock();
            for slot in array.slots.iter_mut() {
                if let Some(listener) = slot.active.take() {
                    listener.shutdown();
                }
                slot.selector = None;
                drivers.extend(slot.driver.take());
            }
        }

        for driver in drivers {
            let name = driver.name().to_owned();
            if let Err(err) = driver.join() {
                error!(thread = %name, %err, "worker did not shut down cleanly");
            }
        }

        info!("socket selectors closed");
    }

    /// Registered connection count of every slot, `0` for vacant slots.
    pub fn registered_counts(&self) -> Vec<usize> {
        self.lock()
            .slots
            .iter()
            .map(|slot| {
                slot.active
                    .as_ref()
                    .map_or(0, |listener| listener.registered_count())
            })
            .collect()
    }

    /// Number of listener slots.
    pub fn listener_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether [`close_socket_selectors`](Self::close_socket_selectors) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pool backing copied write data.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn downgrade(&self) -> Weak<Self> {
        self.this.clone()
    }
}
