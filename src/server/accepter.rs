//! Server socket accepter.
//!
//! Binds the listening socket on a private selector and hands every accepted
//! connection to the [`ConnectionManager`]. Unbinding is cooperative: the
//! controlling thread raises a flag and wakes the selector, and the accepter
//! closes the socket on its own thread once no accept is pending.
//!
//! # Example
//!
//! ```ignore
//! let mut accepter = ServerSocketAccepter::new(&config, address, manager)?;
//! let local_addr = accepter.bind_to_socket()?;
//! let control = accepter.control();
//! let driver = Driver::spawn("socket-accepter", accepter)?;
//!
//! control.unbind_from_socket(local_addr, Duration::from_secs(10), UnbindPolicy::Proceed)?;
//! ```

use crate::config::{ServerConfig, UnbindPolicy};
use crate::error::{Error, Result};
use crate::handler::Protocol;
use crate::reactor::selector::{Selector, SelectorFactory};
use crate::reactor::socket::{AcceptedSocket, SocketOptions, bind_listener};
use crate::runtime::{Work, WorkStatus};
use crate::server::manager::ConnectionManager;

use mio::net::TcpListener;
use mio::{Interest, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn};

const ACCEPT_TOKEN: Token = Token(0);

/// How often an unbinding caller re-checks the accepter.
const UNBIND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Flags shared between the accepter thread and whoever unbinds it.
pub(crate) struct AccepterControl {
    complete: AtomicBool,
    unbound: AtomicBool,
    waker: Arc<Waker>,
}

impl AccepterControl {
    /// Asks the accepter to close its socket and waits for it to confirm.
    ///
    /// # Arguments
    /// * `address` - Bound address, for logs and errors
    /// * `timeout` - How long to wait for the confirmation
    /// * `policy` - What to do if the confirmation does not arrive in time
    ///
    /// # Returns
    /// `Ok(())` once unbound, or after the timeout under [`UnbindPolicy::Proceed`];
    /// `Err(Error::UnbindTimeout)` after the timeout under [`UnbindPolicy::Fail`]
    pub(crate) fn unbind_from_socket(
        &self,
        address: SocketAddr,
        timeout: Duration,
        policy: UnbindPolicy,
    ) -> Result<()> {
        self.complete.store(true, Ordering::Release);
        let started = Instant::now();

        loop {
            if self.is_unbound() {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return match policy {
                    UnbindPolicy::Proceed => {
                        warn!(%address, ?waited, "accepter did not unbind in time, proceeding");
                        Ok(())
                    }
                    UnbindPolicy::Fail => Err(Error::UnbindTimeout { address, waited }),
                };
            }

            if let Err(err) = self.waker.wake() {
                trace!(%address, ?err, "failed to wake accepter");
            }
            thread::sleep(UNBIND_POLL_INTERVAL);
        }
    }

    pub(crate) fn is_unbound(&self) -> bool {
        self.unbound.load(Ordering::Acquire)
    }
}

/// Accepts connections on one address and hands them to the manager.
pub(crate) struct ServerSocketAccepter<P: Protocol> {
    address: SocketAddr,
    backlog: u32,
    options: SocketOptions,
    select_timeout: Duration,
    selector: Option<Selector>,
    listener: Option<TcpListener>,
    manager: Arc<ConnectionManager<P>>,
    control: Arc<AccepterControl>,
}

impl<P: Protocol> ServerSocketAccepter<P> {
    /// Opens the accepter's private selector. Nothing is bound yet.
    pub(crate) fn new(
        config: &ServerConfig,
        address: SocketAddr,
        manager: Arc<ConnectionManager<P>>,
    ) -> io::Result<Self> {
        let selector = SelectorFactory.create_selector()?;
        let control = Arc::new(AccepterControl {
            complete: AtomicBool::new(false),
            unbound: AtomicBool::new(false),
            waker: selector.waker(),
        });

        Ok(Self {
            address,
            backlog: config.backlog,
            options: SocketOptions::from_config(config),
            select_timeout: config.select_timeout,
            selector: Some(selector),
            listener: None,
            manager,
            control,
        })
    }

    /// Binds the listening socket and registers it for accepts.
    ///
    /// # Returns
    /// The bound address (with the actual port when port `0` was requested)
    pub(crate) fn bind_to_socket(&mut self) -> io::Result<SocketAddr> {
        let Some(selector) = self.selector.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "accepter already unbound",
            ));
        };

        let mut listener = bind_listener(self.address, self.backlog)?;
        selector
            .registry()
            .register(&mut listener, ACCEPT_TOKEN, Interest::READABLE)?;

        let local_addr = listener.local_addr()?;
        self.address = local_addr;
        self.listener = Some(listener);

        info!(address = %local_addr, backlog = self.backlog, "accepter bound");
        Ok(local_addr)
    }

    pub(crate) fn control(&self) -> Arc<AccepterControl> {
        Arc::clone(&self.control)
    }

    /// Accepts until the listening socket would block.
    fn accept_pending(&self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = self.options.apply(&stream) {
                        warn!(%peer_addr, ?err, "failed to configure accepted socket");
                        continue;
                    }

                    trace!(%peer_addr, "connection accepted");
                    if let Err(err) = self
                        .manager
                        .manage_connection(AcceptedSocket::new(stream, peer_addr))
                    {
                        warn!(%peer_addr, %err, "connection not assigned");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(err) => {
                    warn!(address = %self.address, ?err, "accept failed");
                    return;
                }
            }
        }
    }

    /// Deregisters and closes the listening socket and the selector.
    fn unbind(&mut self) {
        if let (Some(selector), Some(mut listener)) = (self.selector.as_ref(), self.listener.take())
            && let Err(err) = selector.registry().deregister(&mut listener)
        {
            trace!(address = %self.address, ?err, "deregister failed");
        }

        self.selector = None;
        self.control.unbound.store(true, Ordering::Release);

        info!(address = %self.address, "accepter unbound");
    }
}

impl<P: Protocol> Work for ServerSocketAccepter<P> {
    fn run(&mut self) -> WorkStatus {
        let Some(selector) = self.selector.as_mut() else {
            return WorkStatus::Complete;
        };

        if let Err(err) = selector.select(self.select_timeout) {
            error!(address = %self.address, ?err, "accepter select failed");
            self.unbind();
            return WorkStatus::Complete;
        }

        let accept_ready = selector.selected().contains_key(&ACCEPT_TOKEN);

        if !accept_ready {
            if self.control.complete.load(Ordering::Acquire) {
                self.unbind();
                return WorkStatus::Complete;
            }
            return WorkStatus::Continue;
        }

        self.accept_pending();
        WorkStatus::Continue
    }
}
