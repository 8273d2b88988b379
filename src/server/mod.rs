//! Server bootstrap: binding ports and tearing them down.
//!
//! A [`Server`] owns the configuration, the protocol and the registry of its
//! connection manager. Each [`bind`](Server::bind) starts an accepter on a
//! dedicated thread; the first bind opens the manager's selectors and the
//! last unbind closes them.
//!
//! # Example
//!
//! ```ignore
//! let server = ServerBuilder::new().listeners(2).build(EchoProtocol)?;
//! let address = server.bind()?;
//! // ... serve traffic ...
//! server.shutdown()?;
//! ```

pub(crate) mod accepter;
pub(crate) mod heartbeat;
pub(crate) mod listener;
pub mod manager;
pub(crate) mod registry;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::Protocol;
use crate::runtime::{Driver, DriverHandle};

use accepter::{AccepterControl, ServerSocketAccepter};
use manager::ConnectionManager;
use registry::ManagerRegistry;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// A running accepter and its thread.
pub(crate) struct BoundPort {
    control: Arc<AccepterControl>,
    driver: DriverHandle,
}

/// Accepts connections on one or more ports and serves them with `P`.
pub struct Server<P: Protocol> {
    config: Arc<ServerConfig>,
    registry: ManagerRegistry<P>,
    ports: Mutex<HashMap<SocketAddr, BoundPort>>,
}

impl<P: Protocol> Server<P> {
    /// Creates a server; nothing is bound or started yet.
    ///
    /// The configuration is expected to be validated, which
    /// [`ServerBuilder`](crate::ServerBuilder) does.
    pub fn new(config: ServerConfig, protocol: P) -> Self {
        let config = Arc::new(config);

        Self {
            registry: ManagerRegistry::new(Arc::clone(&config), Arc::new(protocol)),
            config,
            ports: Mutex::new(HashMap::new()),
        }
    }

    fn ports(&self) -> MutexGuard<'_, HashMap<SocketAddr, BoundPort>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the configured address.
    ///
    /// # Returns
    /// The bound address, with the actual port if port `0` was configured
    pub fn bind(&self) -> Result<SocketAddr> {
        self.bind_to(self.config.address)
    }

    /// Binds `address` and starts accepting on it.
    ///
    /// # Arguments
    /// * `address` - Address to bind, port `0` picks a free port
    ///
    /// # Returns
    /// The bound address, or the error from opening selectors or binding
    pub fn bind_to(&self, address: SocketAddr) -> Result<SocketAddr> {
        let manager = self.registry.acquire()?;

        match self.start_accepter(address, manager) {
            Ok((local_addr, port)) => {
                self.ports().insert(local_addr, port);
                info!(address = %local_addr, "server bound");
                Ok(local_addr)
            }
            Err(err) => {
                self.registry.release();
                Err(err)
            }
        }
    }

    fn start_accepter(
        &self,
        address: SocketAddr,
        manager: Arc<ConnectionManager<P>>,
    ) -> Result<(SocketAddr, BoundPort)> {
        let mut accepter = ServerSocketAccepter::new(&self.config, address, manager)?;
        let local_addr = accepter.bind_to_socket()?;
        let control = accepter.control();
        let driver = Driver::spawn(format!("socket-accepter-{}", local_addr.port()), accepter)?;

        Ok((local_addr, BoundPort { control, driver }))
    }

    /// Stops accepting on `address`.
    ///
    /// Connections already accepted keep running until the last port is
    /// unbound, which closes every listener.
    ///
    /// # Returns
    /// `Err(Error::NotBound)` for an unknown address, or
    /// `Err(Error::UnbindTimeout)` under [`UnbindPolicy::Fail`](crate::UnbindPolicy::Fail)
    pub fn unbind(&self, address: SocketAddr) -> Result<()> {
        let port = self
            .ports()
            .remove(&address)
            .ok_or(Error::NotBound(address))?;

        let result = port.control.unbind_from_socket(
            address,
            self.config.unbind_timeout,
            self.config.unbind_policy,
        );

        if port.control.is_unbound() {
            if let Err(err) = port.driver.join() {
                error!(%address, %err, "accepter thread failed");
            }
        } else {
            port.driver.stop();
        }

        self.registry.release();
        info!(%address, "server unbound");

        result
    }

    /// Unbinds every port, closing all listeners and connections.
    ///
    /// # Returns
    /// The first unbind error, after every port was attempted
    pub fn shutdown(&self) -> Result<()> {
        let addresses: Vec<SocketAddr> = self.ports().keys().copied().collect();
        let mut outcome = Ok(());

        for address in addresses {
            if let Err(err) = self.unbind(address)
                && outcome.is_ok()
            {
                outcome = Err(err);
            }
        }

        outcome
    }

    /// Addresses currently bound.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.ports().keys().copied().collect()
    }

    /// The live connection manager, present while at least one port is bound.
    pub fn manager(&self) -> Option<Arc<ConnectionManager<P>>> {
        self.registry.current()
    }

    /// The server's configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl<P: Protocol> Drop for Server<P> {
    fn drop(&mut self) {
        if self.ports().is_empty() {
            return;
        }

        if let Err(err) = self.shutdown() {
            warn!(%err, "server shutdown on drop failed");
        }
    }
}
