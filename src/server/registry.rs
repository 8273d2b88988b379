//! Reference-counted ownership of a server's connection manager.
//!
//! Every bound port holds one reference. The manager is created and its
//! selectors opened on the first acquire, and closed when the last port
//! releases it; a later bind starts over with a fresh manager.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::Protocol;
use crate::server::manager::ConnectionManager;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

struct Entry<P: Protocol> {
    manager: Option<Arc<ConnectionManager<P>>>,
    references: usize,
}

pub(crate) struct ManagerRegistry<P: Protocol> {
    config: Arc<ServerConfig>,
    protocol: Arc<P>,
    entry: Mutex<Entry<P>>,
}

impl<P: Protocol> ManagerRegistry<P> {
    pub(crate) fn new(config: Arc<ServerConfig>, protocol: Arc<P>) -> Self {
        Self {
            config,
            protocol,
            entry: Mutex::new(Entry {
                manager: None,
                references: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entry<P>> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a reference, opening the manager if none is live.
    pub(crate) fn acquire(&self) -> Result<Arc<ConnectionManager<P>>> {
        let mut entry = self.lock();

        let manager = match entry.manager.clone() {
            Some(manager) => manager,
            None => {
                let manager =
                    ConnectionManager::new(Arc::clone(&self.config), Arc::clone(&self.protocol));
                if let Err(err) = manager.open_socket_selectors() {
                    manager.close_socket_selectors();
                    return Err(err);
                }
                entry.manager = Some(Arc::clone(&manager));
                manager
            }
        };

        entry.references += 1;
        debug!(references = entry.references, "connection manager acquired");

        Ok(manager)
    }

    /// Drops a reference; the last one closes the manager.
    pub(crate) fn release(&self) {
        let mut entry = self.lock();
        entry.references = entry.references.saturating_sub(1);
        debug!(references = entry.references, "connection manager released");

        if entry.references > 0 {
            return;
        }
        let manager = entry.manager.take();
        drop(entry);

        if let Some(manager) = manager {
            manager.close_socket_selectors();
        }
    }

    /// The live manager, if any port is bound.
    pub(crate) fn current(&self) -> Option<Arc<ConnectionManager<P>>> {
        self.lock().manager.clone()
    }
}
