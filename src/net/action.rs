//! Thread-safe queue of connection actions for one socket listener.
//!
//! Threads that do not own a connection never touch its socket. They push an
//! immutable [`ConnectionAction`] here and wake the listener's selector; the
//! listener applies the actions, in FIFO order, on its own thread.

use crate::net::connection::ConnectionId;
use crate::net::write::WriteAction;

use mio::Waker;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// A request for the listener that owns a connection.
#[derive(Debug)]
pub(crate) enum ConnectionAction {
    /// Append the write to the connection's queue.
    Write { id: ConnectionId, action: WriteAction },
    /// Flush queued writes, then terminate.
    Close { id: ConnectionId },
}

/// FIFO of actions waiting for the owning listener.
pub(crate) struct ActionQueue {
    actions: Mutex<VecDeque<ConnectionAction>>,
    waker: Arc<Waker>,
}

impl ActionQueue {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self {
            actions: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    /// Enqueues an action and wakes the listener.
    pub(crate) fn push(&self, action: ConnectionAction) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(action);
        self.wake();
    }

    /// Removes and returns every queued action, oldest first.
    pub(crate) fn drain(&self) -> VecDeque<ConnectionAction> {
        std::mem::take(&mut *self.actions.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Interrupts the listener's `select`.
    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(?err, "failed to wake socket listener");
        }
    }
}
