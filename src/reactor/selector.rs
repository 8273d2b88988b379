//! Readiness multiplexer used by the accepter and every socket listener.
//!
//! A [`Selector`] wraps the OS-level poller (epoll on Linux, kqueue on the
//! BSDs and macOS) together with a [`Waker`] so other threads can interrupt a
//! blocking [`Selector::select`]. Selectors are created through the
//! stateless [`SelectorFactory`].
//!
//! # Example
//!
//! ```ignore
//! let mut selector = SelectorFactory.create_selector()?;
//! selector.registry().register(&mut listener, Token(0), Interest::READABLE)?;
//! selector.select(Duration::from_secs(10))?;
//! for readiness in selector.selected().values() {
//!     println!("{:?} readable={}", readiness.token, readiness.readable);
//! }
//! ```

use mio::{Events, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the cross-thread waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Number of readiness events fetched by one `select`.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Readiness reported for one registered source during a `select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Token the source was registered with.
    pub token: Token,
    /// Data (or end-of-stream, or an error) is waiting to be read.
    pub readable: bool,
    /// The send buffer has room.
    pub writable: bool,
}

impl Readiness {
    fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
    }
}

/// Creates [`Selector`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectorFactory;

impl SelectorFactory {
    /// Opens a new selector with its own waker.
    ///
    /// # Returns
    /// The selector, or the OS error if the poller or waker cannot be created
    pub fn create_selector(&self) -> io::Result<Selector> {
        Selector::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }
}

/// A readiness multiplexer plus the keys selected by the last `select`.
pub struct Selector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    selected: HashMap<Token, Readiness>,
}

impl Selector {
    fn with_capacity(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            waker,
            selected: HashMap::new(),
        })
    }

    /// Blocks until a registered source is ready, the selector is woken, or
    /// `timeout` elapses.
    ///
    /// Readiness for the same token reported in several events is merged into
    /// a single entry. An interrupted system call counts as an empty select.
    ///
    /// # Returns
    /// The number of selected keys (wakeups are not counted)
    pub fn select(&mut self, timeout: Duration) -> io::Result<usize> {
        self.selected.clear();

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }

            let readiness = Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            };

            match self.selected.entry(readiness.token) {
                Entry::Occupied(mut selected) => selected.get_mut().merge(readiness),
                Entry::Vacant(slot) => {
                    slot.insert(readiness);
                }
            }
        }

        Ok(self.selected.len())
    }

    /// Keys selected by the last [`select`](Self::select), by token.
    pub fn selected(&self) -> &HashMap<Token, Readiness> {
        &self.selected
    }

    /// Registry used to add, modify and remove sources.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Shared waker, safe to use from any thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}
