//! Dedicated worker threads.
//!
//! The accepter, every socket listener and the heartbeat are each a [`Work`]
//! unit pinned to its own named OS thread. The driver re-invokes
//! [`Work::run`] after every pass until the work reports
//! [`WorkStatus::Complete`] or a stop is requested; a pass is expected to
//! block for a bounded time at most, so the stop flag is observed promptly.

use crate::error::{Error, Result};

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// Outcome of one pass of a [`Work`] unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Run the work again.
    Continue,
    /// The work is finished; the thread exits.
    Complete,
}

/// A repeatable unit of work driven on a dedicated thread.
pub trait Work: Send + 'static {
    /// Performs one pass.
    fn run(&mut self) -> WorkStatus;
}

/// Spawns [`Work`] units on dedicated threads.
pub struct Driver;

impl Driver {
    /// Starts a named thread that runs `work` until it completes.
    ///
    /// # Arguments
    /// * `name` - Thread name, also used in logs
    /// * `work` - The unit of work to drive
    ///
    /// # Returns
    /// A handle to stop and join the thread, or the error from spawning it
    ///
    /// # Example
    /// ```ignore
    /// let handle = Driver::spawn("socket-listener-0", listener)?;
    /// handle.stop();
    /// handle.join()?;
    /// ```
    pub fn spawn<W: Work>(name: impl Into<String>, mut work: W) -> io::Result<DriverHandle> {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            trace!(thread = ?thread::current().name(), "driver started");

            loop {
                // Check if a stop has been requested
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }

                if work.run() == WorkStatus::Complete {
                    break;
                }
            }

            trace!(thread = ?thread::current().name(), "driver finished");
        })?;

        debug!(%name, "spawned driver thread");

        Ok(DriverHandle { name, stop, thread })
    }
}

/// Control handle of a driver thread.
pub struct DriverHandle {
    name: String,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl DriverHandle {
    /// Name of the driven thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks the driver to stop before its next pass.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Unparks the thread if the work is parked.
    pub fn unpark(&self) {
        self.thread.thread().unpark();
    }

    /// Waits for the thread to exit.
    ///
    /// Joining from the driven thread itself returns immediately.
    ///
    /// # Returns
    /// `Err(Error::WorkerPanicked)` if the work panicked
    pub fn join(self) -> Result<()> {
        if self.thread.thread().id() == thread::current().id() {
            return Ok(());
        }

        self.thread
            .join()
            .map_err(|_| Error::WorkerPanicked(self.name))
    }
}
