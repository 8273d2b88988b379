//! Periodic wakeup of every socket listener.

use crate::handler::Protocol;
use crate::runtime::{Work, WorkStatus};
use crate::server::manager::ConnectionManager;

use std::sync::Weak;
use std::thread;
use std::time::Duration;

/// Sleeps for the interval, then wakes every running listener.
///
/// Completes once the manager is closed or gone. Parking makes the sleep
/// interruptible by [`DriverHandle::unpark`](crate::runtime::DriverHandle::unpark).
pub(crate) struct Heartbeat<P: Protocol> {
    manager: Weak<ConnectionManager<P>>,
    interval: Duration,
}

impl<P: Protocol> Heartbeat<P> {
    pub(crate) fn new(manager: Weak<ConnectionManager<P>>, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

impl<P: Protocol> Work for Heartbeat<P> {
    fn run(&mut self) -> WorkStatus {
        thread::park_timeout(self.interval);

        let Some(manager) = self.manager.upgrade() else {
            return WorkStatus::Complete;
        };
        if manager.is_closed() {
            return WorkStatus::Complete;
        }

        manager.do_heart_beat();
        WorkStatus::Continue
    }
}
