//! Thread scheduling for the accepter, listeners and heartbeat.

pub(crate) mod driver;

pub use driver::{Driver, DriverHandle, Work, WorkStatus};
