//! Readiness selection and socket plumbing.
//!
//! - [`selector`]: the readiness multiplexer and its factory
//! - [`socket`]: binding the listening socket and configuring accepted ones

pub mod selector;
pub mod socket;
