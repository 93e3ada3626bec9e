//! The shared event loop: one background thread per registry, reference
//! counted across every connection that uses it.

pub mod connection;
pub mod event_loop;
pub mod registry;
