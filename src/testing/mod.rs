//! Testing utilities for termgate
//!
//! An SSH client that drives the gateway the way a real client would, and an
//! in-memory message bus that stands in for NATS.

mod memory_bus;
mod ssh_client;

pub use memory_bus::MemoryBus;
pub use ssh_client::SshTestClient;
