//! termgate - SSH gateway for terminal sharing
//!
//! Identifies each client (directly or through a PROXY v1 header), negotiates
//! its role over SSH, hands the session to its owner and records the bytes
//! it produces to a message bus. The binary is in `main.rs`.

pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod paths;
pub mod peer;
pub mod policy;
pub mod recording;
pub mod role;
pub mod server;
pub mod session;
pub mod ssh;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
