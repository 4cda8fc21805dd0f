//! SSH layer: host keys, server config and role negotiation

mod client;
mod handler;
mod keys;

use std::time::Duration;

use russh::keys::PrivateKey;
use russh::{server, MethodKind, MethodSet, SshId};

use crate::config::Config;

pub use client::{Negotiated, PtySize, SshClient};
pub use handler::{NegotiationHandler, DAEMON_SUBSYSTEM};
pub use keys::{load_host_keys, HOST_KEY_NAMES};

/// russh server configuration for the gateway
pub fn server_config(config: &Config, keys: Vec<PrivateKey>) -> server::Config {
    server::Config {
        server_id: SshId::Standard(config.server_id.clone()),
        methods: MethodSet::from([MethodKind::None, MethodKind::PublicKey].as_slice()),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keepalive_interval: config.keepalive(),
        keys,
        ..Default::default()
    }
}
