//! SSH-side state handed to a session once its role is fixed

use russh::server::{Handle, Msg};
use russh::Channel;

use crate::role::Role;

/// Terminal dimensions from the last PTY or window-change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// The authenticated SSH side of a connection
pub struct SshClient {
    /// Handle to the live protocol session
    pub handle: Handle,
    /// The one session channel this connection may open
    pub channel: Channel<Msg>,
    pub username: String,
    /// `"<type> <base64>"`; `None` after none-auth
    pub pubkey: Option<String>,
    /// Only set for the exec role
    pub exec_command: Option<String>,
    pub pty: PtySize,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("channel", &self.channel.id())
            .field("username", &self.username)
            .field("pubkey", &self.pubkey)
            .field("exec_command", &self.exec_command)
            .field("pty", &self.pty)
            .finish()
    }
}

/// Result of a successful negotiation
#[derive(Debug)]
pub struct Negotiated {
    pub role: Role,
    pub client: SshClient,
}
