//! Per-connection session record

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::peer::ClientIp;
use crate::role::{Role, RoleError, RoleSlot};

const TOKEN_LEN: usize = 26;

/// One accepted connection, owned by its connection task for its whole life
#[derive(Debug, Clone)]
pub struct Session {
    /// Identifies the session to the message bus and in `ssh <token>@host`
    pub session_token: String,
    /// Log-safe prefix of the token
    pub obfuscated_session_token: String,
    pub client_ip: ClientIp,
    /// Set once negotiation succeeds
    role: RoleSlot,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(client_ip: ClientIp) -> Self {
        Self::with_token(generate_token(), client_ip)
    }

    pub fn with_token(session_token: impl Into<String>, client_ip: ClientIp) -> Self {
        let session_token = session_token.into();
        Self {
            obfuscated_session_token: obfuscate(&session_token),
            session_token,
            client_ip,
            role: RoleSlot::new(),
            started_at: Utc::now(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.role.get()
    }

    /// Record the negotiated role; a session's role never changes afterwards
    pub fn fix_role(&mut self, role: Role) -> Result<Role, RoleError> {
        self.role.assign(role)
    }

    /// Time since the connection was accepted
    pub fn duration(&self) -> std::time::Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}

/// Random alphanumeric session token
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Keep the first few characters so log lines can be correlated without leaking the token
pub fn obfuscate(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}...", prefix)
}
