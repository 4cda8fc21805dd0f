//! Connection roles and the write-once slot that holds them

use std::fmt;

use thiserror::Error;

/// What a connection is allowed to do once negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// tmate daemon driving a shared session (`tmate` subsystem)
    Daemon,
    /// Interactive terminal attaching to a session (shell request)
    PtyClient,
    /// One-shot command (exec request)
    Exec,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Daemon => "daemon",
            Role::PtyClient => "pty-client",
            Role::Exec => "exec",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("role already fixed as {existing}, refusing {requested}")]
pub struct RoleError {
    pub existing: Role,
    pub requested: Role,
}

/// Write-once role holder; every role-setting request goes through [`RoleSlot::assign`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoleSlot(Option<Role>);

impl RoleSlot {
    pub fn new() -> Self {
        Self(None)
    }

    /// Fix the role if still unset; any later call is refused
    pub fn assign(&mut self, role: Role) -> Result<Role, RoleError> {
        match self.0 {
            Some(existing) => Err(RoleError {
                existing,
                requested: role,
            }),
            None => {
                self.0 = Some(role);
                Ok(role)
            }
        }
    }

    pub fn get(&self) -> Option<Role> {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Progress of one connection through role negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Key exchange not finished yet
    AwaitingHandshake,
    /// Transport is up; authentication and channel requests in flight
    AwaitingRole,
    /// Terminal success state
    RoleFixed(Role),
}

impl NegotiationState {
    /// First protocol callback after key exchange
    pub fn handshake_done(self) -> Self {
        match self {
            NegotiationState::AwaitingHandshake => NegotiationState::AwaitingRole,
            other => other,
        }
    }

    pub fn fixed(self, role: Role) -> Self {
        match self {
            NegotiationState::RoleFixed(existing) => NegotiationState::RoleFixed(existing),
            _ => NegotiationState::RoleFixed(role),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            NegotiationState::RoleFixed(role) => Some(*role),
            _ => None,
        }
    }
}
