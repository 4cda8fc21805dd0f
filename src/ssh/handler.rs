//! Role negotiation handler
//!
//! Drives authentication and the single session channel until one channel
//! request fixes the connection's role, then hands the channel to the
//! supervisor. Every role-setting request goes through [`NegotiationHandler::claim_role`].

use std::sync::Arc;

use anyhow::Result;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::client::{Negotiated, PtySize, SshClient};
use crate::policy::AuthPolicy;
use crate::role::{NegotiationState, Role, RoleSlot};

/// Subsystem name the tmate daemon requests
pub const DAEMON_SUBSYSTEM: &str = "tmate";

/// Per-connection SSH handler used until the role is fixed
pub struct NegotiationHandler {
    policy: Arc<dyn AuthPolicy>,
    exec_enabled: bool,
    /// Published so the supervisor can tell where a stalled connection stopped
    state: watch::Sender<NegotiationState>,
    role: RoleSlot,
    username: Option<String>,
    pubkey: Option<String>,
    exec_command: Option<String>,
    pty: PtySize,
    channel_id: Option<ChannelId>,
    channel: Option<Channel<Msg>>,
    negotiated_tx: Option<oneshot::Sender<Negotiated>>,
}

impl NegotiationHandler {
    /// The handler, the hand-off receiver and a view of the negotiation state
    pub fn new(
        policy: Arc<dyn AuthPolicy>,
        exec_enabled: bool,
    ) -> (
        Self,
        oneshot::Receiver<Negotiated>,
        watch::Receiver<NegotiationState>,
    ) {
        let (negotiated_tx, negotiated_rx) = oneshot::channel();
        let (state, state_rx) = watch::channel(NegotiationState::AwaitingHandshake);
        let handler = Self {
            policy,
            exec_enabled,
            state,
            role: RoleSlot::new(),
            username: None,
            pubkey: None,
            exec_command: None,
            pty: PtySize::default(),
            channel_id: None,
            channel: None,
            negotiated_tx: Some(negotiated_tx),
        };
        (handler, negotiated_rx, state_rx)
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn handshake_done(&mut self) {
        self.state.send_if_modified(|state| {
            let next = state.handshake_done();
            let changed = next != *state;
            *state = next;
            changed
        });
    }

    /// Session channels open only after authentication, and only once
    fn admit_channel(&self) -> bool {
        if self.username.is_none() {
            debug!("channel open before authentication");
            return false;
        }
        if self.channel_id.is_some() {
            debug!("refusing second channel");
            return false;
        }
        true
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Record identity on first successful authentication only
    fn authenticated(&mut self, user: &str, pubkey: Option<String>) {
        if self.username.is_none() {
            self.username = Some(user.to_string());
            self.pubkey = pubkey;
        }
    }

    /// The single role transition shared by shell, subsystem and exec requests
    fn claim_role(
        &mut self,
        channel: ChannelId,
        role: Role,
        exec_command: Option<String>,
        session: &mut Session,
    ) -> bool {
        if self.channel_id != Some(channel) {
            let _ = session.channel_failure(channel);
            return false;
        }

        match self.role.assign(role) {
            Ok(role) => {
                self.state.send_modify(|state| *state = state.fixed(role));
                self.exec_command = exec_command;
                let _ = session.channel_success(channel);
                self.hand_off(role, session);
                true
            }
            Err(e) => {
                debug!("{}", e);
                let _ = session.channel_failure(channel);
                false
            }
        }
    }

    fn hand_off(&mut self, role: Role, session: &mut Session) {
        let (Some(channel), Some(tx), Some(username)) = (
            self.channel.take(),
            self.negotiated_tx.take(),
            self.username.clone(),
        ) else {
            warn!(%role, "role fixed without an open channel");
            return;
        };

        let client = SshClient {
            handle: session.handle(),
            channel,
            username,
            pubkey: self.pubkey.clone(),
            exec_command: self.exec_command.clone(),
            pty: self.pty,
        };

        if tx.send(Negotiated { role, client }).is_err() {
            debug!("supervisor gone before role hand-off");
        }
    }
}

impl server::Handler for NegotiationHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.handshake_done();

        if !self.policy.would_allow_auth(user, None) {
            debug!(user, "none auth denied");
            return Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
                partial_success: false,
            });
        }

        debug!(user, "none auth accepted");
        self.authenticated(user, None);
        Ok(Auth::Accept)
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        _key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Probe only: the identity is recorded once a signature is verified
        self.handshake_done();
        debug!(user, "public key offered");
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        self.handshake_done();

        let pubkey = format!("{} {}", key.algorithm().as_str(), key.public_key_base64());

        if !self.policy.would_allow_auth(user, Some(&pubkey)) {
            info!(user, "public key denied");
            return Ok(Self::reject());
        }

        debug!(user, "public key accepted");
        self.authenticated(user, Some(pubkey));
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.admit_channel() {
            return Ok(false);
        }

        debug!(channel_id = ?channel.id(), "session channel opened");
        self.channel_id = Some(channel.id());
        self.channel = Some(channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty = PtySize {
            cols: col_width,
            rows: row_height,
        };
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty = PtySize {
            cols: col_width,
            rows: row_height,
        };
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.claim_role(channel, Role::PtyClient, None, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != DAEMON_SUBSYSTEM {
            debug!(subsystem = name, "unknown subsystem refused");
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        self.claim_role(channel, Role::Daemon, None, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.exec_enabled {
            debug!("exec refused, exec role disabled");
            let _ = session.channel_failure(channel);
            return Ok(());
        }

        let command = String::from_utf8_lossy(data).into_owned();
        self.claim_role(channel, Role::Exec, Some(command), session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowUser(&'static str);

    impl AuthPolicy for AllowUser {
        fn would_allow_auth(&self, username: &str, _pubkey: Option<&str>) -> bool {
            username == self.0
        }
    }

    fn handler(exec_enabled: bool) -> NegotiationHandler {
        NegotiationHandler::new(Arc::new(AllowUser("alice")), exec_enabled).0
    }

    #[tokio::test]
    async fn test_none_auth_consults_policy() {
        use server::Handler;

        let mut h = handler(false);
        assert_eq!(h.state(), NegotiationState::AwaitingHandshake);

        let auth = h.auth_none("mallory").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(h.username.is_none());
        assert_eq!(h.state(), NegotiationState::AwaitingRole);

        let auth = h.auth_none("alice").await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(h.username.as_deref(), Some("alice"));
        assert!(h.pubkey.is_none());
    }

    #[tokio::test]
    async fn test_pubkey_probe_records_nothing() {
        use server::Handler;

        let key = russh::keys::PrivateKey::random(
            &mut rand::thread_rng(),
            russh::keys::Algorithm::Ed25519,
        )
        .unwrap();

        let mut h = handler(false);
        let auth = h
            .auth_publickey_offered("mallory", key.public_key())
            .await
            .unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert!(h.username.is_none());
    }

    #[tokio::test]
    async fn test_verified_pubkey_exported_and_recorded() {
        use server::Handler;

        let key = russh::keys::PrivateKey::random(
            &mut rand::thread_rng(),
            russh::keys::Algorithm::Ed25519,
        )
        .unwrap();

        let mut h = handler(false);
        let auth = h.auth_publickey("alice", key.public_key()).await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(h.username.as_deref(), Some("alice"));
        let pubkey = h.pubkey.clone().unwrap();
        assert!(pubkey.starts_with("ssh-ed25519 AAAA"), "got {}", pubkey);

        let auth = h.auth_publickey("bob", key.public_key()).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert_eq!(h.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_state_published_to_supervisor() {
        use server::Handler;

        let (mut h, _negotiated, state) =
            NegotiationHandler::new(Arc::new(AllowUser("alice")), false);
        assert_eq!(*state.borrow(), NegotiationState::AwaitingHandshake);

        h.auth_none("alice").await.unwrap();
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow(), NegotiationState::AwaitingRole);
    }

    #[tokio::test]
    async fn test_no_channel_before_authentication() {
        use server::Handler;

        let mut h = handler(false);
        assert!(!h.admit_channel());

        h.auth_none("mallory").await.unwrap();
        assert!(!h.admit_channel(), "denied user must not open a channel");

        h.auth_none("alice").await.unwrap();
        assert!(h.admit_channel());
    }

    #[test]
    fn test_identity_is_write_once() {
        let mut h = handler(false);
        h.authenticated("alice", Some("ssh-ed25519 AAAA".to_string()));
        h.authenticated("bob", None);
        assert_eq!(h.username.as_deref(), Some("alice"));
        assert_eq!(h.pubkey.as_deref(), Some("ssh-ed25519 AAAA"));
    }
}
