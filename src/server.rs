//! Connection supervisor
//!
//! Owns the listening socket. Every accepted connection becomes its own task
//! with its own session state; a failure inside one never reaches the accept
//! loop or any other connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use russh::server;
use russh::Disconnect;
use socket2::SockRef;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::{dispatch, MirrorSpawner, SessionContext, SessionSpawner};
use crate::metrics;
use crate::peer::{self, IdentifyError};
use crate::policy::{AuthPolicy, ConfigPolicy};
use crate::recording::{spawn_relay, BusConnector, NatsConnector, Recorder, RecordingError};
use crate::role::{NegotiationState, RoleError};
use crate::session::Session;
use crate::ssh::{self, NegotiationHandler};

/// IPTOS_LOWDELAY
const IPTOS_LOWDELAY: u32 = 0x10;

/// How long a finished session may take to say goodbye
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a connection task ended
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection grace period ({period:?}) passed in state {state:?}")]
    GracePeriod {
        period: Duration,
        state: NegotiationState,
    },
    #[error("disconnected, health checker?")]
    NoData,
    #[error("proxy header invalid, load balancer may be misconfigured: {0}")]
    ProxyHeader(#[source] IdentifyError),
    #[error("error getting client IP from connection: {0}")]
    PeerAddress(#[source] IdentifyError),
    #[error("client disconnected before picking a role")]
    Disconnected,
    #[error("ssh session failed: {0}")]
    Ssh(anyhow::Error),
    #[error("recording failed: {0}")]
    Recording(#[from] RecordingError),
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error("session ended with error: {0}")]
    Collaborator(anyhow::Error),
}

impl ConnectionError {
    fn identify(err: IdentifyError, use_proxy_protocol: bool) -> Self {
        if err.is_quiet() {
            ConnectionError::NoData
        } else if use_proxy_protocol {
            ConnectionError::ProxyHeader(err)
        } else {
            ConnectionError::PeerAddress(err)
        }
    }

    /// Expected endings (scanners, health checks, idle clients)
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            ConnectionError::GracePeriod { .. }
                | ConnectionError::NoData
                | ConnectionError::Disconnected
        )
    }
}

/// Cancels a connection's token when its grace period runs out
struct GraceTimer {
    token: CancellationToken,
    timer: JoinHandle<()>,
    period: Duration,
}

impl GraceTimer {
    fn arm(period: Duration, shutdown: &CancellationToken) -> Self {
        let token = shutdown.child_token();
        let expire = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            expire.cancel();
        });
        Self {
            token,
            timer,
            period,
        }
    }

    fn expired(&self, state: NegotiationState) -> ConnectionError {
        ConnectionError::GracePeriod {
            period: self.period,
            state,
        }
    }

    fn disarm(&self) {
        self.timer.abort();
    }
}

impl Drop for GraceTimer {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

async fn hang_up(handle: &server::Handle, reason: &str) {
    let _ = handle
        .disconnect(Disconnect::ByApplication, reason.to_string(), "en".to_string())
        .await;
}

/// Disable Nagle and ask for low-delay TOS; failures only cost latency
pub fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "cannot set TCP_NODELAY");
    }
    if let Err(e) = SockRef::from(stream).set_tos(IPTOS_LOWDELAY) {
        debug!(error = %e, "cannot set IP_TOS");
    }
}

/// The SSH gateway: accept loop plus per-connection negotiation and dispatch
pub struct Gateway {
    config: Arc<Config>,
    policy: Arc<dyn AuthPolicy>,
    spawner: Arc<dyn SessionSpawner>,
    bus: Option<Arc<dyn BusConnector>>,
}

impl Gateway {
    /// Gateway with the config-driven auth policy, the mirror collaborator and,
    /// when recording is configured, a NATS recorder
    pub fn new(config: Config) -> Result<Self> {
        let policy = ConfigPolicy::from_config(&config.auth)?;
        let bus = config
            .recording
            .as_ref()
            .map(|r| Arc::new(NatsConnector::new(r.url.clone())) as Arc<dyn BusConnector>);

        Ok(Self {
            config: Arc::new(config),
            policy: Arc::new(policy),
            spawner: Arc::new(MirrorSpawner),
            bus,
        })
    }

    pub fn with_policy(mut self, policy: Arc<dyn AuthPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn SessionSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Replace the recording bus; only used when `[recording]` is configured
    pub fn with_bus(mut self, bus: Arc<dyn BusConnector>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind, load host keys and accept connections until Ctrl-C
    pub async fn run_server(self, bind_address: &str, port: u16, keys_dir: &Path) -> Result<()> {
        let keys = ssh::load_host_keys(keys_dir)?;

        let listener = TcpListener::bind((bind_address, port))
            .await
            .with_context(|| format!("error listening on {}:{}", bind_address, port))?;
        info!("accepting connections on {}:{}", bind_address, port);

        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received");
                    shutdown.cancel();
                }
            }
        });

        self.serve(listener, keys, shutdown).await
    }

    /// Accept loop on an already-bound listener
    ///
    /// On shutdown live sessions are dropped, which ends their recordings;
    /// returns once every recording has flushed its end marker.
    pub async fn serve(
        self,
        listener: TcpListener,
        keys: Vec<PrivateKey>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let ssh_config = Arc::new(ssh::server_config(&self.config, keys));
        let gateway = Arc::new(self);
        let mut connections = JoinSet::new();
        let recordings = TaskTracker::new();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(active = connections.len(), "shutting down");
                    break Ok(());
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("connection task panicked: {}", e);
                        }
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            break Err(anyhow::Error::new(e).context("error accepting connection"));
                        }
                    };
                    metrics::record_connection_accepted();

                    let grace = GraceTimer::arm(gateway.config.grace_period(), &shutdown);
                    let span = info_span!("conn", conn_id = %Uuid::now_v7(), peer = %peer_addr);
                    connections.spawn(
                        gateway
                            .clone()
                            .handle_connection(
                                stream,
                                ssh_config.clone(),
                                grace,
                                recordings.clone(),
                            )
                            .instrument(span),
                    );
                }
            }
        };

        connections.shutdown().await;
        recordings.close();
        if !recordings.is_empty() {
            info!(pending = recordings.len(), "waiting for session recordings to flush");
        }
        recordings.wait().await;
        result
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        ssh_config: Arc<server::Config>,
        grace: GraceTimer,
        recordings: TaskTracker,
    ) {
        match self.run_connection(stream, ssh_config, grace, &recordings).await {
            Ok(()) => debug!("connection closed"),
            Err(e) if e.is_quiet() => debug!("{}", e),
            Err(e) => error!("{}", e),
        }
    }

    async fn run_connection(
        &self,
        mut stream: TcpStream,
        ssh_config: Arc<server::Config>,
        grace: GraceTimer,
        recordings: &TaskTracker,
    ) -> Result<(), ConnectionError> {
        let use_proxy_protocol = self.config.use_proxy_protocol;

        let client_ip = tokio::select! {
            _ = grace.token.cancelled() => {
                return Err(grace.expired(NegotiationState::AwaitingHandshake));
            }
            ip = peer::identify(&mut stream, use_proxy_protocol) => {
                ip.map_err(|e| ConnectionError::identify(e, use_proxy_protocol))?
            }
        };
        debug!(ip = %client_ip, "connection accepted");

        tune_socket(&stream);
        let mut session = Session::new(client_ip);

        let (handler, negotiated_rx, negotiation) =
            NegotiationHandler::new(self.policy.clone(), self.config.exec_enabled);

        let running = tokio::select! {
            _ = grace.token.cancelled() => {
                return Err(grace.expired(NegotiationState::AwaitingHandshake));
            }
            running = server::run_stream(ssh_config, stream, handler) => {
                running.map_err(ConnectionError::Ssh)?
            }
        };
        tokio::pin!(running);

        let negotiated = tokio::select! {
            _ = grace.token.cancelled() => {
                hang_up(&running.handle(), "connection grace period passed").await;
                let state = *negotiation.borrow();
                return Err(grace.expired(state));
            }
            ended = &mut running => {
                return Err(match ended {
                    Ok(()) => ConnectionError::Disconnected,
                    Err(e) => ConnectionError::Ssh(e),
                });
            }
            negotiated = negotiated_rx => negotiated.map_err(|_| ConnectionError::Disconnected)?,
        };
        grace.disarm();

        let role = session.fix_role(negotiated.role)?;
        metrics::record_role(role);
        info!(
            %role,
            ip = %session.client_ip,
            session = %session.obfuscated_session_token,
            user = %negotiated.client.username,
            "role negotiated"
        );

        let (recorder, relay) = match (&self.config.recording, &self.bus) {
            (Some(recording), Some(bus)) => {
                let (recorder, relay) = spawn_relay(&session, recording, bus.clone(), recordings);
                (recorder, Some(relay))
            }
            _ => {
                info!(session = %session.obfuscated_session_token, "session recording is disabled");
                (Recorder::disabled(), None)
            }
        };

        let handle = negotiated.client.handle.clone();
        let record = session.clone();
        let ctx = SessionContext {
            connection_hint: self.config.connection_hint(&session.session_token),
            session,
            client: negotiated.client,
            recorder,
        };

        let mut session_done = false;
        let outcome = tokio::select! {
            result = dispatch(self.spawner.as_ref(), ctx) => {
                result.map_err(ConnectionError::Collaborator)
            }
            ended = &mut running => {
                session_done = true;
                debug!("ssh disconnected");
                ended.map_err(ConnectionError::Ssh)
            }
        };

        if !session_done {
            hang_up(&handle, "session ended").await;
            let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, &mut running).await;
        }
        info!(
            %role,
            session = %record.obfuscated_session_token,
            duration = ?record.duration(),
            "session ended"
        );

        if let Some(relay) = relay {
            let stats = relay.finish().await?;
            debug!(chunks = stats.chunks, bytes = stats.bytes, "session recorded");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        assert!(ConnectionError::GracePeriod {
            period: Duration::from_secs(60),
            state: NegotiationState::AwaitingRole,
        }
        .is_quiet());
        assert!(ConnectionError::NoData.is_quiet());
        assert!(ConnectionError::Disconnected.is_quiet());
        assert!(!ConnectionError::Recording(RecordingError::RelayClosed).is_quiet());
        assert!(!ConnectionError::Ssh(anyhow::anyhow!("kex failed")).is_quiet());
    }

    #[test]
    fn test_identify_errors_escalate_by_mode() {
        let quiet = ConnectionError::identify(IdentifyError::NoData, true);
        assert!(matches!(quiet, ConnectionError::NoData));

        let proxied = ConnectionError::identify(IdentifyError::BadSignature, true);
        assert!(matches!(proxied, ConnectionError::ProxyHeader(_)));
        assert!(!proxied.is_quiet());

        let direct = ConnectionError::identify(
            IdentifyError::PeerAddr(std::io::Error::from(std::io::ErrorKind::NotConnected)),
            false,
        );
        assert!(matches!(direct, ConnectionError::PeerAddress(_)));
    }

    #[tokio::test]
    async fn test_grace_timer_fires() {
        let shutdown = CancellationToken::new();
        let grace = GraceTimer::arm(Duration::from_millis(10), &shutdown);
        tokio::time::timeout(Duration::from_secs(1), grace.token.cancelled())
            .await
            .unwrap();
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_disarmed_grace_timer_never_fires() {
        let shutdown = CancellationToken::new();
        let grace = GraceTimer::arm(Duration::from_millis(10), &shutdown);
        grace.disarm();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!grace.token.is_cancelled());
    }

    #[tokio::test]
    async fn test_grace_expiry_reports_negotiation_state() {
        let shutdown = CancellationToken::new();
        let grace = GraceTimer::arm(Duration::from_secs(60), &shutdown);
        let err = grace.expired(NegotiationState::AwaitingRole);
        assert!(err.is_quiet());
        assert!(err.to_string().contains("AwaitingRole"), "got {}", err);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_connections() {
        let shutdown = CancellationToken::new();
        let grace = GraceTimer::arm(Duration::from_secs(60), &shutdown);
        shutdown.cancel();
        assert!(grace.token.is_cancelled());
    }
}
