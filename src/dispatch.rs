//! Hand-off from the supervisor to the process that owns a session

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use russh::ChannelMsg;
use tracing::debug;

use crate::recording::Recorder;
use crate::role::Role;
use crate::session::Session;
use crate::ssh::SshClient;

/// Everything a collaborator needs to run a negotiated session
#[derive(Debug)]
pub struct SessionContext {
    pub session: Session,
    pub client: SshClient,
    /// Every byte passed here is republished to the recording bus, in order
    pub recorder: Recorder,
    /// `ssh [-pN] <token>@<host>` for this session
    pub connection_hint: String,
}

impl SessionContext {
    /// Send bytes to the client and record them
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.client.channel.data(&data[..]).await?;
        self.recorder.send(data).await?;
        Ok(())
    }
}

/// The three external session owners. Each runs until its session is over.
#[async_trait]
pub trait SessionSpawner: Send + Sync {
    async fn spawn_daemon(&self, ctx: SessionContext) -> Result<()>;
    async fn spawn_pty_client(&self, ctx: SessionContext) -> Result<()>;
    async fn spawn_exec(&self, ctx: SessionContext) -> Result<()>;
}

/// Route a negotiated session to the collaborator for its role
pub async fn dispatch(spawner: &dyn SessionSpawner, ctx: SessionContext) -> Result<()> {
    match ctx.session.role() {
        Some(Role::Daemon) => spawner.spawn_daemon(ctx).await,
        Some(Role::PtyClient) => spawner.spawn_pty_client(ctx).await,
        Some(Role::Exec) => spawner.spawn_exec(ctx).await,
        None => anyhow::bail!("dispatch before role negotiation"),
    }
}

/// Stand-alone collaborator: echoes input back to the client
///
/// Used when the gateway runs without a terminal-sharing backend. Everything
/// written to the client goes through [`SessionContext::write`] and is recorded.
#[derive(Debug, Clone, Default)]
pub struct MirrorSpawner;

impl MirrorSpawner {
    async fn mirror(&self, mut ctx: SessionContext) -> Result<()> {
        loop {
            match ctx.client.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    ctx.write(Bytes::copy_from_slice(&data)).await?;
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(other) => debug!(?other, "ignoring channel message"),
            }
        }

        ctx.recorder.close();
        let _ = ctx.client.channel.exit_status(0).await;
        let _ = ctx.client.channel.close().await;
        Ok(())
    }
}

#[async_trait]
impl SessionSpawner for MirrorSpawner {
    async fn spawn_daemon(&self, ctx: SessionContext) -> Result<()> {
        self.mirror(ctx).await
    }

    async fn spawn_pty_client(&self, ctx: SessionContext) -> Result<()> {
        let banner = format!(
            "Connected as {} ({}x{})\r\nShare: {}\r\n",
            ctx.client.username, ctx.client.pty.cols, ctx.client.pty.rows, ctx.connection_hint
        );
        ctx.write(banner).await?;
        self.mirror(ctx).await
    }

    async fn spawn_exec(&self, mut ctx: SessionContext) -> Result<()> {
        let command = ctx.client.exec_command.clone().unwrap_or_default();
        ctx.write(format!("{}\r\n", command)).await?;

        ctx.recorder.close();
        ctx.client.channel.exit_status(0).await?;
        ctx.client.channel.eof().await?;
        ctx.client.channel.close().await?;
        Ok(())
    }
}
