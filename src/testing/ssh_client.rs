//! SSH test client for automated testing
//!
//! Connects to the gateway, asks for a role, sends input and captures output.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::client::{self, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};

/// SSH test client holding one authenticated session channel
pub struct SshTestClient {
    handle: Handle<ClientHandler>,
    channel: russh::Channel<client::Msg>,
    /// Output that arrived while waiting for a request reply
    pending: Vec<u8>,
}

impl SshTestClient {
    /// Connect and authenticate with `key`, or with the `none` method
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: &str,
        key: Option<PrivateKey>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("failed to connect")?;
        Self::connect_stream(stream, username, key).await
    }

    /// Like [`connect`](Self::connect), sending a PROXY header line first
    pub async fn connect_via_proxy(
        addr: impl ToSocketAddrs,
        proxy_header: &str,
        username: &str,
        key: Option<PrivateKey>,
    ) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await.context("failed to connect")?;
        stream
            .write_all(proxy_header.as_bytes())
            .await
            .context("failed to send proxy header")?;
        Self::connect_stream(stream, username, key).await
    }

    async fn connect_stream(
        stream: TcpStream,
        username: &str,
        key: Option<PrivateKey>,
    ) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, stream, ClientHandler)
            .await
            .context("ssh handshake failed")?;

        let auth_result = match key {
            Some(key) => handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), None))
                .await
                .context("key authentication failed")?,
            None => handle
                .authenticate_none(username)
                .await
                .context("none authentication failed")?,
        };

        if !auth_result.success() {
            anyhow::bail!("authentication rejected");
        }

        let channel = handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;

        Ok(Self {
            handle,
            channel,
            pending: Vec::new(),
        })
    }

    /// Try to open another session channel on this connection; true if the server accepted
    pub async fn open_extra_channel(&self) -> Result<bool> {
        Ok(self.handle.channel_open_session().await.is_ok())
    }

    /// Request a PTY; true if the server accepted
    pub async fn request_pty(&mut self, cols: u32, rows: u32) -> Result<bool> {
        self.channel
            .request_pty(true, "xterm-256color", cols, rows, 0, 0, &[])
            .await
            .context("failed to request PTY")?;
        self.reply().await
    }

    /// Request an interactive shell; true if the server accepted
    pub async fn request_shell(&mut self) -> Result<bool> {
        self.channel
            .request_shell(true)
            .await
            .context("failed to request shell")?;
        self.reply().await
    }

    pub async fn request_subsystem(&mut self, name: &str) -> Result<bool> {
        self.channel
            .request_subsystem(true, name)
            .await
            .context("failed to request subsystem")?;
        self.reply().await
    }

    pub async fn exec(&mut self, command: &str) -> Result<bool> {
        self.channel
            .exec(true, command)
            .await
            .context("failed to request exec")?;
        self.reply().await
    }

    /// Wait for the success/failure reply to the last request
    async fn reply(&mut self) -> Result<bool> {
        let wait = async {
            loop {
                match self.channel.wait().await {
                    Some(ChannelMsg::Success) => return Ok(true),
                    Some(ChannelMsg::Failure) => return Ok(false),
                    Some(ChannelMsg::Data { data }) => self.pending.extend_from_slice(&data),
                    Some(_) => {}
                    None => anyhow::bail!("channel closed while waiting for reply"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .context("timeout waiting for reply")?
    }

    /// Send raw input
    pub async fn send(&mut self, input: &[u8]) -> Result<()> {
        self.channel
            .data(input)
            .await
            .context("failed to send data")?;
        Ok(())
    }

    /// Signal end of input
    pub async fn eof(&mut self) -> Result<()> {
        self.channel.eof().await.context("failed to send eof")?;
        Ok(())
    }

    /// Collect output until the channel closes or `duration` passes
    pub async fn wait_and_collect(&mut self, duration: Duration) -> Result<Vec<u8>> {
        self.wait_internal(duration, None).await
    }

    /// Collect output until `pattern` appears, or fail on timeout
    pub async fn wait_for_pattern(&mut self, pattern: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.wait_internal(timeout, Some(pattern)).await
    }

    async fn wait_internal(&mut self, duration: Duration, pattern: Option<&str>) -> Result<Vec<u8>> {
        let mut output = std::mem::take(&mut self.pending);
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            if let Some(pat) = pattern {
                if String::from_utf8_lossy(&output).contains(pat) {
                    return Ok(output);
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            tokio::select! {
                msg = self.channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    }
                }
                _ = tokio::time::sleep(remaining) => break,
            }
        }

        let matched = pattern.map_or(true, |pat| String::from_utf8_lossy(&output).contains(pat));
        if !matched {
            anyhow::bail!(
                "timeout waiting for pattern, got {:?}",
                String::from_utf8_lossy(&output)
            );
        }
        Ok(output)
    }

    /// True once the server has closed the connection
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "goodbye", "en")
            .await
            .context("failed to disconnect")?;
        Ok(())
    }
}

/// Client handler that trusts any host key
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
