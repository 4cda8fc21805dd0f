//! Server configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::paths;

/// Topic prefix used when the recording section doesn't name one
pub const DEFAULT_RECORDING_TOPIC: &str = "ingest.tmate.recording";

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the SSH listener binds to
    pub bind_address: String,
    /// Port the SSH listener binds to
    pub port: u16,
    /// Directory holding `ssh_host_rsa_key` / `ssh_host_ed25519_key`
    pub keys_dir: PathBuf,
    /// Hostname advertised in connection hints
    pub host: String,
    /// Port advertised in connection hints (defaults to `port`)
    pub advertised_port: Option<u16>,
    /// Expect a PROXY protocol v1 header in front of every connection
    pub use_proxy_protocol: bool,
    /// Seconds a connection may take to authenticate and pick a role
    pub grace_period_secs: u64,
    /// SSH keepalive interval once a role is fixed (0 = disabled)
    pub keepalive_secs: u64,
    /// Allow the exec role (`ssh host <command>`)
    pub exec_enabled: bool,
    /// SSH identification string sent to clients
    pub server_id: String,
    /// Authentication policy settings
    pub auth: AuthConfig,
    /// Session recording; absent means recording is disabled
    pub recording: Option<RecordingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2200,
            keys_dir: paths::keys_dir(),
            host: "localhost".to_string(),
            advertised_port: None,
            use_proxy_protocol: false,
            grace_period_secs: 60,
            keepalive_secs: 300,
            exec_enabled: false,
            server_id: "SSH-2.0-tmate".to_string(),
            auth: AuthConfig::default(),
            recording: None,
        }
    }
}

/// Authentication policy settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept the `none` method (anonymous read-only viewers)
    pub allow_none: bool,
    /// Restrict public keys to those listed in this file
    pub authorized_keys: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_none: true,
            authorized_keys: None,
        }
    }
}

/// Recording relay settings
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Message bus URL, e.g. `nats://127.0.0.1:4222`
    pub url: String,
    /// Topic prefix; data goes to `<topic>.<token>`, the end marker to `<topic>.<token>.end`
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Delay between end-of-session flush attempts
    #[serde(default = "default_flush_retry_ms")]
    pub flush_retry_ms: u64,
    /// Chunks buffered between the session and its recorder
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,
}

fn default_topic() -> String {
    DEFAULT_RECORDING_TOPIC.to_string()
}

fn default_flush_retry_ms() -> u64 {
    1000
}

fn default_buffer_chunks() -> usize {
    256
}

impl RecordingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            topic: default_topic(),
            flush_retry_ms: default_flush_retry_ms(),
            buffer_chunks: default_buffer_chunks(),
        }
    }

    pub fn flush_retry_delay(&self) -> Duration {
        Duration::from_millis(self.flush_retry_ms)
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults when absent
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        tracing::info!("loaded config from {}", path.display());

        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if self.grace_period_secs == 0 {
            anyhow::bail!("grace_period_secs must be non-zero");
        }
        if let Some(ref recording) = self.recording {
            if recording.topic.is_empty() {
                anyhow::bail!("recording.topic must not be empty");
            }
            if recording.buffer_chunks == 0 {
                anyhow::bail!("recording.buffer_chunks must be non-zero");
            }
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }

    /// Human-facing `ssh` command line for joining a session
    ///
    /// The `-p` flag is omitted when the advertised port is 22.
    pub fn connection_hint(&self, session_token: &str) -> String {
        let port = self.advertised_port.unwrap_or(self.port);
        let port_arg = if port != 22 {
            format!(" -p{}", port)
        } else {
            String::new()
        };
        format!("ssh{} {}@{}", port_arg, session_token, self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 2200);
        assert_eq!(config.grace_period(), Duration::from_secs(60));
        assert!(!config.use_proxy_protocol);
        assert!(!config.exec_enabled);
        assert!(config.recording.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_document() {
        let config = Config::parse(
            r#"
            bind_address = "127.0.0.1"
            port = 2222
            host = "tmate.example.org"
            use_proxy_protocol = true
            exec_enabled = true
            grace_period_secs = 10

            [auth]
            allow_none = false

            [recording]
            url = "nats://127.0.0.1:4222"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.port, 2222);
        assert!(config.use_proxy_protocol);
        assert!(config.exec_enabled);
        assert!(!config.auth.allow_none);

        let recording = config.recording.unwrap();
        assert_eq!(recording.url, "nats://127.0.0.1:4222");
        assert_eq!(recording.topic, DEFAULT_RECORDING_TOPIC);
        assert_eq!(recording.flush_retry_delay(), Duration::from_secs(1));
        assert_eq!(recording.buffer_chunks, 256);
    }

    #[test]
    fn test_validation_rejects_zero_grace_period() {
        assert!(Config::parse("grace_period_secs = 0").is_err());
        assert!(Config::parse("port = 0").is_err());
    }

    #[test]
    fn test_validation_rejects_empty_topic() {
        let err = Config::parse(
            r#"
            [recording]
            url = "nats://localhost"
            topic = ""
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_connection_hint_omits_default_port() {
        let config = Config {
            host: "tmate.io".to_string(),
            port: 22,
            ..Default::default()
        };
        assert_eq!(config.connection_hint("abc123"), "ssh abc123@tmate.io");
    }

    #[test]
    fn test_connection_hint_prefers_advertised_port() {
        let config = Config {
            host: "tmate.io".to_string(),
            port: 2200,
            advertised_port: Some(443),
            ..Default::default()
        };
        assert_eq!(config.connection_hint("abc123"), "ssh -p443 abc123@tmate.io");

        let config = Config {
            advertised_port: Some(22),
            ..config
        };
        assert_eq!(config.connection_hint("abc123"), "ssh abc123@tmate.io");
    }

    #[test]
    fn test_keepalive_zero_disables() {
        let config = Config {
            keepalive_secs: 0,
            ..Default::default()
        };
        assert!(config.keepalive().is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/termgate.toml").unwrap();
        assert_eq!(config.port, 2200);
    }
}
