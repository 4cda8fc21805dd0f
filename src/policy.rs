//! Authentication policy
//!
//! Consulted synchronously from the SSH auth callbacks, inside the grace
//! period, so implementations must answer from memory.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::AuthConfig;

/// Decides whether a user (and optionally a `"<type> <base64>"` key) may log in
pub trait AuthPolicy: Send + Sync {
    fn would_allow_auth(&self, username: &str, pubkey: Option<&str>) -> bool;
}

/// Policy built from the `[auth]` config section
#[derive(Debug, Clone, Default)]
pub struct ConfigPolicy {
    allow_none: bool,
    /// `None` accepts every key
    authorized_keys: Option<HashSet<String>>,
}

impl ConfigPolicy {
    pub fn new(allow_none: bool, authorized_keys: Option<HashSet<String>>) -> Self {
        Self {
            allow_none,
            authorized_keys,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let authorized_keys = match config.authorized_keys {
            Some(ref path) => Some(load_authorized_keys(path)?),
            None => None,
        };
        Ok(Self::new(config.allow_none, authorized_keys))
    }
}

impl AuthPolicy for ConfigPolicy {
    fn would_allow_auth(&self, username: &str, pubkey: Option<&str>) -> bool {
        if username.is_empty() {
            return false;
        }
        match pubkey {
            None => self.allow_none,
            Some(key) => self
                .authorized_keys
                .as_ref()
                .map_or(true, |keys| keys.contains(key)),
        }
    }
}

/// Read an authorized_keys-style file into `"<type> <base64>"` entries
pub fn load_authorized_keys(path: &Path) -> Result<HashSet<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let keys = parse_authorized_keys(&content);
    tracing::info!("loaded {} authorized keys from {}", keys.len(), path.display());
    Ok(keys)
}

fn parse_authorized_keys(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key_type = parts.next()?;
            let key_b64 = parts.next()?;
            Some(format!("{} {}", key_type, key_b64))
        })
        .collect()
}
