//! Centralized path resolution for termgate
//!
//! Follows XDG Base Directory Specification with 12-factor env var overrides.
//!
//! ## Directory Layout
//!
//! ```text
//! ~/.config/termgate/          (XDG_CONFIG_HOME)
//! ├── termgate.toml
//! └── keys/
//!     ├── ssh_host_ed25519_key
//!     └── ssh_host_rsa_key
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TERMGATE_CONFIG` | Config file path | `~/.config/termgate/termgate.toml` |
//! | `TERMGATE_KEYS_DIR` | Host key directory | `~/.config/termgate/keys` |

use std::path::PathBuf;

/// Get the XDG config directory for termgate
///
/// Priority: `XDG_CONFIG_HOME` > `~/.config`
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("termgate");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/termgate");
    }

    // Last resort: current directory
    PathBuf::from(".")
}

/// Get the config file path
///
/// Priority: explicit argument > `TERMGATE_CONFIG` env var > `config_dir()/termgate.toml`
pub fn config_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    std::env::var("TERMGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("termgate.toml"))
}

/// Get the default host key directory
///
/// Priority: `TERMGATE_KEYS_DIR` env var > `config_dir()/keys`
pub fn keys_dir() -> PathBuf {
    std::env::var("TERMGATE_KEYS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("keys"))
}
