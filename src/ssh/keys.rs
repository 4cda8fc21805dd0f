//! Host key import

use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use tracing::info;

/// Key files looked up in the keys directory; missing ones are skipped
pub const HOST_KEY_NAMES: [&str; 2] = ["ssh_host_rsa_key", "ssh_host_ed25519_key"];

/// Load every host key present in `dir`
pub fn load_host_keys(dir: &Path) -> Result<Vec<PrivateKey>> {
    let mut keys = Vec::new();

    for name in HOST_KEY_NAMES {
        let path = dir.join(name);
        if !path.exists() {
            continue;
        }

        info!("loading key {}", path.display());
        let key = russh::keys::load_secret_key(&path, None)
            .with_context(|| format!("failed to load host key {}", path.display()))?;
        keys.push(key);
    }

    if keys.is_empty() {
        anyhow::bail!("no host keys found in {}", dir.display());
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::LineEnding;

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("termgate-keys-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_empty_dir_is_error() {
        let dir = scratch_dir();
        let err = load_host_keys(&dir).unwrap_err();
        assert!(err.to_string().contains("no host keys"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_rsa_key_skipped() {
        let dir = scratch_dir();
        let key = PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519).unwrap();
        std::fs::write(
            dir.join("ssh_host_ed25519_key"),
            key.to_openssh(LineEnding::LF).unwrap().as_bytes(),
        )
        .unwrap();

        let keys = load_host_keys(&dir).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].public_key().key_data(), key.public_key().key_data());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_corrupt_key_is_error() {
        let dir = scratch_dir();
        std::fs::write(dir.join("ssh_host_rsa_key"), "not a key").unwrap();
        assert!(load_host_keys(&dir).is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
