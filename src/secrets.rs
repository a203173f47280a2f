//! Persistent device-secret store
//!
//! Pairing with locked speakers yields an opaque per-device secret that
//! must survive restarts. Secrets live in a flat JSON object mapping device
//! id to secret string; every update rewrites the file atomically (write to
//! a sibling temp file, then rename) so a crash never leaves a truncated
//! store behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::Result;

/// Thread-safe secret store backed by a JSON file.
pub struct SecretStore {
    path: PathBuf,
    secrets: Mutex<BTreeMap<String, String>>,
}

impl SecretStore {
    /// Open the store at `path`, loading existing secrets if present.
    /// Unreadable or malformed files start the store empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let secrets = std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default();
        Self {
            path,
            secrets: Mutex::new(secrets),
        }
    }

    /// Look up the secret for a device id.
    pub fn get(&self, device_id: &str) -> Option<String> {
        self.secrets.lock().unwrap().get(device_id).cloned()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.secrets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a secret and persist the whole map.
    pub fn set(&self, device_id: &str, secret: &str) -> Result<()> {
        let snapshot = {
            let mut secrets = self.secrets.lock().unwrap();
            secrets.insert(device_id.to_string(), secret.to_string());
            secrets.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, secrets: &BTreeMap<String, String>) -> Result<()> {
        let data = serde_json::to_string_pretty(secrets)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::load(dir.path().join("secrets.json"));
        assert_eq!(store.get("dev"), None);
    }

    #[test]
    fn test_set_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let store = SecretStore::load(&path);
        store.set("speaker-a", "s3cret").unwrap();
        assert_eq!(store.get("speaker-a").as_deref(), Some("s3cret"));

        // A fresh store sees the persisted value.
        let reloaded = SecretStore::load(&path);
        assert_eq!(reloaded.get("speaker-a").as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_update_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let store = SecretStore::load(&path);
        store.set("dev", "one").unwrap();
        store.set("dev", "two").unwrap();
        assert_eq!(store.get("dev").as_deref(), Some("two"));

        // No temp file left behind after the rename.
        assert!(!tmp_path(&path).exists());
    }
}
