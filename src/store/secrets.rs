//! Filesystem-backed secret store.
//!
//! Opaque named secrets under `<state>/secrets/<name>`. Issuance generates
//! a random url-safe token; an existing secret is returned unchanged so
//! tokens are stable across runs.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tracing::info;

use super::atomic_write;
use crate::error::Result;

const TOKEN_BYTES: usize = 16;

/// Filesystem secret store rooted at `<state>/secrets`.
pub struct SecretStore {
    dir: PathBuf,
}

impl SecretStore {
    /// Open (creating the directory as needed) the store at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(SecretStore {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Fetch a secret by name.
    pub fn get(&self, name: &str) -> Result<Option<String>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Issue a secret for `name`, returning the existing value when present.
    pub fn issue(&self, name: &str) -> Result<String> {
        if let Some(existing) = self.get(name)? {
            return Ok(existing);
        }

        info!(name, "issuing secret");
        let mut material = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut material);
        let token = URL_SAFE_NO_PAD.encode(material);
        atomic_write(&self.path(name), token.as_bytes())?;
        Ok(token)
    }

    /// Names of all stored secrets, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_is_idempotent_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path()).unwrap();
        let first = store.issue("kube-password").unwrap();
        let second = store.issue("kube-password").unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn secrets_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let token = SecretStore::open(dir.path()).unwrap().issue("kubelet-token").unwrap();
        let store = SecretStore::open(dir.path()).unwrap();
        assert_eq!(store.get("kubelet-token").unwrap(), Some(token));
    }

    #[test]
    fn distinct_names_get_distinct_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path()).unwrap();
        let a = store.issue("token-a").unwrap();
        let b = store.issue("token-b").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.list().unwrap(), vec!["token-a".to_string(), "token-b".to_string()]);
    }
}
