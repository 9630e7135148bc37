//! Unseal key set
//!
//! Written once, when a durable store is first initialized, to a file only
//! the owner can read. Nothing in this crate rewrites it; it is moved aside
//! when durable mode is left and deleted only by `reset`. Only previews of
//! the shares ever reach output or logs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use devvault_core::preview;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::client::InitResponse;

#[derive(Error, Debug)]
pub enum KeySetError {
    #[error("no unseal key file at {0}")]
    NotFound(PathBuf),

    #[error("unseal key file {path} is not valid: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("unseal key file {0} already exists - refusing to overwrite key material")]
    AlreadyExists(PathBuf),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> KeySetError + '_ {
    move |source| KeySetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn default_threshold() -> u32 {
    crate::settings::KEY_THRESHOLD as u32
}

/// Shares and root credential produced by the first durable init
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsealKeySet {
    /// Raw (hex) shares, in the order the store issued them
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    pub root_token: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for UnsealKeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsealKeySet")
            .field("keys", &self.previews())
            .field("threshold", &self.threshold)
            .field("root_token", &preview(&self.root_token))
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl UnsealKeySet {
    pub fn from_init(init: InitResponse, threshold: u32) -> Self {
        Self {
            keys: init.keys,
            keys_base64: init.keys_base64,
            threshold,
            root_token: init.root_token,
            created_at: Utc::now(),
        }
    }

    /// Whether there are enough shares to meet `threshold`
    pub fn has_quorum(&self, threshold: u32) -> bool {
        self.keys.len() >= threshold as usize
    }

    /// Diagnostic previews of every share
    pub fn previews(&self) -> Vec<String> {
        self.keys.iter().map(|k| preview(k)).collect()
    }

    /// Indices of `keys_base64` entries that do not decode
    pub fn invalid_base64(&self) -> Vec<usize> {
        self.keys_base64
            .iter()
            .enumerate()
            .filter(|(_, k)| STANDARD.decode(k.as_bytes()).is_err())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Location of the key set on disk
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<UnsealKeySet, KeySetError> {
        if !self.path.exists() {
            return Err(KeySetError::NotFound(self.path.clone()));
        }
        let content = fs::read_to_string(&self.path).map_err(io_err(&self.path))?;
        let keys: UnsealKeySet = serde_json::from_str(&content).map_err(|e| KeySetError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        if keys.root_token.is_empty() {
            return Err(KeySetError::Malformed {
                path: self.path.clone(),
                reason: "root_token is empty".to_string(),
            });
        }
        Ok(keys)
    }

    /// Persist a brand-new key set; never replaces an existing file
    pub fn save_new(&self, keys: &UnsealKeySet) -> Result<(), KeySetError> {
        if self.path.exists() {
            return Err(KeySetError::AlreadyExists(self.path.clone()));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
            fs::set_permissions(parent, Permissions::from_mode(0o700)).map_err(io_err(parent))?;
        }

        let json = serde_json::to_string_pretty(keys).map_err(|e| KeySetError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => KeySetError::AlreadyExists(self.path.clone()),
                _ => KeySetError::Io {
                    path: self.path.clone(),
                    source: e,
                },
            })?;
        file.write_all(json.as_bytes()).map_err(io_err(&self.path))?;
        file.sync_all().map_err(io_err(&self.path))?;

        // umask may have widened the creation mode
        fs::set_permissions(&self.path, Permissions::from_mode(0o600)).map_err(io_err(&self.path))?;
        Ok(())
    }

    /// Permission bits of the key file, if it exists
    pub fn permissions(&self) -> Option<u32> {
        fs::metadata(&self.path)
            .ok()
            .map(|m| m.permissions().mode() & 0o777)
    }

    /// Move the key file into `dir`, returning its new location
    pub fn retire(&self, dir: &Path) -> Result<Option<PathBuf>, KeySetError> {
        if !self.path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        fs::set_permissions(dir, Permissions::from_mode(0o700)).map_err(io_err(dir))?;

        let name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "unseal-keys.json".into());
        let dest = dir.join(name);
        fs::rename(&self.path, &dest).map_err(io_err(&self.path))?;
        Ok(Some(dest))
    }

    /// Delete the key file. Only `reset` calls this.
    pub fn destroy(&self) -> Result<bool, KeySetError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(KeySetError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_key_set(count: usize) -> UnsealKeySet {
    UnsealKeySet {
        keys: (0..count).map(|i| format!("share-{}-0123456789abcdef", i)).collect(),
        keys_base64: (0..count).map(|_| "c2hhcmU=".to_string()).collect(),
        threshold: 3,
        root_token: "hvs.root-token-for-tests".to_string(),
        created_at: Utc::now(),
    }
}
