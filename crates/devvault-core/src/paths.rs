//! Standard paths used by devvault

use std::path::{Path, PathBuf};

/// Standard devvault paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Data directory (~/.local/share/devvault)
    pub data: PathBuf,
    /// Config directory (~/.config/devvault)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("devvault");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("devvault");

        Self { data, config }
    }

    /// Paths rooted at explicit directories (used by tests and `--data-dir`)
    pub fn with_dirs(data: &Path, config: &Path) -> Self {
        Self {
            data: data.to_path_buf(),
            config: config.to_path_buf(),
        }
    }

    /// Declared-mode configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("vault-mode.conf")
    }

    /// Root of everything the durable store owns
    pub fn durable_dir(&self) -> PathBuf {
        self.data.join("durable")
    }

    /// Raft storage directory of the durable store
    pub fn durable_storage(&self) -> PathBuf {
        self.durable_dir().join("raft")
    }

    /// Generated server configuration for durable mode
    pub fn durable_server_config(&self) -> PathBuf {
        self.durable_dir().join("server.hcl")
    }

    /// Unseal key set written at first durable initialization
    pub fn unseal_keys(&self) -> PathBuf {
        self.data.join("keys").join("unseal-keys.json")
    }

    /// Migration backups
    pub fn backups(&self) -> PathBuf {
        self.data.join("backups")
    }

    /// Durable storage and keys moved aside when leaving durable mode
    pub fn retired(&self) -> PathBuf {
        self.data.join("retired")
    }

    /// Pid file of the supervised store process
    pub fn pid_file(&self) -> PathBuf {
        self.data.join("store.pid")
    }

    /// Combined stdout/stderr of the supervised store process
    pub fn store_log(&self) -> PathBuf {
        self.data.join("store.log")
    }
}
