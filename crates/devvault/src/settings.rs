//! Runtime settings
//!
//! Everything a component needs to know about its environment (store
//! address, credentials, locations, timing) is collected here once, at
//! startup, and handed to each component when it is built.

use anyhow::{bail, Context, Result};
use devvault_core::Paths;
use reqwest::Url;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default store address
pub const DEFAULT_ADDR: &str = "http://127.0.0.1:8200";

/// Root token the ephemeral dev server is launched with
pub const DEFAULT_DEV_TOKEN: &str = "root";

/// Namespaces enumerated under `secret/` when taking a backup
pub const DEFAULT_NAMESPACES: &[&str] = &["dev", "shared", "ci"];

/// Number of key shares requested at durable initialization
pub const KEY_SHARES: u8 = 5;

/// Shares required to unseal
pub const KEY_THRESHOLD: u8 = 3;

/// Complete backups kept by retention
pub const BACKUP_RETENTION: usize = 5;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the store API
    pub addr: String,
    /// Pre-supplied administrative token; overrides the per-mode token
    pub token: Option<String>,
    /// Root token id passed to the ephemeral dev server
    pub dev_token: String,
    /// Store executable used in launch commands
    pub store_bin: String,
    pub paths: Paths,
    pub namespaces: Vec<String>,
    pub key_shares: u8,
    pub key_threshold: u8,
    pub backup_retention: usize,
    /// Waiting for the store to answer after a start
    pub startup: RetryPolicy,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when stopping the store
    pub stop_grace: Duration,
}

impl Settings {
    pub fn new(addr: &str, paths: Paths) -> Result<Self> {
        let settings = Self {
            addr: addr.trim_end_matches('/').to_string(),
            token: None,
            dev_token: DEFAULT_DEV_TOKEN.to_string(),
            store_bin: "vault".to_string(),
            paths,
            namespaces: DEFAULT_NAMESPACES.iter().map(|s| s.to_string()).collect(),
            key_shares: KEY_SHARES,
            key_threshold: KEY_THRESHOLD,
            backup_retention: BACKUP_RETENTION,
            startup: RetryPolicy::default(),
            request_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
        };
        settings.listen_address()?;
        Ok(settings)
    }

    /// `host:port` the store should listen on, derived from `addr`
    pub fn listen_address(&self) -> Result<String> {
        let url = Url::parse(&self.addr)
            .with_context(|| format!("Invalid store address: {}", self.addr))?;

        let host = match url.host_str() {
            Some(h) => h.to_string(),
            None => bail!("Store address has no host: {}", self.addr),
        };
        let port = url.port_or_known_default().unwrap_or(8200);

        Ok(format!("{}:{}", host, port))
    }
}
