//! Auto-unseal agent
//!
//! Runs once per store start. It only ever reads the key set, and it is
//! only invoked automatically when the configuration allows it; otherwise
//! the store stays sealed and the operator gets instructions.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{SealStatus, StoreApi, StoreError};
use crate::keys::{KeySetError, KeyStore};
use crate::settings::Settings;

/// Result of one unseal attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnsealOutcome {
    AlreadyUnsealed,
    Unsealed { submitted: usize },
    InsufficientKeys { available: usize, threshold: u32 },
    Unreachable,
    Failed { progress: u32, threshold: u32, reason: String },
}

impl UnsealOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyUnsealed => "already_unsealed",
            Self::Unsealed { .. } => "unsealed",
            Self::InsufficientKeys { .. } => "insufficient_keys",
            Self::Unreachable => "unreachable",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::AlreadyUnsealed | Self::Unsealed { .. })
    }

    /// Manual recovery steps for the operator
    pub fn guidance(&self, settings: &Settings) -> Vec<String> {
        let keys = settings.paths.unseal_keys();
        match self {
            Self::AlreadyUnsealed | Self::Unsealed { .. } => Vec::new(),
            Self::Unreachable => vec![
                format!("The store at {} is not answering.", settings.addr),
                "Start it with: devvault start".to_string(),
                format!("Store output: {}", settings.paths.store_log().display()),
            ],
            Self::InsufficientKeys {
                available,
                threshold,
            } => vec![
                format!(
                    "Only {} of the {} required unseal shares are available in {}.",
                    available,
                    threshold,
                    keys.display()
                ),
                "Shares are never regenerated. Locate the original shares and run:".to_string(),
                manual_unseal_command(settings, *threshold),
                "If the shares are lost, durable data is unrecoverable: devvault reset".to_string(),
            ],
            Self::Failed {
                progress,
                threshold,
                reason,
            } => vec![
                format!("Unseal failed ({}/{} shares accepted): {}", progress, threshold, reason),
                "Unseal manually with shares from the key file:".to_string(),
                manual_unseal_command(settings, (*threshold).max(1)),
                format!("Key file: {}", keys.display()),
            ],
        }
    }
}

/// The exact manual unseal command, repeated `threshold` times
pub fn manual_unseal_command(settings: &Settings, threshold: u32) -> String {
    format!(
        "VAULT_ADDR={} {} operator unseal   # repeat {} times, one share each",
        settings.addr, settings.store_bin, threshold
    )
}

/// Where a run of share submissions ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitResult {
    pub status: SealStatus,
    pub submitted: usize,
}

/// Submit shares in order, stopping as soon as the store reports unsealed.
///
/// A share the store rejects is skipped; losing contact with the store is
/// an error.
pub fn submit_shares(store: &dyn StoreApi, keys: &[String]) -> Result<SubmitResult, StoreError> {
    let mut status = store.seal_status()?;
    let mut submitted = 0;

    for (i, key) in keys.iter().enumerate() {
        if !status.sealed {
            break;
        }
        match store.unseal(key) {
            Ok(next) => {
                submitted += 1;
                status = next;
                debug!("unseal share {}: progress {}/{}", i + 1, status.progress, status.threshold);
            }
            Err(e) if e.is_unreachable() => return Err(e),
            Err(e) => {
                submitted += 1;
                warn!("unseal share {} rejected: {}", i + 1, e);
                status = store.seal_status()?;
            }
        }
    }

    Ok(SubmitResult { status, submitted })
}

/// Unseals a durable store from the persisted key set
pub struct AutoUnsealer<'a> {
    store: &'a dyn StoreApi,
    keys: &'a KeyStore,
}

impl<'a> AutoUnsealer<'a> {
    pub fn new(store: &'a dyn StoreApi, keys: &'a KeyStore) -> Self {
        Self { store, keys }
    }

    pub fn attempt_unseal(&self) -> UnsealOutcome {
        if let Err(e) = self.store.health() {
            debug!("health check failed: {}", e);
            return UnsealOutcome::Unreachable;
        }

        let status = match self.store.seal_status() {
            Ok(s) => s,
            Err(StoreError::Unreachable(_)) => return UnsealOutcome::Unreachable,
            Err(e) => {
                return UnsealOutcome::Failed {
                    progress: 0,
                    threshold: 0,
                    reason: e.to_string(),
                }
            }
        };

        if !status.sealed {
            return UnsealOutcome::AlreadyUnsealed;
        }
        if !status.initialized {
            return UnsealOutcome::Failed {
                progress: 0,
                threshold: 0,
                reason: "store is not initialized - run devvault start to initialize it".to_string(),
            };
        }

        let key_set = match self.keys.load() {
            Ok(k) => k,
            Err(KeySetError::NotFound(_)) => {
                return UnsealOutcome::InsufficientKeys {
                    available: 0,
                    threshold: status.threshold,
                }
            }
            Err(e) => {
                return UnsealOutcome::Failed {
                    progress: status.progress,
                    threshold: status.threshold,
                    reason: e.to_string(),
                }
            }
        };

        // The store's own threshold is authoritative
        let threshold = if status.threshold > 0 {
            status.threshold
        } else {
            key_set.threshold
        };
        if !key_set.has_quorum(threshold) {
            return UnsealOutcome::InsufficientKeys {
                available: key_set.keys.len(),
                threshold,
            };
        }

        info!("submitting unseal shares (threshold {})", threshold);
        match submit_shares(self.store, &key_set.keys) {
            Ok(result) if !result.status.sealed => UnsealOutcome::Unsealed {
                submitted: result.submitted,
            },
            Ok(result) => UnsealOutcome::Failed {
                progress: result.status.progress,
                threshold,
                reason: "store still sealed after every available share was submitted".to_string(),
            },
            Err(StoreError::Unreachable(_)) => UnsealOutcome::Unreachable,
            Err(e) => UnsealOutcome::Failed {
                progress: 0,
                threshold,
                reason: e.to_string(),
            },
        }
    }
}
