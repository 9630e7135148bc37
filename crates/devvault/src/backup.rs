//! Migration backups
//!
//! One directory per backup, one JSON file per secret (nested by secret
//! path), and a `metadata.json` written last. A directory without metadata
//! was interrupted mid-write and is never listed or restored.
//!
//! Storage: ~/.local/share/devvault/backups/

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::client::SecretDocument;
use crate::mode::Mode;

/// Name of the completion marker inside a backup directory
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup {0} is incomplete (no metadata.json)")]
    Incomplete(PathBuf),

    #[error("backup {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("refusing to store secret with unsafe path: {0}")]
    InvalidPath(String),

    #[error("backup not found: {0}")]
    NotFound(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Backup metadata; its presence marks the backup complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    pub timestamp: DateTime<Utc>,
    pub source_mode: Mode,
    pub target_mode: Mode,
    pub secret_count: usize,
    /// Secrets that could not be read from the source
    #[serde(default)]
    pub failed_paths: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// A single exported secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Path below the KV mount, e.g. `dev/ALPHA`
    pub path: String,
    pub data: SecretDocument,
}

/// A complete backup on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub dir: PathBuf,
    pub meta: BackupMeta,
}

impl BackupRecord {
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// A backup loaded for replay
#[derive(Debug, Clone)]
pub struct Backup {
    pub record: BackupRecord,
    pub entries: Vec<BackupEntry>,
}

/// Backup manager
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name for a new backup
    pub fn generate_name(source: Mode, target: Mode) -> String {
        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        format!("{}-{}-to-{}", timestamp, source, target)
    }

    /// Write a complete backup: entries first, metadata last
    pub fn write(
        &self,
        source: Mode,
        target: Mode,
        entries: &[BackupEntry],
        failed_paths: Vec<String>,
        warnings: Vec<String>,
    ) -> Result<BackupRecord, BackupError> {
        for entry in entries {
            validate_secret_path(&entry.path)?;
        }

        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
        fs::set_permissions(&self.root, Permissions::from_mode(0o700)).map_err(io_err(&self.root))?;

        let dir = self.unique_dir(&Self::generate_name(source, target));
        fs::create_dir(&dir).map_err(io_err(&dir))?;
        fs::set_permissions(&dir, Permissions::from_mode(0o700)).map_err(io_err(&dir))?;

        for entry in entries {
            let file = dir.join(format!("{}.json", entry.path));
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            let json = serde_json::to_string_pretty(entry).map_err(|e| BackupError::Corrupt {
                path: file.clone(),
                reason: e.to_string(),
            })?;
            write_private(&file, &json)?;
        }

        let meta = BackupMeta {
            timestamp: Utc::now(),
            source_mode: source,
            target_mode: target,
            secret_count: entries.len(),
            failed_paths,
            warnings,
        };
        let meta_path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&meta).map_err(|e| BackupError::Corrupt {
            path: meta_path.clone(),
            reason: e.to_string(),
        })?;
        write_private(&meta_path, &json)?;

        info!("backup written: {} ({} secrets)", dir.display(), meta.secret_count);
        Ok(BackupRecord { dir, meta })
    }

    fn unique_dir(&self, name: &str) -> PathBuf {
        let mut dir = self.root.join(name);
        let mut n = 2;
        while dir.exists() {
            dir = self.root.join(format!("{}-{}", name, n));
            n += 1;
        }
        dir
    }

    fn backup_dirs(&self) -> Result<Vec<PathBuf>, BackupError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Complete backups, newest first
    pub fn list(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let mut records = Vec::new();
        for dir in self.backup_dirs()? {
            match read_meta(&dir) {
                Ok(meta) => records.push(BackupRecord { dir, meta }),
                Err(e) => debug!("skipping {}: {}", dir.display(), e),
            }
        }
        records.sort_by(|a, b| {
            b.meta
                .timestamp
                .cmp(&a.meta.timestamp)
                .then_with(|| b.dir.cmp(&a.dir))
        });
        Ok(records)
    }

    /// Directories left behind by interrupted backups
    pub fn incomplete(&self) -> Result<Vec<PathBuf>, BackupError> {
        let mut dirs: Vec<PathBuf> = self
            .backup_dirs()?
            .into_iter()
            .filter(|d| !d.join(METADATA_FILE).exists())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    /// Resolve a backup given as a path or as a name under the backup root
    pub fn resolve(&self, name_or_path: &str) -> Result<PathBuf, BackupError> {
        let as_path = PathBuf::from(name_or_path);
        if as_path.is_dir() {
            return Ok(as_path);
        }
        let under_root = self.root.join(name_or_path);
        if under_root.is_dir() {
            return Ok(under_root);
        }
        Err(BackupError::NotFound(name_or_path.to_string()))
    }

    /// Load a complete backup for replay
    pub fn load(&self, dir: &Path) -> Result<Backup, BackupError> {
        let meta = read_meta(dir)?;
        let mut entries = Vec::new();

        for item in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let item = item.map_err(|e| BackupError::Corrupt {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
            let path = item.path();
            if !item.file_type().is_file() || path == dir.join(METADATA_FILE) {
                continue;
            }
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }

            let content = fs::read_to_string(path).map_err(io_err(path))?;
            let entry: BackupEntry = serde_json::from_str(&content).map_err(|e| BackupError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            entries.push(entry);
        }

        if entries.len() != meta.secret_count {
            return Err(BackupError::Corrupt {
                path: dir.to_path_buf(),
                reason: format!(
                    "metadata records {} secrets but {} files were found",
                    meta.secret_count,
                    entries.len()
                ),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Backup {
            record: BackupRecord {
                dir: dir.to_path_buf(),
                meta,
            },
            entries,
        })
    }

    /// Keep the `keep` newest complete backups; delete older ones and any
    /// incomplete directories. Returns what was removed.
    pub fn prune(&self, keep: usize) -> Result<Vec<PathBuf>, BackupError> {
        let mut pruned = Vec::new();

        for record in self.list()?.into_iter().skip(keep) {
            fs::remove_dir_all(&record.dir).map_err(io_err(&record.dir))?;
            pruned.push(record.dir);
        }
        for dir in self.incomplete()? {
            fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
            pruned.push(dir);
        }

        if !pruned.is_empty() {
            info!("pruned {} backups", pruned.len());
        }
        Ok(pruned)
    }
}

fn read_meta(dir: &Path) -> Result<BackupMeta, BackupError> {
    let meta_path = dir.join(METADATA_FILE);
    if !meta_path.exists() {
        return Err(BackupError::Incomplete(dir.to_path_buf()));
    }
    let content = fs::read_to_string(&meta_path).map_err(io_err(&meta_path))?;
    serde_json::from_str(&content).map_err(|e| BackupError::Corrupt {
        path: meta_path,
        reason: e.to_string(),
    })
}

fn write_private(path: &Path, content: &str) -> Result<(), BackupError> {
    fs::write(path, content).map_err(io_err(path))?;
    fs::set_permissions(path, Permissions::from_mode(0o600)).map_err(io_err(path))
}

/// Secret paths become file paths; keep them inside the backup directory
fn validate_secret_path(path: &str) -> Result<(), BackupError> {
    if path.is_empty() || path.ends_with('/') {
        return Err(BackupError::InvalidPath(path.to_string()));
    }
    let ok = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(BackupError::InvalidPath(path.to_string()));
    }
    Ok(())
}
