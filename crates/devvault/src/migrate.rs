//! Migration engine
//!
//! Moves the store between modes:
//!
//! ```text
//! Idle -> BackingUp -> Stopping -> Reconfiguring -> Starting
//!      -> [Initializing] -> [Unsealing] -> Restoring -> Done
//! ```
//!
//! Any step can end in `Failed`. Nothing is stopped until a complete backup
//! is on disk, and a failure after that point leaves the backup in place for
//! `devvault rollback`. Per-secret problems during backup or restore are
//! counted and reported, never fatal on their own.

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::Serialize;
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backup::{BackupEntry, BackupRecord, BackupStore};
use crate::client::{StoreApi, StoreError};
use crate::config::{durable_server_hcl, ConfigStore, Configuration};
use crate::controller::token_for;
use crate::keys::{KeyStore, UnsealKeySet};
use crate::mode::Mode;
use crate::process::{StopOutcome, StoreProcess};
use crate::retry::{poll, PollOutcome};
use crate::settings::Settings;
use crate::unseal::{manual_unseal_command, submit_shares};
use devvault_core::preview;

/// Where a migration is (or stopped)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStage {
    Idle,
    BackingUp,
    Stopping,
    Reconfiguring,
    Starting,
    Initializing,
    Unsealing,
    Restoring,
    Done,
    Failed,
}

impl MigrationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::BackingUp => "backing-up",
            Self::Stopping => "stopping",
            Self::Reconfiguring => "reconfiguring",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Unsealing => "unsealing",
            Self::Restoring => "restoring",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the operator asked for
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub source: Configuration,
    pub target: Configuration,
    /// Replay the backup into the target store; false discards secrets
    pub restore: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Completed,
    /// Finished, but some secrets were not carried over
    Degraded,
    Failed { stage: MigrationStage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub path: String,
    pub reason: String,
}

/// Outcome of replaying a backup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    pub failures: Vec<ItemFailure>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What the active store looked like when the backup was taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceState {
    #[default]
    Readable,
    Unreachable,
    Sealed,
}

/// Secrets read from the active store
#[derive(Debug, Default)]
pub struct Export {
    pub entries: Vec<BackupEntry>,
    pub failures: Vec<ItemFailure>,
    pub warnings: Vec<String>,
    pub source: SourceState,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub source: Mode,
    pub target: Mode,
    pub backup: Option<PathBuf>,
    pub source_state: SourceState,
    pub backed_up: usize,
    pub backup_failures: Vec<ItemFailure>,
    pub stages: Vec<MigrationStage>,
    pub restore_requested: bool,
    pub restore: RestoreReport,
    pub warnings: Vec<String>,
    /// Durable storage and keys moved aside when leaving durable mode
    pub retired: Option<PathBuf>,
    pub config_committed: bool,
    pub pruned: usize,
    pub outcome: MigrationOutcome,
}

impl MigrationReport {
    fn new(plan: &MigrationPlan) -> Self {
        Self {
            source: plan.source.mode,
            target: plan.target.mode,
            backup: None,
            source_state: SourceState::Readable,
            backed_up: 0,
            backup_failures: Vec::new(),
            stages: vec![MigrationStage::Idle],
            restore_requested: plan.restore,
            restore: RestoreReport::default(),
            warnings: Vec::new(),
            retired: None,
            config_committed: false,
            pruned: 0,
            outcome: MigrationOutcome::Completed,
        }
    }

    pub fn final_stage(&self) -> MigrationStage {
        self.stages.last().copied().unwrap_or(MigrationStage::Idle)
    }

    /// The switch ran to the end, though some secrets may not have made it
    pub fn succeeded(&self) -> bool {
        !matches!(self.outcome, MigrationOutcome::Failed { .. })
    }

    /// Every secret that was asked for arrived in the new store
    pub fn is_clean(&self) -> bool {
        self.outcome == MigrationOutcome::Completed
    }

    /// Exact commands that recover from whatever went wrong
    pub fn recovery_commands(&self, settings: &Settings) -> Vec<String> {
        let mut commands = Vec::new();

        if let MigrationOutcome::Failed { stage, .. } = &self.outcome {
            if let Some(ref retired) = self.retired {
                if !self.config_committed {
                    commands.push(format!(
                        "mv {} {}",
                        retired.join("raft").display(),
                        settings.paths.durable_storage().display()
                    ));
                    commands.push(format!(
                        "mv {} {}",
                        retired.join("unseal-keys.json").display(),
                        settings.paths.unseal_keys().display()
                    ));
                }
            }
            let retry = format!("devvault switch {} --migrate", self.target);
            match stage {
                MigrationStage::BackingUp if self.source_state == SourceState::Sealed => {
                    commands.push("devvault unseal".to_string());
                    commands.push(manual_unseal_command(settings, settings.key_threshold as u32));
                    commands.push(retry);
                }
                MigrationStage::Stopping => {
                    commands.push(format!("pkill -f '{} server'", settings.store_bin));
                    commands.push(retry);
                }
                MigrationStage::Unsealing => {
                    commands.push(manual_unseal_command(settings, settings.key_threshold as u32))
                }
                MigrationStage::Initializing => commands.push("devvault reset".to_string()),
                _ => {}
            }
            let old_store_untouched = matches!(stage, MigrationStage::BackingUp | MigrationStage::Stopping);
            if !self.config_committed && !old_store_untouched {
                commands.push("devvault start".to_string());
            }
        }

        let lost_items = !self.restore.failures.is_empty() || !self.backup_failures.is_empty();
        let failed_after_stop = matches!(
            self.outcome,
            MigrationOutcome::Failed { stage, .. }
                if !matches!(stage, MigrationStage::BackingUp | MigrationStage::Stopping)
        );
        if let Some(ref dir) = self.backup {
            if self.restore_requested && (lost_items || failed_after_stop) {
                commands.push(format!("devvault rollback {}", dir.display()));
            }
        }

        commands
    }
}

/// Drives one mode switch (or one rollback) against the store
pub struct MigrationEngine<'a> {
    settings: &'a Settings,
    config: &'a ConfigStore,
    store: &'a mut dyn StoreApi,
    process: &'a mut dyn StoreProcess,
    backups: BackupStore,
    keys: KeyStore,
    stage: MigrationStage,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(
        settings: &'a Settings,
        config: &'a ConfigStore,
        store: &'a mut dyn StoreApi,
        process: &'a mut dyn StoreProcess,
    ) -> Self {
        Self {
            settings,
            config,
            store,
            process,
            backups: BackupStore::new(&settings.paths.backups()),
            keys: KeyStore::new(&settings.paths.unseal_keys()),
            stage: MigrationStage::Idle,
        }
    }

    pub fn stage(&self) -> MigrationStage {
        self.stage
    }

    pub(crate) fn store(&self) -> &dyn StoreApi {
        &*self.store
    }

    fn enter(&mut self, stage: MigrationStage, report: &mut MigrationReport) {
        info!("migration: {} -> {}", self.stage, stage);
        self.stage = stage;
        report.stages.push(stage);
    }

    fn fail(&mut self, mut report: MigrationReport, reason: String) -> MigrationReport {
        let stage = self.stage;
        warn!("migration failed while {}: {}", stage, reason);
        self.enter(MigrationStage::Failed, &mut report);
        report.outcome = MigrationOutcome::Failed { stage, reason };
        report.pruned = self.prune(&mut report.warnings);
        report
    }

    fn prune(&self, warnings: &mut Vec<String>) -> usize {
        match self.backups.prune(self.settings.backup_retention) {
            Ok(pruned) => pruned.len(),
            Err(e) => {
                warnings.push(format!("backup retention failed: {}", e));
                0
            }
        }
    }

    /// Run a full mode switch
    pub fn migrate(&mut self, plan: &MigrationPlan) -> MigrationReport {
        let mut report = MigrationReport::new(plan);
        let source = plan.source.mode;
        let target = plan.target.mode;

        // Backing up
        self.enter(MigrationStage::BackingUp, &mut report);
        let export = self.export_secrets();
        report.source_state = export.source;
        report.backed_up = export.entries.len();
        report.backup_failures = export.failures.clone();
        report.warnings.extend(export.warnings.iter().cloned());
        if plan.restore && export.source == SourceState::Sealed {
            return self.fail(
                report,
                format!("{} store is sealed; unseal it so its secrets can be carried over", source),
            );
        }
        let entries = export.entries.clone();
        match self.write_backup(source, target, export) {
            Ok(record) => report.backup = Some(record.dir),
            Err(e) => return self.fail(report, format!("backup could not be written: {:#}", e)),
        }

        // Stopping
        self.enter(MigrationStage::Stopping, &mut report);
        match self.process.stop() {
            Ok(StopOutcome::Stopped { pid, forced }) => {
                debug!("stopped store pid {} (forced: {})", pid, forced);
            }
            Ok(StopOutcome::NotRunning) => {
                report
                    .warnings
                    .push("store process was not running; nothing to stop".to_string());
            }
            Err(e) => return self.fail(report, format!("could not stop the store: {}", e)),
        }
        if let Err(reason) = self.wait_stopped() {
            return self.fail(report, reason);
        }

        // Reconfiguring
        self.enter(MigrationStage::Reconfiguring, &mut report);
        let prepared = match target {
            Mode::Durable => self.prepare_durable().map(|_| None),
            Mode::Ephemeral if source == Mode::Durable => self.retire_durable(),
            Mode::Ephemeral => Ok(None),
        };
        match prepared {
            Ok(retired) => report.retired = retired,
            Err(e) => return self.fail(report, format!("{:#}", e)),
        }

        // Starting
        self.enter(MigrationStage::Starting, &mut report);
        if let Err(e) = self.process.start(&plan.target.launch_command) {
            return self.fail(report, format!("could not start the store: {}", e));
        }
        if let Err(reason) = self.wait_reachable().and_then(|_| self.confirm_launched(target)) {
            return self.fail(report, reason);
        }
        if let Err(e) = self.config.save(&plan.target) {
            return self.fail(
                report,
                format!("store is up in {} mode but the configuration could not be saved: {}", target, e),
            );
        }
        report.config_committed = true;

        if target == Mode::Durable {
            if let Err(reason) = self.bring_up_durable(&mut report) {
                return self.fail(report, reason);
            }
        }
        match token_for(target, self.settings, &self.keys) {
            Some(token) => self.store.set_token(&token),
            None => report
                .warnings
                .push(format!("no administrative token available for {} mode", target)),
        }
        if target == Mode::Durable {
            match self.store.enable_kv() {
                Ok(true) => info!("mounted kv-v2 secrets engine at secret/"),
                Ok(false) => debug!("secret/ already mounted"),
                Err(e) => report
                    .warnings
                    .push(format!("could not mount secret/ engine: {}", e)),
            }
        }

        // Restoring
        if plan.restore {
            self.enter(MigrationStage::Restoring, &mut report);
            report.restore = self.restore(&entries);
        } else {
            info!("secrets discarded at operator request");
        }

        self.enter(MigrationStage::Done, &mut report);
        let nothing_lost = report.restore.is_clean()
            && report.backup_failures.is_empty()
            && (!plan.restore || report.source_state == SourceState::Readable);
        report.outcome = if nothing_lost {
            MigrationOutcome::Completed
        } else {
            MigrationOutcome::Degraded
        };
        report.pruned = self.prune(&mut report.warnings);
        report
    }

    /// Initialize (first time only) and unseal a freshly started durable store
    fn bring_up_durable(&mut self, report: &mut MigrationReport) -> std::result::Result<(), String> {
        let status = self
            .store
            .seal_status()
            .map_err(|e| format!("could not read seal status: {}", e))?;

        if !status.initialized {
            self.enter(MigrationStage::Initializing, report);
            self.initialize()?;
        }

        let status = self
            .store
            .seal_status()
            .map_err(|e| format!("could not read seal status: {}", e))?;
        if status.sealed {
            self.enter(MigrationStage::Unsealing, report);
            let keys = self
                .keys
                .load()
                .map_err(|e| format!("cannot unseal: {}", e))?;
            let result = submit_shares(&*self.store, &keys.keys)
                .map_err(|e| format!("unseal failed: {}", e))?;
            if result.status.sealed {
                return Err(format!(
                    "store still sealed after {} shares ({}/{} accepted)",
                    result.submitted, result.status.progress, result.status.threshold
                ));
            }
            info!("store unsealed with {} shares", result.submitted);
        }
        Ok(())
    }

    /// Request a fresh key set and persist it before anything else happens
    pub(crate) fn initialize(&mut self) -> std::result::Result<UnsealKeySet, String> {
        if self.keys.exists() {
            return Err(format!(
                "store is uninitialized but {} already exists; it belongs to an older store. \
                 Move it aside or run devvault reset",
                self.keys.path().display()
            ));
        }

        let init = self
            .store
            .init(self.settings.key_shares, self.settings.key_threshold)
            .map_err(|e| format!("init failed: {}", e))?;
        let key_set = UnsealKeySet::from_init(init, self.settings.key_threshold as u32);

        self.keys
            .save_new(&key_set)
            .map_err(|e| format!("store initialized but key set could not be saved: {}", e))?;

        info!(
            "store initialized: {} shares, threshold {}, first share {}",
            key_set.keys.len(),
            key_set.threshold,
            key_set.previews().first().cloned().unwrap_or_default()
        );
        debug!("root token {}", preview(&key_set.root_token));
        Ok(key_set)
    }

    pub(crate) fn wait_reachable(&self) -> std::result::Result<(), String> {
        let policy = &self.settings.startup;
        let store = &*self.store;
        debug!("waiting up to {:?} for {}", policy.budget(), self.settings.addr);
        match poll(policy, |attempt| {
            debug!("waiting for store (attempt {})", attempt + 1);
            store.health().ok()
        }) {
            PollOutcome::Ready { attempts, .. } => {
                info!("store reachable after {} attempts", attempts);
                Ok(())
            }
            PollOutcome::TimedOut { attempts, elapsed } => Err(format!(
                "store not reachable at {} after {} attempts ({:.1}s); see {}",
                self.settings.addr,
                attempts,
                elapsed.as_secs_f64(),
                self.settings.paths.store_log().display()
            )),
        }
    }

    /// Wait until nothing answers on the store address any more
    fn wait_stopped(&self) -> std::result::Result<(), String> {
        let store = &*self.store;
        match poll(&self.settings.startup, |_| {
            store.health().err().filter(StoreError::is_unreachable)
        }) {
            PollOutcome::Ready { value, attempts } => {
                debug!("store gone after {} checks: {}", attempts, value);
                Ok(())
            }
            PollOutcome::TimedOut { attempts, .. } => Err(format!(
                "a store still answers at {} after stop ({} checks); it was not started by \
                 devvault, stop it manually",
                self.settings.addr, attempts
            )),
        }
    }

    /// The store answering is the server just launched, in `mode`
    pub(crate) fn confirm_launched(&self, mode: Mode) -> std::result::Result<(), String> {
        if !self.process.is_running() {
            return Err(format!(
                "a store answers at {} but the launched {} server is not running; see {}",
                self.settings.addr,
                mode,
                self.settings.paths.store_log().display()
            ));
        }
        let health = self
            .store
            .health()
            .map_err(|e| format!("could not read store health: {}", e))?;
        // Fresh durable servers always come up sealed, dev servers never do
        if health.sealed != (mode == Mode::Durable) {
            return Err(format!(
                "store at {} reports sealed={} right after launch; it is not a fresh {} server",
                self.settings.addr, health.sealed, mode
            ));
        }
        Ok(())
    }

    /// Server config and an empty raft directory
    pub(crate) fn prepare_durable(&self) -> Result<()> {
        let paths = &self.settings.paths;
        let durable = paths.durable_dir();
        fs::create_dir_all(&durable)
            .with_context(|| format!("Failed to create {}", durable.display()))?;

        let hcl_path = paths.durable_server_config();
        let hcl = durable_server_hcl(self.settings)?;
        fs::write(&hcl_path, hcl)
            .with_context(|| format!("Failed to write {}", hcl_path.display()))?;
        fs::set_permissions(&hcl_path, Permissions::from_mode(0o600))?;

        let storage = paths.durable_storage();
        fs::create_dir_all(&storage)
            .with_context(|| format!("Failed to create {}", storage.display()))?;
        fs::set_permissions(&storage, Permissions::from_mode(0o700))?;
        Ok(())
    }

    /// Move durable storage and keys to `retired/<timestamp>/`
    fn retire_durable(&self) -> Result<Option<PathBuf>> {
        let paths = &self.settings.paths;
        let storage = paths.durable_storage();
        if !storage.exists() && !self.keys.exists() {
            return Ok(None);
        }

        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let mut dest = paths.retired().join(&stamp);
        let mut n = 2;
        while dest.exists() {
            dest = paths.retired().join(format!("{}-{}", stamp, n));
            n += 1;
        }
        fs::create_dir_all(&dest).with_context(|| format!("Failed to create {}", dest.display()))?;
        fs::set_permissions(&dest, Permissions::from_mode(0o700))?;

        if storage.exists() {
            fs::rename(&storage, dest.join("raft"))
                .with_context(|| format!("Failed to move {}", storage.display()))?;
        }
        self.keys.retire(&dest)?;

        info!("durable storage retired to {}", dest.display());
        Ok(Some(dest))
    }

    /// Read every secret under the configured namespaces
    pub fn export_secrets(&self) -> Export {
        let mut export = Export::default();

        match self.store.health() {
            Err(e) => {
                export.warnings.push(format!(
                    "store unreachable ({}); backup is EMPTY - no secrets were saved",
                    e
                ));
                export.source = SourceState::Unreachable;
                return export;
            }
            Ok(health) if health.sealed => {
                export
                    .warnings
                    .push("store is sealed; backup is EMPTY - unseal first to keep secrets".to_string());
                export.source = SourceState::Sealed;
                return export;
            }
            Ok(_) => {}
        }

        for namespace in &self.settings.namespaces {
            self.collect(namespace.trim_matches('/'), &mut export);
        }
        export.entries.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            "exported {} secrets ({} failed)",
            export.entries.len(),
            export.failures.len()
        );
        export
    }

    fn collect(&self, prefix: &str, export: &mut Export) {
        let children = match self.store.list_secrets(prefix) {
            Ok(c) => c,
            Err(e) => {
                export.failures.push(ItemFailure {
                    path: format!("{}/", prefix),
                    reason: e.to_string(),
                });
                return;
            }
        };

        for child in children {
            let path = format!("{}/{}", prefix, child.trim_end_matches('/'));
            if child.ends_with('/') {
                self.collect(&path, export);
                continue;
            }
            match self.store.read_secret(&path) {
                Ok(data) => export.entries.push(BackupEntry { path, data }),
                Err(e) => export.failures.push(ItemFailure {
                    path,
                    reason: e.to_string(),
                }),
            }
        }
    }

    fn write_backup(&self, source: Mode, target: Mode, export: Export) -> Result<BackupRecord> {
        let failed = export.failures.iter().map(|f| f.path.clone()).collect();
        let record = self
            .backups
            .write(source, target, &export.entries, failed, export.warnings)?;
        Ok(record)
    }

    /// Standalone backup of the active store
    pub fn take_backup(&mut self, mode: Mode) -> Result<(BackupRecord, Export)> {
        self.stage = MigrationStage::BackingUp;
        let export = self.export_secrets();
        let summary = Export {
            entries: Vec::new(),
            failures: export.failures.clone(),
            warnings: export.warnings.clone(),
            source: export.source,
        };
        let record = self.write_backup(mode, mode, export)?;
        self.prune(&mut Vec::new());
        self.stage = MigrationStage::Done;
        Ok((record, summary))
    }

    /// Write entries into the active store, one at a time
    pub fn restore(&mut self, entries: &[BackupEntry]) -> RestoreReport {
        let mut report = RestoreReport::default();
        for entry in entries {
            match self.store.write_secret(&entry.path, &entry.data) {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!("restore failed for {}: {}", entry.path, e);
                    report.failures.push(ItemFailure {
                        path: entry.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            "restored {}/{} secrets",
            report.restored,
            entries.len()
        );
        report
    }

    /// Replay a backup into whatever store is active. Configuration is not
    /// touched.
    pub fn rollback_from(&mut self, dir: &Path) -> Result<RestoreReport> {
        let backup = self.backups.load(dir)?;

        let status = self.store.seal_status()?;
        if status.sealed {
            bail!(StoreError::Sealed);
        }

        self.stage = MigrationStage::Restoring;
        info!(
            "rolling back from {} ({} secrets, taken {} -> {})",
            dir.display(),
            backup.entries.len(),
            backup.record.meta.source_mode,
            backup.record.meta.target_mode
        );
        let report = self.restore(&backup.entries);
        self.stage = MigrationStage::Done;
        Ok(report)
    }
}
