//! Mode controller
//!
//! Entry point for every lifecycle operation. It owns the configuration
//! file handle and hands it to the migration engine, which is the only
//! other code allowed to commit a new configuration.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::backup::BackupRecord;
use crate::client::StoreApi;
use crate::config::{ConfigStore, Configuration};
use crate::keys::KeyStore;
use crate::migrate::{Export, MigrationEngine, MigrationPlan, MigrationReport, RestoreReport};
use crate::mode::Mode;
use crate::process::{StopOutcome, StoreProcess};
use crate::settings::Settings;
use crate::unseal::{AutoUnsealer, UnsealOutcome};

/// Token to present to the store running in `mode`.
///
/// An explicitly supplied token always wins. Otherwise durable mode uses
/// the root token from the key set and ephemeral mode the dev root token.
pub fn token_for(mode: Mode, settings: &Settings, keys: &KeyStore) -> Option<String> {
    if let Some(ref token) = settings.token {
        return Some(token.clone());
    }
    match mode {
        Mode::Ephemeral => Some(settings.dev_token.clone()),
        Mode::Durable => match keys.load() {
            Ok(set) => Some(set.root_token),
            Err(e) => {
                debug!("no durable root token: {}", e);
                None
            }
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationChoice {
    Migrate,
    Discard,
    Cancel,
}

/// Asks the operator what to do with existing secrets
pub trait MigrationPrompt {
    fn choose(&mut self, from: Mode, to: Mode) -> MigrationChoice;
}

impl<F> MigrationPrompt for F
where
    F: FnMut(Mode, Mode) -> MigrationChoice,
{
    fn choose(&mut self, from: Mode, to: Mode) -> MigrationChoice {
        self(from, to)
    }
}

#[derive(Debug)]
pub enum SwitchOutcome {
    /// Target was already the declared mode; nothing was touched
    AlreadyActive(Mode),
    Cancelled,
    Switched(MigrationReport),
}

/// Everything `status` could find out. Store-derived fields are `None`
/// when the store did not answer.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeStatus {
    pub declared_mode: Mode,
    pub auto_unseal: bool,
    pub config_present: bool,
    pub config_error: Option<String>,
    pub addr: String,
    pub process_running: bool,
    pub reachable: bool,
    pub initialized: Option<bool>,
    pub sealed: Option<bool>,
    pub version: Option<String>,
    pub storage_present: bool,
    pub keys_present: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub mode: Mode,
    /// Pid of the launched process; `None` when it was already up
    pub pid: Option<u32>,
    pub initialized: bool,
    pub sealed: bool,
    /// Set when the auto-unseal agent ran
    pub unseal: Option<UnsealOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub process_stopped: bool,
    pub storage_removed: bool,
    pub keys_removed: bool,
    pub config_reset: bool,
}

pub struct ModeController<'a> {
    settings: &'a Settings,
    config: ConfigStore,
    keys: KeyStore,
}

impl<'a> ModeController<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            config: ConfigStore::new(&settings.paths.config_file()),
            keys: KeyStore::new(&settings.paths.unseal_keys()),
        }
    }

    pub fn settings(&self) -> &Settings {
        self.settings
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    pub fn configuration(&self) -> Result<Configuration> {
        self.config.load(self.settings).with_context(|| {
            format!("Failed to read configuration {}", self.config.path().display())
        })
    }

    pub fn token_for(&self, mode: Mode) -> Option<String> {
        token_for(mode, self.settings, &self.keys)
    }

    fn authenticate(&self, mode: Mode, store: &mut dyn StoreApi) {
        match self.token_for(mode) {
            Some(token) => store.set_token(&token),
            None => warn!("no token available for {} mode; requests may be denied", mode),
        }
    }

    pub fn status(&self, store: &dyn StoreApi, process: &dyn StoreProcess) -> CompositeStatus {
        let (config, config_error) = match self.config.load(self.settings) {
            Ok(c) => (Some(c), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let (declared_mode, auto_unseal) = config
            .map(|c| (c.mode, c.auto_unseal))
            .unwrap_or((Mode::default(), false));

        let mut status = CompositeStatus {
            declared_mode,
            auto_unseal,
            config_present: self.config.exists(),
            config_error,
            addr: self.settings.addr.clone(),
            process_running: process.is_running(),
            reachable: false,
            initialized: None,
            sealed: None,
            version: None,
            storage_present: self.settings.paths.durable_storage().exists(),
            keys_present: self.keys.exists(),
        };

        match store.health() {
            Ok(health) => {
                status.reachable = true;
                status.initialized = Some(health.initialized);
                status.sealed = Some(health.sealed);
                status.version = health.version;
            }
            Err(e) => debug!("store not reachable: {}", e),
        }
        status
    }

    /// Switch the declared mode, moving secrets if the operator agrees
    pub fn switch_mode(
        &self,
        target: Mode,
        prompt: &mut dyn MigrationPrompt,
        store: &mut dyn StoreApi,
        process: &mut dyn StoreProcess,
    ) -> Result<SwitchOutcome> {
        let current = self.configuration()?;
        if current.mode == target {
            info!("{} mode is already active", target);
            return Ok(SwitchOutcome::AlreadyActive(target));
        }

        let choice = prompt.choose(current.mode, target);
        if choice == MigrationChoice::Cancel {
            info!("switch to {} cancelled", target);
            return Ok(SwitchOutcome::Cancelled);
        }

        self.config
            .check_writable()
            .context("Configuration is not writable; nothing was changed")?;

        let plan = MigrationPlan {
            target: Configuration::for_mode(target, current.auto_unseal, self.settings)?,
            source: current,
            restore: choice == MigrationChoice::Migrate,
        };

        self.authenticate(plan.source.mode, store);
        let report = MigrationEngine::new(self.settings, &self.config, store, process).migrate(&plan);
        Ok(SwitchOutcome::Switched(report))
    }

    /// Launch the store in the declared mode and bring it to a usable state
    pub fn start(&self, store: &mut dyn StoreApi, process: &mut dyn StoreProcess) -> Result<StartReport> {
        let config = self.configuration()?;
        let mut report = StartReport {
            mode: config.mode,
            pid: None,
            initialized: false,
            sealed: false,
            unseal: None,
        };

        if config.mode == Mode::Durable && !self.settings.paths.durable_server_config().exists() {
            MigrationEngine::new(self.settings, &self.config, store, process).prepare_durable()?;
        }

        if store.is_reachable() {
            info!("store already answering at {}", self.settings.addr);
        } else {
            let pid = process
                .start(&config.launch_command)
                .context("Failed to start store")?;
            report.pid = Some(pid);
        }

        {
            let mut engine = MigrationEngine::new(self.settings, &self.config, store, process);
            if let Err(reason) = engine.wait_reachable() {
                bail!(reason);
            }
            if report.pid.is_some() {
                engine.confirm_launched(config.mode).map_err(anyhow::Error::msg)?;
            }
            if config.mode == Mode::Durable {
                let status = engine.store().seal_status()?;
                if !status.initialized {
                    engine.initialize().map_err(anyhow::Error::msg)?;
                    report.initialized = true;
                }
            }
        }

        self.authenticate(config.mode, store);
        if config.mode == Mode::Ephemeral {
            return Ok(report);
        }

        if config.auto_unseal {
            let outcome = AutoUnsealer::new(&*store, &self.keys).attempt_unseal();
            report.unseal = Some(outcome);
        }
        report.sealed = store.seal_status().map(|s| s.sealed).unwrap_or(true);
        if !report.sealed {
            match store.enable_kv() {
                Ok(true) => info!("mounted kv-v2 secrets engine at secret/"),
                Ok(false) => {}
                Err(e) => warn!("could not ensure secret/ mount: {}", e),
            }
        }
        Ok(report)
    }

    pub fn stop(&self, process: &mut dyn StoreProcess) -> Result<StopOutcome> {
        Ok(process.stop()?)
    }

    /// Operator-initiated unseal; ignores the auto-unseal setting
    pub fn unseal(&self, store: &dyn StoreApi) -> UnsealOutcome {
        AutoUnsealer::new(store, &self.keys).attempt_unseal()
    }

    pub fn set_auto_unseal(&self, enabled: bool) -> Result<Configuration> {
        let mut config = self.configuration()?;
        config.auto_unseal = enabled;
        self.config.save(&config).context("Failed to save configuration")?;
        info!("auto-unseal {}", if enabled { "enabled" } else { "disabled" });
        Ok(config)
    }

    /// Standalone backup of the active store
    pub fn backup(
        &self,
        store: &mut dyn StoreApi,
        process: &mut dyn StoreProcess,
    ) -> Result<(BackupRecord, Export)> {
        let config = self.configuration()?;
        self.authenticate(config.mode, store);
        MigrationEngine::new(self.settings, &self.config, store, process).take_backup(config.mode)
    }

    /// Replay a backup into the active store; the declared mode is unchanged
    pub fn rollback(
        &self,
        dir: &Path,
        store: &mut dyn StoreApi,
        process: &mut dyn StoreProcess,
    ) -> Result<RestoreReport> {
        let config = self.configuration()?;
        self.authenticate(config.mode, store);
        if config.mode == Mode::Durable {
            if let Err(e) = store.enable_kv() {
                debug!("could not ensure secret/ mount: {}", e);
            }
        }
        MigrationEngine::new(self.settings, &self.config, store, process).rollback_from(dir)
    }

    /// Destroy durable storage and the key set. Backups are kept.
    pub fn reset(&self, process: &mut dyn StoreProcess) -> Result<ResetReport> {
        let stopped = process.stop().context("Failed to stop store")?;

        let durable = self.settings.paths.durable_dir();
        let storage_removed = durable.exists();
        if storage_removed {
            fs::remove_dir_all(&durable)
                .with_context(|| format!("Failed to remove {}", durable.display()))?;
        }
        let keys_removed = self.keys.destroy()?;

        let mut config = self.configuration()?;
        let config_reset = config.mode == Mode::Durable;
        if config_reset {
            config = Configuration::for_mode(Mode::Ephemeral, config.auto_unseal, self.settings)?;
            self.config.save(&config)?;
        }

        info!(
            "reset: storage removed {}, keys removed {}",
            storage_removed, keys_removed
        );
        Ok(ResetReport {
            process_stopped: matches!(stopped, StopOutcome::Stopped { .. }),
            storage_removed,
            keys_removed,
            config_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::MigrationOutcome;
    use crate::testing::{DevOnlyProcess, FakeProcess, FakeStore, FakeVault, Shared};
    use devvault_core::Paths;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn setup(vault: &Shared) -> (TempDir, Settings) {
        let dir = tempdir().unwrap();
        let paths = Paths::with_dirs(&dir.path().join("data"), &dir.path().join("config"));
        let mut settings = Settings::new("http://127.0.0.1:8200", paths).unwrap();
        settings.startup = crate::retry::RetryPolicy::fixed(Duration::ZERO, 3);
        vault.borrow_mut().storage_dir = Some(settings.paths.durable_storage());
        (dir, settings)
    }

    fn always(choice: MigrationChoice) -> impl FnMut(Mode, Mode) -> MigrationChoice {
        move |_, _| choice
    }

    #[test]
    fn test_token_precedence() {
        let vault = FakeVault::new();
        let (_dir, mut settings) = setup(&vault);
        let keys = KeyStore::new(&settings.paths.unseal_keys());

        assert_eq!(token_for(Mode::Ephemeral, &settings, &keys).as_deref(), Some("root"));
        assert_eq!(token_for(Mode::Durable, &settings, &keys), None);

        keys.save_new(&crate::keys::sample_key_set(5)).unwrap();
        assert_eq!(
            token_for(Mode::Durable, &settings, &keys).as_deref(),
            Some("hvs.root-token-for-tests")
        );

        settings.token = Some("explicit".to_string());
        assert_eq!(token_for(Mode::Durable, &settings, &keys).as_deref(), Some("explicit"));
        assert_eq!(token_for(Mode::Ephemeral, &settings, &keys).as_deref(), Some("explicit"));
    }

    #[test]
    fn test_switch_to_active_mode_is_a_no_op() {
        let vault = FakeVault::running_ephemeral(&[("dev/ALPHA", "x")]);
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);
        let mut asked = false;

        let outcome = controller
            .switch_mode(
                Mode::Ephemeral,
                &mut |_: Mode, _: Mode| {
                    asked = true;
                    MigrationChoice::Migrate
                },
                &mut FakeStore(vault.clone()),
                &mut FakeProcess(vault.clone()),
            )
            .unwrap();

        assert!(matches!(outcome, SwitchOutcome::AlreadyActive(Mode::Ephemeral)));
        assert!(!asked);
        assert!(!settings.paths.backups().exists());
        assert!(!controller.config_store().exists());
        let v = vault.borrow();
        assert_eq!((v.starts, v.stops), (0, 0));
    }

    #[test]
    fn test_cancel_leaves_everything_alone() {
        let vault = FakeVault::running_ephemeral(&[("dev/ALPHA", "x")]);
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);

        let outcome = controller
            .switch_mode(
                Mode::Durable,
                &mut always(MigrationChoice::Cancel),
                &mut FakeStore(vault.clone()),
                &mut FakeProcess(vault.clone()),
            )
            .unwrap();

        assert!(matches!(outcome, SwitchOutcome::Cancelled));
        assert!(!settings.paths.backups().exists());
        assert_eq!(vault.borrow().stops, 0);
        assert_eq!(vault.borrow().ephemeral_secret("dev/ALPHA"), Some(Value::from("x")));
    }

    #[test]
    fn test_unwritable_config_fails_before_stopping() {
        let vault = FakeVault::running_ephemeral(&[("dev/ALPHA", "x")]);
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);

        // A directory where the temporary file must go makes every save fail
        let config_dir = settings.paths.config.clone();
        fs::create_dir_all(config_dir.join(".vault-mode.conf.tmp")).unwrap();

        let err = controller
            .switch_mode(
                Mode::Durable,
                &mut always(MigrationChoice::Migrate),
                &mut FakeStore(vault.clone()),
                &mut FakeProcess(vault.clone()),
            )
            .unwrap_err();

        assert!(err.to_string().contains("not writable"));
        let v = vault.borrow();
        assert_eq!((v.starts, v.stops), (0, 0));
        assert_eq!(v.running, Some(Mode::Ephemeral));
        assert!(!settings.paths.backups().exists());
    }

    #[test]
    fn test_switch_migrates_and_commits() {
        let vault = FakeVault::running_ephemeral(&[("dev/ALPHA", "x")]);
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);

        let outcome = controller
            .switch_mode(
                Mode::Durable,
                &mut always(MigrationChoice::Migrate),
                &mut FakeStore(vault.clone()),
                &mut FakeProcess(vault.clone()),
            )
            .unwrap();

        let SwitchOutcome::Switched(report) = outcome else {
            panic!("expected a migration");
        };
        assert_eq!(report.outcome, MigrationOutcome::Completed);
        assert_eq!(controller.configuration().unwrap().mode, Mode::Durable);
        assert_eq!(vault.borrow().durable_secret("dev/ALPHA"), Some(Value::from("x")));
    }

    #[test]
    fn test_status_is_best_effort_when_unreachable() {
        let vault = FakeVault::new();
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);

        let status = controller.status(&FakeStore(vault.clone()), &FakeProcess(vault.clone()));
        assert_eq!(status.declared_mode, Mode::Ephemeral);
        assert!(!status.reachable);
        assert!(!status.process_running);
        assert_eq!(status.sealed, None);
        assert_eq!(status.initialized, None);
        assert!(!status.config_present);
    }

    #[test]
    fn test_status_reports_bad_config_without_failing() {
        let vault = FakeVault::running_ephemeral(&[]);
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);
        fs::create_dir_all(&settings.paths.config).unwrap();
        fs::write(settings.paths.config_file(), "MODE=\"banana\"\n").unwrap();

        let status = controller.status(&FakeStore(vault.clone()), &FakeProcess(vault.clone()));
        assert!(status.config_error.is_some());
        assert!(status.reachable);
        assert_eq!(status.sealed, Some(false));
    }

    #[test]
    fn test_set_auto_unseal_persists() {
        let vault = FakeVault::new();
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);

        controller.set_auto_unseal(true).unwrap();
        assert!(controller.configuration().unwrap().auto_unseal);
        controller.set_auto_unseal(false).unwrap();
        assert!(!controller.configuration().unwrap().auto_unseal);
    }

    fn durable_controller(vault: &Shared, settings: &Settings, auto_unseal: bool) {
        let config = Configuration::for_mode(Mode::Durable, auto_unseal, settings).unwrap();
        ConfigStore::new(&settings.paths.config_file()).save(&config).unwrap();
        vault.borrow_mut().running = None;
    }

    #[test]
    fn test_start_durable_initializes_and_respects_policy() {
        let vault = FakeVault::new();
        let (_dir, settings) = setup(&vault);
        durable_controller(&vault, &settings, false);
        let controller = ModeController::new(&settings);

        let report = controller
            .start(&mut FakeStore(vault.clone()), &mut FakeProcess(vault.clone()))
            .unwrap();
        assert_eq!(report.pid, Some(4242));
        assert!(report.initialized);
        assert!(report.sealed);
        assert!(report.unseal.is_none());
        assert!(controller.key_store().exists());

        // Restart with auto-unseal allowed: same keys, now unsealed
        controller.stop(&mut FakeProcess(vault.clone())).unwrap();
        controller.set_auto_unseal(true).unwrap();
        let report = controller
            .start(&mut FakeStore(vault.clone()), &mut FakeProcess(vault.clone()))
            .unwrap();
        assert!(!report.initialized);
        assert!(!report.sealed);
        assert!(matches!(report.unseal, Some(UnsealOutcome::Unsealed { submitted: 3 })));
        assert!(vault.borrow().durable.kv_mounted);
        assert_eq!(vault.borrow().init_calls, 1);
    }

    #[test]
    fn test_start_times_out() {
        let vault = FakeVault::new();
        vault.borrow_mut().answers_after_start = false;
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);

        let err = controller
            .start(&mut FakeStore(vault.clone()), &mut FakeProcess(vault.clone()))
            .unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }

    #[test]
    fn test_start_rejects_server_in_wrong_mode() {
        let vault = FakeVault::new();
        let (_dir, settings) = setup(&vault);
        durable_controller(&vault, &settings, true);
        let controller = ModeController::new(&settings);

        let err = controller
            .start(&mut FakeStore(vault.clone()), &mut DevOnlyProcess(vault.clone()))
            .unwrap_err();
        assert!(err.to_string().contains("not a fresh durable server"), "{:#}", err);
        // Nothing was initialized against the wrong server
        assert_eq!(vault.borrow().init_calls, 0);
        assert!(!controller.key_store().exists());
    }

    #[test]
    fn test_unseal_runs_regardless_of_policy() {
        let vault = FakeVault::new();
        let (_dir, settings) = setup(&vault);
        durable_controller(&vault, &settings, false);
        let controller = ModeController::new(&settings);
        controller
            .start(&mut FakeStore(vault.clone()), &mut FakeProcess(vault.clone()))
            .unwrap();

        let outcome = controller.unseal(&FakeStore(vault.clone()));
        assert!(outcome.is_success());
    }

    #[test]
    fn test_reset_removes_durable_state_but_keeps_backups() {
        let vault = FakeVault::running_ephemeral(&[("dev/ALPHA", "x")]);
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);
        controller
            .switch_mode(
                Mode::Durable,
                &mut always(MigrationChoice::Migrate),
                &mut FakeStore(vault.clone()),
                &mut FakeProcess(vault.clone()),
            )
            .unwrap();

        let report = controller.reset(&mut FakeProcess(vault.clone())).unwrap();
        assert!(report.process_stopped);
        assert!(report.storage_removed);
        assert!(report.keys_removed);
        assert!(report.config_reset);
        assert!(!settings.paths.durable_storage().exists());
        assert!(!controller.key_store().exists());
        assert_eq!(controller.configuration().unwrap().mode, Mode::Ephemeral);
        assert_eq!(crate::backup::BackupStore::new(&settings.paths.backups()).list().unwrap().len(), 1);
    }

    #[test]
    fn test_backup_and_rollback_through_controller() {
        let vault = FakeVault::running_ephemeral(&[("dev/ALPHA", "x"), ("ci/TOKEN", "t")]);
        let (_dir, settings) = setup(&vault);
        let controller = ModeController::new(&settings);

        let (record, export) = controller
            .backup(&mut FakeStore(vault.clone()), &mut FakeProcess(vault.clone()))
            .unwrap();
        assert_eq!(record.meta.secret_count, 2);
        assert!(export.failures.is_empty());

        vault.borrow_mut().ephemeral.clear();
        let restored = controller
            .rollback(&record.dir, &mut FakeStore(vault.clone()), &mut FakeProcess(vault.clone()))
            .unwrap();
        assert_eq!(restored.restored, 2);
        assert_eq!(vault.borrow().ephemeral_secret("ci/TOKEN"), Some(Value::from("t")));
    }
}
