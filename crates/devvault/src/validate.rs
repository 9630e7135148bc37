//! Read-only consistency checks
//!
//! Nothing here writes to disk or to the store. Each check yields a level
//! and, when something is off, the command that fixes it.

use serde::Serialize;
use std::path::Path;
use walkdir::WalkDir;

use crate::backup::BackupStore;
use crate::client::StoreApi;
use crate::config::{ConfigError, ConfigStore, Configuration};
use crate::keys::{KeySetError, KeyStore};
use crate::mode::Mode;
use crate::settings::Settings;
use crate::unseal::manual_unseal_command;
use devvault_core::format_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    Pass,
    Info,
    Warn,
    Fail,
}

impl CheckLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for CheckLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub level: CheckLevel,
    pub message: String,
    /// Commands that resolve the problem
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remedy: Vec<String>,
}

impl Check {
    fn new(name: &'static str, level: CheckLevel, message: impl Into<String>) -> Self {
        Self {
            name,
            level,
            message: message.into(),
            remedy: Vec::new(),
        }
    }

    fn remedy(mut self, command: impl Into<String>) -> Self {
        self.remedy.push(command.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<Check>,
}

impl ValidationReport {
    /// Worst level among the checks, ignoring informational ones
    pub fn overall(&self) -> CheckLevel {
        self.checks
            .iter()
            .map(|c| c.level)
            .filter(|l| *l != CheckLevel::Info)
            .max()
            .unwrap_or(CheckLevel::Pass)
    }

    pub fn has_failures(&self) -> bool {
        self.overall() == CheckLevel::Fail
    }

    pub fn find(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }
}

pub struct Validator<'a> {
    settings: &'a Settings,
    store: &'a dyn StoreApi,
}

impl<'a> Validator<'a> {
    pub fn new(settings: &'a Settings, store: &'a dyn StoreApi) -> Self {
        Self { settings, store }
    }

    pub fn run(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        let config = self.check_config(&mut report);
        let mode = config.map(|c| c.mode).unwrap_or_default();

        report.checks.push(self.check_storage_matches(mode));
        report.checks.push(self.check_store(mode));
        self.check_keys(mode, &mut report);
        if let Some(check) = self.check_storage_size() {
            report.checks.push(check);
        }
        report.checks.push(self.check_binary());
        report.checks.push(self.check_backups());

        report
    }

    fn check_config(&self, report: &mut ValidationReport) -> Option<Configuration> {
        let store = ConfigStore::new(&self.settings.paths.config_file());
        let path = store.path().display().to_string();

        if !store.exists() {
            report.checks.push(
                Check::new(
                    "config",
                    CheckLevel::Warn,
                    format!("{} not found; defaults in use (ephemeral, auto-unseal off)", path),
                )
                .remedy("devvault auto-unseal off"),
            );
            return Configuration::default_for(self.settings).ok();
        }

        match store.load(self.settings) {
            Ok(config) => {
                report.checks.push(Check::new(
                    "config",
                    CheckLevel::Pass,
                    format!("mode {}, auto-unseal {}", config.mode, config.auto_unseal),
                ));
                Some(config)
            }
            Err(e @ ConfigError::Io { .. }) => {
                report.checks.push(Check::new("config", CheckLevel::Fail, e.to_string()));
                None
            }
            Err(e) => {
                report.checks.push(
                    Check::new("config", CheckLevel::Fail, format!("{}: {}", path, e))
                        .remedy(format!("fix or remove {}, then run devvault status", path)),
                );
                None
            }
        }
    }

    fn check_storage_matches(&self, mode: Mode) -> Check {
        let storage = self.settings.paths.durable_storage();
        let present = storage.exists();

        match (mode, present) {
            (Mode::Durable, true) | (Mode::Ephemeral, false) => Check::new(
                "mode-storage",
                CheckLevel::Pass,
                format!("{} mode, durable storage {}", mode, if present { "present" } else { "absent" }),
            ),
            (Mode::Durable, false) => Check::new(
                "mode-storage",
                CheckLevel::Fail,
                format!(
                    "configuration says durable but {} does not exist",
                    storage.display()
                ),
            )
            .remedy("devvault reset"),
            (Mode::Ephemeral, true) => Check::new(
                "mode-storage",
                CheckLevel::Fail,
                format!(
                    "configuration says ephemeral but durable storage exists at {}",
                    storage.display()
                ),
            )
            .remedy("devvault switch durable")
            .remedy("devvault reset"),
        }
    }

    fn check_store(&self, mode: Mode) -> Check {
        let health = match self.store.health() {
            Ok(h) => h,
            Err(e) => {
                return Check::new(
                    "store",
                    CheckLevel::Warn,
                    format!("not reachable at {}: {}", self.settings.addr, e),
                )
                .remedy("devvault start")
            }
        };

        let version = health.version.unwrap_or_else(|| "unknown version".to_string());
        if mode == Mode::Ephemeral {
            return Check::new("store", CheckLevel::Pass, format!("reachable ({})", version));
        }

        if !health.initialized {
            return Check::new("store", CheckLevel::Warn, "durable store is not initialized")
                .remedy("devvault start");
        }
        if health.sealed {
            let (progress, threshold) = self
                .store
                .seal_status()
                .map(|s| (s.progress, s.threshold))
                .unwrap_or((0, self.settings.key_threshold as u32));
            return Check::new(
                "store",
                CheckLevel::Warn,
                format!("sealed ({}/{} shares submitted)", progress, threshold),
            )
            .remedy("devvault unseal")
            .remedy(manual_unseal_command(self.settings, threshold));
        }
        Check::new("store", CheckLevel::Pass, format!("unsealed ({})", version))
    }

    fn check_keys(&self, mode: Mode, report: &mut ValidationReport) {
        let keys = KeyStore::new(&self.settings.paths.unseal_keys());
        let path = keys.path().display().to_string();

        let key_set = match keys.load() {
            Ok(k) => k,
            Err(KeySetError::NotFound(_)) => {
                let check = match mode {
                    Mode::Durable => Check::new(
                        "key-file",
                        CheckLevel::Fail,
                        format!("{} is missing; the durable store cannot be unsealed", path),
                    )
                    .remedy("restore the file from wherever the shares were copied")
                    .remedy("devvault reset"),
                    Mode::Ephemeral => Check::new(
                        "key-file",
                        CheckLevel::Pass,
                        "no key file (not used in ephemeral mode)",
                    ),
                };
                report.checks.push(check);
                return;
            }
            Err(e) => {
                report.checks.push(Check::new("key-file", CheckLevel::Fail, e.to_string()));
                return;
            }
        };

        report.checks.push(match mode {
            Mode::Durable => Check::new("key-file", CheckLevel::Pass, format!("{} parses", path)),
            Mode::Ephemeral => Check::new(
                "key-file",
                CheckLevel::Warn,
                format!("{} exists but the configuration says ephemeral", path),
            )
            .remedy("devvault switch durable"),
        });

        let threshold = key_set.threshold.max(self.settings.key_threshold as u32);
        report.checks.push(if key_set.has_quorum(threshold) {
            Check::new(
                "key-quorum",
                CheckLevel::Pass,
                format!("{} shares, threshold {}", key_set.keys.len(), threshold),
            )
        } else {
            Check::new(
                "key-quorum",
                CheckLevel::Fail,
                format!(
                    "only {} shares, {} needed to unseal",
                    key_set.keys.len(),
                    threshold
                ),
            )
        });

        let invalid = key_set.invalid_base64();
        report.checks.push(if invalid.is_empty() {
            Check::new("key-encoding", CheckLevel::Pass, "base64 shares decode")
        } else {
            Check::new(
                "key-encoding",
                CheckLevel::Warn,
                format!("base64 shares at positions {:?} do not decode", invalid),
            )
        });

        if let Some(mode_bits) = keys.permissions() {
            report.checks.push(if mode_bits & 0o077 == 0 {
                Check::new("key-permissions", CheckLevel::Pass, format!("{:o}", mode_bits))
            } else {
                Check::new(
                    "key-permissions",
                    CheckLevel::Warn,
                    format!("{:o}; group or others can read unseal keys", mode_bits),
                )
                .remedy(format!("chmod 600 {}", path))
            });
        }
    }

    fn check_storage_size(&self) -> Option<Check> {
        let storage = self.settings.paths.durable_storage();
        if !storage.exists() {
            return None;
        }
        Some(Check::new(
            "storage-size",
            CheckLevel::Info,
            format!("{} in {}", format_size(dir_size(&storage)), storage.display()),
        ))
    }

    fn check_binary(&self) -> Check {
        match which::which(&self.settings.store_bin) {
            Ok(path) => Check::new("store-binary", CheckLevel::Info, path.display().to_string()),
            Err(_) => Check::new(
                "store-binary",
                CheckLevel::Info,
                format!(
                    "'{}' not found on PATH; manual commands need the store CLI",
                    self.settings.store_bin
                ),
            ),
        }
    }

    fn check_backups(&self) -> Check {
        let backups = BackupStore::new(&self.settings.paths.backups());
        let complete = backups.list().map(|l| l.len()).unwrap_or(0);
        match backups.incomplete() {
            Ok(dirs) if !dirs.is_empty() => Check::new(
                "backups",
                CheckLevel::Warn,
                format!(
                    "{} incomplete backup directories (interrupted writes)",
                    dirs.len()
                ),
            )
            .remedy("devvault backup"),
            Ok(_) => Check::new("backups", CheckLevel::Pass, format!("{} complete backups", complete)),
            Err(e) => Check::new("backups", CheckLevel::Warn, e.to_string()),
        }
    }
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::sample_key_set;
    use crate::testing::{FakeStore, FakeVault};
    use devvault_core::Paths;
    use std::fs::{self, Permissions};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Settings) {
        let dir = tempdir().unwrap();
        let paths = Paths::with_dirs(&dir.path().join("data"), &dir.path().join("config"));
        let mut settings = Settings::new("http://127.0.0.1:8200", paths).unwrap();
        settings.store_bin = "definitely-not-a-store-binary".to_string();
        (dir, settings)
    }

    fn declare(settings: &Settings, mode: Mode) {
        let config = Configuration::for_mode(mode, false, settings).unwrap();
        ConfigStore::new(&settings.paths.config_file()).save(&config).unwrap();
    }

    #[test]
    fn test_fresh_install_only_warns() {
        let (_dir, settings) = setup();
        let store = FakeStore(FakeVault::new());
        let report = Validator::new(&settings, &store).run();

        assert_eq!(report.find("config").unwrap().level, CheckLevel::Warn);
        assert_eq!(report.find("store").unwrap().level, CheckLevel::Warn);
        assert_eq!(report.find("store-binary").unwrap().level, CheckLevel::Info);
        assert_eq!(report.overall(), CheckLevel::Warn);
        assert!(!report.has_failures());
    }

    #[test]
    fn test_healthy_durable_passes() {
        let (_dir, settings) = setup();
        declare(&settings, Mode::Durable);
        fs::create_dir_all(settings.paths.durable_storage()).unwrap();
        fs::write(settings.paths.durable_storage().join("raft.db"), vec![0u8; 2048]).unwrap();
        KeyStore::new(&settings.paths.unseal_keys())
            .save_new(&sample_key_set(5))
            .unwrap();

        let vault = FakeVault::new();
        {
            let mut v = vault.borrow_mut();
            v.running = Some(Mode::Durable);
            v.durable.initialized = true;
        }
        let report = Validator::new(&settings, &FakeStore(vault)).run();

        assert_eq!(report.overall(), CheckLevel::Pass, "{:#?}", report);
        assert_eq!(report.find("key-permissions").unwrap().message, "600");
        assert!(report.find("storage-size").unwrap().message.contains("2.0K"));
    }

    #[test]
    fn test_durable_without_storage_fails() {
        let (_dir, settings) = setup();
        declare(&settings, Mode::Durable);
        let report = Validator::new(&settings, &FakeStore(FakeVault::new())).run();

        let check = report.find("mode-storage").unwrap();
        assert_eq!(check.level, CheckLevel::Fail);
        assert!(check.message.contains("durable"));
        assert_eq!(report.find("key-file").unwrap().level, CheckLevel::Fail);
        assert!(report.has_failures());
    }

    #[test]
    fn test_ephemeral_with_leftover_storage_fails() {
        let (_dir, settings) = setup();
        declare(&settings, Mode::Ephemeral);
        fs::create_dir_all(settings.paths.durable_storage()).unwrap();

        let report = Validator::new(&settings, &FakeStore(FakeVault::running_ephemeral(&[]))).run();
        let check = report.find("mode-storage").unwrap();
        assert_eq!(check.level, CheckLevel::Fail);
        assert!(check.message.contains("ephemeral"));
    }

    #[test]
    fn test_sealed_durable_warns_with_unseal_commands() {
        let (_dir, settings) = setup();
        declare(&settings, Mode::Durable);
        fs::create_dir_all(settings.paths.durable_storage()).unwrap();
        KeyStore::new(&settings.paths.unseal_keys())
            .save_new(&sample_key_set(5))
            .unwrap();

        let vault = FakeVault::new();
        {
            let mut v = vault.borrow_mut();
            v.running = Some(Mode::Durable);
            v.durable.initialized = true;
            v.durable.sealed = true;
            v.durable.threshold = 3;
        }
        let report = Validator::new(&settings, &FakeStore(vault)).run();
        let check = report.find("store").unwrap();
        assert_eq!(check.level, CheckLevel::Warn);
        assert!(check.remedy.iter().any(|r| r.contains("operator unseal")));
    }

    #[test]
    fn test_loose_permissions_and_bad_base64_warn() {
        let (_dir, settings) = setup();
        declare(&settings, Mode::Durable);
        fs::create_dir_all(settings.paths.durable_storage()).unwrap();

        let keys = KeyStore::new(&settings.paths.unseal_keys());
        let mut set = sample_key_set(5);
        set.keys_base64[1] = "!!not base64!!".to_string();
        keys.save_new(&set).unwrap();
        fs::set_permissions(keys.path(), Permissions::from_mode(0o644)).unwrap();

        let report = Validator::new(&settings, &FakeStore(FakeVault::new())).run();
        let perms = report.find("key-permissions").unwrap();
        assert_eq!(perms.level, CheckLevel::Warn);
        assert!(perms.remedy[0].starts_with("chmod 600"));
        assert_eq!(report.find("key-encoding").unwrap().level, CheckLevel::Warn);
    }

    #[test]
    fn test_too_few_shares_fails() {
        let (_dir, settings) = setup();
        declare(&settings, Mode::Durable);
        fs::create_dir_all(settings.paths.durable_storage()).unwrap();
        KeyStore::new(&settings.paths.unseal_keys())
            .save_new(&sample_key_set(2))
            .unwrap();

        let report = Validator::new(&settings, &FakeStore(FakeVault::new())).run();
        assert_eq!(report.find("key-quorum").unwrap().level, CheckLevel::Fail);
    }

    #[test]
    fn test_incomplete_backup_warns() {
        let (_dir, settings) = setup();
        fs::create_dir_all(settings.paths.backups().join("20260101-000000-ephemeral-to-durable")).unwrap();

        let report = Validator::new(&settings, &FakeStore(FakeVault::new())).run();
        assert_eq!(report.find("backups").unwrap().level, CheckLevel::Warn);
    }

    #[test]
    fn test_validation_writes_nothing() {
        let (dir, settings) = setup();
        Validator::new(&settings, &FakeStore(FakeVault::new())).run();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_overall_ignores_info() {
        let report = ValidationReport {
            checks: vec![
                Check::new("a", CheckLevel::Pass, ""),
                Check::new("b", CheckLevel::Info, ""),
            ],
        };
        assert_eq!(report.overall(), CheckLevel::Pass);
    }
}
