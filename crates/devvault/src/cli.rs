//! CLI command definitions and handlers

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;

use devvault::backup::BackupStore;
use devvault::controller::{MigrationChoice, MigrationPrompt, ModeController, SwitchOutcome};
use devvault::migrate::{MigrationOutcome, MigrationReport, MigrationStage};
use devvault::process::{StopOutcome, Supervisor};
use devvault::settings::{DEFAULT_ADDR, DEFAULT_DEV_TOKEN};
use devvault::unseal::{manual_unseal_command, UnsealOutcome};
use devvault::validate::{CheckLevel, Validator};
use devvault::{Mode, Settings, VaultClient};
use devvault_core::{preview, Paths};

/// devvault - run a local development Vault in ephemeral or durable mode
#[derive(Parser, Debug)]
#[command(name = "devvault")]
#[command(version)]
#[command(about = "Switch a local development Vault between ephemeral and durable mode")]
#[command(long_about = "Switch a local development Vault between ephemeral and durable mode.\n\n\
    Ephemeral mode runs the in-memory dev server: fast, and empty after every\n\
    restart. Durable mode runs a raft-backed server whose data survives\n\
    restarts but has to be unsealed. Switching takes a backup first and can\n\
    carry every secret across.")]
#[command(after_help = "EXAMPLES:\n\
    devvault status\n\
    devvault switch durable --migrate\n\
    devvault start\n\
    devvault auto-unseal on\n\
    devvault validate\n\
    devvault rollback 20260101-120000-ephemeral-to-durable")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Store API address
    #[arg(long, global = true, env = "VAULT_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Administrative token; overrides the per-mode token
    #[arg(long, global = true, env = "VAULT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Root token id for the ephemeral dev server
    #[arg(long, global = true, env = "DEVVAULT_DEV_TOKEN", default_value = DEFAULT_DEV_TOKEN, hide_env_values = true)]
    pub dev_token: String,

    /// Store executable
    #[arg(long, global = true, env = "DEVVAULT_STORE_BIN", default_value = "vault")]
    pub store_bin: String,

    /// Data directory (storage, keys, backups)
    #[arg(long, global = true, env = "DEVVAULT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory holding vault-mode.conf
    #[arg(long, global = true, env = "DEVVAULT_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Secret namespace to back up (repeatable)
    #[arg(long = "namespace", global = true, value_name = "NS")]
    pub namespaces: Vec<String>,
}

impl GlobalArgs {
    pub fn settings(&self) -> Result<Settings> {
        let mut paths = Paths::new();
        if let Some(ref dir) = self.data_dir {
            paths.data = dir.clone();
        }
        if let Some(ref dir) = self.config_dir {
            paths.config = dir.clone();
        }

        let mut settings = Settings::new(&self.addr, paths)?;
        settings.token = self.token.clone().filter(|t| !t.is_empty());
        settings.dev_token = self.dev_token.clone();
        settings.store_bin = self.store_bin.clone();
        if !self.namespaces.is_empty() {
            settings.namespaces = self.namespaces.clone();
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

fn parse_mode(s: &str) -> std::result::Result<Mode, String> {
    Mode::from_str(s).ok_or_else(|| {
        let names: Vec<_> = Mode::all().iter().map(Mode::as_str).collect();
        format!("unknown mode '{}' (expected {})", s, names.join(" or "))
    })
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show declared mode and live store state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Switch to another mode
    #[command(about = "Switch mode, backing up and optionally migrating secrets")]
    Switch {
        /// Target mode: ephemeral or durable
        #[arg(value_parser = parse_mode)]
        mode: Mode,

        /// Carry secrets into the new store without asking
        #[arg(long, conflicts_with = "discard")]
        migrate: bool,

        /// Start the new store empty (a backup is still written)
        #[arg(long)]
        discard: bool,

        /// Don't ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Launch the store in the declared mode
    Start,

    /// Stop the store process
    Stop,

    /// Unseal the durable store from the key file now
    Unseal,

    /// Allow or forbid automatic unseal on start
    AutoUnseal {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Check configuration, storage, keys and backups
    Validate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Back up the active store
    Backup,

    /// List backups, newest first
    Backups {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay a backup into the active store
    Rollback {
        /// Backup directory or name
        backup: String,

        /// Don't ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Destroy durable storage and unseal keys
    Reset {
        /// Don't ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

fn client(settings: &Settings) -> Result<VaultClient> {
    VaultClient::new(&settings.addr, settings.request_timeout).context("Failed to create store client")
}

fn supervisor(settings: &Settings) -> Supervisor {
    Supervisor::new(
        &settings.paths.pid_file(),
        &settings.paths.store_log(),
        settings.stop_grace,
    )
}

fn confirm(question: &str) -> Result<bool> {
    println!("{}", question);
    print!("[y/N] ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Asks on stdin unless the choice was given as a flag
struct StdinPrompt {
    preset: Option<MigrationChoice>,
}

impl MigrationPrompt for StdinPrompt {
    fn choose(&mut self, from: Mode, to: Mode) -> MigrationChoice {
        if let Some(choice) = self.preset {
            return choice;
        }

        println!("Switching {} -> {}", from, to);
        println!("  m) migrate secrets into the {} store", to);
        println!("  d) discard secrets (a backup is still written)");
        println!("  c) cancel");
        print!("[m/d/C] ");
        if std::io::stdout().flush().is_err() {
            return MigrationChoice::Cancel;
        }

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            return MigrationChoice::Cancel;
        }
        match input.trim().to_lowercase().as_str() {
            "m" | "migrate" => MigrationChoice::Migrate,
            "d" | "discard" => MigrationChoice::Discard,
            _ => MigrationChoice::Cancel,
        }
    }
}

fn preset_choice(migrate: bool, discard: bool, yes: bool) -> Option<MigrationChoice> {
    if migrate {
        Some(MigrationChoice::Migrate)
    } else if discard {
        Some(MigrationChoice::Discard)
    } else if yes {
        Some(MigrationChoice::Migrate)
    } else {
        None
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}

fn print_key_file(controller: &ModeController) {
    let keys = controller.key_store();
    match keys.load() {
        Ok(set) => {
            println!(
                "info: unseal keys written to {} ({} shares, threshold {})",
                keys.path().display(),
                set.keys.len(),
                set.threshold
            );
            for (i, p) in set.previews().iter().enumerate() {
                println!("  share {}: {}", i + 1, p);
            }
            println!("  root token: {}", preview(&set.root_token));
            println!("info: copy this file somewhere safe; shares are never regenerated");
        }
        Err(e) => println!("warning: {}", e),
    }
}

pub fn cmd_status(settings: &Settings, json: bool) -> Result<()> {
    let controller = ModeController::new(settings);
    let status = controller.status(&client(settings)?, &supervisor(settings));

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let store = match (status.reachable, status.initialized, status.sealed) {
        (false, _, _) => "unreachable".to_string(),
        (true, Some(false), _) => "not initialized".to_string(),
        (true, _, Some(true)) => "sealed".to_string(),
        _ => "unsealed".to_string(),
    };

    println!("devvault status");
    println!();
    println!("  Mode:        {}", status.declared_mode);
    println!("  Auto-unseal: {}", yes_no(status.auto_unseal));
    println!("  Address:     {}", status.addr);
    println!(
        "  Process:     {}",
        if status.process_running { "running" } else { "not running" }
    );
    match status.version {
        Some(ref v) => println!("  Store:       {} ({})", store, v),
        None => println!("  Store:       {}", store),
    }
    println!(
        "  Storage:     {}",
        if status.storage_present { "present" } else { "absent" }
    );
    println!(
        "  Key file:    {}",
        if status.keys_present { "present" } else { "absent" }
    );
    if !status.config_present {
        println!();
        println!("info: no configuration written yet; defaults in use");
    }
    if let Some(ref e) = status.config_error {
        println!();
        println!("error: configuration: {}", e);
    }
    Ok(())
}

fn print_migration(report: &MigrationReport, settings: &Settings, controller: &ModeController) {
    let stages: Vec<&str> = report.stages.iter().map(|s| s.as_str()).collect();
    println!("Stages: {}", stages.join(" -> "));

    if let Some(ref dir) = report.backup {
        println!("info: backup written to {} ({} secrets)", dir.display(), report.backed_up);
    }
    for failure in &report.backup_failures {
        println!("warning: not backed up: {} ({})", failure.path, failure.reason);
    }
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    if let Some(ref dir) = report.retired {
        println!("info: durable storage and keys moved to {}", dir.display());
    }
    if report.stages.contains(&MigrationStage::Initializing) && controller.key_store().exists() {
        print_key_file(controller);
    }

    if report.restore_requested {
        if report.stages.contains(&MigrationStage::Restoring) {
            println!(
                "info: restored {}/{} secrets",
                report.restore.restored,
                report.restore.restored + report.restore.failures.len()
            );
        }
        for failure in &report.restore.failures {
            println!("warning: could not restore {}: {}", failure.path, failure.reason);
        }
    } else if report.succeeded() {
        println!("info: secrets discarded; the backup above still has them");
    }

    match &report.outcome {
        MigrationOutcome::Completed => println!("success: now running in {} mode", report.target),
        MigrationOutcome::Degraded => println!(
            "warning: now running in {} mode, but some secrets were not carried over",
            report.target
        ),
        MigrationOutcome::Failed { stage, reason } => {
            println!("error: switch to {} failed while {}: {}", report.target, stage, reason)
        }
    }

    let commands = report.recovery_commands(settings);
    if !commands.is_empty() {
        println!();
        println!("To recover:");
        for command in commands {
            println!("  {}", command);
        }
    }
}

pub fn cmd_switch(settings: &Settings, mode: Mode, migrate: bool, discard: bool, yes: bool) -> Result<()> {
    let controller = ModeController::new(settings);
    let mut prompt = StdinPrompt {
        preset: preset_choice(migrate, discard, yes),
    };

    let outcome = controller.switch_mode(
        mode,
        &mut prompt,
        &mut client(settings)?,
        &mut supervisor(settings),
    )?;

    match outcome {
        SwitchOutcome::AlreadyActive(mode) => {
            println!("info: {} mode is already active; nothing to do", mode);
            Ok(())
        }
        SwitchOutcome::Cancelled => {
            println!("Cancelled");
            Ok(())
        }
        SwitchOutcome::Switched(report) => {
            print_migration(&report, settings, &controller);
            if report.is_clean() {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
    }
}

pub fn cmd_start(settings: &Settings) -> Result<()> {
    let controller = ModeController::new(settings);
    let report = controller.start(&mut client(settings)?, &mut supervisor(settings))?;

    match report.pid {
        Some(pid) => println!("info: store started in {} mode (pid {})", report.mode, pid),
        None => println!("info: store already running at {}", settings.addr),
    }
    println!("info: store output: {}", settings.paths.store_log().display());
    if report.initialized {
        print_key_file(&controller);
    }
    if report.mode == Mode::Ephemeral {
        println!("success: ephemeral store ready (secrets are lost on stop)");
        return Ok(());
    }

    match report.unseal {
        Some(ref outcome) if !outcome.is_success() => {
            println!("error: auto-unseal {}", outcome.as_str());
            for line in outcome.guidance(settings) {
                println!("  {}", line);
            }
            std::process::exit(1);
        }
        Some(_) => println!("success: durable store unsealed"),
        None if report.sealed => {
            println!("warning: durable store is sealed (auto-unseal is off)");
            println!("  devvault unseal");
            println!(
                "  {}",
                manual_unseal_command(settings, settings.key_threshold as u32)
            );
        }
        None => println!("success: durable store ready"),
    }
    Ok(())
}

pub fn cmd_stop(settings: &Settings) -> Result<()> {
    let controller = ModeController::new(settings);
    match controller.stop(&mut supervisor(settings))? {
        StopOutcome::Stopped { pid, forced: false } => println!("success: store stopped (pid {})", pid),
        StopOutcome::Stopped { pid, forced: true } => {
            println!("warning: store did not exit in time and was killed (pid {})", pid)
        }
        StopOutcome::NotRunning => println!("info: store was not running"),
    }
    Ok(())
}

pub fn cmd_unseal(settings: &Settings) -> Result<()> {
    let controller = ModeController::new(settings);
    let outcome = controller.unseal(&client(settings)?);

    match outcome {
        UnsealOutcome::AlreadyUnsealed => println!("info: store is already unsealed"),
        UnsealOutcome::Unsealed { submitted } => {
            println!("success: store unsealed ({} shares submitted)", submitted)
        }
        ref failed => {
            println!("error: unseal {}", failed.as_str());
            for line in failed.guidance(settings) {
                println!("  {}", line);
            }
            std::process::exit(1);
        }
    }
    Ok(())
}

pub fn cmd_auto_unseal(settings: &Settings, state: Toggle) -> Result<()> {
    let controller = ModeController::new(settings);
    let config = controller.set_auto_unseal(state == Toggle::On)?;
    println!("success: auto-unseal {}", yes_no(config.auto_unseal));
    if config.auto_unseal {
        println!(
            "warning: unseal keys in {} will be used without asking on every start",
            controller.key_store().path().display()
        );
    }
    Ok(())
}

pub fn cmd_validate(settings: &Settings, json: bool) -> Result<()> {
    let store = client(settings)?;
    let report = Validator::new(settings, &store).run();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("devvault validate");
        println!();
        for check in &report.checks {
            println!("  [{:>4}] {}: {}", check.level, check.name, check.message);
            for remedy in &check.remedy {
                println!("         -> {}", remedy);
            }
        }
        println!();
        match report.overall() {
            CheckLevel::Fail => println!("error: validation failed"),
            CheckLevel::Warn => println!("warning: passed with warnings"),
            _ => println!("success: all checks passed"),
        }
    }

    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

pub fn cmd_backup(settings: &Settings) -> Result<()> {
    let controller = ModeController::new(settings);
    let (record, export) = controller.backup(&mut client(settings)?, &mut supervisor(settings))?;

    for failure in &export.failures {
        println!("warning: not backed up: {} ({})", failure.path, failure.reason);
    }
    for warning in &export.warnings {
        println!("warning: {}", warning);
    }
    println!("success: backup created: {}", record.name());
    println!("  Dir: {}", record.dir.display());
    println!("  Secrets: {}", record.meta.secret_count);
    Ok(())
}

pub fn cmd_backups(settings: &Settings, json: bool) -> Result<()> {
    let store = BackupStore::new(&settings.paths.backups());
    let backups = store.list()?;

    if json {
        let items: Vec<_> = backups
            .iter()
            .map(|b| {
                serde_json::json!({
                    "name": b.name(),
                    "dir": b.dir,
                    "meta": b.meta,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups found in {}", store.root().display());
        return Ok(());
    }

    println!("Available Backups");
    println!();
    for backup in &backups {
        println!("  {}", backup.name());
        println!(
            "    {} -> {} | {} secrets",
            backup.meta.source_mode, backup.meta.target_mode, backup.meta.secret_count
        );
        println!("    Created: {}", backup.meta.timestamp);
        if !backup.meta.warnings.is_empty() || !backup.meta.failed_paths.is_empty() {
            println!(
                "    {} warnings, {} secrets missing",
                backup.meta.warnings.len(),
                backup.meta.failed_paths.len()
            );
        }
        println!();
    }
    Ok(())
}

pub fn cmd_rollback(settings: &Settings, backup: &str, yes: bool) -> Result<()> {
    let dir = BackupStore::new(&settings.paths.backups()).resolve(backup)?;
    let controller = ModeController::new(settings);
    let mode = controller.configuration()?.mode;

    if !yes
        && !confirm(&format!(
            "Replay {} into the {} store? Existing secrets at the same paths are overwritten.",
            dir.display(),
            mode
        ))?
    {
        println!("Cancelled");
        return Ok(());
    }

    let report = controller.rollback(&dir, &mut client(settings)?, &mut supervisor(settings))?;
    for failure in &report.failures {
        println!("warning: could not restore {}: {}", failure.path, failure.reason);
    }
    if report.is_clean() {
        println!("success: restored {} secrets", report.restored);
        Ok(())
    } else {
        println!(
            "error: restored {} secrets, {} failed",
            report.restored,
            report.failures.len()
        );
        std::process::exit(1);
    }
}

pub fn cmd_reset(settings: &Settings, yes: bool) -> Result<()> {
    if !yes
        && !confirm(&format!(
            "Destroy durable storage in {} and the unseal keys? Backups are kept.",
            settings.paths.durable_dir().display()
        ))?
    {
        println!("Cancelled");
        return Ok(());
    }

    let controller = ModeController::new(settings);
    let report = controller.reset(&mut supervisor(settings))?;
    if report.process_stopped {
        println!("info: store stopped");
    }
    if report.storage_removed {
        println!("info: durable storage removed");
    }
    if report.keys_removed {
        println!("info: unseal keys removed");
    }
    if report.config_reset {
        println!("info: configuration reset to ephemeral");
    }
    println!("success: reset complete");
    Ok(())
}
