//! devvault - mode switching for a local development Vault
//!
//! Ephemeral for fast iteration, durable when secrets must survive a
//! restart. Every switch is backed up first.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

fn main() {
    // Logs go to stderr so --json output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        println!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = cli.global.settings()?;

    match cli.command {
        Commands::Status { json } => cli::cmd_status(&settings, json),
        Commands::Switch {
            mode,
            migrate,
            discard,
            yes,
        } => cli::cmd_switch(&settings, mode, migrate, discard, yes),
        Commands::Start => cli::cmd_start(&settings),
        Commands::Stop => cli::cmd_stop(&settings),
        Commands::Unseal => cli::cmd_unseal(&settings),
        Commands::AutoUnseal { state } => cli::cmd_auto_unseal(&settings, state),
        Commands::Validate { json } => cli::cmd_validate(&settings, json),
        Commands::Backup => cli::cmd_backup(&settings),
        Commands::Backups { json } => cli::cmd_backups(&settings, json),
        Commands::Rollback { backup, yes } => cli::cmd_rollback(&settings, &backup, yes),
        Commands::Reset { yes } => cli::cmd_reset(&settings, yes),
    }
}
