//! devvault - mode lifecycle for a local development Vault
//!
//! A developer's store runs either as an in-memory dev server (ephemeral)
//! or as a raft-backed server that keeps its data across restarts
//! (durable). This crate switches between the two without losing secrets,
//! initializes and unseals the durable store, and checks that the declared
//! configuration still matches what is on disk.

pub mod backup;
pub mod client;
pub mod config;
pub mod controller;
pub mod keys;
pub mod migrate;
pub mod mode;
pub mod process;
pub mod retry;
pub mod settings;
pub mod unseal;
pub mod validate;

#[cfg(test)]
mod testing;

pub use client::{StoreApi, StoreError, VaultClient};
pub use controller::{MigrationChoice, MigrationPrompt, ModeController, SwitchOutcome};
pub use migrate::{MigrationOutcome, MigrationReport, MigrationStage};
pub use mode::Mode;
pub use process::{StoreProcess, Supervisor};
pub use settings::Settings;
pub use unseal::UnsealOutcome;
pub use validate::{CheckLevel, ValidationReport, Validator};
