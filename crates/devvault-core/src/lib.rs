//! devvault-core - Shared functionality for the devvault tools
//!
//! Standard locations, process helpers and human-readable formatting used
//! by the store lifecycle tooling.

pub mod format;
pub mod paths;
pub mod process;

pub use format::{format_size, preview};
pub use paths::Paths;
