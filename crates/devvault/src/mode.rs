//! Storage modes of the development store

use serde::{Deserialize, Serialize};

/// Which storage backend the store runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// In-memory dev server: auto-initialized, auto-unsealed, lost on restart
    Ephemeral,
    /// Raft-backed server: explicit init and unseal, survives restarts
    Durable,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Durable => "durable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ephemeral" | "dev" | "memory" | "inmem" => Some(Self::Ephemeral),
            "durable" | "raft" | "persistent" => Some(Self::Durable),
            _ => None,
        }
    }

    /// The other mode
    pub fn opposite(&self) -> Self {
        match self {
            Self::Ephemeral => Self::Durable,
            Self::Durable => Self::Ephemeral,
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Ephemeral, Self::Durable]
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::Ephemeral
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
