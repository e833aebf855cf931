//! Engine-level configuration.

use serde::{Deserialize, Serialize};

/// Trading environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Demo/testnet trading.
    #[default]
    Paper,
    /// Real capital.
    Live,
}

impl Environment {
    /// Whether this is the live environment.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => f.write_str("PAPER"),
            Self::Live => f.write_str("LIVE"),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trading environment (paper/live).
    #[serde(default)]
    pub environment: Environment,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Paper,
        }
    }
}
