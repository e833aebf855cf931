//! State persistence configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// State persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path of the JSON snapshot holding live scaled positions.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state/scaled_positions.json")
}
