//! Broker gateway configuration.

use serde::{Deserialize, Serialize};

/// Gateway configuration for the broker REST API.
///
/// Credentials are intentionally not part of the config file; they are
/// read from environment variables at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// REST API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Margin mode sent with orders ("isolated" or "cross").
    #[serde(default = "default_margin_mode")]
    pub margin_mode: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            margin_mode: default_margin_mode(),
        }
    }
}

fn default_base_url() -> String {
    "https://openapi.blofin.com".to_string()
}

const fn default_timeout_secs() -> u64 {
    10
}

fn default_margin_mode() -> String {
    "isolated".to_string()
}
