//! Tracing setup.
//!
//! Structured logs are the primary debugging surface for a system that
//! manages real capital: every transition the state machine makes is
//! reconstructable from the log stream.
//!
//! # Configuration
//!
//! - `RUST_LOG`: standard env-filter directives (default: `info`)

use tracing_subscriber::EnvFilter;

/// Initialize console tracing.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();
}
