// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Exit Engine - Rust Core Library
//!
//! Scaled-exit position engine for the Tranche trading system.
//!
//! The engine opens futures positions from structured trade signals and
//! manages their exits in three tranches: 50% at TP1, 25% at TP2 (with
//! the stop relocated to breakeven), and the remainder at TP3. Local
//! state is reconciled against the exchange every few seconds and
//! persisted write-through, so a restart resumes mid-lifecycle instead
//! of losing track of live conditional orders.
//!
//! # Architecture
//!
//! - [`models`]: Signals, scaled positions, exit plans, instrument specs
//! - [`gateway`]: The `BrokerGateway` boundary, REST adapter, and mock
//! - [`sizing`]: Lot/tick rounding and tranche size computation
//! - [`execution`]: State machine, reconciliation loop, persistence
//! - [`config`]: YAML configuration with env interpolation
//! - [`telemetry`]: Tracing setup

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod execution;
pub mod gateway;
pub mod models;
pub mod sizing;
pub mod telemetry;

pub use config::{Config, load_config};
pub use execution::{
    EntryExecutor, ExitTrigger, Reconciler, ScaledExitMachine, StateStore, intake_channel,
};
pub use gateway::{BlofinCredentials, BlofinGateway, BrokerGateway, GatewayError, MockGateway};
pub use models::{ExitPlan, ScaledPosition, Side, TradeSignal};
