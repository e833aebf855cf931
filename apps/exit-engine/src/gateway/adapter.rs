//! Broker gateway trait definition.
//!
//! The execution core drives every exchange interaction through this
//! trait. Implementations own transport, signing, and rate limiting;
//! the core only sees typed values and [`GatewayError`].

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{InstrumentSpec, Side};

use super::{
    CloseReason, ConditionalOrder, ConditionalOrderSpec, GatewayError, PendingOrder,
    PositionSnapshot,
};

/// Trait for broker gateways.
///
/// Every method is a network I/O boundary: callers must not hold locks
/// across a call, and should treat any single failure as recoverable.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Place a conditional (TPSL) order. Returns the broker order id.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange rejects the order or the call
    /// fails in transit.
    async fn place_conditional_order(
        &self,
        spec: &ConditionalOrderSpec,
    ) -> Result<String, GatewayError>;

    /// Cancel a conditional order by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the order cannot be cancelled or the call
    /// fails in transit.
    async fn cancel_conditional_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), GatewayError>;

    /// Amend a live conditional order's trigger prices and/or size.
    ///
    /// Callers treat any failure as "fall back to cancel + recreate".
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange rejects the amendment.
    async fn amend_conditional_order(
        &self,
        symbol: &str,
        order_id: &str,
        new_tp: Option<Decimal>,
        new_sl: Option<Decimal>,
        new_size: Option<Decimal>,
    ) -> Result<(), GatewayError>;

    /// Conditional-order history for a symbol. Ordering is not
    /// guaranteed; callers re-order by `updated_at` before acting.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn conditional_order_history(
        &self,
        symbol: &str,
    ) -> Result<Vec<ConditionalOrder>, GatewayError>;

    /// Still-pending conditional orders for a symbol.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn pending_conditional_orders(
        &self,
        symbol: &str,
    ) -> Result<Vec<ConditionalOrder>, GatewayError>;

    /// Open positions, optionally narrowed to one symbol. Positions with
    /// zero size are omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn open_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, GatewayError>;

    /// Pending (unfilled) entry orders, optionally narrowed to one symbol.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn pending_limit_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PendingOrder>, GatewayError>;

    /// Look up one entry order in order history. `None` when the exchange
    /// has no record of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn order_history(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<PendingOrder>, GatewayError>;

    /// Classify why a vanished position closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying history queries fail.
    async fn classify_close_reason(&self, symbol: &str) -> Result<CloseReason, GatewayError>;

    /// Step sizes and contract metadata for an instrument.
    ///
    /// # Errors
    ///
    /// Returns an error if the instrument is unknown or the query fails.
    async fn instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec, GatewayError>;

    /// Place a market entry order. Returns the broker order id.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange rejects the order.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
        leverage: u32,
    ) -> Result<String, GatewayError>;

    /// Place a limit entry order. Returns the broker order id.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange rejects the order.
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
        leverage: u32,
    ) -> Result<String, GatewayError>;

    /// Last traded price for a symbol.
    ///
    /// # Errors
    ///
    /// Returns an error if no ticker is available.
    async fn last_price(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    /// Available margin balance in the settlement currency.
    ///
    /// # Errors
    ///
    /// Returns an error if the account query fails.
    async fn available_balance(&self) -> Result<Decimal, GatewayError>;

    /// Gateway name for logging.
    fn gateway_name(&self) -> &'static str;
}
