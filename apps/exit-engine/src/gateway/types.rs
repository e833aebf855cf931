//! Typed records and error types for gateway operations.
//!
//! Every broker response is parsed into one of these structs at the
//! boundary, so the execution core never branches on raw payload shapes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::Side;

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// API returned an error envelope.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code from the broker.
        code: String,
        /// Error message from the broker.
        message: String,
    },

    /// Rate limited.
    #[error("rate limited")]
    RateLimited,

    /// Authentication failed.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Response payload could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Order was rejected by the exchange.
    #[error("order rejected: {0}")]
    OrderRejected(String),
}

impl GatewayError {
    /// Whether retrying the call once is worthwhile.
    ///
    /// Timeouts, rate limits, and transport failures are transient;
    /// rejections, auth failures, and malformed payloads are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Timeout(_) | Self::RateLimited
        )
    }
}

/// Lifecycle state of an exchange order (entry or conditional).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderLifecycle {
    /// Resting on the book.
    Live,
    /// Partially executed, still open.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Conditional trigger fired.
    Triggered,
    /// Cancelled before execution.
    Canceled,
    /// Rejected or failed at the exchange.
    Failed,
}

impl OrderLifecycle {
    /// Parse a wire state string. Unknown states map to `Failed` so they
    /// are never mistaken for an executed trigger.
    #[must_use]
    pub fn from_wire(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "live" | "new" | "effective" => Self::Live,
            "partially_filled" => Self::PartiallyFilled,
            "filled" => Self::Filled,
            "triggered" => Self::Triggered,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Failed,
        }
    }

    /// Whether a conditional order in this state has executed its trigger.
    #[must_use]
    pub const fn is_triggered(self) -> bool {
        matches!(self, Self::Filled | Self::Triggered)
    }
}

/// Request to place a conditional (TPSL) order.
///
/// Carries the position's entry side; adapters derive the position side
/// and the reduce-only closing side from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalOrderSpec {
    /// Exchange instrument id.
    pub symbol: String,
    /// Side the position was entered with.
    pub side: Side,
    /// Size to close when triggered.
    pub size: Decimal,
    /// Take-profit trigger price, if this is a TP order.
    pub tp_trigger: Option<Decimal>,
    /// Stop-loss trigger price, if this is an SL order.
    pub sl_trigger: Option<Decimal>,
}

/// A conditional order as reported by the exchange.
#[derive(Debug, Clone)]
pub struct ConditionalOrder {
    /// Broker order id.
    pub order_id: String,
    /// Lifecycle state.
    pub state: OrderLifecycle,
    /// Take-profit trigger, if any.
    pub tp_trigger: Option<Decimal>,
    /// Stop-loss trigger, if any.
    pub sl_trigger: Option<Decimal>,
    /// Last update time, used to apply triggers in time order.
    pub updated_at: DateTime<Utc>,
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    /// Exchange instrument id.
    pub symbol: String,
    /// Open size (contracts, absolute).
    pub size: Decimal,
    /// Unrealized PnL.
    pub unrealized_pnl: Decimal,
    /// Mark price.
    pub mark_price: Decimal,
}

/// An entry order as reported by the pending list or order history.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    /// Broker order id.
    pub order_id: String,
    /// Lifecycle state.
    pub state: OrderLifecycle,
    /// Executed size so far.
    pub filled_size: Decimal,
    /// Average fill price, when anything executed.
    pub avg_price: Option<Decimal>,
}

/// Why a position left the exchange's books.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by a take-profit trigger.
    TakeProfit,
    /// Closed by a stop-loss trigger.
    StopLoss,
    /// Closed manually outside the engine.
    Manual,
    /// Forcibly liquidated.
    Liquidation,
    /// Could not be classified.
    Unknown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TakeProfit => "take_profit",
            Self::StopLoss => "stop_loss",
            Self::Manual => "manual",
            Self::Liquidation => "liquidation",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_from_wire() {
        assert_eq!(OrderLifecycle::from_wire("live"), OrderLifecycle::Live);
        assert_eq!(OrderLifecycle::from_wire("FILLED"), OrderLifecycle::Filled);
        assert_eq!(
            OrderLifecycle::from_wire("cancelled"),
            OrderLifecycle::Canceled
        );
        assert_eq!(
            OrderLifecycle::from_wire("something_new"),
            OrderLifecycle::Failed
        );
    }

    #[test]
    fn test_triggered_states() {
        assert!(OrderLifecycle::Filled.is_triggered());
        assert!(OrderLifecycle::Triggered.is_triggered());
        assert!(!OrderLifecycle::Live.is_triggered());
        assert!(!OrderLifecycle::Canceled.is_triggered());
    }

    #[test]
    fn test_transient_errors() {
        assert!(GatewayError::Timeout(10).is_transient());
        assert!(GatewayError::RateLimited.is_transient());
        assert!(GatewayError::Http("connection reset".to_string()).is_transient());
        assert!(
            !GatewayError::Api {
                code: "51000".to_string(),
                message: "bad size".to_string()
            }
            .is_transient()
        );
        assert!(!GatewayError::AuthenticationFailed.is_transient());
    }
}
