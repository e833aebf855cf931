//! Scaled positions and exit plans.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Price plan attached to an entry: three take-profit levels and a stop.
///
/// TP1 and the stop are mandatory for the scaled strategy; TP2/TP3 are
/// optional and their transitions are skipped when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPlan {
    /// First take-profit trigger (closes 50%).
    pub tp1: Decimal,
    /// Second take-profit trigger (closes 25%, relocates the stop).
    #[serde(default)]
    pub tp2: Option<Decimal>,
    /// Third take-profit trigger (closes the remainder).
    #[serde(default)]
    pub tp3: Option<Decimal>,
    /// Stop-loss trigger.
    pub sl: Decimal,
}

/// Lifecycle stage of a scaled exit, derived from the monotonic hit flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStage {
    /// No take-profit hit yet; waiting on TP1.
    AtTp1,
    /// TP1 hit; waiting on TP2.
    AtTp2,
    /// TP1 and TP2 hit; waiting on TP3.
    AtTp3,
    /// Fully closed by TP3.
    ClosedTp3,
    /// Closed by the stop-loss.
    ClosedSl,
}

impl std::fmt::Display for ExitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AtTp1 => "at_tp1",
            Self::AtTp2 => "at_tp2",
            Self::AtTp3 => "at_tp3",
            Self::ClosedTp3 => "closed_tp3",
            Self::ClosedSl => "closed_sl",
        };
        f.write_str(s)
    }
}

/// A position managed by the scaled-exit strategy.
///
/// One exists per symbol while the exit is in flight. Mutation is owned
/// by the state machine; the reconciliation loop holds it only for the
/// duration of one polling pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaledPosition {
    /// Exchange instrument id.
    pub symbol: String,
    /// Entry side.
    pub side: Side,
    /// Size at fill. Immutable.
    pub original_size: Decimal,
    /// Current open size. Monotonically non-increasing.
    pub remaining_size: Decimal,
    /// Fill price.
    pub entry_price: Decimal,
    /// TP1 trigger price.
    pub tp1_price: Decimal,
    /// TP2 trigger price, if the signal carried one.
    #[serde(default)]
    pub tp2_price: Option<Decimal>,
    /// TP3 trigger price, if the signal carried one.
    #[serde(default)]
    pub tp3_price: Option<Decimal>,
    /// Configured stop-loss trigger. Never mutated; the effective trigger
    /// moves to `entry_price` after TP2 (see [`Self::current_sl_trigger`]).
    pub sl_price: Decimal,
    /// Leverage the position was opened with.
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// TP1 trigger observed. Settable exactly once.
    #[serde(default)]
    pub tp1_hit: bool,
    /// TP2 trigger observed. Settable exactly once.
    #[serde(default)]
    pub tp2_hit: bool,
    /// TP3 trigger observed. Terminal.
    #[serde(default)]
    pub tp3_hit: bool,
    /// Stop-loss trigger observed. Terminal.
    #[serde(default)]
    pub sl_hit: bool,

    /// Broker id of the live TP1 conditional order.
    #[serde(default)]
    pub tp1_order_id: Option<String>,
    /// Broker id of the live TP2 conditional order.
    #[serde(default)]
    pub tp2_order_id: Option<String>,
    /// Broker id of the live TP3 conditional order.
    #[serde(default)]
    pub tp3_order_id: Option<String>,
    /// Broker id of the live stop-loss conditional order. Overwritten on
    /// every replacement; at most one is live after a successful replace.
    #[serde(default)]
    pub sl_order_id: Option<String>,

    /// Last observed unrealized PnL. Display only, never authoritative.
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    /// Last observed mark price. Display only.
    #[serde(default)]
    pub mark_price: Decimal,

    /// Consecutive cycles the exchange reported neither an open position
    /// nor pending conditional orders. Runtime-only: a restart re-runs
    /// the close-confirmation debounce from zero.
    #[serde(skip)]
    pub close_checks: u32,
}

const fn default_leverage() -> u32 {
    1
}

impl ScaledPosition {
    /// Create a freshly-filled position from an entry fill and its plan.
    #[must_use]
    pub fn open(
        symbol: impl Into<String>,
        side: Side,
        size: Decimal,
        fill_price: Decimal,
        plan: &ExitPlan,
        leverage: u32,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            original_size: size,
            remaining_size: size,
            entry_price: fill_price,
            tp1_price: plan.tp1,
            tp2_price: plan.tp2,
            tp3_price: plan.tp3,
            sl_price: plan.sl,
            leverage,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            sl_hit: false,
            tp1_order_id: None,
            tp2_order_id: None,
            tp3_order_id: None,
            sl_order_id: None,
            unrealized_pnl: Decimal::ZERO,
            mark_price: Decimal::ZERO,
            close_checks: 0,
        }
    }

    /// Position side this entry produced ("long" / "short").
    #[must_use]
    pub const fn position_side(&self) -> &'static str {
        self.side.position_side()
    }

    /// Order side that reduces this position.
    #[must_use]
    pub const fn close_side(&self) -> Side {
        self.side.close_side()
    }

    /// Whether the position has reached a terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.remaining_size <= Decimal::ZERO || self.sl_hit || self.tp3_hit
    }

    /// The trigger price the stop-loss should currently sit at: the
    /// configured stop until TP2, breakeven (entry) afterwards.
    #[must_use]
    pub const fn current_sl_trigger(&self) -> Decimal {
        if self.tp2_hit {
            self.entry_price
        } else {
            self.sl_price
        }
    }

    /// Current lifecycle stage.
    #[must_use]
    pub const fn stage(&self) -> ExitStage {
        if self.sl_hit {
            ExitStage::ClosedSl
        } else if self.tp3_hit {
            ExitStage::ClosedTp3
        } else if self.tp2_hit {
            ExitStage::AtTp3
        } else if self.tp1_hit {
            ExitStage::AtTp2
        } else {
            ExitStage::AtTp1
        }
    }
}

/// A limit entry order that has been placed but not yet filled.
///
/// Tracked by the reconciliation loop until it fills (spawning a
/// [`ScaledPosition`]), is cancelled, or vanishes from the exchange's
/// books long enough to trigger the assume-filled fallback.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Broker order id of the resting limit order.
    pub order_id: String,
    /// Exchange instrument id.
    pub symbol: String,
    /// Entry side.
    pub side: Side,
    /// Requested size (contracts).
    pub size: Decimal,
    /// Requested limit price.
    pub entry_price: Decimal,
    /// Leverage for the position once filled.
    pub leverage: u32,
    /// Exit plan to attach on fill.
    pub plan: ExitPlan,
    /// Consecutive cycles the order was absent from both the pending
    /// list and order history.
    pub misses: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position() -> ScaledPosition {
        ScaledPosition::open(
            "BTC-USDT",
            Side::Buy,
            dec!(100),
            dec!(100),
            &ExitPlan {
                tp1: dec!(101),
                tp2: Some(dec!(102)),
                tp3: Some(dec!(103)),
                sl: dec!(99),
            },
            20,
        )
    }

    #[test]
    fn test_open_starts_at_tp1_with_full_size() {
        let pos = make_position();
        assert_eq!(pos.stage(), ExitStage::AtTp1);
        assert_eq!(pos.remaining_size, pos.original_size);
        assert!(!pos.is_closed());
    }

    #[test]
    fn test_stage_progression() {
        let mut pos = make_position();

        pos.tp1_hit = true;
        assert_eq!(pos.stage(), ExitStage::AtTp2);

        pos.tp2_hit = true;
        assert_eq!(pos.stage(), ExitStage::AtTp3);

        pos.tp3_hit = true;
        assert_eq!(pos.stage(), ExitStage::ClosedTp3);
        assert!(pos.is_closed());
    }

    #[test]
    fn test_sl_hit_is_terminal_at_any_stage() {
        let mut pos = make_position();
        pos.tp1_hit = true;
        pos.sl_hit = true;
        assert_eq!(pos.stage(), ExitStage::ClosedSl);
        assert!(pos.is_closed());
    }

    #[test]
    fn test_current_sl_trigger_moves_to_breakeven_after_tp2() {
        let mut pos = make_position();
        assert_eq!(pos.current_sl_trigger(), dec!(99));

        pos.tp1_hit = true;
        assert_eq!(pos.current_sl_trigger(), dec!(99));

        pos.tp2_hit = true;
        assert_eq!(pos.current_sl_trigger(), dec!(100));
        // Configured stop is untouched.
        assert_eq!(pos.sl_price, dec!(99));
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_flags_ids_and_sizes() {
        let mut pos = make_position();
        pos.tp1_hit = true;
        pos.remaining_size = dec!(50);
        pos.tp1_order_id = Some("tpsl-1".to_string());
        pos.sl_order_id = Some("tpsl-3".to_string());
        pos.close_checks = 1;

        let json = serde_json::to_string(&pos).expect("serialize");
        let restored: ScaledPosition = serde_json::from_str(&json).expect("deserialize");

        assert!(restored.tp1_hit);
        assert!(!restored.tp2_hit);
        assert_eq!(restored.remaining_size, dec!(50));
        assert_eq!(restored.original_size, dec!(100));
        assert_eq!(restored.tp1_order_id.as_deref(), Some("tpsl-1"));
        assert_eq!(restored.sl_order_id.as_deref(), Some("tpsl-3"));
        // Runtime-only debounce state does not survive a restart.
        assert_eq!(restored.close_checks, 0);
    }

    #[test]
    fn test_old_snapshot_without_new_fields_still_loads() {
        // A snapshot written before leverage/telemetry fields existed.
        let json = r#"{
            "symbol": "ETH-USDT",
            "side": "sell",
            "original_size": "10",
            "remaining_size": "10",
            "entry_price": "3000",
            "tp1_price": "2900",
            "sl_price": "3100"
        }"#;

        let pos: ScaledPosition = serde_json::from_str(json).expect("should default");
        assert_eq!(pos.leverage, 1);
        assert!(pos.tp2_price.is_none());
        assert!(!pos.tp1_hit);
        assert!(pos.sl_order_id.is_none());
        assert_eq!(pos.unrealized_pnl, Decimal::ZERO);
    }
}
