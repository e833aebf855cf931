//! Trade signals and order sides.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side for an entry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy (opens a long position).
    Buy,
    /// Sell (opens a short position).
    Sell,
}

impl Side {
    /// The position side this entry side produces.
    #[must_use]
    pub const fn position_side(self) -> &'static str {
        match self {
            Self::Buy => "long",
            Self::Sell => "short",
        }
    }

    /// The order side that closes a position opened with this side.
    #[must_use]
    pub const fn close_side(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Wire representation ("buy" / "sell").
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured trade instruction, produced by an upstream signal source.
///
/// The engine does not parse raw signal text; it consumes this struct.
/// Up to three take-profit levels are carried in ascending tranche order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Exchange instrument id (e.g. "BTC-USDT").
    pub symbol: String,
    /// Entry side.
    pub side: Side,
    /// Percentage of available equity to commit as margin.
    pub equity_pct: Decimal,
    /// Requested entry price.
    pub entry: Decimal,
    /// Leverage multiplier.
    pub leverage: u32,
    /// Take-profit levels (first is TP1).
    #[serde(default)]
    pub tps: Vec<Decimal>,
    /// Stop-loss level.
    #[serde(default)]
    pub sl: Option<Decimal>,
}

impl TradeSignal {
    /// First take-profit level, if present.
    #[must_use]
    pub fn tp1(&self) -> Option<Decimal> {
        self.tps.first().copied()
    }

    /// Second take-profit level, if present.
    #[must_use]
    pub fn tp2(&self) -> Option<Decimal> {
        self.tps.get(1).copied()
    }

    /// Third take-profit level, if present.
    #[must_use]
    pub fn tp3(&self) -> Option<Decimal> {
        self.tps.get(2).copied()
    }
}
