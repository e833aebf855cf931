//! Position sizing and exchange-step rounding.
//!
//! Deterministic helpers the execution core calls: converting account
//! balance, leverage, and instrument metadata into an order volume, and
//! rounding sizes/prices to exchange step sizes.

use rust_decimal::Decimal;

use crate::models::{ExitPlan, InstrumentSpec, Side};

/// Round a size to the nearest lot step.
///
/// A zero step passes the size through unchanged. Uses banker's rounding
/// at the midpoint, matching exchange step semantics.
#[must_use]
pub fn round_to_lot(size: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size.is_zero() {
        return size;
    }
    ((size / lot_size).round() * lot_size).normalize()
}

/// Round a price to the nearest tick step.
#[must_use]
pub fn round_to_tick(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size.is_zero() {
        return price;
    }
    ((price / tick_size).round() * tick_size).normalize()
}

/// Size of the TP1 tranche: half the position, rounded to lot.
///
/// If half the position rounds below one lot the split collapses and the
/// whole position is assigned to TP1 (single-shot exit).
#[must_use]
pub fn tp1_size(original_size: Decimal, lot_size: Decimal) -> Decimal {
    let half = round_to_lot(original_size * Decimal::new(5, 1), lot_size);
    if half < lot_size {
        original_size
    } else {
        half
    }
}

/// Convert margin budget into a contract volume.
///
/// `balance × equity_pct% × leverage` gives the notional; dividing by the
/// per-contract value at the entry price gives contracts, rounded to lot
/// and floored at the instrument minimum.
#[must_use]
pub fn contract_volume(
    balance: Decimal,
    equity_pct: Decimal,
    leverage: u32,
    entry_price: Decimal,
    spec: &InstrumentSpec,
) -> Decimal {
    let contract_value = spec.contract_value * entry_price;
    if contract_value.is_zero() {
        return Decimal::ZERO;
    }

    let margin = balance * (equity_pct / Decimal::ONE_HUNDRED);
    let notional = margin * Decimal::from(leverage);
    let volume = round_to_lot(notional / contract_value, spec.lot_size);

    if volume < spec.min_size {
        spec.min_size
    } else {
        volume
    }
}

/// Drop plan levels that sit on the wrong side of the effective entry.
///
/// For a long, take-profits at or below entry and a stop at or above
/// entry can never trigger in the intended direction; the exchange would
/// fire them immediately. Mirrored for shorts. Returns the filtered
/// levels; callers decide whether a missing TP1 or stop rejects the trade.
#[must_use]
pub fn filter_plan_levels(
    side: Side,
    effective_entry: Decimal,
    plan: &ExitPlan,
) -> (Option<Decimal>, Option<Decimal>, Option<Decimal>, Option<Decimal>) {
    let tp_valid = |tp: Decimal| match side {
        Side::Buy => tp > effective_entry,
        Side::Sell => tp < effective_entry,
    };
    let sl_valid = |sl: Decimal| match side {
        Side::Buy => sl < effective_entry,
        Side::Sell => sl > effective_entry,
    };

    (
        Some(plan.tp1).filter(|p| tp_valid(*p)),
        plan.tp2.filter(|p| tp_valid(*p)),
        plan.tp3.filter(|p| tp_valid(*p)),
        Some(plan.sl).filter(|p| sl_valid(*p)),
    )
}
