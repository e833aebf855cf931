//! The scaled-exit state machine.
//!
//! Owns the lifecycle of one scaled position, from the initial TP1/SL
//! setup at fill through each observed trigger to terminal state.
//! Transitions are driven by the reconciliation loop from observed
//! exchange events; the machine never polls.
//!
//! Order management failures here are degraded-but-recoverable: the
//! trigger already happened on the exchange, so internal flags always
//! advance and failures are logged rather than rolled back.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::gateway::{BrokerGateway, ConditionalOrderSpec, RetryPolicy, with_retry};
use crate::models::{InstrumentSpec, ScaledPosition};
use crate::sizing::{round_to_lot, tp1_size};

use super::book::FillEvent;

/// An observed exchange event that advances a position's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    /// TP1 conditional order executed (50% closed).
    Tp1,
    /// TP2 conditional order executed (75% closed, stop to breakeven).
    Tp2,
    /// TP3 conditional order executed (fully closed).
    Tp3,
    /// Stop-loss executed (fully closed).
    StopLoss,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tp1 => "tp1",
            Self::Tp2 => "tp2",
            Self::Tp3 => "tp3",
            Self::StopLoss => "sl",
        };
        f.write_str(s)
    }
}

/// The scaled-exit state machine, generic over the broker gateway.
pub struct ScaledExitMachine<G> {
    gateway: Arc<G>,
    retry: RetryPolicy,
}

impl<G: BrokerGateway> ScaledExitMachine<G> {
    /// Create a machine using the default retry policy.
    #[must_use]
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            retry: RetryPolicy::default(),
        }
    }

    /// Create a machine with a custom retry policy.
    #[must_use]
    pub fn with_retry_policy(gateway: Arc<G>, retry: RetryPolicy) -> Self {
        Self { gateway, retry }
    }

    /// Handle an entry fill: create the position and attach the initial
    /// TP1 and stop-loss conditional orders.
    ///
    /// TP1 is sized at half the position rounded to lot, collapsing to
    /// the full size when the half rounds below one lot. The stop covers
    /// the full size.
    pub async fn open_position(
        &self,
        fill: &FillEvent,
        spec: &InstrumentSpec,
    ) -> ScaledPosition {
        let mut pos = ScaledPosition::open(
            fill.symbol.clone(),
            fill.side,
            fill.size,
            fill.price,
            &fill.plan,
            fill.leverage,
        );

        let tp1 = tp1_size(pos.original_size, spec.lot_size);
        let single_shot = tp1 == pos.original_size;

        info!(
            symbol = %pos.symbol,
            side = %pos.side,
            size = %pos.original_size,
            entry = %pos.entry_price,
            tp1 = %pos.tp1_price,
            tp2 = ?pos.tp2_price,
            tp3 = ?pos.tp3_price,
            sl = %pos.sl_price,
            single_shot = single_shot,
            "Order filled, opening scaled position"
        );

        pos.tp1_order_id = self
            .place_conditional(
                &pos,
                tp1,
                Some(pos.tp1_price),
                None,
                "tp1",
            )
            .await;

        pos.sl_order_id = self
            .place_conditional(&pos, pos.original_size, None, Some(pos.sl_price), "sl")
            .await;

        pos
    }

    /// Apply an observed trigger to a position.
    pub async fn apply(
        &self,
        pos: &mut ScaledPosition,
        trigger: ExitTrigger,
        spec: &InstrumentSpec,
    ) {
        match trigger {
            ExitTrigger::Tp1 => self.handle_tp1(pos, spec).await,
            ExitTrigger::Tp2 => self.handle_tp2(pos, spec).await,
            ExitTrigger::Tp3 => Self::handle_tp3(pos),
            ExitTrigger::StopLoss => Self::handle_stop_loss(pos),
        }
    }

    /// TP1 executed: half the position closed. Resize the stop to the
    /// remainder (trigger unchanged) and arm TP2 for half the remainder.
    async fn handle_tp1(&self, pos: &mut ScaledPosition, spec: &InstrumentSpec) {
        pos.tp1_hit = true;
        pos.remaining_size = round_to_lot(pos.original_size * Decimal::new(5, 1), spec.lot_size);

        info!(
            symbol = %pos.symbol,
            stage = %pos.stage(),
            price = %pos.tp1_price,
            remaining = %pos.remaining_size,
            "TP1 hit, 50% closed"
        );

        if pos.remaining_size.is_zero() {
            // The 50% tranche covered the whole position (single-shot
            // collapse); nothing is left to protect or scale out of.
            info!(symbol = %pos.symbol, "Position fully closed at TP1");
            return;
        }

        let (sl_trigger, sl_size) = (pos.sl_price, pos.remaining_size);
        self.replace_stop_loss(pos, sl_trigger, sl_size).await;

        let tp2 = round_to_lot(pos.remaining_size * Decimal::new(5, 1), spec.lot_size);
        match pos.tp2_price {
            Some(price) if tp2 >= spec.lot_size => {
                pos.tp2_order_id = self
                    .place_conditional(pos, tp2, Some(price), None, "tp2")
                    .await;
            }
            Some(_) => {
                warn!(
                    symbol = %pos.symbol,
                    remaining = %pos.remaining_size,
                    "TP2 tranche rounds below one lot, skipping"
                );
            }
            None => {
                info!(symbol = %pos.symbol, "No TP2 level in plan, skipping");
            }
        }
    }

    /// TP2 executed: 75% closed. Relocate the stop to breakeven sized at
    /// the remainder and arm TP3 for everything left.
    async fn handle_tp2(&self, pos: &mut ScaledPosition, spec: &InstrumentSpec) {
        pos.tp2_hit = true;
        pos.remaining_size = round_to_lot(pos.original_size * Decimal::new(25, 2), spec.lot_size);

        info!(
            symbol = %pos.symbol,
            stage = %pos.stage(),
            price = ?pos.tp2_price,
            remaining = %pos.remaining_size,
            breakeven = %pos.entry_price,
            "TP2 hit, stop moving to breakeven"
        );

        if pos.remaining_size.is_zero() {
            info!(symbol = %pos.symbol, "Position fully closed at TP2");
            return;
        }

        self.relocate_stop_to_breakeven(pos).await;

        match pos.tp3_price {
            Some(price) => {
                pos.tp3_order_id = self
                    .place_conditional(pos, pos.remaining_size, Some(price), None, "tp3")
                    .await;
            }
            None => {
                info!(symbol = %pos.symbol, "No TP3 level in plan, skipping");
            }
        }
    }

    /// TP3 executed: position fully closed. Terminal.
    fn handle_tp3(pos: &mut ScaledPosition) {
        pos.tp3_hit = true;
        pos.remaining_size = Decimal::ZERO;

        info!(
            symbol = %pos.symbol,
            stage = %pos.stage(),
            price = ?pos.tp3_price,
            entry = %pos.entry_price,
            "TP3 hit, scaled exit complete"
        );
    }

    /// Stop-loss executed. Terminal at any stage.
    fn handle_stop_loss(pos: &mut ScaledPosition) {
        pos.sl_hit = true;
        let effective_trigger = pos.current_sl_trigger();
        pos.remaining_size = Decimal::ZERO;

        info!(
            symbol = %pos.symbol,
            stage = %pos.stage(),
            trigger = %effective_trigger,
            entry = %pos.entry_price,
            tp1_hit = pos.tp1_hit,
            tp2_hit = pos.tp2_hit,
            "Stop-loss hit, position closed"
        );
    }

    /// Move the stop to breakeven: amend the live order first, and fall
    /// back to cancel + recreate when the amendment is rejected.
    async fn relocate_stop_to_breakeven(&self, pos: &mut ScaledPosition) {
        let new_trigger = pos.entry_price;
        let new_size = pos.remaining_size;

        if let Some(order_id) = pos.sl_order_id.clone() {
            let amend = with_retry("amend_sl", &self.retry, || {
                self.gateway.amend_conditional_order(
                    &pos.symbol,
                    &order_id,
                    None,
                    Some(new_trigger),
                    Some(new_size),
                )
            })
            .await;

            match amend {
                Ok(()) => {
                    info!(
                        symbol = %pos.symbol,
                        order_id = %order_id,
                        trigger = %new_trigger,
                        size = %new_size,
                        "Stop-loss amended to breakeven"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        symbol = %pos.symbol,
                        order_id = %order_id,
                        error = %e,
                        "Stop-loss amend rejected, falling back to cancel + recreate"
                    );
                }
            }
        }

        self.replace_stop_loss(pos, new_trigger, new_size).await;
    }

    /// Replace the live stop-loss order: cancel the old one best-effort,
    /// then create the new one regardless of the cancel outcome.
    ///
    /// A failed cancel is accepted (brief window where two stops may
    /// coexist); blocking the replacement on it would leave the position
    /// unprotected for longer.
    async fn replace_stop_loss(
        &self,
        pos: &mut ScaledPosition,
        trigger_price: Decimal,
        size: Decimal,
    ) {
        let mut old_cancelled = true;

        if let Some(old_id) = pos.sl_order_id.clone() {
            let cancel = with_retry("cancel_sl", &self.retry, || {
                self.gateway.cancel_conditional_order(&pos.symbol, &old_id)
            })
            .await;

            if let Err(e) = cancel {
                old_cancelled = false;
                warn!(
                    symbol = %pos.symbol,
                    order_id = %old_id,
                    error = %e,
                    "Failed to cancel stop-loss, proceeding with replacement"
                );
            }
        }

        let new_id = self
            .place_conditional(pos, size, None, Some(trigger_price), "sl")
            .await;

        match new_id {
            Some(id) => {
                info!(
                    symbol = %pos.symbol,
                    order_id = %id,
                    trigger = %trigger_price,
                    size = %size,
                    "Stop-loss replaced"
                );
                pos.sl_order_id = Some(id);
            }
            None if old_cancelled => {
                // Old order gone and the new one failed: no stop is live.
                warn!(
                    symbol = %pos.symbol,
                    "Position has no live stop-loss after failed replacement"
                );
                pos.sl_order_id = None;
            }
            None => {
                // Cancel failed and create failed: the old order is
                // likely still live, keep tracking it.
                warn!(
                    symbol = %pos.symbol,
                    order_id = ?pos.sl_order_id,
                    "Stop-loss replacement failed, keeping previous order id"
                );
            }
        }
    }

    /// Place one conditional order, retrying once on transient errors.
    /// Returns the broker order id, or `None` when placement failed.
    async fn place_conditional(
        &self,
        pos: &ScaledPosition,
        size: Decimal,
        tp_trigger: Option<Decimal>,
        sl_trigger: Option<Decimal>,
        kind: &'static str,
    ) -> Option<String> {
        let spec = ConditionalOrderSpec {
            symbol: pos.symbol.clone(),
            side: pos.side,
            size,
            tp_trigger,
            sl_trigger,
        };

        let result = with_retry("place_conditional", &self.retry, || {
            self.gateway.place_conditional_order(&spec)
        })
        .await;

        match result {
            Ok(order_id) => {
                info!(
                    symbol = %pos.symbol,
                    kind = kind,
                    order_id = %order_id,
                    size = %size,
                    tp = ?tp_trigger,
                    sl = ?sl_trigger,
                    "Conditional order placed"
                );
                Some(order_id)
            }
            Err(e) => {
                warn!(
                    symbol = %pos.symbol,
                    kind = kind,
                    size = %size,
                    error = %e,
                    "Conditional order placement failed"
                );
                None
            }
        }
    }
}
