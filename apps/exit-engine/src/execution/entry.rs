//! Signal execution: turning a trade signal into an entry order.
//!
//! Validates the signal, sizes the position from the account balance,
//! rounds everything to exchange steps, and places either a market or a
//! limit entry ("smart entry": market when the live price has already
//! crossed the requested entry). Fills and resting orders are handed to
//! the reconciliation loop over the intake channel; this path never
//! touches the position book directly.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::gateway::{BrokerGateway, GatewayError};
use crate::models::{ExitPlan, PendingEntry, Side, TradeSignal};
use crate::sizing::{contract_volume, filter_plan_levels, round_to_tick};

use super::book::{FillEvent, IntakeSender};

/// Errors from signal execution.
#[derive(Debug, Error)]
pub enum EntryError {
    /// The signal has no stop-loss level.
    #[error("signal for {0} has no stop-loss")]
    MissingStopLoss(String),

    /// The signal has no TP1 level (required for the scaled strategy).
    #[error("signal for {0} has no TP1, required for scaled exits")]
    MissingTakeProfit(String),

    /// TP1 or the stop sits on the wrong side of the effective entry.
    #[error("signal for {symbol} rejected: {detail}")]
    LevelsInvalid {
        /// Instrument the signal targeted.
        symbol: String,
        /// Which level failed and why.
        detail: String,
    },

    /// The account has no available margin.
    #[error("no available balance to open {0}")]
    NoBalance(String),

    /// The reconciliation loop is gone; nothing can track the order.
    #[error("intake channel closed, cannot track orders")]
    IntakeClosed,

    /// Broker call failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// How the entry was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryReceipt {
    /// Market order; the position opens immediately.
    Market {
        /// Broker order id of the entry order.
        order_id: String,
    },
    /// Limit order resting at the requested entry, tracked until filled.
    Limit {
        /// Broker order id of the entry order.
        order_id: String,
    },
}

/// Executes trade signals against the gateway.
pub struct EntryExecutor<G> {
    gateway: Arc<G>,
    intake: IntakeSender,
}

impl<G: BrokerGateway> EntryExecutor<G> {
    /// Create an executor that hands tracked work to the given intake.
    #[must_use]
    pub fn new(gateway: Arc<G>, intake: IntakeSender) -> Self {
        Self { gateway, intake }
    }

    /// Execute one trade signal.
    ///
    /// # Errors
    ///
    /// Returns an error when the signal is invalid, the account has no
    /// margin, or the broker rejects the order. Rejections are expected
    /// operator-visible outcomes, not faults.
    pub async fn execute(&self, signal: &TradeSignal) -> Result<EntryReceipt, EntryError> {
        let symbol = signal.symbol.clone();

        let sl = signal
            .sl
            .ok_or_else(|| EntryError::MissingStopLoss(symbol.clone()))?;
        let tp1 = signal
            .tp1()
            .ok_or_else(|| EntryError::MissingTakeProfit(symbol.clone()))?;

        let spec = self.gateway.instrument_spec(&symbol).await?;
        let balance = self.gateway.available_balance().await?;
        if balance <= Decimal::ZERO {
            return Err(EntryError::NoBalance(symbol));
        }

        let entry_price = round_to_tick(signal.entry, spec.tick_size);
        let plan = ExitPlan {
            tp1: round_to_tick(tp1, spec.tick_size),
            tp2: signal.tp2().map(|p| round_to_tick(p, spec.tick_size)),
            tp3: signal.tp3().map(|p| round_to_tick(p, spec.tick_size)),
            sl: round_to_tick(sl, spec.tick_size),
        };

        let size = contract_volume(
            balance,
            signal.equity_pct,
            signal.leverage,
            entry_price,
            &spec,
        );

        let last = self.gateway.last_price(&symbol).await?;

        // Smart entry: if the market already trades through the requested
        // entry, a resting limit would either fill instantly or chase.
        let use_market = match signal.side {
            Side::Buy => last <= entry_price,
            Side::Sell => last >= entry_price,
        };
        let effective_entry = if use_market { last } else { entry_price };

        let plan = Self::validate_levels(&symbol, signal.side, effective_entry, &plan)?;

        info!(
            symbol = %symbol,
            side = %signal.side,
            balance = %balance,
            equity_pct = %signal.equity_pct,
            leverage = signal.leverage,
            size = %size,
            entry = %effective_entry,
            market = use_market,
            "Executing trade signal"
        );

        if use_market {
            let order_id = self
                .gateway
                .place_market_order(&symbol, signal.side, size, signal.leverage)
                .await?;

            let delivered = self.intake.submit_fill(FillEvent {
                symbol: symbol.clone(),
                side: signal.side,
                size,
                price: last,
                plan,
                leverage: signal.leverage,
            });
            if !delivered {
                return Err(EntryError::IntakeClosed);
            }

            info!(symbol = %symbol, order_id = %order_id, "Market entry placed");
            Ok(EntryReceipt::Market { order_id })
        } else {
            let order_id = self
                .gateway
                .place_limit_order(&symbol, signal.side, size, entry_price, signal.leverage)
                .await?;

            let delivered = self.intake.submit_pending_entry(PendingEntry {
                order_id: order_id.clone(),
                symbol: symbol.clone(),
                side: signal.side,
                size,
                entry_price,
                leverage: signal.leverage,
                plan,
                misses: 0,
            });
            if !delivered {
                return Err(EntryError::IntakeClosed);
            }

            info!(
                symbol = %symbol,
                order_id = %order_id,
                entry = %entry_price,
                "Limit entry placed, waiting for fill"
            );
            Ok(EntryReceipt::Limit { order_id })
        }
    }

    /// Drop plan levels on the wrong side of the effective entry and
    /// reject the signal outright when TP1 or the stop is lost.
    fn validate_levels(
        symbol: &str,
        side: Side,
        effective_entry: Decimal,
        plan: &ExitPlan,
    ) -> Result<ExitPlan, EntryError> {
        let (tp1, tp2, tp3, sl) = filter_plan_levels(side, effective_entry, plan);

        let tp1 = tp1.ok_or_else(|| EntryError::LevelsInvalid {
            symbol: symbol.to_string(),
            detail: format!(
                "TP1 {} is on the wrong side of entry {effective_entry}",
                plan.tp1
            ),
        })?;
        let sl = sl.ok_or_else(|| EntryError::LevelsInvalid {
            symbol: symbol.to_string(),
            detail: format!(
                "stop {} is on the wrong side of entry {effective_entry}",
                plan.sl
            ),
        })?;

        if tp2.is_none() && plan.tp2.is_some() {
            warn!(symbol = %symbol, "TP2 dropped: wrong side of entry");
        }
        if tp3.is_none() && plan.tp3.is_some() {
            warn!(symbol = %symbol, "TP3 dropped: wrong side of entry");
        }

        Ok(ExitPlan { tp1, tp2, tp3, sl })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::book::{Intake, intake_channel};
    use crate::gateway::MockGateway;
    use crate::models::InstrumentSpec;
    use rust_decimal_macros::dec;

    fn signal() -> TradeSignal {
        TradeSignal {
            symbol: "BTC-USDT".to_string(),
            side: Side::Buy,
            equity_pct: dec!(10),
            entry: dec!(100),
            leverage: 20,
            tps: vec![dec!(101), dec!(102), dec!(103)],
            sl: Some(dec!(99)),
        }
    }

    fn stage_market(gateway: &MockGateway, last: Decimal) {
        gateway.set_spec("BTC-USDT", InstrumentSpec::default());
        gateway.set_balance(dec!(1000));
        gateway.set_last_price("BTC-USDT", last);
    }

    #[tokio::test]
    async fn test_market_entry_when_price_through_entry() {
        let gateway = Arc::new(MockGateway::new());
        stage_market(&gateway, dec!(99.5)); // long and price below entry
        let (tx, mut rx) = intake_channel();
        let executor = EntryExecutor::new(Arc::clone(&gateway), tx);

        let receipt = executor.execute(&signal()).await.expect("entry");
        assert!(matches!(receipt, EntryReceipt::Market { .. }));

        match rx.try_recv() {
            Ok(Intake::Fill(fill)) => {
                assert_eq!(fill.symbol, "BTC-USDT");
                assert_eq!(fill.price, dec!(99.5));
                // 1000 * 10% * 20 = 2000 notional at ~100/contract.
                assert_eq!(fill.size, dec!(20));
            }
            other => panic!("expected fill intake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_limit_entry_when_price_above_entry() {
        let gateway = Arc::new(MockGateway::new());
        stage_market(&gateway, dec!(100.5)); // long, market still above entry
        let (tx, mut rx) = intake_channel();
        let executor = EntryExecutor::new(Arc::clone(&gateway), tx);

        let receipt = executor.execute(&signal()).await.expect("entry");
        let EntryReceipt::Limit { order_id } = receipt else {
            panic!("expected limit receipt");
        };

        match rx.try_recv() {
            Ok(Intake::PendingEntry(entry)) => {
                assert_eq!(entry.order_id, order_id);
                assert_eq!(entry.entry_price, dec!(100));
                assert_eq!(entry.plan.tp1, dec!(101));
            }
            other => panic!("expected pending entry intake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_signal_without_sl_rejected() {
        let gateway = Arc::new(MockGateway::new());
        let (tx, _rx) = intake_channel();
        let executor = EntryExecutor::new(Arc::clone(&gateway), tx);

        let mut s = signal();
        s.sl = None;
        let err = executor.execute(&s).await.unwrap_err();
        assert!(matches!(err, EntryError::MissingStopLoss(_)));
    }

    #[tokio::test]
    async fn test_signal_without_tp1_rejected() {
        let gateway = Arc::new(MockGateway::new());
        let (tx, _rx) = intake_channel();
        let executor = EntryExecutor::new(Arc::clone(&gateway), tx);

        let mut s = signal();
        s.tps.clear();
        let err = executor.execute(&s).await.unwrap_err();
        assert!(matches!(err, EntryError::MissingTakeProfit(_)));
    }

    #[tokio::test]
    async fn test_inverted_stop_rejected() {
        let gateway = Arc::new(MockGateway::new());
        stage_market(&gateway, dec!(99.5));
        let (tx, _rx) = intake_channel();
        let executor = EntryExecutor::new(Arc::clone(&gateway), tx);

        let mut s = signal();
        s.sl = Some(dec!(105)); // stop above entry on a long
        let err = executor.execute(&s).await.unwrap_err();
        assert!(matches!(err, EntryError::LevelsInvalid { .. }));
    }

    #[tokio::test]
    async fn test_zero_balance_rejected() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_spec("BTC-USDT", InstrumentSpec::default());
        gateway.set_balance(Decimal::ZERO);
        gateway.set_last_price("BTC-USDT", dec!(100));
        let (tx, _rx) = intake_channel();
        let executor = EntryExecutor::new(Arc::clone(&gateway), tx);

        let err = executor.execute(&signal()).await.unwrap_err();
        assert!(matches!(err, EntryError::NoBalance(_)));
    }

    #[tokio::test]
    async fn test_wrong_side_tp2_dropped_but_trade_proceeds() {
        let gateway = Arc::new(MockGateway::new());
        stage_market(&gateway, dec!(99.5));
        let (tx, mut rx) = intake_channel();
        let executor = EntryExecutor::new(Arc::clone(&gateway), tx);

        let mut s = signal();
        s.tps = vec![dec!(101), dec!(98), dec!(103)]; // TP2 below entry
        executor.execute(&s).await.expect("entry");

        match rx.try_recv() {
            Ok(Intake::Fill(fill)) => {
                assert_eq!(fill.plan.tp1, dec!(101));
                assert!(fill.plan.tp2.is_none());
                assert_eq!(fill.plan.tp3, Some(dec!(103)));
            }
            other => panic!("expected fill intake, got {other:?}"),
        }
    }
}
