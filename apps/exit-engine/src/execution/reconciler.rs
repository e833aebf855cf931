//! The reconciliation loop.
//!
//! A single periodic task that polls authoritative exchange state and
//! drives the scaled-exit state machine. Executed TP/SL triggers are
//! detected in conditional-order history; position closure is debounced
//! against transient API inconsistency before eviction. Pending limit
//! entries are watched for fills on the same cadence. The loop owns the
//! position book; producers reach it only through the intake channel.
//!
//! The loop never terminates on error. A cycle that hit a failure
//! sleeps the longer error backoff before the next attempt, and a
//! failure while processing one symbol never prevents the others from
//! being processed in the same cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ReconciliationConfig;
use crate::gateway::{
    BrokerGateway, CloseReason, ConditionalOrder, GatewayError, OrderLifecycle,
};
use crate::models::{InstrumentSpec, PendingEntry, ScaledPosition};

use super::book::{FillEvent, Intake, PositionBook};
use super::persistence::StateStore;
use super::scaled::{ExitTrigger, ScaledExitMachine};

/// What to do with a position after one reconciliation pass.
enum Disposition {
    /// Keep tracking.
    Keep,
    /// Remove from the working set.
    Evict(&'static str),
}

/// Outcome of checking one pending limit entry.
enum EntryOutcome {
    StillOpen,
    Filled(Decimal, Option<Decimal>),
    Cancelled,
    StaleState,
    Missing,
}

/// The reconciliation loop.
pub struct Reconciler<G: BrokerGateway> {
    config: ReconciliationConfig,
    gateway: Arc<G>,
    machine: ScaledExitMachine<G>,
    store: StateStore,
    book: PositionBook,
    intake: mpsc::UnboundedReceiver<Intake>,
    specs: HashMap<String, InstrumentSpec>,
    shutdown: watch::Receiver<bool>,
}

impl<G: BrokerGateway> Reconciler<G> {
    /// Create a reconciler. Call [`Self::restore`] before [`Self::run`]
    /// to resume positions from a previous session.
    #[must_use]
    pub fn new(
        config: ReconciliationConfig,
        gateway: Arc<G>,
        store: StateStore,
        intake: mpsc::UnboundedReceiver<Intake>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let machine = ScaledExitMachine::new(Arc::clone(&gateway));
        Self {
            config,
            gateway,
            machine,
            store,
            book: PositionBook::new(),
            intake,
            specs: HashMap::new(),
            shutdown,
        }
    }

    /// Reload the working set from the persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be parsed;
    /// the operator must resolve this rather than trade blind.
    pub fn restore(&mut self) -> Result<usize, super::persistence::PersistenceError> {
        let positions = self.store.load()?;
        for pos in positions.values() {
            info!(
                symbol = %pos.symbol,
                stage = %pos.stage(),
                remaining = %pos.remaining_size,
                "Restored position from snapshot"
            );
        }
        let count = positions.len();
        self.book.restore(positions);
        Ok(count)
    }

    /// Number of tracked positions.
    #[must_use]
    pub fn position_count(&self) -> usize {
        self.book.len()
    }

    /// Number of tracked pending limit entries.
    #[must_use]
    pub fn pending_entry_count(&self) -> usize {
        self.book.pending_entry_count()
    }

    /// Tracked position lookup (observability surface).
    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&ScaledPosition> {
        self.book.positions().get(symbol)
    }

    /// Run the loop until shutdown is signalled. An in-flight cycle is
    /// always allowed to finish.
    pub async fn run(mut self) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            gateway = self.gateway.gateway_name(),
            "Reconciliation loop started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let clean = self.tick().await;

            let sleep_secs = if clean {
                self.config.poll_interval_secs
            } else {
                self.config.error_backoff_secs
            };

            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
                changed = self.shutdown.changed() => {
                    // A dropped sender means the host is going away.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation loop stopped");
    }

    /// One reconciliation cycle. Idempotent: with no new exchange events
    /// it places and cancels nothing. Returns whether the cycle was clean.
    pub async fn tick(&mut self) -> bool {
        let mut clean = true;

        self.drain_intake().await;

        if !self.monitor_pending_entries().await {
            clean = false;
        }

        for symbol in self.book.symbols() {
            if let Err(e) = self.process_position(&symbol).await {
                warn!(
                    symbol = %symbol,
                    error = %e,
                    "Position reconciliation failed, continuing with next symbol"
                );
                clean = false;
            }
        }

        clean
    }

    /// Accept work handed over by producers.
    async fn drain_intake(&mut self) {
        while let Ok(intake) = self.intake.try_recv() {
            match intake {
                Intake::Fill(fill) => {
                    let spec = self.spec_for(&fill.symbol).await;
                    let pos = self.machine.open_position(&fill, &spec).await;
                    self.book.insert(pos);
                    self.persist();
                }
                Intake::PendingEntry(entry) => {
                    info!(
                        symbol = %entry.symbol,
                        order_id = %entry.order_id,
                        entry = %entry.entry_price,
                        "Tracking pending limit entry"
                    );
                    self.book.insert_pending_entry(entry);
                }
            }
        }
    }

    /// Process one tracked position: apply observed triggers, refresh
    /// telemetry, and confirm closure. The position is taken out of the
    /// book for the duration of the pass and reinserted unless evicted.
    async fn process_position(&mut self, symbol: &str) -> Result<(), GatewayError> {
        let Some(mut pos) = self.book.take(symbol) else {
            return Ok(());
        };

        if pos.is_closed() {
            // Left behind by an earlier pass; evict without touching the exchange.
            info!(symbol = %symbol, stage = %pos.stage(), "Evicting closed position");
            self.persist();
            return Ok(());
        }

        let spec = self.spec_for(symbol).await;

        match self.reconcile_one(&mut pos, &spec).await {
            Ok(Disposition::Keep) => {
                self.book.insert(pos);
                Ok(())
            }
            Ok(Disposition::Evict(reason)) => {
                info!(
                    symbol = %symbol,
                    stage = %pos.stage(),
                    reason = reason,
                    "Position evicted"
                );
                self.persist();
                Ok(())
            }
            Err(e) => {
                // Keep tracking; the next cycle retries from exchange truth.
                self.book.insert(pos);
                Err(e)
            }
        }
    }

    async fn reconcile_one(
        &mut self,
        pos: &mut ScaledPosition,
        spec: &InstrumentSpec,
    ) -> Result<Disposition, GatewayError> {
        // Step 1: detect executed triggers in conditional-order history.
        // A fast double-trigger (TP1 and TP2 reported in the same fetch)
        // must apply oldest first to preserve stage ordering.
        let history = self.gateway.conditional_order_history(&pos.symbol).await?;
        let mut triggers = Self::match_triggers(pos, &history);
        triggers.sort_by_key(|(_, at)| *at);

        for (trigger, _) in triggers {
            if Self::already_applied(pos, trigger) {
                continue;
            }
            self.machine.apply(pos, trigger, spec).await;
            self.persist_including(pos);

            if pos.is_closed() {
                return Ok(Disposition::Evict("terminal trigger observed"));
            }
        }

        // Step 2: a live position is only evidence the position is open.
        let open = self.gateway.open_positions(Some(&pos.symbol)).await?;
        if let Some(snapshot) = open.first() {
            pos.unrealized_pnl = snapshot.unrealized_pnl;
            pos.mark_price = snapshot.mark_price;
            pos.close_checks = 0;
            return Ok(Disposition::Keep);
        }

        // Step 3: conditional orders may outlive the position report on a
        // different eventual-consistency timeline. Still open.
        let pending = self.gateway.pending_conditional_orders(&pos.symbol).await?;
        if !pending.is_empty() {
            pos.close_checks = 0;
            return Ok(Disposition::Keep);
        }

        // Step 4: nothing visible. Debounce before trusting it.
        pos.close_checks += 1;
        if pos.close_checks < self.config.close_confirm_cycles {
            debug!(
                symbol = %pos.symbol,
                checks = pos.close_checks,
                needed = self.config.close_confirm_cycles,
                "Position not visible, awaiting close confirmation"
            );
            return Ok(Disposition::Keep);
        }

        let reason = self.gateway.classify_close_reason(&pos.symbol).await?;
        match reason {
            CloseReason::TakeProfit => {
                self.machine.apply(pos, ExitTrigger::Tp3, spec).await;
                self.persist_including(pos);
                Ok(Disposition::Evict("vanished, classified as take-profit"))
            }
            CloseReason::StopLoss => {
                self.machine.apply(pos, ExitTrigger::StopLoss, spec).await;
                self.persist_including(pos);
                Ok(Disposition::Evict("vanished, classified as stop-loss"))
            }
            other => {
                warn!(
                    symbol = %pos.symbol,
                    stage = %pos.stage(),
                    reason = %other,
                    "Position closed outside the engine, evicting unresolved"
                );
                Ok(Disposition::Evict("unresolved manual close"))
            }
        }
    }

    /// Map executed history entries onto this position's pending triggers.
    fn match_triggers(
        pos: &ScaledPosition,
        history: &[ConditionalOrder],
    ) -> Vec<(ExitTrigger, DateTime<Utc>)> {
        let mut triggers = Vec::new();

        for order in history {
            if !order.state.is_triggered() {
                continue;
            }
            let id = Some(order.order_id.as_str());

            if pos.tp1_order_id.as_deref() == id && !pos.tp1_hit {
                triggers.push((ExitTrigger::Tp1, order.updated_at));
            } else if pos.tp2_order_id.as_deref() == id && !pos.tp2_hit {
                triggers.push((ExitTrigger::Tp2, order.updated_at));
            } else if pos.tp3_order_id.as_deref() == id && !pos.tp3_hit {
                triggers.push((ExitTrigger::Tp3, order.updated_at));
            } else if pos.sl_order_id.as_deref() == id && !pos.sl_hit {
                triggers.push((ExitTrigger::StopLoss, order.updated_at));
            }
        }

        triggers
    }

    const fn already_applied(pos: &ScaledPosition, trigger: ExitTrigger) -> bool {
        match trigger {
            ExitTrigger::Tp1 => pos.tp1_hit,
            ExitTrigger::Tp2 => pos.tp2_hit,
            ExitTrigger::Tp3 => pos.tp3_hit,
            ExitTrigger::StopLoss => pos.sl_hit,
        }
    }

    /// Check tracked limit entries for fills, cancellations, and orders
    /// that vanished from the exchange's books.
    async fn monitor_pending_entries(&mut self) -> bool {
        if self.book.pending_entry_count() == 0 {
            return true;
        }

        let pending = match self.gateway.pending_limit_orders(None).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "Pending order query failed, skipping entry checks");
                return false;
            }
        };
        let by_id: HashMap<&str, &crate::gateway::PendingOrder> =
            pending.iter().map(|o| (o.order_id.as_str(), o)).collect();

        let mut clean = true;

        for order_id in self.book.pending_entry_ids() {
            let Some(entry) = self.book.pending_entry(&order_id).cloned() else {
                continue;
            };

            let outcome = if let Some(order) = by_id.get(order_id.as_str()) {
                match order.state {
                    OrderLifecycle::Filled if order.filled_size > Decimal::ZERO => {
                        EntryOutcome::Filled(order.filled_size, order.avg_price)
                    }
                    _ => EntryOutcome::StillOpen,
                }
            } else {
                match self.gateway.order_history(&entry.symbol, &order_id).await {
                    Ok(Some(record)) => match record.state {
                        OrderLifecycle::Filled if record.filled_size > Decimal::ZERO => {
                            EntryOutcome::Filled(record.filled_size, record.avg_price)
                        }
                        OrderLifecycle::Canceled => EntryOutcome::Cancelled,
                        _ => EntryOutcome::StaleState,
                    },
                    Ok(None) => EntryOutcome::Missing,
                    Err(e) => {
                        warn!(
                            symbol = %entry.symbol,
                            order_id = %order_id,
                            error = %e,
                            "Order history lookup failed"
                        );
                        clean = false;
                        continue;
                    }
                }
            };

            match outcome {
                EntryOutcome::StillOpen => {
                    if let Some(e) = self.book.pending_entry_mut(&order_id) {
                        e.misses = 0;
                    }
                }
                EntryOutcome::Filled(filled_size, avg_price) => {
                    self.book.remove_pending_entry(&order_id);
                    let fill_price = avg_price.unwrap_or(entry.entry_price);
                    info!(
                        symbol = %entry.symbol,
                        order_id = %order_id,
                        size = %filled_size,
                        price = %fill_price,
                        "Limit entry filled"
                    );
                    self.open_from_entry(&entry, filled_size, fill_price).await;
                }
                EntryOutcome::Cancelled => {
                    self.book.remove_pending_entry(&order_id);
                    info!(
                        symbol = %entry.symbol,
                        order_id = %order_id,
                        "Limit entry cancelled, dropping"
                    );
                }
                EntryOutcome::StaleState => {
                    self.bump_entry_misses(&order_id, &entry, false).await;
                }
                EntryOutcome::Missing => {
                    self.bump_entry_misses(&order_id, &entry, true).await;
                }
            }
        }

        clean
    }

    /// Count a cycle in which the entry order was not usable. After the
    /// configured number of misses the order is dropped, or, when it
    /// vanished from history entirely, assumed filled at its requested
    /// price and size. The assumed fill is a known false-fill risk (a
    /// cancelled order that also fell out of history looks identical),
    /// so it is logged loudly rather than silently adopted.
    async fn bump_entry_misses(&mut self, order_id: &str, entry: &PendingEntry, vanished: bool) {
        let misses = match self.book.pending_entry_mut(order_id) {
            Some(e) => {
                e.misses += 1;
                e.misses
            }
            None => return,
        };

        if misses < self.config.entry_miss_cycles {
            return;
        }

        self.book.remove_pending_entry(order_id);

        if vanished {
            warn!(
                symbol = %entry.symbol,
                order_id = %order_id,
                misses = misses,
                assumed_fill = true,
                size = %entry.size,
                price = %entry.entry_price,
                "Entry order vanished from pending list and history, assuming filled"
            );
            self.open_from_entry(entry, entry.size, entry.entry_price)
                .await;
        } else {
            warn!(
                symbol = %entry.symbol,
                order_id = %order_id,
                misses = misses,
                "Entry order stuck in a non-terminal history state, dropping"
            );
        }
    }

    /// Open a scaled position from a (real or assumed) entry fill.
    async fn open_from_entry(&mut self, entry: &PendingEntry, size: Decimal, price: Decimal) {
        let spec = self.spec_for(&entry.symbol).await;
        let fill = FillEvent {
            symbol: entry.symbol.clone(),
            side: entry.side,
            size,
            price,
            plan: entry.plan.clone(),
            leverage: entry.leverage,
        };
        let pos = self.machine.open_position(&fill, &spec).await;
        self.book.insert(pos);
        self.persist();
    }

    /// Instrument metadata, cached per symbol. A failed lookup falls back
    /// to whole-contract defaults rather than stalling the cycle.
    async fn spec_for(&mut self, symbol: &str) -> InstrumentSpec {
        if let Some(spec) = self.specs.get(symbol) {
            return spec.clone();
        }

        match self.gateway.instrument_spec(symbol).await {
            Ok(spec) => {
                debug!(symbol = %symbol, lot_size = %spec.lot_size, "Instrument spec cached");
                self.specs.insert(symbol.to_string(), spec.clone());
                spec
            }
            Err(e) => {
                warn!(
                    symbol = %symbol,
                    error = %e,
                    "Instrument spec lookup failed, using whole-contract defaults"
                );
                InstrumentSpec::default()
            }
        }
    }

    /// Write-through snapshot of the book as-is.
    fn persist(&self) {
        if let Err(e) = self.store.save(self.book.positions()) {
            warn!(
                error = %e,
                "State persistence failed; in-memory state remains authoritative \
                 but a crash would lose recent transitions"
            );
        }
    }

    /// Write-through snapshot including a position currently taken out of
    /// the book for processing.
    fn persist_including(&self, pos: &ScaledPosition) {
        let mut snapshot = self.book.positions().clone();
        snapshot.insert(pos.symbol.clone(), pos.clone());
        if let Err(e) = self.store.save(&snapshot) {
            warn!(
                error = %e,
                symbol = %pos.symbol,
                "State persistence failed; in-memory state remains authoritative \
                 but a crash would lose recent transitions"
            );
        }
    }
}
