//! Owned collections of tracked positions and pending entries.
//!
//! The book is owned by the reconciliation loop and mutated only from
//! its task. Producers (the signal executor, fill event sources) hand
//! new work to the loop through the intake channel instead of touching
//! the maps directly.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::models::{ExitPlan, PendingEntry, ScaledPosition, Side};

/// A filled entry order, ready to become a tracked scaled position.
#[derive(Debug, Clone)]
pub struct FillEvent {
    /// Exchange instrument id.
    pub symbol: String,
    /// Entry side.
    pub side: Side,
    /// Filled size (contracts).
    pub size: Decimal,
    /// Fill price.
    pub price: Decimal,
    /// Exit plan to attach.
    pub plan: ExitPlan,
    /// Leverage the entry was placed with.
    pub leverage: u32,
}

/// Work handed to the reconciliation loop by external producers.
#[derive(Debug)]
pub enum Intake {
    /// An entry order filled; open a scaled position and attach TPSL.
    Fill(FillEvent),
    /// A resting limit entry to watch for fills.
    PendingEntry(PendingEntry),
}

/// Sender half of the intake channel.
#[derive(Debug, Clone)]
pub struct IntakeSender(mpsc::UnboundedSender<Intake>);

impl IntakeSender {
    /// Hand a fill event to the loop. Returns `false` if the loop is gone.
    pub fn submit_fill(&self, fill: FillEvent) -> bool {
        self.0.send(Intake::Fill(fill)).is_ok()
    }

    /// Hand a pending limit entry to the loop.
    pub fn submit_pending_entry(&self, entry: PendingEntry) -> bool {
        self.0.send(Intake::PendingEntry(entry)).is_ok()
    }
}

/// Create the intake channel pair.
#[must_use]
pub fn intake_channel() -> (IntakeSender, mpsc::UnboundedReceiver<Intake>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (IntakeSender(tx), rx)
}

/// The live working set: scaled positions keyed by symbol, plus pending
/// limit entries keyed by broker order id.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<String, ScaledPosition>,
    pending_entries: HashMap<String, PendingEntry>,
}

impl PositionBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the position set (startup restore).
    pub fn restore(&mut self, positions: HashMap<String, ScaledPosition>) {
        self.positions = positions;
    }

    /// Track a position. An existing entry for the symbol is replaced.
    pub fn insert(&mut self, position: ScaledPosition) {
        self.positions.insert(position.symbol.clone(), position);
    }

    /// Remove a position from tracking.
    pub fn remove(&mut self, symbol: &str) -> Option<ScaledPosition> {
        self.positions.remove(symbol)
    }

    /// Take a position out for one processing pass. The caller reinserts
    /// it unless the position was evicted.
    pub fn take(&mut self, symbol: &str) -> Option<ScaledPosition> {
        self.positions.remove(symbol)
    }

    /// Symbols with a live position, in stable order.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Number of tracked positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether no positions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Read access to the position map (persistence snapshots).
    #[must_use]
    pub const fn positions(&self) -> &HashMap<String, ScaledPosition> {
        &self.positions
    }

    /// Track a pending limit entry.
    pub fn insert_pending_entry(&mut self, entry: PendingEntry) {
        self.pending_entries.insert(entry.order_id.clone(), entry);
    }

    /// Remove a pending entry from tracking.
    pub fn remove_pending_entry(&mut self, order_id: &str) -> Option<PendingEntry> {
        self.pending_entries.remove(order_id)
    }

    /// Order ids of tracked pending entries, in stable order.
    #[must_use]
    pub fn pending_entry_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending_entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Read access to one pending entry.
    #[must_use]
    pub fn pending_entry(&self, order_id: &str) -> Option<&PendingEntry> {
        self.pending_entries.get(order_id)
    }

    /// Mutable access to one pending entry.
    #[must_use]
    pub fn pending_entry_mut(&mut self, order_id: &str) -> Option<&mut PendingEntry> {
        self.pending_entries.get_mut(order_id)
    }

    /// Number of tracked pending entries.
    #[must_use]
    pub fn pending_entry_count(&self) -> usize {
        self.pending_entries.len()
    }
}
