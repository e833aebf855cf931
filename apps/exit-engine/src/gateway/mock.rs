//! Scripted mock gateway for tests.
//!
//! Returns exchange state staged by the test (positions, order history,
//! pending orders, close reasons) and records every mutating call so
//! tests can assert on exactly which orders the engine placed, amended,
//! or cancelled. Failures can be scripted per operation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::models::{InstrumentSpec, Side};

use super::{
    BrokerGateway, CloseReason, ConditionalOrder, ConditionalOrderSpec, GatewayError,
    OrderLifecycle, PendingOrder, PositionSnapshot,
};

#[derive(Debug, Default)]
struct MockState {
    history: HashMap<String, Vec<ConditionalOrder>>,
    pending_conditionals: HashMap<String, Vec<ConditionalOrder>>,
    positions: HashMap<String, PositionSnapshot>,
    pending_limits: HashMap<String, PendingOrder>,
    order_history: HashMap<String, PendingOrder>,
    close_reasons: HashMap<String, CloseReason>,
    specs: HashMap<String, InstrumentSpec>,
    last_prices: HashMap<String, Decimal>,
    balance: Decimal,
    fail_cancels: u32,
    fail_amends: u32,
    fail_places: u32,
    fail_histories: u32,
    placed: Vec<(String, ConditionalOrderSpec)>,
    canceled: Vec<String>,
    amended: Vec<String>,
    entry_orders: Vec<String>,
}

/// Mock broker gateway for testing.
#[derive(Debug, Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
    order_counter: AtomicU64,
}

impl MockGateway {
    /// Create a new mock gateway with no staged state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{n}")
    }

    // ------------------------------------------------------------------
    // Test staging
    // ------------------------------------------------------------------

    /// Stage an open position.
    pub fn set_position(&self, snapshot: PositionSnapshot) {
        self.lock().positions.insert(snapshot.symbol.clone(), snapshot);
    }

    /// Remove a staged position.
    pub fn clear_position(&self, symbol: &str) {
        self.lock().positions.remove(symbol);
    }

    /// Append an entry to the conditional-order history of a symbol.
    pub fn push_history(&self, symbol: &str, order: ConditionalOrder) {
        self.lock()
            .history
            .entry(symbol.to_string())
            .or_default()
            .push(order);
    }

    /// Remove an order from the pending conditional list (e.g. after
    /// simulating its trigger).
    pub fn remove_pending_conditional(&self, symbol: &str, order_id: &str) {
        if let Some(orders) = self.lock().pending_conditionals.get_mut(symbol) {
            orders.retain(|o| o.order_id != order_id);
        }
    }

    /// Clear all pending conditional orders for a symbol.
    pub fn clear_pending_conditionals(&self, symbol: &str) {
        self.lock().pending_conditionals.remove(symbol);
    }

    /// Stage the close-reason classification for a symbol.
    pub fn set_close_reason(&self, symbol: &str, reason: CloseReason) {
        self.lock()
            .close_reasons
            .insert(symbol.to_string(), reason);
    }

    /// Stage instrument metadata.
    pub fn set_spec(&self, symbol: &str, spec: InstrumentSpec) {
        self.lock().specs.insert(symbol.to_string(), spec);
    }

    /// Stage the last traded price.
    pub fn set_last_price(&self, symbol: &str, price: Decimal) {
        self.lock().last_prices.insert(symbol.to_string(), price);
    }

    /// Stage the available balance.
    pub fn set_balance(&self, balance: Decimal) {
        self.lock().balance = balance;
    }

    /// Stage an entry order on the pending list.
    pub fn add_pending_limit(&self, order: PendingOrder) {
        self.lock()
            .pending_limits
            .insert(order.order_id.clone(), order);
    }

    /// Remove an entry order from the pending list.
    pub fn remove_pending_limit(&self, order_id: &str) {
        self.lock().pending_limits.remove(order_id);
    }

    /// Stage an entry-order history record.
    pub fn set_order_history(&self, order: PendingOrder) {
        self.lock()
            .order_history
            .insert(order.order_id.clone(), order);
    }

    /// Fail the next `n` cancel calls.
    pub fn fail_next_cancels(&self, n: u32) {
        self.lock().fail_cancels = n;
    }

    /// Fail the next `n` amend calls.
    pub fn fail_next_amends(&self, n: u32) {
        self.lock().fail_amends = n;
    }

    /// Fail the next `n` conditional placements.
    pub fn fail_next_placements(&self, n: u32) {
        self.lock().fail_places = n;
    }

    /// Fail the next `n` history queries.
    pub fn fail_next_histories(&self, n: u32) {
        self.lock().fail_histories = n;
    }

    // ------------------------------------------------------------------
    // Test inspection
    // ------------------------------------------------------------------

    /// All conditional orders placed, in order, with their assigned ids.
    #[must_use]
    pub fn placed_conditionals(&self) -> Vec<(String, ConditionalOrderSpec)> {
        self.lock().placed.clone()
    }

    /// Ids of cancelled conditional orders, in order.
    #[must_use]
    pub fn canceled_ids(&self) -> Vec<String> {
        self.lock().canceled.clone()
    }

    /// Ids of amended conditional orders, in order.
    #[must_use]
    pub fn amended_ids(&self) -> Vec<String> {
        self.lock().amended.clone()
    }

    /// Ids of entry orders placed (market and limit).
    #[must_use]
    pub fn entry_order_ids(&self) -> Vec<String> {
        self.lock().entry_orders.clone()
    }

    /// Count of conditional placements so far.
    #[must_use]
    pub fn place_count(&self) -> usize {
        self.lock().placed.len()
    }

    /// Count of cancels so far.
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        self.lock().canceled.len()
    }

    /// Currently pending conditional orders for a symbol.
    #[must_use]
    pub fn pending_conditionals_for(&self, symbol: &str) -> Vec<ConditionalOrder> {
        self.lock()
            .pending_conditionals
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerGateway for MockGateway {
    async fn place_conditional_order(
        &self,
        spec: &ConditionalOrderSpec,
    ) -> Result<String, GatewayError> {
        let order_id = self.next_id("tpsl");
        let mut st = self.lock();

        if st.fail_places > 0 {
            st.fail_places -= 1;
            return Err(GatewayError::Api {
                code: "1500".to_string(),
                message: "scripted placement failure".to_string(),
            });
        }

        st.placed.push((order_id.clone(), spec.clone()));
        st.pending_conditionals
            .entry(spec.symbol.clone())
            .or_default()
            .push(ConditionalOrder {
                order_id: order_id.clone(),
                state: OrderLifecycle::Live,
                tp_trigger: spec.tp_trigger,
                sl_trigger: spec.sl_trigger,
                updated_at: Utc::now(),
            });

        Ok(order_id)
    }

    async fn cancel_conditional_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), GatewayError> {
        let mut st = self.lock();

        if st.fail_cancels > 0 {
            st.fail_cancels -= 1;
            return Err(GatewayError::Api {
                code: "1501".to_string(),
                message: "scripted cancel failure".to_string(),
            });
        }

        st.canceled.push(order_id.to_string());
        if let Some(orders) = st.pending_conditionals.get_mut(symbol) {
            orders.retain(|o| o.order_id != order_id);
        }
        Ok(())
    }

    async fn amend_conditional_order(
        &self,
        symbol: &str,
        order_id: &str,
        new_tp: Option<Decimal>,
        new_sl: Option<Decimal>,
        _new_size: Option<Decimal>,
    ) -> Result<(), GatewayError> {
        let mut st = self.lock();

        if st.fail_amends > 0 {
            st.fail_amends -= 1;
            return Err(GatewayError::Api {
                code: "1502".to_string(),
                message: "scripted amend failure".to_string(),
            });
        }

        st.amended.push(order_id.to_string());
        if let Some(orders) = st.pending_conditionals.get_mut(symbol) {
            if let Some(order) = orders.iter_mut().find(|o| o.order_id == order_id) {
                if new_tp.is_some() {
                    order.tp_trigger = new_tp;
                }
                if new_sl.is_some() {
                    order.sl_trigger = new_sl;
                }
                order.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn conditional_order_history(
        &self,
        symbol: &str,
    ) -> Result<Vec<ConditionalOrder>, GatewayError> {
        let mut st = self.lock();
        if st.fail_histories > 0 {
            st.fail_histories -= 1;
            return Err(GatewayError::Http("scripted history failure".to_string()));
        }
        Ok(st.history.get(symbol).cloned().unwrap_or_default())
    }

    async fn pending_conditional_orders(
        &self,
        symbol: &str,
    ) -> Result<Vec<ConditionalOrder>, GatewayError> {
        Ok(self
            .lock()
            .pending_conditionals
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn open_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, GatewayError> {
        let st = self.lock();
        Ok(match symbol {
            Some(s) => st.positions.get(s).cloned().into_iter().collect(),
            None => st.positions.values().cloned().collect(),
        })
    }

    async fn pending_limit_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PendingOrder>, GatewayError> {
        let _ = symbol;
        Ok(self.lock().pending_limits.values().cloned().collect())
    }

    async fn order_history(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<Option<PendingOrder>, GatewayError> {
        Ok(self.lock().order_history.get(order_id).cloned())
    }

    async fn classify_close_reason(&self, symbol: &str) -> Result<CloseReason, GatewayError> {
        Ok(self
            .lock()
            .close_reasons
            .get(symbol)
            .copied()
            .unwrap_or(CloseReason::Unknown))
    }

    async fn instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec, GatewayError> {
        Ok(self.lock().specs.get(symbol).cloned().unwrap_or_default())
    }

    async fn place_market_order(
        &self,
        _symbol: &str,
        _side: Side,
        _size: Decimal,
        _leverage: u32,
    ) -> Result<String, GatewayError> {
        let order_id = self.next_id("ord");
        self.lock().entry_orders.push(order_id.clone());
        Ok(order_id)
    }

    async fn place_limit_order(
        &self,
        _symbol: &str,
        _side: Side,
        _size: Decimal,
        _price: Decimal,
        _leverage: u32,
    ) -> Result<String, GatewayError> {
        let order_id = self.next_id("ord");
        self.lock().entry_orders.push(order_id.clone());
        Ok(order_id)
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.lock()
            .last_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Decode(format!("no ticker staged for {symbol}")))
    }

    async fn available_balance(&self) -> Result<Decimal, GatewayError> {
        Ok(self.lock().balance)
    }

    fn gateway_name(&self) -> &'static str {
        "mock"
    }
}
