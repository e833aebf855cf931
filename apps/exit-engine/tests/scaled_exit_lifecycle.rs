//! End-to-end lifecycle tests: the reconciliation loop driving the
//! scaled-exit state machine against a scripted exchange.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;

use exit_engine::config::ReconciliationConfig;
use exit_engine::execution::{FillEvent, IntakeSender, Reconciler, StateStore, intake_channel};
use exit_engine::gateway::{
    CloseReason, ConditionalOrder, MockGateway, OrderLifecycle, PositionSnapshot,
};
use exit_engine::models::{ExitPlan, Side};

struct Harness {
    gateway: Arc<MockGateway>,
    reconciler: Reconciler<MockGateway>,
    intake: IntakeSender,
    state_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let gateway = Arc::new(MockGateway::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let state_path = dir.path().join("positions.json");
    let (intake, rx) = intake_channel();
    let (_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        ReconciliationConfig::default(),
        Arc::clone(&gateway),
        StateStore::new(state_path.clone()),
        rx,
        shutdown_rx,
    );

    Harness {
        gateway,
        reconciler,
        intake,
        state_path,
        _dir: dir,
    }
}

fn plan() -> ExitPlan {
    ExitPlan {
        tp1: dec!(101),
        tp2: Some(dec!(102)),
        tp3: Some(dec!(103)),
        sl: dec!(99),
    }
}

fn fill(size: Decimal) -> FillEvent {
    FillEvent {
        symbol: "BTC-USDT".to_string(),
        side: Side::Buy,
        size,
        price: dec!(100),
        plan: plan(),
        leverage: 20,
    }
}

fn stage_open_position(gateway: &MockGateway, size: Decimal) {
    gateway.set_position(PositionSnapshot {
        symbol: "BTC-USDT".to_string(),
        size,
        unrealized_pnl: Decimal::ZERO,
        mark_price: dec!(100),
    });
}

/// Mark a conditional order as executed: move it from the pending list
/// into history with a triggered state at the given (test) time.
fn trigger_order(gateway: &MockGateway, order_id: &str, at_secs: i64) {
    let order = gateway
        .pending_conditionals_for("BTC-USDT")
        .into_iter()
        .find(|o| o.order_id == order_id)
        .unwrap_or(ConditionalOrder {
            order_id: order_id.to_string(),
            state: OrderLifecycle::Live,
            tp_trigger: None,
            sl_trigger: None,
            updated_at: Utc::now(),
        });

    gateway.push_history(
        "BTC-USDT",
        ConditionalOrder {
            state: OrderLifecycle::Triggered,
            updated_at: Utc.timestamp_opt(at_secs, 0).single().expect("valid ts"),
            ..order
        },
    );
    gateway.remove_pending_conditional("BTC-USDT", order_id);
}

#[tokio::test]
async fn test_full_happy_path() {
    let mut h = harness();

    // Fill: 100 contracts at 100.
    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    let pos = h.reconciler.position("BTC-USDT").expect("tracked");
    let tp1_id = pos.tp1_order_id.clone().expect("tp1 live");
    let sl_id = pos.sl_order_id.clone().expect("sl live");
    assert_eq!(pos.remaining_size, dec!(100));

    // TP1 triggers: 50 contracts closed.
    trigger_order(&h.gateway, &tp1_id, 1_000);
    stage_open_position(&h.gateway, dec!(50));
    h.reconciler.tick().await;

    let pos = h.reconciler.position("BTC-USDT").expect("tracked");
    assert!(pos.tp1_hit);
    assert_eq!(pos.remaining_size, dec!(50));
    let sl2_id = pos.sl_order_id.clone().expect("replacement sl");
    assert_ne!(sl2_id, sl_id, "stop must have been replaced");
    let tp2_id = pos.tp2_order_id.clone().expect("tp2 armed");

    // The replacement stop: unchanged trigger, resized to the remainder.
    let placed = h.gateway.placed_conditionals();
    let (_, sl2_spec) = placed.iter().find(|(id, _)| *id == sl2_id).expect("sl2");
    assert_eq!(sl2_spec.sl_trigger, Some(dec!(99)));
    assert_eq!(sl2_spec.size, dec!(50));
    let (_, tp2_spec) = placed.iter().find(|(id, _)| *id == tp2_id).expect("tp2");
    assert_eq!(tp2_spec.tp_trigger, Some(dec!(102)));
    assert_eq!(tp2_spec.size, dec!(25));

    // TP2 triggers: stop relocates to breakeven, TP3 armed.
    trigger_order(&h.gateway, &tp2_id, 2_000);
    stage_open_position(&h.gateway, dec!(25));
    h.reconciler.tick().await;

    let pos = h.reconciler.position("BTC-USDT").expect("tracked");
    assert!(pos.tp2_hit);
    assert_eq!(pos.remaining_size, dec!(25));
    let tp3_id = pos.tp3_order_id.clone().expect("tp3 armed");
    let sl3_id = pos.sl_order_id.clone().expect("sl live");

    // Breakeven relocation went through the amend path: same order id,
    // trigger now at the entry price.
    assert_eq!(sl3_id, sl2_id);
    let pending = h.gateway.pending_conditionals_for("BTC-USDT");
    let sl = pending.iter().find(|o| o.order_id == sl3_id).expect("sl");
    assert_eq!(sl.sl_trigger, Some(dec!(100)));

    let placed = h.gateway.placed_conditionals();
    let (_, tp3_spec) = placed.iter().find(|(id, _)| *id == tp3_id).expect("tp3");
    assert_eq!(tp3_spec.tp_trigger, Some(dec!(103)));
    assert_eq!(tp3_spec.size, dec!(25));

    // TP3 triggers: fully closed, evicted, snapshot cleared.
    trigger_order(&h.gateway, &tp3_id, 3_000);
    h.gateway.clear_position("BTC-USDT");
    h.gateway.clear_pending_conditionals("BTC-USDT");
    h.reconciler.tick().await;

    assert!(h.reconciler.position("BTC-USDT").is_none());
    let snapshot = StateStore::new(h.state_path.clone()).load().expect("load");
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn test_stop_loss_after_tp1() {
    let mut h = harness();

    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    let pos = h.reconciler.position("BTC-USDT").expect("tracked");
    let tp1_id = pos.tp1_order_id.clone().expect("tp1");

    trigger_order(&h.gateway, &tp1_id, 1_000);
    stage_open_position(&h.gateway, dec!(50));
    h.reconciler.tick().await;

    let pos = h.reconciler.position("BTC-USDT").expect("tracked");
    let sl_id = pos.sl_order_id.clone().expect("sl live");
    let placements_before = h.gateway.place_count();

    // The resized stop fires.
    trigger_order(&h.gateway, &sl_id, 2_000);
    h.gateway.clear_position("BTC-USDT");
    h.gateway.clear_pending_conditionals("BTC-USDT");
    h.reconciler.tick().await;

    // Terminal: evicted, and no follow-up orders were placed.
    assert!(h.reconciler.position("BTC-USDT").is_none());
    assert_eq!(h.gateway.place_count(), placements_before);
    let snapshot = StateStore::new(h.state_path.clone()).load().expect("load");
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn test_tick_is_idempotent_without_new_events() {
    let mut h = harness();

    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    let tp1_id = h
        .reconciler
        .position("BTC-USDT")
        .and_then(|p| p.tp1_order_id.clone())
        .expect("tp1");
    trigger_order(&h.gateway, &tp1_id, 1_000);
    stage_open_position(&h.gateway, dec!(50));
    h.reconciler.tick().await;

    let places = h.gateway.place_count();
    let cancels = h.gateway.cancel_count();
    let remaining = h.reconciler.position("BTC-USDT").expect("pos").remaining_size;

    // Same exchange state, two more cycles: nothing new happens.
    h.reconciler.tick().await;
    h.reconciler.tick().await;

    assert_eq!(h.gateway.place_count(), places);
    assert_eq!(h.gateway.cancel_count(), cancels);
    let pos = h.reconciler.position("BTC-USDT").expect("pos");
    assert_eq!(pos.remaining_size, remaining);
    assert!(pos.tp1_hit);
    assert!(!pos.tp2_hit);
}

#[tokio::test]
async fn test_small_position_collapses_to_single_shot() {
    let mut h = harness();

    // One contract with a one-contract lot: 50% rounds below a lot.
    assert!(h.intake.submit_fill(fill(dec!(1))));
    stage_open_position(&h.gateway, dec!(1));
    h.reconciler.tick().await;

    let pos = h.reconciler.position("BTC-USDT").expect("tracked");
    let tp1_id = pos.tp1_order_id.clone().expect("tp1");

    // TP1 was sized at 100% of the position.
    let placed = h.gateway.placed_conditionals();
    let (_, tp1_spec) = placed.iter().find(|(id, _)| *id == tp1_id).expect("tp1");
    assert_eq!(tp1_spec.size, dec!(1));

    let placements_before = h.gateway.place_count();
    let cancels_before = h.gateway.cancel_count();

    // TP1 firing closes everything; no further split is attempted.
    trigger_order(&h.gateway, &tp1_id, 1_000);
    h.gateway.clear_position("BTC-USDT");
    h.gateway.clear_pending_conditionals("BTC-USDT");
    h.reconciler.tick().await;

    assert!(h.reconciler.position("BTC-USDT").is_none());
    assert_eq!(h.gateway.place_count(), placements_before);
    assert_eq!(h.gateway.cancel_count(), cancels_before);
}

#[tokio::test]
async fn test_ambiguous_closure_debounced_then_evicted() {
    let mut h = harness();

    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    // The position and all conditional orders vanish with no history
    // trace; the classifier cannot explain it.
    h.gateway.clear_position("BTC-USDT");
    h.gateway.clear_pending_conditionals("BTC-USDT");
    h.gateway.set_close_reason("BTC-USDT", CloseReason::Unknown);

    let placements_before = h.gateway.place_count();

    // First empty cycle: still tracked (debounce).
    h.reconciler.tick().await;
    assert!(h.reconciler.position("BTC-USDT").is_some());

    // Second consecutive empty cycle: confirmed closed, evicted without
    // asserting a P&L reason and without placing anything.
    h.reconciler.tick().await;
    assert!(h.reconciler.position("BTC-USDT").is_none());
    assert_eq!(h.gateway.place_count(), placements_before);

    let snapshot = StateStore::new(h.state_path.clone()).load().expect("load");
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn test_transient_disappearance_does_not_evict() {
    let mut h = harness();

    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    // One cycle of API inconsistency.
    h.gateway.clear_position("BTC-USDT");
    h.gateway.clear_pending_conditionals("BTC-USDT");
    h.reconciler.tick().await;
    assert!(h.reconciler.position("BTC-USDT").is_some());

    // The position reappears: the confirmation streak resets.
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    h.gateway.clear_position("BTC-USDT");
    h.reconciler.tick().await;
    assert!(
        h.reconciler.position("BTC-USDT").is_some(),
        "one empty cycle after a reset must not evict"
    );
}

#[tokio::test]
async fn test_vanished_position_classified_as_stop_loss() {
    let mut h = harness();

    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    h.gateway.clear_position("BTC-USDT");
    h.gateway.clear_pending_conditionals("BTC-USDT");
    h.gateway.set_close_reason("BTC-USDT", CloseReason::StopLoss);

    h.reconciler.tick().await;
    h.reconciler.tick().await;

    assert!(h.reconciler.position("BTC-USDT").is_none());
}

#[tokio::test]
async fn test_double_trigger_applied_in_time_order() {
    let mut h = harness();

    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    let pos = h.reconciler.position("BTC-USDT").expect("tracked");
    let tp1_id = pos.tp1_order_id.clone().expect("tp1");
    let sl_id = pos.sl_order_id.clone().expect("sl");

    // Both the TP1 and the stop report executed in the same fetch, with
    // the stop listed first but timestamped later: TP1 fired, then the
    // market reversed through the stop before the next poll.
    trigger_order(&h.gateway, &sl_id, 2_000);
    trigger_order(&h.gateway, &tp1_id, 1_000);
    h.gateway.clear_position("BTC-USDT");
    h.gateway.clear_pending_conditionals("BTC-USDT");

    let placements_before = h.gateway.place_count();
    h.reconciler.tick().await;

    // TP1 applied first (stop resized + TP2 armed), then the stop closed
    // the position. Listed order must not matter.
    assert!(h.reconciler.position("BTC-USDT").is_none());
    assert_eq!(
        h.gateway.place_count(),
        placements_before + 2,
        "TP1 processing places the resized stop and TP2 before the stop terminates"
    );
}

#[tokio::test]
async fn test_restart_resumes_mid_lifecycle() {
    let mut h = harness();

    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    let tp1_id = h
        .reconciler
        .position("BTC-USDT")
        .and_then(|p| p.tp1_order_id.clone())
        .expect("tp1");
    trigger_order(&h.gateway, &tp1_id, 1_000);
    stage_open_position(&h.gateway, dec!(50));
    h.reconciler.tick().await;

    let pos = h.reconciler.position("BTC-USDT").expect("tracked");
    let tp2_id = pos.tp2_order_id.clone().expect("tp2");
    let sl_id = pos.sl_order_id.clone().expect("sl");

    // Process restart: a fresh reconciler over the same snapshot.
    let (_, rx) = intake_channel();
    let (_tx, shutdown_rx) = watch::channel(false);
    let mut restarted = Reconciler::new(
        ReconciliationConfig::default(),
        Arc::clone(&h.gateway),
        StateStore::new(h.state_path.clone()),
        rx,
        shutdown_rx,
    );
    let restored = restarted.restore().expect("restore");
    assert_eq!(restored, 1);

    let pos = restarted.position("BTC-USDT").expect("restored");
    assert!(pos.tp1_hit);
    assert_eq!(pos.remaining_size, dec!(50));
    assert_eq!(pos.tp2_order_id.as_deref(), Some(tp2_id.as_str()));
    assert_eq!(pos.sl_order_id.as_deref(), Some(sl_id.as_str()));

    // The restored position keeps progressing: TP2 fires.
    trigger_order(&h.gateway, &tp2_id, 2_000);
    stage_open_position(&h.gateway, dec!(25));
    restarted.tick().await;

    let pos = restarted.position("BTC-USDT").expect("tracked");
    assert!(pos.tp2_hit);
    assert_eq!(pos.remaining_size, dec!(25));
    assert!(pos.tp3_order_id.is_some());
}

#[tokio::test]
async fn test_remaining_size_is_monotonic() {
    let mut h = harness();

    assert!(h.intake.submit_fill(fill(dec!(100))));
    stage_open_position(&h.gateway, dec!(100));
    h.reconciler.tick().await;

    let mut last = h
        .reconciler
        .position("BTC-USDT")
        .expect("pos")
        .remaining_size;

    for (at, stage_size) in [(1_000, dec!(50)), (2_000, dec!(25))] {
        let pos = h.reconciler.position("BTC-USDT").expect("pos");
        let next_tp = if !pos.tp1_hit {
            pos.tp1_order_id.clone()
        } else if !pos.tp2_hit {
            pos.tp2_order_id.clone()
        } else {
            pos.tp3_order_id.clone()
        }
        .expect("next tp armed");

        trigger_order(&h.gateway, &next_tp, at);
        stage_open_position(&h.gateway, stage_size);
        h.reconciler.tick().await;

        let now = h
            .reconciler
            .position("BTC-USDT")
            .expect("pos")
            .remaining_size;
        assert!(now <= last, "remaining size must never grow ({now} > {last})");
        last = now;
    }
}
