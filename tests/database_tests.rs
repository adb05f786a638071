/// Store-level invariants: transactional entry/exit finalization, idempotent
/// fills, stink-bid dedup, whale snapshots, kill-switch persistence.
use chrono::Utc;
use polybot::database::{Database, FillRow, NewOrder, NewPosition};
use polybot::models::{OrderStatus, PositionStatus, StinkOrder, StrategyId, TpLevel};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_order<'a>(signal_id: &'a str, side: &'a str) -> NewOrder<'a> {
    NewOrder {
        signal_id,
        exchange_order_id: None,
        strategy: StrategyId::CopyTrader,
        market_id: "market1",
        token_id: "token1",
        side,
        size_shares: 100.0,
        price: 0.40,
        order_type: "GTC",
        status: OrderStatus::Pending,
        reasoning: "test",
        metadata_json: None,
    }
}

fn fill(trade_id: &str, shares: f64) -> FillRow {
    FillRow {
        exchange_trade_id: trade_id.to_string(),
        token_id: "token1".to_string(),
        side: "BUY".to_string(),
        price: 0.40,
        shares,
        fee: 0.25,
    }
}

fn new_position() -> NewPosition {
    NewPosition {
        market_id: "market1".to_string(),
        token_id: "token1".to_string(),
        outcome: "Yes".to_string(),
        side: "LONG".to_string(),
        strategy: StrategyId::CopyTrader,
        entry_price: 0.40,
        shares: 100.0,
        entry_fee: 0.25,
        source_wallet: Some("0xwhale".to_string()),
        tp_levels: vec![TpLevel {
            trigger_price: 0.60,
            fraction_to_sell: 0.5,
            fired: false,
        }],
        sl_price: Some(0.28),
        trail_pct: Some(15.0),
    }
}

/// Entry fill booked through the transactional path; returns position id.
fn open_position(db: &Database) -> i64 {
    let order_id = db.insert_order(&new_order("sig_entry", "BUY")).unwrap();
    db.finalize_entry(
        order_id,
        100.0,
        0.40,
        0.25,
        &[fill("trade_entry_1", 100.0)],
        &new_position(),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Entry / exit lifecycle
// ---------------------------------------------------------------------------

#[test]
fn entry_finalization_creates_position_and_fills() {
    let db = Database::open_in_memory().unwrap();
    let position_id = open_position(&db);

    let position = db.get_position(position_id).unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.shares, 100.0);
    assert_eq!(position.entry_shares, 100.0);
    assert_eq!(position.entry_fee, 0.25);
    assert_eq!(position.source_wallet.as_deref(), Some("0xwhale"));
    assert_eq!(position.tp_levels.len(), 1);
    assert_eq!(position.sl_price, Some(0.28));

    assert_eq!(db.count_open_positions().unwrap(), 1);
}

#[test]
fn position_only_closes_with_a_filled_exit_order() {
    let db = Database::open_in_memory().unwrap();
    let position_id = open_position(&db);

    // Marking closing does not close the position.
    db.mark_position_closing(position_id).unwrap();
    let p = db.get_position(position_id).unwrap().unwrap();
    assert_eq!(p.status, PositionStatus::Closing);
    assert!(p.status.is_open());

    // The close commits together with the exit order's filled status.
    let exit_order = db.insert_order(&new_order("sig_exit", "SELL")).unwrap();
    db.finalize_exit(
        exit_order,
        position_id,
        100.0,
        0.60,
        0.30,
        19.45,
        true,
        PositionStatus::Closed,
        "take_profit",
        &[fill("trade_exit_1", 100.0)],
    )
    .unwrap();

    let p = db.get_position(position_id).unwrap().unwrap();
    assert_eq!(p.status, PositionStatus::Closed);
    assert_eq!(p.shares, 0.0);
    assert!((p.realized_pnl - 19.45).abs() < 1e-9);
    let order = db.get_order(exit_order).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(db.count_open_positions().unwrap(), 0);
}

#[test]
fn partial_exit_reduces_shares_and_stays_open() {
    let db = Database::open_in_memory().unwrap();
    let position_id = open_position(&db);
    db.mark_position_closing(position_id).unwrap();

    let exit_order = db.insert_order(&new_order("sig_exit", "SELL")).unwrap();
    db.finalize_exit(
        exit_order,
        position_id,
        50.0,
        0.60,
        0.15,
        9.7,
        false,
        PositionStatus::Closed,
        "take_profit",
        &[fill("trade_exit_2", 50.0)],
    )
    .unwrap();

    let p = db.get_position(position_id).unwrap().unwrap();
    assert_eq!(p.status, PositionStatus::Open);
    assert_eq!(p.shares, 50.0);
    assert_eq!(p.entry_shares, 100.0);
    assert!((p.realized_pnl - 9.7).abs() < 1e-9);
}

#[test]
fn closing_positions_surface_for_recovery() {
    let db = Database::open_in_memory().unwrap();
    let position_id = open_position(&db);
    db.mark_position_closing(position_id).unwrap();

    let stranded = db.get_closing_positions().unwrap();
    assert_eq!(stranded.len(), 1);
    assert_eq!(stranded[0].id, position_id);

    // reopen reverses the transition for an exit that never reached the
    // exchange.
    db.reopen_position(position_id).unwrap();
    assert!(db.get_closing_positions().unwrap().is_empty());
}

#[test]
fn resolution_settles_position_with_settlement_trade() {
    let db = Database::open_in_memory().unwrap();
    let position_id = open_position(&db);

    // Held 100 shares of the winner bought at 0.40: winnings 60, 2% fee.
    db.finalize_resolution(position_id, 1.0, 1.2, 58.55).unwrap();

    let p = db.get_position(position_id).unwrap().unwrap();
    assert_eq!(p.status, PositionStatus::Resolved);
    assert_eq!(p.shares, 0.0);
    assert!((p.realized_pnl - 58.55).abs() < 1e-9);
    assert_eq!(p.close_reason.as_deref(), Some("market_resolved"));
}

// ---------------------------------------------------------------------------
// Fill idempotency
// ---------------------------------------------------------------------------

#[test]
fn redelivered_fill_does_not_duplicate_history() {
    let db = Database::open_in_memory().unwrap();
    let order_id = db.insert_order(&new_order("sig1", "BUY")).unwrap();

    assert!(db.record_fill(order_id, &fill("exchange_trade_42", 50.0)).unwrap());
    // Same exchange trade id delivered again: ignored, history unchanged.
    assert!(!db.record_fill(order_id, &fill("exchange_trade_42", 50.0)).unwrap());
    assert_eq!(db.count_fills(order_id).unwrap(), 1);

    // A different trade id is a new fill.
    assert!(db.record_fill(order_id, &fill("exchange_trade_43", 25.0)).unwrap());
    assert_eq!(db.count_fills(order_id).unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Stink order dedup
// ---------------------------------------------------------------------------

#[test]
fn at_most_one_stink_bid_per_market_token() {
    let db = Database::open_in_memory().unwrap();
    let stink = StinkOrder {
        market_id: "m1".to_string(),
        token_id: "t1".to_string(),
        exchange_order_id: "ord_1".to_string(),
        price: 0.05,
        size_usd: 20.0,
        placed_at: Utc::now(),
    };
    db.upsert_stink_order(&stink).unwrap();

    // A second placement on the same (market, token) replaces, not adds.
    let replacement = StinkOrder {
        exchange_order_id: "ord_2".to_string(),
        price: 0.06,
        ..stink
    };
    db.upsert_stink_order(&replacement).unwrap();

    let rows = db.get_stink_orders().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].exchange_order_id, "ord_2");

    db.delete_stink_order("m1", "t1").unwrap();
    assert!(db.get_stink_orders().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Whale snapshots
// ---------------------------------------------------------------------------

#[test]
fn whale_positions_upsert_and_delete() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_whale_position("0xw", "m1", "t1", 1000.0, 0.40).unwrap();
    db.upsert_whale_position("0xw", "m1", "t1", 1200.0, 0.42).unwrap();
    db.upsert_whale_position("0xw", "m2", "t2", 500.0, 0.30).unwrap();

    let positions = db.get_whale_positions("0xw").unwrap();
    assert_eq!(positions.len(), 2);
    let first = positions.iter().find(|p| p.token_id == "t1").unwrap();
    assert_eq!(first.shares, 1200.0);

    db.delete_whale_position("0xw", "m1", "t1").unwrap();
    assert_eq!(db.get_whale_positions("0xw").unwrap().len(), 1);

    // Another wallet's state is independent.
    assert!(db.get_whale_positions("0xother").unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Metadata / risk events / JSON queries
// ---------------------------------------------------------------------------

#[test]
fn metadata_roundtrip() {
    let db = Database::open_in_memory().unwrap();
    assert!(db.get_metadata("missing").unwrap().is_none());
    db.set_metadata("key", "v1").unwrap();
    db.set_metadata("key", "v2").unwrap();
    assert_eq!(db.get_metadata("key").unwrap().as_deref(), Some("v2"));
}

#[test]
fn risk_events_recorded() {
    let db = Database::open_in_memory().unwrap();
    db.record_risk_event("daily_loss_limit", Some("arb_scanner"), "loss 55 >= 50")
        .unwrap();
}

#[test]
fn orders_queryable_by_arb_pair_metadata() {
    let db = Database::open_in_memory().unwrap();
    let meta = r#"{"arb_pair_id":"arb_abc","arb_leg":1}"#;
    let mut order = new_order("sig_arb1", "BUY");
    order.metadata_json = Some(meta.to_string());
    db.insert_order(&order).unwrap();

    let mut other = new_order("sig_other", "BUY");
    other.metadata_json = Some(r#"{"arb_pair_id":"arb_xyz","arb_leg":1}"#.to_string());
    db.insert_order(&other).unwrap();

    let pair = db.get_orders_by_arb_pair("arb_abc").unwrap();
    assert_eq!(pair.len(), 1);
    assert_eq!(pair[0].signal_id, "sig_arb1");
}

#[test]
fn wallet_performance_rolls_up_closed_copy_positions() {
    let db = Database::open_in_memory().unwrap();

    // One winning close sourced from the tracked whale.
    let position_id = open_position(&db);
    db.mark_position_closing(position_id).unwrap();
    let exit_order = db.insert_order(&new_order("sig_exit_w", "SELL")).unwrap();
    db.finalize_exit(
        exit_order,
        position_id,
        100.0,
        0.60,
        0.30,
        19.45,
        true,
        PositionStatus::Closed,
        "take_profit",
        &[fill("trade_perf_1", 100.0)],
    )
    .unwrap();

    let perf = polybot::copy_trader::wallet_performance(&db).unwrap();
    assert_eq!(perf.len(), 1);
    assert_eq!(perf[0].address, "0xwhale");
    assert_eq!(perf[0].trades, 1);
    assert_eq!(perf[0].wins, 1);
    assert_eq!(perf[0].losses, 0);
    assert!((perf[0].total_pnl - 19.45).abs() < 1e-9);
}

#[test]
fn realized_pnl_today_counts_partial_realizations() {
    let db = Database::open_in_memory().unwrap();
    let position_id = open_position(&db);
    db.mark_position_closing(position_id).unwrap();
    let exit_order = db.insert_order(&new_order("sig_exit", "SELL")).unwrap();
    db.finalize_exit(
        exit_order,
        position_id,
        50.0,
        0.60,
        0.15,
        9.7,
        false,
        PositionStatus::Closed,
        "take_profit",
        &[fill("trade_pnl_1", 50.0)],
    )
    .unwrap();

    // Position is still open but its partial realization counts today.
    assert!((db.realized_pnl_today().unwrap() - 9.7).abs() < 1e-9);
}
