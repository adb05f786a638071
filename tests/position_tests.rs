/// Position-manager behavior against a real store: duplicate-exit guarding
/// under rapid ticks, fee-inclusive P&L, resolution accounting and startup
/// recovery of unfinished closes.
use std::sync::Arc;

use chrono::Utc;
use polybot::config::Settings;
use polybot::database::{Database, FillRow, NewOrder, NewPosition};
use polybot::exchange::ExchangeClient;
use polybot::models::{OrderStatus, PositionStatus, PriceEvent, StrategyId, TpLevel};
use polybot::order_manager::SignalSender;
use polybot::position_manager::{recover_closing_positions, ClosingGuard, PositionManager};
use polybot::rate_limiter::RateLimiter;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_position(db: &Database, token: &str, entry: f64, shares: f64) -> i64 {
    let order_id = db
        .insert_order(&NewOrder {
            signal_id: "sig_entry",
            exchange_order_id: None,
            strategy: StrategyId::CopyTrader,
            market_id: "m1",
            token_id: token,
            side: "BUY",
            size_shares: shares,
            price: entry,
            order_type: "GTC",
            status: OrderStatus::Pending,
            reasoning: "test",
            metadata_json: None,
        })
        .unwrap();
    db.finalize_entry(
        order_id,
        shares,
        entry,
        0.50,
        &[FillRow {
            exchange_trade_id: format!("trade_{token}_{entry}"),
            token_id: token.to_string(),
            side: "BUY".to_string(),
            price: entry,
            shares,
            fee: 0.50,
        }],
        &NewPosition {
            market_id: "m1".to_string(),
            token_id: token.to_string(),
            outcome: "Yes".to_string(),
            side: "LONG".to_string(),
            strategy: StrategyId::CopyTrader,
            entry_price: entry,
            shares,
            entry_fee: 0.50,
            source_wallet: None,
            tp_levels: vec![
                TpLevel { trigger_price: 0.60, fraction_to_sell: 0.5, fired: false },
                TpLevel { trigger_price: 0.80, fraction_to_sell: 1.0, fired: false },
            ],
            sl_price: Some(0.28),
            trail_pct: Some(15.0),
        },
    )
    .unwrap()
}

type ExitRx = tokio::sync::mpsc::Receiver<polybot::Signal>;
type EntryRx = tokio::sync::mpsc::Receiver<polybot::Signal>;

/// A position manager wired to bare channels so tests observe exactly what
/// gets queued. The entry receiver is returned only to keep the channel
/// open.
fn manager_with_channels(
    db: Arc<Database>,
    closing: ClosingGuard,
) -> (PositionManager, ExitRx, EntryRx) {
    let settings = Settings::default();
    let limiter = Arc::new(RateLimiter::new(1000, 60.0));
    let exchange = Arc::new(ExchangeClient::new(&settings, limiter).unwrap());
    let (sender, entry_rx, exit_rx) = SignalSender::channel(16);
    let manager = PositionManager::new(db, exchange, sender, closing);
    (manager, exit_rx, entry_rx)
}

fn tick(token: &str, price: f64) -> PriceEvent {
    PriceEvent {
        token_id: token.to_string(),
        price,
        timestamp: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Duplicate-exit guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rapid_ticks_emit_exactly_one_exit() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let position_id = open_position(&db, "tok1", 0.40, 100.0);
    let closing = ClosingGuard::new();
    let (mut manager, mut exit_rx, _entry_rx) = manager_with_channels(Arc::clone(&db), closing.clone());

    // Two back-to-back ticks through the first TP trigger.
    manager.on_price_event(&tick("tok1", 0.605)).await.unwrap();
    manager.on_price_event(&tick("tok1", 0.610)).await.unwrap();

    // Exactly one exit signal, for half the position.
    let exit = exit_rx.try_recv().expect("one exit expected");
    assert!(exit.is_exit());
    assert_eq!(exit.meta.parent_position_id, Some(position_id));
    assert!((exit.size_usd - 50.0 * 0.605).abs() < 1e-9);
    assert!(exit_rx.try_recv().is_err(), "second tick must not emit");

    // The claim is held and the transition persisted until the exit's
    // terminal outcome lands.
    assert!(closing.contains(position_id));
    let p = db.get_position(position_id).unwrap().unwrap();
    assert_eq!(p.status, PositionStatus::Closing);
}

#[tokio::test]
async fn stop_loss_emits_full_close() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let position_id = open_position(&db, "tok1", 0.40, 100.0);
    let closing = ClosingGuard::new();
    let (mut manager, mut exit_rx, _entry_rx) = manager_with_channels(Arc::clone(&db), closing.clone());

    manager.on_price_event(&tick("tok1", 0.27)).await.unwrap();

    let exit = exit_rx.try_recv().expect("stop-loss exit expected");
    assert!(exit.reasoning.contains("stop_loss"));
    // Full position at the tick price.
    assert!((exit.size_usd - 100.0 * 0.27).abs() < 1e-9);
    assert!(closing.contains(position_id));
}

#[tokio::test]
async fn ticks_for_other_tokens_are_ignored() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    open_position(&db, "tok1", 0.40, 100.0);
    let (mut manager, mut exit_rx, _entry_rx) = manager_with_channels(Arc::clone(&db), ClosingGuard::new());

    manager.on_price_event(&tick("other_token", 0.01)).await.unwrap();
    assert!(exit_rx.try_recv().is_err());
}

#[tokio::test]
async fn tp_then_trailing_anchor_persists() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let position_id = open_position(&db, "tok1", 0.40, 100.0);
    let closing = ClosingGuard::new();
    let (mut manager, mut exit_rx, _entry_rx) = manager_with_channels(Arc::clone(&db), closing.clone());

    manager.on_price_event(&tick("tok1", 0.62)).await.unwrap();
    let _ = exit_rx.try_recv().expect("tp exit");

    let p = db.get_position(position_id).unwrap().unwrap();
    assert!(p.tp_levels[0].fired);
    assert_eq!(p.trail_anchor, Some(0.62));
}

// ---------------------------------------------------------------------------
// Fee-inclusive P&L
// ---------------------------------------------------------------------------

#[test]
fn realized_pnl_subtracts_proportional_entry_fee_and_exit_fee() {
    let db = Database::open_in_memory().unwrap();
    let position_id = open_position(&db, "tok1", 0.40, 100.0);
    let position = db.get_position(position_id).unwrap().unwrap();

    // Close half at 0.60 with a 0.30 exit fee. Gross = 0.20 * 50 = 10.
    // Proportional entry fee = 0.50 * (50/100) = 0.25.
    let realized = position.realized_for_close(0.60, 50.0, 0.30);
    assert!((realized - (10.0 - 0.25 - 0.30)).abs() < 1e-9);
}

#[test]
fn resolution_scenario_winner_and_loser() {
    // 100 shares at 0.40. Winner pays 1.0: gross 60, 2% fee on winnings.
    let db = Database::open_in_memory().unwrap();
    let winner_id = open_position(&db, "tok_win", 0.40, 100.0);
    let winner = db.get_position(winner_id).unwrap().unwrap();
    let winnings = (1.0 - 0.40) * 100.0;
    let fee = winnings * 0.02;
    let realized = winner.realized_for_close(1.0, 100.0, fee);
    assert!((realized - (60.0 - 0.50 - 1.2)).abs() < 1e-9);
    db.finalize_resolution(winner_id, 1.0, fee, realized).unwrap();
    let settled = db.get_position(winner_id).unwrap().unwrap();
    assert_eq!(settled.status, PositionStatus::Resolved);

    // Loser pays 0.0: lose the stake plus the entry fee, no winner fee.
    let loser_id = open_position(&db, "tok_lose", 0.40, 100.0);
    let loser = db.get_position(loser_id).unwrap().unwrap();
    let realized = loser.realized_for_close(0.0, 100.0, 0.0);
    assert!((realized - (-40.0 - 0.50)).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Startup recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stranded_closing_position_gets_exit_reemitted() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let position_id = open_position(&db, "tok1", 0.40, 100.0);
    db.update_position_price(position_id, 0.55).unwrap();
    db.mark_position_closing(position_id).unwrap();

    let closing = ClosingGuard::new();
    let (sender, _entry_rx, mut exit_rx) = SignalSender::channel(16);

    let recovered = recover_closing_positions(&db, &sender, &closing).await.unwrap();
    assert_eq!(recovered, 1);

    let exit = exit_rx.try_recv().expect("recovery exit expected");
    assert!(exit.is_exit());
    assert_eq!(exit.meta.parent_position_id, Some(position_id));
    // Sized at the last seen price for the full remaining shares.
    assert!((exit.size_usd - 100.0 * 0.55).abs() < 1e-9);
    assert!(closing.contains(position_id));

    // Running recovery again is a no-op while the claim is held.
    let recovered = recover_closing_positions(&db, &sender, &closing).await.unwrap();
    assert_eq!(recovered, 0);
}
