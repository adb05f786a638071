/// End-to-end pipeline tests in paper mode: signal → risk → size → submit →
/// confirm → persist, plus kill-switch draining and arb unwind behavior.
use std::sync::Arc;
use std::time::Duration;

use polybot::config::Settings;
use polybot::database::Database;
use polybot::exchange::ExchangeClient;
use polybot::models::{
    Outcome, OrderType, PositionStatus, Side, Signal, SignalMeta, StrategyId,
};
use polybot::notifier::Notifier;
use polybot::order_manager::OrderManager;
use polybot::pnl::PnlTracker;
use polybot::position_manager::ClosingGuard;
use polybot::rate_limiter::RateLimiter;
use polybot::risk::KillSwitch;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    db: Arc<Database>,
    exchange: Arc<ExchangeClient>,
    kill: Arc<KillSwitch>,
    closing: ClosingGuard,
    sender: polybot::order_manager::SignalSender,
}

fn start_pipeline() -> Harness {
    let settings = Settings::default(); // paper mode
    let db = Arc::new(Database::open_in_memory().unwrap());
    let limiter = Arc::new(RateLimiter::new(1000, 60.0));
    let exchange = Arc::new(ExchangeClient::new(&settings, limiter).unwrap());
    let kill = Arc::new(KillSwitch::load(Arc::clone(&db)).unwrap());
    let pnl = Arc::new(PnlTracker::new(Arc::clone(&db), Arc::clone(&exchange)));
    let notifier = Arc::new(Notifier::new(&settings));
    let closing = ClosingGuard::new();

    let (manager, sender) = OrderManager::new(
        settings,
        Arc::clone(&db),
        Arc::clone(&exchange),
        pnl,
        Arc::clone(&kill),
        notifier,
        closing.clone(),
    );
    tokio::spawn(manager.run());

    Harness {
        db,
        exchange,
        kill,
        closing,
        sender,
    }
}

/// Poll until `check` passes or the deadline hits.
async fn wait_for<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn entry_signal(market: &str, token: &str, size_usd: f64, price: f64) -> Signal {
    Signal::new(
        StrategyId::CopyTrader,
        market,
        token,
        Outcome::Yes,
        Side::Buy,
        size_usd,
        price,
        OrderType::Gtc,
        "test entry",
    )
}

// ---------------------------------------------------------------------------
// Entry pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn entry_signal_opens_position_with_usd_to_share_conversion() {
    let h = start_pipeline();
    h.exchange.set_paper_price("tok_yes", 0.405);

    assert!(h.sender.submit(entry_signal("m1", "tok_yes", 100.0, 0.405)).await);

    wait_for(|| h.db.count_open_positions().unwrap() == 1, "position open").await;

    let positions = h.db.get_open_positions(None).unwrap();
    let p = &positions[0];
    // $100 at 0.405 floors to 246.91 shares on the 0.01 tick.
    assert!((p.shares - 246.91).abs() < 1e-6, "shares = {}", p.shares);
    // Conversion happened once: shares * price stays within one tick of
    // the requested notional.
    assert!((p.shares * p.entry_price - 100.0).abs() < 0.405 * 0.011);
    assert_eq!(p.entry_price, 0.405);
    assert_eq!(p.status, PositionStatus::Open);
    assert!(p.entry_fee > 0.0);
    // TP ladder and stop attached on open.
    assert_eq!(p.tp_levels.len(), 2);
    assert!(p.sl_price.is_some());
}

#[tokio::test]
async fn undersized_entry_is_dropped_before_submission() {
    let h = start_pipeline();
    h.exchange.set_paper_price("tok_yes", 0.50);

    // $1 at 0.50 is 2 shares, below the 5-share exchange minimum.
    h.sender.submit(entry_signal("m1", "tok_yes", 1.0, 0.50)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.db.count_open_positions().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Exit pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exit_signal_closes_position_and_releases_guard() {
    let h = start_pipeline();
    h.exchange.set_paper_price("tok_yes", 0.40);

    h.sender.submit(entry_signal("m1", "tok_yes", 80.0, 0.40)).await;
    wait_for(|| h.db.count_open_positions().unwrap() == 1, "position open").await;
    let position = h.db.get_open_positions(None).unwrap().remove(0);

    // Emit a full exit the way the position manager does.
    h.exchange.set_paper_price("tok_yes", 0.60);
    assert!(h.closing.try_claim(position.id));
    h.db.mark_position_closing(position.id).unwrap();
    let exit = Signal::new(
        StrategyId::CopyTrader,
        position.market_id.clone(),
        position.token_id.clone(),
        position.outcome,
        Side::Sell,
        position.shares * 0.60,
        0.60,
        OrderType::Fok,
        "position exit: take_profit",
    )
    .with_meta(SignalMeta {
        is_exit: true,
        parent_position_id: Some(position.id),
        ..Default::default()
    });
    h.sender.submit(exit).await;

    wait_for(
        || {
            h.db.get_position(position.id)
                .unwrap()
                .map(|p| p.status == PositionStatus::Closed)
                .unwrap_or(false)
        },
        "position closed",
    )
    .await;

    let p = h.db.get_position(position.id).unwrap().unwrap();
    assert_eq!(p.shares, 0.0);
    // Long from 0.40 to 0.60 is profitable even after both fees.
    assert!(p.realized_pnl > 0.0, "pnl = {}", p.realized_pnl);
    // Terminal outcome persisted: the claim is released.
    assert!(!h.closing.contains(position.id));
}

// ---------------------------------------------------------------------------
// Kill switch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn kill_switch_drains_entries_but_exits_still_flow() {
    let h = start_pipeline();
    h.exchange.set_paper_price("tok_yes", 0.40);

    // Open one position before the halt.
    h.sender.submit(entry_signal("m_pre", "tok_yes", 80.0, 0.40)).await;
    wait_for(|| h.db.count_open_positions().unwrap() == 1, "position open").await;
    let position = h.db.get_open_positions(None).unwrap().remove(0);

    h.kill.activate("test operator").unwrap();

    // A burst of queued entries is discarded without touching the exchange.
    for i in 0..20 {
        h.sender
            .submit(entry_signal(&format!("m{i}"), "tok_yes", 50.0, 0.40))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.db.count_open_positions().unwrap(), 1, "no entries during halt");

    // Exits are preserved and processed.
    assert!(h.closing.try_claim(position.id));
    h.db.mark_position_closing(position.id).unwrap();
    let exit = Signal::new(
        StrategyId::CopyTrader,
        position.market_id.clone(),
        position.token_id.clone(),
        position.outcome,
        Side::Sell,
        position.shares * 0.40,
        0.40,
        OrderType::Fok,
        "position exit: halt",
    )
    .with_meta(SignalMeta {
        is_exit: true,
        parent_position_id: Some(position.id),
        ..Default::default()
    });
    h.sender.submit(exit).await;

    wait_for(
        || {
            h.db.get_position(position.id)
                .unwrap()
                .map(|p| p.status == PositionStatus::Closed)
                .unwrap_or(false)
        },
        "exit processed during halt",
    )
    .await;
}

// ---------------------------------------------------------------------------
// Arb pairing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_leg_two_unwinds_leg_one() {
    let h = start_pipeline();
    h.exchange.set_paper_price("tok_yes", 0.48);
    h.exchange.set_paper_price("tok_no", 0.49);

    let pair = "arb_test_pair".to_string();
    let leg1 = Signal::new(
        StrategyId::ArbScanner,
        "m_arb",
        "tok_yes",
        Outcome::Yes,
        Side::Buy,
        50.0,
        0.48,
        OrderType::Fok,
        "arb leg 1",
    )
    .with_meta(SignalMeta {
        arb_pair_id: Some(pair.clone()),
        arb_leg: Some(1),
        ..Default::default()
    });
    // Leg 2 is too small to ever reach the exchange (under min shares), so
    // it dies after leg 1 filled - the pair must unwind.
    let leg2 = Signal::new(
        StrategyId::ArbScanner,
        "m_arb",
        "tok_no",
        Outcome::No,
        Side::Buy,
        0.5,
        0.49,
        OrderType::Fok,
        "arb leg 2",
    )
    .with_meta(SignalMeta {
        arb_pair_id: Some(pair),
        arb_leg: Some(2),
        ..Default::default()
    });

    h.sender.submit(leg1).await;
    h.sender.submit(leg2).await;

    // Leg 1 opens, then the unwind SELL closes it again.
    wait_for(
        || {
            let closed = h.db.get_closed_positions(Some(StrategyId::ArbScanner)).unwrap();
            closed.len() == 1 && closed[0].shares == 0.0
        },
        "leg 1 unwound",
    )
    .await;

    let closed = h.db.get_closed_positions(Some(StrategyId::ArbScanner)).unwrap();
    assert_eq!(closed[0].status, PositionStatus::Closed);
    assert_eq!(closed[0].token_id, "tok_yes");
}

#[tokio::test]
async fn both_arb_legs_fill_into_two_positions() {
    let h = start_pipeline();
    h.exchange.set_paper_price("tok_yes", 0.48);
    h.exchange.set_paper_price("tok_no", 0.49);

    let pair = "arb_happy_pair".to_string();
    for (leg, token, outcome, price) in [
        (1u8, "tok_yes", Outcome::Yes, 0.48),
        (2u8, "tok_no", Outcome::No, 0.49),
    ] {
        let signal = Signal::new(
            StrategyId::ArbScanner,
            "m_arb",
            token,
            outcome,
            Side::Buy,
            50.0,
            price,
            OrderType::Fok,
            "arb leg",
        )
        .with_meta(SignalMeta {
            arb_pair_id: Some(pair.clone()),
            arb_leg: Some(leg),
            ..Default::default()
        });
        h.sender.submit(signal).await;
    }

    wait_for(|| h.db.count_open_positions().unwrap() == 2, "both legs open").await;

    let positions = h.db.get_open_positions(None).unwrap();
    // ~104 YES shares and ~102 NO shares: guaranteed $1 per unit pair at
    // resolution against ~$0.97 per unit paid.
    assert!(positions.iter().any(|p| p.token_id == "tok_yes"));
    assert!(positions.iter().any(|p| p.token_id == "tok_no"));
}

// ---------------------------------------------------------------------------
// Queue behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn entry_overflow_drops_but_exits_always_enqueue() {
    // Stand-alone channels, no worker: the queue fills up and stays full.
    let (sender, _entry_rx, _exit_rx) = polybot::order_manager::SignalSender::channel(2);

    assert!(sender.submit(entry_signal("m1", "t", 10.0, 0.5)).await);
    assert!(sender.submit(entry_signal("m2", "t", 10.0, 0.5)).await);
    // Queue is full: the third entry is dropped.
    assert!(!sender.submit(entry_signal("m3", "t", 10.0, 0.5)).await);

    // Exits ride the reserved channel and are unaffected.
    let exit = entry_signal("m4", "t", 10.0, 0.5).with_meta(SignalMeta {
        is_exit: true,
        parent_position_id: Some(1),
        ..Default::default()
    });
    assert!(sender.submit(exit).await);
}
