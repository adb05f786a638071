/// main.rs – Entry point for the Polymarket trading bot.
///
/// Wires the store, rate limiter, exchange adapter, risk gate, order
/// manager, position manager and the three strategies onto the tokio
/// runtime, then runs until SIGINT/SIGTERM and shuts down in order: stop
/// intake, cancel open orders, drain in-flight work within the grace
/// period, persist state, close the store last.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use polybot::arb_scanner::ArbScanner;
use polybot::config::Settings;
use polybot::control::{activate_kill, run_control_loop, PauseFlags};
use polybot::copy_trader::CopyTrader;
use polybot::database::Database;
use polybot::exchange::ExchangeClient;
use polybot::health::{self, HealthState};
use polybot::models::StrategyId;
use polybot::notifier::{ControlCommand, Notifier};
use polybot::order_manager::OrderManager;
use polybot::pnl::PnlTracker;
use polybot::position_manager::{
    recover_closing_positions, ClosingGuard, PositionManager, ResolutionSweeper,
};
use polybot::rate_limiter::RateLimiter;
use polybot::risk::KillSwitch;
use polybot::stink_bidder::StinkBidder;

/// Grace period for in-flight exits at shutdown.
const SHUTDOWN_GRACE_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "polybot",
    about = "Polymarket trading bot - copy trading, parity arbitrage and stink bids",
    version
)]
struct Cli {
    /// Run in live trading mode (default: paper).
    #[arg(long, default_value_t = false)]
    live: bool,

    /// Print current status and exit.
    #[arg(long, default_value_t = false)]
    status: bool,

    /// Activate the kill switch: cancel all open orders and halt trading.
    /// Unconditional; also runs in paper mode.
    #[arg(long, default_value_t = false)]
    kill: bool,

    /// Override the log level from config.
    #[arg(long)]
    log_level: Option<String>,

    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.config, cli.live).context("loading settings")?;
    if let Some(level) = &cli.log_level {
        settings.bot.log_level = level.clone();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.bot.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if settings.is_live() {
        warn!("LIVE trading mode - real money at risk");
    } else {
        info!("paper trading mode - orders are simulated");
    }

    // Core infrastructure, store first.
    let db = Arc::new(Database::open(&settings.bot.db_path).context("opening database")?);
    let limiter = Arc::new(RateLimiter::new(
        settings.clob.rate_limit_requests,
        settings.clob.rate_limit_window_secs,
    ));
    let exchange = Arc::new(ExchangeClient::new(&settings, Arc::clone(&limiter))?);
    let kill = Arc::new(KillSwitch::load(Arc::clone(&db))?);
    let pnl = Arc::new(PnlTracker::new(Arc::clone(&db), Arc::clone(&exchange)));
    let notifier = Arc::new(Notifier::new(&settings));

    if cli.kill {
        return run_kill(&db, &kill, &exchange, &notifier).await;
    }
    if cli.status {
        return run_status(&settings, &db, &kill, &pnl).await;
    }

    run_bot(settings, db, exchange, kill, pnl, notifier).await
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

async fn run_kill(
    db: &Arc<Database>,
    kill: &Arc<KillSwitch>,
    exchange: &Arc<ExchangeClient>,
    notifier: &Arc<Notifier>,
) -> Result<()> {
    activate_kill(kill, exchange, notifier, "CLI --kill").await;
    let open = db.get_open_positions(None)?;
    println!("Kill switch activated.");
    println!("  Open positions remaining: {}", open.len());
    println!("  The bot will not trade until the switch is cleared by an operator.");
    Ok(())
}

async fn run_status(
    settings: &Settings,
    db: &Arc<Database>,
    kill: &Arc<KillSwitch>,
    pnl: &Arc<PnlTracker>,
) -> Result<()> {
    println!("mode: {}", settings.bot.trading_mode);
    println!(
        "halted: {}",
        if kill.is_active() { "YES (kill switch)" } else { "no" }
    );
    println!("{}", pnl.summary_text().await);
    println!("all-time realized: {:+.2}", db.total_realized_pnl()?);
    for p in db.get_open_positions(None)? {
        println!(
            "  [{}] {} {} {} {:.1} shares @ {:.4} ({})",
            p.id, p.strategy, p.market_id, p.outcome, p.shares, p.entry_price, p.status
        );
    }
    let per_wallet = polybot::copy_trader::wallet_performance(db)?;
    if !per_wallet.is_empty() {
        println!("copied wallets:");
        for w in per_wallet {
            println!(
                "  {}: {} trades ({}W/{}L), P&L {:+.2}",
                w.address, w.trades, w.wins, w.losses, w.total_pnl
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Bot runtime
// ---------------------------------------------------------------------------

async fn run_bot(
    settings: Settings,
    db: Arc<Database>,
    exchange: Arc<ExchangeClient>,
    kill: Arc<KillSwitch>,
    pnl: Arc<PnlTracker>,
    notifier: Arc<Notifier>,
) -> Result<()> {
    let closing = ClosingGuard::new();
    let pause = PauseFlags::new();

    let (order_manager, sender) = OrderManager::new(
        settings.clone(),
        Arc::clone(&db),
        Arc::clone(&exchange),
        Arc::clone(&pnl),
        Arc::clone(&kill),
        Arc::clone(&notifier),
        closing.clone(),
    );
    let order_manager_task = tokio::spawn(order_manager.run());

    // Recovery: positions stranded in `closing` by the previous run get
    // their exits re-emitted before anything else trades.
    let recovered = recover_closing_positions(&db, &sender, &closing).await?;
    if recovered > 0 {
        warn!(recovered, "re-emitted exits for unfinished closes");
        notifier
            .alert(&format!("Startup recovery: re-emitted {recovered} unfinished exit(s)"))
            .await;
    }

    // Price feed, primed with the tokens we already hold.
    let held_tokens: Vec<String> = db
        .get_open_positions(None)?
        .into_iter()
        .map(|p| p.token_id)
        .collect();
    let (price_events, ws_connected) = exchange.start_price_stream(held_tokens);

    let position_manager = PositionManager::new(
        Arc::clone(&db),
        Arc::clone(&exchange),
        sender.clone(),
        closing.clone(),
    );
    let position_task = tokio::spawn(position_manager.run_price_loop(price_events, ws_connected));

    let sweeper = ResolutionSweeper {
        settings: settings.clone(),
        db: Arc::clone(&db),
        exchange: Arc::clone(&exchange),
        notifier: Arc::clone(&notifier),
        closing: closing.clone(),
    };
    let sweeper_task = tokio::spawn(sweeper.run());

    // Strategy loops.
    let mut strategy_tasks = Vec::new();
    if settings.strategy_enabled(StrategyId::CopyTrader) {
        let mut strategy = CopyTrader::new(
            settings.clone(),
            Arc::clone(&db),
            Arc::clone(&exchange),
            sender.clone(),
            closing.clone(),
        );
        let interval = settings.copy_trader.poll_interval_secs;
        let pause = pause.clone();
        strategy_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            loop {
                ticker.tick().await;
                if pause.is_paused(StrategyId::CopyTrader) {
                    continue;
                }
                if let Err(e) = strategy.tick().await {
                    error!("copy trader tick failed: {e:#}");
                }
            }
        }));
    }
    if settings.strategy_enabled(StrategyId::ArbScanner) {
        let mut strategy =
            ArbScanner::new(settings.clone(), Arc::clone(&exchange), sender.clone());
        let interval = settings.arb_scanner.scan_interval_secs;
        let pause = pause.clone();
        strategy_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            loop {
                ticker.tick().await;
                if pause.is_paused(StrategyId::ArbScanner) {
                    continue;
                }
                if let Err(e) = strategy.tick().await {
                    error!("arb scan failed: {e:#}");
                }
            }
        }));
    }
    if settings.strategy_enabled(StrategyId::StinkBidder) {
        let mut strategy = StinkBidder::new(
            settings.clone(),
            Arc::clone(&db),
            Arc::clone(&exchange),
            sender.clone(),
            Arc::clone(&pnl),
            Arc::clone(&notifier),
        );
        let interval = settings.stink_bidder.refresh_interval_secs;
        let pause = pause.clone();
        strategy_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            loop {
                ticker.tick().await;
                if pause.is_paused(StrategyId::StinkBidder) {
                    continue;
                }
                if let Err(e) = strategy.tick().await {
                    error!("stink bidder tick failed: {e:#}");
                }
            }
        }));
    }

    // Control surface: chat commands + the control dispatcher.
    let (control_tx, control_rx) = mpsc::channel::<ControlCommand>(16);
    tokio::spawn(run_control_loop(
        control_rx,
        Arc::clone(&kill),
        Arc::clone(&exchange),
        Arc::clone(&notifier),
        pause.clone(),
    ));
    tokio::spawn(Arc::clone(&notifier).run_command_loop(
        settings.clone(),
        Arc::clone(&pnl),
        Arc::clone(&db),
        Arc::clone(&kill),
        control_tx,
    ));
    tokio::spawn(
        Arc::clone(&notifier)
            .run_daily_summary_loop(Arc::clone(&pnl), settings.telegram.daily_summary_utc_hour),
    );

    // Health endpoint and the snapshot loop feeding its adapter flag.
    let adapter_ok = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicBool::new(false));
    let health_state = HealthState {
        db: Arc::clone(&db),
        exchange: Arc::clone(&exchange),
        kill: Arc::clone(&kill),
        adapter_ok: Arc::clone(&adapter_ok),
        ready: Arc::clone(&ready),
    };
    let health_port = settings.bot.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_state, health_port).await {
            error!("health server failed: {e:#}");
        }
    });
    {
        let pnl = Arc::clone(&pnl);
        let adapter_ok = Arc::clone(&adapter_ok);
        let notifier = Arc::clone(&notifier);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            let mut was_ok = true;
            loop {
                ticker.tick().await;
                let ok = matches!(pnl.snapshot().await, polybot::risk::SnapshotState::Ok(_));
                adapter_ok.store(ok, Ordering::Relaxed);
                if was_ok && !ok {
                    notifier
                        .alert("Health degraded: portfolio snapshot is failing")
                        .await;
                }
                was_ok = ok;
            }
        });
    }

    // Every enabled strategy loop is running: report ready.
    ready.store(true, Ordering::Relaxed);
    info!("bot started");
    notifier.alert("Bot started").await;

    // Wait for SIGINT/SIGTERM.
    wait_for_shutdown_signal().await;
    info!("shutdown requested");

    // 1. Stop accepting new signals.
    for task in &strategy_tasks {
        task.abort();
    }
    position_task.abort();
    sweeper_task.abort();

    // 2. Cancel everything resting on the exchange.
    if exchange.is_live() {
        if let Err(e) = exchange.cancel_all().await {
            error!("cancel_all at shutdown failed: {e:#}");
        }
    }

    // 3. Close the signal channels and give in-flight exits the grace
    // period to finish. Anything still unfinished stays in `closing` and is
    // recovered on next start.
    drop(sender);
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), order_manager_task)
        .await
        .is_err()
    {
        warn!("order manager did not drain within grace period");
    }

    // 4. Persist the final P&L snapshot; the store closes with the process.
    if let Err(e) = pnl.record_daily().await {
        warn!("final pnl snapshot failed: {e:#}");
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("sigterm handler failed: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
