/// position_manager.rs – TP/SL/trailing evaluation and market resolution.
///
/// Consumes price events for tokens with open positions, decides exits with
/// a pure evaluation function, and emits exit signals through the same
/// queue every other signal uses. The `closing_positions` guard makes the
/// decision-to-emit step atomic: a position can have at most one exit in
/// flight no matter how fast prices arrive.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::database::Database;
use crate::exchange::ExchangeClient;
use crate::models::{
    Outcome, OrderType, Position, PositionStatus, PriceEvent, Signal, SignalMeta,
};
use crate::notifier::Notifier;
use crate::order_manager::SignalSender;

/// Seconds between REST price polls while the WebSocket is down.
const REST_FALLBACK_SECS: u64 = 5;
/// Seconds between market-resolution sweeps.
const RESOLUTION_POLL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Closing guard
// ---------------------------------------------------------------------------

/// In-memory set of position ids with an exit in flight.
///
/// The mutex is held only for the test-and-insert, never across I/O. An
/// entry is removed solely when the exit's terminal outcome has been
/// persisted (the order manager does that), or deliberately left in place
/// when a position stays in `closing` for startup recovery.
#[derive(Clone, Default)]
pub struct ClosingGuard(Arc<Mutex<HashSet<i64>>>);

impl ClosingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the right to emit an exit for this position.
    /// Returns false when an exit is already in flight.
    pub fn try_claim(&self, position_id: i64) -> bool {
        self.0
            .lock()
            .expect("closing set poisoned")
            .insert(position_id)
    }

    pub fn release(&self, position_id: i64) {
        self.0
            .lock()
            .expect("closing set poisoned")
            .remove(&position_id);
    }

    pub fn contains(&self, position_id: i64) -> bool {
        self.0
            .lock()
            .expect("closing set poisoned")
            .contains(&position_id)
    }
}

// ---------------------------------------------------------------------------
// Pure price evaluation
// ---------------------------------------------------------------------------

/// What a price tick means for one open position, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionAction {
    /// Persist a ratcheted trailing anchor.
    UpdateAnchor(f64),
    /// Mark a TP level fired and arm the trailing stop at this price.
    FireLevel { index: usize, arm_anchor: f64 },
    /// Emit an exit for this many shares.
    EmitExit {
        shares: f64,
        reason: &'static str,
        full: bool,
    },
}

/// Decide what to do with `position` at `price`. Pure; the caller applies
/// the actions. Checks run stop-loss first, then the trailing stop, then
/// one TP tier at most per tick.
pub fn evaluate_position(position: &Position, price: f64) -> Vec<PositionAction> {
    let mut actions = Vec::new();
    if position.status != PositionStatus::Open || position.shares <= 0.0 {
        return actions;
    }

    // Stop-loss in the adverse direction.
    if let Some(sl) = position.sl_price {
        if position.is_adverse(price, sl) {
            actions.push(PositionAction::EmitExit {
                shares: position.shares,
                reason: "stop_loss",
                full: true,
            });
            return actions;
        }
    }

    // Trailing stop: trigger on an adverse retrace from the anchor,
    // otherwise ratchet the anchor favorably.
    if position.trail_anchor.is_some() {
        if position.trail_triggered(price) {
            actions.push(PositionAction::EmitExit {
                shares: position.shares,
                reason: "trailing_stop",
                full: true,
            });
            return actions;
        }
        let mut probe = position.clone();
        if let Some(anchor) = probe.ratchet_trail_anchor(price) {
            actions.push(PositionAction::UpdateAnchor(anchor));
        }
    }

    // First unfired TP tier whose trigger is reached, favorable direction.
    for (index, level) in position.tp_levels.iter().enumerate() {
        if level.fired {
            continue;
        }
        let reached = match position.side {
            crate::models::PositionSide::Long => price >= level.trigger_price,
            crate::models::PositionSide::Short => price <= level.trigger_price,
        };
        if !reached {
            continue;
        }
        let full = level.fraction_to_sell >= 1.0;
        if !full && position.trail_anchor.is_none() {
            actions.push(PositionAction::FireLevel {
                index,
                arm_anchor: price,
            });
        } else if !full {
            actions.push(PositionAction::FireLevel {
                index,
                arm_anchor: position.trail_anchor.unwrap_or(price),
            });
        }
        actions.push(PositionAction::EmitExit {
            shares: position.shares * level.fraction_to_sell.min(1.0),
            reason: "take_profit",
            full,
        });
        break; // one tier per price update
    }

    actions
}

// ---------------------------------------------------------------------------
// PositionManager
// ---------------------------------------------------------------------------

pub struct PositionManager {
    db: Arc<Database>,
    exchange: Arc<ExchangeClient>,
    sender: SignalSender,
    closing: ClosingGuard,
}

impl PositionManager {
    pub fn new(
        db: Arc<Database>,
        exchange: Arc<ExchangeClient>,
        sender: SignalSender,
        closing: ClosingGuard,
    ) -> Self {
        Self {
            db,
            exchange,
            sender,
            closing,
        }
    }

    /// Main loop: consume price events; while the WebSocket is down, poll
    /// prices over REST for every token we hold so exits keep working.
    pub async fn run_price_loop(
        mut self,
        mut events: mpsc::Receiver<PriceEvent>,
        connected: watch::Receiver<bool>,
    ) {
        info!("position manager started");
        let mut fallback = tokio::time::interval(Duration::from_secs(REST_FALLBACK_SECS));
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.on_price_event(&event).await {
                                error!("price event handling failed: {e:#}");
                            }
                        }
                        None => break,
                    }
                }
                _ = fallback.tick() => {
                    if !*connected.borrow() {
                        if let Err(e) = self.rest_poll_prices().await {
                            warn!("rest price fallback failed: {e:#}");
                        }
                    }
                }
            }
        }
        info!("position manager stopped");
    }

    /// Evaluate every open position on this token at the new price.
    pub async fn on_price_event(&mut self, event: &PriceEvent) -> Result<()> {
        let positions = self.db.get_open_positions(None)?;
        for position in positions {
            if position.token_id != event.token_id {
                continue;
            }
            self.db.update_position_price(position.id, event.price)?;

            if position.status != PositionStatus::Open {
                continue; // exit already in flight
            }
            let actions = evaluate_position(&position, event.price);
            self.apply_actions(&position, event.price, actions).await?;
        }
        Ok(())
    }

    async fn apply_actions(
        &mut self,
        position: &Position,
        price: f64,
        actions: Vec<PositionAction>,
    ) -> Result<()> {
        for action in actions {
            match action {
                PositionAction::UpdateAnchor(anchor) => {
                    self.db.set_trail_anchor(position.id, anchor)?;
                }
                PositionAction::FireLevel { index, arm_anchor } => {
                    let mut levels = position.tp_levels.clone();
                    if let Some(level) = levels.get_mut(index) {
                        level.fired = true;
                    }
                    self.db.set_tp_levels(position.id, &levels)?;
                    if position.trail_anchor.is_none() {
                        self.db.set_trail_anchor(position.id, arm_anchor)?;
                        info!(
                            position_id = position.id,
                            anchor = arm_anchor,
                            "trailing stop armed"
                        );
                    }
                }
                PositionAction::EmitExit { shares, reason, full } => {
                    self.emit_exit(position, price, shares, reason, full).await?;
                }
            }
        }
        Ok(())
    }

    /// Emit one exit signal, guarded against duplicates.
    ///
    /// The test-and-insert on the closing set and the persisted
    /// open → closing transition happen before the signal is queued; rapid
    /// back-to-back ticks find the claim taken and skip.
    async fn emit_exit(
        &mut self,
        position: &Position,
        price: f64,
        shares: f64,
        reason: &'static str,
        _full: bool,
    ) -> Result<()> {
        if !self.closing.try_claim(position.id) {
            return Ok(());
        }
        self.db.mark_position_closing(position.id)?;

        let signal = Signal::new(
            position.strategy,
            position.market_id.clone(),
            position.token_id.clone(),
            position.outcome,
            position.side.exit_order_side(),
            shares * price,
            price,
            OrderType::Fok,
            format!("position exit: {reason}"),
        )
        .with_meta(SignalMeta {
            is_exit: true,
            parent_position_id: Some(position.id),
            ..Default::default()
        });

        info!(
            position_id = position.id,
            reason,
            shares,
            price,
            "emitting exit signal"
        );
        self.sender.submit(signal).await;
        Ok(())
    }

    /// REST fallback while the WebSocket is down: fetch a price for every
    /// held token and run the normal evaluation on it.
    async fn rest_poll_prices(&mut self) -> Result<()> {
        let positions = self.db.get_open_positions(None)?;
        let mut seen = HashSet::new();
        for position in &positions {
            if !seen.insert(position.token_id.clone()) {
                continue;
            }
            match self.exchange.price(&position.token_id).await {
                Ok(price) => {
                    let event = PriceEvent {
                        token_id: position.token_id.clone(),
                        price,
                        timestamp: chrono::Utc::now(),
                    };
                    self.on_price_event(&event).await?;
                }
                Err(e) => warn!(
                    token = %position.token_id,
                    "rest price fetch failed: {e:#}"
                ),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolution sweep
// ---------------------------------------------------------------------------

/// Poll markets for held positions; settle any that resolved at the winning
/// outcome's payout (1.0 for the winner, 0.0 for the loser) less the
/// resolution fee on winnings.
pub struct ResolutionSweeper {
    pub settings: Settings,
    pub db: Arc<Database>,
    pub exchange: Arc<ExchangeClient>,
    pub notifier: Arc<Notifier>,
    pub closing: ClosingGuard,
}

impl ResolutionSweeper {
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(RESOLUTION_POLL_SECS));
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                warn!("resolution sweep failed: {e:#}");
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<()> {
        let positions = self.db.get_open_positions(None)?;
        let mut markets: HashSet<String> = HashSet::new();
        for p in &positions {
            markets.insert(p.market_id.clone());
        }

        for market_id in markets {
            let market = match self.exchange.market(&market_id).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(market = %market_id, "market fetch failed: {e:#}");
                    continue;
                }
            };
            if !market.resolved {
                continue;
            }
            let Some(winner) = market.winning_outcome else {
                continue;
            };

            for position in positions.iter().filter(|p| p.market_id == market_id) {
                if let Err(e) = self.settle_position(position, winner).await {
                    error!(
                        position_id = position.id,
                        "resolution settle failed: {e:#}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Synthetic close: no exchange order exists for a resolution, so the
    /// settlement trade row and the position update commit together.
    async fn settle_position(&self, position: &Position, winner: Outcome) -> Result<()> {
        // Skip a position whose exit is mid-flight; the next sweep catches
        // it if the exit dies.
        if !self.closing.try_claim(position.id) {
            return Ok(());
        }

        let payout = if position.outcome == winner { 1.0 } else { 0.0 };
        let winnings = ((payout - position.entry_price) * position.shares).max(0.0);
        let fee = winnings * self.settings.fees.winner_fee_pct / 100.0;
        let realized = position.realized_for_close(payout, position.shares, fee);

        self.db
            .finalize_resolution(position.id, payout, fee, realized)?;
        self.closing.release(position.id);

        info!(
            position_id = position.id,
            market = %position.market_id,
            payout,
            realized,
            "position settled at resolution"
        );
        self.notifier
            .alert(&format!(
                "Market resolved {winner}: position {} settled at {payout:.1}, P&L {realized:+.2}",
                position.id,
            ))
            .await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Startup recovery
// ---------------------------------------------------------------------------

/// Re-emit exits for positions stranded in `closing` by a previous run.
pub async fn recover_closing_positions(
    db: &Database,
    sender: &SignalSender,
    closing: &ClosingGuard,
) -> Result<usize> {
    let stranded = db.get_closing_positions()?;
    let mut recovered = 0;
    for position in stranded {
        if !closing.try_claim(position.id) {
            continue;
        }
        let price = position.current_price.unwrap_or(position.entry_price);
        let signal = Signal::new(
            position.strategy,
            position.market_id.clone(),
            position.token_id.clone(),
            position.outcome,
            position.side.exit_order_side(),
            position.shares * price,
            price,
            OrderType::Fok,
            "recovered unfinished exit at startup",
        )
        .with_meta(SignalMeta {
            is_exit: true,
            parent_position_id: Some(position.id),
            ..Default::default()
        });
        warn!(
            position_id = position.id,
            "re-emitting exit for position left in closing"
        );
        sender.submit(signal).await;
        recovered += 1;
    }
    Ok(recovered)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
