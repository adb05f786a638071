/// order_manager.rs – The single execution path for every trading signal.
///
/// Strategies never call the exchange; they submit signals here. One worker
/// pops signals (exit channel first), runs the risk gate, converts USD to
/// shares exactly once, submits through the rate-limited adapter, confirms
/// the fill, persists order + position + fills in one transaction and emits
/// alerts. Failed exits retry with exponential backoff; failed entries are
/// dropped. Arb legs are paired so a dead second leg triggers an unwind of
/// the first.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::database::{Database, FillRow, NewOrder, NewPosition};
use crate::exchange::{ExchangeClient, OrderArgs};
use crate::models::{
    OrderStatus, OrderType, PositionSide, PositionStatus, Side, Signal, SignalMeta, StrategyId,
    TpLevel,
};
use crate::notifier::Notifier;
use crate::pnl::PnlTracker;
use crate::position_manager::ClosingGuard;
use crate::risk::{KillSwitch, RiskGate, RiskInputs};

/// Exchange share tick: sizes are rounded down to this granularity.
const SHARE_TICK: f64 = 0.01;
/// Orders below this many shares are rejected before submission.
const MIN_SHARES: f64 = 5.0;
/// Reserved capacity for the exit channel; exits are never dropped.
const EXIT_QUEUE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Signal submission handle
// ---------------------------------------------------------------------------

/// Cloneable handle strategies use to submit signals.
///
/// Entries go on the bounded queue and are dropped (with a warning) on
/// overflow. Exits travel on a separate reserved channel and are always
/// enqueued; the worker drains exits before entries.
#[derive(Clone)]
pub struct SignalSender {
    entry_tx: mpsc::Sender<Signal>,
    exit_tx: mpsc::Sender<Signal>,
}

impl SignalSender {
    /// Build a sender together with its two receiving ends. The order
    /// manager normally consumes the receivers; tests can hold them to
    /// observe exactly what was queued.
    pub fn channel(
        entry_capacity: usize,
    ) -> (Self, mpsc::Receiver<Signal>, mpsc::Receiver<Signal>) {
        let (entry_tx, entry_rx) = mpsc::channel(entry_capacity);
        let (exit_tx, exit_rx) = mpsc::channel(EXIT_QUEUE_CAPACITY);
        (Self { entry_tx, exit_tx }, entry_rx, exit_rx)
    }

    pub async fn submit(&self, signal: Signal) -> bool {
        if signal.is_exit() {
            if self.exit_tx.send(signal).await.is_err() {
                error!("exit channel closed, exit signal lost");
                return false;
            }
            return true;
        }
        match self.entry_tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(s)) => {
                warn!(
                    strategy = %s.strategy,
                    market = %s.market_id,
                    "signal queue full, dropping entry signal"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Arb pair bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ArbLegOutcome {
    Failed,
    Filled {
        position_id: i64,
        token_id: String,
        shares: f64,
        fill_price: f64,
    },
}

// ---------------------------------------------------------------------------
// OrderManager
// ---------------------------------------------------------------------------

pub struct OrderManager {
    settings: Settings,
    db: Arc<Database>,
    exchange: Arc<ExchangeClient>,
    pnl: Arc<PnlTracker>,
    kill: Arc<KillSwitch>,
    notifier: Arc<Notifier>,
    closing: ClosingGuard,
    entry_rx: mpsc::Receiver<Signal>,
    exit_rx: mpsc::Receiver<Signal>,
    /// Clone kept for requeueing retried exits.
    exit_tx: mpsc::Sender<Signal>,
    arb_pairs: HashMap<String, ArbLegOutcome>,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        db: Arc<Database>,
        exchange: Arc<ExchangeClient>,
        pnl: Arc<PnlTracker>,
        kill: Arc<KillSwitch>,
        notifier: Arc<Notifier>,
        closing: ClosingGuard,
    ) -> (Self, SignalSender) {
        let (sender, entry_rx, exit_rx) = SignalSender::channel(settings.bot.signal_queue_capacity);
        let exit_tx = sender.exit_tx.clone();
        (
            Self {
                settings,
                db,
                exchange,
                pnl,
                kill,
                notifier,
                closing,
                entry_rx,
                exit_rx,
                exit_tx,
                arb_pairs: HashMap::new(),
            },
            sender,
        )
    }

    /// Worker loop. Exits drain before entries (biased select), which is how
    /// exit signals get their priority without reserving slots in one queue.
    ///
    /// Persistent store/pipeline failures escalate to the kill switch:
    /// trading blind on a broken store is worse than halting.
    pub async fn run(mut self) {
        info!("order manager started");
        let mut consecutive_errors = 0u32;
        loop {
            let signal = tokio::select! {
                biased;
                exit = self.exit_rx.recv() => match exit {
                    Some(s) => s,
                    None => break,
                },
                entry = self.entry_rx.recv() => match entry {
                    Some(s) => s,
                    None => break,
                },
            };
            match self.process(signal).await {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    error!(consecutive_errors, "signal processing error: {e:#}");
                    if consecutive_errors >= 5 && self.kill.activate("persistent pipeline failures").unwrap_or(true) {
                        if let Err(e) = self.exchange.cancel_all().await {
                            error!("cancel_all after pipeline failures failed: {e:#}");
                        }
                        self.notifier
                            .alert_critical(
                                "Kill switch engaged: repeated pipeline failures, orders cancelled",
                            )
                            .await;
                    }
                }
            }
        }
        info!("order manager stopped");
    }

    async fn process(&mut self, signal: Signal) -> Result<()> {
        // Fast drain path: with the kill switch on, queued entries are
        // discarded without touching the exchange. Exits keep flowing.
        if self.kill.is_active() && !signal.is_exit() {
            info!(
                strategy = %signal.strategy,
                market = %signal.market_id,
                "entry discarded: kill switch active"
            );
            return Ok(());
        }

        // Skip arb leg 2 outright when leg 1 already failed.
        if let Some(pair_id) = signal.meta.arb_pair_id.clone() {
            if signal.meta.arb_leg == Some(2) {
                if let Some(ArbLegOutcome::Failed) = self.arb_pairs.get(&pair_id) {
                    info!(pair = %pair_id, "skipping arb leg 2: leg 1 did not fill");
                    self.arb_pairs.remove(&pair_id);
                    return Ok(());
                }
            }
        }

        // 1. Fresh snapshot + in-flight state, then the risk gate.
        let inputs = self.build_risk_inputs().await?;
        if let Err(rejection) = RiskGate::evaluate(&signal, &inputs, &self.settings) {
            info!(
                strategy = %signal.strategy,
                market = %signal.market_id,
                reason = %rejection,
                "signal rejected by risk gate"
            );
            self.db.record_risk_event(
                rejection.code(),
                Some(signal.strategy.as_str()),
                &rejection.to_string(),
            )?;
            // Kill-switch and loss-limit rejections are worth waking the
            // operator for; the rest are routine and stay in the log.
            if matches!(rejection.code(), "kill_switch" | "daily_loss_limit") {
                self.notifier
                    .alert(&format!("Risk limit: {rejection}"))
                    .await;
            }
            self.abort_signal(&signal).await?;
            return Ok(());
        }

        // 2. Size conversion: the one place USD notional becomes shares.
        let live_price = match self.exchange.price(&signal.token_id).await {
            Ok(p) if p > 0.0 => p,
            Ok(_) | Err(_) if signal.is_exit() => {
                warn!(market = %signal.market_id, "no live price for exit, retrying");
                self.retry_exit(signal).await;
                return Ok(());
            }
            Ok(p) => {
                warn!(market = %signal.market_id, price = p, "bad live price, entry dropped");
                self.record_arb_leg_failure(&signal).await;
                return Ok(());
            }
            Err(e) => {
                warn!(market = %signal.market_id, "price unavailable, entry dropped: {e:#}");
                self.record_arb_leg_failure(&signal).await;
                return Ok(());
            }
        };

        let mut shares = ((signal.size_usd / live_price) / SHARE_TICK).floor() * SHARE_TICK;
        if signal.is_exit() {
            // Clamp to what the position actually holds; prices move between
            // emission and submission.
            if let Some(pos_id) = signal.meta.parent_position_id {
                if let Some(pos) = self.db.get_position(pos_id)? {
                    shares = shares.min(pos.shares);
                }
            }
        }
        if shares < MIN_SHARES {
            warn!(
                market = %signal.market_id,
                shares,
                "share size below exchange minimum, dropping signal"
            );
            self.abort_signal(&signal).await?;
            self.record_arb_leg_failure(&signal).await;
            return Ok(());
        }

        // 3. Submit and persist the order row.
        let args = OrderArgs {
            token_id: signal.token_id.clone(),
            side: signal.side,
            price: signal.limit_price,
            size_shares: shares,
            order_type: signal.order_type,
        };
        let order_id = self.db.insert_order(&NewOrder {
            signal_id: &signal.id,
            exchange_order_id: None,
            strategy: signal.strategy,
            market_id: &signal.market_id,
            token_id: &signal.token_id,
            side: signal.side.as_str(),
            size_shares: shares,
            price: signal.limit_price,
            order_type: signal.order_type.as_str(),
            status: OrderStatus::Pending,
            reasoning: &signal.reasoning,
            metadata_json: Some(serde_json::to_string(&signal.meta)?),
        })?;

        let placed = match self.exchange.place_order(&args).await {
            Ok(p) => p,
            Err(e) => {
                // Exchange rejection: persist the reason, never retry entries.
                let reason = format!("{e:#}");
                warn!(market = %signal.market_id, "order submission failed: {reason}");
                self.db
                    .mark_order_terminal(order_id, OrderStatus::Rejected, Some(&reason))?;
                self.handle_unfilled(&signal, &reason).await;
                return Ok(());
            }
        };
        self.db
            .set_order_exchange_id(order_id, &placed.exchange_order_id)?;

        // Stink bids are tracked by (market, token) from the moment of
        // placement; this write is what prevents duplicate bids.
        let resting_bid =
            signal.strategy == StrategyId::StinkBidder && signal.order_type == OrderType::Gtc
                && !signal.is_exit();
        if resting_bid {
            self.db.upsert_stink_order(&crate::models::StinkOrder {
                market_id: signal.market_id.clone(),
                token_id: signal.token_id.clone(),
                exchange_order_id: placed.exchange_order_id.clone(),
                price: signal.limit_price,
                size_usd: signal.size_usd,
                placed_at: chrono::Utc::now(),
            })?;
        }

        // 4. Confirm the fill within the polling window.
        let state = self.confirm_fill(&placed.exchange_order_id).await;
        match state {
            Some(state) if state.status == OrderStatus::Filled && state.filled_shares > 0.0 => {
                self.finalize_filled(&signal, order_id, shares, &state)
                    .await?;
            }
            Some(state) if state.filled_shares > 0.0 => {
                // Partially filled then cancelled/expired: book what filled.
                self.finalize_filled(&signal, order_id, state.filled_shares, &state)
                    .await?;
                if !signal.is_exit() {
                    self.db.mark_order_terminal(
                        order_id,
                        OrderStatus::Partial,
                        state.error.as_deref(),
                    )?;
                }
            }
            Some(state) => {
                let reason = state
                    .error
                    .unwrap_or_else(|| format!("terminal status {}", state.status));
                self.db
                    .mark_order_terminal(order_id, state.status, Some(&reason))?;
                self.handle_unfilled(&signal, &reason).await;
            }
            None if resting_bid => {
                // A stink bid is supposed to rest: the reconciler owns it
                // from here on.
                info!(
                    market = %signal.market_id,
                    price = signal.limit_price,
                    "stink bid resting on the book"
                );
            }
            None => {
                // Confirmation timed out: best-effort cancel, mark failed.
                if let Err(e) = self.exchange.cancel_order(&placed.exchange_order_id).await {
                    warn!("cancel after confirm timeout failed: {e:#}");
                }
                self.db.mark_order_terminal(
                    order_id,
                    OrderStatus::Failed,
                    Some("fill confirmation timed out"),
                )?;
                self.handle_unfilled(&signal, "fill confirmation timed out")
                    .await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Risk input assembly
    // ------------------------------------------------------------------

    async fn build_risk_inputs(&self) -> Result<RiskInputs> {
        let snapshot = self.pnl.snapshot().await;
        let open = self.db.get_open_positions(None)?;

        let mut open_markets = Vec::with_capacity(open.len());
        let mut deployed: HashMap<StrategyId, f64> = HashMap::new();
        for p in &open {
            open_markets.push((p.market_id.clone(), p.strategy));
            *deployed.entry(p.strategy).or_insert(0.0) += p.entry_price * p.shares;
        }

        Ok(RiskInputs {
            kill_switch_active: self.kill.is_active(),
            snapshot,
            open_markets,
            deployed_by_strategy: deployed,
        })
    }

    // ------------------------------------------------------------------
    // Fill confirmation
    // ------------------------------------------------------------------

    /// Poll until the order reaches a terminal state or the window closes.
    async fn confirm_fill(&self, exchange_order_id: &str) -> Option<crate::exchange::OrderState> {
        let poll = Duration::from_millis(self.settings.exits.confirm_poll_ms);
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.settings.exits.confirm_timeout_secs);

        loop {
            match self.exchange.order_state(exchange_order_id).await {
                Ok(state) if state.status.is_terminal() => return Some(state),
                Ok(state) => {
                    if tokio::time::Instant::now() >= deadline {
                        // Not terminal in time; report what we saw (may carry
                        // a partial fill the caller books before cancelling).
                        if state.filled_shares > 0.0 {
                            return Some(state);
                        }
                        return None;
                    }
                }
                Err(e) => {
                    warn!("order state poll failed: {e:#}");
                    if tokio::time::Instant::now() >= deadline {
                        return None;
                    }
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    // ------------------------------------------------------------------
    // Persist + emit
    // ------------------------------------------------------------------

    async fn finalize_filled(
        &mut self,
        signal: &Signal,
        order_id: i64,
        requested_shares: f64,
        state: &crate::exchange::OrderState,
    ) -> Result<()> {
        let filled_shares = if state.filled_shares > 0.0 {
            state.filled_shares
        } else {
            requested_shares
        };
        let fill_price = state.avg_fill_price.unwrap_or(signal.limit_price);
        let fills: Vec<FillRow> = state
            .fills
            .iter()
            .map(|f| FillRow {
                exchange_trade_id: f.trade_id.clone(),
                token_id: signal.token_id.clone(),
                side: signal.side.as_str().to_string(),
                price: f.price,
                shares: f.shares,
                fee: f.fee,
            })
            .collect();

        if signal.is_exit() {
            self.finalize_exit_fill(signal, order_id, filled_shares, fill_price, state, &fills)
                .await
        } else {
            self.finalize_entry_fill(signal, order_id, filled_shares, fill_price, state, &fills)
                .await
        }
    }

    async fn finalize_entry_fill(
        &mut self,
        signal: &Signal,
        order_id: i64,
        filled_shares: f64,
        fill_price: f64,
        state: &crate::exchange::OrderState,
        fills: &[FillRow],
    ) -> Result<()> {
        let side = if signal.side == Side::Buy {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        let (tp_levels, sl_price) = exit_levels_for(fill_price, side, &self.settings);
        let position_id = self.db.finalize_entry(
            order_id,
            filled_shares,
            fill_price,
            state.fee_paid,
            fills,
            &NewPosition {
                market_id: signal.market_id.clone(),
                token_id: signal.token_id.clone(),
                outcome: signal.outcome.as_str().to_string(),
                side: side.as_str().to_string(),
                strategy: signal.strategy,
                entry_price: fill_price,
                shares: filled_shares,
                entry_fee: state.fee_paid,
                source_wallet: signal.meta.source_wallet.clone(),
                tp_levels,
                sl_price: Some(sl_price),
                trail_pct: Some(self.settings.exits.trailing_stop_pct),
            },
        )?;

        // A stink bid that filled inside the confirmation window is a
        // position now, not a resting order.
        if signal.strategy == StrategyId::StinkBidder {
            self.db
                .delete_stink_order(&signal.market_id, &signal.token_id)?;
        }

        // The position manager discovers the position through the store; the
        // subscription is what starts its price events flowing.
        self.exchange.subscribe(vec![signal.token_id.clone()]);

        info!(
            position_id,
            strategy = %signal.strategy,
            market = %signal.market_id,
            shares = filled_shares,
            price = fill_price,
            "position opened"
        );
        self.notifier
            .alert(&format!(
                "Position opened: {} {} {:.1} shares @ {:.4} (${:.2})",
                signal.strategy,
                signal.outcome,
                filled_shares,
                fill_price,
                filled_shares * fill_price,
            ))
            .await;

        if let Some(pair_id) = signal.meta.arb_pair_id.clone() {
            self.record_arb_leg_fill(signal, &pair_id, position_id, filled_shares, fill_price)
                .await;
        }
        Ok(())
    }

    async fn finalize_exit_fill(
        &mut self,
        signal: &Signal,
        order_id: i64,
        filled_shares: f64,
        fill_price: f64,
        state: &crate::exchange::OrderState,
        fills: &[FillRow],
    ) -> Result<()> {
        let Some(position_id) = signal.meta.parent_position_id else {
            warn!("exit signal without parent position, order {order_id} booked orphan");
            return Ok(());
        };
        let Some(position) = self.db.get_position(position_id)? else {
            // Guard entry exists but the store does not know the position.
            error!(position_id, "exit filled for unknown position, skipping update");
            self.closing.release(position_id);
            return Ok(());
        };

        let shares_closed = filled_shares.min(position.shares);
        let realized = position.realized_for_close(fill_price, shares_closed, state.fee_paid);
        let full_close = shares_closed >= position.shares - SHARE_TICK;

        self.db.finalize_exit(
            order_id,
            position_id,
            shares_closed,
            fill_price,
            state.fee_paid,
            realized,
            full_close,
            PositionStatus::Closed,
            &signal.reasoning,
            fills,
        )?;
        // Terminal outcome persisted: the position may emit exits again.
        self.closing.release(position_id);

        info!(
            position_id,
            shares = shares_closed,
            price = fill_price,
            realized,
            full_close,
            "position exit filled"
        );
        self.notifier
            .alert(&format!(
                "Position {}: {} {:.1} shares @ {:.4}, P&L {:+.2}",
                if full_close { "closed" } else { "partially closed" },
                signal.strategy,
                shares_closed,
                fill_price,
                realized,
            ))
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure paths
    // ------------------------------------------------------------------

    /// A signal that never reached the exchange. Exits release their claim
    /// so the position manager can try again.
    async fn abort_signal(&self, signal: &Signal) -> Result<()> {
        if let Some(position_id) = signal.meta.parent_position_id {
            if signal.is_exit() {
                self.db.reopen_position(position_id)?;
                self.closing.release(position_id);
            }
        }
        Ok(())
    }

    /// Terminal non-filled outcome after submission.
    async fn handle_unfilled(&mut self, signal: &Signal, reason: &str) {
        if signal.is_exit() {
            self.retry_exit(signal.clone()).await;
            return;
        }
        if signal.strategy == StrategyId::StinkBidder {
            if let Err(e) = self
                .db
                .delete_stink_order(&signal.market_id, &signal.token_id)
            {
                error!("stink order cleanup failed: {e:#}");
            }
        }
        self.record_arb_leg_failure(signal).await;
        info!(
            strategy = %signal.strategy,
            market = %signal.market_id,
            reason,
            "entry did not fill, dropped"
        );
    }

    /// Requeue a failed exit with exponential backoff (1s, 2s, 4s … capped),
    /// up to the attempt limit. The closing claim stays held the whole time;
    /// after the final failure the position remains `closing` and is
    /// recovered at next startup.
    async fn retry_exit(&self, mut signal: Signal) {
        signal.meta.attempt += 1;
        let attempt = signal.meta.attempt;
        let max = self.settings.exits.max_exit_attempts;

        if attempt >= max {
            error!(
                market = %signal.market_id,
                attempt,
                "exit failed terminally, position left in closing for recovery"
            );
            self.notifier
                .alert_critical(&format!(
                    "Exit for market {} failed after {attempt} attempts; \
                     position stays in closing and will be retried on restart",
                    signal.market_id,
                ))
                .await;
            return;
        }

        let backoff = Duration::from_secs(
            2u64.saturating_pow(attempt.saturating_sub(1))
                .min(self.settings.exits.retry_cap_secs),
        );
        warn!(
            market = %signal.market_id,
            attempt,
            backoff_secs = backoff.as_secs(),
            "exit not filled, requeueing"
        );
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if exit_tx.send(signal).await.is_err() {
                error!("exit channel closed, retry lost");
            }
        });
    }

    // ------------------------------------------------------------------
    // Arb pair handling
    // ------------------------------------------------------------------

    async fn record_arb_leg_fill(
        &mut self,
        signal: &Signal,
        pair_id: &str,
        position_id: i64,
        shares: f64,
        fill_price: f64,
    ) {
        match signal.meta.arb_leg {
            Some(1) => {
                self.arb_pairs.insert(
                    pair_id.to_string(),
                    ArbLegOutcome::Filled {
                        position_id,
                        token_id: signal.token_id.clone(),
                        shares,
                        fill_price,
                    },
                );
            }
            Some(2) => {
                // Both legs filled: the pair is complete and hedged.
                info!(pair = pair_id, "arb pair complete, both legs filled");
                self.arb_pairs.remove(pair_id);
            }
            _ => {}
        }
    }

    /// Leg-1 failure marks the pair so leg 2 is skipped; leg-2 failure after
    /// a filled leg 1 emits the unwind SELL. The unwind rides the exit
    /// channel, so it is retried until confirmed. FOK legs cannot partially
    /// fill, so any non-filled terminal outcome lands here.
    async fn record_arb_leg_failure(&mut self, signal: &Signal) {
        let Some(pair_id) = signal.meta.arb_pair_id.clone() else {
            return;
        };
        match signal.meta.arb_leg {
            Some(1) => {
                self.arb_pairs.insert(pair_id, ArbLegOutcome::Failed);
            }
            Some(2) => {
                let Some(ArbLegOutcome::Filled {
                    position_id,
                    token_id,
                    shares,
                    fill_price,
                }) = self.arb_pairs.remove(&pair_id)
                else {
                    return;
                };
                warn!(
                    pair = %pair_id,
                    "arb leg 2 failed with leg 1 filled, unwinding leg 1"
                );
                self.notifier
                    .alert_critical(&format!(
                        "Arb leg 2 failed on market {}; unwinding leg 1 ({:.1} shares)",
                        signal.market_id, shares,
                    ))
                    .await;

                // Accept the loss on the unwind; never hold the naked leg.
                if self.closing.try_claim(position_id) {
                    if let Err(e) = self.db.mark_position_closing(position_id) {
                        error!("marking unwind position closing failed: {e:#}");
                    }
                    let unwind = Signal::new(
                        StrategyId::ArbScanner,
                        signal.market_id.clone(),
                        token_id,
                        // Leg 1 holds the other side of this binary pair.
                        signal.outcome.opposite(),
                        Side::Sell,
                        shares * fill_price,
                        fill_price,
                        crate::models::OrderType::Fok,
                        format!("arb unwind: leg 2 of pair {pair_id} failed"),
                    )
                    .with_meta(SignalMeta {
                        is_exit: true,
                        parent_position_id: Some(position_id),
                        arb_pair_id: Some(pair_id),
                        arb_unwind: true,
                        ..Default::default()
                    });
                    if self.exit_tx.send(unwind).await.is_err() {
                        error!("exit channel closed, arb unwind lost");
                    }
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Exit level computation
// ---------------------------------------------------------------------------

/// Build the TP ladder and stop-loss price for a fresh position. Triggers
/// ratchet off the entry fill price; direction follows the position side.
pub fn exit_levels_for(
    entry_price: f64,
    side: PositionSide,
    settings: &Settings,
) -> (Vec<TpLevel>, f64) {
    let sign = match side {
        PositionSide::Long => 1.0,
        PositionSide::Short => -1.0,
    };
    let tp_levels = settings
        .exits
        .take_profit_tiers
        .iter()
        .map(|tier| TpLevel {
            trigger_price: (entry_price * (1.0 + sign * tier.gain_pct / 100.0)).clamp(0.0, 1.0),
            fraction_to_sell: tier.sell_pct / 100.0,
            fired: false,
        })
        .collect();
    let sl_price =
        (entry_price * (1.0 - sign * settings.exits.stop_loss_pct / 100.0)).clamp(0.0, 1.0);
    (tp_levels, sl_price)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_rounding_floors_to_tick() {
        let size_usd = 100.0;
        let price = 0.405;
        let shares = ((size_usd / price) / SHARE_TICK).floor() * SHARE_TICK;
        // 246.913... floors to 246.91
        assert!((shares - 246.91).abs() < 1e-9);
    }

    #[test]
    fn exit_levels_long_direction() {
        let settings = Settings::default();
        let (tps, sl) = exit_levels_for(0.40, PositionSide::Long, &settings);
        assert_eq!(tps.len(), 2);
        // 50% gain tier: 0.40 * 1.5 = 0.60
        assert!((tps[0].trigger_price - 0.60).abs() < 1e-9);
        assert!((tps[0].fraction_to_sell - 0.5).abs() < 1e-9);
        // stop at 30% below entry
        assert!((sl - 0.28).abs() < 1e-9);
        assert!(tps.iter().all(|t| !t.fired));
    }

    #[test]
    fn exit_levels_short_direction_inverts() {
        let settings = Settings::default();
        let (tps, sl) = exit_levels_for(0.40, PositionSide::Short, &settings);
        // Short profits down: first tier below entry, stop above.
        assert!(tps[0].trigger_price < 0.40);
        assert!(sl > 0.40);
    }

    #[test]
    fn exit_levels_clamped_to_price_range() {
        let settings = Settings::default();
        let (tps, _) = exit_levels_for(0.80, PositionSide::Long, &settings);
        // 100% gain tier would be 1.60; clamped to 1.0
        assert!(tps[1].trigger_price <= 1.0);
    }
}
