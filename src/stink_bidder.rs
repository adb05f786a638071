/// stink_bidder.rs – Deep-discount resting bids and their reconciler.
///
/// Keeps a bounded set of GTC buys far below the market, hoping to catch a
/// fat-finger cross or a liquidity crash. The `stink_orders` table is the
/// source of truth: the order manager writes a row when a bid is placed, and
/// each tick reconciles the table against the exchange's open orders —
/// rows that vanished were filled (book the position) or cancelled (free the
/// slot), and freed slots are refilled subject to the allocation cap.
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tracing::{info, warn};

use crate::config::Settings;
use crate::database::{Database, FillRow, NewPosition};
use crate::exchange::ExchangeClient;
use crate::models::{Market, OrderType, PositionSide, Side, Signal, StrategyId};
use crate::notifier::Notifier;
use crate::order_manager::{exit_levels_for, SignalSender};
use crate::pnl::PnlTracker;
use crate::risk::SnapshotState;

/// Hard ceiling on any stink bid price; a "discount" above this is not a
/// stink bid.
const MAX_STINK_PRICE: f64 = 0.10;
const MIN_STINK_PRICE: f64 = 0.01;

/// Compute the bid price for a stink order: `discount_pct` below the
/// reference price, clamped into the stink band and rounded to the tick.
pub fn stink_price(reference_price: f64, discount_pct: f64) -> f64 {
    let raw = reference_price * (1.0 - discount_pct / 100.0);
    let clamped = raw.clamp(MIN_STINK_PRICE, MAX_STINK_PRICE);
    (clamped * 1000.0).round() / 1000.0
}

pub struct StinkBidder {
    settings: Settings,
    db: Arc<Database>,
    exchange: Arc<ExchangeClient>,
    sender: SignalSender,
    pnl: Arc<PnlTracker>,
    notifier: Arc<Notifier>,
}

impl StinkBidder {
    pub fn new(
        settings: Settings,
        db: Arc<Database>,
        exchange: Arc<ExchangeClient>,
        sender: SignalSender,
        pnl: Arc<PnlTracker>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            settings,
            db,
            exchange,
            sender,
            pnl,
            notifier,
        }
    }

    pub async fn tick(&mut self) -> Result<()> {
        self.reconcile().await?;
        self.place_new_bids().await?;
        Ok(())
    }

    /// Compare the table against the exchange's open orders. A tracked bid
    /// missing from the book either filled (run the normal entry
    /// bookkeeping: position with TP/SL attached) or was cancelled/expired
    /// (drop the row so the slot can be refilled).
    async fn reconcile(&mut self) -> Result<()> {
        let tracked = self.db.get_stink_orders()?;
        if tracked.is_empty() {
            return Ok(());
        }
        let open: HashSet<String> = self
            .exchange
            .open_orders()
            .await?
            .into_iter()
            .map(|o| o.exchange_order_id)
            .collect();

        for stink in tracked {
            if open.contains(&stink.exchange_order_id) {
                continue;
            }
            match self.exchange.order_state(&stink.exchange_order_id).await {
                Ok(state) if state.filled_shares > 0.0 => {
                    if let Err(e) = self.book_filled_bid(&stink, &state).await {
                        warn!(
                            market = %stink.market_id,
                            "booking filled stink bid failed: {e:#}"
                        );
                        continue; // keep the row; retry next tick
                    }
                }
                Ok(_) => {
                    info!(
                        market = %stink.market_id,
                        order_id = %stink.exchange_order_id,
                        "stink bid gone from book (cancelled/expired), slot freed"
                    );
                }
                Err(e) => {
                    warn!(
                        order_id = %stink.exchange_order_id,
                        "stink order state lookup failed: {e:#}"
                    );
                    continue;
                }
            }
            self.db
                .delete_stink_order(&stink.market_id, &stink.token_id)?;
        }
        Ok(())
    }

    /// A resting bid filled while we weren't watching: book it through the
    /// same transactional entry path the order manager uses, so the
    /// position opens with its TP/SL ladder attached.
    async fn book_filled_bid(
        &self,
        stink: &crate::models::StinkOrder,
        state: &crate::exchange::OrderState,
    ) -> Result<()> {
        let Some(order) = self
            .db
            .get_order_by_exchange_id(&stink.exchange_order_id)?
        else {
            anyhow::bail!("no order row for stink bid {}", stink.exchange_order_id);
        };

        let fill_price = state.avg_fill_price.unwrap_or(stink.price);
        let (tp_levels, sl_price) = exit_levels_for(fill_price, PositionSide::Long, &self.settings);
        let fills: Vec<FillRow> = state
            .fills
            .iter()
            .map(|f| FillRow {
                exchange_trade_id: f.trade_id.clone(),
                token_id: stink.token_id.clone(),
                side: Side::Buy.as_str().to_string(),
                price: f.price,
                shares: f.shares,
                fee: f.fee,
            })
            .collect();

        let market = self.exchange.market(&stink.market_id).await?;
        let outcome = market
            .outcome_of(&stink.token_id)
            .ok_or_else(|| anyhow::anyhow!("stink token not in market {}", stink.market_id))?;

        let position_id = self.db.finalize_entry(
            order.id,
            state.filled_shares,
            fill_price,
            state.fee_paid,
            &fills,
            &NewPosition {
                market_id: stink.market_id.clone(),
                token_id: stink.token_id.clone(),
                outcome: outcome.as_str().to_string(),
                side: PositionSide::Long.as_str().to_string(),
                strategy: StrategyId::StinkBidder,
                entry_price: fill_price,
                shares: state.filled_shares,
                entry_fee: state.fee_paid,
                source_wallet: None,
                tp_levels,
                sl_price: Some(sl_price),
                trail_pct: Some(self.settings.exits.trailing_stop_pct),
            },
        )?;
        self.exchange.subscribe(vec![stink.token_id.clone()]);

        info!(
            position_id,
            market = %stink.market_id,
            price = fill_price,
            shares = state.filled_shares,
            "stink bid filled, position opened"
        );
        self.notifier
            .alert(&format!(
                "Stink bid filled on {}: {:.1} shares @ {:.3}",
                stink.market_id, state.filled_shares, fill_price,
            ))
            .await;
        Ok(())
    }

    /// Fill free slots with new bids, respecting the strategy allocation
    /// cap. An unavailable portfolio snapshot skips placement entirely.
    async fn place_new_bids(&mut self) -> Result<()> {
        let cfg = self.settings.stink_bidder.clone();
        let tracked = self.db.get_stink_orders()?;
        if tracked.len() >= cfg.max_active_bids {
            return Ok(());
        }
        let mut slots = cfg.max_active_bids - tracked.len();

        // Allocation cap: resting bid notional plus open stink positions
        // must stay inside the strategy's share of the portfolio.
        let portfolio = match self.pnl.snapshot().await {
            SnapshotState::Ok(s) => s.total_usd(),
            SnapshotState::Unavailable(e) => {
                warn!("stink placement skipped, portfolio unknown: {e}");
                return Ok(());
            }
        };
        let cap_usd = portfolio * cfg.allocation_pct / 100.0;
        let resting: f64 = tracked.iter().map(|s| s.size_usd).sum();
        let positions: f64 = self
            .db
            .get_open_positions(Some(StrategyId::StinkBidder))?
            .iter()
            .map(|p| p.value_at(p.current_price))
            .sum();
        let mut budget = cap_usd - resting - positions;

        let occupied: HashSet<String> = tracked.into_iter().map(|s| s.market_id).collect();
        let markets = self.exchange.active_markets(100).await?;

        for market in markets {
            if slots == 0 || budget < cfg.bid_size_usd {
                break;
            }
            if market.closed || market.resolved {
                continue;
            }
            if market.volume_usd.unwrap_or(0.0) < cfg.min_market_volume_usd {
                continue;
            }
            if occupied.contains(&market.condition_id) {
                continue;
            }

            let Some(signal) = self.build_bid(&market, &cfg) else {
                continue;
            };
            if self.sender.submit(signal).await {
                slots -= 1;
                budget -= cfg.bid_size_usd;
            }
        }
        Ok(())
    }

    /// Bid the higher-priced side (the one with further to fall) at a
    /// random discount in the configured band.
    fn build_bid(
        &self,
        market: &Market,
        cfg: &crate::config::StinkBidderConfig,
    ) -> Option<Signal> {
        let yes_price = market.yes_price.unwrap_or(0.0);
        let no_price = market.no_price.unwrap_or(0.0);
        if yes_price <= 0.0 && no_price <= 0.0 {
            return None;
        }
        let (outcome, reference) = if no_price > yes_price {
            (crate::models::Outcome::No, no_price)
        } else {
            (crate::models::Outcome::Yes, yes_price)
        };
        if reference >= 1.0 {
            return None;
        }

        let discount_pct = rand::thread_rng().gen_range(cfg.min_discount_pct..=cfg.max_discount_pct);
        let price = stink_price(reference, discount_pct);

        Some(Signal::new(
            StrategyId::StinkBidder,
            market.condition_id.clone(),
            market.token_for(outcome).to_string(),
            outcome,
            Side::Buy,
            cfg.bid_size_usd,
            price,
            OrderType::Gtc,
            format!("stink bid: {discount_pct:.1}% discount on {outcome} @ {reference:.3}"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_applies_from_reference() {
        // 80% off 0.50 = 0.10, right at the ceiling
        assert!((stink_price(0.50, 80.0) - 0.10).abs() < 1e-9);
    }

    #[test]
    fn price_capped_at_ten_cents() {
        // 70% off 0.90 = 0.27, clamped
        assert!((stink_price(0.90, 70.0) - 0.10).abs() < 1e-9);
    }

    #[test]
    fn price_floored_at_one_cent() {
        // 90% off 0.05 = 0.005, floored
        assert!((stink_price(0.05, 90.0) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn price_rounds_to_tick() {
        let p = stink_price(0.333, 75.0); // 0.08325 -> 0.083
        assert!((p - 0.083).abs() < 1e-9);
    }
}
