/// copy_trader.rs – Track whale wallets and replicate their trades.
///
/// Each tick polls the Data API for every tracked wallet, diffs the holdings
/// against the stored snapshot, and emits BUY entries for new/increased
/// positions and proportional SELL exits when the whale reduces or leaves.
/// A conviction filter skips small whale positions (valued at the live
/// price, not cost basis) and a slippage guard skips entries when the price
/// has already run away from the whale's entry.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::{Settings, WalletEntry};
use crate::database::Database;
use crate::exchange::{ExchangeClient, WalletHolding};
use crate::models::{OrderType, Side, Signal, SignalMeta, StrategyId, WhalePosition};
use crate::order_manager::SignalSender;
use crate::position_manager::ClosingGuard;

/// Whale size must grow by this factor before we copy an add-on buy.
const INCREASE_THRESHOLD: f64 = 1.10;
/// Whale size shrinking below this factor of the previous size is an exit.
const DECREASE_THRESHOLD: f64 = 0.70;
/// Exits smaller than this notional are not worth the fees.
const MIN_EXIT_SIZE_USD: f64 = 10.0;

// ---------------------------------------------------------------------------
// Wallet diffing (pure)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WhaleChange {
    /// New holding, or an existing one increased past the threshold.
    Entered {
        market_id: String,
        token_id: String,
        shares: f64,
        avg_price: f64,
    },
    /// Holding reduced past the threshold or removed entirely.
    Reduced {
        market_id: String,
        token_id: String,
        reduction_pct: f64,
    },
}

/// Diff the stored whale snapshot against the freshly polled holdings.
pub fn diff_wallet(prev: &[WhalePosition], current: &[WalletHolding]) -> Vec<WhaleChange> {
    let prev_by_key: HashMap<(&str, &str), &WhalePosition> = prev
        .iter()
        .map(|p| ((p.market_id.as_str(), p.token_id.as_str()), p))
        .collect();
    let current_by_key: HashMap<(&str, &str), &WalletHolding> = current
        .iter()
        .map(|h| ((h.market_id.as_str(), h.token_id.as_str()), h))
        .collect();

    let mut changes = Vec::new();

    // Exits and reductions first: freeing capital beats deploying it.
    for (key, prev_pos) in &prev_by_key {
        match current_by_key.get(key) {
            None => changes.push(WhaleChange::Reduced {
                market_id: prev_pos.market_id.clone(),
                token_id: prev_pos.token_id.clone(),
                reduction_pct: 100.0,
            }),
            Some(cur) if cur.shares < prev_pos.shares * DECREASE_THRESHOLD => {
                changes.push(WhaleChange::Reduced {
                    market_id: prev_pos.market_id.clone(),
                    token_id: prev_pos.token_id.clone(),
                    reduction_pct: (prev_pos.shares - cur.shares) / prev_pos.shares * 100.0,
                })
            }
            Some(_) => {}
        }
    }

    for (key, holding) in &current_by_key {
        match prev_by_key.get(key) {
            None => changes.push(WhaleChange::Entered {
                market_id: holding.market_id.clone(),
                token_id: holding.token_id.clone(),
                shares: holding.shares,
                avg_price: holding.avg_price,
            }),
            Some(prev_pos) if holding.shares > prev_pos.shares * INCREASE_THRESHOLD => {
                changes.push(WhaleChange::Entered {
                    market_id: holding.market_id.clone(),
                    token_id: holding.token_id.clone(),
                    shares: holding.shares,
                    avg_price: holding.avg_price,
                })
            }
            Some(_) => {}
        }
    }

    changes
}

// ---------------------------------------------------------------------------
// CopyTrader
// ---------------------------------------------------------------------------

pub struct CopyTrader {
    settings: Settings,
    db: Arc<Database>,
    exchange: Arc<ExchangeClient>,
    sender: SignalSender,
    closing: ClosingGuard,
}

impl CopyTrader {
    pub fn new(
        settings: Settings,
        db: Arc<Database>,
        exchange: Arc<ExchangeClient>,
        sender: SignalSender,
        closing: ClosingGuard,
    ) -> Self {
        Self {
            settings,
            db,
            exchange,
            sender,
            closing,
        }
    }

    /// One polling tick over every enabled wallet.
    pub async fn tick(&mut self) -> Result<()> {
        let wallets: Vec<WalletEntry> =
            self.settings.enabled_wallets().cloned().collect();
        if wallets.is_empty() {
            return Ok(());
        }
        for wallet in &wallets {
            if let Err(e) = self.process_wallet(wallet).await {
                warn!(wallet = %wallet.name, "wallet poll failed: {e:#}");
            }
        }
        Ok(())
    }

    async fn process_wallet(&mut self, wallet: &WalletEntry) -> Result<()> {
        let current = self.exchange.wallet_positions(&wallet.address).await?;
        let prev = self.db.get_whale_positions(&wallet.address)?;
        let changes = diff_wallet(&prev, &current);

        for change in &changes {
            match change {
                WhaleChange::Reduced {
                    market_id,
                    token_id,
                    reduction_pct,
                } => {
                    self.copy_exit(wallet, market_id, token_id, *reduction_pct)
                        .await?;
                }
                WhaleChange::Entered {
                    market_id,
                    token_id,
                    shares,
                    avg_price,
                } => {
                    self.copy_entry(wallet, market_id, token_id, *shares, *avg_price)
                        .await?;
                }
            }
        }

        self.persist_snapshot(wallet, &prev, &current)?;
        Ok(())
    }

    /// Whale reduced or left: scale out of our matching copy position.
    async fn copy_exit(
        &mut self,
        wallet: &WalletEntry,
        market_id: &str,
        token_id: &str,
        reduction_pct: f64,
    ) -> Result<()> {
        let ours = self.db.get_open_positions(Some(StrategyId::CopyTrader))?;
        let Some(position) = ours.iter().find(|p| {
            p.token_id == token_id && p.source_wallet.as_deref() == Some(wallet.address.as_str())
        }) else {
            return Ok(()); // never copied this one
        };

        let price = match self.exchange.price(token_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(wallet = %wallet.name, "no price for copy exit: {e:#}");
                return Ok(());
            }
        };
        let shares_to_sell = position.shares * (reduction_pct / 100.0).min(1.0);
        let exit_usd = shares_to_sell * price;
        if exit_usd < MIN_EXIT_SIZE_USD {
            return Ok(());
        }

        if !self.closing.try_claim(position.id) {
            return Ok(()); // an exit is already in flight
        }
        self.db.mark_position_closing(position.id)?;

        let signal = Signal::new(
            StrategyId::CopyTrader,
            market_id,
            token_id,
            position.outcome,
            position.side.exit_order_side(),
            exit_usd,
            price,
            OrderType::Gtc,
            format!(
                "whale exit copy {}: {reduction_pct:.0}% reduction",
                wallet.name
            ),
        )
        .with_meta(SignalMeta {
            is_exit: true,
            parent_position_id: Some(position.id),
            source_wallet: Some(wallet.address.clone()),
            ..Default::default()
        });

        info!(
            wallet = %wallet.name,
            market = %market_id,
            reduction_pct,
            "copy exit signal"
        );
        self.sender.submit(signal).await;
        Ok(())
    }

    /// Whale entered or added: size off the whale's current USD value and
    /// copy, subject to conviction, slippage and per-wallet caps.
    async fn copy_entry(
        &mut self,
        wallet: &WalletEntry,
        market_id: &str,
        token_id: &str,
        whale_shares: f64,
        whale_entry: f64,
    ) -> Result<()> {
        let price = match self.exchange.price(token_id).await {
            Ok(p) if p > 0.0 => p,
            Ok(_) | Err(_) => {
                warn!(wallet = %wallet.name, market = %market_id, "copy skip: no price");
                return Ok(());
            }
        };

        // Conviction on the live value of the whale's holding, not its cost
        // basis; stale cost basis misleads sizing.
        let whale_value_usd = whale_shares * price;
        if whale_value_usd < self.settings.copy_trader.min_whale_position_usd {
            return Ok(());
        }

        // Slippage guard: only the adverse direction (paying up) is a skip.
        if whale_entry > 0.0 {
            let slippage_pct = (price - whale_entry) / whale_entry * 100.0;
            if slippage_pct > self.settings.copy_trader.max_slippage_pct {
                info!(
                    wallet = %wallet.name,
                    market = %market_id,
                    slippage_pct,
                    "copy skip: price moved past slippage guard"
                );
                return Ok(());
            }
        }

        let mut size_usd = self.trade_size(whale_value_usd).await?;
        let deployed = self.wallet_exposure(&wallet.address)?;
        if deployed + size_usd > wallet.max_allocation_usd {
            size_usd = (wallet.max_allocation_usd - deployed).max(0.0);
        }
        if size_usd < self.settings.risk.min_position_size_usd {
            return Ok(());
        }

        // The market must tell us which outcome this token is.
        let market = self.exchange.market(market_id).await?;
        let Some(outcome) = market.outcome_of(token_id) else {
            warn!(market = %market_id, "copy skip: token not in market");
            return Ok(());
        };

        // Conservative whale edge estimate, discounted by round-trip fees.
        let fees_pct = self.settings.fees.winner_fee_pct + self.settings.fees.taker_fee_pct;
        let edge_pct = (10.0 - fees_pct).max(0.0);

        let signal = Signal::new(
            StrategyId::CopyTrader,
            market_id,
            token_id,
            outcome,
            Side::Buy,
            size_usd,
            price,
            OrderType::Gtc,
            format!(
                "copy {}: whale holds ${whale_value_usd:.0} @ entry {whale_entry:.3}",
                wallet.name
            ),
        )
        .with_meta(SignalMeta {
            source_wallet: Some(wallet.address.clone()),
            whale_entry_price: Some(whale_entry),
            edge_pct: Some(edge_pct),
            ..Default::default()
        });

        info!(
            wallet = %wallet.name,
            market = %market_id,
            size_usd,
            price,
            "copy entry signal"
        );
        self.sender.submit(signal).await;
        Ok(())
    }

    /// Sizing per config: fixed USD, % of portfolio, or % of the whale's
    /// current position value.
    async fn trade_size(&self, whale_value_usd: f64) -> Result<f64> {
        let cfg = &self.settings.copy_trader;
        let size = match cfg.sizing_method.as_str() {
            "portfolio_pct" => {
                let cash = self.exchange.usdc_balance().await?;
                let positions = self.db.get_open_positions(None)?;
                let value: f64 = positions.iter().map(|p| p.value_at(p.current_price)).sum();
                (cash + value) * cfg.portfolio_pct_per_trade / 100.0
            }
            "whale_pct" => whale_value_usd * cfg.whale_pct / 100.0,
            _ => cfg.fixed_size_usd,
        };
        Ok((size * 100.0).round() / 100.0)
    }

    /// Capital currently deployed copying this wallet.
    fn wallet_exposure(&self, address: &str) -> Result<f64> {
        let positions = self.db.get_open_positions(Some(StrategyId::CopyTrader))?;
        Ok(positions
            .iter()
            .filter(|p| p.source_wallet.as_deref() == Some(address))
            .map(|p| p.entry_price * p.shares)
            .sum())
    }

    fn persist_snapshot(
        &self,
        wallet: &WalletEntry,
        prev: &[WhalePosition],
        current: &[WalletHolding],
    ) -> Result<()> {
        let current_keys: std::collections::HashSet<(&str, &str)> = current
            .iter()
            .map(|h| (h.market_id.as_str(), h.token_id.as_str()))
            .collect();
        for old in prev {
            if !current_keys.contains(&(old.market_id.as_str(), old.token_id.as_str())) {
                self.db
                    .delete_whale_position(&wallet.address, &old.market_id, &old.token_id)?;
            }
        }
        for holding in current {
            self.db.upsert_whale_position(
                &wallet.address,
                &holding.market_id,
                &holding.token_id,
                holding.shares,
                holding.avg_price,
            )?;
        }
        Ok(())
    }

}

#[derive(Debug, Clone)]
pub struct WalletPerformance {
    pub address: String,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_pnl: f64,
}

/// Realized performance of every wallet we have copied, for reporting.
pub fn wallet_performance(db: &Database) -> Result<Vec<WalletPerformance>> {
    let closed = db.get_closed_positions(Some(StrategyId::CopyTrader))?;
    let mut by_wallet: HashMap<String, WalletPerformance> = HashMap::new();
    for p in closed {
        let Some(address) = p.source_wallet.clone() else {
            continue;
        };
        let perf = by_wallet
            .entry(address.clone())
            .or_insert_with(|| WalletPerformance {
                address,
                trades: 0,
                wins: 0,
                losses: 0,
                total_pnl: 0.0,
            });
        perf.trades += 1;
        perf.total_pnl += p.realized_pnl;
        if p.realized_pnl > 0.0 {
            perf.wins += 1;
        } else if p.realized_pnl < 0.0 {
            perf.losses += 1;
        }
    }
    let mut out: Vec<WalletPerformance> = by_wallet.into_values().collect();
    out.sort_by(|a, b| {
        b.total_pnl
            .partial_cmp(&a.total_pnl)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn whale(market: &str, token: &str, shares: f64) -> WhalePosition {
        WhalePosition {
            wallet_address: "0xwhale".into(),
            market_id: market.into(),
            token_id: token.into(),
            shares,
            avg_price: 0.40,
            last_seen_at: Utc::now(),
        }
    }

    fn holding(market: &str, token: &str, shares: f64) -> WalletHolding {
        WalletHolding {
            market_id: market.into(),
            token_id: token.into(),
            shares,
            avg_price: 0.40,
        }
    }

    #[test]
    fn new_holding_detected_as_entry() {
        let changes = diff_wallet(&[], &[holding("m1", "t1", 1000.0)]);
        assert_eq!(
            changes,
            vec![WhaleChange::Entered {
                market_id: "m1".into(),
                token_id: "t1".into(),
                shares: 1000.0,
                avg_price: 0.40,
            }]
        );
    }

    #[test]
    fn unchanged_holding_is_quiet() {
        let changes = diff_wallet(&[whale("m1", "t1", 1000.0)], &[holding("m1", "t1", 1000.0)]);
        assert!(changes.is_empty());
    }

    #[test]
    fn small_increase_below_threshold_ignored() {
        let changes = diff_wallet(&[whale("m1", "t1", 1000.0)], &[holding("m1", "t1", 1050.0)]);
        assert!(changes.is_empty());
    }

    #[test]
    fn significant_increase_detected() {
        let changes = diff_wallet(&[whale("m1", "t1", 1000.0)], &[holding("m1", "t1", 1200.0)]);
        assert!(matches!(changes[0], WhaleChange::Entered { shares, .. } if shares == 1200.0));
    }

    #[test]
    fn removed_holding_is_full_reduction() {
        let changes = diff_wallet(&[whale("m1", "t1", 1000.0)], &[]);
        assert_eq!(
            changes,
            vec![WhaleChange::Reduced {
                market_id: "m1".into(),
                token_id: "t1".into(),
                reduction_pct: 100.0,
            }]
        );
    }

    #[test]
    fn partial_reduction_past_threshold_detected() {
        let changes = diff_wallet(&[whale("m1", "t1", 1000.0)], &[holding("m1", "t1", 500.0)]);
        match &changes[0] {
            WhaleChange::Reduced { reduction_pct, .. } => {
                assert!((reduction_pct - 50.0).abs() < 1e-9)
            }
            other => panic!("expected reduction, got {other:?}"),
        }
    }

    #[test]
    fn small_reduction_below_threshold_ignored() {
        // 20% trim does not cross the 30% exit threshold.
        let changes = diff_wallet(&[whale("m1", "t1", 1000.0)], &[holding("m1", "t1", 800.0)]);
        assert!(changes.is_empty());
    }

    #[test]
    fn reductions_reported_before_entries() {
        let prev = vec![whale("m1", "t1", 1000.0)];
        let current = vec![holding("m2", "t2", 2000.0)];
        let changes = diff_wallet(&prev, &current);
        assert!(matches!(changes[0], WhaleChange::Reduced { .. }));
        assert!(matches!(changes[1], WhaleChange::Entered { .. }));
    }
}
