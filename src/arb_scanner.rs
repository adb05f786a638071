/// arb_scanner.rs – Parity arbitrage over YES/NO token pairs.
///
/// Every binary market should price Yes + No at $1.00. When the live best
/// asks sum below 1 − margin the pair is bought on both sides with FOK
/// orders; resolution then pays exactly $1 per unit. Fees are charged per
/// leg on the dollar cost plus the winner fee on the payout, so the scanner
/// prices both in before calling anything an opportunity. Every detected
/// opportunity is logged, executable or not.
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::exchange::ExchangeClient;
use crate::models::{Market, Outcome, OrderType, Side, Signal, SignalMeta, StrategyId};
use crate::order_manager::SignalSender;

/// Opportunities below this estimated profit are logged but not executed.
const MIN_PROFIT_USD: f64 = 0.50;

// ---------------------------------------------------------------------------
// Opportunity math (pure)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArbOpportunity {
    pub ask_yes: f64,
    pub ask_no: f64,
    pub total_price: f64,
    /// 1.0 − total_price; positive means the pair trades below parity.
    pub gap: f64,
    pub per_unit_profit: f64,
    pub estimated_profit_pct: f64,
    pub estimated_profit_usd: f64,
    pub size_usd: f64,
    pub executable: bool,
    pub reason_skipped: Option<&'static str>,
}

/// Evaluate one market's live asks. Returns None when there is no gap at
/// all; an unexecutable opportunity (gap exists, profit doesn't survive
/// fees or minimums) is still returned so it can be logged.
pub fn evaluate_pair(
    ask_yes: f64,
    ask_no: f64,
    taker_fee_rate: f64,
    winner_fee_rate: f64,
    margin: f64,
    size_usd: f64,
    min_size_usd: f64,
) -> Option<ArbOpportunity> {
    if ask_yes <= 0.0 || ask_no <= 0.0 || ask_yes >= 1.0 || ask_no >= 1.0 {
        return None;
    }
    let total_price = ask_yes + ask_no;
    if total_price >= 1.0 - margin {
        return None;
    }

    // Per unit (one YES + one NO): taker fee applies to each leg's dollar
    // cost, the winner fee to the $1.00 payout at resolution.
    let per_unit_cost = total_price * (1.0 + taker_fee_rate);
    let per_unit_payout = 1.0 - winner_fee_rate;
    let per_unit_profit = per_unit_payout - per_unit_cost;

    let units = size_usd / total_price;
    let estimated_profit_usd = per_unit_profit * units;
    let estimated_profit_pct = if per_unit_cost > 0.0 {
        per_unit_profit / per_unit_cost * 100.0
    } else {
        0.0
    };

    let (executable, reason_skipped) = if per_unit_profit <= 0.0 {
        (false, Some("negative_profit_after_fees"))
    } else if estimated_profit_usd < MIN_PROFIT_USD {
        (false, Some("profit_too_small"))
    } else if size_usd < min_size_usd {
        (false, Some("below_min_position"))
    } else {
        (true, None)
    };

    Some(ArbOpportunity {
        ask_yes,
        ask_no,
        total_price,
        gap: 1.0 - total_price,
        per_unit_profit,
        estimated_profit_pct,
        estimated_profit_usd,
        size_usd,
        executable,
        reason_skipped,
    })
}

/// Build the two FOK legs for an executable opportunity. The shared pair id
/// lets the order manager skip leg 2 when leg 1 dies and unwind leg 1 when
/// leg 2 dies.
pub fn pair_signals(market: &Market, opp: &ArbOpportunity) -> (Signal, Signal) {
    let pair_id = format!("arb_{}", Uuid::new_v4());
    let leg_usd = opp.size_usd / 2.0;
    let reasoning = format!(
        "parity arb: yes {:.4} + no {:.4} = {:.4}, gap {:.4}",
        opp.ask_yes, opp.ask_no, opp.total_price, opp.gap
    );

    let leg1 = Signal::new(
        StrategyId::ArbScanner,
        market.condition_id.clone(),
        market.yes_token_id.clone(),
        Outcome::Yes,
        Side::Buy,
        leg_usd,
        opp.ask_yes,
        OrderType::Fok,
        reasoning.clone(),
    )
    .with_meta(SignalMeta {
        arb_pair_id: Some(pair_id.clone()),
        arb_leg: Some(1),
        edge_pct: Some(opp.estimated_profit_pct),
        ..Default::default()
    });

    let leg2 = Signal::new(
        StrategyId::ArbScanner,
        market.condition_id.clone(),
        market.no_token_id.clone(),
        Outcome::No,
        Side::Buy,
        leg_usd,
        opp.ask_no,
        OrderType::Fok,
        reasoning,
    )
    .with_meta(SignalMeta {
        arb_pair_id: Some(pair_id),
        arb_leg: Some(2),
        edge_pct: Some(opp.estimated_profit_pct),
        ..Default::default()
    });

    (leg1, leg2)
}

// ---------------------------------------------------------------------------
// ArbScanner
// ---------------------------------------------------------------------------

pub struct ArbScanner {
    settings: Settings,
    exchange: Arc<ExchangeClient>,
    sender: SignalSender,
    opportunities_seen: u64,
    executed: u64,
}

impl ArbScanner {
    pub fn new(settings: Settings, exchange: Arc<ExchangeClient>, sender: SignalSender) -> Self {
        Self {
            settings,
            exchange,
            sender,
            opportunities_seen: 0,
            executed: 0,
        }
    }

    /// One scan over the active markets using live order books — never the
    /// Gamma aggregate prices, which lag the book.
    pub async fn tick(&mut self) -> Result<()> {
        let markets = self
            .exchange
            .active_markets(self.settings.arb_scanner.max_markets_per_scan)
            .await?;
        if markets.is_empty() {
            debug!("arb scan: no active markets");
            return Ok(());
        }

        for market in &markets {
            if market.closed || market.resolved {
                continue;
            }
            if let Err(e) = self.scan_market(market).await {
                debug!(market = %market.condition_id, "arb scan failed: {e:#}");
            }
        }
        Ok(())
    }

    async fn scan_market(&mut self, market: &Market) -> Result<()> {
        let yes_book = self.exchange.orderbook(&market.yes_token_id).await?;
        let no_book = self.exchange.orderbook(&market.no_token_id).await?;
        let (Some(ask_yes), Some(ask_no)) = (yes_book.best_ask(), no_book.best_ask()) else {
            return Ok(());
        };

        let cfg = &self.settings.arb_scanner;
        let Some(opp) = evaluate_pair(
            ask_yes,
            ask_no,
            self.settings.fees.taker_fee_pct / 100.0,
            self.settings.fees.winner_fee_pct / 100.0,
            cfg.margin,
            cfg.size_usd,
            self.settings.risk.min_position_size_usd,
        ) else {
            return Ok(());
        };

        // Log every opportunity, including the ones we cannot execute.
        self.opportunities_seen += 1;
        info!(
            market = %market.condition_id,
            question = %market.question.chars().take(60).collect::<String>(),
            ask_yes = opp.ask_yes,
            ask_no = opp.ask_no,
            total = opp.total_price,
            gap = opp.gap,
            profit_pct = opp.estimated_profit_pct,
            profit_usd = opp.estimated_profit_usd,
            executable = opp.executable,
            skipped = opp.reason_skipped.unwrap_or(""),
            "arb opportunity detected"
        );
        if !opp.executable {
            return Ok(());
        }

        let (leg1, leg2) = pair_signals(market, &opp);
        if !self.sender.submit(leg1).await {
            warn!(market = %market.condition_id, "arb leg 1 dropped at queue, aborting pair");
            return Ok(());
        }
        self.sender.submit(leg2).await;
        self.executed += 1;
        Ok(())
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.opportunities_seen, self.executed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TAKER: f64 = 0.0315;
    const WINNER: f64 = 0.02;

    #[test]
    fn no_opportunity_at_parity() {
        assert!(evaluate_pair(0.50, 0.50, TAKER, WINNER, 0.05, 100.0, 10.0).is_none());
    }

    #[test]
    fn no_opportunity_when_gap_within_margin() {
        // 0.48 + 0.49 = 0.97 >= 1 - 0.05
        assert!(evaluate_pair(0.48, 0.49, TAKER, WINNER, 0.05, 100.0, 10.0).is_none());
    }

    #[test]
    fn wide_gap_is_executable() {
        // 0.45 + 0.45 = 0.90: cost/unit 0.92835, payout 0.98
        let opp = evaluate_pair(0.45, 0.45, TAKER, WINNER, 0.05, 100.0, 10.0).unwrap();
        assert!(opp.executable, "skipped: {:?}", opp.reason_skipped);
        assert!((opp.gap - 0.10).abs() < 1e-9);
        assert!(opp.per_unit_profit > 0.0);
        // 100 USD / 0.90 = 111.1 units * per-unit profit
        assert!(opp.estimated_profit_usd > 5.0);
    }

    #[test]
    fn fees_are_per_leg_on_cost_not_compounded() {
        let opp = evaluate_pair(0.45, 0.45, TAKER, WINNER, 0.05, 100.0, 10.0).unwrap();
        let expected_cost = 0.90 * (1.0 + TAKER);
        let expected_profit = (1.0 - WINNER) - expected_cost;
        assert!((opp.per_unit_profit - expected_profit).abs() < 1e-12);
    }

    #[test]
    fn thin_gap_eaten_by_fees_not_executable() {
        // 0.47 + 0.47 = 0.94 clears a 0.05 margin barely, but fees take it:
        // cost/unit = 0.94 * 1.0315 = 0.9696, payout 0.98 -> profit ~0.0104,
        // on 10 units (~$10) that's ~$0.11 < the $0.50 floor.
        let opp = evaluate_pair(0.47, 0.47, TAKER, WINNER, 0.051, 10.0, 5.0).unwrap();
        assert!(!opp.executable);
        assert_eq!(opp.reason_skipped, Some("profit_too_small"));
    }

    #[test]
    fn degenerate_prices_rejected() {
        assert!(evaluate_pair(0.0, 0.45, TAKER, WINNER, 0.05, 100.0, 10.0).is_none());
        assert!(evaluate_pair(0.45, 1.0, TAKER, WINNER, 0.05, 100.0, 10.0).is_none());
    }

    #[test]
    fn pair_signals_share_pair_id_and_split_size() {
        let market = Market {
            condition_id: "m1".into(),
            question: "?".into(),
            yes_token_id: "ty".into(),
            no_token_id: "tn".into(),
            active: true,
            closed: false,
            resolved: false,
            winning_outcome: None,
            yes_price: None,
            no_price: None,
            volume_usd: None,
        };
        let opp = evaluate_pair(0.45, 0.44, TAKER, WINNER, 0.05, 100.0, 10.0).unwrap();
        let (leg1, leg2) = pair_signals(&market, &opp);

        assert_eq!(leg1.meta.arb_pair_id, leg2.meta.arb_pair_id);
        assert_eq!(leg1.meta.arb_leg, Some(1));
        assert_eq!(leg2.meta.arb_leg, Some(2));
        assert_eq!(leg1.token_id, "ty");
        assert_eq!(leg2.token_id, "tn");
        assert_eq!(leg1.order_type, OrderType::Fok);
        assert!((leg1.size_usd - 50.0).abs() < 1e-9);
        assert!((leg2.size_usd - 50.0).abs() < 1e-9);
        assert!(!leg1.is_exit() && !leg2.is_exit());
    }
}
