/// risk.rs – Pre-trade risk gate and the persisted kill switch.
///
/// Every signal passes through `RiskGate::evaluate` before execution. The
/// gate is a pure synchronous function over the signal, a portfolio
/// snapshot, config and in-flight state; callers assemble `RiskInputs` and
/// branch on the typed rejection. Uncertainty is treated as failure: an
/// unknown balance or a stale snapshot rejects the trade, never approves it.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Settings;
use crate::database::{Database, KILL_SWITCH_KEY};
use crate::models::{PortfolioSnapshot, Signal, StrategyId};

// ---------------------------------------------------------------------------
// Rejection reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RiskRejection {
    KillSwitch,
    BalanceUnknown { error: String },
    PortfolioUnknown { age_secs: f64, max_secs: f64 },
    DailyLossLimit { loss_usd: f64, limit_usd: f64 },
    InsufficientCash { post_trade_cash: f64, reserve_usd: f64 },
    ExceedsPositionLimit { size_usd: f64, max_usd: f64 },
    TooManyPositions { open: usize, max: usize },
    ExceedsStrategyAllocation { deployed_usd: f64, size_usd: f64, cap_usd: f64 },
    DuplicateMarket { market_id: String, holder: StrategyId },
    BelowMinEdge { edge_pct: f64, min_pct: f64 },
}

impl RiskRejection {
    /// Short code for logs and risk-event rows.
    pub fn code(&self) -> &'static str {
        match self {
            RiskRejection::KillSwitch => "kill_switch",
            RiskRejection::BalanceUnknown { .. } => "balance_unknown",
            RiskRejection::PortfolioUnknown { .. } => "portfolio_unknown",
            RiskRejection::DailyLossLimit { .. } => "daily_loss_limit",
            RiskRejection::InsufficientCash { .. } => "insufficient_cash",
            RiskRejection::ExceedsPositionLimit { .. } => "exceeds_position_limit",
            RiskRejection::TooManyPositions { .. } => "too_many_positions",
            RiskRejection::ExceedsStrategyAllocation { .. } => "exceeds_strategy_allocation",
            RiskRejection::DuplicateMarket { .. } => "duplicate_market",
            RiskRejection::BelowMinEdge { .. } => "below_min_edge",
        }
    }
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskRejection::KillSwitch => write!(f, "kill switch active"),
            RiskRejection::BalanceUnknown { error } => {
                write!(f, "balance unknown (fail closed): {error}")
            }
            RiskRejection::PortfolioUnknown { age_secs, max_secs } => {
                write!(f, "portfolio snapshot stale: {age_secs:.1}s > {max_secs:.1}s")
            }
            RiskRejection::DailyLossLimit { loss_usd, limit_usd } => {
                write!(f, "daily loss limit: ${loss_usd:.2} >= ${limit_usd:.2}")
            }
            RiskRejection::InsufficientCash { post_trade_cash, reserve_usd } => {
                write!(f, "cash reserve: ${post_trade_cash:.2} < ${reserve_usd:.2} minimum")
            }
            RiskRejection::ExceedsPositionLimit { size_usd, max_usd } => {
                write!(f, "position too large: ${size_usd:.2} > ${max_usd:.2}")
            }
            RiskRejection::TooManyPositions { open, max } => {
                write!(f, "max open positions reached: {open}/{max}")
            }
            RiskRejection::ExceedsStrategyAllocation { deployed_usd, size_usd, cap_usd } => {
                write!(
                    f,
                    "strategy allocation exceeded: ${:.2} > ${cap_usd:.2}",
                    deployed_usd + size_usd
                )
            }
            RiskRejection::DuplicateMarket { market_id, holder } => {
                write!(f, "market {market_id} already held by {holder}")
            }
            RiskRejection::BelowMinEdge { edge_pct, min_pct } => {
                write!(f, "edge too low: {edge_pct:.1}% < {min_pct:.1}%")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Portfolio snapshot, or the reason it could not be produced.
#[derive(Debug, Clone)]
pub enum SnapshotState {
    Ok(PortfolioSnapshot),
    /// Balance query failed or returned nothing. Fail closed.
    Unavailable(String),
}

/// Everything the gate needs, assembled by the order manager per signal.
#[derive(Debug, Clone)]
pub struct RiskInputs {
    pub kill_switch_active: bool,
    pub snapshot: SnapshotState,
    /// Markets with an open position or pending entry, with the holder.
    pub open_markets: Vec<(String, StrategyId)>,
    pub deployed_by_strategy: HashMap<StrategyId, f64>,
}

impl RiskInputs {
    pub fn healthy(snapshot: PortfolioSnapshot) -> Self {
        Self {
            kill_switch_active: false,
            snapshot: SnapshotState::Ok(snapshot),
            open_markets: Vec::new(),
            deployed_by_strategy: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub struct RiskGate;

impl RiskGate {
    /// Run every check in order, short-circuiting on the first rejection.
    ///
    /// Exit signals bypass the allocation, size, position-count and
    /// duplicate-market checks: closing risk must never be blocked by the
    /// limits that exist to cap new risk. They still honor the kill switch
    /// and the balance-known requirement.
    pub fn evaluate(
        signal: &Signal,
        inputs: &RiskInputs,
        settings: &Settings,
    ) -> Result<(), RiskRejection> {
        let risk = &settings.risk;
        let is_exit = signal.is_exit();

        // 1. Kill switch
        if inputs.kill_switch_active && !is_exit {
            return Err(RiskRejection::KillSwitch);
        }

        // 2. Portfolio known. Fail closed, never open.
        let snapshot = match &inputs.snapshot {
            SnapshotState::Ok(s) => s,
            SnapshotState::Unavailable(error) => {
                return Err(RiskRejection::BalanceUnknown {
                    error: error.clone(),
                })
            }
        };
        if snapshot.age_secs() > risk.snapshot_stale_secs {
            return Err(RiskRejection::PortfolioUnknown {
                age_secs: snapshot.age_secs(),
                max_secs: risk.snapshot_stale_secs,
            });
        }
        let portfolio = snapshot.total_usd();
        if portfolio <= 0.0 {
            return Err(RiskRejection::BalanceUnknown {
                error: "portfolio value is zero".into(),
            });
        }

        if is_exit {
            return Ok(());
        }

        // 3. Daily loss limit, unrealized P&L included.
        let daily_total = snapshot.realized_pnl_today_usd + snapshot.unrealized_pnl_usd;
        let limit_usd = portfolio * risk.daily_loss_pct / 100.0;
        if daily_total <= -limit_usd {
            return Err(RiskRejection::DailyLossLimit {
                loss_usd: -daily_total,
                limit_usd,
            });
        }

        // 4. Cash reserve after the trade.
        let reserve_usd = portfolio * risk.reserve_pct / 100.0;
        let post_trade_cash = snapshot.cash_usd - signal.size_usd;
        if post_trade_cash < reserve_usd {
            return Err(RiskRejection::InsufficientCash {
                post_trade_cash,
                reserve_usd,
            });
        }

        // 5. Position size cap.
        let max_usd = portfolio * risk.max_position_pct / 100.0;
        if signal.size_usd > max_usd {
            return Err(RiskRejection::ExceedsPositionLimit {
                size_usd: signal.size_usd,
                max_usd,
            });
        }

        // 6. Open position count.
        if snapshot.open_positions >= risk.max_open_positions {
            return Err(RiskRejection::TooManyPositions {
                open: snapshot.open_positions,
                max: risk.max_open_positions,
            });
        }

        // 7. Per-strategy allocation.
        let cap_usd = portfolio * settings.allocation_pct(signal.strategy) / 100.0;
        let deployed = inputs
            .deployed_by_strategy
            .get(&signal.strategy)
            .copied()
            .unwrap_or(0.0);
        if deployed + signal.size_usd > cap_usd {
            return Err(RiskRejection::ExceedsStrategyAllocation {
                deployed_usd: deployed,
                size_usd: signal.size_usd,
                cap_usd,
            });
        }

        // 8. Duplicate market: no OTHER strategy may hold or be entering this
        // market. Same-strategy overlap is allowed (the two arb legs share
        // one market by construction).
        if let Some((market_id, holder)) = inputs
            .open_markets
            .iter()
            .find(|(m, holder)| *m == signal.market_id && *holder != signal.strategy)
        {
            return Err(RiskRejection::DuplicateMarket {
                market_id: market_id.clone(),
                holder: *holder,
            });
        }

        // 9. Minimum edge, for strategies that declare one.
        if let Some(edge_pct) = signal.meta.edge_pct {
            if edge_pct < risk.min_edge_pct {
                return Err(RiskRejection::BelowMinEdge {
                    edge_pct,
                    min_pct: risk.min_edge_pct,
                });
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kill switch
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct KillSwitchRecord {
    active: bool,
    reason: String,
    activated_at: String,
}

/// Global trading halt. The flag is persisted in `bot_metadata` and re-read
/// at startup — it is never held only in memory, so a restart cannot
/// silently resume trading.
pub struct KillSwitch {
    active: AtomicBool,
    db: Arc<Database>,
}

impl KillSwitch {
    /// Load persisted state from the store.
    pub fn load(db: Arc<Database>) -> Result<Self> {
        let active = match db.get_metadata(KILL_SWITCH_KEY)? {
            Some(raw) => serde_json::from_str::<KillSwitchRecord>(&raw)
                .map(|r| r.active)
                .unwrap_or(false),
            None => false,
        };
        if active {
            warn!("kill switch restored from store: trading halted");
        }
        Ok(Self {
            active: AtomicBool::new(active),
            db,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Flip on and persist. Returns false when the switch was already
    /// active, so callers can keep the side-effect sequence idempotent
    /// under concurrent activation.
    pub fn activate(&self, reason: &str) -> Result<bool> {
        let first = !self.active.swap(true, Ordering::SeqCst);
        self.persist(true, reason)?;
        if first {
            warn!(reason, "kill switch activated");
        }
        Ok(first)
    }

    /// Explicit operator action only; never cleared automatically.
    pub fn deactivate(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        self.persist(false, "deactivated by operator")?;
        info!("kill switch deactivated");
        Ok(())
    }

    fn persist(&self, active: bool, reason: &str) -> Result<()> {
        let record = KillSwitchRecord {
            active,
            reason: reason.to_string(),
            activated_at: Utc::now().to_rfc3339(),
        };
        self.db
            .set_metadata(KILL_SWITCH_KEY, &serde_json::to_string(&record)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Outcome, OrderType, PortfolioSnapshot, Side, Signal, SignalMeta};

    fn snapshot(cash: f64, positions_value: f64) -> PortfolioSnapshot {
        PortfolioSnapshot {
            cash_usd: cash,
            positions_value_usd: positions_value,
            unrealized_pnl_usd: 0.0,
            realized_pnl_today_usd: 0.0,
            open_positions: 0,
            taken_at: Utc::now(),
        }
    }

    fn entry_signal(size_usd: f64) -> Signal {
        Signal::new(
            StrategyId::CopyTrader,
            "market1",
            "token1",
            Outcome::Yes,
            Side::Buy,
            size_usd,
            0.50,
            OrderType::Gtc,
            "test entry",
        )
    }

    fn exit_signal(size_usd: f64) -> Signal {
        entry_signal(size_usd).with_meta(SignalMeta {
            is_exit: true,
            parent_position_id: Some(1),
            ..Default::default()
        })
    }

    #[test]
    fn approves_healthy_entry() {
        let inputs = RiskInputs::healthy(snapshot(800.0, 200.0));
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(result.is_ok());
    }

    #[test]
    fn kill_switch_rejects_entries() {
        let mut inputs = RiskInputs::healthy(snapshot(800.0, 200.0));
        inputs.kill_switch_active = true;
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert_eq!(result, Err(RiskRejection::KillSwitch));
    }

    #[test]
    fn kill_switch_still_allows_exits() {
        let mut inputs = RiskInputs::healthy(snapshot(800.0, 200.0));
        inputs.kill_switch_active = true;
        let result = RiskGate::evaluate(&exit_signal(50.0), &inputs, &Settings::default());
        assert!(result.is_ok());
    }

    #[test]
    fn balance_unknown_fails_closed() {
        let inputs = RiskInputs {
            kill_switch_active: false,
            snapshot: SnapshotState::Unavailable("rpc timeout".into()),
            open_markets: Vec::new(),
            deployed_by_strategy: HashMap::new(),
        };
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(matches!(result, Err(RiskRejection::BalanceUnknown { .. })));
        // Exits are also blocked when the balance is unknown.
        let result = RiskGate::evaluate(&exit_signal(50.0), &inputs, &Settings::default());
        assert!(matches!(result, Err(RiskRejection::BalanceUnknown { .. })));
    }

    #[test]
    fn stale_snapshot_rejected() {
        let mut snap = snapshot(800.0, 200.0);
        snap.taken_at = Utc::now() - chrono::Duration::seconds(120);
        let inputs = RiskInputs::healthy(snap);
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(matches!(result, Err(RiskRejection::PortfolioUnknown { .. })));
    }

    #[test]
    fn daily_loss_includes_unrealized() {
        // Realized alone is under the limit; unrealized pushes it over.
        let mut snap = snapshot(800.0, 200.0);
        snap.realized_pnl_today_usd = -30.0;
        snap.unrealized_pnl_usd = -25.0; // total -55 vs 5% of 1000 = 50
        let inputs = RiskInputs::healthy(snap);
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(matches!(result, Err(RiskRejection::DailyLossLimit { .. })));
    }

    #[test]
    fn daily_loss_does_not_block_exits() {
        let mut snap = snapshot(800.0, 200.0);
        snap.realized_pnl_today_usd = -100.0;
        let inputs = RiskInputs::healthy(snap);
        let result = RiskGate::evaluate(&exit_signal(50.0), &inputs, &Settings::default());
        assert!(result.is_ok());
    }

    #[test]
    fn cash_reserve_enforced() {
        // Portfolio 1000, reserve 20% = 200. Cash 220, size 50 -> 170 left.
        let inputs = RiskInputs::healthy(snapshot(220.0, 780.0));
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(matches!(result, Err(RiskRejection::InsufficientCash { .. })));
    }

    #[test]
    fn oversized_position_rejected() {
        // 10% of 1000 = 100 max.
        let inputs = RiskInputs::healthy(snapshot(900.0, 100.0));
        let result = RiskGate::evaluate(&entry_signal(150.0), &inputs, &Settings::default());
        assert!(matches!(result, Err(RiskRejection::ExceedsPositionLimit { .. })));
    }

    #[test]
    fn position_count_cap() {
        let mut snap = snapshot(800.0, 200.0);
        snap.open_positions = 10;
        let inputs = RiskInputs::healthy(snap);
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(matches!(result, Err(RiskRejection::TooManyPositions { .. })));
    }

    #[test]
    fn strategy_allocation_cap() {
        // Copy trader allocation 40% of 1000 = 400; 380 deployed + 50 > 400.
        let mut inputs = RiskInputs::healthy(snapshot(800.0, 200.0));
        inputs
            .deployed_by_strategy
            .insert(StrategyId::CopyTrader, 380.0);
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(matches!(
            result,
            Err(RiskRejection::ExceedsStrategyAllocation { .. })
        ));
    }

    #[test]
    fn duplicate_market_rejected_for_entries_only() {
        let mut inputs = RiskInputs::healthy(snapshot(800.0, 200.0));
        inputs
            .open_markets
            .push(("market1".into(), StrategyId::ArbScanner));

        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(matches!(result, Err(RiskRejection::DuplicateMarket { .. })));

        let result = RiskGate::evaluate(&exit_signal(50.0), &inputs, &Settings::default());
        assert!(result.is_ok());
    }

    #[test]
    fn same_strategy_market_overlap_allowed() {
        // Two arb legs target the same market; the gate must not block leg 2.
        let mut inputs = RiskInputs::healthy(snapshot(800.0, 200.0));
        inputs
            .open_markets
            .push(("market1".into(), StrategyId::CopyTrader));
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(result.is_ok());
    }

    #[test]
    fn edge_below_minimum_rejected() {
        let inputs = RiskInputs::healthy(snapshot(800.0, 200.0));
        let mut signal = entry_signal(50.0);
        signal.meta.edge_pct = Some(3.0);
        let result = RiskGate::evaluate(&signal, &inputs, &Settings::default());
        assert_eq!(
            result,
            Err(RiskRejection::BelowMinEdge {
                edge_pct: 3.0,
                min_pct: 5.0
            })
        );
    }

    #[test]
    fn no_declared_edge_skips_edge_check() {
        let inputs = RiskInputs::healthy(snapshot(800.0, 200.0));
        let result = RiskGate::evaluate(&entry_signal(50.0), &inputs, &Settings::default());
        assert!(result.is_ok());
    }

    #[test]
    fn kill_switch_persists_and_reloads() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let kill = KillSwitch::load(Arc::clone(&db)).unwrap();
        assert!(!kill.is_active());

        assert!(kill.activate("operator").unwrap());
        // Second activation is a no-op for the side-effect sequence.
        assert!(!kill.activate("operator again").unwrap());
        assert!(kill.is_active());

        let reloaded = KillSwitch::load(Arc::clone(&db)).unwrap();
        assert!(reloaded.is_active());

        reloaded.deactivate().unwrap();
        let reloaded = KillSwitch::load(db).unwrap();
        assert!(!reloaded.is_active());
    }
}
