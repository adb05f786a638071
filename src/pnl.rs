/// pnl.rs – Portfolio valuation and daily P&L tracking.
///
/// The tracker produces the snapshot the risk gate consumes: cash from the
/// exchange balance plus open positions valued at their latest seen price
/// (the position manager keeps `current_price` fresh from the feed). The
/// snapshot is cached for about a second; failures surface as
/// `SnapshotState::Unavailable` so risk fails closed rather than trading on
/// a guess.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::database::Database;
use crate::exchange::ExchangeClient;
use crate::models::PortfolioSnapshot;
use crate::risk::SnapshotState;

const CACHE_TTL: Duration = Duration::from_secs(1);

pub struct PnlTracker {
    db: Arc<Database>,
    exchange: Arc<ExchangeClient>,
    cache: Mutex<Option<PortfolioSnapshot>>,
}

impl PnlTracker {
    pub fn new(db: Arc<Database>, exchange: Arc<ExchangeClient>) -> Self {
        Self {
            db,
            exchange,
            cache: Mutex::new(None),
        }
    }

    /// Snapshot for the risk gate. Cached; a balance failure is reported as
    /// unavailable, never silently substituted.
    pub async fn snapshot(&self) -> SnapshotState {
        {
            let cache = self.cache.lock().await;
            if let Some(snap) = cache.as_ref() {
                if snap.age_secs() < CACHE_TTL.as_secs_f64() {
                    return SnapshotState::Ok(snap.clone());
                }
            }
        }

        match self.compute().await {
            Ok(snap) => {
                *self.cache.lock().await = Some(snap.clone());
                SnapshotState::Ok(snap)
            }
            Err(e) => {
                warn!("portfolio snapshot failed: {e:#}");
                SnapshotState::Unavailable(format!("{e:#}"))
            }
        }
    }

    async fn compute(&self) -> Result<PortfolioSnapshot> {
        let cash_usd = self.exchange.usdc_balance().await?;
        let positions = self.db.get_open_positions(None)?;

        let mut positions_value = 0.0;
        let mut unrealized = 0.0;
        for p in &positions {
            positions_value += p.value_at(p.current_price);
            unrealized += p.unrealized_pnl(p.current_price.unwrap_or(p.entry_price));
        }

        Ok(PortfolioSnapshot {
            cash_usd,
            positions_value_usd: positions_value,
            unrealized_pnl_usd: unrealized,
            realized_pnl_today_usd: self.db.realized_pnl_today()?,
            open_positions: positions.len(),
            taken_at: Utc::now(),
        })
    }

    /// Upsert today's `daily_pnl` row. Called periodically and at shutdown.
    pub async fn record_daily(&self) -> Result<()> {
        let snap = match self.snapshot().await {
            SnapshotState::Ok(s) => s,
            SnapshotState::Unavailable(e) => anyhow::bail!("snapshot unavailable: {e}"),
        };
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let trades = self.db.trades_count_today()?;
        self.db.upsert_daily_pnl(
            &date,
            snap.total_usd() - snap.realized_pnl_today_usd,
            snap.total_usd(),
            snap.realized_pnl_today_usd,
            snap.unrealized_pnl_usd,
            trades,
            0.0,
        )
    }

    /// Human-readable summary used by chat `status`/`pnl` and the daily alert.
    pub async fn summary_text(&self) -> String {
        match self.snapshot().await {
            SnapshotState::Ok(s) => format!(
                "Portfolio ${:.2} (cash ${:.2}, positions ${:.2})\n\
                 Realized today {:+.2} | Unrealized {:+.2} | Open positions: {}",
                s.total_usd(),
                s.cash_usd,
                s.positions_value_usd,
                s.realized_pnl_today_usd,
                s.unrealized_pnl_usd,
                s.open_positions,
            ),
            SnapshotState::Unavailable(e) => format!("Portfolio unavailable: {e}"),
        }
    }
}
