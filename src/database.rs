/// database.rs – SQLite persistence layer using rusqlite.
///
/// Trades, fills, positions, whale state, stink orders, daily P&L and the
/// kill-switch singleton live in a single SQLite file with WAL journaling so
/// state survives restarts. Multi-step updates (close position AND record the
/// exit fill) run inside one transaction; fills are INSERT OR IGNORE keyed by
/// the exchange trade id so redelivery never rewrites history.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::models::{
    Order, OrderStatus, Position, PositionStatus, StinkOrder, StrategyId, TpLevel, WhalePosition,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS trades (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    signal_id         TEXT NOT NULL,
    exchange_order_id TEXT,
    strategy          TEXT NOT NULL,
    market_id         TEXT NOT NULL,
    token_id          TEXT NOT NULL,
    side              TEXT NOT NULL,
    size_shares       REAL NOT NULL,
    price             REAL NOT NULL,
    order_type        TEXT NOT NULL DEFAULT 'GTC',
    status            TEXT NOT NULL DEFAULT 'pending',
    filled_shares     REAL NOT NULL DEFAULT 0,
    avg_fill_price    REAL,
    fee_paid          REAL NOT NULL DEFAULT 0,
    error             TEXT,
    reasoning         TEXT,
    metadata          TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trade_fills (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_trade_id TEXT NOT NULL UNIQUE,
    order_id          INTEGER NOT NULL REFERENCES trades(id),
    token_id          TEXT NOT NULL,
    side              TEXT NOT NULL,
    price             REAL NOT NULL,
    shares            REAL NOT NULL,
    fee               REAL NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id      TEXT NOT NULL,
    token_id       TEXT NOT NULL,
    outcome        TEXT NOT NULL,
    side           TEXT NOT NULL,
    strategy       TEXT NOT NULL,
    entry_price    REAL NOT NULL,
    shares         REAL NOT NULL,
    entry_shares   REAL NOT NULL,
    entry_fee      REAL NOT NULL DEFAULT 0,
    exit_fee       REAL NOT NULL DEFAULT 0,
    realized_pnl   REAL NOT NULL DEFAULT 0,
    status         TEXT NOT NULL DEFAULT 'open',
    source_wallet  TEXT,
    tp_levels      TEXT NOT NULL DEFAULT '[]',
    sl_price       REAL,
    trail_pct      REAL,
    trail_anchor   REAL,
    current_price  REAL,
    opened_at      TEXT NOT NULL,
    closed_at      TEXT,
    close_reason   TEXT
);

CREATE TABLE IF NOT EXISTS whale_positions (
    wallet_address TEXT NOT NULL,
    market_id      TEXT NOT NULL,
    token_id       TEXT NOT NULL,
    shares         REAL NOT NULL,
    avg_price      REAL NOT NULL DEFAULT 0,
    last_seen_at   TEXT NOT NULL,
    PRIMARY KEY (wallet_address, market_id, token_id)
);

CREATE TABLE IF NOT EXISTS stink_orders (
    market_id         TEXT NOT NULL,
    token_id          TEXT NOT NULL,
    exchange_order_id TEXT NOT NULL,
    price             REAL NOT NULL,
    size_usd          REAL NOT NULL,
    placed_at         TEXT NOT NULL,
    PRIMARY KEY (market_id, token_id)
);

CREATE TABLE IF NOT EXISTS daily_pnl (
    date             TEXT PRIMARY KEY,
    starting_balance REAL NOT NULL DEFAULT 0,
    ending_balance   REAL,
    realized_pnl     REAL NOT NULL DEFAULT 0,
    unrealized_pnl   REAL NOT NULL DEFAULT 0,
    trades_count     INTEGER NOT NULL DEFAULT 0,
    fees_paid        REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS risk_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    kind       TEXT NOT NULL,
    strategy   TEXT,
    reason     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bot_metadata (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_status    ON trades(status);
CREATE INDEX IF NOT EXISTS idx_trades_strategy  ON trades(strategy);
CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
CREATE INDEX IF NOT EXISTS idx_positions_token  ON positions(token_id);
CREATE INDEX IF NOT EXISTS idx_fills_order      ON trade_fills(order_id);
";

/// Key for the persisted kill-switch singleton.
pub const KILL_SWITCH_KEY: &str = "risk_kill_switch";

// ---------------------------------------------------------------------------
// Row payloads
// ---------------------------------------------------------------------------

/// Fields for a new order row at submission time.
#[derive(Debug, Clone)]
pub struct NewOrder<'a> {
    pub signal_id: &'a str,
    pub exchange_order_id: Option<&'a str>,
    pub strategy: StrategyId,
    pub market_id: &'a str,
    pub token_id: &'a str,
    pub side: &'a str,
    pub size_shares: f64,
    pub price: f64,
    pub order_type: &'a str,
    pub status: OrderStatus,
    pub reasoning: &'a str,
    pub metadata_json: Option<String>,
}

/// Fields for a new position row on entry fill.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub market_id: String,
    pub token_id: String,
    pub outcome: String,
    pub side: String,
    pub strategy: StrategyId,
    pub entry_price: f64,
    pub shares: f64,
    pub entry_fee: f64,
    pub source_wallet: Option<String>,
    pub tp_levels: Vec<TpLevel>,
    pub sl_price: Option<f64>,
    pub trail_pct: Option<f64>,
}

/// A fill row keyed by the exchange-assigned trade id.
#[derive(Debug, Clone)]
pub struct FillRow {
    pub exchange_trade_id: String,
    pub token_id: String,
    pub side: String,
    pub price: f64,
    pub shares: f64,
    pub fee: f64,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the SQLite database at *path* and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(dir) = std::path::Path::new(path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).context("creating database directory")?;
            }
        }
        let conn = Connection::open(path).context("opening SQLite database")?;
        conn.execute_batch(SCHEMA).context("applying schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        conn.execute_batch(SCHEMA).context("applying schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().expect("database mutex poisoned");
        f(&conn)
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub fn insert_order(&self, order: &NewOrder<'_>) -> Result<i64> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO trades
                    (signal_id, exchange_order_id, strategy, market_id, token_id,
                     side, size_shares, price, order_type, status,
                     reasoning, metadata, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)",
                params![
                    order.signal_id,
                    order.exchange_order_id,
                    order.strategy.as_str(),
                    order.market_id,
                    order.token_id,
                    order.side,
                    order.size_shares,
                    order.price,
                    order.order_type,
                    order.status.as_str(),
                    order.reasoning,
                    order.metadata_json,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn set_order_exchange_id(&self, order_id: i64, exchange_order_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE trades SET exchange_order_id=?1, updated_at=?2 WHERE id=?3",
                params![exchange_order_id, Utc::now().to_rfc3339(), order_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_order_terminal(
        &self,
        order_id: i64,
        status: OrderStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE trades SET status=?1, error=?2, updated_at=?3 WHERE id=?4",
                params![status.as_str(), error, Utc::now().to_rfc3339(), order_id],
            )?;
            Ok(())
        })
    }

    pub fn get_order(&self, order_id: i64) -> Result<Option<Order>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT * FROM trades WHERE id=?1", params![order_id], |row| {
                Self::row_to_order(row)
            })
            .optional()
            .map_err(anyhow::Error::from)
        })
    }

    pub fn get_order_by_exchange_id(&self, exchange_order_id: &str) -> Result<Option<Order>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM trades WHERE exchange_order_id=?1",
                params![exchange_order_id],
                |row| Self::row_to_order(row),
            )
            .optional()
            .map_err(anyhow::Error::from)
        })
    }

    /// Orders belonging to one arb pair. Structured JSON predicate, not LIKE.
    pub fn get_orders_by_arb_pair(&self, pair_id: &str) -> Result<Vec<Order>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM trades
                 WHERE json_extract(metadata, '$.arb_pair_id') = ?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![pair_id], |row| Self::row_to_order(row))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(anyhow::Error::from)
        })
    }

    fn row_to_order(row: &rusqlite::Row<'_>) -> Result<Order, rusqlite::Error> {
        Ok(Order {
            id: row.get("id")?,
            exchange_order_id: row.get("exchange_order_id")?,
            signal_id: row.get("signal_id")?,
            strategy: parse_or_default(row.get::<_, String>("strategy")?, StrategyId::ArbScanner),
            market_id: row.get("market_id")?,
            token_id: row.get("token_id")?,
            side: parse_or_default(row.get::<_, String>("side")?, crate::models::Side::Buy),
            size_shares: row.get("size_shares")?,
            price: row.get("price")?,
            order_type: parse_or_default(
                row.get::<_, String>("order_type")?,
                crate::models::OrderType::Gtc,
            ),
            status: parse_or_default(row.get::<_, String>("status")?, OrderStatus::Pending),
            filled_shares: row.get("filled_shares")?,
            avg_fill_price: row.get("avg_fill_price")?,
            fee_paid: row.get("fee_paid")?,
            error: row.get("error")?,
            created_at: parse_dt(row.get::<_, String>("created_at")?),
            updated_at: parse_dt(row.get::<_, String>("updated_at")?),
        })
    }

    // ------------------------------------------------------------------
    // Entry / exit finalization (transactional)
    // ------------------------------------------------------------------

    /// Finalize a filled entry: update the order, insert fill rows and create
    /// the position — one transaction, no partial commits.
    pub fn finalize_entry(
        &self,
        order_id: i64,
        filled_shares: f64,
        avg_fill_price: f64,
        fee_paid: f64,
        fills: &[FillRow],
        position: &NewPosition,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "UPDATE trades SET status='filled', filled_shares=?1, avg_fill_price=?2,
                    fee_paid=?3, updated_at=?4 WHERE id=?5",
            params![filled_shares, avg_fill_price, fee_paid, now, order_id],
        )?;
        for fill in fills {
            insert_fill(&tx, order_id, fill)?;
        }
        tx.execute(
            "INSERT INTO positions
                (market_id, token_id, outcome, side, strategy, entry_price,
                 shares, entry_shares, entry_fee, status, source_wallet,
                 tp_levels, sl_price, trail_pct, opened_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?7,?8,'open',?9,?10,?11,?12,?13)",
            params![
                position.market_id,
                position.token_id,
                position.outcome,
                position.side,
                position.strategy.as_str(),
                position.entry_price,
                position.shares,
                position.entry_fee,
                position.source_wallet,
                serde_json::to_string(&position.tp_levels)?,
                position.sl_price,
                position.trail_pct,
                now,
            ],
        )?;
        let position_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(position_id)
    }

    /// Finalize a filled exit: update the order, insert fill rows and adjust
    /// the position (full close or partial reduction) — one transaction.
    /// The position may only reach `closed`/`resolved` here, in the same
    /// transaction that records the terminal exit order.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_exit(
        &self,
        order_id: i64,
        position_id: i64,
        shares_closed: f64,
        exit_price: f64,
        exit_fee: f64,
        realized_delta: f64,
        full_close: bool,
        final_status: PositionStatus,
        reason: &str,
        fills: &[FillRow],
    ) -> Result<()> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "UPDATE trades SET status='filled', filled_shares=?1, avg_fill_price=?2,
                    fee_paid=?3, updated_at=?4 WHERE id=?5",
            params![shares_closed, exit_price, exit_fee, now, order_id],
        )?;
        for fill in fills {
            insert_fill(&tx, order_id, fill)?;
        }

        if full_close {
            tx.execute(
                "UPDATE positions SET shares=0, exit_fee=exit_fee+?1,
                        realized_pnl=realized_pnl+?2, status=?3,
                        closed_at=?4, close_reason=?5 WHERE id=?6",
                params![
                    exit_fee,
                    realized_delta,
                    final_status.as_str(),
                    now,
                    reason,
                    position_id
                ],
            )?;
        } else {
            tx.execute(
                "UPDATE positions SET shares=shares-?1, exit_fee=exit_fee+?2,
                        realized_pnl=realized_pnl+?3, status='open' WHERE id=?4",
                params![shares_closed, exit_fee, realized_delta, position_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Synthetic close on market resolution: no exchange order exists, so the
    /// position update and the settlement trade row commit together.
    pub fn finalize_resolution(
        &self,
        position_id: i64,
        payout_price: f64,
        resolution_fee: f64,
        realized_delta: f64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let (market_id, token_id, strategy, shares): (String, String, String, f64) = tx
            .query_row(
                "SELECT market_id, token_id, strategy, shares FROM positions WHERE id=?1",
                params![position_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        tx.execute(
            "INSERT INTO trades
                (signal_id, strategy, market_id, token_id, side, size_shares,
                 price, order_type, status, filled_shares, avg_fill_price,
                 fee_paid, reasoning, created_at, updated_at)
             VALUES (?1,?2,?3,?4,'SELL',?5,?6,'GTC','filled',?5,?6,?7,?8,?9,?9)",
            params![
                format!("resolution_{position_id}"),
                strategy,
                market_id,
                token_id,
                shares,
                payout_price,
                resolution_fee,
                "market resolved",
                now,
            ],
        )?;
        tx.execute(
            "UPDATE positions SET shares=0, exit_fee=exit_fee+?1,
                    realized_pnl=realized_pnl+?2, status='resolved',
                    closed_at=?3, close_reason='market_resolved' WHERE id=?4",
            params![resolution_fee, realized_delta, now, position_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    pub fn get_position(&self, id: i64) -> Result<Option<Position>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT * FROM positions WHERE id=?1", params![id], |row| {
                Self::row_to_position(row)
            })
            .optional()
            .map_err(anyhow::Error::from)
        })
    }

    pub fn get_open_positions(&self, strategy: Option<StrategyId>) -> Result<Vec<Position>> {
        self.with_conn(|conn| {
            let rows = match strategy {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM positions
                         WHERE status IN ('open','closing') AND strategy=?1",
                    )?;
                    let rows = stmt
                        .query_map(params![s.as_str()], |row| Self::row_to_position(row))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM positions WHERE status IN ('open','closing')")?;
                    let rows = stmt
                        .query_map([], |row| Self::row_to_position(row))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    /// Positions stuck in `closing` (exit never confirmed) for startup recovery.
    pub fn get_closing_positions(&self) -> Result<Vec<Position>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM positions WHERE status='closing'")?;
            let rows = stmt.query_map([], |row| Self::row_to_position(row))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(anyhow::Error::from)
        })
    }

    pub fn get_closed_positions(&self, strategy: Option<StrategyId>) -> Result<Vec<Position>> {
        self.with_conn(|conn| {
            let rows = match strategy {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM positions
                         WHERE status IN ('closed','resolved') AND strategy=?1",
                    )?;
                    let rows = stmt
                        .query_map(params![s.as_str()], |row| Self::row_to_position(row))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM positions WHERE status IN ('closed','resolved')")?;
                    let rows = stmt
                        .query_map([], |row| Self::row_to_position(row))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    pub fn count_open_positions(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM positions WHERE status IN ('open','closing')",
                [],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    pub fn update_position_price(&self, id: i64, price: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET current_price=?1 WHERE id=?2",
                params![price, id],
            )?;
            Ok(())
        })
    }

    /// Persist the open → closing transition at exit-emission time.
    pub fn mark_position_closing(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET status='closing' WHERE id=?1 AND status='open'",
                params![id],
            )?;
            Ok(())
        })
    }

    /// Revert closing → open after an exit fails terminally without a fill.
    pub fn reopen_position(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET status='open' WHERE id=?1 AND status='closing'",
                params![id],
            )?;
            Ok(())
        })
    }

    pub fn set_tp_levels(&self, id: i64, levels: &[TpLevel]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET tp_levels=?1 WHERE id=?2",
                params![serde_json::to_string(levels)?, id],
            )?;
            Ok(())
        })
    }

    pub fn set_trail_anchor(&self, id: i64, anchor: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET trail_anchor=?1 WHERE id=?2",
                params![anchor, id],
            )?;
            Ok(())
        })
    }

    fn row_to_position(row: &rusqlite::Row<'_>) -> Result<Position, rusqlite::Error> {
        let tp_json: String = row.get("tp_levels")?;
        Ok(Position {
            id: row.get("id")?,
            market_id: row.get("market_id")?,
            token_id: row.get("token_id")?,
            outcome: parse_or_default(row.get::<_, String>("outcome")?, crate::models::Outcome::Yes),
            side: parse_or_default(row.get::<_, String>("side")?, crate::models::PositionSide::Long),
            strategy: parse_or_default(row.get::<_, String>("strategy")?, StrategyId::ArbScanner),
            entry_price: row.get("entry_price")?,
            shares: row.get("shares")?,
            entry_shares: row.get("entry_shares")?,
            entry_fee: row.get("entry_fee")?,
            exit_fee: row.get("exit_fee")?,
            realized_pnl: row.get("realized_pnl")?,
            status: parse_or_default(row.get::<_, String>("status")?, PositionStatus::Open),
            source_wallet: row.get("source_wallet")?,
            tp_levels: serde_json::from_str(&tp_json).unwrap_or_default(),
            sl_price: row.get("sl_price")?,
            trail_pct: row.get("trail_pct")?,
            trail_anchor: row.get("trail_anchor")?,
            current_price: row.get("current_price")?,
            opened_at: parse_dt(row.get::<_, String>("opened_at")?),
            closed_at: row.get::<_, Option<String>>("closed_at")?.map(parse_dt),
            close_reason: row.get("close_reason")?,
        })
    }

    // ------------------------------------------------------------------
    // Whale positions (copy trading diff state)
    // ------------------------------------------------------------------

    pub fn get_whale_positions(&self, wallet: &str) -> Result<Vec<WhalePosition>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM whale_positions WHERE wallet_address=?1")?;
            let rows = stmt.query_map(params![wallet], |row| {
                Ok(WhalePosition {
                    wallet_address: row.get("wallet_address")?,
                    market_id: row.get("market_id")?,
                    token_id: row.get("token_id")?,
                    shares: row.get("shares")?,
                    avg_price: row.get("avg_price")?,
                    last_seen_at: parse_dt(row.get::<_, String>("last_seen_at")?),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(anyhow::Error::from)
        })
    }

    pub fn upsert_whale_position(
        &self,
        wallet: &str,
        market_id: &str,
        token_id: &str,
        shares: f64,
        avg_price: f64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO whale_positions
                    (wallet_address, market_id, token_id, shares, avg_price, last_seen_at)
                 VALUES (?1,?2,?3,?4,?5,?6)
                 ON CONFLICT(wallet_address, market_id, token_id) DO UPDATE SET
                    shares=excluded.shares,
                    avg_price=excluded.avg_price,
                    last_seen_at=excluded.last_seen_at",
                params![wallet, market_id, token_id, shares, avg_price, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn delete_whale_position(&self, wallet: &str, market_id: &str, token_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM whale_positions
                 WHERE wallet_address=?1 AND market_id=?2 AND token_id=?3",
                params![wallet, market_id, token_id],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Stink orders
    // ------------------------------------------------------------------

    pub fn get_stink_orders(&self) -> Result<Vec<StinkOrder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM stink_orders")?;
            let rows = stmt.query_map([], |row| {
                Ok(StinkOrder {
                    market_id: row.get("market_id")?,
                    token_id: row.get("token_id")?,
                    exchange_order_id: row.get("exchange_order_id")?,
                    price: row.get("price")?,
                    size_usd: row.get("size_usd")?,
                    placed_at: parse_dt(row.get::<_, String>("placed_at")?),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(anyhow::Error::from)
        })
    }

    /// The write that prevents duplicate stink bids per (market, token).
    pub fn upsert_stink_order(&self, order: &StinkOrder) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO stink_orders
                    (market_id, token_id, exchange_order_id, price, size_usd, placed_at)
                 VALUES (?1,?2,?3,?4,?5,?6)
                 ON CONFLICT(market_id, token_id) DO UPDATE SET
                    exchange_order_id=excluded.exchange_order_id,
                    price=excluded.price,
                    size_usd=excluded.size_usd,
                    placed_at=excluded.placed_at",
                params![
                    order.market_id,
                    order.token_id,
                    order.exchange_order_id,
                    order.price,
                    order.size_usd,
                    order.placed_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_stink_order(&self, market_id: &str, token_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM stink_orders WHERE market_id=?1 AND token_id=?2",
                params![market_id, token_id],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // P&L
    // ------------------------------------------------------------------

    /// Realized P&L from positions closed today (UTC), plus partial-exit
    /// realizations on positions still open.
    pub fn realized_pnl_today(&self) -> Result<f64> {
        self.with_conn(|conn| {
            let today = Utc::now().format("%Y-%m-%d").to_string();
            let closed: f64 = conn.query_row(
                "SELECT COALESCE(SUM(realized_pnl),0.0) FROM positions
                 WHERE closed_at IS NOT NULL AND substr(closed_at,1,10)=?1",
                params![today],
                |row| row.get(0),
            )?;
            let partial: f64 = conn.query_row(
                "SELECT COALESCE(SUM(realized_pnl),0.0) FROM positions
                 WHERE status IN ('open','closing') AND substr(opened_at,1,10)<=?1",
                params![today],
                |row| row.get(0),
            )?;
            Ok(closed + partial)
        })
    }

    pub fn total_realized_pnl(&self) -> Result<f64> {
        self.with_conn(|conn| {
            let v: f64 = conn.query_row(
                "SELECT COALESCE(SUM(realized_pnl),0.0) FROM positions",
                [],
                |row| row.get(0),
            )?;
            Ok(v)
        })
    }

    pub fn upsert_daily_pnl(
        &self,
        date: &str,
        starting_balance: f64,
        ending_balance: f64,
        realized: f64,
        unrealized: f64,
        trades_count: i64,
        fees_paid: f64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO daily_pnl
                    (date, starting_balance, ending_balance, realized_pnl,
                     unrealized_pnl, trades_count, fees_paid)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)
                 ON CONFLICT(date) DO UPDATE SET
                    ending_balance=excluded.ending_balance,
                    realized_pnl=excluded.realized_pnl,
                    unrealized_pnl=excluded.unrealized_pnl,
                    trades_count=excluded.trades_count,
                    fees_paid=excluded.fees_paid",
                params![
                    date,
                    starting_balance,
                    ending_balance,
                    realized,
                    unrealized,
                    trades_count,
                    fees_paid
                ],
            )?;
            Ok(())
        })
    }

    pub fn trades_count_today(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let today = Utc::now().format("%Y-%m-%d").to_string();
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM trades WHERE substr(created_at,1,10)=?1",
                params![today],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    // ------------------------------------------------------------------
    // Risk events / metadata
    // ------------------------------------------------------------------

    pub fn record_risk_event(&self, kind: &str, strategy: Option<&str>, reason: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO risk_events (kind, strategy, reason, created_at)
                 VALUES (?1,?2,?3,?4)",
                params![kind, strategy, reason, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO bot_metadata (key, value, updated_at) VALUES (?1,?2,?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value=excluded.value, updated_at=excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM bot_metadata WHERE key=?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(anyhow::Error::from)
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// INSERT OR IGNORE keyed by the exchange trade id; redelivered fills are
/// no-ops. Returns true when the row was actually inserted.
fn insert_fill(conn: &Connection, order_id: i64, fill: &FillRow) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO trade_fills
            (exchange_trade_id, order_id, token_id, side, price, shares, fee, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            fill.exchange_trade_id,
            order_id,
            fill.token_id,
            fill.side,
            fill.price,
            fill.shares,
            fill.fee,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(n > 0)
}

impl Database {
    /// Standalone fill insert for confirmation-poll partials.
    pub fn record_fill(&self, order_id: i64, fill: &FillRow) -> Result<bool> {
        self.with_conn(|conn| insert_fill(conn, order_id, fill))
    }

    pub fn count_fills(&self, order_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM trade_fills WHERE order_id=?1",
                params![order_id],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_or_default<T: std::str::FromStr + Copy>(s: String, default: T) -> T {
    s.parse().unwrap_or(default)
}
