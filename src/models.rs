/// models.rs – Core data types shared across all bot modules.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Order side as the exchange understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(anyhow::anyhow!("Unknown side: {s}")),
        }
    }
}

/// Binary market outcome. Tokens are always selected by this string,
/// never by their index in the exchange's token array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Yes => "Yes",
            Outcome::No => "No",
        }
    }

    pub fn opposite(self) -> Outcome {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yes" => Ok(Outcome::Yes),
            "no" => Ok(Outcome::No),
            _ => Err(anyhow::anyhow!("Unknown outcome: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Good-till-cancelled: rests on the book.
    Gtc,
    /// Fill-or-kill: fully fill immediately or cancel.
    Fok,
    /// Immediate-or-cancel: fill what is possible, cancel the remainder.
    Ioc,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Gtc => "GTC",
            OrderType::Fok => "FOK",
            OrderType::Ioc => "IOC",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GTC" => Ok(OrderType::Gtc),
            "FOK" => Ok(OrderType::Fok),
            "IOC" => Ok(OrderType::Ioc),
            _ => Err(anyhow::anyhow!("Unknown order type: {s}")),
        }
    }
}

/// Lifecycle of a single order on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    Partial,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Filled => "filled",
            OrderStatus::Partial => "partial",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Failed => "failed",
        }
    }

    /// Terminal states: the order will not change again on the exchange.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Failed
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "submitted" => Ok(OrderStatus::Submitted),
            "filled" => Ok(OrderStatus::Filled),
            "partial" => Ok(OrderStatus::Partial),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "rejected" => Ok(OrderStatus::Rejected),
            "failed" => Ok(OrderStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown order status: {s}")),
        }
    }
}

/// Lifecycle of a position held by the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    /// An exit signal is in flight; no further exits may be emitted.
    Closing,
    Closed,
    /// The market settled while we held the position.
    Resolved,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
            PositionStatus::Resolved => "resolved",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, PositionStatus::Open | PositionStatus::Closing)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closing" => Ok(PositionStatus::Closing),
            "closed" => Ok(PositionStatus::Closed),
            "resolved" => Ok(PositionStatus::Resolved),
            _ => Err(anyhow::anyhow!("Unknown position status: {s}")),
        }
    }
}

/// Direction of a position. Short means SELL-to-open on a held token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    /// The order side that closes a position of this direction.
    pub fn exit_order_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PositionSide {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LONG" => Ok(PositionSide::Long),
            "SHORT" => Ok(PositionSide::Short),
            _ => Err(anyhow::anyhow!("Unknown position side: {s}")),
        }
    }
}

/// The strategy that originated a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyId {
    CopyTrader,
    ArbScanner,
    StinkBidder,
}

impl StrategyId {
    pub const ALL: [StrategyId; 3] = [
        StrategyId::CopyTrader,
        StrategyId::ArbScanner,
        StrategyId::StinkBidder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyId::CopyTrader => "copy_trader",
            StrategyId::ArbScanner => "arb_scanner",
            StrategyId::StinkBidder => "stink_bidder",
        }
    }
}

impl std::fmt::Display for StrategyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyId {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy_trader" | "copy" => Ok(StrategyId::CopyTrader),
            "arb_scanner" | "arb" => Ok(StrategyId::ArbScanner),
            "stink_bidder" | "stink" => Ok(StrategyId::StinkBidder),
            _ => Err(anyhow::anyhow!("Unknown strategy: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Structured metadata carried alongside a signal through the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMeta {
    /// Exit signals bypass allocation/size/duplicate risk checks and are
    /// never dropped from the queue.
    #[serde(default)]
    pub is_exit: bool,
    /// Position being closed, when this is an exit.
    #[serde(default)]
    pub parent_position_id: Option<i64>,
    /// Links the two legs of a parity-arbitrage pair.
    #[serde(default)]
    pub arb_pair_id: Option<String>,
    /// 1 or 2 within an arb pair.
    #[serde(default)]
    pub arb_leg: Option<u8>,
    /// True when this sell unwinds a filled leg 1 after leg 2 failed.
    #[serde(default)]
    pub arb_unwind: bool,
    /// Expected edge after fees, percent. Checked against min_edge_pct.
    #[serde(default)]
    pub edge_pct: Option<f64>,
    /// Whale wallet this signal copies, if any.
    #[serde(default)]
    pub source_wallet: Option<String>,
    /// Whale's average entry price at detection time.
    #[serde(default)]
    pub whale_entry_price: Option<f64>,
    /// Retry attempt counter for failed exits.
    #[serde(default)]
    pub attempt: u32,
}

/// A trading intention emitted by a strategy or the position manager.
///
/// `size_usd` is always USD notional. Conversion to shares happens exactly
/// once, inside the order manager, at submission time.
#[derive(Debug, Clone)]
pub struct Signal {
    pub id: String,
    pub strategy: StrategyId,
    pub market_id: String,
    pub token_id: String,
    pub outcome: Outcome,
    pub side: Side,
    pub size_usd: f64,
    pub limit_price: f64,
    pub order_type: OrderType,
    pub reasoning: String,
    pub meta: SignalMeta,
}

impl Signal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: StrategyId,
        market_id: impl Into<String>,
        token_id: impl Into<String>,
        outcome: Outcome,
        side: Side,
        size_usd: f64,
        limit_price: f64,
        order_type: OrderType,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy,
            market_id: market_id.into(),
            token_id: token_id.into(),
            outcome,
            side,
            size_usd,
            limit_price,
            order_type,
            reasoning: reasoning.into(),
            meta: SignalMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: SignalMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn is_exit(&self) -> bool {
        self.meta.is_exit
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A persisted order record. `size_shares` is set by the order manager's
/// one-time USD→shares conversion.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: i64,
    pub exchange_order_id: Option<String>,
    pub signal_id: String,
    pub strategy: StrategyId,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub size_shares: f64,
    pub price: f64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub filled_shares: f64,
    pub avg_fill_price: Option<f64>,
    pub fee_paid: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// One tier of the take-profit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TpLevel {
    pub trigger_price: f64,
    /// Fraction of current shares to sell when triggered, in (0, 1].
    pub fraction_to_sell: f64,
    #[serde(default)]
    pub fired: bool,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: i64,
    pub market_id: String,
    pub token_id: String,
    pub outcome: Outcome,
    pub side: PositionSide,
    pub strategy: StrategyId,
    pub entry_price: f64,
    /// Shares currently held.
    pub shares: f64,
    /// Shares at open, before partial exits.
    pub entry_shares: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub source_wallet: Option<String>,
    pub tp_levels: Vec<TpLevel>,
    pub sl_price: Option<f64>,
    pub trail_pct: Option<f64>,
    /// Most favorable price seen since the trailing stop armed.
    pub trail_anchor: Option<f64>,
    pub current_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl Position {
    /// Unrealized P&L at `price`, in USD, before fees.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.shares,
            PositionSide::Short => (self.entry_price - price) * self.shares,
        }
    }

    /// True when `price` is at or beyond `level` in the adverse direction.
    pub fn is_adverse(&self, price: f64, level: f64) -> bool {
        match self.side {
            PositionSide::Long => price <= level,
            PositionSide::Short => price >= level,
        }
    }

    /// Entry fee attributable to `shares_closed` of the original size.
    pub fn proportional_entry_fee(&self, shares_closed: f64) -> f64 {
        if self.entry_shares <= 0.0 {
            return 0.0;
        }
        self.entry_fee * (shares_closed / self.entry_shares)
    }

    /// Net realized P&L for closing `shares_closed` at `exit_price`. Gross
    /// is directional; the entry fee is charged proportionally and the exit
    /// fee in full.
    pub fn realized_for_close(&self, exit_price: f64, shares_closed: f64, exit_fee: f64) -> f64 {
        let gross = match self.side {
            PositionSide::Long => (exit_price - self.entry_price) * shares_closed,
            PositionSide::Short => (self.entry_price - exit_price) * shares_closed,
        };
        gross - self.proportional_entry_fee(shares_closed) - exit_fee
    }

    /// Ratchet the trailing anchor in the favorable direction. Returns the
    /// new anchor if it moved.
    pub fn ratchet_trail_anchor(&mut self, price: f64) -> Option<f64> {
        let anchor = self.trail_anchor?;
        let moved = match self.side {
            PositionSide::Long => price > anchor,
            PositionSide::Short => price < anchor,
        };
        if moved {
            self.trail_anchor = Some(price);
            return Some(price);
        }
        None
    }

    /// True if `price` has retraced adversely by `trail_pct` from the anchor.
    pub fn trail_triggered(&self, price: f64) -> bool {
        let (Some(anchor), Some(trail_pct)) = (self.trail_anchor, self.trail_pct) else {
            return false;
        };
        match self.side {
            PositionSide::Long => price <= anchor * (1.0 - trail_pct / 100.0),
            PositionSide::Short => price >= anchor * (1.0 + trail_pct / 100.0),
        }
    }

    /// Current USD value at `price`, falling back to the entry price.
    pub fn value_at(&self, price: Option<f64>) -> f64 {
        price.unwrap_or(self.entry_price) * self.shares
    }
}

// ---------------------------------------------------------------------------
// Market / order book
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub condition_id: String,
    pub question: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub active: bool,
    pub closed: bool,
    pub resolved: bool,
    /// Winning outcome once resolved.
    pub winning_outcome: Option<Outcome>,
    /// Gamma aggregate prices. Strategies that need live quotes read the
    /// CLOB order book instead.
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub volume_usd: Option<f64>,
}

impl Market {
    /// Token id for an outcome. Lookup is by outcome string, never index.
    pub fn token_for(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Yes => &self.yes_token_id,
            Outcome::No => &self.no_token_id,
        }
    }

    pub fn outcome_of(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.yes_token_id {
            Some(Outcome::Yes)
        } else if token_id == self.no_token_id {
            Some(Outcome::No)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub token_id: String,
    pub timestamp: DateTime<Utc>,
    /// Sorted descending (best bid first).
    pub bids: Vec<PriceLevel>,
    /// Sorted ascending (best ask first).
    pub asks: Vec<PriceLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }
}

/// A price tick pushed by the market WebSocket (or the REST fallback).
#[derive(Debug, Clone)]
pub struct PriceEvent {
    pub token_id: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Strategy bookkeeping rows
// ---------------------------------------------------------------------------

/// Last observed holding of a tracked wallet, used for diff detection.
#[derive(Debug, Clone)]
pub struct WhalePosition {
    pub wallet_address: String,
    pub market_id: String,
    pub token_id: String,
    pub shares: f64,
    pub avg_price: f64,
    pub last_seen_at: DateTime<Utc>,
}

/// An active deep-discount resting order. At most one per (market, token);
/// the table write on placement is what enforces that.
#[derive(Debug, Clone)]
pub struct StinkOrder {
    pub market_id: String,
    pub token_id: String,
    pub exchange_order_id: String,
    pub price: f64,
    pub size_usd: f64,
    pub placed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// Valuation snapshot consumed by the risk gate. Cached for about a second;
/// the risk gate rejects on snapshots older than its staleness bound.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub cash_usd: f64,
    pub positions_value_usd: f64,
    pub unrealized_pnl_usd: f64,
    pub realized_pnl_today_usd: f64,
    pub open_positions: usize,
    pub taken_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn total_usd(&self) -> f64 {
        self.cash_usd + self.positions_value_usd
    }

    pub fn age_secs(&self) -> f64 {
        (Utc::now() - self.taken_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}
