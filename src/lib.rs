//! Polymarket trading bot: three strategies (whale copy, parity arbitrage,
//! stink bids) feeding one risk-checked execution pipeline.
//!
//! Strategies never touch the exchange. They emit USD-notional [`models::Signal`]s
//! into the [`order_manager::OrderManager`] queue, where the
//! [`risk::RiskGate`] approves or rejects, sizes convert to shares exactly
//! once, orders submit through the rate-limited [`exchange::ExchangeClient`]
//! and results persist transactionally in the [`database::Database`]. The
//! [`position_manager::PositionManager`] watches the price feed and emits
//! exit signals back into the same queue.

pub mod arb_scanner;
pub mod config;
pub mod control;
pub mod copy_trader;
pub mod database;
pub mod exchange;
pub mod health;
pub mod models;
pub mod notifier;
pub mod order_manager;
pub mod pnl;
pub mod position_manager;
pub mod rate_limiter;
pub mod risk;
pub mod stink_bidder;

pub use config::Settings;
pub use database::Database;
pub use models::{Signal, SignalMeta, StrategyId};
