/// config.rs – Load settings from config.yaml + environment variables.
///
/// Environment variables always override YAML values.
/// API credentials and the wallet key are read exclusively from the
/// environment / .env file and never appear in YAML, logs or dumps.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::StrategyId;

/// Native USDC on Polygon. The bridged variant (USDC.e) has a different
/// contract; reading balances from it silently reports the wrong funds.
pub const NATIVE_USDC_POLYGON: &str = "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359";
const BRIDGED_USDC_POLYGON: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";

// ---------------------------------------------------------------------------
// Secret wrapper
// ---------------------------------------------------------------------------

/// An opaque secret that redacts itself in Debug/Display output and is
/// skipped by serde. Call `expose()` only at the point of use.
#[derive(Clone, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_env(var: &str) -> Self {
        Self(std::env::var(var).unwrap_or_default())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_empty() { "<empty>" } else { "***" })
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_empty() { "<empty>" } else { "***" })
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BotConfig {
    /// "paper" or "live".
    pub trading_mode: String,
    pub log_level: String,
    /// Path to the SQLite database file.
    pub db_path: String,
    pub health_port: u16,
    /// Bounded entry-signal queue capacity.
    pub signal_queue_capacity: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trading_mode: "paper".into(),
            log_level: "info".into(),
            db_path: "data/polybot.db".into(),
            health_port: 8080,
            signal_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClobConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub gamma_url: String,
    pub data_api_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Rate limit: requests per window.
    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: f64,
}

impl Default for ClobConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://clob.polymarket.com".into(),
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".into(),
            gamma_url: "https://gamma-api.polymarket.com".into(),
            data_api_url: "https://data-api.polymarket.com".into(),
            request_timeout_secs: 10,
            // 55, not 60, for safety margin under the exchange's 60/min cap.
            rate_limit_requests: 55,
            rate_limit_window_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Chain-native stablecoin contract; never the bridged variant.
    pub usdc_contract: String,
    pub funder_address: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://polygon-rpc.com".into(),
            usdc_contract: NATIVE_USDC_POLYGON.into(),
            funder_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Max single position as a % of portfolio.
    pub max_position_pct: f64,
    pub max_open_positions: usize,
    /// Halt entries when realized-today + unrealized open P&L breaches this.
    pub daily_loss_pct: f64,
    /// Post-trade cash must stay above this % of portfolio.
    pub reserve_pct: f64,
    /// Minimum declared edge after fees, percent.
    pub min_edge_pct: f64,
    /// Skip trades below this notional (fee protection).
    pub min_position_size_usd: f64,
    /// Reject when the portfolio snapshot is older than this.
    pub snapshot_stale_secs: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_pct: 10.0,
            max_open_positions: 10,
            daily_loss_pct: 5.0,
            reserve_pct: 20.0,
            min_edge_pct: 5.0,
            min_position_size_usd: 10.0,
            snapshot_stale_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Taker fee applied per leg on the dollar cost, percent.
    pub taker_fee_pct: f64,
    /// Fee on winnings at resolution, percent.
    pub winner_fee_pct: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            taker_fee_pct: 3.15,
            winner_fee_pct: 2.0,
        }
    }
}

/// One tier of the take-profit ladder: when the position has gained
/// `gain_pct`, sell `sell_pct` of the remaining shares.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TakeProfitTier {
    pub gain_pct: f64,
    pub sell_pct: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExitConfig {
    pub take_profit_tiers: Vec<TakeProfitTier>,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    /// Exit retry backoff cap in seconds.
    pub retry_cap_secs: u64,
    pub max_exit_attempts: u32,
    /// Fill-confirmation polling window.
    pub confirm_poll_ms: u64,
    pub confirm_timeout_secs: u64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit_tiers: vec![
                TakeProfitTier { gain_pct: 50.0, sell_pct: 50.0 },
                TakeProfitTier { gain_pct: 100.0, sell_pct: 100.0 },
            ],
            stop_loss_pct: 30.0,
            trailing_stop_pct: 15.0,
            retry_cap_secs: 300,
            max_exit_attempts: 8,
            confirm_poll_ms: 500,
            confirm_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CopyTraderConfig {
    pub enabled: bool,
    pub allocation_pct: f64,
    /// "fixed", "portfolio_pct" or "whale_pct".
    pub sizing_method: String,
    pub fixed_size_usd: f64,
    pub portfolio_pct_per_trade: f64,
    pub whale_pct: f64,
    /// Conviction filter: skip whale holdings below this current USD value.
    pub min_whale_position_usd: f64,
    /// Skip when price moved adversely more than this from whale entry.
    pub max_slippage_pct: f64,
    pub poll_interval_secs: u64,
}

impl Default for CopyTraderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allocation_pct: 40.0,
            sizing_method: "fixed".into(),
            fixed_size_usd: 50.0,
            portfolio_pct_per_trade: 5.0,
            whale_pct: 10.0,
            min_whale_position_usd: 500.0,
            max_slippage_pct: 5.0,
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArbScannerConfig {
    pub enabled: bool,
    pub allocation_pct: f64,
    /// Opportunity when ask_yes + ask_no < 1 − margin.
    pub margin: f64,
    pub scan_interval_secs: u64,
    /// Total USD spent across both legs of one arb.
    pub size_usd: f64,
    pub max_markets_per_scan: usize,
}

impl Default for ArbScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allocation_pct: 30.0,
            margin: 0.05,
            scan_interval_secs: 10,
            size_usd: 100.0,
            max_markets_per_scan: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StinkBidderConfig {
    pub enabled: bool,
    pub allocation_pct: f64,
    pub min_discount_pct: f64,
    pub max_discount_pct: f64,
    pub max_active_bids: usize,
    pub min_market_volume_usd: f64,
    pub bid_size_usd: f64,
    pub refresh_interval_secs: u64,
}

impl Default for StinkBidderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allocation_pct: 20.0,
            min_discount_pct: 70.0,
            max_discount_pct: 90.0,
            max_active_bids: 10,
            min_market_volume_usd: 10_000.0,
            bid_size_usd: 20.0,
            refresh_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub chat_id: String,
    /// Token the operator must echo to confirm a chat `kill` command.
    pub kill_confirmation_token: String,
    /// Identical alert payloads within this window are suppressed.
    pub dedup_window_secs: u64,
    /// UTC hour for the daily summary alert.
    pub daily_summary_utc_hour: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            chat_id: String::new(),
            kill_confirmation_token: "CONFIRM".into(),
            dedup_window_secs: 300,
            daily_summary_utc_hour: 0,
        }
    }
}

/// A tracked whale wallet.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WalletEntry {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_wallet_allocation")]
    pub max_allocation_usd: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_wallet_allocation() -> f64 {
    500.0
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub bot: BotConfig,
    pub clob: ClobConfig,
    pub chain: ChainConfig,
    pub risk: RiskConfig,
    pub fees: FeeConfig,
    pub exits: ExitConfig,
    pub copy_trader: CopyTraderConfig,
    pub arb_scanner: ArbScannerConfig,
    pub stink_bidder: StinkBidderConfig,
    pub telegram: TelegramConfig,
    pub wallets: Vec<WalletEntry>,

    // Credentials – populated from env, never from YAML.
    #[serde(skip)]
    pub api_key: Secret,
    #[serde(skip)]
    pub api_secret: Secret,
    #[serde(skip)]
    pub api_passphrase: Secret,
    #[serde(skip)]
    pub wallet_private_key: Secret,
    #[serde(skip)]
    pub telegram_bot_token: Secret,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bot: BotConfig::default(),
            clob: ClobConfig::default(),
            chain: ChainConfig::default(),
            risk: RiskConfig::default(),
            fees: FeeConfig::default(),
            exits: ExitConfig::default(),
            copy_trader: CopyTraderConfig::default(),
            arb_scanner: ArbScannerConfig::default(),
            stink_bidder: StinkBidderConfig::default(),
            telegram: TelegramConfig::default(),
            wallets: Vec::new(),
            api_key: Secret::default(),
            api_secret: Secret::default(),
            api_passphrase: Secret::default(),
            wallet_private_key: Secret::default(),
            telegram_bot_token: Secret::default(),
        }
    }
}

impl Settings {
    /// Load settings from *config_path* YAML, then overlay env vars and
    /// validate. Missing required fields fail fast here, not at trade time.
    pub fn load(config_path: &str, live_override: bool) -> Result<Self> {
        // Load .env if present (ignore error if absent)
        let _ = dotenvy::dotenv();

        let mut settings = if std::path::Path::new(config_path).exists() {
            let yaml = std::fs::read_to_string(config_path).context("reading config file")?;
            Self::from_yaml(&yaml)?
        } else {
            Settings::default()
        };

        // Credentials from environment only
        settings.api_key = Secret::from_env("POLY_API_KEY");
        settings.api_secret = Secret::from_env("POLY_API_SECRET");
        settings.api_passphrase = Secret::from_env("POLY_API_PASSPHRASE");
        settings.wallet_private_key = Secret::from_env("POLY_PRIVATE_KEY");
        settings.telegram_bot_token = Secret::from_env("TELEGRAM_BOT_TOKEN");

        if let Ok(addr) = std::env::var("POLY_FUNDER_ADDRESS") {
            settings.chain.funder_address = addr;
        }
        if let Ok(chat) = std::env::var("TELEGRAM_CHAT_ID") {
            settings.telegram.chat_id = chat;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            settings.bot.log_level = level;
        }
        if live_override {
            settings.bot.trading_mode = "live".into();
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Parse YAML. An empty document yields defaults, never a null root.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str::<Settings>(yaml).context("parsing config YAML")
    }

    pub fn is_live(&self) -> bool {
        self.bot.trading_mode == "live"
    }

    pub fn allocation_pct(&self, strategy: StrategyId) -> f64 {
        match strategy {
            StrategyId::CopyTrader => self.copy_trader.allocation_pct,
            StrategyId::ArbScanner => self.arb_scanner.allocation_pct,
            StrategyId::StinkBidder => self.stink_bidder.allocation_pct,
        }
    }

    pub fn strategy_enabled(&self, strategy: StrategyId) -> bool {
        match strategy {
            StrategyId::CopyTrader => self.copy_trader.enabled,
            StrategyId::ArbScanner => self.arb_scanner.enabled,
            StrategyId::StinkBidder => self.stink_bidder.enabled,
        }
    }

    pub fn enabled_wallets(&self) -> impl Iterator<Item = &WalletEntry> {
        self.wallets.iter().filter(|w| w.enabled)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.bot.trading_mode.as_str(), "paper" | "live") {
            bail!(
                "trading_mode must be 'paper' or 'live', got '{}'",
                self.bot.trading_mode
            );
        }

        // Live trading requires every credential to be present.
        if self.is_live() {
            let mut missing = Vec::new();
            if self.api_key.is_empty() {
                missing.push("POLY_API_KEY");
            }
            if self.api_secret.is_empty() {
                missing.push("POLY_API_SECRET");
            }
            if self.api_passphrase.is_empty() {
                missing.push("POLY_API_PASSPHRASE");
            }
            if self.wallet_private_key.is_empty() {
                missing.push("POLY_PRIVATE_KEY");
            }
            if self.chain.funder_address.is_empty() {
                missing.push("POLY_FUNDER_ADDRESS");
            }
            if !missing.is_empty() {
                bail!(
                    "live trading requires credentials: {}. Set them in .env or use paper mode",
                    missing.join(", ")
                );
            }
        }

        // Enabled strategy allocations must not oversubscribe the portfolio.
        let total: f64 = StrategyId::ALL
            .iter()
            .filter(|s| self.strategy_enabled(**s))
            .map(|s| self.allocation_pct(*s))
            .sum();
        if total > 100.0 {
            bail!("enabled strategy allocations sum to {total:.1}% (> 100%)");
        }

        let rpc = &self.chain.rpc_url;
        if !(rpc.starts_with("http://")
            || rpc.starts_with("https://")
            || rpc.starts_with("ws://")
            || rpc.starts_with("wss://"))
        {
            bail!("chain.rpc_url must start with http(s):// or ws(s)://, got '{rpc}'");
        }

        if self.chain.usdc_contract.eq_ignore_ascii_case(BRIDGED_USDC_POLYGON) {
            bail!(
                "chain.usdc_contract is the bridged USDC.e contract; \
                 use the chain-native USDC at {NATIVE_USDC_POLYGON}"
            );
        }

        if self.stink_bidder.min_discount_pct > self.stink_bidder.max_discount_pct {
            bail!("stink_bidder.min_discount_pct exceeds max_discount_pct");
        }

        for tier in &self.exits.take_profit_tiers {
            if tier.sell_pct <= 0.0 || tier.sell_pct > 100.0 {
                bail!("take_profit tier sell_pct must be in (0, 100]");
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let s = Settings::from_yaml("").unwrap();
        assert_eq!(s.bot.trading_mode, "paper");
        assert_eq!(s.bot.signal_queue_capacity, 256);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let s = Settings::from_yaml("risk:\n  max_open_positions: 3\n").unwrap();
        assert_eq!(s.risk.max_open_positions, 3);
        assert_eq!(s.risk.max_position_pct, 10.0);
    }

    #[test]
    fn allocation_oversubscription_rejected() {
        let mut s = Settings::default();
        s.copy_trader.allocation_pct = 60.0;
        s.arb_scanner.allocation_pct = 30.0;
        s.stink_bidder.allocation_pct = 20.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn live_mode_without_credentials_rejected() {
        let mut s = Settings::default();
        s.bot.trading_mode = "live".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn bridged_usdc_contract_rejected() {
        let mut s = Settings::default();
        s.chain.usdc_contract = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn bad_rpc_url_rejected() {
        let mut s = Settings::default();
        s.chain.rpc_url = "polygon-rpc.com".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn secret_redacts_in_debug() {
        let secret = Secret::new("super-private-key");
        assert_eq!(format!("{secret:?}"), "***");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "super-private-key");
    }

    #[test]
    fn settings_serialization_skips_secrets() {
        let mut s = Settings::default();
        s.api_key = Secret::new("key-material");
        let dump = serde_yaml::to_string(&s).unwrap();
        assert!(!dump.contains("key-material"));
    }
}
