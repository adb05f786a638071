/// exchange.rs – Async client for the Polymarket CLOB REST, Gamma and Data
/// APIs plus the market-data WebSocket.
///
/// Every REST call goes through the rate limiter and reports throttles back
/// to it. Paper mode simulates placement and fills so the full pipeline runs
/// without credentials; live mode submits real orders.
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::models::{
    Market, Outcome, OrderBook, OrderStatus, OrderType, PriceEvent, PriceLevel, Side,
};
use crate::rate_limiter::RateLimiter;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Arguments for a single order submission. `size_shares` is already
/// converted from USD by the order manager.
#[derive(Debug, Clone)]
pub struct OrderArgs {
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size_shares: f64,
    pub order_type: OrderType,
}

#[derive(Debug, Clone)]
pub struct PlaceResult {
    pub exchange_order_id: String,
    pub status: OrderStatus,
}

/// A fill reported by the exchange during confirmation.
#[derive(Debug, Clone)]
pub struct ExchangeFill {
    pub trade_id: String,
    pub price: f64,
    pub shares: f64,
    pub fee: f64,
}

/// Terminal-or-not view of an order during confirmation polling.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: OrderStatus,
    pub filled_shares: f64,
    pub avg_fill_price: Option<f64>,
    pub fee_paid: f64,
    pub fills: Vec<ExchangeFill>,
    pub error: Option<String>,
}

/// An order resting on the exchange book.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub exchange_order_id: String,
    pub token_id: String,
    pub price: f64,
    pub size_shares: f64,
}

/// A holding of some wallet as reported by the Data API.
#[derive(Debug, Clone)]
pub struct WalletHolding {
    pub market_id: String,
    pub token_id: String,
    pub shares: f64,
    pub avg_price: f64,
}

// ---------------------------------------------------------------------------
// Paper simulation state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PaperState {
    cash_usd: f64,
    /// exchange_order_id → simulated terminal state.
    orders: HashMap<String, OrderState>,
    /// Price overrides; REST remains the fallback for unset tokens.
    prices: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// ExchangeClient
// ---------------------------------------------------------------------------

pub struct ExchangeClient {
    rest_url: String,
    ws_url: String,
    gamma_url: String,
    data_api_url: String,
    api_key: String,
    api_passphrase: String,
    funder_address: String,
    live: bool,
    taker_fee_rate: f64,
    http: Client,
    limiter: Arc<RateLimiter>,
    paper: Mutex<PaperState>,
    ws_connected: AtomicBool,
    subscribe_tx: Mutex<Option<mpsc::UnboundedSender<Vec<String>>>>,
}

impl ExchangeClient {
    pub fn new(settings: &Settings, limiter: Arc<RateLimiter>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.clob.request_timeout_secs))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            rest_url: settings.clob.rest_url.clone(),
            ws_url: settings.clob.ws_url.clone(),
            gamma_url: settings.clob.gamma_url.clone(),
            data_api_url: settings.clob.data_api_url.clone(),
            api_key: settings.api_key.expose().to_string(),
            api_passphrase: settings.api_passphrase.expose().to_string(),
            funder_address: settings.chain.funder_address.clone(),
            live: settings.is_live(),
            taker_fee_rate: settings.fees.taker_fee_pct / 100.0,
            http,
            limiter,
            paper: Mutex::new(PaperState {
                cash_usd: 1000.0,
                orders: HashMap::new(),
                prices: HashMap::new(),
            }),
            ws_connected: AtomicBool::new(false),
            subscribe_tx: Mutex::new(None),
        })
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn ws_connected(&self) -> bool {
        self.ws_connected.load(Ordering::Relaxed)
    }

    /// GET through the rate limiter with throttle bookkeeping. Transient
    /// failures (timeout, 429, 5xx) retry up to three times; the limiter's
    /// own backoff paces the retries.
    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let mut last_err = anyhow!("no attempts made");
        for _ in 0..3 {
            self.limiter.acquire().await;
            let resp = self.http.get(url).query(query).send().await;
            match resp {
                Ok(resp) if resp.status().as_u16() == 429 => {
                    self.limiter.record_throttle().await;
                    last_err = anyhow!("rate limited: {url}");
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = anyhow!("server error {} from {url}", resp.status());
                }
                Ok(resp) => {
                    self.limiter.record_success().await;
                    return resp.json::<Value>().await.context("parsing response JSON");
                }
                Err(e) => {
                    last_err = anyhow::Error::from(e).context(format!("GET {url}"));
                }
            }
        }
        Err(last_err)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        self.limiter.acquire().await;
        let resp = self
            .http
            .post(url)
            .header("POLY-API-KEY", &self.api_key)
            .header("POLY-PASSPHRASE", &self.api_passphrase)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        if resp.status().as_u16() == 429 {
            self.limiter.record_throttle().await;
            return Err(anyhow!("rate limited: {url}"));
        }
        self.limiter.record_success().await;
        resp.json::<Value>().await.context("parsing response JSON")
    }

    // ------------------------------------------------------------------
    // Markets
    // ------------------------------------------------------------------

    /// Active binary markets from the Gamma API. Markets whose token list
    /// does not carry outcome strings are skipped; index-based token
    /// selection is not allowed.
    pub async fn active_markets(&self, limit: usize) -> Result<Vec<Market>> {
        let url = format!("{}/markets", self.gamma_url);
        let limit_s = limit.to_string();
        let data = self
            .get_json(
                &url,
                &[
                    ("active", "true"),
                    ("closed", "false"),
                    ("limit", limit_s.as_str()),
                ],
            )
            .await?;
        let items = match &data {
            Value::Array(a) => a.clone(),
            Value::Object(o) => o
                .get("markets")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
            _ => vec![],
        };
        Ok(items.iter().filter_map(parse_market).collect())
    }

    /// A single market by condition id.
    pub async fn market(&self, market_id: &str) -> Result<Market> {
        let url = format!("{}/markets", self.gamma_url);
        let data = self.get_json(&url, &[("condition_ids", market_id)]).await?;
        let items = match &data {
            Value::Array(a) => a.clone(),
            Value::Object(o) => o
                .get("markets")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
            _ => vec![],
        };
        items
            .iter()
            .filter_map(parse_market)
            .find(|m| m.condition_id == market_id)
            .ok_or_else(|| anyhow!("market {market_id} not found"))
    }

    // ------------------------------------------------------------------
    // Prices / order book
    // ------------------------------------------------------------------

    pub async fn orderbook(&self, token_id: &str) -> Result<OrderBook> {
        if let Some(price) = self.paper_price(token_id) {
            // Synthetic two-sided book around the simulated price.
            return Ok(OrderBook {
                token_id: token_id.to_string(),
                timestamp: Utc::now(),
                bids: vec![PriceLevel { price: (price - 0.005).max(0.001), size: 1000.0 }],
                asks: vec![PriceLevel { price: (price + 0.005).min(0.999), size: 1000.0 }],
            });
        }
        let url = format!("{}/book", self.rest_url);
        let data = self.get_json(&url, &[("token_id", token_id)]).await?;
        Ok(parse_order_book(&data, token_id))
    }

    /// Live mid price for a token.
    pub async fn price(&self, token_id: &str) -> Result<f64> {
        if let Some(price) = self.paper_price(token_id) {
            return Ok(price);
        }
        let book = self.orderbook(token_id).await?;
        book.mid_price()
            .ok_or_else(|| anyhow!("empty order book for token {token_id}"))
    }

    /// Set a simulated price for paper mode. Live mode ignores overrides.
    pub fn set_paper_price(&self, token_id: &str, price: f64) {
        let mut paper = self.paper.lock().expect("paper state poisoned");
        paper.prices.insert(token_id.to_string(), price);
    }

    fn paper_price(&self, token_id: &str) -> Option<f64> {
        if self.live {
            return None;
        }
        self.paper
            .lock()
            .expect("paper state poisoned")
            .prices
            .get(token_id)
            .copied()
    }

    // ------------------------------------------------------------------
    // Balances / wallet holdings
    // ------------------------------------------------------------------

    /// USDC balance of the funder wallet. In paper mode this is the
    /// simulated cash book.
    pub async fn usdc_balance(&self) -> Result<f64> {
        if !self.live {
            return Ok(self.paper.lock().expect("paper state poisoned").cash_usd);
        }
        let url = format!("{}/balance-allowance", self.rest_url);
        let data = self
            .get_json(&url, &[("asset_type", "COLLATERAL")])
            .await?;
        data["balance"]
            .as_f64()
            .or_else(|| data["balance"].as_str().and_then(|s| s.parse().ok()))
            .map(|raw| raw / 1e6) // USDC has 6 decimals on-chain
            .ok_or_else(|| anyhow!("balance missing from response"))
    }

    /// Our own on-exchange holdings, for reconciliation against the store.
    /// Paper mode has no on-chain holdings; the store is authoritative.
    pub async fn positions(&self) -> Result<Vec<WalletHolding>> {
        if !self.live || self.funder_address.is_empty() {
            return Ok(Vec::new());
        }
        self.wallet_positions(&self.funder_address).await
    }

    /// Current holdings of an arbitrary wallet (whale tracking).
    pub async fn wallet_positions(&self, address: &str) -> Result<Vec<WalletHolding>> {
        let url = format!("{}/positions", self.data_api_url);
        let data = self.get_json(&url, &[("user", address)]).await?;
        let items = data.as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                let market_id = str_field(item, &["conditionId", "condition_id", "market"])?;
                let token_id = str_field(item, &["asset", "tokenId", "token_id"])?;
                let shares = num_field(item, &["size", "amount"])?;
                if shares <= 0.0 {
                    return None;
                }
                Some(WalletHolding {
                    market_id,
                    token_id,
                    shares,
                    avg_price: num_field(item, &["avgPrice", "avg_price"]).unwrap_or(0.0),
                })
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub async fn place_order(&self, args: &OrderArgs) -> Result<PlaceResult> {
        if !self.live {
            return Ok(self.paper_place(args));
        }

        let payload = json!({
            "tokenID": args.token_id,
            "side": args.side.as_str(),
            "type": args.order_type.as_str(),
            "price": (args.price * 1000.0).round() / 1000.0,
            "size": (args.size_shares * 100.0).floor() / 100.0,
        });
        info!(
            token = %truncate(&args.token_id),
            side = %args.side,
            price = args.price,
            shares = args.size_shares,
            order_type = %args.order_type,
            "placing order"
        );
        let resp = self
            .post_json(&format!("{}/order", self.rest_url), &payload)
            .await?;

        if let Some(err) = resp["error"].as_str() {
            // Exchange rejection: no retry, the reason is surfaced upstream.
            return Err(anyhow!("exchange rejected order: {err}"));
        }
        let id = str_field(&resp, &["orderID", "orderId", "id"])
            .ok_or_else(|| anyhow!("order response missing id: {resp}"))?;
        let status = match resp["status"].as_str() {
            Some("matched") | Some("filled") => OrderStatus::Filled,
            Some("live") | Some("open") => OrderStatus::Submitted,
            _ => OrderStatus::Submitted,
        };
        Ok(PlaceResult {
            exchange_order_id: id,
            status,
        })
    }

    /// Simulated placement: immediate fill at the limit price with the
    /// configured taker fee; cash book adjusted accordingly.
    fn paper_place(&self, args: &OrderArgs) -> PlaceResult {
        let order_id = format!("paper_{}", Uuid::new_v4());
        let cost = args.price * args.size_shares;
        let fee = cost * self.taker_fee_rate;
        let fill = ExchangeFill {
            trade_id: format!("papertrade_{}", Uuid::new_v4()),
            price: args.price,
            shares: args.size_shares,
            fee,
        };
        let state = OrderState {
            status: OrderStatus::Filled,
            filled_shares: args.size_shares,
            avg_fill_price: Some(args.price),
            fee_paid: fee,
            fills: vec![fill],
            error: None,
        };
        {
            let mut paper = self.paper.lock().expect("paper state poisoned");
            match args.side {
                Side::Buy => paper.cash_usd -= cost + fee,
                Side::Sell => paper.cash_usd += cost - fee,
            }
            paper.orders.insert(order_id.clone(), state);
        }
        info!(
            side = %args.side,
            price = args.price,
            shares = args.size_shares,
            "[PAPER] order filled"
        );
        PlaceResult {
            exchange_order_id: order_id,
            status: OrderStatus::Filled,
        }
    }

    /// Poll the exchange view of one order during fill confirmation.
    pub async fn order_state(&self, exchange_order_id: &str) -> Result<OrderState> {
        if !self.live {
            let paper = self.paper.lock().expect("paper state poisoned");
            return paper
                .orders
                .get(exchange_order_id)
                .cloned()
                .ok_or_else(|| anyhow!("unknown paper order {exchange_order_id}"));
        }

        let url = format!("{}/data/order/{exchange_order_id}", self.rest_url);
        let data = self.get_json(&url, &[]).await?;

        let status = match data["status"].as_str() {
            Some("matched") | Some("filled") => OrderStatus::Filled,
            Some("live") | Some("open") => OrderStatus::Submitted,
            Some("cancelled") | Some("canceled") => OrderStatus::Cancelled,
            Some("rejected") => OrderStatus::Rejected,
            _ => OrderStatus::Submitted,
        };
        let filled = num_field(&data, &["size_matched", "sizeMatched"]).unwrap_or(0.0);
        let price = num_field(&data, &["price"]);
        let fills: Vec<ExchangeFill> = data["associate_trades"]
            .as_array()
            .map(|trades| {
                trades
                    .iter()
                    .filter_map(|t| {
                        Some(ExchangeFill {
                            trade_id: str_field(t, &["id", "trade_id"])?,
                            price: num_field(t, &["price"])?,
                            shares: num_field(t, &["size", "shares"])?,
                            fee: num_field(t, &["fee", "fee_rate_bps"]).unwrap_or(0.0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let status = if status == OrderStatus::Submitted && filled > 0.0 {
            OrderStatus::Partial
        } else {
            status
        };
        Ok(OrderState {
            status,
            filled_shares: filled,
            avg_fill_price: price,
            fee_paid: fills.iter().map(|f: &ExchangeFill| f.fee).sum(),
            fills,
            error: data["error"].as_str().map(String::from),
        })
    }

    pub async fn open_orders(&self) -> Result<Vec<OpenOrder>> {
        if !self.live {
            // Paper orders fill immediately; nothing rests on the book.
            return Ok(Vec::new());
        }
        let url = format!("{}/data/orders", self.rest_url);
        let data = self.get_json(&url, &[]).await?;
        let items = data.as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                Some(OpenOrder {
                    exchange_order_id: str_field(item, &["id", "orderID"])?,
                    token_id: str_field(item, &["asset_id", "tokenID", "token_id"])?,
                    price: num_field(item, &["price"])?,
                    size_shares: num_field(item, &["original_size", "size"])?,
                })
            })
            .collect())
    }

    pub async fn cancel_order(&self, exchange_order_id: &str) -> Result<()> {
        if !self.live {
            info!(order_id = exchange_order_id, "[PAPER] cancel order");
            return Ok(());
        }
        self.post_json(
            &format!("{}/cancel", self.rest_url),
            &json!({ "orderID": exchange_order_id }),
        )
        .await?;
        Ok(())
    }

    pub async fn cancel_all(&self) -> Result<()> {
        if !self.live {
            info!("[PAPER] cancel all orders");
            return Ok(());
        }
        self.post_json(&format!("{}/cancel-all", self.rest_url), &json!({}))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // WebSocket price stream
    // ------------------------------------------------------------------

    /// Start the market WebSocket as a background task.
    ///
    /// Returns a receiver of price events and a watch of the connection
    /// state. The task reconnects with exponential backoff and re-issues
    /// every subscription after each reconnect; while disconnected the
    /// position manager falls back to REST polling.
    pub fn start_price_stream(
        self: &Arc<Self>,
        initial_tokens: Vec<String>,
    ) -> (mpsc::Receiver<PriceEvent>, watch::Receiver<bool>) {
        let (event_tx, event_rx) = mpsc::channel::<PriceEvent>(1024);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<Vec<String>>();
        *self.subscribe_tx.lock().expect("subscribe channel poisoned") = Some(sub_tx);

        let ws_url = self.ws_url.clone();
        let client = Arc::clone(self);

        tokio::spawn(async move {
            let mut tokens: HashSet<String> = initial_tokens.into_iter().collect();
            let mut backoff = 1u64;
            loop {
                // Fold in any subscriptions requested while disconnected.
                while let Ok(more) = sub_rx.try_recv() {
                    tokens.extend(more);
                }

                let session =
                    ws_run(&ws_url, &mut tokens, &event_tx, &mut sub_rx, |up| {
                        client.ws_connected.store(up, Ordering::Relaxed);
                        let _ = connected_tx.send(up);
                    })
                    .await;
                client.ws_connected.store(false, Ordering::Relaxed);
                let _ = connected_tx.send(false);

                match session {
                    Ok(received_any) => {
                        if received_any {
                            backoff = 1;
                        }
                        info!("market websocket disconnected, reconnecting in {backoff}s");
                    }
                    Err(e) => {
                        warn!("market websocket error: {e} - reconnecting in {backoff}s");
                    }
                }
                if event_tx.is_closed() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(60);
            }
        });

        (event_rx, connected_rx)
    }

    /// Add tokens to the WebSocket subscription set.
    pub fn subscribe(&self, token_ids: Vec<String>) {
        if token_ids.is_empty() {
            return;
        }
        if let Some(tx) = self
            .subscribe_tx
            .lock()
            .expect("subscribe channel poisoned")
            .as_ref()
        {
            let _ = tx.send(token_ids);
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket internals
// ---------------------------------------------------------------------------

/// Run one WebSocket session. Returns Ok(true) if any message arrived
/// (caller resets backoff), Ok(false) on a quiet close, Err on failure.
async fn ws_run(
    ws_url: &str,
    tokens: &mut HashSet<String>,
    event_tx: &mpsc::Sender<PriceEvent>,
    sub_rx: &mut mpsc::UnboundedReceiver<Vec<String>>,
    set_connected: impl Fn(bool),
) -> Result<bool> {
    info!("connecting to market websocket: {ws_url}");
    let (mut ws, _) = connect_async(ws_url).await.context("websocket connect")?;
    set_connected(true);

    // Re-issue every subscription on each (re)connect.
    if !tokens.is_empty() {
        let sub = json!({
            "type": "subscribe",
            "channels": [{
                "name": "market",
                "token_ids": tokens.iter().collect::<Vec<_>>(),
            }],
        });
        ws.send(Message::Text(sub.to_string())).await?;
        info!("subscribed to {} tokens", tokens.len());
    }

    let mut received_any = false;
    loop {
        tokio::select! {
            msg = ws.next() => {
                let Some(msg) = msg else { break };
                match msg.context("websocket read")? {
                    Message::Text(text) => {
                        received_any = true;
                        for event in parse_price_events(&text) {
                            if event_tx.try_send(event).is_err() {
                                debug!("price event channel full, dropping tick");
                            }
                        }
                    }
                    Message::Ping(data) => {
                        ws.send(Message::Pong(data)).await.ok();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            more = sub_rx.recv() => {
                let Some(more) = more else { break };
                let fresh: Vec<String> = more
                    .into_iter()
                    .filter(|t| tokens.insert(t.clone()))
                    .collect();
                if !fresh.is_empty() {
                    let sub = json!({
                        "type": "subscribe",
                        "channels": [{ "name": "market", "token_ids": fresh }],
                    });
                    ws.send(Message::Text(sub.to_string())).await?;
                }
            }
        }
    }
    Ok(received_any)
}

/// Extract price ticks from one WebSocket payload. Book updates yield the
/// mid price; trade events yield the traded price.
fn parse_price_events(text: &str) -> Vec<PriceEvent> {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    let items: Vec<&Value> = match &msg {
        Value::Array(a) => a.iter().collect(),
        other => vec![other],
    };

    let mut events = Vec::new();
    for item in items {
        let event_type = item["event_type"].as_str().or_else(|| item["type"].as_str());
        let token_id = match str_field(item, &["asset_id", "token_id"]) {
            Some(t) => t,
            None => continue,
        };
        let price = match event_type {
            Some("book") => {
                let book = parse_order_book(item, &token_id);
                book.mid_price()
            }
            Some("price_change") | Some("last_trade_price") => num_field(item, &["price"]),
            _ => None,
        };
        if let Some(price) = price {
            events.push(PriceEvent {
                token_id,
                price,
                timestamp: Utc::now(),
            });
        }
    }
    events
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_order_book(data: &Value, token_id: &str) -> OrderBook {
    let parse_levels = |key: &str| -> Vec<PriceLevel> {
        data[key]
            .as_array()
            .unwrap_or(&vec![])
            .iter()
            .filter_map(|l| {
                let price = num_field(l, &["price"])?;
                let size = num_field(l, &["size"])?;
                Some(PriceLevel { price, size })
            })
            .collect()
    };

    let mut bids = parse_levels("bids");
    let mut asks = parse_levels("asks");
    bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
    asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

    OrderBook {
        token_id: token_id.to_string(),
        timestamp: Utc::now(),
        bids,
        asks,
    }
}

/// Parse one Gamma market entry. Tokens are matched by their outcome
/// string; entries without outcome-labelled tokens are skipped.
fn parse_market(item: &Value) -> Option<Market> {
    let condition_id = str_field(item, &["conditionId", "condition_id"])?;
    let question = str_field(item, &["question"]).unwrap_or_default();

    let tokens = item["tokens"].as_array()?;
    let mut yes_token = None;
    let mut no_token = None;
    let mut winning_outcome = None;
    for token in tokens {
        let outcome: Outcome = str_field(token, &["outcome"])?.parse().ok()?;
        let token_id = str_field(token, &["token_id", "tokenId"])?;
        if token["winner"].as_bool() == Some(true) {
            winning_outcome = Some(outcome);
        }
        match outcome {
            Outcome::Yes => yes_token = Some((token_id, num_field(token, &["price"]))),
            Outcome::No => no_token = Some((token_id, num_field(token, &["price"]))),
        }
    }
    let (yes_token_id, yes_price) = yes_token?;
    let (no_token_id, no_price) = no_token?;

    Some(Market {
        condition_id,
        question,
        yes_token_id,
        no_token_id,
        active: item["active"].as_bool().unwrap_or(true),
        closed: item["closed"].as_bool().unwrap_or(false),
        resolved: item["resolved"]
            .as_bool()
            .or_else(|| item["isResolved"].as_bool())
            .unwrap_or(false),
        winning_outcome,
        yes_price,
        no_price,
        volume_usd: num_field(item, &["volume", "volumeNum", "volume_usd"]),
    })
}

fn str_field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| item[*k].as_str())
        .map(String::from)
        .filter(|s| !s.is_empty())
}

fn num_field(item: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| {
        item[*k]
            .as_f64()
            .or_else(|| item[*k].as_str().and_then(|s| s.parse().ok()))
    })
}

fn truncate(s: &str) -> &str {
    &s[..s.len().min(10)]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_tokens_selected_by_outcome_not_index() {
        // NO listed first: index-based parsing would swap the tokens.
        let item = json!({
            "conditionId": "cond1",
            "question": "Will it happen?",
            "tokens": [
                {"outcome": "No", "token_id": "tok_no", "price": 0.4},
                {"outcome": "Yes", "token_id": "tok_yes", "price": 0.6},
            ],
            "active": true,
            "closed": false,
        });
        let market = parse_market(&item).unwrap();
        assert_eq!(market.yes_token_id, "tok_yes");
        assert_eq!(market.no_token_id, "tok_no");
        assert_eq!(market.token_for(Outcome::No), "tok_no");
    }

    #[test]
    fn market_without_outcome_labels_skipped() {
        let item = json!({
            "conditionId": "cond2",
            "question": "?",
            "tokens": [
                {"token_id": "a"},
                {"token_id": "b"},
            ],
        });
        assert!(parse_market(&item).is_none());
    }

    #[test]
    fn winner_flag_sets_winning_outcome() {
        let item = json!({
            "conditionId": "cond3",
            "question": "?",
            "resolved": true,
            "tokens": [
                {"outcome": "Yes", "token_id": "y", "winner": true},
                {"outcome": "No", "token_id": "n", "winner": false},
            ],
        });
        let market = parse_market(&item).unwrap();
        assert!(market.resolved);
        assert_eq!(market.winning_outcome, Some(Outcome::Yes));
    }

    #[test]
    fn price_events_from_book_message() {
        let text = json!({
            "event_type": "book",
            "asset_id": "tok1",
            "bids": [{"price": "0.48", "size": "100"}],
            "asks": [{"price": "0.52", "size": "80"}],
        })
        .to_string();
        let events = parse_price_events(&text);
        assert_eq!(events.len(), 1);
        assert!((events[0].price - 0.50).abs() < 1e-9);
    }

    #[test]
    fn price_events_from_trade_message() {
        let text = json!([{
            "event_type": "last_trade_price",
            "asset_id": "tok2",
            "price": "0.61",
        }])
        .to_string();
        let events = parse_price_events(&text);
        assert_eq!(events.len(), 1);
        assert!((events[0].price - 0.61).abs() < 1e-9);
    }

    #[tokio::test]
    async fn paper_order_fills_immediately_and_moves_cash() {
        let settings = Settings::default();
        let limiter = Arc::new(RateLimiter::new(100, 60.0));
        let client = ExchangeClient::new(&settings, limiter).unwrap();

        let start_cash = client.usdc_balance().await.unwrap();
        let result = client
            .place_order(&OrderArgs {
                token_id: "tok".into(),
                side: Side::Buy,
                price: 0.50,
                size_shares: 100.0,
                order_type: OrderType::Fok,
            })
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);

        let state = client.order_state(&result.exchange_order_id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
        assert_eq!(state.fills.len(), 1);

        let cash = client.usdc_balance().await.unwrap();
        // 100 shares at 0.50 plus taker fee
        assert!(cash < start_cash - 50.0);
    }
}
