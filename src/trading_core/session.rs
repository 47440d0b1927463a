//! Exchange session assembly
//!
//! Builds the REST client and the three websocket streams, seeds the cache
//! from REST, and wires stream pushes into the cache and ledger. The public
//! stream feeds market data, the private stream feeds account events, and
//! the trade stream carries order commands.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bybit::models::{KlinePush, OrderData, OrderbookPush, WalletAccount};
use crate::bybit::rest::BybitRestClient;
use crate::bybit::ws::{self, SessionEvent, WsSession};
use crate::bybit::TradingRules;
use crate::config::{ApiCredentials, BotConfig};
use crate::trading_core::ledger::{OrderLedger, OutstandingOrder, ReconcileAction};
use crate::trading_core::market_cache::{Candle, MarketCache, CANDLE_CAPACITY};

/// One connected exchange session: REST plus the three streams, sharing the
/// cache and ledger with the decision loop.
pub struct TradingSession {
    pub config: BotConfig,
    pub rest: BybitRestClient,
    /// Populated by [`init_trading_data`](Self::init_trading_data).
    pub rules: Option<TradingRules>,
    pub public_ws: Arc<WsSession>,
    pub private_ws: Arc<WsSession>,
    pub trade_ws: Arc<WsSession>,
    pub cache: Arc<Mutex<MarketCache>>,
    pub ledger: Arc<Mutex<OrderLedger>>,
}

impl TradingSession {
    /// Build the clients and open all three streams.
    pub async fn connect(
        config: BotConfig,
        credentials: ApiCredentials,
        testnet: bool,
    ) -> Result<Self> {
        let rest = BybitRestClient::new(credentials.rest, testnet);

        let (public_url, private_url, trade_url) = if testnet {
            (
                ws::TESTNET_PUBLIC_WS_URL,
                ws::TESTNET_PRIVATE_WS_URL,
                ws::TESTNET_TRADE_WS_URL,
            )
        } else {
            (
                ws::MAINNET_PUBLIC_WS_URL,
                ws::MAINNET_PRIVATE_WS_URL,
                ws::MAINNET_TRADE_WS_URL,
            )
        };

        let (public_ws, public_events) = WsSession::new("public", public_url, None);
        let (private_ws, private_events) =
            WsSession::new("private", private_url, Some(credentials.private_ws));
        let (trade_ws, trade_events) =
            WsSession::new("trade", trade_url, Some(credentials.trade_ws));
        spawn_event_logger(public_events);
        spawn_event_logger(private_events);
        spawn_event_logger(trade_events);

        public_ws.open().await.context("Failed to open public stream")?;
        private_ws.open().await.context("Failed to open private stream")?;
        trade_ws.open().await.context("Failed to open trade stream")?;

        Ok(Self {
            config,
            rest,
            rules: None,
            public_ws: Arc::new(public_ws),
            private_ws: Arc::new(private_ws),
            trade_ws: Arc::new(trade_ws),
            cache: Arc::new(Mutex::new(MarketCache::new())),
            ledger: Arc::new(Mutex::new(OrderLedger::new())),
        })
    }

    /// Seed cache and ledger from REST before any decisions are made. Pulls
    /// run strictly sequentially: wallet, candle backfill, book, open
    /// orders, instrument rules.
    pub async fn init_trading_data(&mut self) -> Result<()> {
        let pair = &self.config.pair;

        let account = self
            .rest
            .get_wallet_balance()
            .await
            .context("Failed to fetch wallet balance")?;
        self.cache.lock().unwrap().merge_wallet(&account);

        let klines = self
            .rest
            .get_candles(pair, self.config.bands.timeframe_minutes, CANDLE_CAPACITY)
            .await
            .context("Failed to backfill candles")?;
        // REST returns newest first.
        let mut candles = klines
            .list
            .iter()
            .map(|row| Candle::from_kline_row(row))
            .collect::<Result<Vec<_>>>()
            .context("Failed to parse candle backfill")?;
        candles.reverse();
        info!("backfilled {} candles for {pair}", candles.len());
        self.cache.lock().unwrap().seed_candles(candles, Utc::now());

        let book = self
            .rest
            .get_order_book(pair)
            .await
            .context("Failed to fetch order book")?;
        self.cache.lock().unwrap().merge_book(&book.b, &book.a, Utc::now());

        self.reconcile_orders().await?;

        let rules = self
            .rest
            .get_trading_rules(pair)
            .await
            .context("Failed to fetch trading rules")?;
        info!(
            "trading rules for {pair}: tick={} precision={} minQty={}",
            rules.tick_size, rules.base_precision, rules.min_order_qty
        );
        self.rules = Some(rules);
        Ok(())
    }

    /// Pull open orders and bring the ledger in line, cancelling everything
    /// when more than one order is live.
    pub async fn reconcile_orders(&self) -> Result<()> {
        let pair = &self.config.pair;
        let open = self
            .rest
            .get_open_orders(pair)
            .await
            .context("Failed to fetch open orders")?;
        let open: Vec<OutstandingOrder> = open.iter().map(OutstandingOrder::from).collect();
        let action = self.ledger.lock().unwrap().reconcile(open);
        if action == ReconcileAction::CancelAll {
            self.rest
                .cancel_all_orders(pair)
                .await
                .context("Failed to cancel drifted orders")?;
        }
        Ok(())
    }

    /// Subscribe the market-data and account topics.
    pub fn start_streams(&self) {
        let pair = self.config.pair.clone();
        let interval = self.config.bands.timeframe_minutes;

        let cache = Arc::clone(&self.cache);
        self.public_ws.subscribe(
            &format!("orderbook.1.{pair}"),
            Arc::new(move |frame: &Value| {
                let Some(data) = frame.get("data") else { return };
                match serde_json::from_value::<OrderbookPush>(data.clone()) {
                    Ok(push) => cache.lock().unwrap().merge_book(&push.b, &push.a, Utc::now()),
                    Err(e) => warn!("dropped malformed orderbook push: {e}"),
                }
            }),
        );

        let cache = Arc::clone(&self.cache);
        self.public_ws.subscribe(
            &format!("kline.{interval}.{pair}"),
            Arc::new(move |frame: &Value| {
                let Some(entries) = frame.get("data").and_then(Value::as_array) else {
                    return;
                };
                let mut cache = cache.lock().unwrap();
                let now = Utc::now();
                for entry in entries {
                    match serde_json::from_value::<KlinePush>(entry.clone()) {
                        Ok(push) if push.confirm => {
                            cache.store_candle(Candle::from(&push), now);
                        }
                        // In-progress candles only prove the feed is alive.
                        Ok(_) => cache.note_candle_feed(now),
                        Err(e) => warn!("dropped malformed kline push: {e}"),
                    }
                }
            }),
        );

        let cache = Arc::clone(&self.cache);
        self.private_ws.subscribe(
            "wallet",
            Arc::new(move |frame: &Value| {
                let Some(entries) = frame.get("data").and_then(Value::as_array) else {
                    return;
                };
                let mut cache = cache.lock().unwrap();
                for entry in entries {
                    match serde_json::from_value::<WalletAccount>(entry.clone()) {
                        Ok(account) => cache.merge_wallet(&account),
                        Err(e) => warn!("dropped malformed wallet push: {e}"),
                    }
                }
            }),
        );

        let ledger = Arc::clone(&self.ledger);
        let trade_ws = Arc::clone(&self.trade_ws);
        let symbol = pair.clone();
        self.private_ws.subscribe(
            "order.spot",
            Arc::new(move |frame: &Value| {
                let Some(entries) = frame.get("data").and_then(Value::as_array) else {
                    return;
                };
                for entry in entries {
                    let order = match serde_json::from_value::<OrderData>(entry.clone()) {
                        Ok(order) => order,
                        Err(e) => {
                            warn!("dropped malformed order push: {e}");
                            continue;
                        }
                    };
                    if order.symbol != symbol {
                        continue;
                    }
                    info!(
                        "order {} {} {} @ {}: {:?}",
                        order.order_id, order.side, order.qty, order.price, order.order_status
                    );
                    if let Some(conflict) = ledger.lock().unwrap().apply(&order) {
                        trade_ws.cancel_order(json!({
                            "category": "spot",
                            "symbol": symbol,
                            "orderId": conflict,
                        }));
                    }
                }
            }),
        );

        let symbol = pair.clone();
        self.private_ws.subscribe(
            "execution.spot",
            Arc::new(move |frame: &Value| {
                let Some(entries) = frame.get("data").and_then(Value::as_array) else {
                    return;
                };
                for entry in entries {
                    if entry.get("symbol").and_then(Value::as_str) != Some(symbol.as_str()) {
                        continue;
                    }
                    let side = entry.get("side").and_then(Value::as_str).unwrap_or("?");
                    let qty = entry.get("execQty").and_then(Value::as_str).unwrap_or("?");
                    let price = entry.get("execPrice").and_then(Value::as_str).unwrap_or("?");
                    info!("execution: {side} {qty} {symbol} @ {price}");
                }
            }),
        );
    }

    /// Close all three streams.
    pub fn shutdown(&self) {
        self.public_ws.close();
        self.private_ws.close();
        self.trade_ws.close();
    }
}

fn spawn_event_logger(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Error(msg) => warn!("{msg}"),
                SessionEvent::Reconnecting => warn!("stream lost, reconnecting"),
                other => info!("stream event: {other:?}"),
            }
        }
    });
}
