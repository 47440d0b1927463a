//! Decision loop
//!
//! Wakes on a jittered interval, reads the cache, computes bands, asks the
//! strategy for an intent and executes it over the trade stream. Every sixth
//! cycle additionally reconciles the ledger against a REST open-orders pull.
//! A cycle that fails on anything recoverable is logged and skipped; stale
//! market data ends the run.

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use super::bands::BandEngine;
use super::ledger::OutstandingOrder;
use super::market_cache::TopOfBook;
use super::session::TradingSession;
use super::strategy::{Intent, Strategy};
use crate::bybit::models::Side;
use crate::error::SessionFault;

/// Cycle sleep bounds. Jitter keeps the wakeups from aliasing against
/// candle boundaries and exchange-side rate windows.
const CYCLE_MIN_MS: u64 = 8_000;
const CYCLE_MAX_MS: u64 = 12_000;

/// Reconcile the ledger against REST every this many cycles.
const RECONCILE_EVERY: u64 = 6;

/// What to do about the working close order this cycle.
#[derive(Debug, Clone, PartialEq)]
enum CloseAction {
    Submit,
    Cancel(String),
    Amend { qty: f64, price: f64 },
    Nothing,
}

/// Reconcile the wanted close order against the tracked one. The amend
/// quantity re-includes what the tracked order already executed, since the
/// exchange amends total quantity, not remainder.
fn plan_close(
    tracked: Option<&OutstandingOrder>,
    side: Side,
    qty: f64,
    price: f64,
) -> CloseAction {
    let Some(tracked) = tracked else {
        return CloseAction::Submit;
    };
    if tracked.side != side {
        // Wrong direction: cancel and let the next cycle resubmit.
        return CloseAction::Cancel(tracked.id.clone());
    }
    let target_qty = tracked.cum_exec_qty + qty;
    let qty_matches = (tracked.qty - target_qty).abs() < 1e-9;
    let price_matches = (tracked.price - price).abs() < 1e-9;
    if qty_matches && price_matches {
        CloseAction::Nothing
    } else {
        CloseAction::Amend {
            qty: target_qty,
            price,
        }
    }
}

/// The loop that ties everything together.
pub struct SessionLoop {
    session: TradingSession,
    engine: BandEngine,
    strategy: Strategy,
    cycle: u64,
}

impl SessionLoop {
    /// Errors when the session has not pulled its trading rules yet.
    pub fn new(session: TradingSession) -> Result<Self> {
        let rules = session
            .rules
            .ok_or_else(|| anyhow::anyhow!("session not initialized: trading rules missing"))?;
        let config = &session.config;
        let engine = BandEngine::new(
            config.bands.clone(),
            config.min_sell_price,
            config.max_buy_price,
        );
        let strategy = Strategy::new(
            config.asset.clone(),
            config.currency.clone(),
            config.leverage,
            rules,
        );
        Ok(Self {
            session,
            engine,
            strategy,
            cycle: 0,
        })
    }

    /// Run until interrupted or until a fatal fault. Recoverable cycle
    /// errors are logged and the loop continues.
    pub async fn run(mut self) -> Result<()> {
        info!("decision loop started for {}", self.session.config.pair);
        loop {
            let pause = rand::thread_rng().gen_range(CYCLE_MIN_MS..=CYCLE_MAX_MS);
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    self.session.shutdown();
                    return Ok(());
                }
                _ = sleep(Duration::from_millis(pause)) => {}
            }

            if let Err(e) = self.cycle().await {
                let fatal = e
                    .downcast_ref::<SessionFault>()
                    .is_some_and(SessionFault::is_fatal);
                if fatal {
                    self.session.shutdown();
                    return Err(e);
                }
                warn!("cycle failed: {e:#}");
            }
        }
    }

    async fn cycle(&mut self) -> Result<()> {
        self.cycle += 1;
        if self.cycle % RECONCILE_EVERY == 0 {
            self.session.reconcile_orders().await?;
        }

        let now = Utc::now();
        let (candles, book, wallet) = {
            let cache = self.session.cache.lock().unwrap();
            let candles = cache.last_candles(self.engine.window_len(), now)?;
            let book = cache.top_of_book(now)?;
            (candles, book, cache.wallet().clone())
        };

        let Some(bands) = self.engine.compute(&candles) else {
            return Ok(());
        };
        let Some(intent) = self.strategy.decide(&bands, &book, &wallet) else {
            return Ok(());
        };
        self.execute(intent, &book).await
    }

    /// Every order command is logged together with the book snapshot the
    /// decision was made on.
    async fn execute(&self, intent: Intent, book: &TopOfBook) -> Result<()> {
        let symbol = &self.session.config.pair;
        match intent {
            Intent::OpenMarket { side, qty } => {
                info!("opening {side} {qty} {symbol} at market ({book})");
                self.session.trade_ws.create_order(json!({
                    "category": "spot",
                    "symbol": symbol,
                    "side": side.to_string(),
                    "orderType": "Market",
                    "qty": qty.to_string(),
                    "marketUnit": "baseCoin",
                    "isLeverage": 1,
                }));
            }
            Intent::CloseLimit { side, qty, price } => {
                let action = {
                    let ledger = self.session.ledger.lock().unwrap();
                    plan_close(ledger.tracked(), side, qty, price)
                };
                match action {
                    CloseAction::Submit => {
                        info!("closing with {side} {qty} {symbol} limit @ {price} ({book})");
                        self.session.trade_ws.create_order(json!({
                            "category": "spot",
                            "symbol": symbol,
                            "side": side.to_string(),
                            "orderType": "Limit",
                            "qty": qty.to_string(),
                            "price": price.to_string(),
                            "timeInForce": "GTC",
                            "isLeverage": 1,
                        }));
                    }
                    CloseAction::Cancel(id) => {
                        info!("cancelling mismatched close order {id} ({book})");
                        self.session.trade_ws.cancel_order(json!({
                            "category": "spot",
                            "symbol": symbol,
                            "orderId": id,
                        }));
                    }
                    CloseAction::Amend { qty, price } => {
                        info!("amending close order to {qty} @ {price} ({book})");
                        let id = self
                            .session
                            .ledger
                            .lock()
                            .unwrap()
                            .tracked()
                            .map(|o| o.id.clone());
                        if let Some(id) = id {
                            self.session.trade_ws.amend_order(json!({
                                "category": "spot",
                                "symbol": symbol,
                                "orderId": id,
                                "qty": qty.to_string(),
                                "price": price.to_string(),
                            }));
                        }
                    }
                    CloseAction::Nothing => {}
                }
            }
            Intent::Repay { coin } => {
                self.session.rest.repay_liability(&coin).await;
            }
        }
        Ok(())
    }
}
