//! In-memory market and account state
//!
//! The cache is fed by the websocket handlers and read by the decision loop.
//! Candle and book reads are freshness-checked: a stream can die while the
//! loop keeps ticking, and trading on a ten-minute-old book is worse than
//! not trading at all.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::bybit::models::{loose_f64, strict_f64, KlinePush, WalletAccount};
use crate::error::SessionFault;

/// Rolling candle window capacity.
pub const CANDLE_CAPACITY: usize = 500;

/// Candle and book reads older than this fail the read.
pub const FRESHNESS_BOUND_SECS: i64 = 600;

// ============================================================================
// Candles
// ============================================================================

/// One closed candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    /// Interval start, epoch millis
    pub start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
}

impl Candle {
    /// Midpoint of the candle's range.
    pub fn mid(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    /// Select the configured price field.
    pub fn value(&self, source: &str) -> f64 {
        match source {
            "open" => self.open,
            "high" => self.high,
            "low" => self.low,
            "mid" => self.mid(),
            _ => self.close,
        }
    }

    /// Parse one REST kline row:
    /// `[start, open, high, low, close, volume, turnover]`.
    pub fn from_kline_row(row: &[String]) -> anyhow::Result<Self> {
        if row.len() < 6 {
            anyhow::bail!("kline row has {} fields, expected at least 6", row.len());
        }
        Ok(Candle {
            start: row[0]
                .parse()
                .map_err(|e| anyhow::anyhow!("bad kline start '{}': {e}", row[0]))?,
            open: strict_f64(&row[1], "open")?,
            high: strict_f64(&row[2], "high")?,
            low: strict_f64(&row[3], "low")?,
            close: strict_f64(&row[4], "close")?,
            volume: strict_f64(&row[5], "volume")?,
            turnover: row.get(6).map(|s| loose_f64(s)).unwrap_or(0.0),
        })
    }
}

impl From<&KlinePush> for Candle {
    fn from(push: &KlinePush) -> Self {
        Candle {
            start: push.start,
            open: loose_f64(&push.open),
            high: loose_f64(&push.high),
            low: loose_f64(&push.low),
            close: loose_f64(&push.close),
            volume: loose_f64(&push.volume),
            turnover: loose_f64(&push.turnover),
        }
    }
}

// ============================================================================
// Book and wallet snapshots
// ============================================================================

/// Depth-1 book state.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopOfBook {
    pub bid_price: f64,
    pub bid_amount: f64,
    pub ask_price: f64,
    pub ask_amount: f64,
}

impl std::fmt::Display for TopOfBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bid {}@{} ask {}@{}",
            self.bid_amount, self.bid_price, self.ask_amount, self.ask_price
        )
    }
}

/// Per-coin balances.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoinBalance {
    pub wallet_balance: f64,
    pub borrow_amount: f64,
    pub usd_value: f64,
}

/// Unified account totals plus per-coin balances.
#[derive(Debug, Clone, Default)]
pub struct WalletState {
    pub total_equity: f64,
    pub total_margin_balance: f64,
    pub total_available_balance: f64,
    pub coins: HashMap<String, CoinBalance>,
}

impl WalletState {
    pub fn coin(&self, name: &str) -> CoinBalance {
        self.coins.get(name).copied().unwrap_or_default()
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Market and account state for one pair.
#[derive(Debug, Default)]
pub struct MarketCache {
    candles: VecDeque<Candle>,
    candles_updated: Option<DateTime<Utc>>,
    book: TopOfBook,
    book_updated: Option<DateTime<Utc>>,
    wallet: WalletState,
}

impl MarketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the candle window with a REST backfill. `candles` must be in
    /// chronological order; anything beyond capacity is dropped from the old
    /// end.
    pub fn seed_candles(&mut self, candles: Vec<Candle>, now: DateTime<Utc>) {
        self.candles = candles.into_iter().collect();
        while self.candles.len() > CANDLE_CAPACITY {
            self.candles.pop_front();
        }
        self.candles_updated = Some(now);
    }

    /// Append a closed candle. A repeat of the newest interval replaces it;
    /// older intervals are ignored.
    pub fn store_candle(&mut self, candle: Candle, now: DateTime<Utc>) {
        match self.candles.back() {
            Some(last) if candle.start < last.start => return,
            Some(last) if candle.start == last.start => {
                *self.candles.back_mut().unwrap() = candle;
            }
            _ => {
                self.candles.push_back(candle);
                if self.candles.len() > CANDLE_CAPACITY {
                    self.candles.pop_front();
                }
            }
        }
        self.candles_updated = Some(now);
    }

    /// Mark the candle feed alive without storing anything. In-progress
    /// (unconfirmed) pushes land here: they prove the stream is healthy even
    /// though only closed candles enter the window.
    pub fn note_candle_feed(&mut self, now: DateTime<Utc>) {
        self.candles_updated = Some(now);
    }

    /// Merge a depth-1 book update. A zero amount on a side means the update
    /// carried no change for that side, so the previous level is kept.
    pub fn merge_book(
        &mut self,
        bids: &[[String; 2]],
        asks: &[[String; 2]],
        now: DateTime<Utc>,
    ) {
        if let Some([price, amount]) = bids.first() {
            let amount = loose_f64(amount);
            if amount > 0.0 {
                self.book.bid_price = loose_f64(price);
                self.book.bid_amount = amount;
            }
        }
        if let Some([price, amount]) = asks.first() {
            let amount = loose_f64(amount);
            if amount > 0.0 {
                self.book.ask_price = loose_f64(price);
                self.book.ask_amount = amount;
            }
        }
        self.book_updated = Some(now);
    }

    /// Merge a wallet snapshot: totals replace, coins upsert. Coins absent
    /// from the update keep their previous balances.
    pub fn merge_wallet(&mut self, account: &WalletAccount) {
        self.wallet.total_equity = loose_f64(&account.total_equity);
        self.wallet.total_margin_balance = loose_f64(&account.total_margin_balance);
        self.wallet.total_available_balance = loose_f64(&account.total_available_balance);
        for coin in &account.coin {
            let balance = CoinBalance {
                wallet_balance: loose_f64(&coin.wallet_balance),
                borrow_amount: loose_f64(&coin.borrow_amount),
                usd_value: loose_f64(&coin.usd_value),
            };
            debug!(
                "wallet {}: balance={} borrowed={} usd={}",
                coin.coin, balance.wallet_balance, balance.borrow_amount, balance.usd_value
            );
            self.wallet.coins.insert(coin.coin.clone(), balance);
        }
        debug!(
            "wallet totals: equity={} margin={} available={}",
            self.wallet.total_equity,
            self.wallet.total_margin_balance,
            self.wallet.total_available_balance
        );
    }

    fn check_fresh(
        what: &'static str,
        updated: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), SessionFault> {
        let age_secs = match updated {
            Some(at) => (now - at).num_seconds(),
            None => i64::MAX,
        };
        if age_secs > FRESHNESS_BOUND_SECS {
            return Err(SessionFault::StaleData {
                what,
                age_secs,
                bound_secs: FRESHNESS_BOUND_SECS,
            });
        }
        Ok(())
    }

    /// The newest `n` candles in chronological order, or fewer if the window
    /// holds fewer. Fails when the feed has gone stale.
    pub fn last_candles(&self, n: usize, now: DateTime<Utc>) -> Result<Vec<Candle>, SessionFault> {
        Self::check_fresh("candle feed", self.candles_updated, now)?;
        let skip = self.candles.len().saturating_sub(n);
        Ok(self.candles.iter().skip(skip).copied().collect())
    }

    /// The current top of book. Fails when the feed has gone stale.
    pub fn top_of_book(&self, now: DateTime<Utc>) -> Result<TopOfBook, SessionFault> {
        Self::check_fresh("order book feed", self.book_updated, now)?;
        Ok(self.book)
    }

    /// The wallet snapshot. Wallet pushes only arrive on balance changes, so
    /// this read carries no freshness bound.
    pub fn wallet(&self) -> &WalletState {
        &self.wallet
    }

    pub fn candle_count(&self) -> usize {
        self.candles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candle(start: i64, price: f64) -> Candle {
        Candle {
            start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1.0,
            turnover: 0.0,
        }
    }

    #[test]
    fn window_drops_oldest_at_capacity() {
        let mut cache = MarketCache::new();
        let now = Utc::now();
        for i in 0..(CANDLE_CAPACITY as i64 + 10) {
            cache.store_candle(candle(i * 60_000, 1.0), now);
        }
        assert_eq!(cache.candle_count(), CANDLE_CAPACITY);
        let candles = cache.last_candles(CANDLE_CAPACITY, now).unwrap();
        // The 10 oldest intervals were evicted.
        assert_eq!(candles[0].start, 10 * 60_000);
    }

    #[test]
    fn repeat_of_newest_interval_replaces_it() {
        let mut cache = MarketCache::new();
        let now = Utc::now();
        cache.store_candle(candle(0, 1.0), now);
        cache.store_candle(candle(60_000, 2.0), now);
        cache.store_candle(candle(60_000, 3.0), now);
        let candles = cache.last_candles(10, now).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 3.0);
    }

    #[test]
    fn out_of_order_candle_is_ignored() {
        let mut cache = MarketCache::new();
        let now = Utc::now();
        cache.store_candle(candle(60_000, 2.0), now);
        cache.store_candle(candle(0, 1.0), now);
        assert_eq!(cache.candle_count(), 1);
    }

    #[test]
    fn stale_candles_fail_the_read() {
        let mut cache = MarketCache::new();
        let fed_at = Utc::now();
        cache.store_candle(candle(0, 1.0), fed_at);

        let fresh = fed_at + Duration::seconds(FRESHNESS_BOUND_SECS - 1);
        assert!(cache.last_candles(10, fresh).is_ok());

        let stale = fed_at + Duration::seconds(FRESHNESS_BOUND_SECS + 1);
        let err = cache.last_candles(10, stale).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn liveness_note_defers_staleness() {
        let mut cache = MarketCache::new();
        let fed_at = Utc::now();
        cache.store_candle(candle(0, 1.0), fed_at);

        // An unconfirmed push 9 minutes later keeps the feed alive.
        let noted_at = fed_at + Duration::seconds(540);
        cache.note_candle_feed(noted_at);

        let read_at = fed_at + Duration::seconds(FRESHNESS_BOUND_SECS + 60);
        assert!(cache.last_candles(10, read_at).is_ok());
    }

    #[test]
    fn zero_amount_keeps_previous_book_level() {
        let mut cache = MarketCache::new();
        let now = Utc::now();
        cache.merge_book(
            &[["0.9999".into(), "1000".into()]],
            &[["1.0001".into(), "2000".into()]],
            now,
        );
        // Bid side removed at depth 1: the delta carries amount 0.
        cache.merge_book(
            &[["0.9999".into(), "0".into()]],
            &[["1.0002".into(), "500".into()]],
            now,
        );
        let book = cache.top_of_book(now).unwrap();
        assert_eq!(book.bid_price, 0.9999);
        assert_eq!(book.bid_amount, 1000.0);
        assert_eq!(book.ask_price, 1.0002);
        assert_eq!(book.ask_amount, 500.0);
    }

    #[test]
    fn book_renders_both_levels() {
        let book = TopOfBook {
            bid_price: 0.9999,
            bid_amount: 1000.0,
            ask_price: 1.0001,
            ask_amount: 500.0,
        };
        assert_eq!(book.to_string(), "bid 1000@0.9999 ask 500@1.0001");
    }

    #[test]
    fn wallet_merge_upserts_coins() {
        let mut cache = MarketCache::new();
        let first: WalletAccount = serde_json::from_str(
            r#"{
                "totalEquity": "1000",
                "coin": [
                    {"coin": "USDT", "walletBalance": "600", "borrowAmount": "0", "usdValue": "600"},
                    {"coin": "USDC", "walletBalance": "400", "borrowAmount": "0", "usdValue": "400"}
                ]
            }"#,
        )
        .unwrap();
        cache.merge_wallet(&first);

        // A later push only mentions USDC; USDT balances persist.
        let second: WalletAccount = serde_json::from_str(
            r#"{
                "totalEquity": "1010",
                "coin": [
                    {"coin": "USDC", "walletBalance": "410", "borrowAmount": "5", "usdValue": "410"}
                ]
            }"#,
        )
        .unwrap();
        cache.merge_wallet(&second);

        let wallet = cache.wallet();
        assert_eq!(wallet.total_equity, 1010.0);
        assert_eq!(wallet.coin("USDT").wallet_balance, 600.0);
        assert_eq!(wallet.coin("USDC").borrow_amount, 5.0);
    }

    #[test]
    fn candle_source_selection() {
        let c = Candle {
            start: 0,
            open: 1.0,
            high: 1.2,
            low: 0.8,
            close: 1.1,
            volume: 10.0,
            turnover: 0.0,
        };
        assert_eq!(c.value("mid"), 1.0);
        assert_eq!(c.value("close"), 1.1);
        assert_eq!(c.value("unknown"), 1.1);
    }
}
