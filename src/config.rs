//! Bot configuration
//!
//! Trading parameters come from a JSON file; API credentials come from the
//! environment. Three independent key pairs are used so the public, private
//! and trade channels can be rate-limited and revoked separately.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Band computation parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct BandConfig {
    /// Candle timeframe in minutes (also the kline subscription interval)
    pub timeframe_minutes: u32,
    /// Number of candles in the rolling window
    pub length: usize,
    /// Candle field the mean/std are computed over ("close", "mid", ...)
    pub source: String,
    /// Floor for the standard deviation, avoids zero-width bands
    pub min_std: f64,
    /// Band multiplier for open orders
    pub open_band: f64,
    /// Band multiplier for close orders
    pub close_band: f64,
}

/// Trading parameters for one spot-margin pair.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Quote currency (e.g. "USDT")
    pub currency: String,
    /// Base asset (e.g. "USDC")
    pub asset: String,
    /// Exchange symbol (e.g. "USDCUSDT")
    pub pair: String,
    /// Never sell below this price
    pub min_sell_price: f64,
    /// Never buy above this price
    pub max_buy_price: f64,
    /// Margin leverage multiplier
    pub leverage: f64,
    /// Band parameters
    pub bands: BandConfig,
}

impl BotConfig {
    /// Load trading parameters from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// One API key/secret pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub api_key: String,
    pub api_secret: String,
}

/// Credentials for the REST client and the two authenticated streams.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    /// Signs REST pulls (wallet, orders, cancel-all, repay)
    pub rest: KeyPair,
    /// Authenticates the private account-event stream
    pub private_ws: KeyPair,
    /// Authenticates the trade-command stream
    pub trade_ws: KeyPair,
}

impl ApiCredentials {
    /// Read all three key pairs from the environment.
    ///
    /// Expects:
    /// - `BYBIT_REST_KEY` / `BYBIT_REST_SECRET`
    /// - `BYBIT_PRIVATE_WS_KEY` / `BYBIT_PRIVATE_WS_SECRET`
    /// - `BYBIT_TRADE_WS_KEY` / `BYBIT_TRADE_WS_SECRET`
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            rest: Self::pair_from_env("BYBIT_REST")?,
            private_ws: Self::pair_from_env("BYBIT_PRIVATE_WS")?,
            trade_ws: Self::pair_from_env("BYBIT_TRADE_WS")?,
        })
    }

    fn pair_from_env(prefix: &str) -> Result<KeyPair> {
        let api_key = std::env::var(format!("{prefix}_KEY"))
            .with_context(|| format!("{prefix}_KEY environment variable not set"))?;
        let api_secret = std::env::var(format!("{prefix}_SECRET"))
            .with_context(|| format!("{prefix}_SECRET environment variable not set"))?;
        Ok(KeyPair { api_key, api_secret })
    }
}
