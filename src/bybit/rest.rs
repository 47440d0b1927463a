//! Bybit v5 REST client
//!
//! The pull side of the exchange gateway: signed request/response calls the
//! session uses to (re)build state and for the operations the trade stream
//! does not cover (cancel-all, liability repayment).

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::models::*;
use super::sign;
use crate::config::KeyPair;

/// Production REST endpoint
pub const MAINNET_REST_URL: &str = "https://api.bybit.com";

/// Testnet REST endpoint
pub const TESTNET_REST_URL: &str = "https://api-testnet.bybit.com";

const RECV_WINDOW_MS: i64 = 5000;

/// Signed REST client for one key pair.
pub struct BybitRestClient {
    client: Client,
    base_url: String,
    keys: KeyPair,
}

impl BybitRestClient {
    pub fn new(keys: KeyPair, testnet: bool) -> Self {
        let base_url = if testnet {
            TESTNET_REST_URL.to_string()
        } else {
            MAINNET_REST_URL.to_string()
        };
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url,
            keys,
        }
    }

    /// Sign `params` in place and return the canonical query string plus
    /// signature.
    fn signed_query(&self, params: &mut BTreeMap<String, String>) -> (String, String) {
        params.insert("api_key".to_string(), self.keys.api_key.clone());
        params.insert("timestamp".to_string(), Utc::now().timestamp_millis().to_string());
        params.insert("recvWindow".to_string(), RECV_WINDOW_MS.to_string());
        let qs = sign::query_string(params);
        let signature = sign::sign_payload(&self.keys.api_secret, &qs);
        (qs, signature)
    }

    async fn get_signed<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        mut params: BTreeMap<String, String>,
    ) -> Result<T> {
        let (qs, signature) = self.signed_query(&mut params);
        let url = format!("{}/v5{}?{}&sign={}", self.base_url, endpoint, qs, signature);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to send GET request to {endpoint}"))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("GET {endpoint} failed ({status}): {body}"));
        }

        let envelope: RestEnvelope<T> = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse response from {endpoint}"))?;
        if envelope.ret_code != 0 {
            return Err(anyhow!(
                "GET {endpoint} rejected ({}): {}",
                envelope.ret_code,
                envelope.ret_msg
            ));
        }
        Ok(envelope.result)
    }

    async fn post_signed<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        mut params: BTreeMap<String, String>,
    ) -> Result<T> {
        let (_, signature) = self.signed_query(&mut params);
        params.insert("sign".to_string(), signature);
        let url = format!("{}/v5{}", self.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .with_context(|| format!("Failed to send POST request to {endpoint}"))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("POST {endpoint} failed ({status}): {body}"));
        }

        let envelope: RestEnvelope<T> = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse response from {endpoint}: {body}"))?;
        if envelope.ret_code != 0 {
            return Err(anyhow!(
                "POST {endpoint} rejected ({}): {}",
                envelope.ret_code,
                envelope.ret_msg
            ));
        }
        Ok(envelope.result)
    }

    // ========================================================================
    // Market data
    // ========================================================================

    /// Fetch up to `limit` closed candles, newest first. The `end` bound
    /// excludes the still-open candle of the current interval.
    pub async fn get_candles(
        &self,
        symbol: &str,
        interval_minutes: u32,
        limit: usize,
    ) -> Result<KlineResult> {
        debug!("Fetching {limit} candles for {symbol} ({interval_minutes}m)...");
        let end = Utc::now().timestamp_millis() - i64::from(interval_minutes) * 60_000;
        let mut params = BTreeMap::new();
        params.insert("category".to_string(), "spot".to_string());
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("interval".to_string(), interval_minutes.to_string());
        params.insert("end".to_string(), end.to_string());
        params.insert("limit".to_string(), limit.to_string());
        self.get_signed("/market/kline", params).await
    }

    /// Fetch the top of book (depth 1).
    pub async fn get_order_book(&self, symbol: &str) -> Result<OrderbookResult> {
        let mut params = BTreeMap::new();
        params.insert("category".to_string(), "spot".to_string());
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("limit".to_string(), "1".to_string());
        self.get_signed("/market/orderbook", params).await
    }

    /// Fetch lot/tick limits for the pair.
    pub async fn get_trading_rules(&self, symbol: &str) -> Result<TradingRules> {
        let mut params = BTreeMap::new();
        params.insert("category".to_string(), "spot".to_string());
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("status".to_string(), "Trading".to_string());
        let result: InstrumentsResult = self.get_signed("/market/instruments-info", params).await?;
        let info = result
            .list
            .first()
            .ok_or_else(|| anyhow!("No instrument info returned for {symbol}"))?;
        TradingRules::try_from(info)
    }

    // ========================================================================
    // Account
    // ========================================================================

    /// Fetch the unified account wallet snapshot.
    pub async fn get_wallet_balance(&self) -> Result<WalletAccount> {
        let mut params = BTreeMap::new();
        params.insert("accountType".to_string(), "UNIFIED".to_string());
        let result: WalletResult = self.get_signed("/account/wallet-balance", params).await?;
        result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Wallet balance response contained no accounts"))
    }

    /// Repay outstanding borrow for one coin. Failures are logged and
    /// swallowed: a missed repayment is retried on the next cycle.
    pub async fn repay_liability(&self, coin: &str) {
        let mut params = BTreeMap::new();
        params.insert("coin".to_string(), coin.to_string());
        match self
            .post_signed::<serde_json::Value>("/account/quick-repayment", params)
            .await
        {
            Ok(_) => debug!("Repaid outstanding {coin} liability"),
            Err(e) => warn!("Liability repayment for {coin} failed: {e:#}"),
        }
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Fetch all open orders for the pair.
    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderData>> {
        let mut params = BTreeMap::new();
        params.insert("category".to_string(), "spot".to_string());
        params.insert("symbol".to_string(), symbol.to_string());
        let result: OpenOrdersResult = self.get_signed("/order/realtime", params).await?;
        Ok(result.list)
    }

    /// Cancel every open order for the pair.
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("category".to_string(), "spot".to_string());
        params.insert("symbol".to_string(), symbol.to_string());
        let _: serde_json::Value = self.post_signed("/order/cancel-all", params).await?;
        Ok(())
    }
}
