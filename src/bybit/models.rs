//! Bybit v5 API data models
//!
//! Request and response types for the REST and websocket payloads the bot
//! consumes. Bybit transmits most numbers as strings; the loose parsers at
//! the bottom mirror that.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Shared enums
// ============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

/// Exchange order status. Only `New` and `PartiallyFilled` keep an order
/// tracked; every other status is terminal for the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    PartiallyFilledCanceled,
    Untriggered,
    Triggered,
    Deactivated,
}

impl OrderStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

// ============================================================================
// REST envelope
// ============================================================================

/// Every v5 REST response wraps its payload in this envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestEnvelope<T> {
    pub ret_code: i32,
    #[serde(default)]
    pub ret_msg: String,
    pub result: T,
}

// ============================================================================
// Market data
// ============================================================================

/// `GET /v5/market/kline` result: rows of
/// `[start, open, high, low, close, volume, turnover]`, newest first.
#[derive(Debug, Deserialize)]
pub struct KlineResult {
    pub list: Vec<Vec<String>>,
}

/// `GET /v5/market/orderbook` result (depth 1).
#[derive(Debug, Default, Deserialize)]
pub struct OrderbookResult {
    /// Ask levels as `[price, amount]`
    #[serde(default)]
    pub a: Vec<[String; 2]>,
    /// Bid levels as `[price, amount]`
    #[serde(default)]
    pub b: Vec<[String; 2]>,
}

/// `orderbook.1.{symbol}` push payload carries the same shape.
pub type OrderbookPush = OrderbookResult;

/// `kline.{interval}.{symbol}` push entry.
#[derive(Debug, Deserialize)]
pub struct KlinePush {
    pub start: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    #[serde(default)]
    pub turnover: String,
    pub confirm: bool,
}

// ============================================================================
// Account
// ============================================================================

/// `GET /v5/account/wallet-balance` result.
#[derive(Debug, Deserialize)]
pub struct WalletResult {
    pub list: Vec<WalletAccount>,
}

/// One unified account entry; also the `wallet` push payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    #[serde(default)]
    pub total_equity: String,
    #[serde(default)]
    pub total_margin_balance: String,
    #[serde(default)]
    pub total_available_balance: String,
    #[serde(default)]
    pub coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCoin {
    pub coin: String,
    #[serde(default)]
    pub wallet_balance: String,
    #[serde(default)]
    pub borrow_amount: String,
    #[serde(default)]
    pub usd_value: String,
}

// ============================================================================
// Instrument rules
// ============================================================================

/// `GET /v5/market/instruments-info` result.
#[derive(Debug, Deserialize)]
pub struct InstrumentsResult {
    pub list: Vec<InstrumentInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentInfo {
    pub symbol: String,
    pub lot_size_filter: LotSizeFilter,
    pub price_filter: PriceFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotSizeFilter {
    pub base_precision: String,
    pub min_order_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFilter {
    pub tick_size: String,
}

/// Parsed, validated instrument limits used by the decision engine.
#[derive(Debug, Clone, Copy)]
pub struct TradingRules {
    /// Minimum price increment
    pub tick_size: f64,
    /// Minimum quantity increment
    pub base_precision: f64,
    /// Smallest order the exchange accepts
    pub min_order_qty: f64,
}

impl TryFrom<&InstrumentInfo> for TradingRules {
    type Error = anyhow::Error;

    fn try_from(info: &InstrumentInfo) -> Result<Self> {
        let tick_size = strict_f64(&info.price_filter.tick_size, "tickSize")?;
        let base_precision = strict_f64(&info.lot_size_filter.base_precision, "basePrecision")?;
        let min_order_qty = strict_f64(&info.lot_size_filter.min_order_qty, "minOrderQty")?;
        if tick_size <= 0.0 || base_precision <= 0.0 {
            return Err(anyhow!(
                "degenerate trading rules for {}: tick={tick_size} precision={base_precision}",
                info.symbol
            ));
        }
        Ok(TradingRules {
            tick_size,
            base_precision,
            min_order_qty,
        })
    }
}

// ============================================================================
// Orders
// ============================================================================

/// `GET /v5/order/realtime` result.
#[derive(Debug, Deserialize)]
pub struct OpenOrdersResult {
    pub list: Vec<OrderData>,
}

/// One order as reported by the exchange; also the `order.spot` push entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    pub order_id: String,
    #[serde(default)]
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub leaves_qty: String,
    #[serde(default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub price: String,
    pub order_status: OrderStatus,
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Lenient numeric parse: Bybit sends empty strings for absent values, which
/// read as zero (matching the exchange's own documentation examples).
pub fn loose_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

/// Strict numeric parse for fields the bot cannot operate without.
pub fn strict_f64(s: &str, field: &str) -> Result<f64> {
    s.parse()
        .map_err(|e| anyhow!("failed to parse {field} value '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_liveness() {
        assert!(OrderStatus::New.is_live());
        assert!(OrderStatus::PartiallyFilled.is_live());
        assert!(!OrderStatus::Filled.is_live());
        assert!(!OrderStatus::Cancelled.is_live());
        assert!(!OrderStatus::Rejected.is_live());
    }

    #[test]
    fn parses_order_push_entry() {
        let raw = r#"{
            "orderId": "1234",
            "symbol": "USDCUSDT",
            "side": "Sell",
            "qty": "120.5",
            "leavesQty": "20.5",
            "cumExecQty": "100",
            "price": "1.0002",
            "orderStatus": "PartiallyFilled"
        }"#;
        let order: OrderData = serde_json::from_str(raw).unwrap();
        assert_eq!(order.order_id, "1234");
        assert_eq!(order.side, Side::Sell);
        assert!(order.order_status.is_live());
        assert!((loose_f64(&order.leaves_qty) - 20.5).abs() < 1e-12);
    }

    #[test]
    fn trading_rules_reject_zero_tick() {
        let info = InstrumentInfo {
            symbol: "USDCUSDT".into(),
            lot_size_filter: LotSizeFilter {
                base_precision: "0.01".into(),
                min_order_qty: "1".into(),
            },
            price_filter: PriceFilter {
                tick_size: "0".into(),
            },
        };
        assert!(TradingRules::try_from(&info).is_err());
    }

    #[test]
    fn loose_parse_treats_empty_as_zero() {
        assert_eq!(loose_f64(""), 0.0);
        assert_eq!(loose_f64("not-a-number"), 0.0);
        assert!((loose_f64("1.5") - 1.5).abs() < f64::EPSILON);
    }
}
