//! Trade decisions
//!
//! Pure decision logic: given band levels, the top of book and the wallet,
//! produce at most one intent per cycle. Closing an existing position always
//! takes priority over opening a new one, and a buy opportunity is evaluated
//! before a sell.

use tracing::debug;

use super::bands::{round_sig, Bands};
use super::market_cache::{TopOfBook, WalletState};
use crate::bybit::models::{Side, TradingRules};

/// Fraction of the opposite book level an open order may consume.
const LIQUIDITY_FRACTION: f64 = 0.75;

/// One action the decision loop wants executed.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Take liquidity now at the band level.
    OpenMarket { side: Side, qty: f64 },
    /// Work a limit order to unwind the position.
    CloseLimit { side: Side, qty: f64, price: f64 },
    /// Position is dust; clear the outstanding loan instead of trading.
    Repay { coin: String },
}

/// Round a price up to the next tick.
pub fn ceil_to_tick(price: f64, tick: f64) -> f64 {
    round_sig((price / tick - 1e-9).ceil() * tick, 10)
}

/// Round a price down to the previous tick.
pub fn floor_to_tick(price: f64, tick: f64) -> f64 {
    round_sig((price / tick + 1e-9).floor() * tick, 10)
}

/// Round a quantity down to the instrument's base precision.
pub fn floor_to_precision(qty: f64, precision: f64) -> f64 {
    round_sig((qty / precision + 1e-9).floor() * precision, 10)
}

/// Band-reversion decision engine for one spot-margin pair.
pub struct Strategy {
    asset: String,
    currency: String,
    leverage: f64,
    rules: TradingRules,
}

impl Strategy {
    pub fn new(asset: String, currency: String, leverage: f64, rules: TradingRules) -> Self {
        Self {
            asset,
            currency,
            leverage,
            rules,
        }
    }

    /// Decide this cycle's action, if any.
    pub fn decide(&self, bands: &Bands, book: &TopOfBook, wallet: &WalletState) -> Option<Intent> {
        let asset = wallet.coin(&self.asset);
        let position = asset.wallet_balance;
        let position_qty = floor_to_precision(position.abs(), self.rules.base_precision);

        if position_qty >= self.rules.min_order_qty {
            return self.decide_close(position, position_qty, bands, book);
        }

        // Dust position: a loan may still be outstanding.
        if asset.borrow_amount > 0.0 {
            return Some(Intent::Repay {
                coin: self.asset.clone(),
            });
        }
        let currency = wallet.coin(&self.currency);
        if currency.borrow_amount > 0.0 {
            return Some(Intent::Repay {
                coin: self.currency.clone(),
            });
        }

        self.decide_open(bands, book, wallet)
    }

    fn decide_close(
        &self,
        position: f64,
        qty: f64,
        bands: &Bands,
        book: &TopOfBook,
    ) -> Option<Intent> {
        if position > 0.0 {
            // Long: sell once the bid reaches the close band. Round the limit
            // up so the order never rests inside the band.
            if book.bid_price >= bands.close_sell {
                return Some(Intent::CloseLimit {
                    side: Side::Sell,
                    qty,
                    price: ceil_to_tick(bands.close_sell, self.rules.tick_size),
                });
            }
        } else if book.ask_price <= bands.close_buy {
            return Some(Intent::CloseLimit {
                side: Side::Buy,
                qty,
                price: floor_to_tick(bands.close_buy, self.rules.tick_size),
            });
        }
        None
    }

    fn decide_open(&self, bands: &Bands, book: &TopOfBook, wallet: &WalletState) -> Option<Intent> {
        let asset_usd = wallet.coin(&self.asset).usd_value.abs();
        let headroom = (wallet.total_equity - asset_usd / self.leverage).max(0.0);

        if book.ask_price > 0.0 && book.ask_price <= bands.open_buy {
            let budget_qty = headroom / book.ask_price * self.leverage;
            let qty = floor_to_precision(
                budget_qty.min(LIQUIDITY_FRACTION * book.ask_amount),
                self.rules.base_precision,
            );
            debug!(
                "buy opportunity at ask {}: budget {budget_qty:.4}, sized {qty}",
                book.ask_price
            );
            if qty >= self.rules.min_order_qty {
                return Some(Intent::OpenMarket {
                    side: Side::Buy,
                    qty,
                });
            }
            // Undersized buys do not fall through to the sell side.
            return None;
        }

        if book.bid_price >= bands.open_sell {
            let budget_qty = headroom / book.bid_price * self.leverage;
            let qty = floor_to_precision(
                budget_qty.min(LIQUIDITY_FRACTION * book.bid_amount),
                self.rules.base_precision,
            );
            debug!(
                "sell opportunity at bid {}: budget {budget_qty:.4}, sized {qty}",
                book.bid_price
            );
            if qty >= self.rules.min_order_qty {
                return Some(Intent::OpenMarket {
                    side: Side::Sell,
                    qty,
                });
            }
        }
        None
    }
}
