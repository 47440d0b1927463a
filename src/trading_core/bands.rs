//! Volatility bands
//!
//! Rolling mean and population standard deviation over the candle window,
//! expanded into open/close price levels. Intermediate values are rounded to
//! 7 significant digits so band levels are stable across recomputation and
//! readable in the logs.

use tracing::debug;

use super::market_cache::Candle;
use crate::config::BandConfig;

/// Round to `digits` significant digits.
pub fn round_sig(x: f64, digits: i32) -> f64 {
    if x == 0.0 || !x.is_finite() {
        return x;
    }
    let magnitude = x.abs().log10().floor() as i32;
    let factor = 10f64.powi(digits - 1 - magnitude);
    (x * factor).round() / factor
}

/// Computed band levels for one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub mean: f64,
    pub std: f64,
    /// Price to open a long: lower open band, capped at the buy ceiling.
    pub open_buy: f64,
    /// Price to open a short: upper open band, floored at the sell floor.
    pub open_sell: f64,
    /// Price to buy back a short.
    pub close_buy: f64,
    /// Price to sell off a long.
    pub close_sell: f64,
}

/// Band calculator with a change-detection cache: the window only changes
/// when a candle closes, which is far rarer than decision cycles.
pub struct BandEngine {
    config: BandConfig,
    min_sell_price: f64,
    max_buy_price: f64,
    cached: Option<Bands>,
    window_key: Option<(usize, i64)>,
    recomputes: u64,
}

impl BandEngine {
    pub fn new(config: BandConfig, min_sell_price: f64, max_buy_price: f64) -> Self {
        Self {
            config,
            min_sell_price,
            max_buy_price,
            cached: None,
            window_key: None,
            recomputes: 0,
        }
    }

    /// Number of candles the engine wants from the cache.
    pub fn window_len(&self) -> usize {
        self.config.length
    }

    /// Compute bands over `candles` (chronological). Returns the cached
    /// result unless the window grew or its newest interval advanced.
    pub fn compute(&mut self, candles: &[Candle]) -> Option<Bands> {
        let newest = candles.last()?;
        let key = (candles.len(), newest.start);
        if self.window_key == Some(key) {
            return self.cached;
        }

        let n = candles.len() as f64;
        let values: Vec<f64> = candles
            .iter()
            .map(|c| c.value(&self.config.source))
            .collect();
        let mean = round_sig(values.iter().sum::<f64>() / n, 7);
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = round_sig(variance.sqrt().max(self.config.min_std), 7);

        let bands = Bands {
            mean,
            std,
            open_buy: round_sig(mean - self.config.open_band * std, 7).min(self.max_buy_price),
            open_sell: round_sig(mean + self.config.open_band * std, 7).max(self.min_sell_price),
            close_buy: round_sig(mean - self.config.close_band * std, 7),
            close_sell: round_sig(mean + self.config.close_band * std, 7),
        };

        self.recomputes += 1;
        debug!(
            "bands recomputed over {} candles: mean={mean} std={std} openBuy={} openSell={}",
            candles.len(),
            bands.open_buy,
            bands.open_sell
        );
        self.window_key = Some(key);
        self.cached = Some(bands);
        self.cached
    }

    #[cfg(test)]
    fn recompute_count(&self) -> u64 {
        self.recomputes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BandConfig {
        BandConfig {
            timeframe_minutes: 1,
            length: 200,
            source: "mid".to_string(),
            min_std: 0.0001,
            open_band: 2.0,
            close_band: 0.5,
        }
    }

    fn candle(start: i64, high: f64, low: f64) -> Candle {
        Candle {
            start,
            open: low,
            high,
            low,
            close: high,
            volume: 1.0,
            turnover: 0.0,
        }
    }

    #[test]
    fn significant_digit_rounding() {
        assert_eq!(round_sig(1.23456789, 7), 1.234568);
        assert_eq!(round_sig(0.000123456789, 7), 0.0001234568);
        assert_eq!(round_sig(-987654.321, 7), -987654.3);
        assert_eq!(round_sig(0.0, 7), 0.0);
    }

    #[test]
    fn two_candle_window() {
        // Mids 1.0004 and 0.9996: mean 1.0, population std 0.0004.
        let candles = vec![
            candle(0, 1.0006, 1.0002),
            candle(60_000, 0.9998, 0.9994),
        ];
        let mut engine = BandEngine::new(config(), 0.0, 10.0);
        let bands = engine.compute(&candles).unwrap();
        assert!((bands.mean - 1.0).abs() < 1e-12);
        assert!((bands.std - 0.0004).abs() < 1e-12);
        assert!((bands.open_buy - 0.9992).abs() < 1e-12);
        assert!((bands.open_sell - 1.0008).abs() < 1e-12);
        assert!((bands.close_buy - 0.9998).abs() < 1e-12);
        assert!((bands.close_sell - 1.0002).abs() < 1e-12);
    }

    #[test]
    fn zero_deviation_is_floored() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i * 60_000, 1.0, 1.0)).collect();
        let mut engine = BandEngine::new(config(), 0.0, 10.0);
        let bands = engine.compute(&candles).unwrap();
        assert_eq!(bands.std, 0.0001);
    }

    #[test]
    fn open_levels_are_clamped() {
        let candles = vec![
            candle(0, 1.0006, 1.0002),
            candle(60_000, 0.9998, 0.9994),
        ];
        // Ceiling below the lower band, floor above the upper band.
        let mut engine = BandEngine::new(config(), 1.002, 0.999);
        let bands = engine.compute(&candles).unwrap();
        assert!((bands.open_buy - 0.999).abs() < 1e-12);
        assert!((bands.open_sell - 1.002).abs() < 1e-12);
    }

    #[test]
    fn unchanged_window_uses_the_cache() {
        let candles = vec![
            candle(0, 1.0006, 1.0002),
            candle(60_000, 0.9998, 0.9994),
        ];
        let mut engine = BandEngine::new(config(), 0.0, 10.0);
        let first = engine.compute(&candles).unwrap();
        let second = engine.compute(&candles).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.recompute_count(), 1);

        let mut extended = candles;
        extended.push(candle(120_000, 1.0, 1.0));
        engine.compute(&extended).unwrap();
        assert_eq!(engine.recompute_count(), 2);
    }

    #[test]
    fn empty_window_yields_nothing() {
        let mut engine = BandEngine::new(config(), 0.0, 10.0);
        assert!(engine.compute(&[]).is_none());
    }
}
