//! ATR-based volatility tracking.
//!
//! Keeps a bounded window of OHLCV candles and derives:
//! - True range per candle: `max(high - low, |high - prev_close|, |low - prev_close|)`
//!   (the oldest candle in the window has no predecessor and uses `high - low`)
//! - ATR: simple average of the last `atr_period` true ranges, or of all
//!   available ones while the window is shorter
//! - Volatility: `ATR / latest close`, optionally exponentially smoothed
//!
//! Nothing is reported until `min_candles` candles have accumulated. A
//! candle carrying the newest timestamp again replaces the in-progress
//! candle without producing a new sample.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use tracing::debug;

use skew_core::Candle;

use crate::config::VolatilityConfig;

/// One volatility observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatilitySample {
    pub atr: Decimal,
    pub price_at_sample: Decimal,
    /// `atr / price_at_sample`, before smoothing.
    pub volatility: Decimal,
}

/// Rolling ATR and volatility for one instrument.
#[derive(Debug)]
pub struct VolatilityTracker {
    symbol: String,
    config: VolatilityConfig,
    candles: VecDeque<Candle>,
    samples: VecDeque<VolatilitySample>,
    /// Smoothed volatility, if any has been computed.
    current: Option<Decimal>,
}

impl VolatilityTracker {
    pub fn new(symbol: impl Into<String>, config: VolatilityConfig) -> Self {
        Self {
            symbol: symbol.into(),
            candles: VecDeque::with_capacity(config.max_candles),
            samples: VecDeque::with_capacity(config.max_samples),
            current: None,
            config,
        }
    }

    /// Ingest a candle. Returns the new smoothed volatility when one was computed.
    pub fn push_candle(&mut self, candle: Candle) -> Option<Decimal> {
        if let Some(last) = self.candles.back_mut() {
            if candle.timestamp_ms == last.timestamp_ms {
                *last = candle;
                return None;
            }
            if candle.timestamp_ms < last.timestamp_ms {
                return None;
            }
        }

        self.candles.push_back(candle);
        while self.candles.len() > self.config.max_candles {
            self.candles.pop_front();
        }

        if self.candles.len() < self.config.min_candles {
            return None;
        }
        self.recompute()
    }

    /// Ingest historical candles in timestamp order.
    pub fn warm_up(&mut self, mut candles: Vec<Candle>) -> Option<Decimal> {
        candles.sort_by_key(|c| c.timestamp_ms);
        candles
            .into_iter()
            .fold(None, |latest, candle| self.push_candle(candle).or(latest))
    }

    fn recompute(&mut self) -> Option<Decimal> {
        let atr = self.atr()?;
        let price = self.candles.back()?.close;
        if price <= Decimal::ZERO {
            return None;
        }

        let raw = atr / price;
        let smoothed = match (self.config.smoothing_enabled, self.current) {
            (true, Some(previous)) => {
                let alpha = self.config.smoothing_factor;
                alpha * raw + (Decimal::ONE - alpha) * previous
            }
            _ => raw,
        };

        self.samples.push_back(VolatilitySample {
            atr,
            price_at_sample: price,
            volatility: raw,
        });
        while self.samples.len() > self.config.max_samples {
            self.samples.pop_front();
        }
        self.current = Some(smoothed);

        debug!(
            symbol = %self.symbol,
            atr = %atr,
            price = %price,
            raw = %raw,
            volatility = %smoothed,
            "Volatility updated"
        );
        Some(smoothed)
    }

    /// True range for every candle in the window, oldest first.
    pub fn true_ranges(&self) -> Vec<Decimal> {
        let mut prev_close: Option<Decimal> = None;
        self.candles
            .iter()
            .map(|c| {
                let range = c.high - c.low;
                let tr = match prev_close {
                    Some(pc) => range.max((c.high - pc).abs()).max((c.low - pc).abs()),
                    None => range,
                };
                prev_close = Some(c.close);
                tr
            })
            .collect()
    }

    /// Average of the last `atr_period` true ranges.
    pub fn atr(&self) -> Option<Decimal> {
        let ranges = self.true_ranges();
        if ranges.is_empty() {
            return None;
        }
        let n = self.config.atr_period.min(ranges.len());
        let sum: Decimal = ranges[ranges.len() - n..].iter().copied().sum();
        Some(sum / Decimal::from(n))
    }

    /// Current (smoothed) volatility.
    pub fn volatility(&self) -> Option<Decimal> {
        self.current
    }

    pub fn latest_sample(&self) -> Option<&VolatilitySample> {
        self.samples.back()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn candle_count(&self) -> usize {
        self.candles.len()
    }

    pub fn is_ready(&self) -> bool {
        self.current.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    /// Candle centered on 100 whose true range is exactly `tr`.
    fn candle(ts: i64, tr: Decimal) -> Candle {
        let half = tr / Decimal::TWO;
        Candle {
            timestamp_ms: ts,
            open: dec!(100),
            high: dec!(100) + half,
            low: dec!(100) - half,
            close: dec!(100),
            volume: dec!(1),
        }
    }

    fn known_ranges() -> Vec<Decimal> {
        [2, 3, 1, 4, 2, 3, 1, 2, 3, 4]
            .into_iter()
            .map(Decimal::from)
            .collect()
    }

    #[test]
    fn test_atr_of_known_true_ranges() {
        let mut tracker = VolatilityTracker::new("BTC/USDT", VolatilityConfig::default());
        let mut result = None;
        for (i, tr) in known_ranges().into_iter().enumerate() {
            result = tracker.push_candle(candle(i as i64 * 60_000, tr));
        }

        assert_eq!(tracker.true_ranges(), known_ranges());
        assert_eq!(tracker.atr(), Some(dec!(2.5)));
        assert_eq!(result, Some(dec!(0.025)));
        assert_eq!(tracker.latest_sample().unwrap().price_at_sample, dec!(100));
    }

    #[test]
    fn test_nothing_reported_before_min_candles() {
        let mut tracker = VolatilityTracker::new("BTC/USDT", VolatilityConfig::default());
        for i in 0..9 {
            assert_eq!(tracker.push_candle(candle(i * 60_000, dec!(2))), None);
        }
        assert!(!tracker.is_ready());
        assert_eq!(tracker.candle_count(), 9);
    }

    #[test]
    fn test_atr_uses_available_ranges_when_short() {
        let config = VolatilityConfig {
            min_candles: 2,
            ..Default::default()
        };
        let mut tracker = VolatilityTracker::new("BTC/USDT", config);
        tracker.push_candle(candle(0, dec!(2)));
        tracker.push_candle(candle(60_000, dec!(4)));

        assert_eq!(tracker.atr(), Some(dec!(3)));
    }

    #[test]
    fn test_true_range_uses_previous_close_gap() {
        let config = VolatilityConfig {
            min_candles: 1,
            ..Default::default()
        };
        let mut tracker = VolatilityTracker::new("BTC/USDT", config);
        tracker.push_candle(candle(0, dec!(2)));
        // Gap up: low 104 is 4 above previous close 100, range is only 2.
        tracker.push_candle(Candle {
            timestamp_ms: 60_000,
            open: dec!(105),
            high: dec!(106),
            low: dec!(104),
            close: dec!(105),
            volume: dec!(1),
        });

        assert_eq!(tracker.true_ranges(), vec![dec!(2), dec!(6)]);
    }

    #[test]
    fn test_smoothing_blends_with_previous() {
        let config = VolatilityConfig {
            min_candles: 1,
            atr_period: 1,
            ..Default::default()
        };
        let mut tracker = VolatilityTracker::new("BTC/USDT", config);

        assert_eq!(tracker.push_candle(candle(0, dec!(1))), Some(dec!(0.01)));
        // raw 0.03 -> 0.1 * 0.03 + 0.9 * 0.01
        assert_eq!(tracker.push_candle(candle(60_000, dec!(3))), Some(dec!(0.012)));
        assert_eq!(tracker.latest_sample().unwrap().volatility, dec!(0.03));
    }

    #[test]
    fn test_smoothing_disabled_reports_raw() {
        let config = VolatilityConfig {
            min_candles: 1,
            atr_period: 1,
            smoothing_enabled: false,
            ..Default::default()
        };
        let mut tracker = VolatilityTracker::new("BTC/USDT", config);
        tracker.push_candle(candle(0, dec!(1)));

        assert_eq!(tracker.push_candle(candle(60_000, dec!(3))), Some(dec!(0.03)));
    }

    #[test]
    fn test_duplicate_timestamp_replaces_in_progress_candle() {
        let config = VolatilityConfig {
            min_candles: 1,
            ..Default::default()
        };
        let mut tracker = VolatilityTracker::new("BTC/USDT", config);
        tracker.push_candle(candle(0, dec!(2)));

        assert_eq!(tracker.push_candle(candle(0, dec!(4))), None);
        assert_eq!(tracker.candle_count(), 1);
        assert_eq!(tracker.true_ranges(), vec![dec!(4)]);
        assert_eq!(tracker.sample_count(), 1);
    }

    #[test]
    fn test_stale_candle_ignored() {
        let config = VolatilityConfig {
            min_candles: 1,
            ..Default::default()
        };
        let mut tracker = VolatilityTracker::new("BTC/USDT", config);
        tracker.push_candle(candle(60_000, dec!(2)));

        assert_eq!(tracker.push_candle(candle(0, dec!(9))), None);
        assert_eq!(tracker.candle_count(), 1);
    }

    #[test]
    fn test_window_and_samples_bounded() {
        let config = VolatilityConfig {
            max_candles: 12,
            min_candles: 1,
            max_samples: 5,
            ..Default::default()
        };
        let mut tracker = VolatilityTracker::new("BTC/USDT", config);
        for i in 0..30 {
            tracker.push_candle(candle(i * 60_000, dec!(2)));
        }

        assert_eq!(tracker.candle_count(), 12);
        assert_eq!(tracker.sample_count(), 5);
    }

    #[test]
    fn test_warm_up_sorts_history() {
        let mut tracker = VolatilityTracker::new("BTC/USDT", VolatilityConfig::default());
        let mut history: Vec<Candle> = known_ranges()
            .into_iter()
            .enumerate()
            .map(|(i, tr)| candle(i as i64 * 60_000, tr))
            .collect();
        history.reverse();

        assert_eq!(tracker.warm_up(history), Some(dec!(0.025)));
        assert_eq!(tracker.candle_count(), 10);
    }
}
