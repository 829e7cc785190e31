//! Quote and volatility configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{QuoteError, QuoteResult};

/// How volatility feeds into the spread bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpreadMode {
    /// Configured bounds only; volatility is ignored.
    #[default]
    Fixed,
    /// Bounds scaled by the volatility factor.
    Dynamic,
    /// Fixed while inventory is small, dynamic when it is large, blended between.
    Hybrid,
}

/// Quote engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteConfig {
    /// Spread at the inventory balance point (ratio 0.5).
    #[serde(default = "default_base_spread")]
    pub base_spread: Decimal,

    /// Spread with no inventory on the widening side.
    #[serde(default = "default_min_spread")]
    pub min_spread: Decimal,

    /// Spread at full inventory on the widening side.
    #[serde(default = "default_max_spread")]
    pub max_spread: Decimal,

    /// Stock ratio that counts as full inventory.
    #[serde(default = "default_max_stock_ratio")]
    pub max_stock_ratio: Decimal,

    #[serde(default)]
    pub spread_mode: SpreadMode,

    /// Hybrid mode: below this inventory ratio the fixed bounds apply.
    #[serde(default = "default_inventory_safe_threshold")]
    pub inventory_safe_threshold: Decimal,

    /// Hybrid mode: above this inventory ratio the dynamic bounds apply.
    #[serde(default = "default_inventory_risk_threshold")]
    pub inventory_risk_threshold: Decimal,

    /// Volatility factor = 1 + volatility * sensitivity, before clamping.
    #[serde(default = "default_volatility_sensitivity")]
    pub volatility_sensitivity: Decimal,

    #[serde(default = "default_factor_floor")]
    pub factor_floor: Decimal,

    #[serde(default = "default_factor_cap")]
    pub factor_cap: Decimal,

    /// Dynamic bounds never go below this spread.
    #[serde(default = "default_allowed_min_spread")]
    pub allowed_min_spread: Decimal,

    /// Dynamic bounds never go above this spread.
    #[serde(default = "default_allowed_max_spread")]
    pub allowed_max_spread: Decimal,
}

fn default_base_spread() -> Decimal {
    dec!(0.001)
}

fn default_min_spread() -> Decimal {
    dec!(0.0008)
}

fn default_max_spread() -> Decimal {
    dec!(0.003)
}

fn default_max_stock_ratio() -> Decimal {
    dec!(0.25)
}

fn default_inventory_safe_threshold() -> Decimal {
    dec!(0.4)
}

fn default_inventory_risk_threshold() -> Decimal {
    dec!(0.7)
}

fn default_volatility_sensitivity() -> Decimal {
    dec!(10)
}

fn default_factor_floor() -> Decimal {
    dec!(0.5)
}

fn default_factor_cap() -> Decimal {
    dec!(2.0)
}

fn default_allowed_min_spread() -> Decimal {
    dec!(0.0002)
}

fn default_allowed_max_spread() -> Decimal {
    dec!(0.1)
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            base_spread: default_base_spread(),
            min_spread: default_min_spread(),
            max_spread: default_max_spread(),
            max_stock_ratio: default_max_stock_ratio(),
            spread_mode: SpreadMode::default(),
            inventory_safe_threshold: default_inventory_safe_threshold(),
            inventory_risk_threshold: default_inventory_risk_threshold(),
            volatility_sensitivity: default_volatility_sensitivity(),
            factor_floor: default_factor_floor(),
            factor_cap: default_factor_cap(),
            allowed_min_spread: default_allowed_min_spread(),
            allowed_max_spread: default_allowed_max_spread(),
        }
    }
}

impl QuoteConfig {
    /// Reject configurations the engine must not trade with.
    pub fn validate(&self) -> QuoteResult<()> {
        let invalid = |msg: String| Err(QuoteError::InvalidConfig(msg));

        if self.min_spread <= Decimal::ZERO {
            return invalid(format!("min_spread must be positive, got {}", self.min_spread));
        }
        if !(self.min_spread <= self.base_spread && self.base_spread <= self.max_spread) {
            return invalid(format!(
                "spreads must satisfy min <= base <= max, got {} / {} / {}",
                self.min_spread, self.base_spread, self.max_spread
            ));
        }
        if self.max_spread >= Decimal::ONE {
            return invalid(format!("max_spread must be below 1, got {}", self.max_spread));
        }
        if self.max_stock_ratio <= Decimal::ZERO || self.max_stock_ratio > Decimal::ONE {
            return invalid(format!(
                "max_stock_ratio must be in (0, 1], got {}",
                self.max_stock_ratio
            ));
        }
        if self.inventory_safe_threshold < Decimal::ZERO
            || self.inventory_risk_threshold > Decimal::ONE
            || self.inventory_safe_threshold >= self.inventory_risk_threshold
        {
            return invalid(format!(
                "hybrid thresholds must satisfy 0 <= safe < risk <= 1, got {} / {}",
                self.inventory_safe_threshold, self.inventory_risk_threshold
            ));
        }
        if self.volatility_sensitivity < Decimal::ZERO {
            return invalid("volatility_sensitivity must not be negative".to_string());
        }
        if self.factor_floor <= Decimal::ZERO || self.factor_floor > self.factor_cap {
            return invalid(format!(
                "volatility factor bounds must satisfy 0 < floor <= cap, got {} / {}",
                self.factor_floor, self.factor_cap
            ));
        }
        if self.allowed_min_spread <= Decimal::ZERO
            || self.allowed_min_spread > self.allowed_max_spread
        {
            return invalid(format!(
                "allowed spread range must satisfy 0 < min <= max, got {} / {}",
                self.allowed_min_spread, self.allowed_max_spread
            ));
        }
        Ok(())
    }
}

/// Volatility tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityConfig {
    /// Number of true ranges averaged into the ATR.
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// Candle window length.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    /// Candles required before any volatility is reported.
    #[serde(default = "default_min_candles")]
    pub min_candles: usize,

    #[serde(default = "default_true")]
    pub smoothing_enabled: bool,

    /// Weight of the newest value in exponential smoothing.
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: Decimal,

    /// Volatility samples retained.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Candle timeframe requested from the gateway.
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Historical candles fetched at startup.
    #[serde(default = "default_history_candles")]
    pub history_candles: usize,
}

fn default_atr_period() -> usize {
    10
}

fn default_max_candles() -> usize {
    50
}

fn default_min_candles() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_smoothing_factor() -> Decimal {
    dec!(0.1)
}

fn default_max_samples() -> usize {
    20
}

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_history_candles() -> usize {
    20
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            atr_period: default_atr_period(),
            max_candles: default_max_candles(),
            min_candles: default_min_candles(),
            smoothing_enabled: default_true(),
            smoothing_factor: default_smoothing_factor(),
            max_samples: default_max_samples(),
            timeframe: default_timeframe(),
            history_candles: default_history_candles(),
        }
    }
}

impl VolatilityConfig {
    pub fn validate(&self) -> QuoteResult<()> {
        let invalid = |msg: String| Err(QuoteError::InvalidVolatilityConfig(msg));

        if self.atr_period == 0 {
            return invalid("atr_period must be at least 1".to_string());
        }
        if self.min_candles == 0 || self.min_candles > self.max_candles {
            return invalid(format!(
                "candle window must satisfy 1 <= min_candles <= max_candles, got {} / {}",
                self.min_candles, self.max_candles
            ));
        }
        if self.smoothing_factor <= Decimal::ZERO || self.smoothing_factor > Decimal::ONE {
            return invalid(format!(
                "smoothing_factor must be in (0, 1], got {}",
                self.smoothing_factor
            ));
        }
        if self.max_samples == 0 {
            return invalid("max_samples must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QuoteConfig::default();
        assert_eq!(config.base_spread, dec!(0.001));
        assert_eq!(config.min_spread, dec!(0.0008));
        assert_eq!(config.max_spread, dec!(0.003));
        assert_eq!(config.max_stock_ratio, dec!(0.25));
        assert_eq!(config.spread_mode, SpreadMode::Fixed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let toml_str = r#"
            base_spread = "0.002"
            spread_mode = "hybrid"
        "#;
        let config: QuoteConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.base_spread, dec!(0.002));
        assert_eq!(config.spread_mode, SpreadMode::Hybrid);
        assert_eq!(config.min_spread, dec!(0.0008));
    }

    #[test]
    fn test_validate_rejects_unordered_spreads() {
        let config = QuoteConfig {
            min_spread: dec!(0.002),
            base_spread: dec!(0.001),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(QuoteError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_positive_ratio() {
        let config = QuoteConfig {
            max_stock_ratio: Decimal::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = QuoteConfig {
            inventory_safe_threshold: dec!(0.8),
            inventory_risk_threshold: dec!(0.7),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_volatility_defaults() {
        let config = VolatilityConfig::default();
        assert_eq!(config.atr_period, 10);
        assert_eq!(config.max_candles, 50);
        assert_eq!(config.min_candles, 10);
        assert!(config.smoothing_enabled);
        assert_eq!(config.smoothing_factor, dec!(0.1));
        assert_eq!(config.timeframe, "1m");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_volatility_validate_rejects_zero_period() {
        let config = VolatilityConfig {
            atr_period: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(QuoteError::InvalidVolatilityConfig(_))
        ));
    }
}
