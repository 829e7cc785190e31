//! Integration tests for configuration files.

use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};

use skew_bot::{AppConfig, AppError};
use skew_core::DirectionMode;
use skew_quote::SpreadMode;

const DEFAULT_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/default.toml");

#[test]
fn test_default_config_file_loads_and_validates() {
    let config = assert_ok!(AppConfig::from_file(DEFAULT_CONFIG));
    assert_ok!(config.validate());

    assert_eq!(config.quote.base_spread, dec!(0.001));
    assert_eq!(config.quote.min_spread, dec!(0.0008));
    assert_eq!(config.quote.max_spread, dec!(0.003));
    assert_eq!(config.quote.spread_mode, SpreadMode::Fixed);
    assert_eq!(config.engine.direction, DirectionMode::Both);
    assert_eq!(config.engine.order_cool_down_ms, 100);
    assert_eq!(config.engine.no_order_timeout_secs, 60);
    assert_eq!(config.volatility.atr_period, 10);
    assert_eq!(config.volatility.history_candles, 20);

    let enabled: Vec<&str> = config
        .enabled_instruments()
        .map(|i| i.symbol.as_str())
        .collect();
    assert_eq!(enabled, vec!["BTC/USDT"]);
}

#[test]
fn test_missing_file_is_config_error() {
    let err = assert_err!(AppConfig::from_file("does/not/exist.toml"));
    assert!(matches!(err, AppError::Config(_)));
    assert!(err.to_string().contains("Failed to read config"));
}

#[test]
fn test_file_written_to_disk_roundtrips() {
    let path = std::env::temp_dir().join(format!("skew-bot-config-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
        [engine]
        direction = "short"
        incremental_enabled = true
        grid_interval = "0.05"

        [quote]
        spread_mode = "hybrid"

        [[instruments]]
        symbol = "SOL/USDT"
        leverage = 5
        "#,
    )
    .unwrap();

    let config = AppConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    config.validate().unwrap();
    assert_eq!(config.engine.direction, DirectionMode::Short);
    assert_eq!(config.engine.grid_interval, Some(dec!(0.05)));
    assert_eq!(config.quote.spread_mode, SpreadMode::Hybrid);
    assert_eq!(config.instruments[0].leverage, 5);
}

#[test]
fn test_malformed_values_rejected() {
    let parse_err = AppConfig::from_toml("[engine]\ndirection = \"sideways\"\n").unwrap_err();
    assert!(parse_err.to_string().contains("Failed to parse config"));

    let config = AppConfig::from_toml(
        r#"
        [engine]
        price_deviation_factor = "0"

        [[instruments]]
        symbol = "BTC/USDT"
        "#,
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("[engine]"));
}
