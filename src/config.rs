//! Configuration management
//!
//! Fully typed engine configuration loaded from a JSON file, with environment
//! variable support for API credentials. Every field has an explicit default
//! and the whole tree is validated once at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::Symbol;

/// Allocation fractions must sum to 1.0 within this tolerance
pub const ALLOCATION_TOLERANCE: f64 = 0.01;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("entry allocations sum to {0:.4}, expected 1.0 +/- 0.01")]
    AllocationSum(f64),

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("{field} must be within (0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f64 },

    #[error("momentum RSI band is inverted: [{low}, {high}]")]
    InvertedRsiBand { low: f64, high: f64 },

    #[error("no symbols configured")]
    NoSymbols,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub entries: EntriesConfig,
    pub guardrail: GuardrailConfig,
    pub ledger: LedgerConfig,
    pub caches: CacheConfig,
    pub exchange: ExchangeConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Load API credentials from environment if not set
        if let Ok(api_key) = std::env::var("EXCHANGE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("EXCHANGE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole tree; called once at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trading.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }

        let alloc_sum = self.entries.swing.allocation
            + self.entries.momentum.allocation
            + self.entries.scalp.allocation;
        if (alloc_sum - 1.0).abs() > ALLOCATION_TOLERANCE {
            return Err(ConfigError::AllocationSum(alloc_sum));
        }

        for (field, value) in [
            ("trading.total_balance", self.trading.total_balance),
            ("trading.cycle_interval_secs", self.trading.cycle_interval_secs as f64),
            ("trading.watchdog_interval_secs", self.trading.watchdog_interval_secs as f64),
            ("trading.freshness_secs", self.trading.freshness_secs as f64),
            ("caches.regime_ttl_secs", self.caches.regime_ttl_secs as f64),
            ("caches.score_ttl_secs", self.caches.score_ttl_secs as f64),
            ("ledger.retention_days", self.ledger.retention_days as f64),
            ("swing.stop_atr_multiple", self.entries.swing.stop_atr_multiple),
            ("momentum.stop_atr_multiple", self.entries.momentum.stop_atr_multiple),
            ("scalp.stop_atr_multiple", self.entries.scalp.stop_atr_multiple),
            ("guardrail.min_adx", self.guardrail.min_adx),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::NonPositive { field, value });
            }
        }

        for (field, value) in [
            ("swing.risk_per_trade", self.entries.swing.risk_per_trade),
            ("momentum.risk_per_trade", self.entries.momentum.risk_per_trade),
            ("scalp.risk_per_trade", self.entries.scalp.risk_per_trade),
            ("guardrail.max_position_pct", self.guardrail.max_position_pct),
        ] {
            if value <= 0.0 || value > 1.0 {
                return Err(ConfigError::OutOfUnitRange { field, value });
            }
        }

        if self.entries.momentum.rsi_low >= self.entries.momentum.rsi_high {
            return Err(ConfigError::InvertedRsiBand {
                low: self.entries.momentum.rsi_low,
                high: self.entries.momentum.rsi_high,
            });
        }

        Ok(())
    }
}

/// Top-level trading parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    /// Tradable balance in quote currency; balance bookkeeping itself lives
    /// in the external portfolio store
    pub total_balance: f64,
    /// Main evaluation cycle interval
    pub cycle_interval_secs: u64,
    /// Exit watchdog interval
    pub watchdog_interval_secs: u64,
    /// Snapshots older than this block new entries (exits still evaluated)
    pub freshness_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            total_balance: 100_000.0,
            cycle_interval_secs: 900,
            watchdog_interval_secs: 30,
            freshness_secs: 1800,
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }
}

/// Per-entry-type setup parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntriesConfig {
    pub swing: SwingConfig,
    pub momentum: MomentumConfig,
    pub scalp: ScalpConfig,
}

/// Swing (4h) setup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwingConfig {
    pub allocation: f64,
    pub risk_per_trade: f64,
    pub min_adx: f64,
    /// Maximum distance from the 4h EMA20, percent (pullback-to-trend test)
    pub max_pullback_pct: f64,
    pub stop_atr_multiple: f64,
    pub trail_atr_multiple: f64,
    pub partial_tp_pct: f64,
    pub partial_fraction: f64,
    pub final_tp_pct: f64,
    pub max_hold_hours: i64,
}

impl Default for SwingConfig {
    fn default() -> Self {
        SwingConfig {
            allocation: 0.5,
            risk_per_trade: 0.015,
            min_adx: 25.0,
            max_pullback_pct: 2.0,
            stop_atr_multiple: 2.5,
            trail_atr_multiple: 2.5,
            partial_tp_pct: 5.0,
            partial_fraction: 0.5,
            final_tp_pct: 10.0,
            max_hold_hours: 240,
        }
    }
}

/// Momentum (1h) setup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub allocation: f64,
    pub risk_per_trade: f64,
    pub rsi_low: f64,
    pub rsi_high: f64,
    pub min_volume_ratio: f64,
    /// 15m close must reach this fraction of its recent high
    pub breakout_fraction: f64,
    pub stop_atr_multiple: f64,
    pub trail_atr_multiple: f64,
    pub partial_tp_pct: f64,
    pub partial_fraction: f64,
    pub final_tp_pct: f64,
    pub max_hold_hours: i64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        MomentumConfig {
            allocation: 0.5,
            risk_per_trade: 0.01,
            rsi_low: 55.0,
            rsi_high: 70.0,
            min_volume_ratio: 1.2,
            breakout_fraction: 0.995,
            stop_atr_multiple: 1.8,
            trail_atr_multiple: 1.8,
            partial_tp_pct: 2.0,
            partial_fraction: 0.5,
            final_tp_pct: 4.0,
            max_hold_hours: 24,
        }
    }
}

/// Scalp (15m) setup, disabled by default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalpConfig {
    pub enabled: bool,
    pub allocation: f64,
    pub risk_per_trade: f64,
    /// 15m Bollinger width must be below this (squeeze)
    pub max_bb_width_pct: f64,
    pub min_volume_ratio: f64,
    pub min_adx: f64,
    /// Minimum distance to the nearest 1h resistance, percent
    pub min_resistance_distance_pct: f64,
    /// Restrict entries to this UTC hour range when set
    pub liquidity_hours: Option<(u32, u32)>,
    pub stop_atr_multiple: f64,
    pub trail_atr_multiple: f64,
    pub target_pct: f64,
    pub max_hold_hours: i64,
}

impl Default for ScalpConfig {
    fn default() -> Self {
        ScalpConfig {
            enabled: false,
            allocation: 0.0,
            risk_per_trade: 0.005,
            max_bb_width_pct: 4.0,
            min_volume_ratio: 2.0,
            min_adx: 20.0,
            min_resistance_distance_pct: 1.0,
            liquidity_hours: None,
            stop_atr_multiple: 1.2,
            trail_atr_multiple: 1.2,
            target_pct: 1.5,
            max_hold_hours: 4,
        }
    }
}

/// Guardrail validator parameters (legacy single-timeframe path)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub min_adx: f64,
    /// ADX floor used instead of min_adx when confidence >= relax_confidence
    pub relaxed_min_adx: f64,
    pub relax_confidence: f64,
    /// 24h quote-volume floor; skipped when volume data is absent
    pub min_volume_24h: f64,
    /// Fear/greed index at or below this is extreme fear
    pub extreme_fear_threshold: f64,
    pub stop_atr_multiple: f64,
    pub target_atr_multiple: f64,
    /// Stop distance as a fraction of price when ATR is unavailable
    pub stop_pct_fallback: f64,
    /// Directional bias moves stop/target by this fraction
    pub bias_multiplier: f64,
    pub max_position_pct: f64,
    pub volatility_targeting: bool,
    pub target_atr_pct: f64,
    pub vol_scale_min: f64,
    pub vol_scale_max: f64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        GuardrailConfig {
            min_adx: 20.0,
            relaxed_min_adx: 15.0,
            relax_confidence: 0.85,
            min_volume_24h: 1_000_000.0,
            extreme_fear_threshold: 20.0,
            stop_atr_multiple: 2.0,
            target_atr_multiple: 3.0,
            stop_pct_fallback: 0.05,
            bias_multiplier: 0.25,
            max_position_pct: 0.10,
            volatility_targeting: false,
            target_atr_pct: 2.0,
            vol_scale_min: 0.5,
            vol_scale_max: 1.5,
        }
    }
}

/// Order ledger parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: String,
    /// Permit resubmitting a signal whose previous order was canceled or rejected
    pub allow_retry_after_failure: bool,
    pub retention_days: i64,
    /// Bucket width for the in-memory fallback dedup
    pub fallback_bucket_minutes: i64,
    /// Expiry of fallback dedup entries
    pub fallback_expiry_minutes: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            path: "state/order_ledger.json".to_string(),
            allow_retry_after_failure: false,
            retention_days: 30,
            fallback_bucket_minutes: 15,
            fallback_expiry_minutes: 15,
        }
    }
}

/// Cache TTLs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub regime_ttl_secs: u64,
    pub score_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            regime_ttl_secs: 3600,
            score_ttl_secs: 300,
        }
    }
}

/// Execution collaborator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Bounded submission attempts; backoff doubles between them
    pub max_order_attempts: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            base_url: "https://api.exchange.example.com".to_string(),
            request_timeout_secs: 10,
            max_order_attempts: 3,
        }
    }
}
