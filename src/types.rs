//! Core data types used across the trading engine

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Validation errors for market snapshots
#[derive(Debug, Error)]
pub enum SnapshotValidationError {
    #[error("price ({0}) must be positive")]
    NonPositivePrice(f64),

    #[error("24h high ({high}) must be >= 24h low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("snapshot has no indicator frames")]
    NoFrames,
}

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned on every evaluation cycle when passed to the classifier,
/// scorer, and ledger. Arc<str> keeps those clones O(1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Chart timeframes the engine evaluates, coarsest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "15m")]
    M15,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::W1 => "1w",
            Timeframe::D1 => "1d",
            Timeframe::H4 => "4h",
            Timeframe::H1 => "1h",
            Timeframe::M15 => "15m",
        }
    }

    /// Bar duration of the timeframe
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::W1 => Duration::weeks(1),
            Timeframe::D1 => Duration::days(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::M15 => Duration::minutes(15),
        }
    }

    /// Next coarser timeframe, used for signal id fallback
    pub fn coarser(&self) -> Option<Timeframe> {
        match self {
            Timeframe::W1 => None,
            Timeframe::D1 => Some(Timeframe::W1),
            Timeframe::H4 => Some(Timeframe::D1),
            Timeframe::H1 => Some(Timeframe::H4),
            Timeframe::M15 => Some(Timeframe::H1),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Indicator bundle for one timeframe of a snapshot
///
/// Every field is optional: the data collaborator omits indicators it could
/// not compute, and the engine resolves missing values conservatively
/// instead of erroring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameIndicators {
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub ema200: Option<f64>,
    /// Slope of EMA50 over the last few bars, as a fraction of price
    pub ema50_slope: Option<f64>,
    pub adx: Option<f64>,
    pub atr: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    /// MACD histogram one bar earlier, for expansion checks
    pub prev_macd_hist: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub volume: Option<f64>,
    pub volume_avg: Option<f64>,
    /// Highest high over the lookback window
    pub highest_high: Option<f64>,
    /// Highest close over the lookback window
    pub highest_close: Option<f64>,
    /// Close timestamp of the last completed bar
    pub last_close_time: Option<DateTime<Utc>>,
    /// Recent close series (oldest first), empty when unavailable
    #[serde(default)]
    pub close_history: Vec<f64>,
    /// Recent RSI series aligned with close_history
    #[serde(default)]
    pub rsi_history: Vec<f64>,
}

impl FrameIndicators {
    /// ATR as a percentage of the given price, 0.0 when unavailable
    pub fn atr_pct(&self, price: f64) -> f64 {
        match self.atr {
            Some(atr) if price > 0.0 => atr / price * 100.0,
            _ => 0.0,
        }
    }

    /// Bollinger band width as a percentage of the middle band
    pub fn bollinger_width_pct(&self) -> f64 {
        match (self.bb_upper, self.bb_middle, self.bb_lower) {
            (Some(u), Some(m), Some(l)) if m > 0.0 => (u - l) / m * 100.0,
            _ => 0.0,
        }
    }

    /// Volume relative to its average, 0.0 when either is missing
    pub fn volume_ratio(&self) -> f64 {
        match (self.volume, self.volume_avg) {
            (Some(v), Some(avg)) if avg > 0.0 => v / avg,
            _ => 0.0,
        }
    }

    /// EMA stack is fully bullish (20 > 50 > 200)
    pub fn ema_stack_bullish(&self) -> bool {
        matches!(
            (self.ema20, self.ema50, self.ema200),
            (Some(f), Some(m), Some(s)) if f > m && m > s
        )
    }
}

/// Multi-timeframe market snapshot supplied once per symbol per cycle
///
/// Immutable input: the engine never mutates a snapshot and holds no
/// reference to it beyond the evaluation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub price: f64,
    /// When the data collaborator assembled this snapshot
    pub generated_at: DateTime<Utc>,
    pub frames: HashMap<Timeframe, FrameIndicators>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub volume_24h: Option<f64>,
}

impl MarketSnapshot {
    pub fn new(symbol: Symbol, price: f64) -> Self {
        Self {
            symbol,
            price,
            generated_at: Utc::now(),
            frames: HashMap::new(),
            high_24h: None,
            low_24h: None,
            volume_24h: None,
        }
    }

    pub fn frame(&self, tf: Timeframe) -> Option<&FrameIndicators> {
        self.frames.get(&tf)
    }

    /// 24h swing range as a percentage of the low, 0.0 when unavailable
    pub fn swing_24h_pct(&self) -> f64 {
        match (self.high_24h, self.low_24h) {
            (Some(h), Some(l)) if l > 0.0 => (h - l) / l * 100.0,
            _ => 0.0,
        }
    }

    /// Snapshot is older than the given freshness window
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.generated_at > max_age
    }

    pub fn validate(&self) -> Result<(), SnapshotValidationError> {
        if self.price <= 0.0 {
            return Err(SnapshotValidationError::NonPositivePrice(self.price));
        }
        if let (Some(h), Some(l)) = (self.high_24h, self.low_24h) {
            if h < l {
                return Err(SnapshotValidationError::HighLessThanLow { high: h, low: l });
            }
        }
        if self.frames.is_empty() {
            return Err(SnapshotValidationError::NoFrames);
        }
        Ok(())
    }
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Monetary Values
// ============================================================================

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub};

/// Money type for values that cross the execution and ledger boundary.
///
/// Wraps `rust_decimal::Decimal` so that filled quantities and average fill
/// prices recorded in the ledger reconcile exactly with exchange reports.
/// Indicator and scoring math stays in f64; conversion happens at the edge.
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Create from f64; NaN and infinity collapse to zero
    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or_else(|_| {
            if value.is_nan() || value.is_infinite() {
                Decimal::ZERO
            } else {
                Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
            }
        }))
    }

    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}
