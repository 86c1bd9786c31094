//! Market regime classification
//!
//! Classifies the prevailing market condition per symbol from the 4h frame of
//! a snapshot, with a distance-from-threshold confidence score. Results are
//! cached per symbol with a TTL so repeated evaluations inside one hour reuse
//! the same classification.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::{MarketSnapshot, Symbol, Timeframe};

// Classification thresholds (4h frame)
const VOLATILE_ATR_PCT: f64 = 3.0;
const VOLATILE_SWING_PCT: f64 = 5.0;
const STRONG_ADX: f64 = 30.0;
const STRONG_ATR_PCT: f64 = 1.5;
const STRONG_BB_WIDTH_PCT: f64 = 5.0;
const RANGING_ADX: f64 = 20.0;
const RANGING_ATR_PCT: f64 = 0.8;
const RANGING_BB_WIDTH_PCT: f64 = 3.0;

/// Coarse market condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    StrongTrend,
    WeakTrend,
    Ranging,
    Volatile,
    Unknown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Regime::StrongTrend => "STRONG_TREND",
            Regime::WeakTrend => "WEAK_TREND",
            Regime::Ranging => "RANGING",
            Regime::Volatile => "VOLATILE",
            Regime::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Per-timeframe trend alignment label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendAlignment {
    Trend,
    WeakTrend,
    Range,
}

/// Classification output; never mutated after creation, only replaced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeResult {
    pub regime: Regime,
    /// Distance-from-threshold confidence in [0, 1]
    pub confidence: f64,
    /// Independent alignment label per timeframe present in the snapshot
    pub alignment: HashMap<Timeframe, TrendAlignment>,
    /// Raw inputs the classification was computed from
    pub adx_4h: f64,
    pub atr_pct_4h: f64,
    pub bb_width_pct_4h: f64,
    pub classified_at: DateTime<Utc>,
}

/// Regime classifier with a per-symbol TTL cache
pub struct RegimeClassifier {
    ttl: Duration,
    cache: Mutex<HashMap<Symbol, RegimeResult>>,
}

impl RegimeClassifier {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Classify the symbol's regime, serving from cache while the TTL holds
    pub fn classify(&self, snapshot: &MarketSnapshot) -> RegimeResult {
        self.classify_at(snapshot, Utc::now())
    }

    /// Classification with an explicit clock, pure given snapshot and cache
    pub fn classify_at(&self, snapshot: &MarketSnapshot, now: DateTime<Utc>) -> RegimeResult {
        let mut cache = self.cache.lock().unwrap();

        if let Some(cached) = cache.get(&snapshot.symbol) {
            if now - cached.classified_at < self.ttl {
                debug!(symbol = %snapshot.symbol, regime = %cached.regime, "regime cache hit");
                return cached.clone();
            }
        }

        let mut result = compute_regime(snapshot);
        result.classified_at = now;

        if let Some(previous) = cache.get(&snapshot.symbol) {
            if previous.regime != result.regime {
                info!(
                    symbol = %snapshot.symbol,
                    from = %previous.regime,
                    to = %result.regime,
                    confidence = format!("{:.2}", result.confidence),
                    "regime change"
                );
            }
        }

        cache.insert(snapshot.symbol.clone(), result.clone());
        result
    }

    /// Drop the cached entry for a symbol (used by tests and manual refresh)
    pub fn invalidate(&self, symbol: &Symbol) {
        self.cache.lock().unwrap().remove(symbol);
    }
}

/// Priority-ordered classification, first match wins
fn compute_regime(snapshot: &MarketSnapshot) -> RegimeResult {
    // Missing indicators default to zero; that fails the threshold checks
    // and lowers confidence, but never errors.
    let frame_4h = snapshot.frame(Timeframe::H4);
    let adx = frame_4h.and_then(|f| f.adx).unwrap_or(0.0);
    let atr_pct = frame_4h.map(|f| f.atr_pct(snapshot.price)).unwrap_or(0.0);
    let bb_width = frame_4h.map(|f| f.bollinger_width_pct()).unwrap_or(0.0);
    let swing_pct = snapshot.swing_24h_pct();

    let missing = [
        frame_4h.and_then(|f| f.adx).is_none(),
        frame_4h.and_then(|f| f.atr).is_none(),
        frame_4h.map(|f| f.bollinger_width_pct() == 0.0).unwrap_or(true),
    ]
    .iter()
    .filter(|m| **m)
    .count();

    let (regime, raw_confidence) = if atr_pct > VOLATILE_ATR_PCT || swing_pct > VOLATILE_SWING_PCT {
        let conf = weighted_distance(&[
            (excess(atr_pct, VOLATILE_ATR_PCT, 2.0), 0.6),
            (excess(swing_pct, VOLATILE_SWING_PCT, 5.0), 0.4),
        ]);
        (Regime::Volatile, conf)
    } else if adx > STRONG_ADX && atr_pct > STRONG_ATR_PCT && bb_width > STRONG_BB_WIDTH_PCT {
        let conf = weighted_distance(&[
            (excess(adx, STRONG_ADX, 15.0), 0.5),
            (excess(atr_pct, STRONG_ATR_PCT, 1.0), 0.25),
            (excess(bb_width, STRONG_BB_WIDTH_PCT, 5.0), 0.25),
        ]);
        (Regime::StrongTrend, conf)
    } else if adx < RANGING_ADX && atr_pct < RANGING_ATR_PCT && bb_width < RANGING_BB_WIDTH_PCT {
        let conf = weighted_distance(&[
            (shortfall(adx, RANGING_ADX, 10.0), 0.5),
            (shortfall(atr_pct, RANGING_ATR_PCT, 0.8), 0.25),
            (shortfall(bb_width, RANGING_BB_WIDTH_PCT, 3.0), 0.25),
        ]);
        (Regime::Ranging, conf)
    } else if (RANGING_ADX..=STRONG_ADX).contains(&adx)
        && (RANGING_ATR_PCT..=STRONG_ATR_PCT).contains(&atr_pct)
    {
        // Mid-band: confidence peaks at the band centre
        let conf = weighted_distance(&[
            (band_centrality(adx, RANGING_ADX, STRONG_ADX), 0.6),
            (band_centrality(atr_pct, RANGING_ATR_PCT, STRONG_ATR_PCT), 0.4),
        ]);
        (Regime::WeakTrend, conf)
    } else {
        // Fallback: ADX alone, at reduced confidence
        let regime = if adx > STRONG_ADX {
            Regime::StrongTrend
        } else if adx < RANGING_ADX {
            Regime::Ranging
        } else {
            Regime::WeakTrend
        };
        (regime, 0.4)
    };

    let confidence = (raw_confidence * (1.0 - 0.2 * missing as f64)).clamp(0.0, 1.0);

    RegimeResult {
        regime,
        confidence,
        alignment: compute_alignment(snapshot),
        adx_4h: adx,
        atr_pct_4h: atr_pct,
        bb_width_pct_4h: bb_width,
        classified_at: snapshot.generated_at,
    }
}

/// Alignment is computed independently per timeframe from its ADX
fn compute_alignment(snapshot: &MarketSnapshot) -> HashMap<Timeframe, TrendAlignment> {
    snapshot
        .frames
        .iter()
        .map(|(tf, frame)| {
            let adx = frame.adx.unwrap_or(0.0);
            let label = if adx > 25.0 {
                TrendAlignment::Trend
            } else if adx >= 20.0 {
                TrendAlignment::WeakTrend
            } else {
                TrendAlignment::Range
            };
            (*tf, label)
        })
        .collect()
}

/// Normalized distance above a threshold, clamped to [0, 1]
fn excess(value: f64, threshold: f64, scale: f64) -> f64 {
    ((value - threshold) / scale).clamp(0.0, 1.0)
}

/// Normalized distance below a threshold, clamped to [0, 1]
fn shortfall(value: f64, threshold: f64, scale: f64) -> f64 {
    ((threshold - value) / scale).clamp(0.0, 1.0)
}

/// 1.0 at the centre of [low, high], 0.0 at its edges
fn band_centrality(value: f64, low: f64, high: f64) -> f64 {
    let half = (high - low) / 2.0;
    if half <= 0.0 {
        return 0.0;
    }
    let centre = low + half;
    (1.0 - (value - centre).abs() / half).clamp(0.0, 1.0)
}

/// Weighted mean of component distances mapped into [0.5, 1.0]
///
/// A regime that barely clears its thresholds scores 0.5; deep clearance on
/// every component approaches 1.0.
fn weighted_distance(components: &[(f64, f64)]) -> f64 {
    let total_weight: f64 = components.iter().map(|(_, w)| w).sum();
    if total_weight == 0.0 {
        return 0.5;
    }
    let mean: f64 =
        components.iter().map(|(d, w)| d * w).sum::<f64>() / total_weight;
    (0.5 + 0.5 * mean).clamp(0.0, 1.0)
}
