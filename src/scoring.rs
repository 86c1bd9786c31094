//! Per-timeframe scoring
//!
//! Condenses one timeframe's indicator bundle into trend / momentum /
//! volatility sub-scores in [0, 1] plus the supporting facts the entry
//! selector checks (EMA alignment, RSI flags, volume confirmation, squeeze,
//! nearest support/resistance). Scores are cached per (symbol, timeframe)
//! with a short TTL.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::{FrameIndicators, MarketSnapshot, Symbol, Timeframe};

/// Volume must reach this multiple of its average to confirm
const VOLUME_CONFIRM_RATIO: f64 = 1.2;
/// Bollinger width below this percentage counts as a squeeze
const SQUEEZE_WIDTH_PCT: f64 = 4.0;

/// Scoring output for one (symbol, timeframe)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeScore {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Sub-scores in [0, 1]
    pub trend: f64,
    pub momentum: f64,
    pub volatility: f64,
    // Supporting facts
    pub ema_aligned: bool,
    pub rsi: f64,
    pub rsi_overbought: bool,
    pub rsi_oversold: bool,
    pub macd_hist_positive: bool,
    pub volume_confirmed: bool,
    pub bollinger_squeeze: bool,
    /// Nearest level below price (EMA, band, or recent low)
    pub support: Option<f64>,
    /// Nearest level above price (EMA, band, or recent high)
    pub resistance: Option<f64>,
    /// Bearish price/RSI divergence; None when history is unavailable
    pub divergence: Option<bool>,
    pub scored_at: DateTime<Utc>,
}

/// Timeframe scorer with a (symbol, timeframe)-keyed TTL cache
pub struct TimeframeScorer {
    ttl: Duration,
    cache: Mutex<HashMap<(Symbol, Timeframe), TimeframeScore>>,
}

impl TimeframeScorer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Score one timeframe, serving from cache while the TTL holds
    pub fn score(&self, snapshot: &MarketSnapshot, timeframe: Timeframe) -> TimeframeScore {
        self.score_at(snapshot, timeframe, Utc::now())
    }

    pub fn score_at(
        &self,
        snapshot: &MarketSnapshot,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> TimeframeScore {
        let key = (snapshot.symbol.clone(), timeframe);
        let mut cache = self.cache.lock().unwrap();

        if let Some(cached) = cache.get(&key) {
            if now - cached.scored_at < self.ttl {
                debug!(symbol = %snapshot.symbol, timeframe = %timeframe, "score cache hit");
                return cached.clone();
            }
        }

        let mut score = compute_score(snapshot, timeframe);
        score.scored_at = now;
        cache.insert(key, score.clone());
        score
    }
}

fn compute_score(snapshot: &MarketSnapshot, timeframe: Timeframe) -> TimeframeScore {
    let empty = FrameIndicators::default();
    let frame = snapshot.frame(timeframe).unwrap_or(&empty);
    let price = snapshot.price;

    let rsi = frame.rsi.unwrap_or(0.0);
    let (support, resistance) = support_resistance(snapshot, frame, price);

    TimeframeScore {
        symbol: snapshot.symbol.clone(),
        timeframe,
        trend: trend_score(frame, price),
        momentum: momentum_score(frame),
        volatility: volatility_score(frame.atr_pct(price)),
        ema_aligned: frame.ema_stack_bullish(),
        rsi,
        rsi_overbought: rsi > 70.0,
        rsi_oversold: frame.rsi.is_some() && rsi < 30.0,
        macd_hist_positive: frame.macd_hist.unwrap_or(0.0) > 0.0,
        volume_confirmed: frame.volume_ratio() >= VOLUME_CONFIRM_RATIO,
        bollinger_squeeze: {
            let width = frame.bollinger_width_pct();
            width > 0.0 && width < SQUEEZE_WIDTH_PCT
        },
        support,
        resistance,
        divergence: bearish_divergence(frame),
        scored_at: snapshot.generated_at,
    }
}

/// Trend = 0.4 alignment + 0.3 normalized EMA50 slope + 0.3 price position
fn trend_score(frame: &FrameIndicators, price: f64) -> f64 {
    let alignment_bonus = if frame.ema_stack_bullish() {
        1.0
    } else if matches!((frame.ema20, frame.ema50), (Some(f), Some(m)) if f > m) {
        0.5
    } else {
        0.0
    };

    // Slope arrives as a fraction of price per bar; +/-0.4% saturates
    let slope_score = frame
        .ema50_slope
        .map(|s| (0.5 + s / 0.008).clamp(0.0, 1.0))
        .unwrap_or(0.0);

    let above_bonus = match (frame.ema20, frame.ema50) {
        (Some(f), Some(m)) if price > f && price > m => 1.0,
        (_, Some(m)) if price > m => 0.5,
        _ => 0.0,
    };

    (0.4 * alignment_bonus + 0.3 * slope_score + 0.3 * above_bonus).clamp(0.0, 1.0)
}

/// Momentum = 0.4 RSI zone + 0.3 MACD histogram + 0.3 volume confirmation
fn momentum_score(frame: &FrameIndicators) -> f64 {
    let rsi_bonus = match frame.rsi {
        None => 0.0,
        Some(rsi) if rsi > 70.0 => 0.2,
        Some(rsi) if rsi >= 60.0 => 0.9,
        Some(rsi) if rsi >= 40.0 => 0.5,
        Some(rsi) if rsi >= 30.0 => 0.4,
        Some(_) => 0.8, // oversold bounce zone
    };

    // Histogram sign plus magnitude, saturating at 0.2% of price scale
    let macd_bonus = match (frame.macd_hist, frame.bb_middle) {
        (Some(hist), Some(mid)) if mid > 0.0 => {
            (0.5 + hist / (0.004 * mid)).clamp(0.0, 1.0)
        }
        (Some(hist), _) => {
            if hist > 0.0 {
                0.75
            } else {
                0.25
            }
        }
        _ => 0.0,
    };

    let volume_bonus = (frame.volume_ratio() / VOLUME_CONFIRM_RATIO).clamp(0.0, 1.0);

    (0.4 * rsi_bonus + 0.3 * macd_bonus + 0.3 * volume_bonus).clamp(0.0, 1.0)
}

/// Piecewise-linear ATR% mapping into [0, 1]
fn volatility_score(atr_pct: f64) -> f64 {
    if atr_pct <= 0.0 {
        0.0
    } else if atr_pct <= 0.5 {
        atr_pct / 0.5 * 0.25
    } else if atr_pct <= 1.5 {
        0.25 + (atr_pct - 0.5) / 1.0 * 0.25
    } else if atr_pct <= 3.0 {
        0.5 + (atr_pct - 1.5) / 1.5 * 0.25
    } else {
        (0.75 + (atr_pct - 3.0) / 3.0 * 0.25).min(1.0)
    }
}

/// Nearest candidate level on each side of price
fn support_resistance(
    snapshot: &MarketSnapshot,
    frame: &FrameIndicators,
    price: f64,
) -> (Option<f64>, Option<f64>) {
    let candidates = [
        frame.ema20,
        frame.ema50,
        frame.ema200,
        frame.bb_upper,
        frame.bb_lower,
        frame.highest_high,
        snapshot.high_24h,
        snapshot.low_24h,
    ];

    let mut support: Option<f64> = None;
    let mut resistance: Option<f64> = None;
    for level in candidates.into_iter().flatten() {
        if level <= 0.0 {
            continue;
        }
        if level < price {
            support = Some(support.map_or(level, |s: f64| s.max(level)));
        } else if level > price {
            resistance = Some(resistance.map_or(level, |r: f64| r.min(level)));
        }
    }
    (support, resistance)
}

/// Bearish divergence: price made a higher high while RSI made a lower high
/// over the supplied history window. None when history is absent.
fn bearish_divergence(frame: &FrameIndicators) -> Option<bool> {
    let closes = &frame.close_history;
    let rsis = &frame.rsi_history;
    if closes.len() < 4 || closes.len() != rsis.len() {
        return None;
    }

    let mid = closes.len() / 2;
    let max_of = |xs: &[f64]| xs.iter().cloned().fold(f64::MIN, f64::max);

    let price_earlier = max_of(&closes[..mid]);
    let price_later = max_of(&closes[mid..]);
    let rsi_earlier = max_of(&rsis[..mid]);
    let rsi_later = max_of(&rsis[mid..]);

    Some(price_later > price_earlier && rsi_later < rsi_earlier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bullish_frame(price: f64) -> FrameIndicators {
        FrameIndicators {
            ema20: Some(price * 0.99),
            ema50: Some(price * 0.97),
            ema200: Some(price * 0.90),
            ema50_slope: Some(0.004),
            adx: Some(30.0),
            atr: Some(price * 0.012),
            rsi: Some(62.0),
            macd: Some(10.0),
            macd_signal: Some(5.0),
            macd_hist: Some(price * 0.001),
            bb_upper: Some(price * 1.03),
            bb_middle: Some(price),
            bb_lower: Some(price * 0.97),
            volume: Some(1500.0),
            volume_avg: Some(1000.0),
            highest_high: Some(price * 1.01),
            highest_close: Some(price * 1.005),
            ..Default::default()
        }
    }

    #[test]
    fn test_trend_score_bullish_stack() {
        let price = 50_000.0;
        let frame = bullish_frame(price);
        let score = trend_score(&frame, price);
        // Full alignment + positive slope + price above both EMAs
        assert!(score > 0.9, "score {score}");
    }

    #[test]
    fn test_trend_score_missing_data_is_zero() {
        assert_eq!(trend_score(&FrameIndicators::default(), 50_000.0), 0.0);
    }

    #[test]
    fn test_momentum_rsi_zones() {
        let mut frame = bullish_frame(100.0);
        let base = momentum_score(&frame);

        frame.rsi = Some(75.0); // penalized
        assert!(momentum_score(&frame) < base);

        frame.rsi = Some(50.0); // neutral, lower weight
        assert!(momentum_score(&frame) < base);

        frame.rsi = None;
        assert!(momentum_score(&frame) < base);
    }

    #[test]
    fn test_volatility_piecewise_mapping() {
        assert_relative_eq!(volatility_score(0.5), 0.25);
        assert_relative_eq!(volatility_score(1.5), 0.5);
        assert_relative_eq!(volatility_score(3.0), 0.75);
        assert_relative_eq!(volatility_score(1.0), 0.375);
        assert_eq!(volatility_score(10.0), 1.0);
        assert_eq!(volatility_score(0.0), 0.0);
    }

    #[test]
    fn test_support_resistance_nearest() {
        let price = 50_000.0;
        let mut snap = MarketSnapshot::new(Symbol::new("BTCUSDT"), price);
        snap.frames.insert(Timeframe::H1, bullish_frame(price));
        let frame = snap.frame(Timeframe::H1).unwrap().clone();
        let (support, resistance) = support_resistance(&snap, &frame, price);
        // Nearest below: ema20 at 49_500; nearest above: highest_high at 50_500
        assert_eq!(support, Some(price * 0.99));
        assert_eq!(resistance, Some(price * 1.01));
    }

    #[test]
    fn test_divergence_detection() {
        let mut frame = bullish_frame(100.0);
        assert_eq!(bearish_divergence(&frame), None);

        // Price higher highs, RSI lower highs
        frame.close_history = vec![100.0, 101.0, 103.0, 104.0];
        frame.rsi_history = vec![65.0, 70.0, 66.0, 64.0];
        assert_eq!(bearish_divergence(&frame), Some(true));

        // Both confirming
        frame.rsi_history = vec![60.0, 62.0, 66.0, 71.0];
        assert_eq!(bearish_divergence(&frame), Some(false));
    }

    #[test]
    fn test_score_cache() {
        let price = 50_000.0;
        let mut snap = MarketSnapshot::new(Symbol::new("BTCUSDT"), price);
        snap.frames.insert(Timeframe::H4, bullish_frame(price));

        let scorer = TimeframeScorer::new(Duration::minutes(5));
        let now = Utc::now();
        let first = scorer.score_at(&snap, Timeframe::H4, now);

        // Degrade the data; inside the TTL the cached score is returned
        snap.frames.insert(Timeframe::H4, FrameIndicators::default());
        let second = scorer.score_at(&snap, Timeframe::H4, now + Duration::minutes(2));
        assert_relative_eq!(first.trend, second.trend);

        let third = scorer.score_at(&snap, Timeframe::H4, now + Duration::minutes(6));
        assert_eq!(third.trend, 0.0);
    }

    #[test]
    fn test_squeeze_flag() {
        let price = 100.0;
        let mut frame = bullish_frame(price);
        // width = 6% -> not a squeeze
        assert!(!compute_flag(&frame, price));

        frame.bb_upper = Some(price * 1.01);
        frame.bb_lower = Some(price * 0.99);
        // width = 2% -> squeeze
        assert!(compute_flag(&frame, price));
    }

    fn compute_flag(frame: &FrameIndicators, price: f64) -> bool {
        let mut snap = MarketSnapshot::new(Symbol::new("X"), price);
        snap.frames.insert(Timeframe::M15, frame.clone());
        compute_score(&snap, Timeframe::M15).bollinger_squeeze
    }
}
