//! Entry strategy selection
//!
//! Evaluates the three mutually exclusive setups in strict priority order
//! (swing -> momentum -> scalp) and returns the first valid one as a BUY
//! signal, fully sized and tagged with a deterministic signal id. When no
//! setup validates, the result is a HOLD carrying the first disqualifying
//! reason.

pub mod momentum;
pub mod scalp;
pub mod swing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{Config, EntriesConfig};
use crate::regime::{Regime, RegimeClassifier, RegimeResult};
use crate::scoring::{TimeframeScore, TimeframeScorer};
use crate::{MarketSnapshot, Symbol, Timeframe};

/// Entry setup families, sized for different holding horizons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    #[serde(rename = "SWING_4H")]
    Swing4h,
    #[serde(rename = "MOMENTUM_1H")]
    Momentum1h,
    #[serde(rename = "SCALP_15M")]
    Scalp15m,
}

impl EntryType {
    /// The timeframe whose closed bar anchors this setup's signal id
    pub fn trigger_timeframe(&self) -> Timeframe {
        match self {
            EntryType::Swing4h => Timeframe::H4,
            EntryType::Momentum1h => Timeframe::H1,
            EntryType::Scalp15m => Timeframe::M15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Swing4h => "SWING_4H",
            EntryType::Momentum1h => "MOMENTUM_1H",
            EntryType::Scalp15m => "SCALP_15M",
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Signal action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Hold,
}

/// Where the signal id's timestamp component came from
///
/// `WallClock` is a degraded mode: two processes evaluating in different
/// bucket windows could disagree, so it is tagged for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalIdSource {
    BarClose,
    CoarserBarClose,
    WallClock,
}

/// Fully specified entry decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: Symbol,
    pub action: Action,
    pub entry_type: Option<EntryType>,
    pub confidence: f64,
    pub reason: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    /// Partial take-profit level; None for setups without a partial leg
    pub partial_take_profit: Option<f64>,
    pub final_take_profit: f64,
    /// Fraction of quantity sold at the partial level
    pub partial_fraction: f64,
    pub quantity: f64,
    /// Amount at risk in quote currency (entry to stop, times quantity)
    pub risk_amount: f64,
    pub risk_reward: f64,
    pub expected_hold: String,
    pub regime: Regime,
    pub signal_id: String,
    pub id_source: SignalIdSource,
    pub evaluated_at: DateTime<Utc>,
}

impl EntrySignal {
    /// Structured HOLD; business-rule rejections are values, not errors
    pub fn hold(symbol: Symbol, regime: Regime, reason: impl Into<String>) -> Self {
        EntrySignal {
            symbol,
            action: Action::Hold,
            entry_type: None,
            confidence: 0.0,
            reason: reason.into(),
            entry_price: 0.0,
            stop_loss: 0.0,
            partial_take_profit: None,
            final_take_profit: 0.0,
            partial_fraction: 0.0,
            quantity: 0.0,
            risk_amount: 0.0,
            risk_reward: 0.0,
            expected_hold: String::new(),
            regime,
            signal_id: String::new(),
            id_source: SignalIdSource::BarClose,
            evaluated_at: Utc::now(),
        }
    }

    pub fn is_buy(&self) -> bool {
        self.action == Action::Buy
    }
}

/// A validated setup before sizing
#[derive(Debug, Clone)]
pub struct SetupPlan {
    pub entry_type: EntryType,
    pub stop_loss: f64,
    pub partial_take_profit: Option<f64>,
    pub final_take_profit: f64,
    pub partial_fraction: f64,
    pub allocation: f64,
    pub risk_per_trade: f64,
    pub expected_hold: String,
}

/// Scores for the timeframes the setups consult
pub struct ScoreSet {
    pub h4: TimeframeScore,
    pub h1: TimeframeScore,
    pub m15: TimeframeScore,
}

/// Strategy selector: regime + scores + snapshot -> EntrySignal
pub struct EntrySelector {
    config: Config,
    classifier: Arc<RegimeClassifier>,
    scorer: Arc<TimeframeScorer>,
}

impl EntrySelector {
    pub fn new(
        config: Config,
        classifier: Arc<RegimeClassifier>,
        scorer: Arc<TimeframeScorer>,
    ) -> Self {
        Self {
            config,
            classifier,
            scorer,
        }
    }

    pub fn entries(&self) -> &EntriesConfig {
        &self.config.entries
    }

    /// Evaluate all setups for one snapshot
    ///
    /// When no regime is supplied the selector invokes the classifier itself.
    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        regime_override: Option<RegimeResult>,
    ) -> EntrySignal {
        self.evaluate_at(snapshot, regime_override, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        snapshot: &MarketSnapshot,
        regime_override: Option<RegimeResult>,
        now: DateTime<Utc>,
    ) -> EntrySignal {
        let regime =
            regime_override.unwrap_or_else(|| self.classifier.classify_at(snapshot, now));

        if snapshot.is_stale(
            now,
            chrono::Duration::seconds(self.config.trading.freshness_secs as i64),
        ) {
            return EntrySignal::hold(
                snapshot.symbol.clone(),
                regime.regime,
                "snapshot stale, entries blocked",
            );
        }

        let scores = ScoreSet {
            h4: self.scorer.score_at(snapshot, Timeframe::H4, now),
            h1: self.scorer.score_at(snapshot, Timeframe::H1, now),
            m15: self.scorer.score_at(snapshot, Timeframe::M15, now),
        };

        // Strict priority: swing, then momentum, then scalp. The first
        // disqualifying reason (from the highest-priority setup) is what a
        // HOLD reports.
        let mut first_reason: Option<String> = None;

        let evaluations: [Result<SetupPlan, String>; 3] = [
            swing::evaluate(snapshot, &regime, &scores, &self.config.entries.swing),
            momentum::evaluate(snapshot, &regime, &scores, &self.config.entries.momentum),
            scalp::evaluate(snapshot, &regime, &scores, &self.config.entries.scalp, now),
        ];

        for evaluation in evaluations {
            match evaluation {
                Ok(plan) => return self.size_signal(snapshot, &regime, plan, now),
                Err(reason) => {
                    debug!(symbol = %snapshot.symbol, %reason, "setup disqualified");
                    first_reason.get_or_insert(reason);
                }
            }
        }

        EntrySignal::hold(
            snapshot.symbol.clone(),
            regime.regime,
            first_reason.unwrap_or_else(|| "no setup valid".to_string()),
        )
    }

    /// Convert a validated plan into a sized BUY signal
    fn size_signal(
        &self,
        snapshot: &MarketSnapshot,
        regime: &RegimeResult,
        plan: SetupPlan,
        now: DateTime<Utc>,
    ) -> EntrySignal {
        let price = snapshot.price;
        let stop_distance = price - plan.stop_loss;

        // Regime confidence scales nominal risk into [0.7, 1.0]
        let confidence_scale = 0.7 + 0.3 * regime.confidence;
        let available = self.config.trading.total_balance * plan.allocation;
        let risk_amount = available * plan.risk_per_trade * confidence_scale;

        let raw_quantity = if stop_distance > 0.0 {
            risk_amount / stop_distance
        } else {
            0.0
        };
        // Hard cap: never more than 10% of total balance in one position
        let max_quantity = 0.10 * self.config.trading.total_balance / price;
        let quantity = raw_quantity.min(max_quantity);

        let risk_reward = if stop_distance > 0.0 {
            (plan.final_take_profit - price) / stop_distance
        } else {
            0.0
        };

        let (signal_id, id_source) =
            build_signal_id(&snapshot.symbol, plan.entry_type.trigger_timeframe(), snapshot, now);

        EntrySignal {
            symbol: snapshot.symbol.clone(),
            action: Action::Buy,
            entry_type: Some(plan.entry_type),
            confidence: regime.confidence,
            reason: format!("{} setup valid in {} regime", plan.entry_type, regime.regime),
            entry_price: price,
            stop_loss: plan.stop_loss,
            partial_take_profit: plan.partial_take_profit,
            final_take_profit: plan.final_take_profit,
            partial_fraction: plan.partial_fraction,
            quantity,
            risk_amount: quantity * stop_distance,
            risk_reward,
            expected_hold: plan.expected_hold,
            regime: regime.regime,
            signal_id,
            id_source,
            evaluated_at: now,
        }
    }
}

/// Deterministic signal id: symbol + trigger timeframe + last closed bar.
///
/// Falls back to a coarser frame's bar close, and only as a last resort to a
/// wall-clock bucket aligned to the trigger timeframe. Both fallbacks are
/// reported so callers can alert on degraded determinism.
pub fn build_signal_id(
    symbol: &Symbol,
    trigger: Timeframe,
    snapshot: &MarketSnapshot,
    now: DateTime<Utc>,
) -> (String, SignalIdSource) {
    if let Some(ts) = snapshot.frame(trigger).and_then(|f| f.last_close_time) {
        return (
            format!("{}_{}_{}", symbol, trigger.as_str(), ts.timestamp()),
            SignalIdSource::BarClose,
        );
    }

    let mut tf = trigger.coarser();
    while let Some(coarse) = tf {
        if let Some(ts) = snapshot.frame(coarse).and_then(|f| f.last_close_time) {
            warn!(
                %symbol,
                trigger = %trigger,
                fallback = %coarse,
                "trigger timeframe missing bar close, using coarser frame for signal id"
            );
            return (
                format!("{}_{}_{}", symbol, coarse.as_str(), ts.timestamp()),
                SignalIdSource::CoarserBarClose,
            );
        }
        tf = coarse.coarser();
    }

    // Degraded: bucket wall clock to the trigger timeframe
    let bucket_secs = trigger.duration().num_seconds();
    let bucket = now.timestamp() - now.timestamp().rem_euclid(bucket_secs);
    warn!(
        %symbol,
        trigger = %trigger,
        "no bar close available on any frame, wall-clock bucket signal id"
    );
    (
        format!("{}_{}_{}", symbol, trigger.as_str(), bucket),
        SignalIdSource::WallClock,
    )
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::FrameIndicators;

    /// Strong-trend snapshot that validates the swing, momentum, and scalp
    /// setups (price 50_000, bullish stacks, confirmed volume, 15m squeeze)
    pub fn trending_snapshot() -> MarketSnapshot {
        let price = 50_000.0;
        let close = Utc::now() - chrono::Duration::minutes(10);
        let mut snap = MarketSnapshot::new(Symbol::new("BTCUSDT"), price);

        snap.frames.insert(
            Timeframe::H4,
            FrameIndicators {
                ema20: Some(50_100.0),
                ema50: Some(49_500.0),
                ema200: Some(47_000.0),
                ema50_slope: Some(0.003),
                adx: Some(35.0),
                atr: Some(800.0),
                rsi: Some(58.0),
                macd: Some(120.0),
                macd_signal: Some(80.0),
                macd_hist: Some(40.0),
                prev_macd_hist: Some(25.0),
                bb_upper: Some(52_500.0),
                bb_middle: Some(50_000.0),
                bb_lower: Some(47_500.0),
                volume: Some(1_200.0),
                volume_avg: Some(1_000.0),
                highest_high: Some(50_400.0),
                highest_close: Some(50_200.0),
                last_close_time: Some(close),
                ..Default::default()
            },
        );

        snap.frames.insert(
            Timeframe::H1,
            FrameIndicators {
                ema20: Some(49_900.0),
                ema50: Some(49_600.0),
                ema50_slope: Some(0.002),
                adx: Some(28.0),
                atr: Some(300.0),
                rsi: Some(58.0),
                macd: Some(30.0),
                macd_signal: Some(18.0),
                macd_hist: Some(12.0),
                prev_macd_hist: Some(6.0),
                bb_upper: Some(51_000.0),
                bb_middle: Some(50_000.0),
                bb_lower: Some(49_000.0),
                volume: Some(1_500.0),
                volume_avg: Some(1_000.0),
                highest_high: Some(51_500.0),
                highest_close: Some(51_200.0),
                last_close_time: Some(close),
                ..Default::default()
            },
        );

        snap.frames.insert(
            Timeframe::M15,
            FrameIndicators {
                ema20: Some(49_950.0),
                ema50: Some(49_850.0),
                adx: Some(25.0),
                atr: Some(150.0),
                rsi: Some(60.0),
                bb_upper: Some(50_750.0),
                bb_middle: Some(50_000.0),
                bb_lower: Some(49_250.0),
                volume: Some(2_500.0),
                volume_avg: Some(1_000.0),
                highest_high: Some(50_100.0),
                highest_close: Some(50_050.0),
                last_close_time: Some(close),
                ..Default::default()
            },
        );

        snap
    }

    pub fn scalp_snapshot() -> MarketSnapshot {
        trending_snapshot()
    }

    pub fn score_set(snapshot: &MarketSnapshot) -> ScoreSet {
        let scorer = TimeframeScorer::new(chrono::Duration::minutes(5));
        ScoreSet {
            h4: scorer.score(snapshot, Timeframe::H4),
            h1: scorer.score(snapshot, Timeframe::H1),
            m15: scorer.score(snapshot, Timeframe::M15),
        }
    }
}
