//! Risk guardrail validator for the simple strategy path
//!
//! A lighter gate than the multi-timeframe selector: a handful of veto
//! checks plus ATR-based stop/target and quantity computation. Rejections
//! are values with a reason, never errors.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GuardrailConfig;
use crate::{MarketSnapshot, Timeframe};

/// Dominant trend direction reported by the caller's trend filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendBias {
    Bullish,
    Neutral,
    Bearish,
    StronglyBearish,
}

impl TrendBias {
    /// Classify the dominant trend from the 4h EMA stack. Missing EMAs fall
    /// back to Neutral so a thin feed never vetoes on its own.
    pub fn from_snapshot(snapshot: &MarketSnapshot) -> TrendBias {
        let frame = match snapshot.frame(Timeframe::H4) {
            Some(f) => f,
            None => return TrendBias::Neutral,
        };
        match (frame.ema20, frame.ema50, frame.ema200) {
            (Some(e20), Some(e50), Some(e200)) => {
                if e20 < e50 && e50 < e200 && snapshot.price < e200 {
                    TrendBias::StronglyBearish
                } else if e20 < e50 {
                    TrendBias::Bearish
                } else if snapshot.price > e200 {
                    TrendBias::Bullish
                } else {
                    TrendBias::Neutral
                }
            }
            (Some(e20), Some(e50), None) => {
                if e20 < e50 {
                    TrendBias::Bearish
                } else {
                    TrendBias::Bullish
                }
            }
            _ => TrendBias::Neutral,
        }
    }
}

/// Shift applied to stop/target distances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelBias {
    Tighter,
    Neutral,
    Looser,
}

/// Outcome of a guardrail check
#[derive(Debug, Clone)]
pub struct GuardrailVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl GuardrailVerdict {
    fn allow() -> Self {
        GuardrailVerdict {
            allowed: true,
            reason: String::new(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        GuardrailVerdict {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Stop/target pair computed from ATR or the percentage fallback
#[derive(Debug, Clone, Copy)]
pub struct ProtectiveLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

pub struct GuardrailValidator {
    config: GuardrailConfig,
}

impl GuardrailValidator {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    /// Veto checks, applied in order. The first failure wins.
    pub fn validate_entry(
        &self,
        snapshot: &MarketSnapshot,
        trend: TrendBias,
        confidence: f64,
        fear_greed: Option<f64>,
    ) -> GuardrailVerdict {
        if trend == TrendBias::StronglyBearish {
            return GuardrailVerdict::reject("dominant trend strongly bearish");
        }

        let adx = snapshot
            .frame(Timeframe::H4)
            .and_then(|f| f.adx)
            .unwrap_or(0.0);
        let min_adx = if confidence >= self.config.relax_confidence {
            self.config.relaxed_min_adx
        } else {
            self.config.min_adx
        };
        if adx < min_adx {
            return GuardrailVerdict::reject(format!(
                "ADX {adx:.1} below minimum {min_adx:.1}"
            ));
        }

        // Volume floor is skipped when the feed has no 24h volume.
        if let Some(volume) = snapshot.volume_24h {
            if volume < self.config.min_volume_24h {
                return GuardrailVerdict::reject(format!(
                    "24h volume {volume:.0} below floor {:.0}",
                    self.config.min_volume_24h
                ));
            }
        }

        if let Some(index) = fear_greed {
            if index <= self.config.extreme_fear_threshold {
                return GuardrailVerdict::reject(format!("extreme fear, index {index:.0}"));
            }
        }

        debug!(symbol = %snapshot.symbol, adx, "guardrail passed");
        GuardrailVerdict::allow()
    }

    /// Stop at 2x ATR, target at 3x ATR, with a percentage fallback and a
    /// +/-25% directional bias.
    pub fn protective_levels(
        &self,
        price: f64,
        atr: Option<f64>,
        bias: LevelBias,
    ) -> ProtectiveLevels {
        let bias_factor = match bias {
            LevelBias::Tighter => 1.0 - self.config.bias_multiplier,
            LevelBias::Neutral => 1.0,
            LevelBias::Looser => 1.0 + self.config.bias_multiplier,
        };
        let (stop_distance, target_distance) = match atr.filter(|a| *a > 0.0) {
            Some(atr) => (
                self.config.stop_atr_multiple * atr,
                self.config.target_atr_multiple * atr,
            ),
            None => {
                let stop = price * self.config.stop_pct_fallback;
                // Keep the fallback risk/reward at the ATR path's ratio.
                let ratio = self.config.target_atr_multiple / self.config.stop_atr_multiple;
                (stop, stop * ratio)
            }
        };
        ProtectiveLevels {
            stop_loss: price - stop_distance * bias_factor,
            take_profit: price + target_distance * bias_factor,
        }
    }

    /// Risk-based quantity, capped at the configured share of balance and
    /// optionally scaled toward a target ATR%.
    pub fn position_size(
        &self,
        balance: f64,
        risk_per_trade: f64,
        price: f64,
        stop_loss: f64,
        atr_pct: Option<f64>,
    ) -> f64 {
        let stop_distance = price - stop_loss;
        if stop_distance <= 0.0 || price <= 0.0 || balance <= 0.0 {
            return 0.0;
        }

        let mut quantity = balance * risk_per_trade / stop_distance;

        if self.config.volatility_targeting {
            if let Some(atr_pct) = atr_pct.filter(|a| *a > 0.0) {
                let scale = (self.config.target_atr_pct / atr_pct)
                    .clamp(self.config.vol_scale_min, self.config.vol_scale_max);
                quantity *= scale;
            }
        }

        let cap = balance * self.config.max_position_pct / price;
        quantity.min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameIndicators, Symbol};
    use approx::assert_relative_eq;

    fn snapshot(adx: Option<f64>, volume_24h: Option<f64>) -> MarketSnapshot {
        let mut snap = MarketSnapshot::new(Symbol::new("BTCUSDT"), 50_000.0);
        snap.volume_24h = volume_24h;
        snap.frames.insert(
            Timeframe::H4,
            FrameIndicators {
                adx,
                ..Default::default()
            },
        );
        snap
    }

    fn validator() -> GuardrailValidator {
        GuardrailValidator::new(GuardrailConfig::default())
    }

    #[test]
    fn test_trend_bias_from_ema_stack() {
        let mut snap = snapshot(Some(30.0), None);
        {
            let frame = snap.frames.get_mut(&Timeframe::H4).unwrap();
            frame.ema20 = Some(50_100.0);
            frame.ema50 = Some(49_500.0);
            frame.ema200 = Some(47_000.0);
        }
        assert_eq!(TrendBias::from_snapshot(&snap), TrendBias::Bullish);

        {
            let frame = snap.frames.get_mut(&Timeframe::H4).unwrap();
            frame.ema20 = Some(46_000.0);
            frame.ema50 = Some(46_500.0);
            frame.ema200 = Some(51_000.0);
        }
        assert_eq!(TrendBias::from_snapshot(&snap), TrendBias::StronglyBearish);

        assert_eq!(
            TrendBias::from_snapshot(&MarketSnapshot::new(Symbol::new("BTCUSDT"), 50_000.0)),
            TrendBias::Neutral
        );
    }

    #[test]
    fn test_strongly_bearish_always_rejected() {
        let snap = snapshot(Some(40.0), Some(5_000_000.0));
        let verdict =
            validator().validate_entry(&snap, TrendBias::StronglyBearish, 0.9, Some(50.0));
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("bearish"));
    }

    #[test]
    fn test_low_adx_relaxed_at_high_confidence() {
        let snap = snapshot(Some(17.0), Some(5_000_000.0));
        let v = validator();
        assert!(!v
            .validate_entry(&snap, TrendBias::Bullish, 0.5, None)
            .allowed);
        // 17 clears the relaxed floor of 15 when confidence >= 0.85.
        assert!(v
            .validate_entry(&snap, TrendBias::Bullish, 0.9, None)
            .allowed);
    }

    #[test]
    fn test_volume_floor_skipped_without_data() {
        let v = validator();
        let thin = snapshot(Some(30.0), Some(100_000.0));
        assert!(!v
            .validate_entry(&thin, TrendBias::Neutral, 0.5, None)
            .allowed);

        let unknown = snapshot(Some(30.0), None);
        assert!(v
            .validate_entry(&unknown, TrendBias::Neutral, 0.5, None)
            .allowed);
    }

    #[test]
    fn test_extreme_fear_rejected() {
        let snap = snapshot(Some(30.0), Some(5_000_000.0));
        let verdict = validator().validate_entry(&snap, TrendBias::Bullish, 0.5, Some(15.0));
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("fear"));
    }

    #[test]
    fn test_levels_from_atr_with_bias() {
        let v = validator();
        let neutral = v.protective_levels(50_000.0, Some(800.0), LevelBias::Neutral);
        assert_relative_eq!(neutral.stop_loss, 50_000.0 - 1_600.0);
        assert_relative_eq!(neutral.take_profit, 50_000.0 + 2_400.0);

        let tighter = v.protective_levels(50_000.0, Some(800.0), LevelBias::Tighter);
        assert_relative_eq!(tighter.stop_loss, 50_000.0 - 1_600.0 * 0.75);

        let looser = v.protective_levels(50_000.0, Some(800.0), LevelBias::Looser);
        assert_relative_eq!(looser.take_profit, 50_000.0 + 2_400.0 * 1.25);
    }

    #[test]
    fn test_levels_percentage_fallback() {
        let levels = validator().protective_levels(50_000.0, None, LevelBias::Neutral);
        assert_relative_eq!(levels.stop_loss, 50_000.0 * 0.95);
        assert_relative_eq!(levels.take_profit, 50_000.0 + 2_500.0 * 1.5);
    }

    #[test]
    fn test_quantity_capped_at_balance_share() {
        let v = validator();
        // Tight stop would size far past the cap without the clamp.
        let qty = v.position_size(100_000.0, 0.02, 50_000.0, 49_900.0, None);
        assert_relative_eq!(qty, 100_000.0 * 0.10 / 50_000.0);
    }

    #[test]
    fn test_volatility_targeting_clamps_scale() {
        let mut config = GuardrailConfig::default();
        config.volatility_targeting = true;
        let v = GuardrailValidator::new(config);

        // Calm market (ATR% 0.5 vs target 2.0) wants 4x; clamped to 1.5x.
        let calm = v.position_size(100_000.0, 0.001, 50_000.0, 48_000.0, Some(0.5));
        let base = 100_000.0 * 0.001 / 2_000.0;
        assert_relative_eq!(calm, base * 1.5);

        // Wild market (ATR% 8.0) wants 0.25x; clamped to 0.5x.
        let wild = v.position_size(100_000.0, 0.001, 50_000.0, 48_000.0, Some(8.0));
        assert_relative_eq!(wild, base * 0.5);
    }
}
