//! Swing (4h) setup: pullback-to-trend entries held for days
//!
//! Valid only in trending regimes. Requires the full bullish EMA stack on 4h,
//! a weekly trend filter when weekly data is present, trend strength via ADX,
//! price pulled back close to the 4h EMA20, and a 1h momentum turn.

use crate::config::SwingConfig;
use crate::regime::{Regime, RegimeResult};
use crate::{MarketSnapshot, Timeframe};

use super::{EntryType, ScoreSet, SetupPlan};

pub fn evaluate(
    snapshot: &MarketSnapshot,
    regime: &RegimeResult,
    scores: &ScoreSet,
    config: &SwingConfig,
) -> Result<SetupPlan, String> {
    if !matches!(regime.regime, Regime::StrongTrend | Regime::WeakTrend) {
        return Err(format!("swing: regime {} not tradable", regime.regime));
    }

    let price = snapshot.price;
    let h4 = snapshot
        .frame(Timeframe::H4)
        .ok_or_else(|| "swing: no 4h frame".to_string())?;

    // Weekly trend filter only applies when both weekly EMAs are present
    if let Some(weekly) = snapshot.frame(Timeframe::W1) {
        if let (Some(ema50), Some(ema200)) = (weekly.ema50, weekly.ema200) {
            if ema50 <= ema200 {
                return Err("swing: weekly EMA50 below EMA200".to_string());
            }
        }
    }

    if !h4.ema_stack_bullish() {
        return Err("swing: 4h EMA stack not bullish".to_string());
    }

    let adx = h4.adx.unwrap_or(0.0);
    if adx < config.min_adx {
        return Err(format!(
            "swing: 4h ADX {:.1} below {:.1}",
            adx, config.min_adx
        ));
    }

    // Pullback-to-trend: price within the configured distance of the 4h EMA20
    let ema20 = h4.ema20.unwrap_or(0.0);
    if ema20 <= 0.0 {
        return Err("swing: 4h EMA20 unavailable".to_string());
    }
    let distance_pct = (price - ema20).abs() / ema20 * 100.0;
    if distance_pct > config.max_pullback_pct {
        return Err(format!(
            "swing: price {:.2}% from 4h EMA20, max {:.2}%",
            distance_pct, config.max_pullback_pct
        ));
    }

    // 1h momentum turn: RSI above 50 or MACD line above its signal
    let h1 = snapshot.frame(Timeframe::H1);
    let rsi_turn = scores.h1.rsi > 50.0;
    let macd_turn = matches!(
        h1.map(|f| (f.macd, f.macd_signal)),
        Some((Some(line), Some(signal))) if line > signal
    );
    if !rsi_turn && !macd_turn {
        return Err("swing: no 1h momentum turn".to_string());
    }

    let atr = h4
        .atr
        .filter(|a| *a > 0.0)
        .ok_or_else(|| "swing: 4h ATR unavailable".to_string())?;

    Ok(SetupPlan {
        entry_type: EntryType::Swing4h,
        stop_loss: price - config.stop_atr_multiple * atr,
        partial_take_profit: Some(price * (1.0 + config.partial_tp_pct / 100.0)),
        final_take_profit: price * (1.0 + config.final_tp_pct / 100.0),
        partial_fraction: config.partial_fraction,
        allocation: config.allocation,
        risk_per_trade: config.risk_per_trade,
        expected_hold: "3-10 days".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::tests_support::{score_set, trending_snapshot};
    use crate::regime::RegimeClassifier;
    use chrono::Duration;

    fn classify(snapshot: &MarketSnapshot) -> RegimeResult {
        RegimeClassifier::new(Duration::hours(1)).classify(snapshot)
    }

    #[test]
    fn test_valid_swing_setup() {
        let snap = trending_snapshot();
        let regime = classify(&snap);
        assert_eq!(regime.regime, Regime::StrongTrend);

        let plan = evaluate(&snap, &regime, &score_set(&snap), &SwingConfig::default())
            .expect("setup should validate");
        assert_eq!(plan.entry_type, EntryType::Swing4h);

        // Stop = price - 2.5 x 4h ATR
        let atr = snap.frame(Timeframe::H4).unwrap().atr.unwrap();
        let expected_stop = snap.price - 2.5 * atr;
        assert!((plan.stop_loss - expected_stop).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_ranging_regime() {
        let snap = trending_snapshot();
        let mut regime = classify(&snap);
        regime.regime = Regime::Ranging;
        let err = evaluate(&snap, &regime, &score_set(&snap), &SwingConfig::default())
            .unwrap_err();
        assert!(err.contains("regime"));
    }

    #[test]
    fn test_rejects_broken_ema_stack() {
        let mut snap = trending_snapshot();
        let regime = classify(&snap);
        snap.frames.get_mut(&Timeframe::H4).unwrap().ema50 = Some(snap.price * 1.05);
        let err = evaluate(&snap, &regime, &score_set(&snap), &SwingConfig::default())
            .unwrap_err();
        assert!(err.contains("EMA stack"));
    }

    #[test]
    fn test_rejects_extended_price() {
        let mut snap = trending_snapshot();
        let regime = classify(&snap);
        // Price 5% above the EMA20 is no longer a pullback
        snap.frames.get_mut(&Timeframe::H4).unwrap().ema20 = Some(snap.price / 1.05);
        snap.frames.get_mut(&Timeframe::H4).unwrap().ema50 = Some(snap.price / 1.06);
        let err = evaluate(&snap, &regime, &score_set(&snap), &SwingConfig::default())
            .unwrap_err();
        assert!(err.contains("EMA20"));
    }

    #[test]
    fn test_weekly_filter_blocks_bear_weekly() {
        let mut snap = trending_snapshot();
        let regime = classify(&snap);
        snap.frames.insert(
            Timeframe::W1,
            crate::FrameIndicators {
                ema50: Some(40_000.0),
                ema200: Some(45_000.0),
                ..Default::default()
            },
        );
        let err = evaluate(&snap, &regime, &score_set(&snap), &SwingConfig::default())
            .unwrap_err();
        assert!(err.contains("weekly"));
    }

    #[test]
    fn test_missing_atr_rejects() {
        let mut snap = trending_snapshot();
        let regime = classify(&snap);
        snap.frames.get_mut(&Timeframe::H4).unwrap().atr = None;
        // Regime was classified before ATR removal; the setup itself must
        // still refuse to compute a stop without ATR.
        let err = evaluate(&snap, &regime, &score_set(&snap), &SwingConfig::default())
            .unwrap_err();
        assert!(err.contains("ATR"));
    }
}
