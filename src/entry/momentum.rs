//! Momentum (1h) setup: breakout continuation held for hours
//!
//! Valid in trending and volatile regimes. Requires 4h trend agreement, a 1h
//! RSI in the momentum band with an expanding MACD histogram and confirmed
//! volume, and a 15m close at its recent high (breakout confirmation).

use crate::config::MomentumConfig;
use crate::regime::{Regime, RegimeResult};
use crate::{MarketSnapshot, Timeframe};

use super::{EntryType, ScoreSet, SetupPlan};

pub fn evaluate(
    snapshot: &MarketSnapshot,
    regime: &RegimeResult,
    scores: &ScoreSet,
    config: &MomentumConfig,
) -> Result<SetupPlan, String> {
    if !matches!(
        regime.regime,
        Regime::StrongTrend | Regime::WeakTrend | Regime::Volatile
    ) {
        return Err(format!("momentum: regime {} not tradable", regime.regime));
    }

    let price = snapshot.price;
    let h4 = snapshot
        .frame(Timeframe::H4)
        .ok_or_else(|| "momentum: no 4h frame".to_string())?;
    let h1 = snapshot
        .frame(Timeframe::H1)
        .ok_or_else(|| "momentum: no 1h frame".to_string())?;

    if !matches!((h4.ema20, h4.ema50), (Some(f), Some(m)) if f > m) {
        return Err("momentum: 4h EMA20 not above EMA50".to_string());
    }

    let rsi = scores.h1.rsi;
    if rsi < config.rsi_low || rsi > config.rsi_high {
        return Err(format!(
            "momentum: 1h RSI {:.1} outside [{:.0}, {:.0}]",
            rsi, config.rsi_low, config.rsi_high
        ));
    }

    // Histogram must be expanding, not merely positive
    match (h1.macd_hist, h1.prev_macd_hist) {
        (Some(current), Some(previous)) if current > previous => {}
        _ => return Err("momentum: 1h MACD histogram not expanding".to_string()),
    }

    let volume_ratio = h1.volume_ratio();
    if volume_ratio < config.min_volume_ratio {
        return Err(format!(
            "momentum: 1h volume ratio {:.2} below {:.2}",
            volume_ratio, config.min_volume_ratio
        ));
    }

    // Breakout confirmation on 15m
    let recent_high = snapshot
        .frame(Timeframe::M15)
        .and_then(|f| f.highest_high)
        .filter(|h| *h > 0.0)
        .ok_or_else(|| "momentum: 15m recent high unavailable".to_string())?;
    if price < config.breakout_fraction * recent_high {
        return Err(format!(
            "momentum: price {:.2} below {:.1}% of 15m high {:.2}",
            price,
            config.breakout_fraction * 100.0,
            recent_high
        ));
    }

    let atr = h1
        .atr
        .filter(|a| *a > 0.0)
        .ok_or_else(|| "momentum: 1h ATR unavailable".to_string())?;

    Ok(SetupPlan {
        entry_type: EntryType::Momentum1h,
        stop_loss: price - config.stop_atr_multiple * atr,
        partial_take_profit: Some(price * (1.0 + config.partial_tp_pct / 100.0)),
        final_take_profit: price * (1.0 + config.final_tp_pct / 100.0),
        partial_fraction: config.partial_fraction,
        allocation: config.allocation,
        risk_per_trade: config.risk_per_trade,
        expected_hold: "4-24 hours".to_string(),
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
    fn test_valid_momentum_setup() {
        let snap = trending_snapshot();
        let regime = classify(&snap);
        let plan = evaluate(&snap, &regime, &score_set(&snap), &MomentumConfig::default())
            .expect("setup should validate");
        assert_eq!(plan.entry_type, EntryType::Momentum1h);

        let atr = snap.frame(Timeframe::H1).unwrap().atr.unwrap();
        assert!((plan.stop_loss - (snap.price - 1.8 * atr)).abs() < 1e-9);
        assert_eq!(plan.partial_fraction, 0.5);
    }

    #[test]
    fn test_volatile_regime_allowed() {
        let snap = trending_snapshot();
        let mut regime = classify(&snap);
        regime.regime = Regime::Volatile;
        assert!(evaluate(&snap, &regime, &score_set(&snap), &MomentumConfig::default()).is_ok());
    }

    #[test]
    fn test_rsi_band_enforced() {
        let mut snap = trending_snapshot();
        let regime = classify(&snap);
        snap.frames.get_mut(&Timeframe::H1).unwrap().rsi = Some(75.0);
        let err = evaluate(&snap, &regime, &score_set(&snap), &MomentumConfig::default())
            .unwrap_err();
        assert!(err.contains("RSI"));
    }

    #[test]
    fn test_contracting_histogram_rejected() {
        let mut snap = trending_snapshot();
        let regime = classify(&snap);
        let h1 = snap.frames.get_mut(&Timeframe::H1).unwrap();
        h1.macd_hist = Some(2.0);
        h1.prev_macd_hist = Some(5.0);
        let err = evaluate(&snap, &regime, &score_set(&snap), &MomentumConfig::default())
            .unwrap_err();
        assert!(err.contains("histogram"));
    }

    #[test]
    fn test_breakout_required() {
        let mut snap = trending_snapshot();
        let regime = classify(&snap);
        // Recent 15m high well above price: no breakout
        snap.frames.get_mut(&Timeframe::M15).unwrap().highest_high =
            Some(snap.price * 1.05);
        let err = evaluate(&snap, &regime, &score_set(&snap), &MomentumConfig::default())
            .unwrap_err();
        assert!(err.contains("15m high"));
    }

    #[test]
    fn test_thin_volume_rejected() {
        let mut snap = trending_snapshot();
        let regime = classify(&snap);
        snap.frames.get_mut(&Timeframe::H1).unwrap().volume = Some(900.0);
        let err = evaluate(&snap, &regime, &score_set(&snap), &MomentumConfig::default())
            .unwrap_err();
        assert!(err.contains("volume"));
    }
}
