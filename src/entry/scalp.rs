//! Scalp (15m) setup: squeeze breakouts held for minutes to hours
//!
//! Disabled by default; only valid in a strong trend with both higher
//! timeframes agreeing, a 15m volatility squeeze, heavy volume, and clear
//! room to the nearest 1h resistance. Optionally restricted to configured
//! liquidity hours.

use chrono::{DateTime, Timelike, Utc};

use crate::config::ScalpConfig;
use crate::regime::{Regime, RegimeResult};
use crate::{MarketSnapshot, Timeframe};

use super::{EntryType, ScoreSet, SetupPlan};

pub fn evaluate(
    snapshot: &MarketSnapshot,
    regime: &RegimeResult,
    scores: &ScoreSet,
    config: &ScalpConfig,
    now: DateTime<Utc>,
) -> Result<SetupPlan, String> {
    if !config.enabled {
        return Err("scalp: disabled".to_string());
    }

    if regime.regime != Regime::StrongTrend {
        return Err(format!("scalp: regime {} not tradable", regime.regime));
    }

    if let Some((start, end)) = config.liquidity_hours {
        let hour = now.hour();
        let in_window = if start <= end {
            (start..end).contains(&hour)
        } else {
            // Window wrapping midnight
            hour >= start || hour < end
        };
        if !in_window {
            return Err(format!(
                "scalp: hour {hour} outside liquidity window {start}-{end} UTC"
            ));
        }
    }

    let price = snapshot.price;
    let h4 = snapshot
        .frame(Timeframe::H4)
        .ok_or_else(|| "scalp: no 4h frame".to_string())?;
    let h1 = snapshot
        .frame(Timeframe::H1)
        .ok_or_else(|| "scalp: no 1h frame".to_string())?;
    let m15 = snapshot
        .frame(Timeframe::M15)
        .ok_or_else(|| "scalp: no 15m frame".to_string())?;

    let h4_bull = matches!((h4.ema20, h4.ema50), (Some(f), Some(m)) if f > m);
    let h1_bull = matches!((h1.ema20, h1.ema50), (Some(f), Some(m)) if f > m);
    if !h4_bull || !h1_bull {
        return Err("scalp: 4h and 1h EMA20/EMA50 not both bullish".to_string());
    }

    let width = m15.bollinger_width_pct();
    if width <= 0.0 || width >= config.max_bb_width_pct {
        return Err(format!(
            "scalp: 15m Bollinger width {:.2}% not a squeeze (max {:.2}%)",
            width, config.max_bb_width_pct
        ));
    }

    let volume_ratio = m15.volume_ratio();
    if volume_ratio < config.min_volume_ratio {
        return Err(format!(
            "scalp: 15m volume ratio {:.2} below {:.2}",
            volume_ratio, config.min_volume_ratio
        ));
    }

    let adx = m15.adx.unwrap_or(0.0);
    if adx < config.min_adx {
        return Err(format!(
            "scalp: 15m ADX {:.1} below {:.1}",
            adx, config.min_adx
        ));
    }

    // Need room to run before the nearest 1h resistance
    if let Some(resistance) = scores.h1.resistance {
        let distance_pct = (resistance - price) / price * 100.0;
        if distance_pct <= config.min_resistance_distance_pct {
            return Err(format!(
                "scalp: 1h resistance {:.2} only {:.2}% away",
                resistance, distance_pct
            ));
        }
    }

    let atr = m15
        .atr
        .filter(|a| *a > 0.0)
        .ok_or_else(|| "scalp: 15m ATR unavailable".to_string())?;

    Ok(SetupPlan {
        entry_type: EntryType::Scalp15m,
        stop_loss: price - config.stop_atr_multiple * atr,
        // Scalps take the whole position off at the single target
        partial_take_profit: None,
        final_take_profit: price * (1.0 + config.target_pct / 100.0),
        partial_fraction: 0.0,
        allocation: config.allocation,
        risk_per_trade: config.risk_per_trade,
        expected_hold: "15 minutes - 4 hours".to_string(),
    })
}
