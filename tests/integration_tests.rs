//! Integration tests for the position engine
//!
//! These tests drive the public API end to end: classification, entry
//! selection, lifecycle transitions, and the order ledger.

use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::{Duration, TimeZone, Utc};

use position_engine::config::{Config, LedgerConfig};
use position_engine::entry::{Action, EntrySelector, EntryType};
use position_engine::ledger::{OrderLedger, OrderStatus};
use position_engine::lifecycle::{ExitAction, Position};
use position_engine::regime::{Regime, RegimeClassifier};
use position_engine::scoring::TimeframeScorer;
use position_engine::{FrameIndicators, MarketSnapshot, Money, Side, Symbol, Timeframe};

// =============================================================================
// Test Utilities
// =============================================================================

fn selector(config: Config) -> EntrySelector {
    let classifier = Arc::new(RegimeClassifier::new(Duration::hours(1)));
    let scorer = Arc::new(TimeframeScorer::new(Duration::minutes(5)));
    EntrySelector::new(config, classifier, scorer)
}

/// Snapshot with a bullish 4h/1h/15m stack around price 50_000. The 4h
/// regime inputs are parameters so individual tests can steer the regime.
fn snapshot_with_regime(adx_4h: f64, atr_4h: f64, bb_width_pct_4h: f64) -> MarketSnapshot {
    let price = 50_000.0;
    let close = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let half = bb_width_pct_4h / 100.0 * price / 2.0;
    let mut snap = MarketSnapshot::new(Symbol::new("BTCUSDT"), price);

    snap.frames.insert(
        Timeframe::H4,
        FrameIndicators {
            ema20: Some(50_100.0),
            ema50: Some(49_500.0),
            ema200: Some(47_000.0),
            ema50_slope: Some(0.003),
            adx: Some(adx_4h),
            atr: Some(atr_4h),
            rsi: Some(58.0),
            bb_upper: Some(price + half),
            bb_middle: Some(price),
            bb_lower: Some(price - half),
            volume: Some(1_200.0),
            volume_avg: Some(1_000.0),
            highest_high: Some(50_400.0),
            last_close_time: Some(close),
            ..Default::default()
        },
    );
    snap.frames.insert(
        Timeframe::H1,
        FrameIndicators {
            ema20: Some(49_900.0),
            ema50: Some(49_600.0),
            adx: Some(28.0),
            atr: Some(300.0),
            rsi: Some(58.0),
            macd: Some(30.0),
            macd_signal: Some(18.0),
            macd_hist: Some(12.0),
            prev_macd_hist: Some(6.0),
            bb_upper: Some(51_000.0),
            bb_middle: Some(price),
            bb_lower: Some(49_000.0),
            volume: Some(1_500.0),
            volume_avg: Some(1_000.0),
            highest_high: Some(51_500.0),
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
            bb_upper: Some(50_750.0),
            bb_middle: Some(price),
            bb_lower: Some(49_250.0),
            volume: Some(2_500.0),
            volume_avg: Some(1_000.0),
            highest_high: Some(50_100.0),
            last_close_time: Some(close),
            ..Default::default()
        },
    );
    snap
}

// =============================================================================
// Regime scenarios
// =============================================================================

#[test]
fn test_strong_trend_regime_with_confidence() {
    // 4h ADX 35, ATR% 1.6, Bollinger width% 10
    let snap = snapshot_with_regime(35.0, 800.0, 10.0);
    let classifier = RegimeClassifier::new(Duration::hours(1));
    let result = classifier.classify(&snap);
    assert_eq!(result.regime, Regime::StrongTrend);
    assert!(
        result.confidence > 0.7,
        "confidence {} not > 0.7",
        result.confidence
    );
}

#[test]
fn test_ranging_regime_blocks_swing_and_momentum() {
    // 4h ADX 15, ATR% 0.5, Bollinger width% 2.5: ranging, no matter how
    // bullish the rest of the snapshot looks.
    let snap = snapshot_with_regime(15.0, 250.0, 2.5);
    let classifier = RegimeClassifier::new(Duration::hours(1));
    assert_eq!(classifier.classify(&snap).regime, Regime::Ranging);

    let signal = selector(Config::default()).evaluate(&snap, None);
    assert_eq!(signal.action, Action::Hold);
    assert!(signal.entry_type.is_none());
}

// =============================================================================
// Entry selection
// =============================================================================

#[test]
fn test_swing_entry_with_atr_stop() {
    // ADX 30 lands in the weak-trend band, which swing accepts.
    let snap = snapshot_with_regime(30.0, 800.0, 10.0);
    let signal = selector(Config::default()).evaluate(&snap, None);

    assert_eq!(signal.action, Action::Buy);
    assert_eq!(signal.entry_type, Some(EntryType::Swing4h));
    assert_relative_eq!(signal.stop_loss, 50_000.0 - 2.5 * 800.0);
    assert!(signal.quantity > 0.0);
    // The cap: never more than 10% of balance at the entry price.
    assert!(signal.quantity <= 100_000.0 * 0.10 / 50_000.0 + 1e-12);
}

#[test]
fn test_swing_takes_priority_over_momentum() {
    // Both setups validate on this snapshot; strict priority picks swing.
    let snap = snapshot_with_regime(35.0, 800.0, 10.0);
    let signal = selector(Config::default()).evaluate(&snap, None);
    assert_eq!(signal.entry_type, Some(EntryType::Swing4h));
}

#[test]
fn test_scalp_selected_when_enabled_and_others_fail() {
    let mut config = Config::default();
    config.entries.scalp.enabled = true;
    config.entries.swing.allocation = 0.4;
    config.entries.momentum.allocation = 0.4;
    config.entries.scalp.allocation = 0.2;
    config.validate().unwrap();

    let mut snap = snapshot_with_regime(35.0, 800.0, 10.0);
    {
        let h4 = snap.frames.get_mut(&Timeframe::H4).unwrap();
        // No EMA200 kills the swing stack test but leaves EMA20 > EMA50.
        h4.ema200 = None;
    }
    {
        let h1 = snap.frames.get_mut(&Timeframe::H1).unwrap();
        // Overbought RSI kills the momentum band.
        h1.rsi = Some(75.0);
    }

    let signal = selector(config).evaluate(&snap, None);
    assert_eq!(signal.action, Action::Buy);
    assert_eq!(signal.entry_type, Some(EntryType::Scalp15m));
}

#[test]
fn test_scalp_never_selected_when_disabled() {
    let mut snap = snapshot_with_regime(35.0, 800.0, 10.0);
    snap.frames.get_mut(&Timeframe::H4).unwrap().ema200 = None;
    snap.frames.get_mut(&Timeframe::H1).unwrap().rsi = Some(75.0);

    let signal = selector(Config::default()).evaluate(&snap, None);
    assert_eq!(signal.action, Action::Hold);
}

#[test]
fn test_stale_snapshot_blocks_entries() {
    let mut snap = snapshot_with_regime(35.0, 800.0, 10.0);
    snap.generated_at = Utc::now() - Duration::hours(2);

    let signal = selector(Config::default()).evaluate(&snap, None);
    assert_eq!(signal.action, Action::Hold);
    assert!(signal.reason.contains("stale"));
}

// =============================================================================
// Determinism and idempotency
// =============================================================================

#[test]
fn test_signal_id_deterministic_within_candle() {
    let snap = snapshot_with_regime(35.0, 800.0, 10.0);
    let selector = selector(Config::default());

    let first = selector.evaluate(&snap, None);
    let second = selector.evaluate(&snap, None);
    assert_eq!(first.action, Action::Buy);
    assert_eq!(first.signal_id, second.signal_id);
    assert!(first.signal_id.starts_with("BTCUSDT_4h_"));
}

#[test]
fn test_ledger_blocks_second_execution_of_same_signal() {
    let snap = snapshot_with_regime(35.0, 800.0, 10.0);
    let selector = selector(Config::default());
    let ledger = OrderLedger::ephemeral(&LedgerConfig::default());

    let first = selector.evaluate(&snap, None);
    assert!(!ledger.is_blocked(&first.signal_id).blocked);
    ledger
        .record(
            &first.signal_id,
            first.symbol.clone(),
            Side::Buy,
            OrderStatus::Filled,
            Money::from_f64(first.quantity),
            Money::from_f64(first.entry_price),
        )
        .unwrap();

    // Same candle, same id: the second attempt must be blocked.
    let second = selector.evaluate(&snap, None);
    let check = ledger.is_blocked(&second.signal_id);
    assert!(check.blocked);
    assert!(check.reason.contains("filled"));
}

#[test]
fn test_ledger_survives_restart() {
    let dir = std::env::temp_dir().join("position_engine_it_ledger");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let config = LedgerConfig {
        path: dir.join("ledger.json").to_string_lossy().into_owned(),
        ..Default::default()
    };

    {
        let ledger = OrderLedger::open(&config).unwrap();
        ledger
            .record(
                "BTCUSDT_4h_1717243200",
                Symbol::new("BTCUSDT"),
                Side::Buy,
                OrderStatus::Submitted,
                Money::from_f64(0.1),
                Money::from_f64(50_000.0),
            )
            .unwrap();
    }

    let reopened = OrderLedger::open(&config).unwrap();
    assert!(reopened.is_blocked("BTCUSDT_4h_1717243200").blocked);
}

// =============================================================================
// Lifecycle
// =============================================================================

fn open_swing_position() -> Position {
    let snap = snapshot_with_regime(35.0, 800.0, 10.0);
    let config = Config::default();
    let sel = selector(config.clone());
    let signal = sel.evaluate(&snap, None);
    assert_eq!(signal.action, Action::Buy);
    let mut position = Position::from_signal(&signal, &config.entries);
    position.quantity = 0.1;
    position
}

#[test]
fn test_partial_exit_fires_once_and_halves_quantity() {
    let snap = snapshot_with_regime(35.0, 800.0, 10.0);
    let mut position = open_swing_position();
    assert!(!position.partial_done);

    // +5% hits the partial target.
    let decision = position.update_exit(52_500.0, &snap);
    assert_eq!(decision.action, ExitAction::SellPartial);
    assert_relative_eq!(decision.quantity, 0.05);
    assert_relative_eq!(position.quantity, 0.05);
    assert!(position.partial_done);

    // Second pass at the same price must not fire the partial again.
    let again = position.update_exit(52_500.0, &snap);
    assert_ne!(again.action, ExitAction::SellPartial);
}

#[test]
fn test_trailing_stop_never_decreases() {
    let snap = snapshot_with_regime(35.0, 800.0, 10.0);
    let mut position = open_swing_position();
    position.update_exit(52_500.0, &snap);

    let mut last_stop = position.current_sl;
    for price in [52_600.0, 53_200.0, 53_800.0, 54_500.0, 54_400.0, 55_000.0] {
        let decision = position.update_exit(price, &snap);
        assert!(
            position.current_sl >= last_stop,
            "stop decreased at price {price}"
        );
        if decision.action == ExitAction::Sell {
            break;
        }
        last_stop = position.current_sl;
    }
}

// =============================================================================
// Configuration invariants
// =============================================================================

#[test]
fn test_allocations_must_sum_to_one() {
    let mut config = Config::default();
    assert!(config.validate().is_ok());

    config.entries.swing.allocation = 0.6;
    config.entries.momentum.allocation = 0.5;
    assert!(config.validate().is_err());

    // Within the +/- 0.01 tolerance.
    config.entries.swing.allocation = 0.504;
    config.entries.momentum.allocation = 0.5;
    assert!(config.validate().is_ok());
}

#[test]
fn test_scalp_reallocation_validates() {
    let mut config = Config::default();
    config.entries.scalp.enabled = true;
    config.entries.swing.allocation = 0.4;
    config.entries.momentum.allocation = 0.4;
    config.entries.scalp.allocation = 0.2;
    assert!(config.validate().is_ok());
}
