//! Position lifecycle state machine
//!
//! Walks an open position through `OPEN_NO_PARTIAL -> OPEN_TRAILING ->
//! CLOSED`. Every evaluation checks, in order: hard stop, partial
//! take-profit, chandelier trailing stop, final target, time exit. Legacy
//! positions without entry-type metadata degrade to plain stop/target
//! checks.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EntriesConfig;
use crate::entry::{EntrySignal, EntryType};
use crate::{MarketSnapshot, Symbol};

/// What the caller should do with the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitAction {
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "SELL_PARTIAL")]
    SellPartial,
    #[serde(rename = "TRAILING_UPDATE")]
    TrailingUpdate,
}

/// Outcome of one lifecycle evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDecision {
    pub action: ExitAction,
    pub reason: String,
    /// Quantity to sell; zero for HOLD and TRAILING_UPDATE
    pub quantity: f64,
    /// Raised stop level, set only for TRAILING_UPDATE
    pub new_stop: Option<f64>,
}

impl ExitDecision {
    fn hold() -> Self {
        ExitDecision {
            action: ExitAction::Hold,
            reason: String::new(),
            quantity: 0.0,
            new_stop: None,
        }
    }

    fn sell(reason: impl Into<String>, quantity: f64) -> Self {
        ExitDecision {
            action: ExitAction::Sell,
            reason: reason.into(),
            quantity,
            new_stop: None,
        }
    }

    fn sell_partial(quantity: f64) -> Self {
        ExitDecision {
            action: ExitAction::SellPartial,
            reason: "partial take profit".to_string(),
            quantity,
            new_stop: None,
        }
    }

    fn trailing_update(new_stop: f64) -> Self {
        ExitDecision {
            action: ExitAction::TrailingUpdate,
            reason: "trailing stop raised".to_string(),
            quantity: 0.0,
            new_stop: Some(new_stop),
        }
    }

    pub fn is_terminal_sell(&self) -> bool {
        self.action == ExitAction::Sell
    }
}

/// Lifecycle phase derived from the position's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    OpenNoPartial,
    OpenTrailing,
}

/// An open long position tracked by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// None marks a legacy position managed by plain stop/target only
    pub entry_type: Option<EntryType>,
    pub signal_id: Option<String>,
    pub entry_price: f64,
    pub quantity: f64,
    /// Stop at entry time; never moves, so `current_sl >= initial_sl` can be
    /// audited on adopted positions. Defaults to 0 for records that predate it.
    #[serde(default)]
    pub initial_sl: f64,
    pub current_sl: f64,
    pub partial_take_profit: Option<f64>,
    pub final_take_profit: Option<f64>,
    pub partial_fraction: f64,
    pub partial_done: bool,
    pub highest_close: f64,
    pub trail_atr_multiple: f64,
    pub max_hold_hours: Option<i64>,
    pub opened_at: DateTime<Utc>,
    /// Set when a sell failed after retries; cleared once the exit lands
    pub failed_exit: Option<String>,
}

impl Position {
    /// Build a managed position from a filled BUY signal.
    pub fn from_signal(signal: &EntrySignal, entries: &EntriesConfig) -> Self {
        let entry_type = signal.entry_type;
        let (trail, hold_hours) = match entry_type {
            Some(EntryType::Swing4h) => (
                entries.swing.trail_atr_multiple,
                entries.swing.max_hold_hours,
            ),
            Some(EntryType::Momentum1h) => (
                entries.momentum.trail_atr_multiple,
                entries.momentum.max_hold_hours,
            ),
            Some(EntryType::Scalp15m) => (
                entries.scalp.trail_atr_multiple,
                entries.scalp.max_hold_hours,
            ),
            None => (0.0, 0),
        };
        Position {
            symbol: signal.symbol.clone(),
            entry_type,
            signal_id: Some(signal.signal_id.clone()),
            entry_price: signal.entry_price,
            quantity: signal.quantity,
            initial_sl: signal.stop_loss,
            current_sl: signal.stop_loss,
            partial_take_profit: signal.partial_take_profit,
            final_take_profit: Some(signal.final_take_profit),
            partial_fraction: signal.partial_fraction,
            partial_done: false,
            highest_close: signal.entry_price,
            trail_atr_multiple: trail,
            max_hold_hours: entry_type.map(|_| hold_hours),
            opened_at: signal.evaluated_at,
            failed_exit: None,
        }
    }

    /// Legacy position with a single stop and single target.
    pub fn legacy(
        symbol: Symbol,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Self {
        Position {
            symbol,
            entry_type: None,
            signal_id: None,
            entry_price,
            quantity,
            initial_sl: stop_loss,
            current_sl: stop_loss,
            partial_take_profit: None,
            final_take_profit: Some(take_profit),
            partial_fraction: 0.0,
            partial_done: false,
            highest_close: entry_price,
            trail_atr_multiple: 0.0,
            max_hold_hours: None,
            opened_at: Utc::now(),
            failed_exit: None,
        }
    }

    pub fn state(&self) -> PositionState {
        if self.partial_done {
            PositionState::OpenTrailing
        } else {
            PositionState::OpenNoPartial
        }
    }

    pub fn unrealized_pnl_pct(&self, current_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (current_price - self.entry_price) / self.entry_price * 100.0
    }

    /// Evaluate the exit rules against the latest price.
    pub fn update_exit(&mut self, current_price: f64, snapshot: &MarketSnapshot) -> ExitDecision {
        self.update_exit_at(current_price, snapshot, Utc::now())
    }

    pub fn update_exit_at(
        &mut self,
        current_price: f64,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> ExitDecision {
        // Hard stop beats everything, managed or legacy.
        if current_price <= self.current_sl {
            info!(
                symbol = %self.symbol,
                price = current_price,
                stop = self.current_sl,
                "stop loss hit"
            );
            return ExitDecision::sell("stop loss", self.quantity);
        }

        let entry_type = match self.entry_type {
            Some(et) => et,
            // Legacy degrade: stop and plain target only.
            None => {
                if let Some(tp) = self.final_take_profit {
                    if current_price >= tp {
                        return ExitDecision::sell("final target", self.quantity);
                    }
                }
                return ExitDecision::hold();
            }
        };

        // Partial take-profit fires at most once per position.
        if !self.partial_done {
            if let Some(partial_tp) = self.partial_take_profit {
                if current_price >= partial_tp {
                    let sell_qty = self.quantity * self.partial_fraction;
                    self.quantity -= sell_qty;
                    self.partial_done = true;
                    self.highest_close = self.highest_close.max(current_price);
                    info!(
                        symbol = %self.symbol,
                        quantity = sell_qty,
                        remaining = self.quantity,
                        "partial take profit"
                    );
                    return ExitDecision::sell_partial(sell_qty);
                }
            }
        } else {
            // Trailing active: ratchet the chandelier stop, never lower it.
            self.highest_close = self.highest_close.max(current_price);
            let atr = snapshot
                .frame(entry_type.trigger_timeframe())
                .and_then(|f| f.atr)
                .filter(|a| *a > 0.0);
            if let Some(atr) = atr {
                let candidate = self.highest_close - self.trail_atr_multiple * atr;
                let raised = candidate > self.current_sl;
                if raised {
                    self.current_sl = candidate;
                }
                if current_price <= self.current_sl {
                    return ExitDecision::sell("trailing stop", self.quantity);
                }
                if raised {
                    return ExitDecision::trailing_update(self.current_sl);
                }
            }
            // Missing ATR leaves the stop where it is.
        }

        if let Some(tp) = self.final_take_profit {
            if current_price >= tp {
                return ExitDecision::sell("final target", self.quantity);
            }
        }

        if let Some(hours) = self.max_hold_hours {
            let elapsed = now - self.opened_at;
            if elapsed >= Duration::hours(hours) && current_price >= self.entry_price {
                return ExitDecision::sell("time exit", self.quantity);
            }
        }

        ExitDecision::hold()
    }
}
