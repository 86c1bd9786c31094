//! Position Trading Engine
//!
//! An automated decision engine for crypto position trading: it classifies
//! the market regime per symbol, scores multiple timeframes, selects among
//! three entry setups in strict priority order, walks open positions through
//! a partial-take-profit / trailing-stop lifecycle, and gates every order
//! through an idempotent, crash-safe ledger.

pub mod config;
pub mod engine;
pub mod entry;
pub mod execution;
pub mod guardrail;
pub mod ledger;
pub mod lifecycle;
pub mod regime;
pub mod scoring;
pub mod types;

pub use config::Config;
pub use regime::{Regime, RegimeResult};
pub use types::*;
