//! Trading engine
//!
//! Owns the open-position map and wires the classifier, scorer, selector,
//! ledger, and execution client together. Two tasks drive it: the main
//! evaluation cycle (entries) and the watchdog (exits). Both go through the
//! same tokio mutex around the position map, so a partial-fill mutation from
//! the watchdog can never race an insertion from the main cycle.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::entry::{EntrySelector, EntrySignal, SignalIdSource};
use crate::execution::{submit_with_retry, ExecutionClient, ExecutionError, MarketData};
use crate::guardrail::{GuardrailValidator, TrendBias};
use crate::ledger::{OrderLedger, OrderStatus};
use crate::lifecycle::{ExitAction, Position};
use crate::regime::RegimeClassifier;
use crate::scoring::TimeframeScorer;
use crate::types::Money;
use crate::{MarketSnapshot, Side, Symbol};

/// What one main-cycle pass did
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub evaluated: usize,
    pub entered: usize,
    pub held: usize,
    pub blocked: usize,
    pub failed: usize,
}

/// What one watchdog pass did
#[derive(Debug, Default, Clone, Copy)]
pub struct WatchdogReport {
    pub checked: usize,
    pub exits: usize,
    pub partials: usize,
    pub trailing_updates: usize,
    pub failures: usize,
}

pub struct TradingEngine {
    config: Config,
    selector: EntrySelector,
    guardrail: GuardrailValidator,
    ledger: Arc<OrderLedger>,
    execution: Arc<dyn ExecutionClient>,
    market_data: Arc<dyn MarketData>,
    positions: Mutex<HashMap<Symbol, Position>>,
}

impl TradingEngine {
    pub fn new(
        config: Config,
        execution: Arc<dyn ExecutionClient>,
        market_data: Arc<dyn MarketData>,
        ledger: Arc<OrderLedger>,
    ) -> Self {
        let classifier = Arc::new(RegimeClassifier::new(chrono::Duration::seconds(
            config.caches.regime_ttl_secs as i64,
        )));
        let scorer = Arc::new(TimeframeScorer::new(chrono::Duration::seconds(
            config.caches.score_ttl_secs as i64,
        )));
        let selector = EntrySelector::new(config.clone(), classifier, scorer);
        let guardrail = GuardrailValidator::new(config.guardrail.clone());
        TradingEngine {
            config,
            selector,
            guardrail,
            ledger,
            execution,
            market_data,
            positions: Mutex::new(HashMap::new()),
        }
    }

    /// Restore a position carried over from a previous run.
    pub async fn adopt_position(&self, position: Position) {
        let mut positions = self.positions.lock().await;
        positions.insert(position.symbol.clone(), position);
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        let positions = self.positions.lock().await;
        positions.values().cloned().collect()
    }

    /// One pass over all watched symbols: fetch snapshots concurrently,
    /// then evaluate and (maybe) enter sequentially.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let mut fetches = JoinSet::new();
        for raw in &self.config.trading.symbols {
            let symbol = Symbol::new(raw);
            let market_data = Arc::clone(&self.market_data);
            fetches.spawn(async move {
                let snapshot = market_data.snapshot(&symbol).await;
                (symbol, snapshot)
            });
        }

        let mut snapshots = Vec::new();
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok((_, Ok(snapshot))) => snapshots.push(snapshot),
                Ok((symbol, Err(err))) => {
                    warn!(%symbol, error = %err, "snapshot fetch failed, skipping symbol");
                    report.failed += 1;
                }
                Err(err) => {
                    error!(error = %err, "snapshot task panicked");
                    report.failed += 1;
                }
            }
        }

        for snapshot in snapshots {
            report.evaluated += 1;
            if let Err(err) = snapshot.validate() {
                warn!(symbol = %snapshot.symbol, error = %err, "invalid snapshot");
                report.failed += 1;
                continue;
            }
            let signal = self.selector.evaluate(&snapshot, None);
            self.process_signal(signal, &snapshot, &mut report).await;
        }

        info!(
            evaluated = report.evaluated,
            entered = report.entered,
            held = report.held,
            blocked = report.blocked,
            failed = report.failed,
            "cycle complete"
        );
        Ok(report)
    }

    async fn process_signal(
        &self,
        signal: EntrySignal,
        snapshot: &MarketSnapshot,
        report: &mut CycleReport,
    ) {
        if !signal.is_buy() {
            debug!(symbol = %signal.symbol, reason = %signal.reason, "hold");
            report.held += 1;
            return;
        }
        if signal.id_source == SignalIdSource::WallClock {
            warn!(
                symbol = %signal.symbol,
                signal_id = %signal.signal_id,
                "signal id derived from wall clock, determinism degraded"
            );
        }

        // Last-line veto, independent of the selector's own gates.
        let trend = TrendBias::from_snapshot(snapshot);
        let verdict = self
            .guardrail
            .validate_entry(snapshot, trend, signal.confidence, None);
        if !verdict.allowed {
            info!(symbol = %signal.symbol, reason = %verdict.reason, "entry vetoed");
            report.held += 1;
            return;
        }

        // Held across the execution await so the watchdog cannot interleave.
        let mut positions = self.positions.lock().await;
        if positions.contains_key(&signal.symbol) {
            debug!(symbol = %signal.symbol, "position already open");
            report.held += 1;
            return;
        }

        let check = self.ledger.is_blocked(&signal.signal_id);
        if check.blocked {
            info!(
                symbol = %signal.symbol,
                signal_id = %signal.signal_id,
                reason = %check.reason,
                "entry blocked by ledger"
            );
            report.blocked += 1;
            return;
        }
        if signal.signal_id.is_empty() || self.ledger.is_degraded() {
            let fallback = self.ledger.is_blocked_fallback(&signal.symbol, Utc::now());
            if fallback.blocked {
                info!(symbol = %signal.symbol, reason = %fallback.reason, "entry blocked by fallback dedup");
                report.blocked += 1;
                return;
            }
        }

        match submit_with_retry(
            self.execution.as_ref(),
            &signal.symbol,
            Side::Buy,
            signal.quantity,
            signal.entry_price,
            self.config.exchange.max_order_attempts,
        )
        .await
        {
            Ok(fill) => {
                if let Err(err) = self.ledger.record(
                    &signal.signal_id,
                    signal.symbol.clone(),
                    Side::Buy,
                    OrderStatus::Filled,
                    fill.quantity,
                    fill.average_price,
                ) {
                    warn!(error = %err, "ledger record failed");
                }
                let mut position = Position::from_signal(&signal, self.selector.entries());
                position.quantity = fill.quantity.to_f64();
                let avg = fill.average_price.to_f64();
                if avg > 0.0 {
                    position.entry_price = avg;
                    position.highest_close = avg;
                }
                info!(
                    symbol = %signal.symbol,
                    entry_type = ?signal.entry_type,
                    quantity = position.quantity,
                    price = position.entry_price,
                    stop = position.current_sl,
                    "position opened"
                );
                positions.insert(signal.symbol.clone(), position);
                report.entered += 1;
            }
            Err(ExecutionError::Rejected(reason)) => {
                warn!(symbol = %signal.symbol, %reason, "entry order rejected");
                let _ = self.ledger.record(
                    &signal.signal_id,
                    signal.symbol.clone(),
                    Side::Buy,
                    OrderStatus::Rejected,
                    Money::ZERO,
                    Money::ZERO,
                );
                report.failed += 1;
            }
            Err(err) => {
                // Alert-worthy: retries exhausted, entry abandoned.
                error!(symbol = %signal.symbol, error = %err, "entry order failed terminally");
                let _ = self.ledger.record(
                    &signal.signal_id,
                    signal.symbol.clone(),
                    Side::Buy,
                    OrderStatus::Canceled,
                    Money::ZERO,
                    Money::ZERO,
                );
                report.failed += 1;
            }
        }
    }

    /// One watchdog pass: run the lifecycle state machine over every open
    /// position. Exit evaluation proceeds even for stale snapshots.
    pub async fn watchdog_tick(&self) -> Result<WatchdogReport> {
        let mut report = WatchdogReport::default();

        let symbols: Vec<Symbol> = {
            let positions = self.positions.lock().await;
            positions.keys().cloned().collect()
        };
        if symbols.is_empty() {
            return Ok(report);
        }

        let mut snapshots: HashMap<Symbol, MarketSnapshot> = HashMap::new();
        for symbol in &symbols {
            match self.market_data.snapshot(symbol).await {
                Ok(snapshot) => {
                    snapshots.insert(symbol.clone(), snapshot);
                }
                Err(err) => {
                    warn!(%symbol, error = %err, "watchdog snapshot fetch failed");
                    report.failures += 1;
                }
            }
        }

        // Single guard for the whole pass; entries wait until it finishes.
        let mut positions = self.positions.lock().await;
        for symbol in symbols {
            let snapshot = match snapshots.get(&symbol) {
                Some(s) => s,
                None => continue,
            };
            let original = match positions.get(&symbol) {
                Some(p) => p.clone(),
                None => continue,
            };
            report.checked += 1;

            let mut updated = original.clone();
            let decision = updated.update_exit(snapshot.price, snapshot);

            match decision.action {
                ExitAction::Hold => {
                    positions.insert(symbol, updated);
                }
                ExitAction::TrailingUpdate => {
                    info!(
                        %symbol,
                        new_stop = decision.new_stop.unwrap_or(updated.current_sl),
                        "trailing stop raised"
                    );
                    report.trailing_updates += 1;
                    positions.insert(symbol, updated);
                }
                ExitAction::SellPartial | ExitAction::Sell => {
                    let terminal = decision.action == ExitAction::Sell;
                    match submit_with_retry(
                        self.execution.as_ref(),
                        &symbol,
                        Side::Sell,
                        decision.quantity,
                        snapshot.price,
                        self.config.exchange.max_order_attempts,
                    )
                    .await
                    {
                        Ok(fill) => {
                            info!(
                                %symbol,
                                reason = %decision.reason,
                                quantity = fill.quantity.to_f64(),
                                price = fill.average_price.to_f64(),
                                terminal,
                                "exit order filled"
                            );
                            if terminal {
                                info!(
                                    %symbol,
                                    entry_price = original.entry_price,
                                    exit_price = snapshot.price,
                                    pnl_pct = original.unrealized_pnl_pct(snapshot.price),
                                    reason = %decision.reason,
                                    "position closed"
                                );
                                positions.remove(&symbol);
                                report.exits += 1;
                            } else {
                                updated.failed_exit = None;
                                positions.insert(symbol, updated);
                                report.partials += 1;
                            }
                        }
                        Err(err) => {
                            // Recoverable flag, never a silent finalize: the
                            // pre-decision state goes back into the map.
                            error!(
                                %symbol,
                                reason = %decision.reason,
                                error = %err,
                                "exit order failed, position flagged for retry"
                            );
                            let mut reverted = original;
                            reverted.failed_exit = Some(decision.reason.clone());
                            positions.insert(symbol, reverted);
                            report.failures += 1;
                        }
                    }
                }
            }
        }

        if report.exits + report.partials + report.trailing_updates + report.failures > 0 {
            info!(
                checked = report.checked,
                exits = report.exits,
                partials = report.partials,
                trailing_updates = report.trailing_updates,
                failures = report.failures,
                "watchdog pass complete"
            );
        }
        Ok(report)
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }
}
