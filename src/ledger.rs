//! Idempotent order ledger
//!
//! Maps signal ids to the order they produced so a signal executes at most
//! once. Every mutation is persisted through an atomic write (temp file,
//! flush, rename): a crash leaves either the old or the new complete file,
//! never a torn one. When a write fails the ledger degrades to an in-memory
//! symbol+time-bucket dedup with a short expiry rather than reporting
//! "not duplicate".

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::LedgerConfig;
use crate::types::Money;
use crate::{Side, Symbol};

/// Lifecycle status of a recorded order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Submitted,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

/// One recorded order keyed by its signal id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub signal_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_quantity: Money,
    pub average_price: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an idempotency check
#[derive(Debug, Clone)]
pub struct BlockDecision {
    pub blocked: bool,
    pub reason: String,
}

impl BlockDecision {
    fn allow() -> Self {
        BlockDecision {
            blocked: false,
            reason: String::new(),
        }
    }

    fn block(reason: impl Into<String>) -> Self {
        BlockDecision {
            blocked: true,
            reason: reason.into(),
        }
    }
}

struct Inner {
    entries: HashMap<String, LedgerEntry>,
    /// Bucket-keyed fallback dedup; populated only after a persist failure
    fallback: HashMap<String, DateTime<Utc>>,
    degraded: bool,
}

/// Durable signal-id to order map with an in-memory degraded mode
pub struct OrderLedger {
    path: Option<PathBuf>,
    allow_retry_after_failure: bool,
    retention: Duration,
    fallback_bucket: Duration,
    fallback_expiry: Duration,
    inner: Mutex<Inner>,
}

impl OrderLedger {
    /// Open (or create) the ledger file. An existing file that cannot be
    /// parsed is an error: starting with a blank ledger would silently
    /// drop idempotency guarantees.
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create ledger directory {}", parent.display()))?;
        }

        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read ledger {}", path.display()))?;
            let entries: HashMap<String, LedgerEntry> = serde_json::from_str(&raw)
                .with_context(|| format!("parse ledger {}", path.display()))?;
            info!(entries = entries.len(), path = %path.display(), "ledger loaded");
            entries
        } else {
            HashMap::new()
        };

        Ok(OrderLedger {
            path: Some(path),
            allow_retry_after_failure: config.allow_retry_after_failure,
            retention: Duration::days(config.retention_days),
            fallback_bucket: Duration::minutes(config.fallback_bucket_minutes),
            fallback_expiry: Duration::minutes(config.fallback_expiry_minutes),
            inner: Mutex::new(Inner {
                entries,
                fallback: HashMap::new(),
                degraded: false,
            }),
        })
    }

    /// Ledger without a backing file. Used by paper runs and tests.
    pub fn ephemeral(config: &LedgerConfig) -> Self {
        OrderLedger {
            path: None,
            allow_retry_after_failure: config.allow_retry_after_failure,
            retention: Duration::days(config.retention_days),
            fallback_bucket: Duration::minutes(config.fallback_bucket_minutes),
            fallback_expiry: Duration::minutes(config.fallback_expiry_minutes),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                fallback: HashMap::new(),
                degraded: false,
            }),
        }
    }

    /// Check whether a signal id must be blocked.
    ///
    /// Empty ids are never blocked here; the engine applies the fallback
    /// dedup for those.
    pub fn is_blocked(&self, signal_id: &str) -> BlockDecision {
        if signal_id.is_empty() {
            return BlockDecision::allow();
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get(signal_id) {
            Some(entry) => match entry.status {
                OrderStatus::Submitted | OrderStatus::Filled => BlockDecision::block(format!(
                    "duplicate signal, order already {}",
                    entry.status.as_str()
                )),
                OrderStatus::Canceled | OrderStatus::Rejected => {
                    if self.allow_retry_after_failure {
                        BlockDecision::allow()
                    } else {
                        BlockDecision::block(format!(
                            "previous order {} and retry disabled",
                            entry.status.as_str()
                        ))
                    }
                }
            },
            None => BlockDecision::allow(),
        }
    }

    /// Whether the symbol is blocked by the degraded-mode dedup.
    pub fn is_blocked_fallback(&self, symbol: &Symbol, now: DateTime<Utc>) -> BlockDecision {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.degraded {
            return BlockDecision::allow();
        }
        let expiry = self.fallback_expiry;
        inner.fallback.retain(|_, noted| now - *noted < expiry);
        let key = self.fallback_key(symbol, now);
        if inner.fallback.contains_key(&key) {
            BlockDecision::block("duplicate in degraded dedup window")
        } else {
            BlockDecision::allow()
        }
    }

    /// Record a freshly submitted or filled order.
    pub fn record(
        &self,
        signal_id: &str,
        symbol: Symbol,
        side: Side,
        status: OrderStatus,
        filled_quantity: Money,
        average_price: Money,
    ) -> Result<()> {
        self.record_at(
            signal_id,
            symbol,
            side,
            status,
            filled_quantity,
            average_price,
            Utc::now(),
        )
    }

    pub fn record_at(
        &self,
        signal_id: &str,
        symbol: Symbol,
        side: Side,
        status: OrderStatus,
        filled_quantity: Money,
        average_price: Money,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !signal_id.is_empty() {
            inner.entries.insert(
                signal_id.to_string(),
                LedgerEntry {
                    signal_id: signal_id.to_string(),
                    symbol: symbol.clone(),
                    side,
                    status,
                    filled_quantity,
                    average_price,
                    created_at: now,
                    updated_at: now,
                },
            );
            debug!(signal_id, status = status.as_str(), "ledger record");
        }
        self.persist_or_degrade(&mut inner, &symbol, now);
        Ok(())
    }

    /// Update the status (and optionally fill details) of an entry.
    pub fn update_status(
        &self,
        signal_id: &str,
        status: OrderStatus,
        filled_quantity: Option<Money>,
        average_price: Option<Money>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let symbol = match inner.entries.get_mut(signal_id) {
            Some(entry) => {
                entry.status = status;
                if let Some(qty) = filled_quantity {
                    entry.filled_quantity = qty;
                }
                if let Some(price) = average_price {
                    entry.average_price = price;
                }
                entry.updated_at = now;
                entry.symbol.clone()
            }
            None => {
                warn!(signal_id, "update_status for unknown ledger entry");
                return Ok(());
            }
        };
        self.persist_or_degrade(&mut inner, &symbol, now);
        Ok(())
    }

    /// Drop entries older than the retention window. Returns how many were
    /// removed.
    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - self.retention;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.updated_at >= cutoff);
        let removed = before - inner.entries.len();
        if removed > 0 {
            info!(removed, remaining = inner.entries.len(), "ledger swept");
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    pub fn entry(&self, signal_id: &str) -> Option<LedgerEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(signal_id).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_degraded(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.degraded
    }

    fn fallback_key(&self, symbol: &Symbol, now: DateTime<Utc>) -> String {
        let bucket_secs = self.fallback_bucket.num_seconds().max(1);
        let bucket = now.timestamp() - now.timestamp().rem_euclid(bucket_secs);
        format!("{}_{}", symbol, bucket)
    }

    fn persist_or_degrade(&self, inner: &mut Inner, symbol: &Symbol, now: DateTime<Utc>) {
        if let Err(err) = self.persist(inner) {
            error!(error = %err, "ledger persist failed, degrading to in-memory dedup");
            inner.degraded = true;
            let key = self.fallback_key(symbol, now);
            inner.fallback.insert(key, now);
        } else if inner.degraded {
            info!("ledger persistence recovered");
            inner.degraded = false;
        }
    }

    /// Atomic replace: temp file in the same directory, flush + fsync,
    /// then rename over the live file.
    fn persist(&self, inner: &Inner) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let payload = serde_json::to_string_pretty(&inner.entries).context("encode ledger")?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(payload.as_bytes())
                .with_context(|| format!("write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("sync {}", tmp.display()))?;
        }
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }
}
