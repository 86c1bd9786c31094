//! One-off ledger retention sweep

use anyhow::{Context, Result};
use tracing::info;

use position_engine::config::Config;
use position_engine::ledger::OrderLedger;

pub fn run(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path).context("Failed to load configuration")?;
    let ledger = OrderLedger::open(&config.ledger).context("Failed to open ledger")?;

    let removed = ledger.sweep()?;
    info!(
        "Sweep complete: {} removed, {} remaining (retention {} days)",
        removed,
        ledger.len(),
        config.ledger.retention_days
    );
    Ok(())
}
