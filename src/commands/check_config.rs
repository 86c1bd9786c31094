//! Validate a configuration file and print a summary

use anyhow::{Context, Result};
use tracing::info;

use position_engine::config::Config;

pub fn run(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Configuration invalid: {config_path}"))?;

    info!("Configuration OK: {}", config_path);
    info!("Symbols: {:?}", config.trading.symbols);
    info!(
        "Allocations: swing {:.2} / momentum {:.2} / scalp {:.2}",
        config.entries.swing.allocation,
        config.entries.momentum.allocation,
        config.entries.scalp.allocation
    );
    info!(
        "Scalp enabled: {}, ledger retry after failure: {}",
        config.entries.scalp.enabled, config.ledger.allow_retry_after_failure
    );
    info!("Ledger path: {}", config.ledger.path);
    Ok(())
}
