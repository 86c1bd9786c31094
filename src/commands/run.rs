//! Run the trading engine
//!
//! Two independently scheduled tasks share one engine: the main cycle
//! evaluates entries for every watched symbol at a slow interval, the
//! watchdog evaluates exits at a fast one. A third interval sweeps the
//! ledger daily. Ctrl+C shuts all of them down through a watch channel.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use position_engine::config::Config;
use position_engine::engine::TradingEngine;
use position_engine::execution::{
    ExecutionClient, MarketData, PaperExecutionClient, RestExecutionClient, RestMarketData,
};
use position_engine::ledger::OrderLedger;

const SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

pub fn run(config_path: String, paper: bool, live: bool, interval_secs: Option<u64>) -> Result<()> {
    if !paper && !live {
        anyhow::bail!("Must specify either --paper or --live mode");
    }

    if live {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK");
        warn!("Press Ctrl+C within 5 seconds to abort...");
        std::thread::sleep(Duration::from_secs(5));
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(config_path, live, interval_secs))
}

async fn run_async(config_path: String, live: bool, interval_secs: Option<u64>) -> Result<()> {
    let mut config = Config::from_file(&config_path).context("Failed to load configuration")?;
    if let Some(secs) = interval_secs {
        config.trading.cycle_interval_secs = secs;
    }

    info!("Mode: {} trading", if live { "LIVE" } else { "PAPER" });
    info!("Symbols: {:?}", config.trading.symbols);
    info!("Cycle interval: {}s", config.trading.cycle_interval_secs);
    info!(
        "Watchdog interval: {}s",
        config.trading.watchdog_interval_secs
    );

    // Fail closed: refuse to trade if the ledger cannot be opened.
    let ledger = Arc::new(OrderLedger::open(&config.ledger).context("Failed to open ledger")?);
    info!("Ledger ready: {} entries", ledger.len());

    let execution: Arc<dyn ExecutionClient> = if live {
        Arc::new(RestExecutionClient::new(&config.exchange)?)
    } else {
        Arc::new(PaperExecutionClient::new())
    };
    let market_data: Arc<dyn MarketData> = Arc::new(RestMarketData::new(&config.exchange)?);

    let cycle_secs = config.trading.cycle_interval_secs;
    let watchdog_secs = config.trading.watchdog_interval_secs;
    let engine = Arc::new(TradingEngine::new(config, execution, market_data, ledger));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl+C received - initiating graceful shutdown");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
    });

    // Watchdog task: exits are evaluated independently of the main cycle.
    let watchdog_engine = Arc::clone(&engine);
    let mut watchdog_shutdown = shutdown_rx.clone();
    let watchdog = tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(watchdog_secs.max(1)));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = watchdog_engine.watchdog_tick().await {
                        error!("Watchdog pass failed: {}", e);
                    }
                }
                _ = watchdog_shutdown.changed() => break,
            }
        }
    });

    info!("Entering main trading loop");
    let mut cycle_tick = interval(Duration::from_secs(cycle_secs.max(1)));
    let mut sweep_tick = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    let mut shutdown = shutdown_rx;
    loop {
        tokio::select! {
            _ = cycle_tick.tick() => {
                if let Err(e) = engine.run_cycle().await {
                    error!("Trading cycle failed: {}", e);
                }
            }
            _ = sweep_tick.tick() => {
                match engine.ledger().sweep() {
                    Ok(removed) if removed > 0 => info!("Ledger sweep removed {} entries", removed),
                    Ok(_) => {}
                    Err(e) => error!("Ledger sweep failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Let the watchdog finish its in-flight pass before exiting.
    if let Err(e) = watchdog.await {
        error!("Watchdog task ended abnormally: {}", e);
    }
    let open = engine.open_positions().await;
    if !open.is_empty() {
        warn!(
            "Shutting down with {} open position(s); they will be adopted on restart",
            open.len()
        );
    }
    info!("Shutdown complete");
    Ok(())
}
