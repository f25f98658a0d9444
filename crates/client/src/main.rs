//! # Teapoll Watch Binary
//!
//! Follows the sentiment poll from the command line: totals, the
//! bull/bear split and the recent vote feed, logged on every change.
//! Runs without a wallet, so it never votes.
//!
//! ## Configuration
//!
//! Defaults target the Tea Sepolia deployment. Overrides:
//! - `TEAPOLL_CONFIG`: path to a TOML config file
//! - `TEAPOLL_RPC_URL`: JSON-RPC endpoint
//! - `TEAPOLL_CONTRACT`: poll contract address
//! - `TEAPOLL_LOOKBACK_BLOCKS`: blocks scanned for recent votes at startup
//!
//! ## Flow
//! 1. Load and validate configuration
//! 2. Build the JSON-RPC reader and a watch-only wallet session
//! 3. Start the synchronizer
//! 4. Log snapshots until Ctrl+C

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, Level};

use teapoll_client::{ChainReader, JsonRpcChainReader, SyncOptions, VoteStateSynchronizer, WalletSession};
use teapoll_common::display::{format_timestamp, format_totals, short_address};
use teapoll_common::{Config, Snapshot};

fn build(cfg: &Config) -> anyhow::Result<VoteStateSynchronizer> {
    let reader = JsonRpcChainReader::from_config(cfg)
        .with_context(|| format!("building JSON-RPC reader for {}", cfg.rpc_url))?;
    let reader: Arc<dyn ChainReader> = Arc::new(reader);
    let session = Arc::new(WalletSession::watch_only(cfg.contract(), cfg.chain.clone()));
    Ok(VoteStateSynchronizer::new(reader, session, SyncOptions::from_config(cfg)))
}

fn log_snapshot(snapshot: &Snapshot) {
    info!("totals: {}", format_totals(&snapshot.totals));
    for vote in &snapshot.recent.window {
        info!(
            "  {:<4} {}  {}",
            vote.sentiment,
            short_address(&vote.voter),
            format_timestamp(vote.timestamp)
        );
    }
    if !snapshot.recent.pending.is_empty() {
        info!("  {}/5 new votes collected", snapshot.recent.pending.len());
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!("═══════════════════════════════════════════════════════════════");
    info!("                   Teapoll Sentiment Watch                      ");
    info!("═══════════════════════════════════════════════════════════════");
    info!("Network:   {} ({})", cfg.chain.chain_name, cfg.chain.chain_id_hex());
    info!("RPC:       {}", cfg.rpc_url);
    info!("Contract:  {}", cfg.contract_address);
    if let Some(url) = cfg.contract_explorer_url() {
        info!("Explorer:  {}", url);
    }
    info!("═══════════════════════════════════════════════════════════════");

    let sync = match build(&cfg) {
        Ok(s) => s,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let mut snapshots = sync.subscribe();
    sync.start().await;
    log_snapshot(&sync.snapshot());

    let printer = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            log_snapshot(&snapshot);
        }
    });

    info!("Watching. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested..."),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    sync.shutdown();
    printer.abort();

    let m = sync.metrics();
    info!(
        "polls: {} issued, {} applied, {} stale, {} failed; events: {} received, {} duplicate",
        m.polls_issued, m.polls_applied, m.polls_stale, m.polls_failed, m.events_received, m.events_duplicate
    );
}
