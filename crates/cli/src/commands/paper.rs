//! Paper session command.
//!
//! Wires a trader to the paper venue, a scripted decision source and a
//! JSON-lines decision store, then runs a fixed number of cycles or, with
//! `--follow`, runs the trader actor until Ctrl-C.

use crate::scripted::ScriptedDecisions;
use crate::store::JsonlStore;
use anyhow::{Context, Result};
use autotrader_core::{ConfigLoader, MarketDataProvider, TraderConfig};
use autotrader_engine::{Collaborators, Trader, TraderActor, TraderState, TraderStatus};
use autotrader_paper::{PaperExchange, PaperMarketData};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the paper command.
#[derive(Args, Debug, Clone)]
pub struct PaperArgs {
    /// Trader configuration (TOML), merged with `AUTOTRADER_*` env vars
    #[arg(short, long, default_value = "config/Trader.toml")]
    pub config: PathBuf,

    /// JSON array of decision batches, one batch per cycle
    #[arg(long)]
    pub decisions: PathBuf,

    /// JSON array of market data snapshots, one per symbol
    #[arg(long)]
    pub market: PathBuf,

    /// Optional JSON array of venue position rows to start from
    #[arg(long)]
    pub positions: Option<PathBuf>,

    /// Number of decision cycles to run
    #[arg(long, default_value_t = 1)]
    pub cycles: u32,

    /// Where decision records are appended as JSON lines
    #[arg(long, default_value = "decisions.jsonl")]
    pub records: PathBuf,

    /// Starting wallet; defaults to the configured initial balance
    #[arg(long)]
    pub wallet: Option<f64>,

    /// Paper slippage in basis points
    #[arg(long, default_value_t = 5.0)]
    pub slippage_bps: f64,

    /// Run the trader on its schedule until Ctrl-C instead of a fixed cycle count
    #[arg(long)]
    pub follow: bool,
}

/// Outcome of a fixed-length paper session.
#[derive(Debug, Clone)]
pub struct PaperSummary {
    pub cycles: u32,
    pub failed_cycles: u32,
    pub actions: usize,
    pub failed_actions: usize,
    pub status: TraderStatus,
}

/// Runs the paper command.
///
/// # Errors
/// Returns an error if configuration or input files are invalid, or the
/// trader cannot be constructed. Failing cycles are counted, not returned.
pub async fn run_paper(args: PaperArgs) -> Result<PaperSummary> {
    let config = ConfigLoader::load_from(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let trader = build_trader(&args, config).await?;

    if args.follow {
        return follow(trader).await;
    }

    let mut trader = trader;
    let mut summary = PaperSummary {
        cycles: 0,
        failed_cycles: 0,
        actions: 0,
        failed_actions: 0,
        status: trader.status(TraderState::Running),
    };

    for _ in 0..args.cycles {
        summary.cycles += 1;
        match trader.run_cycle().await {
            Ok(record) => {
                let failed = record.actions.iter().filter(|a| !a.success).count();
                summary.actions += record.actions.len();
                summary.failed_actions += failed;
                if !record.success {
                    summary.failed_cycles += 1;
                }
                println!(
                    "cycle {:>3}  actions {:>2}  failed {:>2}  {}",
                    record.cycle_number,
                    record.actions.len(),
                    failed,
                    record.error_message.as_deref().unwrap_or("ok")
                );
                for line in &record.execution_log {
                    println!("           {line}");
                }
            }
            Err(err) => {
                summary.failed_cycles += 1;
                println!("cycle {:>3}  error: {err}", trader.call_count());
            }
        }
    }

    let state = if trader
        .executor()
        .breaker()
        .is_paused(chrono::Utc::now())
    {
        TraderState::Paused
    } else {
        TraderState::Running
    };
    summary.status = trader.status(state);
    println!("{}", serde_json::to_string_pretty(&summary.status)?);
    Ok(summary)
}

async fn build_trader(args: &PaperArgs, config: TraderConfig) -> Result<Trader> {
    let wallet = args.wallet.unwrap_or(config.initial_balance);
    let venue = Arc::new(PaperExchange::new(
        wallet,
        config.risk.taker_fee_rate,
        args.slippage_bps,
    ));

    let market = Arc::new(PaperMarketData::from_file(&args.market)?);
    for symbol in market.symbols() {
        let data = market.get(&symbol).await?;
        venue.set_mark_price(&symbol, data.current_price);
    }

    if let Some(path) = &args.positions {
        let seeded = venue.seed_from_file(path)?;
        tracing::info!(seeded, "seeded paper positions");
    }

    let decisions = Arc::new(ScriptedDecisions::from_file(&args.decisions)?);
    let store = Arc::new(JsonlStore::new(args.records.clone()));

    let trader = Trader::new(
        config,
        Collaborators {
            exchange: venue,
            market,
            decisions,
            store: store.clone(),
            pool: None,
            balance_store: Some(store),
        },
    )?;
    Ok(trader)
}

async fn follow(trader: Trader) -> Result<PaperSummary> {
    let (handle, join) = TraderActor::spawn(trader);
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    let status = handle.status().await?;
    handle.stop().await?;
    join.await.context("trader task panicked")?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    #[allow(clippy::cast_possible_truncation)]
    let cycles = status.call_count as u32;
    Ok(PaperSummary {
        cycles,
        failed_cycles: 0,
        actions: 0,
        failed_actions: 0,
        status,
    })
}
