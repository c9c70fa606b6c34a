use autotrader_cli::commands::{run_paper, PaperArgs};
use autotrader_core::ConfigLoader;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "autotrader")]
#[command(about = "Risk-managed auto-trader for leveraged futures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a paper session with scripted decisions
    Paper(PaperArgs),
    /// Load and validate a trader configuration, then print it
    CheckConfig {
        /// Config file path
        #[arg(short, long, default_value = "config/Trader.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Paper(args) => {
            let summary = run_paper(args).await?;
            tracing::info!(
                cycles = summary.cycles,
                failed_cycles = summary.failed_cycles,
                actions = summary.actions,
                failed_actions = summary.failed_actions,
                "paper session finished"
            );
        }
        Commands::CheckConfig { config } => {
            let config = ConfigLoader::load_from(&config)?;
            println!("{config:#?}");
        }
    }

    Ok(())
}
