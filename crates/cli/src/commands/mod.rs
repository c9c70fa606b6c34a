//! CLI commands for the auto-trader.

pub mod paper;

pub use paper::{run_paper, PaperArgs, PaperSummary};
