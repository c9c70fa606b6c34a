//! Paper venue for the auto-trader.
//!
//! [`PaperExchange`] simulates fills, margin, commission and slippage locally
//! and makes **zero** network calls. [`PaperMarketData`] serves indicator
//! snapshots set by the caller.

pub mod exchange;
pub mod market;

pub use exchange::{PaperExchange, PaperOp, ProtectiveOrder};
pub use market::PaperMarketData;
