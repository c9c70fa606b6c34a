use crate::error::DecisionSourceError;
use crate::record::DecisionRecord;
use crate::types::{
    Balance, CandidateSymbol, DecisionBundle, MarketData, OrderAck, PerformanceSummary,
    PositionSnapshot, PromptOptions, Side, TradingContext,
};
use anyhow::Result;
use async_trait::async_trait;

/// Capability interface implemented once per venue.
///
/// Every method surfaces venue failures as errors; callers never retry.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn balance(&self) -> Result<Balance>;

    async fn positions(&self) -> Result<Vec<PositionSnapshot>>;

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck>;

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck>;

    /// Closes `quantity` of the long position; a quantity of zero closes it fully.
    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck>;

    /// Closes `quantity` of the short position; a quantity of zero closes it fully.
    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck>;

    async fn set_stop_loss(&self, symbol: &str, side: Side, quantity: f64, price: f64)
        -> Result<()>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<()>;

    /// Cancels every resting stop-loss and take-profit order for `symbol`.
    async fn cancel_stop_orders(&self, symbol: &str) -> Result<()>;

    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> Result<()>;

    fn name(&self) -> &str;
}

/// External decision maker (usually a language model).
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Produces a decision bundle for the given context.
    ///
    /// # Errors
    ///
    /// Returns [`DecisionSourceError`] carrying any partial output produced
    /// before the failure.
    async fn decide(
        &self,
        context: &TradingContext,
        prompt: &PromptOptions,
    ) -> Result<DecisionBundle, DecisionSourceError>;
}

/// Technical indicators per symbol.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get(&self, symbol: &str) -> Result<MarketData>;
}

/// External pool of tradeable symbols, consulted when no symbols are configured.
#[async_trait]
pub trait CandidatePool: Send + Sync {
    async fn candidates(&self, limit: usize) -> Result<Vec<CandidateSymbol>>;
}

/// Append-only decision log with a rolling performance query.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn append(&self, record: &DecisionRecord) -> Result<()>;

    /// Performance over the most recent `window` records.
    async fn recent_performance(&self, window: usize) -> Result<Option<PerformanceSummary>>;
}

/// Persists a re-baselined initial balance.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn update_initial_balance(&self, user_id: &str, trader_id: &str, balance: f64)
        -> Result<()>;
}
