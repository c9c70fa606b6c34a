pub mod config;
pub mod config_loader;
pub mod error;
pub mod record;
pub mod traits;
pub mod types;
pub mod venue;

pub use config::{BreakerConfig, MarginMode, RiskPolicy, TraderConfig, SUPPORTED_VENUES};
pub use config_loader::ConfigLoader;
pub use error::{ConfigError, DecisionSourceError};
pub use record::{AccountSnapshot, ActionRecord, DecisionRecord};
pub use traits::{
    BalanceStore, CandidatePool, DecisionSource, DecisionStore, ExchangeAdapter,
    MarketDataProvider,
};
pub use types::{
    roi_pct, AccountInfo, Action, Balance, CandidateSymbol, Decision, DecisionBundle,
    IntradaySeries, LeveragePolicy, LongerTermContext, MarketData, MidTermContext, OrderAck,
    PerformanceSummary, PositionSnapshot, PromptOptions, Side, TradingContext,
    AUTO_LOCK_TAG, AUTO_STOP_LOSS_TAG, AUTO_TAKE_PROFIT_TAG,
};
pub use venue::{RawBalance, RawOrderAck, RawPosition, VenueError};
