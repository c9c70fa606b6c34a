//! Risk and execution engine for a leveraged-futures auto-trader.
//!
//! A [`Trader`] owns the position caches, the circuit breaker and an
//! [`Executor`]. [`TraderActor::spawn`] runs its decision cycle on a fixed
//! interval next to a [`DrawdownMonitor`], and the returned [`TraderHandle`]
//! reports status and stops both.

pub mod actor;
pub mod book;
pub mod breaker;
pub mod commands;
pub mod executor;
pub mod guardrails;
pub mod handle;
pub mod monitor;
pub mod protection;
pub mod quantity;
pub mod trader;

/// Tolerance for price and quantity comparisons.
pub const EPSILON: f64 = 1e-6;

pub use actor::TraderActor;
pub use book::{position_key, PositionBook, PositionMeta, ProtectiveClaim, Realized};
pub use breaker::{BreakerOutcome, CircuitBreaker};
pub use commands::{TraderCommand, TraderState, TraderStatus};
pub use executor::{ExecutionError, Executor};
pub use guardrails::{ProtectiveKind, Rejection, Sizing};
pub use handle::TraderHandle;
pub use monitor::{drawdown_pct, DrawdownMonitor, TickOutcome};
pub use protection::{RatchetTarget, RoiProfile};
pub use trader::{normalize_symbol, sort_decisions_by_priority, Collaborators, CycleError, Trader};
