use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum TraderCommand {
    GetStatus(oneshot::Sender<TraderStatus>),
    /// Stops the cycle loop, joins the drawdown monitor, then acknowledges.
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraderState {
    Running,
    /// Circuit breaker pause in effect; cycles are recorded and skipped.
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderStatus {
    pub trader_id: String,
    pub name: String,
    pub venue: String,
    pub state: TraderState,
    pub started_at: DateTime<Utc>,
    pub call_count: u64,
    pub initial_balance: f64,
    pub consecutive_losses: u32,
    pub stop_until: Option<DateTime<Utc>>,
    pub daily_pnl: f64,
    /// Peak ROI% per `SYMBOL_side` key.
    pub peak_pnl: HashMap<String, f64>,
    pub last_error: Option<String>,
}
