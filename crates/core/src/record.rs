use crate::types::{Action, CandidateSymbol, PerformanceSummary, PositionSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account figures captured at the start of a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AccountSnapshot {
    pub total_balance: f64,
    pub available_balance: f64,
    pub total_unrealized_profit: f64,
    pub position_count: usize,
    pub margin_used_pct: f64,
}

/// Outcome of executing one decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub action: Action,
    pub symbol: String,
    pub quantity: f64,
    pub leverage: u32,
    pub price: f64,
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    /// Realized PnL for successful closes.
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

impl ActionRecord {
    #[must_use]
    pub fn pending(action: Action, symbol: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            quantity: 0.0,
            leverage: 0,
            price: 0.0,
            order_id: None,
            timestamp,
            success: false,
            error: None,
            realized_pnl: None,
        }
    }
}

/// One persisted record per cycle, written whether or not the cycle succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub trader_id: String,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub system_prompt: String,
    pub input_prompt: String,
    pub cot_trace: String,
    pub decision_json: String,
    pub account: AccountSnapshot,
    pub positions: Vec<PositionSnapshot>,
    pub candidates: Vec<CandidateSymbol>,
    pub actions: Vec<ActionRecord>,
    pub execution_log: Vec<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl DecisionRecord {
    #[must_use]
    pub fn new(trader_id: impl Into<String>, cycle_number: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            trader_id: trader_id.into(),
            cycle_number,
            timestamp,
            system_prompt: String::new(),
            input_prompt: String::new(),
            cot_trace: String::new(),
            decision_json: String::new(),
            account: AccountSnapshot::default(),
            positions: Vec::new(),
            candidates: Vec::new(),
            actions: Vec::new(),
            execution_log: Vec::new(),
            success: true,
            error_message: None,
        }
    }

    /// Marks the record failed; keeps the first failure reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.success = false;
        if self.error_message.is_none() {
            self.error_message = Some(reason.into());
        }
    }

    /// Realized PnL of every successful close in this record.
    pub fn realized_pnls(&self) -> impl Iterator<Item = f64> + '_ {
        self.actions
            .iter()
            .filter(|a| a.success)
            .filter_map(|a| a.realized_pnl)
    }
}

impl PerformanceSummary {
    /// Summarises realized trades over a window of decision records.
    ///
    /// Returns `None` when the window contains no closed trades.
    #[must_use]
    pub fn from_records(records: &[DecisionRecord]) -> Option<Self> {
        let pnls: Vec<f64> = records.iter().flat_map(DecisionRecord::realized_pnls).collect();
        if pnls.is_empty() {
            return None;
        }

        let total_trades = pnls.len();
        let winning_trades = pnls.iter().filter(|p| **p > 0.0).count();
        let losing_trades = pnls.iter().filter(|p| **p < 0.0).count();
        let total_pnl: f64 = pnls.iter().sum();

        #[allow(clippy::cast_precision_loss)]
        let n = total_trades as f64;
        let mean = total_pnl / n;
        let sharpe_ratio = if total_trades > 1 {
            let variance = pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let std_dev = variance.sqrt();
            (std_dev > 0.0).then(|| mean / std_dev)
        } else {
            None
        };

        Some(Self {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate: winning_trades as f64 / n,
            total_pnl,
            sharpe_ratio,
        })
    }
}
