//! Decision cycle orchestration: one exclusively-owned trader per identity.

use crate::book::{position_key, PositionBook};
use crate::breaker::CircuitBreaker;
use crate::commands::{TraderState, TraderStatus};
use crate::executor::Executor;
use crate::protection;
use anyhow::Context;
use autotrader_core::{
    AccountInfo, AccountSnapshot, ActionRecord, BalanceStore, CandidatePool,
    CandidateSymbol, ConfigError, Decision, DecisionRecord, DecisionSource, DecisionSourceError,
    DecisionStore, ExchangeAdapter, MarketData, MarketDataProvider, TraderConfig, TradingContext,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Why a cycle could not complete. Paused cycles are not errors.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to build trading context: {0:#}")]
    Context(anyhow::Error),

    #[error(transparent)]
    DecisionSource(#[from] DecisionSourceError),
}

/// External collaborators a trader is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub market: Arc<dyn MarketDataProvider>,
    pub decisions: Arc<dyn DecisionSource>,
    pub store: Arc<dyn DecisionStore>,
    pub pool: Option<Arc<dyn CandidatePool>>,
    pub balance_store: Option<Arc<dyn BalanceStore>>,
}

pub struct Trader {
    config: TraderConfig,
    executor: Executor,
    decisions: Arc<dyn DecisionSource>,
    store: Arc<dyn DecisionStore>,
    pool: Option<Arc<dyn CandidatePool>>,
    balance_store: Option<Arc<dyn BalanceStore>>,
    initial_balance: f64,
    started_at: DateTime<Utc>,
    last_balance_sync: DateTime<Utc>,
    call_count: u64,
    last_error: Option<String>,
}

impl Trader {
    /// Creates a trader with fresh caches and an idle circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid. No trader is
    /// created in that case.
    pub fn new(config: TraderConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        let now = Utc::now();
        let book = Arc::new(PositionBook::new());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), now));
        let executor = Executor::new(
            collaborators.exchange,
            collaborators.market,
            book,
            breaker,
            Arc::new(config.risk.clone()),
            config.margin_mode,
        );

        tracing::info!(
            trader = %config.id,
            venue = %config.venue,
            initial_balance = config.initial_balance,
            scan_interval_secs = config.scan_interval_secs,
            "trader created"
        );

        Ok(Self {
            initial_balance: config.initial_balance,
            config,
            executor,
            decisions: collaborators.decisions,
            store: collaborators.store,
            pool: collaborators.pool,
            balance_store: collaborators.balance_store,
            started_at: now,
            last_balance_sync: now,
            call_count: 0,
            last_error: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &TraderConfig {
        &self.config
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    #[must_use]
    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    /// Status snapshot for the actor handle.
    #[must_use]
    pub fn status(&self, state: TraderState) -> TraderStatus {
        let breaker = self.executor.breaker();
        TraderStatus {
            trader_id: self.config.id.clone(),
            name: self.config.name.clone(),
            venue: self.config.venue.clone(),
            state,
            started_at: self.started_at,
            call_count: self.call_count,
            initial_balance: self.initial_balance,
            consecutive_losses: breaker.consecutive_losses(),
            stop_until: breaker.stop_until(),
            daily_pnl: breaker.daily_pnl(),
            peak_pnl: self.executor.book().peaks_snapshot(),
            last_error: self.last_error.clone(),
        }
    }

    /// Runs one decision cycle and returns the persisted record.
    ///
    /// A paused trader records the skip and returns `Ok`. Rejected or failed
    /// actions are recorded per action and never abort the cycle.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError`] when the context cannot be built or the decision
    /// source fails. The record is still persisted in both cases.
    pub async fn run_cycle(&mut self) -> Result<DecisionRecord, CycleError> {
        self.call_count += 1;
        let now = Utc::now();
        let mut record = DecisionRecord::new(self.config.id.clone(), self.call_count, now);

        if let Some(remaining) = self.executor.breaker().pause_remaining(now) {
            let minutes = remaining.num_minutes();
            tracing::warn!(
                trader = %self.config.id,
                cycle = self.call_count,
                remaining_minutes = minutes,
                "risk control pause active, skipping cycle"
            );
            record.fail(format!(
                "risk control pause active, {minutes} minutes remaining"
            ));
            self.persist(&record).await;
            return Ok(record);
        }

        if self.executor.breaker().reset_daily_if_due(now) {
            tracing::info!(trader = %self.config.id, "daily pnl reset");
        }

        self.sync_balance_if_due(now).await;

        let context = match self.build_context(now).await {
            Ok(context) => context,
            Err(err) => {
                record.fail(format!("failed to build trading context: {err:#}"));
                self.persist(&record).await;
                self.last_error = record.error_message.clone();
                return Err(CycleError::Context(err));
            }
        };
        fill_snapshot(&mut record, &context);

        tracing::info!(
            trader = %self.config.id,
            cycle = self.call_count,
            equity = context.account.total_equity,
            positions = context.positions.len(),
            candidates = context.candidates.len(),
            "requesting decisions"
        );

        let bundle = match self.decisions.decide(&context, &self.config.prompt).await {
            Ok(bundle) => bundle,
            Err(err) => {
                if let Some(partial) = &err.partial {
                    record.system_prompt.clone_from(&partial.system_prompt);
                    record.input_prompt.clone_from(&partial.user_prompt);
                    record.cot_trace.clone_from(&partial.cot_trace);
                    record.decision_json = serde_json::to_string_pretty(&partial.decisions)
                        .unwrap_or_default();
                }
                record.fail(format!("failed to obtain decisions: {:#}", err.source));
                self.persist(&record).await;
                self.last_error = record.error_message.clone();
                return Err(CycleError::DecisionSource(err));
            }
        };

        record.system_prompt = bundle.system_prompt;
        record.input_prompt = bundle.user_prompt;
        record.cot_trace = bundle.cot_trace;
        let mut decisions = bundle.decisions;
        record.decision_json = serde_json::to_string_pretty(&decisions).unwrap_or_default();

        let base_len = decisions.len();
        let book = self.executor.book();
        let take_profits = protection::auto_take_profit_decisions(&context, &decisions, book);
        decisions.extend(take_profits);
        let stop_losses = protection::auto_stop_loss_decisions(&context, &decisions, book);
        decisions.extend(stop_losses);
        let appended = decisions.len() - base_len;
        if appended > 0 {
            tracing::debug!(count = appended, "appended protective decisions");
            record.decision_json = serde_json::to_string_pretty(&decisions).unwrap_or_default();
        }

        let sorted = sort_decisions_by_priority(decisions);
        let delay = self.config.post_success_delay();

        for decision in &sorted {
            let mut action =
                ActionRecord::pending(decision.action.clone(), decision.symbol.clone(), Utc::now());
            action.leverage = decision.leverage;

            match self.executor.execute(decision, &mut action).await {
                Ok(()) => {
                    action.success = true;
                    record.execution_log.push(format!(
                        "✓ {} {} succeeded",
                        decision.symbol,
                        decision.action.as_str()
                    ));
                    record.actions.push(action);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        trader = %self.config.id,
                        symbol = %decision.symbol,
                        action = decision.action.as_str(),
                        error = %err,
                        "decision execution failed"
                    );
                    action.error = Some(err.to_string());
                    record.execution_log.push(format!(
                        "✗ {} {} failed: {err}",
                        decision.symbol,
                        decision.action.as_str()
                    ));
                    record.actions.push(action);
                }
            }
        }

        self.last_error = None;
        self.persist(&record).await;
        Ok(record)
    }

    async fn persist(&self, record: &DecisionRecord) {
        if let Err(err) = self.store.append(record).await {
            tracing::warn!(
                trader = %self.config.id,
                cycle = record.cycle_number,
                error = %err,
                "failed to persist decision record"
            );
        }
    }

    /// Re-reads the venue balance on its own schedule and moves the baseline
    /// when it has drifted past the configured threshold.
    ///
    /// The sync timestamp advances even when the read fails. Returns the new
    /// baseline when it moved.
    pub async fn sync_balance_if_due(&mut self, now: DateTime<Utc>) -> Option<f64> {
        let elapsed = (now - self.last_balance_sync).to_std().unwrap_or_default();
        if elapsed < self.config.balance_sync_interval() {
            return None;
        }
        self.last_balance_sync = now;

        let balance = match self.executor.exchange().balance().await {
            Ok(balance) => balance,
            Err(err) => {
                tracing::warn!(error = %err, "balance sync skipped, failed to read balance");
                return None;
            }
        };

        let actual = if balance.wallet > 0.0 {
            balance.wallet
        } else {
            balance.available
        };
        if actual <= 0.0 {
            tracing::warn!(actual, "balance sync skipped, venue reported no balance");
            return None;
        }

        let previous = self.initial_balance;
        if previous > 0.0 {
            let change_pct = (actual - previous) / previous * 100.0;
            if change_pct.abs() <= self.config.balance_drift_pct {
                tracing::debug!(previous, actual, change_pct, "balance within drift band");
                return None;
            }
            tracing::info!(previous, actual, change_pct, "balance drifted, updating baseline");
        } else {
            tracing::info!(actual, "baseline was unset, adopting venue balance");
        }
        self.initial_balance = actual;

        if let Some(store) = &self.balance_store {
            if let Err(err) = store
                .update_initial_balance(&self.config.user_id, &self.config.id, actual)
                .await
            {
                tracing::warn!(error = %err, "failed to persist updated baseline");
            }
        }
        Some(actual)
    }

    /// Builds the snapshot the decision source decides on.
    ///
    /// # Errors
    ///
    /// Returns an error if the balance, positions or candidate pool cannot be read.
    pub async fn build_context(&self, now: DateTime<Utc>) -> anyhow::Result<TradingContext> {
        let exchange = self.executor.exchange();
        let balance = exchange.balance().await.context("failed to read balance")?;
        let mut positions = exchange
            .positions()
            .await
            .context("failed to read positions")?;

        let book = self.executor.book();
        let now_ms = now.timestamp_millis();
        let mut live = HashSet::with_capacity(positions.len());
        let mut margin_used = 0.0;
        for position in &mut positions {
            let leverage = f64::from(position.leverage.max(1));
            position.margin_used = position.quantity * position.mark_price / leverage;
            margin_used += position.margin_used;
            position.first_seen_ms = Some(book.observe(&position.symbol, position.side, now_ms));
            live.insert(position_key(&position.symbol, position.side));
        }
        book.retain_seen(&live);

        let candidates = self.candidate_symbols().await?;

        let total_equity = balance.equity();
        let total_pnl = total_equity - self.initial_balance;
        let total_pnl_pct = if self.initial_balance > 0.0 {
            total_pnl / self.initial_balance * 100.0
        } else {
            0.0
        };
        let margin_used_pct = if total_equity > 0.0 {
            margin_used / total_equity * 100.0
        } else {
            0.0
        };

        let performance = match self
            .store
            .recent_performance(self.config.performance_window)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                tracing::warn!(error = %err, "performance window unavailable");
                None
            }
        };

        let mut market_data: HashMap<String, MarketData> = HashMap::new();
        for position in &positions {
            if market_data.contains_key(&position.symbol) {
                continue;
            }
            match self.executor.market().get(&position.symbol).await {
                Ok(data) => {
                    market_data.insert(position.symbol.clone(), data);
                }
                Err(err) => {
                    tracing::warn!(symbol = %position.symbol, error = %err, "market data unavailable");
                }
            }
        }

        Ok(TradingContext {
            current_time: now,
            runtime_minutes: (now - self.started_at).num_minutes(),
            call_count: self.call_count,
            leverage: self.config.leverage,
            account: AccountInfo {
                total_equity,
                available_balance: balance.available,
                total_pnl,
                total_pnl_pct,
                margin_used,
                margin_used_pct,
                position_count: positions.len(),
            },
            positions,
            candidates,
            performance,
            market_data,
        })
    }

    /// Custom symbols win over configured defaults, which win over the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the candidate pool fails.
    pub async fn candidate_symbols(&self) -> anyhow::Result<Vec<CandidateSymbol>> {
        if !self.config.custom_symbols.is_empty() {
            return Ok(tagged(
                self.config.custom_symbols.iter().map(|s| normalize_symbol(s)),
                "custom",
            ));
        }
        if !self.config.default_symbols.is_empty() {
            return Ok(tagged(self.config.default_symbols.iter().cloned(), "default"));
        }
        match &self.pool {
            Some(pool) => pool
                .candidates(self.config.candidate_limit)
                .await
                .context("failed to read candidate pool"),
            None => Ok(Vec::new()),
        }
    }
}

fn tagged(symbols: impl Iterator<Item = String>, source: &str) -> Vec<CandidateSymbol> {
    let mut seen = HashSet::new();
    symbols
        .filter(|symbol| !symbol.is_empty() && seen.insert(symbol.clone()))
        .map(|symbol| CandidateSymbol {
            symbol,
            sources: vec![source.to_string()],
        })
        .collect()
}

fn fill_snapshot(record: &mut DecisionRecord, context: &TradingContext) {
    record.account = AccountSnapshot {
        total_balance: context.account.total_equity,
        available_balance: context.account.available_balance,
        total_unrealized_profit: context.positions.iter().map(|p| p.unrealized_pnl).sum(),
        position_count: context.positions.len(),
        margin_used_pct: context.account.margin_used_pct,
    };
    record.positions.clone_from(&context.positions);
    record.candidates.clone_from(&context.candidates);
}

/// Upper-cases, trims and appends `USDT` when missing.
#[must_use]
pub fn normalize_symbol(symbol: &str) -> String {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() || symbol.ends_with("USDT") {
        symbol
    } else {
        format!("{symbol}USDT")
    }
}

/// Stable sort by [`Action::priority`]: closes, then protective updates, then
/// opens, then holds. Unknown actions go last.
#[must_use]
pub fn sort_decisions_by_priority(mut decisions: Vec<Decision>) -> Vec<Decision> {
    decisions.sort_by_key(|d| d.action.priority());
    decisions
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrader_core::Action;

    #[test]
    fn normalizes_symbols() {
        assert_eq!(normalize_symbol(" btc "), "BTCUSDT");
        assert_eq!(normalize_symbol("ethusdt"), "ETHUSDT");
        assert_eq!(normalize_symbol("  "), "");
    }

    #[test]
    fn close_sorts_before_open_and_unknown_last() {
        let decisions = vec![
            Decision::new("ZZZUSDT", Action::from("teleport")),
            Decision::new("BTCUSDT", Action::OpenLong),
            Decision::new("BTCUSDT", Action::Hold),
            Decision::new("BTCUSDT", Action::CloseLong),
            Decision::update_stop_loss("ETHUSDT", 100.0, "tighten".to_string()),
            Decision::new("ETHUSDT", Action::PartialClose),
        ];
        let sorted = sort_decisions_by_priority(decisions);
        let actions: Vec<&str> = sorted.iter().map(|d| d.action.as_str()).collect();
        assert_eq!(
            actions,
            vec![
                "close_long",
                "partial_close",
                "update_stop_loss",
                "open_long",
                "hold",
                "teleport"
            ]
        );
    }

    #[test]
    fn sort_keeps_relative_order_within_priority() {
        let decisions = vec![
            Decision::new("AUSDT", Action::OpenLong),
            Decision::new("BUSDT", Action::OpenShort),
            Decision::new("CUSDT", Action::OpenLong),
        ];
        let sorted = sort_decisions_by_priority(decisions);
        let symbols: Vec<&str> = sorted.iter().map(|d| d.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AUSDT", "BUSDT", "CUSDT"]);
    }

    #[test]
    fn tagged_drops_duplicates_and_empties() {
        let tags = tagged(
            vec!["BTCUSDT".to_string(), String::new(), "BTCUSDT".to_string()].into_iter(),
            "custom",
        );
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].sources, vec!["custom".to_string()]);
    }
}
