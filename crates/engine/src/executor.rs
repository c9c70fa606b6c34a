//! Execution state machine.
//!
//! Maps one decision to exchange calls. Every handler fetches market data,
//! runs its guardrails, mutates the venue, and only then commits to the
//! position book. Failures stay local to the decision.

use crate::book::{PositionBook, ProtectiveClaim, Realized};
use crate::breaker::CircuitBreaker;
use crate::guardrails::{self, ProtectiveKind, Rejection};
use crate::protection;
use crate::quantity;
use autotrader_core::{
    Action, ActionRecord, Decision, ExchangeAdapter, MarginMode, MarketData, MarketDataProvider,
    OrderAck, PositionSnapshot, RiskPolicy, Side, AUTO_LOCK_TAG,
};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("market data unavailable for {symbol}: {source}")]
    MarketData {
        symbol: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{op} failed for {symbol}: {source}")]
    Exchange {
        op: &'static str,
        symbol: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no open position for {0}")]
    PositionNotFound(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),
}

impl ExecutionError {
    fn exchange(op: &'static str, symbol: &str, source: anyhow::Error) -> Self {
        Self::Exchange {
            op,
            symbol: symbol.to_string(),
            source,
        }
    }
}

/// Shared by the decision cycle and the drawdown monitor.
#[derive(Clone)]
pub struct Executor {
    exchange: Arc<dyn ExchangeAdapter>,
    market: Arc<dyn MarketDataProvider>,
    book: Arc<PositionBook>,
    breaker: Arc<CircuitBreaker>,
    policy: Arc<RiskPolicy>,
    margin_mode: MarginMode,
}

impl Executor {
    #[must_use]
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        market: Arc<dyn MarketDataProvider>,
        book: Arc<PositionBook>,
        breaker: Arc<CircuitBreaker>,
        policy: Arc<RiskPolicy>,
        margin_mode: MarginMode,
    ) -> Self {
        Self {
            exchange,
            market,
            book,
            breaker,
            policy,
            margin_mode,
        }
    }

    #[must_use]
    pub fn book(&self) -> &Arc<PositionBook> {
        &self.book
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn exchange(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.exchange
    }

    #[must_use]
    pub fn market(&self) -> &Arc<dyn MarketDataProvider> {
        &self.market
    }

    /// Dispatches one decision by action tag, filling in `record` as it goes.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError`] for rejections, venue failures and unknown actions.
    pub async fn execute(
        &self,
        decision: &Decision,
        record: &mut ActionRecord,
    ) -> Result<(), ExecutionError> {
        match &decision.action {
            Action::OpenLong => self.open(decision, Side::Long, record).await,
            Action::OpenShort => self.open(decision, Side::Short, record).await,
            Action::CloseLong => self.close(&decision.symbol, Side::Long, record).await,
            Action::CloseShort => self.close(&decision.symbol, Side::Short, record).await,
            Action::UpdateStopLoss => {
                self.update_stop_loss(&decision.symbol, None, decision.new_stop_loss, record)
                    .await
            }
            Action::UpdateTakeProfit => {
                self.update_take_profit(&decision.symbol, None, decision.new_take_profit, record)
                    .await
            }
            Action::PartialClose => self.partial_close(decision, record).await,
            Action::Hold | Action::Wait => Ok(()),
            Action::Unknown(raw) => Err(ExecutionError::UnknownAction(raw.clone())),
        }
    }

    async fn market_data(&self, symbol: &str) -> Result<MarketData, ExecutionError> {
        self.market
            .get(symbol)
            .await
            .map_err(|source| ExecutionError::MarketData {
                symbol: symbol.to_string(),
                source,
            })
    }

    /// Live positions on `symbol`, both sides.
    async fn live_positions(&self, symbol: &str) -> Result<Vec<PositionSnapshot>, ExecutionError> {
        let positions = self
            .exchange
            .positions()
            .await
            .map_err(|e| ExecutionError::exchange("get positions", symbol, e))?;
        Ok(positions
            .into_iter()
            .filter(|pos| pos.symbol.eq_ignore_ascii_case(symbol) && pos.quantity > 0.0)
            .collect())
    }

    /// Picks the position on `side`, or the first one on the symbol when the
    /// caller only knows the symbol.
    fn select_position(
        live: &[PositionSnapshot],
        symbol: &str,
        side: Option<Side>,
    ) -> Result<PositionSnapshot, ExecutionError> {
        live.iter()
            .find(|pos| side.map_or(true, |side| pos.side == side))
            .cloned()
            .ok_or_else(|| ExecutionError::PositionNotFound(symbol.to_string()))
    }

    async fn find_position(
        &self,
        symbol: &str,
        side: Option<Side>,
    ) -> Result<PositionSnapshot, ExecutionError> {
        let live = self.live_positions(symbol).await?;
        Self::select_position(&live, symbol, side)
    }

    // =========================================================================
    // Opens
    // =========================================================================

    async fn open(
        &self,
        decision: &Decision,
        side: Side,
        record: &mut ActionRecord,
    ) -> Result<(), ExecutionError> {
        let symbol = decision.symbol.as_str();
        tracing::info!(symbol, %side, confidence = decision.confidence, "opening position");

        guardrails::check_confidence(decision, &self.policy)?;

        let positions = self
            .exchange
            .positions()
            .await
            .map_err(|e| ExecutionError::exchange("get positions", symbol, e))?;
        guardrails::check_duplicate(&positions, symbol, side)?;

        let data = self.market_data(symbol).await?;
        guardrails::check_mid_term(&data, side, &self.policy)?;
        guardrails::check_momentum(&data, side, &self.policy)?;

        let balance = self
            .exchange
            .balance()
            .await
            .map_err(|e| ExecutionError::exchange("get balance", symbol, e))?;
        let sizing = guardrails::fit_to_balance(
            decision,
            balance.available,
            balance.sizing_equity(),
            &data,
            &self.policy,
        )?;

        let price = data.current_price;
        let quantity = sizing.position_size_usd / price;
        record.quantity = quantity;
        record.price = price;
        record.leverage = decision.leverage;

        guardrails::check_margin(
            sizing.position_size_usd,
            decision.leverage,
            balance.available,
            &self.policy,
        )?;

        if let Err(err) = self
            .exchange
            .set_margin_mode(symbol, self.margin_mode.is_cross())
            .await
        {
            tracing::warn!(symbol, error = %err, "failed to set margin mode, continuing");
        }

        let ack = match side {
            Side::Long => self.exchange.open_long(symbol, quantity, decision.leverage).await,
            Side::Short => {
                self.exchange
                    .open_short(symbol, quantity, decision.leverage)
                    .await
            }
        }
        .map_err(|e| ExecutionError::exchange("open", symbol, e))?;
        record.order_id = ack.order_id;

        self.book.record_open(symbol, side, price, quantity);
        self.book.observe(symbol, side, Utc::now().timestamp_millis());
        tracing::info!(
            symbol,
            %side,
            quantity,
            price,
            size_usd = sizing.position_size_usd,
            risk_usd = sizing.risk_usd,
            "position opened"
        );

        if decision.stop_loss > 0.0 {
            match self
                .exchange
                .set_stop_loss(symbol, side, quantity, decision.stop_loss)
                .await
            {
                Ok(()) => self.book.set_stop_loss(symbol, side, decision.stop_loss),
                Err(err) => tracing::warn!(symbol, error = %err, "failed to place initial stop-loss"),
            }
        }
        if decision.take_profit > 0.0 {
            match self
                .exchange
                .set_take_profit(symbol, side, quantity, decision.take_profit)
                .await
            {
                Ok(()) => self.book.set_take_profit(symbol, side, decision.take_profit),
                Err(err) => {
                    tracing::warn!(symbol, error = %err, "failed to place initial take-profit");
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // Closes
    // =========================================================================

    async fn close(
        &self,
        symbol: &str,
        side: Side,
        record: &mut ActionRecord,
    ) -> Result<(), ExecutionError> {
        tracing::info!(symbol, %side, "closing position");
        let data = self.market_data(symbol).await?;
        record.price = data.current_price;

        let closed_quantity = self.book.quantity(symbol, side);
        if closed_quantity > 0.0 {
            record.quantity = closed_quantity;
        }

        let ack = self.close_on_venue(symbol, side, 0.0).await?;
        record.order_id = ack.order_id;

        let realized = self.realize(symbol, side, closed_quantity, data.current_price);
        record.realized_pnl = realized.map(|r| r.pnl);
        // The venue position is gone whether or not we knew its size.
        self.book.forget(symbol, side);
        Ok(())
    }

    async fn close_on_venue(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, ExecutionError> {
        match side {
            Side::Long => self.exchange.close_long(symbol, quantity).await,
            Side::Short => self.exchange.close_short(symbol, quantity).await,
        }
        .map_err(|e| ExecutionError::exchange("close", symbol, e))
    }

    async fn partial_close(
        &self,
        decision: &Decision,
        record: &mut ActionRecord,
    ) -> Result<(), ExecutionError> {
        let symbol = decision.symbol.as_str();
        let percentage = decision.close_percentage;
        if percentage <= 0.0 || percentage > 100.0 {
            return Err(Rejection::InvalidClosePercentage(percentage).into());
        }

        let data = self.market_data(symbol).await?;
        record.price = data.current_price;

        let position = self.find_position(symbol, None).await?;
        let step = quantity::step_size(symbol, &self.policy);
        let close_quantity = quantity::partial_close_quantity(position.quantity, percentage, step);
        if close_quantity <= 0.0 {
            return Err(Rejection::QuantityBelowStep {
                step: step.to_f64().unwrap_or(0.0),
            }
            .into());
        }
        record.quantity = close_quantity;

        let ack = self
            .close_on_venue(&position.symbol, position.side, close_quantity)
            .await?;
        record.order_id = ack.order_id;

        tracing::info!(
            symbol,
            side = %position.side,
            closed = close_quantity,
            percentage,
            remaining = position.quantity - close_quantity,
            "partial close filled"
        );

        let realized = self.realize(symbol, position.side, close_quantity, data.current_price);
        record.realized_pnl = realized.map(|r| r.pnl);

        self.evaluate_symbol_protection(symbol).await;
        Ok(())
    }

    /// Books a realized close and feeds the circuit breaker.
    fn realize(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        close_price: f64,
    ) -> Option<Realized> {
        if close_price <= 0.0 {
            return None;
        }
        let realized = self.book.realize(symbol, side, quantity, close_price)?;
        if realized.fully_closed {
            self.book.clear_peak(symbol, side);
        }
        tracing::info!(
            symbol,
            %side,
            pnl = realized.pnl,
            remaining = realized.remaining,
            "realized pnl"
        );
        self.breaker.record_realized(realized.pnl, Utc::now());
        Some(realized)
    }

    /// Full close issued by the drawdown monitor, bypassing the decision source.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Exchange`] if the venue refuses the close.
    pub async fn emergency_close(
        &self,
        symbol: &str,
        side: Side,
    ) -> Result<Option<Realized>, ExecutionError> {
        let closed_quantity = self.book.quantity(symbol, side);
        let close_price = match self.market.get(symbol).await {
            Ok(data) => data.current_price,
            Err(err) => {
                tracing::warn!(symbol, error = %err, "no price for emergency close pnl");
                0.0
            }
        };

        let ack = self.close_on_venue(symbol, side, 0.0).await?;
        tracing::warn!(symbol, %side, order_id = ?ack.order_id, "emergency close filled");

        let realized = if closed_quantity > 0.0 {
            self.realize(symbol, side, closed_quantity, close_price)
        } else {
            None
        };
        self.book.forget(symbol, side);
        Ok(realized)
    }

    // =========================================================================
    // Protective orders
    // =========================================================================

    /// Replaces the stop-loss of the position on `side`, or of the first
    /// position on `symbol` when the side is not known.
    async fn update_stop_loss(
        &self,
        symbol: &str,
        side: Option<Side>,
        new_stop: f64,
        record: &mut ActionRecord,
    ) -> Result<(), ExecutionError> {
        let data = self.market_data(symbol).await?;
        record.price = data.current_price;

        let live = self.live_positions(symbol).await?;
        let position = Self::select_position(&live, symbol, side)?;
        let side = position.side;
        record.quantity = position.quantity;
        guardrails::check_protective_price(
            ProtectiveKind::StopLoss,
            side,
            new_stop,
            data.current_price,
        )?;
        let cached = self.book.stop_loss(symbol, side);
        guardrails::ensure_stop_tightening(side, cached, new_stop)?;
        if guardrails::stop_unchanged(cached, new_stop) {
            tracing::debug!(symbol, %side, stop = new_stop, "stop-loss unchanged, nothing sent");
            return Ok(());
        }

        let _claim = self.claim_protective(symbol)?;
        self.cancel_protective_orders(symbol).await;
        self.exchange
            .set_stop_loss(&position.symbol, side, position.quantity, new_stop)
            .await
            .map_err(|e| ExecutionError::exchange("set stop-loss", symbol, e))?;

        if let Err(rejection) = self.book.commit_stop_loss(symbol, side, new_stop) {
            tracing::warn!(
                symbol,
                %side,
                stop = new_stop,
                error = %rejection,
                "tighter stop committed meanwhile, re-placing cached orders"
            );
            self.cancel_protective_orders(symbol).await;
            self.restore_cached_orders(symbol, &live, None).await;
            return Err(rejection.into());
        }
        self.restore_cached_orders(symbol, &live, Some((side, ProtectiveKind::StopLoss)))
            .await;

        tracing::info!(symbol, %side, stop = new_stop, price = data.current_price, "stop-loss updated");
        Ok(())
    }

    async fn update_take_profit(
        &self,
        symbol: &str,
        side: Option<Side>,
        new_take_profit: f64,
        record: &mut ActionRecord,
    ) -> Result<(), ExecutionError> {
        let data = self.market_data(symbol).await?;
        record.price = data.current_price;

        let live = self.live_positions(symbol).await?;
        let position = Self::select_position(&live, symbol, side)?;
        let side = position.side;
        record.quantity = position.quantity;
        guardrails::check_protective_price(
            ProtectiveKind::TakeProfit,
            side,
            new_take_profit,
            data.current_price,
        )?;

        let _claim = self.claim_protective(symbol)?;
        self.cancel_protective_orders(symbol).await;
        self.exchange
            .set_take_profit(&position.symbol, side, position.quantity, new_take_profit)
            .await
            .map_err(|e| ExecutionError::exchange("set take-profit", symbol, e))?;
        self.book.set_take_profit(symbol, side, new_take_profit);
        self.restore_cached_orders(symbol, &live, Some((side, ProtectiveKind::TakeProfit)))
            .await;

        tracing::info!(
            symbol,
            %side,
            take_profit = new_take_profit,
            price = data.current_price,
            "take-profit updated"
        );
        Ok(())
    }

    fn claim_protective(&self, symbol: &str) -> Result<ProtectiveClaim<'_>, ExecutionError> {
        self.book.claim_protective(symbol).ok_or_else(|| {
            tracing::warn!(symbol, "protective order update already in flight");
            Rejection::ProtectiveUpdateInFlight {
                symbol: symbol.to_string(),
            }
            .into()
        })
    }

    async fn cancel_protective_orders(&self, symbol: &str) {
        if let Err(err) = self.exchange.cancel_stop_orders(symbol).await {
            tracing::warn!(symbol, error = %err, "failed to cancel resting stop orders, continuing");
        }
    }

    /// Re-places every cached stop and take-profit on `symbol` that the
    /// cancel removed, for both sides, except the order named in `placed`.
    async fn restore_cached_orders(
        &self,
        symbol: &str,
        live: &[PositionSnapshot],
        placed: Option<(Side, ProtectiveKind)>,
    ) {
        for position in live {
            for kind in [ProtectiveKind::StopLoss, ProtectiveKind::TakeProfit] {
                if placed == Some((position.side, kind)) {
                    continue;
                }
                let cached = match kind {
                    ProtectiveKind::StopLoss => self.book.stop_loss(symbol, position.side),
                    ProtectiveKind::TakeProfit => self.book.take_profit(symbol, position.side),
                };
                if let Some(price) = cached {
                    self.restore(symbol, position, kind, price).await;
                }
            }
        }
    }

    async fn restore(
        &self,
        symbol: &str,
        position: &PositionSnapshot,
        kind: ProtectiveKind,
        price: f64,
    ) {
        let result = match kind {
            ProtectiveKind::StopLoss => {
                self.exchange
                    .set_stop_loss(&position.symbol, position.side, position.quantity, price)
                    .await
            }
            ProtectiveKind::TakeProfit => {
                self.exchange
                    .set_take_profit(&position.symbol, position.side, position.quantity, price)
                    .await
            }
        };
        if let Err(err) = result {
            tracing::warn!(symbol, side = %position.side, %kind, price, error = %err, "failed to restore protective order");
        }
    }

    // =========================================================================
    // ROI / ATR ratchet
    // =========================================================================

    /// Runs the ratchet for one live position and dispatches a stop update if
    /// it produces a tighter stop. Failures are logged, never returned.
    pub async fn apply_dynamic_protection(&self, position: &PositionSnapshot) {
        if position.quantity < crate::EPSILON {
            return;
        }
        if protection::floating_gain(position.side, position.entry_price, position.mark_price)
            <= crate::EPSILON
        {
            return;
        }

        let data = match self.market.get(&position.symbol).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(symbol = %position.symbol, error = %err, "ratchet skipped, no market data");
                return;
            }
        };

        let current_stop = self.book.stop_loss(&position.symbol, position.side);
        let Some(target) = protection::ratchet_target(position, current_stop, &data) else {
            return;
        };

        tracing::debug!(
            symbol = %position.symbol,
            "{AUTO_LOCK_TAG} ROI {:.2}% proposes stop {:.6}",
            target.roi_pct,
            target.stop
        );
        let mut record = ActionRecord::pending(Action::UpdateStopLoss, &position.symbol, Utc::now());
        match self
            .update_stop_loss(&position.symbol, Some(position.side), target.stop, &mut record)
            .await
        {
            Ok(()) => tracing::info!(
                symbol = %position.symbol,
                side = %position.side,
                stop = target.stop,
                roi_pct = target.roi_pct,
                "ratchet tightened stop"
            ),
            Err(err) => tracing::warn!(
                symbol = %position.symbol,
                error = %err,
                "ratchet stop update failed"
            ),
        }
    }

    /// Re-reads the live position for `symbol` and runs the ratchet on it.
    pub async fn evaluate_symbol_protection(&self, symbol: &str) {
        let positions = match self.exchange.positions().await {
            Ok(positions) => positions,
            Err(err) => {
                tracing::warn!(symbol, error = %err, "cannot re-evaluate protection");
                return;
            }
        };
        for position in positions
            .iter()
            .filter(|pos| pos.symbol.eq_ignore_ascii_case(symbol))
        {
            self.apply_dynamic_protection(position).await;
        }
    }
}
