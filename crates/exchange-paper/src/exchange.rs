use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use autotrader_core::venue::snapshots_from_raw;
use autotrader_core::{
    Balance, ExchangeAdapter, OrderAck, PositionSnapshot, RawOrderAck, RawPosition, Side,
};
use parking_lot::Mutex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;

/// Venue operations that can be made to fail once, for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Balance,
    Positions,
    Open,
    Close,
    SetStopLoss,
    SetTakeProfit,
    CancelStopOrders,
    SetMarginMode,
}

/// A resting stop-loss or take-profit order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveOrder {
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub take_profit: bool,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    entry_price: f64,
    quantity: f64,
    leverage: u32,
}

#[derive(Debug, Default)]
struct PaperState {
    wallet: f64,
    positions: HashMap<(String, Side), PaperPosition>,
    marks: HashMap<String, f64>,
    orders: HashMap<String, Vec<ProtectiveOrder>>,
    margin_modes: HashMap<String, bool>,
    failures: HashMap<PaperOp, String>,
    calls: HashMap<PaperOp, usize>,
    next_order_id: u64,
}

impl PaperState {
    fn enter(&mut self, op: PaperOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.remove(&op) {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    fn mark(&self, symbol: &str) -> Result<f64> {
        self.marks
            .get(symbol)
            .copied()
            .filter(|price| *price > 0.0)
            .ok_or_else(|| anyhow!("no mark price for {symbol}"))
    }

    fn order_ack(&mut self) -> OrderAck {
        self.next_order_id += 1;
        RawOrderAck {
            order_id: Some(autotrader_core::venue::order_id::OrderId(format!(
                "paper-{}",
                self.next_order_id
            ))),
        }
        .into()
    }

    fn unrealized(&self) -> f64 {
        self.positions
            .iter()
            .map(|((symbol, side), pos)| {
                let mark = self.marks.get(symbol).copied().unwrap_or(pos.entry_price);
                signed_pnl(*side, pos.entry_price, mark, pos.quantity)
            })
            .sum()
    }

    fn margin_used(&self) -> f64 {
        self.positions
            .values()
            .map(|pos| pos.quantity * pos.entry_price / f64::from(pos.leverage.max(1)))
            .sum()
    }

    fn available(&self) -> f64 {
        (self.wallet + self.unrealized() - self.margin_used()).max(0.0)
    }
}

fn signed_pnl(side: Side, entry: f64, exit: f64, quantity: f64) -> f64 {
    match side {
        Side::Long => (exit - entry) * quantity,
        Side::Short => (entry - exit) * quantity,
    }
}

/// Simulated futures venue.
///
/// Market fills execute at the current mark price moved against the taker by
/// `slippage_bps`; commission is charged on notional at fill.
pub struct PaperExchange {
    commission_rate: Decimal,
    slippage_bps: Decimal,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    /// Creates a paper venue holding `wallet` in quote currency.
    ///
    /// # Arguments
    ///
    /// * `commission_rate` - Taker fee as a decimal (e.g., 0.0004 = 0.04%)
    /// * `slippage_bps` - Slippage in basis points (e.g., 5.0 = 0.05%)
    #[must_use]
    pub fn new(wallet: f64, commission_rate: f64, slippage_bps: f64) -> Self {
        Self {
            commission_rate: Decimal::from_f64(commission_rate).unwrap_or(Decimal::ZERO),
            slippage_bps: Decimal::from_f64(slippage_bps).unwrap_or(Decimal::ZERO),
            state: Mutex::new(PaperState {
                wallet,
                ..PaperState::default()
            }),
        }
    }

    /// Frictionless venue: no commission, no slippage.
    #[must_use]
    pub fn frictionless(wallet: f64) -> Self {
        Self::new(wallet, 0.0, 0.0)
    }

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    /// Places a position directly, without fills or fees.
    pub fn seed_position(
        &self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        quantity: f64,
        leverage: u32,
    ) {
        let mut state = self.state.lock();
        state.marks.entry(symbol.to_string()).or_insert(entry_price);
        state.positions.insert(
            (symbol.to_string(), side),
            PaperPosition {
                entry_price,
                quantity,
                leverage: leverage.max(1),
            },
        );
    }

    /// Seeds positions from venue-shaped rows (see [`RawPosition`]).
    /// Malformed and zero-quantity rows are skipped. Returns how many were placed.
    pub fn seed_from_raw(&self, rows: Vec<RawPosition>) -> usize {
        let snapshots = snapshots_from_raw(rows);
        for snapshot in &snapshots {
            self.seed_position(
                &snapshot.symbol,
                snapshot.side,
                snapshot.entry_price,
                snapshot.quantity,
                snapshot.leverage,
            );
            self.set_mark_price(&snapshot.symbol, snapshot.mark_price);
        }
        snapshots.len()
    }

    /// Reads a JSON array of venue position rows and seeds them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON array of rows.
    pub fn seed_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read positions file {}", path.display()))?;
        let rows: Vec<RawPosition> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse positions file {}", path.display()))?;
        Ok(self.seed_from_raw(rows))
    }

    /// Makes the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: PaperOp, message: impl Into<String>) {
        self.state.lock().failures.insert(op, message.into());
    }

    /// Number of times `op` has been called, failures included.
    #[must_use]
    pub fn calls(&self, op: PaperOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn wallet(&self) -> f64 {
        self.state.lock().wallet
    }

    /// Resting protective orders for `symbol`.
    #[must_use]
    pub fn protective_orders(&self, symbol: &str) -> Vec<ProtectiveOrder> {
        self.state
            .lock()
            .orders
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn margin_mode(&self, symbol: &str) -> Option<bool> {
        self.state.lock().margin_modes.get(symbol).copied()
    }

    fn fill_price(&self, mark: f64, buying: bool) -> f64 {
        let Some(price) = Decimal::from_f64(mark) else {
            return mark;
        };
        let slippage = price * self.slippage_bps / Decimal::from(10_000);
        let filled = if buying {
            price + slippage
        } else {
            price - slippage
        };
        filled.to_f64().unwrap_or(mark)
    }

    fn commission(&self, price: f64, quantity: f64) -> f64 {
        match (Decimal::from_f64(price), Decimal::from_f64(quantity)) {
            (Some(price), Some(quantity)) => (price * quantity * self.commission_rate)
                .to_f64()
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn open(&self, symbol: &str, side: Side, quantity: f64, leverage: u32) -> Result<OrderAck> {
        if quantity <= 0.0 || !quantity.is_finite() {
            bail!("invalid order quantity {quantity}");
        }
        let mut state = self.state.lock();
        state.enter(PaperOp::Open)?;

        let mark = state.mark(symbol)?;
        let price = self.fill_price(mark, side.is_long());
        let leverage = leverage.max(1);
        let margin = quantity * price / f64::from(leverage);
        let fee = self.commission(price, quantity);
        let available = state.available();
        if margin + fee > available {
            bail!("insufficient margin: need {:.2}, available {available:.2}", margin + fee);
        }

        state.wallet -= fee;
        let key = (symbol.to_string(), side);
        let position = state.positions.entry(key).or_insert(PaperPosition {
            entry_price: price,
            quantity: 0.0,
            leverage,
        });
        let total = position.quantity + quantity;
        position.entry_price = (position.entry_price * position.quantity + price * quantity) / total;
        position.quantity = total;
        position.leverage = leverage;

        tracing::debug!(symbol, side = %side, quantity, price, fee, "paper open filled");
        Ok(state.order_ack())
    }

    fn close(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck> {
        let mut state = self.state.lock();
        state.enter(PaperOp::Close)?;

        let key = (symbol.to_string(), side);
        let held = state
            .positions
            .get(&key)
            .map(|pos| (pos.entry_price, pos.quantity))
            .ok_or_else(|| anyhow!("no {side} position for {symbol}"))?;
        let (entry_price, held_qty) = held;
        let close_qty = if quantity <= 0.0 {
            held_qty
        } else {
            quantity.min(held_qty)
        };

        let mark = state.mark(symbol)?;
        let price = self.fill_price(mark, !side.is_long());
        let fee = self.commission(price, close_qty);
        let pnl = signed_pnl(side, entry_price, price, close_qty);
        state.wallet += pnl - fee;

        let remaining = held_qty - close_qty;
        if remaining <= 1e-9 {
            state.positions.remove(&key);
            if let Some(orders) = state.orders.get_mut(symbol) {
                orders.retain(|order| order.side != side);
            }
        } else if let Some(position) = state.positions.get_mut(&key) {
            position.quantity = remaining;
        }

        tracing::debug!(symbol, side = %side, quantity = close_qty, price, pnl, fee, "paper close filled");
        Ok(state.order_ack())
    }

    fn place_protective(
        &self,
        op: PaperOp,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(op)?;
        if price <= 0.0 {
            bail!("invalid trigger price {price}");
        }
        if !state.positions.contains_key(&(symbol.to_string(), side)) {
            bail!("no {side} position for {symbol}");
        }
        state
            .orders
            .entry(symbol.to_string())
            .or_default()
            .push(ProtectiveOrder {
                side,
                quantity,
                price,
                take_profit: op == PaperOp::SetTakeProfit,
            });
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn balance(&self) -> Result<Balance> {
        let mut state = self.state.lock();
        state.enter(PaperOp::Balance)?;
        Ok(Balance {
            available: state.available(),
            wallet: state.wallet,
            unrealized: state.unrealized(),
        })
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>> {
        let rows: Vec<RawPosition> = {
            let mut state = self.state.lock();
            state.enter(PaperOp::Positions)?;
            state
                .positions
                .iter()
                .map(|((symbol, side), pos)| {
                    let mark = state.marks.get(symbol).copied().unwrap_or(pos.entry_price);
                    let lev = f64::from(pos.leverage);
                    let liquidation = match side {
                        Side::Long => pos.entry_price * (1.0 - 1.0 / lev),
                        Side::Short => pos.entry_price * (1.0 + 1.0 / lev),
                    };
                    RawPosition {
                        symbol: Some(symbol.clone()),
                        side: Some(side.as_str().to_string()),
                        entry_price: Some(pos.entry_price),
                        mark_price: Some(mark),
                        position_amt: Some(match side {
                            Side::Long => pos.quantity,
                            Side::Short => -pos.quantity,
                        }),
                        leverage: Some(lev),
                        unrealized_profit: Some(signed_pnl(
                            *side,
                            pos.entry_price,
                            mark,
                            pos.quantity,
                        )),
                        liquidation_price: Some(liquidation),
                    }
                })
                .collect()
        };
        let mut snapshots = snapshots_from_raw(rows);
        snapshots.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| b.side.is_long().cmp(&a.side.is_long()))
        });
        Ok(snapshots)
    }

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        self.open(symbol, Side::Long, quantity, leverage)
    }

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        self.open(symbol, Side::Short, quantity, leverage)
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        self.close(symbol, Side::Long, quantity)
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        self.close(symbol, Side::Short, quantity)
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<()> {
        self.place_protective(PaperOp::SetStopLoss, symbol, side, quantity, price)
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<()> {
        self.place_protective(PaperOp::SetTakeProfit, symbol, side, quantity, price)
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(PaperOp::CancelStopOrders)?;
        state.orders.remove(symbol);
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(PaperOp::SetMarginMode)?;
        state.margin_modes.insert(symbol.to_string(), cross);
        Ok(())
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_charges_commission_and_slippage() {
        let venue = PaperExchange::new(1_000.0, 0.001, 10.0);
        venue.set_mark_price("BTCUSDT", 50_000.0);

        venue.open_long("BTCUSDT", 0.01, 10).await.unwrap();

        let positions = venue.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!(positions[0].entry_price > 50_000.0);
        assert_eq!(positions[0].leverage, 10);
        // fee = 50_050 * 0.01 * 0.001
        assert!((venue.wallet() - (1_000.0 - 0.5005)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn close_realizes_pnl_into_wallet() {
        let venue = PaperExchange::frictionless(1_000.0);
        venue.seed_position("ETHUSDT", Side::Short, 3_000.0, 1.0, 5);
        venue.set_mark_price("ETHUSDT", 2_900.0);

        venue.close_short("ETHUSDT", 0.4).await.unwrap();
        assert!((venue.wallet() - 1_040.0).abs() < 1e-9);

        venue.close_short("ETHUSDT", 0.0).await.unwrap();
        assert!((venue.wallet() - 1_100.0).abs() < 1e-9);
        assert!(venue.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_open_beyond_available_margin() {
        let venue = PaperExchange::frictionless(100.0);
        venue.set_mark_price("BTCUSDT", 50_000.0);

        let err = venue.open_long("BTCUSDT", 1.0, 10).await.unwrap_err();
        assert!(err.to_string().contains("insufficient margin"));
    }

    #[tokio::test]
    async fn cancel_clears_protective_orders() {
        let venue = PaperExchange::frictionless(1_000.0);
        venue.seed_position("BTCUSDT", Side::Long, 50_000.0, 0.01, 10);

        venue
            .set_stop_loss("BTCUSDT", Side::Long, 0.01, 49_000.0)
            .await
            .unwrap();
        venue
            .set_take_profit("BTCUSDT", Side::Long, 0.01, 52_000.0)
            .await
            .unwrap();
        assert_eq!(venue.protective_orders("BTCUSDT").len(), 2);

        venue.cancel_stop_orders("BTCUSDT").await.unwrap();
        assert!(venue.protective_orders("BTCUSDT").is_empty());
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let venue = PaperExchange::frictionless(1_000.0);
        venue.fail_next(PaperOp::Balance, "venue timeout");

        let err = venue.balance().await.unwrap_err();
        assert_eq!(err.to_string(), "venue timeout");
        assert!(venue.balance().await.is_ok());
        assert_eq!(venue.calls(PaperOp::Balance), 2);
    }

    #[test]
    fn seeds_from_signed_venue_rows() {
        let rows: Vec<RawPosition> = serde_json::from_str(
            r#"[
                {"symbol":"SOLUSDT","entryPrice":150.0,"markPrice":155.0,"positionAmt":-2.0,"leverage":3.0},
                {"symbol":"DOGEUSDT","entryPrice":0.1,"markPrice":0.1,"positionAmt":0.0},
                {"entryPrice":1.0,"markPrice":1.0,"positionAmt":1.0}
            ]"#,
        )
        .unwrap();

        let venue = PaperExchange::frictionless(1_000.0);
        assert_eq!(venue.seed_from_raw(rows), 1);
    }

    #[tokio::test]
    async fn reported_positions_use_typed_schema() {
        let venue = PaperExchange::frictionless(1_000.0);
        venue.seed_position("SOLUSDT", Side::Short, 150.0, 2.0, 3);
        venue.set_mark_price("SOLUSDT", 140.0);

        let positions = venue.positions().await.unwrap();
        assert_eq!(positions[0].side, Side::Short);
        assert!((positions[0].quantity - 2.0).abs() < 1e-12);
        assert!((positions[0].unrealized_pnl - 20.0).abs() < 1e-9);
    }
}
