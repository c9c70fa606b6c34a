//! Position state cache.
//!
//! Holds what the venue cannot tell us: how much of each position this
//! trader actually opened, at what entry, and which stop-loss/take-profit
//! prices were last accepted. One mutex per cache, never held across an
//! await point.

use crate::guardrails::{self, Rejection};
use crate::EPSILON;
use autotrader_core::Side;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Cache key for a (symbol, side) pair: `BTCUSDT_long`.
#[must_use]
pub fn position_key(symbol: &str, side: Side) -> String {
    format!("{}_{}", symbol.to_ascii_uppercase(), side.as_str())
}

/// Quantity and entry of a position opened by this trader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionMeta {
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
}

/// Result of realizing a (partial) close against cached metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Realized {
    pub pnl: f64,
    pub remaining: f64,
    /// Metadata, stop and take-profit were removed.
    pub fully_closed: bool,
}

#[derive(Debug, Default)]
pub struct PositionBook {
    meta: Mutex<HashMap<String, PositionMeta>>,
    stops: Mutex<HashMap<String, f64>>,
    takes: Mutex<HashMap<String, f64>>,
    peaks: Mutex<HashMap<String, f64>>,
    first_seen: Mutex<HashMap<String, i64>>,
    /// Symbols with a protective order update between cancel and commit.
    in_flight: Mutex<HashSet<String>>,
}

/// Exclusive right to replace the protective orders of one symbol.
/// Released on drop.
#[derive(Debug)]
pub struct ProtectiveClaim<'a> {
    book: &'a PositionBook,
    symbol: String,
}

impl Drop for ProtectiveClaim<'_> {
    fn drop(&mut self) {
        self.book.in_flight.lock().remove(&self.symbol);
    }
}

impl PositionBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Position metadata
    // =========================================================================

    pub fn record_open(&self, symbol: &str, side: Side, entry_price: f64, quantity: f64) {
        self.meta.lock().insert(
            position_key(symbol, side),
            PositionMeta {
                side,
                entry_price,
                quantity,
            },
        );
    }

    #[must_use]
    pub fn meta(&self, symbol: &str, side: Side) -> Option<PositionMeta> {
        self.meta.lock().get(&position_key(symbol, side)).copied()
    }

    /// Cached quantity, or zero when the position was not opened by us.
    #[must_use]
    pub fn quantity(&self, symbol: &str, side: Side) -> f64 {
        self.meta(symbol, side).map_or(0.0, |meta| meta.quantity)
    }

    /// Decrements the cached quantity by `closed_quantity` and computes the
    /// realized PnL at `close_price`.
    ///
    /// Returns `None` when there is no cached metadata or nothing was closed.
    /// When the remainder falls below epsilon the metadata, stop and
    /// take-profit entries are removed together.
    pub fn realize(
        &self,
        symbol: &str,
        side: Side,
        closed_quantity: f64,
        close_price: f64,
    ) -> Option<Realized> {
        if closed_quantity <= 0.0 {
            return None;
        }
        let key = position_key(symbol, side);

        let (entry_price, remaining) = {
            let mut meta = self.meta.lock();
            let entry = meta.get_mut(&key)?;
            let entry_price = entry.entry_price;
            let remaining = entry.quantity - closed_quantity;
            if remaining < EPSILON {
                meta.remove(&key);
            } else {
                entry.quantity = remaining;
            }
            (entry_price, remaining.max(0.0))
        };

        let fully_closed = remaining < EPSILON;
        if fully_closed {
            self.stops.lock().remove(&key);
            self.takes.lock().remove(&key);
        }

        let pnl = match side {
            Side::Long => (close_price - entry_price) * closed_quantity,
            Side::Short => (entry_price - close_price) * closed_quantity,
        };

        Some(Realized {
            pnl,
            remaining,
            fully_closed,
        })
    }

    /// Drops every cache entry for the position.
    pub fn forget(&self, symbol: &str, side: Side) {
        let key = position_key(symbol, side);
        self.meta.lock().remove(&key);
        self.stops.lock().remove(&key);
        self.takes.lock().remove(&key);
        self.peaks.lock().remove(&key);
    }

    // =========================================================================
    // Protective orders
    // =========================================================================

    #[must_use]
    pub fn stop_loss(&self, symbol: &str, side: Side) -> Option<f64> {
        self.stops.lock().get(&position_key(symbol, side)).copied()
    }

    pub fn set_stop_loss(&self, symbol: &str, side: Side, price: f64) {
        self.stops.lock().insert(position_key(symbol, side), price);
    }

    /// Stores `price` only if it is at least as protective as the cached
    /// stop at the moment of writing.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::StopLoosened`] when a tighter stop was committed
    /// after the caller validated against an older value.
    pub fn commit_stop_loss(&self, symbol: &str, side: Side, price: f64) -> Result<(), Rejection> {
        let mut stops = self.stops.lock();
        let key = position_key(symbol, side);
        guardrails::ensure_stop_tightening(side, stops.get(&key).copied(), price)?;
        stops.insert(key, price);
        Ok(())
    }

    /// Claims `symbol` for a cancel-and-replace of its protective orders.
    /// Returns `None` while another update holds the claim.
    #[must_use]
    pub fn claim_protective(&self, symbol: &str) -> Option<ProtectiveClaim<'_>> {
        let symbol = symbol.to_ascii_uppercase();
        if !self.in_flight.lock().insert(symbol.clone()) {
            return None;
        }
        Some(ProtectiveClaim { book: self, symbol })
    }

    #[must_use]
    pub fn take_profit(&self, symbol: &str, side: Side) -> Option<f64> {
        self.takes.lock().get(&position_key(symbol, side)).copied()
    }

    pub fn set_take_profit(&self, symbol: &str, side: Side, price: f64) {
        self.takes.lock().insert(position_key(symbol, side), price);
    }

    // =========================================================================
    // Peak ROI
    // =========================================================================

    #[must_use]
    pub fn peak(&self, symbol: &str, side: Side) -> Option<f64> {
        self.peaks.lock().get(&position_key(symbol, side)).copied()
    }

    /// Raises the stored peak to `roi_pct` if higher; returns the peak after the update.
    pub fn update_peak(&self, symbol: &str, side: Side, roi_pct: f64) -> f64 {
        let mut peaks = self.peaks.lock();
        let peak = peaks.entry(position_key(symbol, side)).or_insert(roi_pct);
        if roi_pct > *peak {
            *peak = roi_pct;
        }
        *peak
    }

    pub fn clear_peak(&self, symbol: &str, side: Side) {
        self.peaks.lock().remove(&position_key(symbol, side));
    }

    /// Copy of the peak cache.
    #[must_use]
    pub fn peaks_snapshot(&self) -> HashMap<String, f64> {
        self.peaks.lock().clone()
    }

    // =========================================================================
    // First-seen timestamps
    // =========================================================================

    /// Returns the first-seen timestamp for the position, recording `now_ms` on first sight.
    pub fn observe(&self, symbol: &str, side: Side, now_ms: i64) -> i64 {
        *self
            .first_seen
            .lock()
            .entry(position_key(symbol, side))
            .or_insert(now_ms)
    }

    /// Drops first-seen entries for positions no longer open.
    pub fn retain_seen(&self, live_keys: &HashSet<String>) {
        self.first_seen.lock().retain(|key, _| live_keys.contains(key));
    }
}
