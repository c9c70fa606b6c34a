//! Wire shapes returned by futures venues.
//!
//! Adapters deserialize responses into these structs, where every field is
//! optional, and convert them into the typed [`Balance`] and
//! [`PositionSnapshot`] the engine works with. Nothing past this module sees
//! loosely typed venue data.

use crate::types::{Balance, OrderAck, PositionSnapshot, Side};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Leverage assumed when a venue omits it.
pub const DEFAULT_LEVERAGE: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VenueError {
    #[error("venue response missing field: {0}")]
    MissingField(&'static str),

    #[error("venue reported no usable balance")]
    NoBalance,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawBalance {
    pub total_wallet_balance: Option<f64>,
    pub wallet_balance: Option<f64>,
    pub balance: Option<f64>,
    pub available_balance: Option<f64>,
    pub total_unrealized_profit: Option<f64>,
}

impl RawBalance {
    /// Wallet balance in preference order: total wallet, wallet, balance,
    /// then available. Only positive values count.
    #[must_use]
    pub fn preferred_wallet(&self) -> Option<f64> {
        [
            self.total_wallet_balance,
            self.wallet_balance,
            self.balance,
            self.available_balance,
        ]
        .into_iter()
        .flatten()
        .find(|value| *value > 0.0)
    }
}

impl TryFrom<RawBalance> for Balance {
    type Error = VenueError;

    fn try_from(raw: RawBalance) -> Result<Self, Self::Error> {
        let wallet = raw.preferred_wallet().ok_or(VenueError::NoBalance)?;
        Ok(Self {
            available: raw.available_balance.unwrap_or(0.0).max(0.0),
            wallet,
            unrealized: raw.total_unrealized_profit.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub entry_price: Option<f64>,
    pub mark_price: Option<f64>,
    /// Signed on one-way venues: negative for shorts.
    pub position_amt: Option<f64>,
    pub leverage: Option<f64>,
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: Option<f64>,
    pub liquidation_price: Option<f64>,
}

impl RawPosition {
    /// Converts into a snapshot. Zero-quantity rows yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`VenueError::MissingField`] when symbol or prices are absent.
    pub fn into_snapshot(self) -> Result<Option<PositionSnapshot>, VenueError> {
        let symbol = self.symbol.ok_or(VenueError::MissingField("symbol"))?;
        let entry_price = self
            .entry_price
            .ok_or(VenueError::MissingField("entryPrice"))?;
        let mark_price = self
            .mark_price
            .ok_or(VenueError::MissingField("markPrice"))?;
        let signed_amt = self
            .position_amt
            .ok_or(VenueError::MissingField("positionAmt"))?;

        let quantity = signed_amt.abs();
        if quantity == 0.0 {
            return Ok(None);
        }

        let side = self
            .side
            .as_deref()
            .and_then(Side::parse)
            .unwrap_or(if signed_amt < 0.0 {
                Side::Short
            } else {
                Side::Long
            });

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let leverage = self
            .leverage
            .filter(|lev| *lev >= 1.0)
            .map_or(DEFAULT_LEVERAGE, |lev| lev as u32);

        let unrealized_pnl_pct = if entry_price > 0.0 {
            match side {
                Side::Long => (mark_price - entry_price) / entry_price * 100.0,
                Side::Short => (entry_price - mark_price) / entry_price * 100.0,
            }
        } else {
            0.0
        };

        Ok(Some(PositionSnapshot {
            symbol,
            side,
            entry_price,
            mark_price,
            quantity,
            leverage,
            unrealized_pnl: self.unrealized_profit.unwrap_or(0.0),
            unrealized_pnl_pct,
            liquidation_price: self.liquidation_price.unwrap_or(0.0),
            margin_used: quantity * mark_price / f64::from(leverage),
            first_seen_ms: None,
        }))
    }
}

/// Converts a list of raw positions, dropping ghosts and logging malformed rows.
#[must_use]
pub fn snapshots_from_raw(raw: Vec<RawPosition>) -> Vec<PositionSnapshot> {
    raw.into_iter()
        .filter_map(|row| match row.into_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed venue position");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawOrderAck {
    pub order_id: Option<order_id::OrderId>,
}

impl From<RawOrderAck> for OrderAck {
    fn from(raw: RawOrderAck) -> Self {
        Self {
            order_id: raw.order_id.map(|id| id.0),
        }
    }
}

pub mod order_id {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Venue order ids arrive either as numbers or strings.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct OrderId(pub String);

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Num(u64),
        Text(String),
    }

    impl<'de> Deserialize<'de> for OrderId {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            Ok(match Wire::deserialize(deserializer)? {
                Wire::Num(n) => Self(n.to_string()),
                Wire::Text(s) => Self(s),
            })
        }
    }

    impl Serialize for OrderId {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_prefers_total_wallet_then_falls_back() {
        let raw: RawBalance = serde_json::from_str(
            r#"{"totalWalletBalance":0,"walletBalance":120.5,"availableBalance":80,"totalUnrealizedProfit":-3.5}"#,
        )
        .unwrap();
        let balance = Balance::try_from(raw).unwrap();
        assert!((balance.wallet - 120.5).abs() < 1e-9);
        assert!((balance.available - 80.0).abs() < 1e-9);
        assert!((balance.equity() - 117.0).abs() < 1e-9);

        let only_available: RawBalance =
            serde_json::from_str(r#"{"availableBalance":42}"#).unwrap();
        assert!((Balance::try_from(only_available).unwrap().wallet - 42.0).abs() < 1e-9);

        assert_eq!(
            Balance::try_from(RawBalance::default()).unwrap_err(),
            VenueError::NoBalance
        );
    }

    #[test]
    fn short_position_is_normalised_from_negative_amount() {
        let raw: RawPosition = serde_json::from_str(
            r#"{"symbol":"ETHUSDT","entryPrice":2000,"markPrice":1900,"positionAmt":-0.5,"unRealizedProfit":50}"#,
        )
        .unwrap();
        let snapshot = raw.into_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.side, Side::Short);
        assert!((snapshot.quantity - 0.5).abs() < 1e-12);
        assert_eq!(snapshot.leverage, DEFAULT_LEVERAGE);
        assert!((snapshot.unrealized_pnl_pct - 5.0).abs() < 1e-9);
        assert!((snapshot.margin_used - 95.0).abs() < 1e-9);
    }

    #[test]
    fn ghost_and_malformed_rows_are_dropped() {
        let rows = vec![
            RawPosition {
                symbol: Some("BTCUSDT".into()),
                side: Some("LONG".into()),
                entry_price: Some(100.0),
                mark_price: Some(101.0),
                position_amt: Some(0.0),
                ..RawPosition::default()
            },
            RawPosition {
                symbol: None,
                ..RawPosition::default()
            },
            RawPosition {
                symbol: Some("SOLUSDT".into()),
                side: Some("long".into()),
                entry_price: Some(100.0),
                mark_price: Some(110.0),
                position_amt: Some(2.0),
                leverage: Some(5.0),
                ..RawPosition::default()
            },
        ];
        let snapshots = snapshots_from_raw(rows);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].symbol, "SOLUSDT");
        assert_eq!(snapshots[0].leverage, 5);
    }

    #[test]
    fn order_ids_accept_numbers_and_strings() {
        let numeric: RawOrderAck = serde_json::from_str(r#"{"orderId":12345}"#).unwrap();
        assert_eq!(OrderAck::from(numeric).order_id.as_deref(), Some("12345"));
        let text: RawOrderAck = serde_json::from_str(r#"{"orderId":"abc"}"#).unwrap();
        assert_eq!(OrderAck::from(text).order_id.as_deref(), Some("abc"));
    }
}
