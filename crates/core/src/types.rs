use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Rationale prefix for take-profit decisions synthesized by the engine.
pub const AUTO_TAKE_PROFIT_TAG: &str = "[auto_tp]";
/// Rationale prefix for stop-loss decisions synthesized by the engine.
pub const AUTO_STOP_LOSS_TAG: &str = "[auto_sl]";
/// Rationale prefix for stop updates dispatched by the ROI/ATR ratchet.
pub const AUTO_LOCK_TAG: &str = "[auto_lock]";

/// Direction of a futures position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    #[must_use]
    pub const fn is_long(self) -> bool {
        matches!(self, Self::Long)
    }

    /// Parses a venue side string case-insensitively (`LONG`, `long`, `Short`, ...).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("long") {
            Some(Self::Long)
        } else if raw.eq_ignore_ascii_case("short") {
            Some(Self::Short)
        } else {
            None
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action tag carried by a [`Decision`].
///
/// Unrecognised tags are preserved verbatim in [`Action::Unknown`] so the
/// execution layer can report them instead of failing deserialization of the
/// whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    UpdateStopLoss,
    UpdateTakeProfit,
    PartialClose,
    Hold,
    Wait,
    Unknown(String),
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
            Self::UpdateStopLoss => "update_stop_loss",
            Self::UpdateTakeProfit => "update_take_profit",
            Self::PartialClose => "partial_close",
            Self::Hold => "hold",
            Self::Wait => "wait",
            Self::Unknown(raw) => raw,
        }
    }

    /// Execution priority within a cycle; lower runs first.
    #[must_use]
    pub const fn priority(&self) -> u32 {
        match self {
            Self::CloseLong | Self::CloseShort | Self::PartialClose => 1,
            Self::UpdateStopLoss | Self::UpdateTakeProfit => 2,
            Self::OpenLong | Self::OpenShort => 3,
            Self::Hold | Self::Wait => 4,
            Self::Unknown(_) => 999,
        }
    }

    /// Side opened by this action, if it is an open.
    #[must_use]
    pub const fn open_side(&self) -> Option<Side> {
        match self {
            Self::OpenLong => Some(Side::Long),
            Self::OpenShort => Some(Side::Short),
            _ => None,
        }
    }

    /// Side closed by this action, if it is a full close.
    #[must_use]
    pub const fn close_side(&self) -> Option<Side> {
        match self {
            Self::CloseLong => Some(Side::Long),
            Self::CloseShort => Some(Side::Short),
            _ => None,
        }
    }
}

impl From<String> for Action {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "open_long" => Self::OpenLong,
            "open_short" => Self::OpenShort,
            "close_long" => Self::CloseLong,
            "close_short" => Self::CloseShort,
            "update_stop_loss" => Self::UpdateStopLoss,
            "update_take_profit" => Self::UpdateTakeProfit,
            "partial_close" => Self::PartialClose,
            "hold" => Self::Hold,
            "wait" => Self::Wait,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<&str> for Action {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One intended action, produced by the decision source or synthesized by
/// the engine's auto-protection pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub symbol: String,
    pub action: Action,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub position_size_usd: f64,
    #[serde(default)]
    pub risk_usd: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
    #[serde(default)]
    pub new_stop_loss: f64,
    #[serde(default)]
    pub new_take_profit: f64,
    #[serde(default)]
    pub close_percentage: f64,
    #[serde(default)]
    pub confidence: u8,
    #[serde(default)]
    pub reasoning: String,
}

impl Decision {
    /// Creates a decision with every numeric parameter zeroed.
    #[must_use]
    pub fn new(symbol: impl Into<String>, action: Action) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            leverage: 0,
            position_size_usd: 0.0,
            risk_usd: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            new_stop_loss: 0.0,
            new_take_profit: 0.0,
            close_percentage: 0.0,
            confidence: 0,
            reasoning: String::new(),
        }
    }

    #[must_use]
    pub fn update_stop_loss(symbol: impl Into<String>, price: f64, reasoning: String) -> Self {
        let mut decision = Self::new(symbol, Action::UpdateStopLoss);
        decision.new_stop_loss = price;
        decision.reasoning = reasoning;
        decision
    }

    #[must_use]
    pub fn update_take_profit(symbol: impl Into<String>, price: f64, reasoning: String) -> Self {
        let mut decision = Self::new(symbol, Action::UpdateTakeProfit);
        decision.new_take_profit = price;
        decision.reasoning = reasoning;
        decision
    }
}

/// Account balance as reported by the venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Balance {
    pub available: f64,
    pub wallet: f64,
    pub unrealized: f64,
}

impl Balance {
    /// Total equity = wallet balance + unrealized PnL.
    #[must_use]
    pub fn equity(&self) -> f64 {
        self.wallet + self.unrealized
    }

    /// Equity used for sizing: wallet + unrealized when the wallet is known,
    /// otherwise the available balance.
    #[must_use]
    pub fn sizing_equity(&self) -> f64 {
        if self.wallet > 0.0 {
            self.equity()
        } else {
            self.available
        }
    }
}

/// Live position as read from the venue for a single cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
    /// Milliseconds since epoch at which the engine first saw this position.
    #[serde(default)]
    pub first_seen_ms: Option<i64>,
}

impl PositionSnapshot {
    /// Leveraged ROI% at the current mark price.
    #[must_use]
    pub fn roi_pct(&self) -> f64 {
        roi_pct(self.side, self.entry_price, self.mark_price, self.leverage)
    }
}

/// Leveraged percentage return: `((mark - entry) / entry) * leverage * 100`,
/// sign-flipped for shorts. Leverage of zero is treated as 1x.
#[must_use]
pub fn roi_pct(side: Side, entry_price: f64, mark_price: f64, leverage: u32) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    let leverage = f64::from(leverage.max(1));
    let change = match side {
        Side::Long => (mark_price - entry_price) / entry_price,
        Side::Short => (entry_price - mark_price) / entry_price,
    };
    change * leverage * 100.0
}

/// Venue acknowledgement of an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrderAck {
    pub order_id: Option<String>,
}

/// Medium-horizon (e.g. 15m) indicator context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MidTermContext {
    pub atr14: Option<f64>,
    pub ema20: Option<f64>,
    pub rsi7: Option<f64>,
}

/// Longer-horizon (e.g. 1h) indicator context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LongerTermContext {
    pub atr14: Option<f64>,
}

/// Short-horizon (e.g. 3m) indicator series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IntradaySeries {
    #[serde(default)]
    pub rsi7_values: Vec<f64>,
}

/// Market data for one symbol as returned by the market-data collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MarketData {
    pub symbol: String,
    pub current_price: f64,
    pub current_macd: Option<f64>,
    #[serde(default)]
    pub mid_term: Option<MidTermContext>,
    #[serde(default)]
    pub longer_term: Option<LongerTermContext>,
    #[serde(default)]
    pub intraday: Option<IntradaySeries>,
}

impl MarketData {
    /// Mid-term ATR14 when present and positive.
    #[must_use]
    pub fn mid_atr(&self) -> Option<f64> {
        self.mid_term
            .as_ref()
            .and_then(|ctx| ctx.atr14)
            .filter(|atr| *atr > 0.0)
    }

    /// Mid-term RSI7 when present and positive.
    #[must_use]
    pub fn mid_rsi(&self) -> Option<f64> {
        self.mid_term
            .as_ref()
            .and_then(|ctx| ctx.rsi7)
            .filter(|rsi| *rsi > 0.0)
    }

    /// Longer-term ATR14 when present and positive.
    #[must_use]
    pub fn long_atr(&self) -> Option<f64> {
        self.longer_term
            .as_ref()
            .and_then(|ctx| ctx.atr14)
            .filter(|atr| *atr > 0.0)
    }
}

/// A symbol offered to the decision source, tagged with where it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateSymbol {
    pub symbol: String,
    pub sources: Vec<String>,
}

/// Account view handed to the decision source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AccountInfo {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

/// Leverage policy the decision source is asked to respect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeveragePolicy {
    pub btc_eth: u32,
    pub altcoin: u32,
}

/// Rolling performance over the last N decision records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub sharpe_ratio: Option<f64>,
}

/// Everything the decision source sees for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingContext {
    pub current_time: DateTime<Utc>,
    pub runtime_minutes: i64,
    pub call_count: u64,
    pub leverage: LeveragePolicy,
    pub account: AccountInfo,
    pub positions: Vec<PositionSnapshot>,
    pub candidates: Vec<CandidateSymbol>,
    pub performance: Option<PerformanceSummary>,
    #[serde(default)]
    pub market_data: HashMap<String, MarketData>,
}

impl TradingContext {
    /// Best available price for a symbol: fresh market data, else the supplied fallback.
    #[must_use]
    pub fn price_for(&self, symbol: &str, fallback: f64) -> f64 {
        self.market_data
            .get(symbol)
            .map(|data| data.current_price)
            .filter(|price| *price > 0.0)
            .unwrap_or(fallback)
    }

    /// Side of the open position for `symbol`, if any.
    #[must_use]
    pub fn position_side(&self, symbol: &str) -> Option<Side> {
        self.positions
            .iter()
            .find(|pos| pos.symbol.eq_ignore_ascii_case(symbol) && pos.quantity > 0.0)
            .map(|pos| pos.side)
    }
}

/// Prompt customisation forwarded verbatim to the decision source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PromptOptions {
    pub template: String,
    pub custom_prompt: Option<String>,
    pub override_base: bool,
}

/// Output of one decision-source call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DecisionBundle {
    pub system_prompt: String,
    pub user_prompt: String,
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_known_and_unknown_tags() {
        let decision: Decision = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","action":"open_long","leverage":5,"confidence":85}"#,
        )
        .unwrap();
        assert_eq!(decision.action, Action::OpenLong);
        assert_eq!(decision.leverage, 5);

        let odd: Decision =
            serde_json::from_str(r#"{"symbol":"BTCUSDT","action":"flip_position"}"#).unwrap();
        assert_eq!(odd.action, Action::Unknown("flip_position".to_string()));
        assert_eq!(odd.action.priority(), 999);

        let json = serde_json::to_string(&odd).unwrap();
        assert!(json.contains("\"flip_position\""));
    }

    #[test]
    fn closes_outrank_updates_outrank_opens() {
        assert!(Action::CloseLong.priority() < Action::UpdateStopLoss.priority());
        assert!(Action::PartialClose.priority() < Action::OpenLong.priority());
        assert!(Action::UpdateTakeProfit.priority() < Action::OpenShort.priority());
        assert!(Action::OpenShort.priority() < Action::Wait.priority());
    }

    #[test]
    fn roi_is_leveraged_and_side_aware() {
        assert!((roi_pct(Side::Long, 100.0, 102.0, 10) - 20.0).abs() < 1e-9);
        assert!((roi_pct(Side::Short, 100.0, 102.0, 10) + 20.0).abs() < 1e-9);
        // zero leverage behaves as 1x
        assert!((roi_pct(Side::Long, 100.0, 101.0, 0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn side_parse_is_case_insensitive() {
        assert_eq!(Side::parse("LONG"), Some(Side::Long));
        assert_eq!(Side::parse("short"), Some(Side::Short));
        assert_eq!(Side::parse("both"), None);
    }

    #[test]
    fn indicator_accessors_treat_non_positive_as_missing() {
        let data = MarketData {
            symbol: "ETHUSDT".to_string(),
            current_price: 2000.0,
            current_macd: Some(0.1),
            mid_term: Some(MidTermContext {
                atr14: Some(0.0),
                ema20: Some(1990.0),
                rsi7: Some(55.0),
            }),
            longer_term: None,
            intraday: None,
        };
        assert_eq!(data.mid_atr(), None);
        assert_eq!(data.mid_rsi(), Some(55.0));
        assert_eq!(data.long_atr(), None);
    }
}
