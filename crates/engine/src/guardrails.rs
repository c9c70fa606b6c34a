//! Pre-trade validation.
//!
//! Everything here is a pure function of its inputs; rejections are values,
//! not panics, and never abort a cycle.

use crate::EPSILON;
use autotrader_core::{Decision, MarketData, PositionSnapshot, RiskPolicy, Side};
use thiserror::Error;

/// A decision refused by a guardrail.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Rejection {
    #[error("confidence {confidence} below minimum {minimum}")]
    LowConfidence { confidence: u8, minimum: u8 },

    #[error("{symbol} already has an open {side} position; close it first")]
    DuplicatePosition { symbol: String, side: Side },

    #[error("mid-term indicators not ready for {symbol}")]
    IndicatorsNotReady { symbol: String },

    #[error("mid-term RSI {rsi:.2} outside the {side} entry band (limit {limit:.2})")]
    RsiOutOfBand { side: Side, rsi: f64, limit: f64 },

    #[error("price {price:.4} beyond EMA band {bound:.4} for {side} entry")]
    PriceBeyondEmaBand { side: Side, price: f64, bound: f64 },

    #[error("MACD {macd:.4} against {side} momentum")]
    MacdAgainstTrend { side: Side, macd: f64 },

    #[error("RSI slope {previous:.2} -> {last:.2} does not confirm {side}")]
    RsiSlopeAgainstTrend { side: Side, previous: f64, last: f64 },

    #[error("leverage must be greater than zero")]
    MissingLeverage,

    #[error("available balance {available:.2} cannot cover safety buffer {buffer:.2}")]
    BalanceBelowBuffer { available: f64, buffer: f64 },

    #[error("max notional {max_notional:.2} below venue minimum {min_notional:.2}")]
    NotionalBelowMinimum { max_notional: f64, min_notional: f64 },

    #[error("stop distance cannot be computed: no ATR or price")]
    StopDistanceUnavailable,

    #[error("stop distance {distance:.4} exceeds allowed {allowed:.4}")]
    StopTooFar { distance: f64, allowed: f64 },

    #[error("margin {margin:.2} + fee {fee:.2} exceeds available {available:.2}")]
    InsufficientMargin {
        margin: f64,
        fee: f64,
        available: f64,
    },

    #[error("{side} stop {proposed:.6} would loosen existing stop {previous:.6}")]
    StopLoosened {
        side: Side,
        previous: f64,
        proposed: f64,
    },

    #[error("another protective order update for {symbol} is in flight")]
    ProtectiveUpdateInFlight { symbol: String },

    #[error("{kind} {price:.6} is on the wrong side of current price {current:.6} for a {side}")]
    InvalidProtectivePrice {
        kind: ProtectiveKind,
        side: Side,
        price: f64,
        current: f64,
    },

    #[error("close percentage {0} must be within (0, 100]")]
    InvalidClosePercentage(f64),

    #[error("close quantity rounds to zero (step {step})")]
    QuantityBelowStep { step: f64 },

    #[error("position size must be greater than zero")]
    EmptyPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectiveKind {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ProtectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => f.write_str("stop-loss"),
            Self::TakeProfit => f.write_str("take-profit"),
        }
    }
}

/// Confidence gate for opens.
///
/// # Errors
///
/// Returns [`Rejection::LowConfidence`] below the policy minimum.
pub fn check_confidence(decision: &Decision, policy: &RiskPolicy) -> Result<(), Rejection> {
    if decision.confidence < policy.min_confidence {
        return Err(Rejection::LowConfidence {
            confidence: decision.confidence,
            minimum: policy.min_confidence,
        });
    }
    Ok(())
}

/// Refuses to stack onto an existing position of the same symbol and side.
///
/// # Errors
///
/// Returns [`Rejection::DuplicatePosition`] if one is open.
pub fn check_duplicate(
    positions: &[PositionSnapshot],
    symbol: &str,
    side: Side,
) -> Result<(), Rejection> {
    let exists = positions
        .iter()
        .any(|pos| pos.symbol.eq_ignore_ascii_case(symbol) && pos.side == side && pos.quantity > 0.0);
    if exists {
        return Err(Rejection::DuplicatePosition {
            symbol: symbol.to_string(),
            side,
        });
    }
    Ok(())
}

/// Mid-term RSI and EMA band filter. Fails closed when indicators are missing.
///
/// # Errors
///
/// Returns a [`Rejection`] when indicators are absent or the entry chases price.
pub fn check_mid_term(data: &MarketData, side: Side, policy: &RiskPolicy) -> Result<(), Rejection> {
    let not_ready = || Rejection::IndicatorsNotReady {
        symbol: data.symbol.clone(),
    };
    let mid = data.mid_term.as_ref().ok_or_else(not_ready)?;
    let (atr, ema, rsi) = match (mid.atr14, mid.ema20, mid.rsi7) {
        (Some(atr), Some(ema), Some(rsi)) if atr > 0.0 && ema != 0.0 && rsi > 0.0 => {
            (atr, ema, rsi)
        }
        _ => return Err(not_ready()),
    };

    let price = data.current_price;
    match side {
        Side::Long => {
            if rsi > policy.long_rsi_ceiling {
                return Err(Rejection::RsiOutOfBand {
                    side,
                    rsi,
                    limit: policy.long_rsi_ceiling,
                });
            }
            let upper = ema + policy.ema_atr_band * atr;
            if price > upper {
                return Err(Rejection::PriceBeyondEmaBand {
                    side,
                    price,
                    bound: upper,
                });
            }
        }
        Side::Short => {
            if rsi < policy.short_rsi_floor {
                return Err(Rejection::RsiOutOfBand {
                    side,
                    rsi,
                    limit: policy.short_rsi_floor,
                });
            }
            let lower = ema - policy.ema_atr_band * atr;
            if price < lower {
                return Err(Rejection::PriceBeyondEmaBand {
                    side,
                    price,
                    bound: lower,
                });
            }
        }
    }
    Ok(())
}

/// Short-horizon MACD and RSI slope must agree with the direction.
///
/// # Errors
///
/// Returns a [`Rejection`] when MACD is missing or momentum runs the other way.
pub fn check_momentum(data: &MarketData, side: Side, policy: &RiskPolicy) -> Result<(), Rejection> {
    let macd = data.current_macd.ok_or_else(|| Rejection::IndicatorsNotReady {
        symbol: data.symbol.clone(),
    })?;

    let against = match side {
        Side::Long => macd < -EPSILON,
        Side::Short => macd > EPSILON,
    };
    if against {
        return Err(Rejection::MacdAgainstTrend { side, macd });
    }

    if let Some(series) = data.intraday.as_ref() {
        if let [.., previous, last] = series.rsi7_values.as_slice() {
            let slope = last - previous;
            let against = match side {
                Side::Long => slope < -policy.rsi_slope_tolerance,
                Side::Short => slope > policy.rsi_slope_tolerance,
            };
            if against {
                return Err(Rejection::RsiSlopeAgainstTrend {
                    side,
                    previous: *previous,
                    last: *last,
                });
            }
        }
    }
    Ok(())
}

/// Largest stop distance tolerated for a fresh entry: the widest of the
/// long-horizon ATR, 1.5x mid-horizon ATR, and 1.5% of price.
///
/// # Errors
///
/// Returns [`Rejection::StopDistanceUnavailable`] when none can be computed.
pub fn allowed_stop_distance(data: &MarketData, policy: &RiskPolicy) -> Result<f64, Rejection> {
    let candidates = [
        data.long_atr(),
        data.mid_atr().map(|atr| atr * policy.max_stop_mid_atr_multiple),
        (data.current_price > 0.0).then(|| data.current_price * policy.max_stop_distance_pct),
    ];
    let allowed = candidates.into_iter().flatten().fold(0.0_f64, f64::max);
    if allowed <= 0.0 {
        return Err(Rejection::StopDistanceUnavailable);
    }
    Ok(allowed)
}

/// Position size after balance, equity and risk clamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sizing {
    pub position_size_usd: f64,
    pub risk_usd: f64,
}

/// Fits a requested open to the account.
///
/// Order of operations: safety buffer and notional floor, stop distance,
/// equity caps (small-account or soft), the leverage hard cap, the 80%
/// risk cap, then risk normalisation toward the equity target. Each size
/// clamp scales `risk_usd` by the same ratio.
///
/// # Errors
///
/// Returns a [`Rejection`] when the account cannot support the trade.
pub fn fit_to_balance(
    decision: &Decision,
    available: f64,
    equity: f64,
    data: &MarketData,
    policy: &RiskPolicy,
) -> Result<Sizing, Rejection> {
    if decision.leverage == 0 {
        return Err(Rejection::MissingLeverage);
    }
    let leverage = f64::from(decision.leverage);
    let major = policy.is_major(&decision.symbol);

    let buffer = policy
        .safety_buffer_min
        .max(available * policy.safety_buffer_pct);
    let usable = available - buffer;
    if usable <= 0.0 {
        return Err(Rejection::BalanceBelowBuffer { available, buffer });
    }

    let max_notional = usable * leverage;
    let min_notional = if major {
        policy.major_min_notional
    } else {
        policy.min_notional
    };
    if max_notional < min_notional {
        return Err(Rejection::NotionalBelowMinimum {
            max_notional,
            min_notional,
        });
    }

    let allowed = allowed_stop_distance(data, policy)?;
    let distance = (decision.stop_loss - data.current_price).abs();
    if distance > allowed {
        return Err(Rejection::StopTooFar { distance, allowed });
    }

    let mut sizing = Sizing {
        position_size_usd: decision.position_size_usd,
        risk_usd: decision.risk_usd,
    };

    if equity > EPSILON && equity < policy.small_account_equity {
        clamp_size(&mut sizing, equity, &decision.symbol, "small account cap");
    } else if equity > EPSILON {
        let multiple = if major {
            policy.major_soft_cap_multiple
        } else {
            policy.soft_cap_multiple
        };
        clamp_size(&mut sizing, equity * multiple, &decision.symbol, "equity soft cap");
    }
    clamp_size(&mut sizing, max_notional, &decision.symbol, "balance hard cap");

    let max_risk = available * policy.max_risk_pct;
    if sizing.risk_usd > 0.0 && sizing.risk_usd > max_risk {
        tracing::warn!(
            symbol = %decision.symbol,
            risk_usd = sizing.risk_usd,
            max_risk,
            "risk budget capped at share of available balance"
        );
        sizing.risk_usd = max_risk;
    }

    if equity > EPSILON {
        let target = (equity * policy.risk_target_pct).max(policy.risk_target_min);
        if sizing.risk_usd <= 0.0 {
            sizing.risk_usd = target;
        } else if (sizing.risk_usd - target).abs() > target * policy.risk_tolerance {
            tracing::info!(
                symbol = %decision.symbol,
                from = sizing.risk_usd,
                to = target,
                equity,
                "normalising risk budget to equity target"
            );
            sizing.risk_usd = target;
        }
    }

    if sizing.position_size_usd <= 0.0 {
        return Err(Rejection::EmptyPosition);
    }
    Ok(sizing)
}

fn clamp_size(sizing: &mut Sizing, cap: f64, symbol: &str, reason: &'static str) {
    if cap <= EPSILON || sizing.position_size_usd <= cap {
        return;
    }
    let ratio = cap / sizing.position_size_usd;
    tracing::info!(
        symbol,
        from = sizing.position_size_usd,
        to = cap,
        reason,
        "clamping position size"
    );
    sizing.position_size_usd = cap;
    if sizing.risk_usd > 0.0 {
        sizing.risk_usd *= ratio;
    }
}

/// Initial margin plus taker fee must fit in the available balance.
///
/// # Errors
///
/// Returns [`Rejection::InsufficientMargin`] otherwise.
pub fn check_margin(
    notional: f64,
    leverage: u32,
    available: f64,
    policy: &RiskPolicy,
) -> Result<(), Rejection> {
    let margin = notional / f64::from(leverage.max(1));
    let fee = notional * policy.taker_fee_rate;
    if margin + fee > available {
        return Err(Rejection::InsufficientMargin {
            margin,
            fee,
            available,
        });
    }
    Ok(())
}

/// Ratchet guard: a stop may only move in the protective direction.
/// A first write always passes.
///
/// # Errors
///
/// Returns [`Rejection::StopLoosened`] citing both prices.
pub fn ensure_stop_tightening(
    side: Side,
    previous: Option<f64>,
    proposed: f64,
) -> Result<(), Rejection> {
    let Some(previous) = previous else {
        return Ok(());
    };
    let loosened = match side {
        Side::Long => proposed + EPSILON < previous,
        Side::Short => proposed - EPSILON > previous,
    };
    if loosened {
        return Err(Rejection::StopLoosened {
            side,
            previous,
            proposed,
        });
    }
    Ok(())
}

/// True when `proposed` matches the cached stop, so there is nothing to send.
#[must_use]
pub fn stop_unchanged(previous: Option<f64>, proposed: f64) -> bool {
    previous.is_some_and(|previous| (previous - proposed).abs() <= EPSILON)
}

/// Long: stop below and take-profit above current price. Mirrored for short.
///
/// # Errors
///
/// Returns [`Rejection::InvalidProtectivePrice`] when the price is on the wrong side.
pub fn check_protective_price(
    kind: ProtectiveKind,
    side: Side,
    price: f64,
    current: f64,
) -> Result<(), Rejection> {
    let valid = match (kind, side) {
        (ProtectiveKind::StopLoss, Side::Long) | (ProtectiveKind::TakeProfit, Side::Short) => {
            price < current
        }
        (ProtectiveKind::StopLoss, Side::Short) | (ProtectiveKind::TakeProfit, Side::Long) => {
            price > current
        }
    };
    if !valid || price <= 0.0 {
        return Err(Rejection::InvalidProtectivePrice {
            kind,
            side,
            price,
            current,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrader_core::{Action, IntradaySeries, LongerTermContext, MidTermContext};

    fn market(price: f64, atr: f64, ema: f64, rsi: f64) -> MarketData {
        MarketData {
            symbol: "BTCUSDT".to_string(),
            current_price: price,
            current_macd: Some(0.5),
            mid_term: Some(MidTermContext {
                atr14: Some(atr),
                ema20: Some(ema),
                rsi7: Some(rsi),
            }),
            longer_term: None,
            intraday: None,
        }
    }

    fn open(symbol: &str, size: f64, risk: f64, stop: f64) -> Decision {
        let mut decision = Decision::new(symbol, Action::OpenLong);
        decision.leverage = 10;
        decision.position_size_usd = size;
        decision.risk_usd = risk;
        decision.stop_loss = stop;
        decision.confidence = 90;
        decision
    }

    #[test]
    fn confidence_gate() {
        let policy = RiskPolicy::default();
        let mut decision = open("BTCUSDT", 100.0, 1.0, 99.0);
        decision.confidence = 79;
        assert!(matches!(
            check_confidence(&decision, &policy),
            Err(Rejection::LowConfidence { confidence: 79, minimum: 80 })
        ));
        decision.confidence = 80;
        assert!(check_confidence(&decision, &policy).is_ok());
    }

    #[test]
    fn mid_term_filter_fails_closed_and_bands() {
        let policy = RiskPolicy::default();
        let mut data = market(100.0, 2.0, 99.0, 50.0);
        assert!(check_mid_term(&data, Side::Long, &policy).is_ok());

        data.mid_term = None;
        assert!(matches!(
            check_mid_term(&data, Side::Long, &policy),
            Err(Rejection::IndicatorsNotReady { .. })
        ));

        // price 101.5 > 99 + 0.6 * 2 = 100.2
        let chasing = market(101.5, 2.0, 99.0, 50.0);
        assert!(matches!(
            check_mid_term(&chasing, Side::Long, &policy),
            Err(Rejection::PriceBeyondEmaBand { .. })
        ));

        let overbought = market(100.0, 2.0, 99.0, 70.0);
        assert!(matches!(
            check_mid_term(&overbought, Side::Long, &policy),
            Err(Rejection::RsiOutOfBand { .. })
        ));
        assert!(check_mid_term(&overbought, Side::Short, &policy).is_ok());
    }

    #[test]
    fn momentum_requires_macd_and_rsi_slope() {
        let policy = RiskPolicy::default();
        let mut data = market(100.0, 2.0, 100.0, 50.0);
        data.current_macd = Some(-0.01);
        assert!(matches!(
            check_momentum(&data, Side::Long, &policy),
            Err(Rejection::MacdAgainstTrend { .. })
        ));
        assert!(check_momentum(&data, Side::Short, &policy).is_ok());

        data.current_macd = Some(0.0);
        data.intraday = Some(IntradaySeries {
            rsi7_values: vec![40.0, 55.0, 54.5],
        });
        assert!(matches!(
            check_momentum(&data, Side::Long, &policy),
            Err(Rejection::RsiSlopeAgainstTrend { .. })
        ));

        data.intraday = Some(IntradaySeries {
            rsi7_values: vec![55.0, 54.9],
        });
        assert!(check_momentum(&data, Side::Long, &policy).is_ok());

        data.current_macd = None;
        assert!(check_momentum(&data, Side::Long, &policy).is_err());
    }

    #[test]
    fn sizing_clamps_to_balance_hard_cap() {
        let policy = RiskPolicy::default();
        let data = market(50_000.0, 200.0, 50_000.0, 50.0);
        let decision = open("BTCUSDT", 2000.0, 10.0, 49_800.0);

        let sizing = fit_to_balance(&decision, 100.0, 1000.0, &data, &policy).unwrap();
        assert!((sizing.position_size_usd - 980.0).abs() < 1e-9);
        // 10 * 0.49 = 4.9, within the 50% band around the 5.0 target
        assert!((sizing.risk_usd - 4.9).abs() < 1e-9);
    }

    #[test]
    fn sizing_small_account_caps_at_equity() {
        let policy = RiskPolicy::default();
        let data = market(100.0, 1.0, 100.0, 50.0);
        let decision = open("SOLUSDT", 300.0, 0.6, 99.0);

        let sizing = fit_to_balance(&decision, 100.0, 120.0, &data, &policy).unwrap();
        assert!((sizing.position_size_usd - 120.0).abs() < 1e-9);
        // 0.6 * 0.4 = 0.24 deviates from target 0.6 by more than 50%
        assert!((sizing.risk_usd - 0.6).abs() < 1e-9);
    }

    #[test]
    fn sizing_rejects_thin_balance_and_wide_stop() {
        let policy = RiskPolicy::default();
        let data = market(50_000.0, 200.0, 50_000.0, 50.0);

        let decision = open("BTCUSDT", 100.0, 1.0, 49_900.0);
        assert!(matches!(
            fit_to_balance(&decision, 0.4, 0.4, &data, &policy),
            Err(Rejection::BalanceBelowBuffer { .. })
        ));
        // usable 5.5 * 10 = 55 < 60 for majors
        assert!(matches!(
            fit_to_balance(&decision, 6.0, 6.0, &data, &policy),
            Err(Rejection::NotionalBelowMinimum { .. })
        ));

        // allowed = max(1.5 * 200, 750) = 750
        let wide = open("BTCUSDT", 100.0, 1.0, 49_000.0);
        assert!(matches!(
            fit_to_balance(&wide, 1000.0, 1000.0, &data, &policy),
            Err(Rejection::StopTooFar { .. })
        ));
    }

    #[test]
    fn stop_distance_takes_widest_candidate() {
        let policy = RiskPolicy::default();
        let mut data = market(100.0, 2.0, 100.0, 50.0);
        data.longer_term = Some(LongerTermContext { atr14: Some(4.0) });
        assert!((allowed_stop_distance(&data, &policy).unwrap() - 4.0).abs() < 1e-12);

        data.longer_term = None;
        assert!((allowed_stop_distance(&data, &policy).unwrap() - 3.0).abs() < 1e-12);

        data.mid_term = None;
        assert!((allowed_stop_distance(&data, &policy).unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn margin_includes_taker_fee() {
        let policy = RiskPolicy::default();
        // 1000 / 10 + 1000 * 0.0004 = 100.4
        assert!(check_margin(1000.0, 10, 100.4, &policy).is_ok());
        assert!(matches!(
            check_margin(1000.0, 10, 100.3, &policy),
            Err(Rejection::InsufficientMargin { .. })
        ));
    }

    #[test]
    fn ratchet_cites_both_prices() {
        assert!(ensure_stop_tightening(Side::Long, None, 90.0).is_ok());
        assert!(ensure_stop_tightening(Side::Long, Some(95.0), 96.0).is_ok());
        let err = ensure_stop_tightening(Side::Long, Some(95.0), 94.0).unwrap_err();
        assert_eq!(
            err,
            Rejection::StopLoosened {
                side: Side::Long,
                previous: 95.0,
                proposed: 94.0
            }
        );
        let message = err.to_string();
        assert!(message.contains("95.0") && message.contains("94.0"));

        assert!(ensure_stop_tightening(Side::Short, Some(105.0), 104.0).is_ok());
        assert!(ensure_stop_tightening(Side::Short, Some(105.0), 106.0).is_err());
    }

    #[test]
    fn resubmitted_stop_is_unchanged() {
        assert!(stop_unchanged(Some(95.0), 95.0));
        assert!(!stop_unchanged(Some(95.0), 95.5));
        assert!(!stop_unchanged(None, 95.0));
    }

    #[test]
    fn protective_prices_must_bracket_current() {
        use ProtectiveKind::{StopLoss, TakeProfit};
        assert!(check_protective_price(StopLoss, Side::Long, 95.0, 100.0).is_ok());
        assert!(check_protective_price(StopLoss, Side::Long, 101.0, 100.0).is_err());
        assert!(check_protective_price(TakeProfit, Side::Long, 110.0, 100.0).is_ok());
        assert!(check_protective_price(TakeProfit, Side::Short, 110.0, 100.0).is_err());
        assert!(check_protective_price(StopLoss, Side::Short, 105.0, 100.0).is_ok());
    }

    #[test]
    fn duplicate_gate_matches_symbol_and_side() {
        let positions = vec![PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            mark_price: 100.0,
            quantity: 1.0,
            leverage: 10,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            margin_used: 10.0,
            first_seen_ms: None,
        }];
        assert!(check_duplicate(&positions, "btcusdt", Side::Long).is_err());
        assert!(check_duplicate(&positions, "BTCUSDT", Side::Short).is_ok());
    }
}
