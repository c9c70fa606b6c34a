//! Protective stop engine.
//!
//! Pure functions that derive stop-loss and take-profit targets. Stops only
//! ever move in the protective direction: up for longs, down for shorts.

use crate::book::{position_key, PositionBook};
use crate::EPSILON;
use autotrader_core::{
    Action, Decision, MarketData, PositionSnapshot, Side, TradingContext, AUTO_STOP_LOSS_TAG,
    AUTO_TAKE_PROFIT_TAG,
};
use std::collections::HashSet;

/// Minimum relative improvement before a ratcheted stop is dispatched.
pub const RATCHET_MIN_STEP_PCT: f64 = 0.0001;

/// Relative tolerance for "same" take-profit targets.
const TAKE_PROFIT_TOLERANCE: f64 = 1e-5;

/// Leverage-banded ROI thresholds, all in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiProfile {
    /// ROI at which the stop moves to entry.
    pub breakeven: f64,
    /// ROI at which 30% of the gain is locked.
    pub lock30: f64,
    /// ROI at which 50% of the gain is locked.
    pub lock50: f64,
    /// Retracement from peak ROI that forces a close.
    pub drawdown: f64,
    /// Minimum locked ROI once breakeven is reached.
    pub floor: f64,
}

impl RoiProfile {
    /// Higher leverage tightens faster.
    #[must_use]
    pub const fn for_leverage(leverage: u32) -> Self {
        match leverage {
            0..=2 => Self {
                breakeven: 6.0,
                lock30: 8.0,
                lock50: 12.0,
                drawdown: 40.0,
                floor: 0.7,
            },
            3..=5 => Self {
                breakeven: 3.0,
                lock30: 6.0,
                lock50: 10.0,
                drawdown: 35.0,
                floor: 2.0,
            },
            6..=10 => Self {
                breakeven: 2.0,
                lock30: 4.0,
                lock50: 7.0,
                drawdown: 30.0,
                floor: 3.0,
            },
            _ => Self {
                breakeven: 1.5,
                lock30: 3.0,
                lock50: 5.0,
                drawdown: 25.0,
                floor: 3.5,
            },
        }
    }
}

/// Distance a ratcheted stop keeps from mark price.
#[must_use]
pub fn protection_buffer(mark_price: f64, atr: f64) -> f64 {
    let mut buffer = mark_price * 0.0002;
    if atr > 0.0 {
        buffer = buffer.max(atr * 0.05);
    }
    buffer.max(0.01)
}

/// Favourable price excursion; zero when the position is under water.
#[must_use]
pub fn floating_gain(side: Side, entry_price: f64, mark_price: f64) -> f64 {
    match side {
        Side::Long => (mark_price - entry_price).max(0.0),
        Side::Short => (entry_price - mark_price).max(0.0),
    }
}

/// The more protective of `current` and `candidate`. NaN candidates are ignored.
#[must_use]
pub fn pick_tighter(side: Side, current: Option<f64>, candidate: Option<f64>) -> Option<f64> {
    let Some(candidate) = candidate.filter(|c| !c.is_nan()) else {
        return current;
    };
    let Some(existing) = current else {
        return Some(candidate);
    };
    let tighter = match side {
        Side::Long => candidate > existing + EPSILON,
        Side::Short => candidate < existing - EPSILON,
    };
    Some(if tighter { candidate } else { existing })
}

/// ATR-banded stop: entry at 1 ATR of gain, entry +/- 0.5 ATR at 1.5 ATR,
/// mark -/+ 2.5 ATR at 2 ATR.
#[must_use]
pub fn atr_stop_candidate(
    side: Side,
    entry_price: f64,
    mark_price: f64,
    gain: f64,
    atr: Option<f64>,
) -> Option<f64> {
    let atr = atr.filter(|a| *a > 0.0)?;
    if gain <= 0.0 || gain < atr {
        return None;
    }

    let mut target = entry_price;
    if gain >= 1.5 * atr {
        target = match side {
            Side::Long => entry_price + 0.5 * atr,
            Side::Short => entry_price - 0.5 * atr,
        };
    }
    if gain >= 2.0 * atr {
        target = match side {
            Side::Long => mark_price - 2.5 * atr,
            Side::Short => mark_price + 2.5 * atr,
        };
    }

    let buffer = protection_buffer(mark_price, atr);
    Some(match side {
        Side::Long => target.min(mark_price - buffer),
        Side::Short => target.max(mark_price + buffer),
    })
}

/// ROI-banded stop: entry at breakeven, then 30% and 50% of the gain locked,
/// never below the profile's floor ROI.
#[must_use]
pub fn roi_stop_candidate(
    side: Side,
    entry_price: f64,
    mark_price: f64,
    leverage: u32,
    roi_pct: f64,
    gain: f64,
) -> Option<f64> {
    let profile = RoiProfile::for_leverage(leverage);
    if roi_pct < profile.breakeven || gain <= 0.0 {
        return None;
    }

    let locked_share = if roi_pct >= profile.lock50 {
        0.5
    } else if roi_pct >= profile.lock30 {
        0.3
    } else {
        0.0
    };
    let mut candidate = match side {
        Side::Long => entry_price + gain * locked_share,
        Side::Short => entry_price - gain * locked_share,
    };

    if profile.floor > 0.0 {
        let floor_gain = (profile.floor / 100.0) / f64::from(leverage.max(1));
        candidate = match side {
            Side::Long => candidate.max(entry_price * (1.0 + floor_gain)),
            Side::Short => candidate.min(entry_price * (1.0 - floor_gain)),
        };
    }

    let buffer = protection_buffer(mark_price, gain);
    Some(match side {
        Side::Long => candidate.min(mark_price - buffer),
        Side::Short => candidate.max(mark_price + buffer),
    })
}

/// A ratcheted stop worth dispatching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatchetTarget {
    pub stop: f64,
    pub roi_pct: f64,
}

/// Combines the cached stop with the ATR and ROI candidates.
///
/// Returns a target only when it is strictly more protective than the cached
/// stop and moves it by at least [`RATCHET_MIN_STEP_PCT`] of current price.
#[must_use]
pub fn ratchet_target(
    position: &PositionSnapshot,
    current_stop: Option<f64>,
    data: &MarketData,
) -> Option<RatchetTarget> {
    let side = position.side;
    let gain = floating_gain(side, position.entry_price, position.mark_price);
    if gain <= EPSILON {
        return None;
    }

    let leverage = position.leverage.max(1);
    let roi_pct = position.roi_pct();

    let atr = atr_stop_candidate(
        side,
        position.entry_price,
        position.mark_price,
        gain,
        data.mid_atr(),
    );
    let roi = roi_stop_candidate(
        side,
        position.entry_price,
        position.mark_price,
        leverage,
        roi_pct,
        gain,
    );
    let target = pick_tighter(side, pick_tighter(side, current_stop, atr), roi)?;

    if let Some(existing) = current_stop {
        let improves = match side {
            Side::Long => target > existing + EPSILON,
            Side::Short => target < existing - EPSILON,
        };
        if !improves || (target - existing).abs() < data.current_price * RATCHET_MIN_STEP_PCT {
            return None;
        }
    }

    Some(RatchetTarget {
        stop: target,
        roi_pct,
    })
}

/// Take-profit extensions for positions already beyond 1.5R.
///
/// Skips positions that have an explicit take-profit decision in `base`,
/// have no cached stop, or whose new target does not beat the cached one.
#[must_use]
pub fn auto_take_profit_decisions(
    context: &TradingContext,
    base: &[Decision],
    book: &PositionBook,
) -> Vec<Decision> {
    let mut covered: HashSet<String> = base
        .iter()
        .filter(|d| d.action == Action::UpdateTakeProfit)
        .map(|d| {
            let side = context.position_side(&d.symbol).unwrap_or(Side::Long);
            position_key(&d.symbol, side)
        })
        .collect();

    let mut out = Vec::new();
    for position in &context.positions {
        let side = position.side;
        let key = position_key(&position.symbol, side);
        if covered.contains(&key) {
            continue;
        }

        let Some(stop) = book.stop_loss(&position.symbol, side) else {
            continue;
        };
        let entry = position.entry_price;
        let risk = match side {
            Side::Long => entry - stop,
            Side::Short => stop - entry,
        };
        if risk <= EPSILON {
            continue;
        }

        let current = context.price_for(&position.symbol, position.mark_price);
        let favourable = match side {
            Side::Long => current - entry,
            Side::Short => entry - current,
        };
        if favourable <= risk {
            continue;
        }

        let r_multiple = favourable / risk;
        let target_multiple = if r_multiple >= 3.0 {
            r_multiple + 0.5
        } else if r_multiple >= 2.0 {
            3.5
        } else if r_multiple >= 1.5 {
            2.5
        } else {
            continue;
        };

        let target = match side {
            Side::Long => {
                let raw = entry + target_multiple * risk;
                if raw <= current {
                    current + 0.3 * risk
                } else {
                    raw
                }
            }
            Side::Short => {
                let raw = entry - target_multiple * risk;
                if raw >= current {
                    current - 0.3 * risk
                } else {
                    raw
                }
            }
        };

        if let Some(cached) = book.take_profit(&position.symbol, side) {
            let no_better = match side {
                Side::Long => target <= cached * (1.0 + TAKE_PROFIT_TOLERANCE),
                Side::Short => target >= cached * (1.0 - TAKE_PROFIT_TOLERANCE),
            };
            if no_better {
                continue;
            }
        }

        tracing::info!(
            symbol = %position.symbol,
            %side,
            r_multiple,
            target,
            "extending take-profit"
        );
        out.push(Decision::update_take_profit(
            position.symbol.clone(),
            target,
            format!("{AUTO_TAKE_PROFIT_TAG} {r_multiple:.2}R in profit, trailing take-profit"),
        ));
        covered.insert(key);
    }
    out
}

/// Stop tightening for positions whose setup has failed: price back through
/// entry, 0.4R adverse excursion, or RSI turning against the side.
#[must_use]
pub fn auto_stop_loss_decisions(
    context: &TradingContext,
    base: &[Decision],
    book: &PositionBook,
) -> Vec<Decision> {
    let mut covered: HashSet<String> = base
        .iter()
        .filter(|d| d.action == Action::UpdateStopLoss)
        .map(|d| d.symbol.to_ascii_uppercase())
        .collect();

    let mut out = Vec::new();
    for position in &context.positions {
        let symbol_key = position.symbol.to_ascii_uppercase();
        if covered.contains(&symbol_key) {
            continue;
        }

        let side = position.side;
        let Some(stop) = book
            .stop_loss(&position.symbol, side)
            .filter(|s| *s != 0.0)
        else {
            continue;
        };

        let entry = position.entry_price;
        let current = context.price_for(&position.symbol, position.mark_price);
        let (risk, adverse) = match side {
            Side::Long => (entry - stop, entry - current),
            Side::Short => (stop - entry, current - entry),
        };
        if risk <= EPSILON {
            continue;
        }

        let rsi = context
            .market_data
            .get(&position.symbol)
            .and_then(MarketData::mid_rsi)
            .unwrap_or(0.0);

        let triggered = match side {
            Side::Short => current > entry || adverse >= 0.4 * risk || rsi >= 55.0,
            Side::Long => current < entry || adverse >= 0.4 * risk || (rsi > 0.0 && rsi <= 45.0),
        };
        if !triggered {
            continue;
        }

        let buffer = (current * 0.0008).max(risk * 0.15);
        let new_stop = match side {
            Side::Long => {
                let mut candidate = current - buffer;
                if candidate <= stop {
                    candidate = stop + buffer * 0.5;
                }
                if candidate >= current {
                    candidate = current - buffer;
                }
                if candidate <= stop + EPSILON {
                    continue;
                }
                candidate
            }
            Side::Short => {
                let mut candidate = current + buffer;
                if candidate >= stop {
                    candidate = stop - buffer * 0.5;
                }
                if candidate <= current {
                    candidate = current + buffer;
                }
                if candidate >= stop - EPSILON {
                    continue;
                }
                candidate
            }
        };

        tracing::info!(
            symbol = %position.symbol,
            %side,
            from = stop,
            to = new_stop,
            rsi,
            "tightening stop after failed setup"
        );
        out.push(Decision::update_stop_loss(
            position.symbol.clone(),
            new_stop,
            format!("{AUTO_STOP_LOSS_TAG} structure or momentum failed, tightening stop"),
        ));
        covered.insert(symbol_key);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrader_core::{AccountInfo, LeveragePolicy, MidTermContext};
    use chrono::Utc;
    use std::collections::HashMap;

    fn position(side: Side, entry: f64, mark: f64, leverage: u32) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: entry,
            mark_price: mark,
            quantity: 1.0,
            leverage,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            margin_used: 0.0,
            first_seen_ms: None,
        }
    }

    fn data(price: f64, atr: Option<f64>, rsi: Option<f64>) -> MarketData {
        MarketData {
            symbol: "BTCUSDT".to_string(),
            current_price: price,
            current_macd: Some(0.0),
            mid_term: Some(MidTermContext {
                atr14: atr,
                ema20: Some(price),
                rsi7: rsi,
            }),
            longer_term: None,
            intraday: None,
        }
    }

    fn context(positions: Vec<PositionSnapshot>, market: Vec<MarketData>) -> TradingContext {
        TradingContext {
            current_time: Utc::now(),
            runtime_minutes: 0,
            call_count: 1,
            leverage: LeveragePolicy {
                btc_eth: 10,
                altcoin: 5,
            },
            account: AccountInfo::default(),
            positions,
            candidates: Vec::new(),
            performance: None,
            market_data: market
                .into_iter()
                .map(|d| (d.symbol.clone(), d))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn profiles_tighten_with_leverage() {
        assert!((RoiProfile::for_leverage(1).breakeven - 6.0).abs() < 1e-12);
        assert!((RoiProfile::for_leverage(5).drawdown - 35.0).abs() < 1e-12);
        assert!((RoiProfile::for_leverage(10).lock50 - 7.0).abs() < 1e-12);
        assert!((RoiProfile::for_leverage(20).breakeven - 1.5).abs() < 1e-12);
    }

    #[test]
    fn pick_tighter_is_monotonic() {
        assert_eq!(pick_tighter(Side::Long, None, Some(95.0)), Some(95.0));
        assert_eq!(pick_tighter(Side::Long, Some(96.0), Some(95.0)), Some(96.0));
        assert_eq!(pick_tighter(Side::Long, Some(96.0), Some(97.0)), Some(97.0));
        assert_eq!(pick_tighter(Side::Short, Some(104.0), Some(103.0)), Some(103.0));
        assert_eq!(pick_tighter(Side::Short, Some(104.0), Some(f64::NAN)), Some(104.0));
        assert_eq!(pick_tighter(Side::Short, None, None), None);
    }

    #[test]
    fn atr_bands() {
        // gain below 1 ATR
        assert!(atr_stop_candidate(Side::Long, 100.0, 100.5, 0.5, Some(1.0)).is_none());
        // 1 ATR -> entry
        let be = atr_stop_candidate(Side::Long, 100.0, 101.2, 1.2, Some(1.0)).unwrap();
        assert!((be - 100.0).abs() < 1e-9);
        // 1.5 ATR -> entry + 0.5 ATR
        let half = atr_stop_candidate(Side::Long, 100.0, 101.6, 1.6, Some(1.0)).unwrap();
        assert!((half - 100.5).abs() < 1e-9);
        // 2 ATR -> mark - 2.5 ATR, short mirror
        let trail = atr_stop_candidate(Side::Short, 100.0, 90.0, 10.0, Some(4.0)).unwrap();
        assert!((trail - 100.0).abs() < 1e-9);
        assert!(atr_stop_candidate(Side::Long, 100.0, 102.0, 2.0, None).is_none());
    }

    #[test]
    fn roi_ladder_locks_half_of_gain() {
        // 10x, mark +1% => 10% ROI >= lock50 (7)
        let stop = roi_stop_candidate(Side::Long, 100.0, 101.0, 10, 10.0, 1.0).unwrap();
        assert!((stop - 100.5).abs() < 1e-9);

        // 10x, 3% ROI: breakeven only, floor 3%/10 = 0.3% above entry
        let floor = roi_stop_candidate(Side::Long, 100.0, 100.3, 10, 3.0, 0.3).unwrap();
        // buffer = max(0.02006, 0.015, 0.01) keeps it below mark
        assert!(floor < 100.3);
        assert!(floor > 100.25);

        assert!(roi_stop_candidate(Side::Long, 100.0, 100.1, 10, 1.0, 0.1).is_none());
    }

    #[test]
    fn ratchet_only_moves_forward() {
        let pos = position(Side::Long, 100.0, 101.0, 10);
        let market = data(101.0, Some(0.4), Some(50.0));

        let first = ratchet_target(&pos, None, &market).unwrap();
        assert!(first.stop > 100.0 && first.stop < 101.0);

        // a cached stop already at the target yields nothing
        assert!(ratchet_target(&pos, Some(first.stop), &market).is_none());
        // nor does a cached stop beyond it
        assert!(ratchet_target(&pos, Some(first.stop + 0.1), &market).is_none());

        // losing positions are left alone
        let losing = position(Side::Long, 100.0, 99.0, 10);
        assert!(ratchet_target(&losing, Some(95.0), &market).is_none());
    }

    #[test]
    fn take_profit_extends_past_two_r_and_is_idempotent() {
        let book = PositionBook::new();
        book.set_stop_loss("BTCUSDT", Side::Long, 98.0);
        let ctx = context(
            vec![position(Side::Long, 100.0, 104.5, 10)],
            vec![data(104.5, Some(1.0), Some(60.0))],
        );

        let decisions = auto_take_profit_decisions(&ctx, &[], &book);
        assert_eq!(decisions.len(), 1);
        // 2.25R -> 3.5R target = 107
        assert!((decisions[0].new_take_profit - 107.0).abs() < 1e-9);
        assert!(decisions[0].reasoning.starts_with(AUTO_TAKE_PROFIT_TAG));

        book.set_take_profit("BTCUSDT", Side::Long, decisions[0].new_take_profit);
        assert!(auto_take_profit_decisions(&ctx, &[], &book).is_empty());
    }

    #[test]
    fn take_profit_respects_explicit_decisions_and_missing_stop() {
        let book = PositionBook::new();
        let ctx = context(vec![position(Side::Long, 100.0, 104.5, 10)], vec![]);
        assert!(auto_take_profit_decisions(&ctx, &[], &book).is_empty());

        book.set_stop_loss("BTCUSDT", Side::Long, 98.0);
        let explicit = Decision::update_take_profit("BTCUSDT", 110.0, String::new());
        assert!(auto_take_profit_decisions(&ctx, &[explicit], &book).is_empty());
    }

    #[test]
    fn take_profit_target_behind_price_is_pushed_ahead() {
        let book = PositionBook::new();
        book.set_stop_loss("ETHUSDT", Side::Short, 102.0);
        let mut pos = position(Side::Short, 100.0, 92.0, 5);
        pos.symbol = "ETHUSDT".to_string();
        let ctx = context(vec![pos], vec![]);

        // 4R -> 4.5R target = 91 which is ahead of 92, so no clamp
        let decisions = auto_take_profit_decisions(&ctx, &[], &book);
        assert!((decisions[0].new_take_profit - 91.0).abs() < 1e-9);
    }

    #[test]
    fn stop_tightens_when_long_falls_below_entry() {
        let book = PositionBook::new();
        book.set_stop_loss("BTCUSDT", Side::Long, 95.0);
        let ctx = context(
            vec![position(Side::Long, 100.0, 99.0, 10)],
            vec![data(99.0, Some(1.0), Some(50.0))],
        );

        let decisions = auto_stop_loss_decisions(&ctx, &[], &book);
        assert_eq!(decisions.len(), 1);
        // buffer = max(0.0792, 0.75) = 0.75
        assert!((decisions[0].new_stop_loss - 98.25).abs() < 1e-9);
        assert!(decisions[0].reasoning.starts_with(AUTO_STOP_LOSS_TAG));
    }

    #[test]
    fn stop_left_alone_when_setup_intact() {
        let book = PositionBook::new();
        book.set_stop_loss("BTCUSDT", Side::Long, 95.0);
        let ctx = context(
            vec![position(Side::Long, 100.0, 101.0, 10)],
            vec![data(101.0, Some(1.0), Some(60.0))],
        );
        assert!(auto_stop_loss_decisions(&ctx, &[], &book).is_empty());

        // RSI at 45 triggers for longs
        let weak = context(
            vec![position(Side::Long, 100.0, 101.0, 10)],
            vec![data(101.0, Some(1.0), Some(45.0))],
        );
        assert_eq!(auto_stop_loss_decisions(&weak, &[], &book).len(), 1);

        let explicit = Decision::update_stop_loss("btcusdt", 96.0, String::new());
        assert!(auto_stop_loss_decisions(&weak, &[explicit], &book).is_empty());
    }
}
