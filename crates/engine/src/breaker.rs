//! Consecutive-loss circuit breaker.
//!
//! Counts realized losses in a row and installs a cooling-off deadline that
//! the decision cycle honours. A realized gain resets the streak. Also
//! accumulates realized PnL for the current day.

use autotrader_core::BreakerConfig;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct BreakerState {
    consecutive_losses: u32,
    stop_until: Option<DateTime<Utc>>,
    daily_pnl: f64,
    last_reset: DateTime<Utc>,
}

/// What a realized close did to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    /// PnL too small to count.
    Ignored,
    /// Streak reset by a gain.
    Reset,
    /// Loss counted; no pause for this streak length.
    LossCounted { streak: u32 },
    /// Loss counted and trading paused until the deadline.
    Paused {
        streak: u32,
        until: DateTime<Utc>,
    },
}

// =============================================================================
// Circuit Breaker
// =============================================================================

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: RwLock<BreakerState>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            state: RwLock::new(BreakerState {
                consecutive_losses: 0,
                stop_until: None,
                daily_pnl: 0.0,
                last_reset: now,
            }),
        }
    }

    /// Pause length for a loss streak: none for one loss, then 45 minutes,
    /// 24 hours, and 72 hours from the fourth loss on (with default config).
    #[must_use]
    pub fn pause_for(&self, streak: u32) -> Option<Duration> {
        let minutes = match streak {
            0 | 1 => return None,
            2 => self.config.second_loss_pause_mins,
            3 => self.config.third_loss_pause_mins,
            _ => self.config.extended_pause_mins,
        };
        (minutes > 0).then(|| Duration::minutes(minutes))
    }

    /// Feeds one realized close into the breaker.
    pub fn record_realized(&self, pnl: f64, now: DateTime<Utc>) -> BreakerOutcome {
        let mut state = self.state.write();
        state.daily_pnl += pnl;

        if pnl.abs() < self.config.pnl_epsilon {
            return BreakerOutcome::Ignored;
        }

        if pnl > 0.0 {
            if state.consecutive_losses > 0 {
                tracing::info!(
                    pnl,
                    previous_streak = state.consecutive_losses,
                    "winning close resets loss streak"
                );
            }
            state.consecutive_losses = 0;
            return BreakerOutcome::Reset;
        }

        state.consecutive_losses += 1;
        let streak = state.consecutive_losses;
        match self.pause_for(streak) {
            Some(pause) => {
                let until = now + pause;
                state.stop_until = Some(until);
                tracing::warn!(
                    streak,
                    pause_minutes = pause.num_minutes(),
                    %until,
                    "consecutive losses, pausing trading"
                );
                BreakerOutcome::Paused { streak, until }
            }
            None => {
                tracing::warn!(streak, pnl, "losing close recorded");
                BreakerOutcome::LossCounted { streak }
            }
        }
    }

    /// Remaining pause, if trading is currently suspended.
    #[must_use]
    pub fn pause_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.state
            .read()
            .stop_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    #[must_use]
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.pause_remaining(now).is_some()
    }

    #[must_use]
    pub fn consecutive_losses(&self) -> u32 {
        self.state.read().consecutive_losses
    }

    #[must_use]
    pub fn stop_until(&self) -> Option<DateTime<Utc>> {
        self.state.read().stop_until
    }

    #[must_use]
    pub fn daily_pnl(&self) -> f64 {
        self.state.read().daily_pnl
    }

    /// Zeroes daily PnL once the reset window has elapsed. Returns true if it did.
    pub fn reset_daily_if_due(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write();
        if now - state.last_reset > Duration::hours(self.config.daily_reset_hours) {
            state.daily_pnl = 0.0;
            state.last_reset = now;
            tracing::info!("daily pnl reset");
            return true;
        }
        false
    }
}
