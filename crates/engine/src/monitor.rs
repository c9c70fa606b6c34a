//! Drawdown monitor.
//!
//! Background task that tracks peak ROI per open position and force-closes
//! positions that give back too much of it. Positions that survive the check
//! go through the ROI/ATR ratchet. Cancellation is observed between ticks
//! only, so an in-flight exchange call always runs to completion.

use crate::executor::Executor;
use crate::protection::RoiProfile;
use crate::EPSILON;
use autotrader_core::PositionSnapshot;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What a tick did to one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Retracement exceeded the profile; position closed.
    EmergencyClosed { peak: f64, roi_pct: f64 },
    /// Position kept; ratchet evaluated.
    Protected { peak: f64, roi_pct: f64 },
}

/// Relative retracement from `peak` ROI, in percent of the peak.
#[must_use]
pub fn drawdown_pct(peak: f64, current: f64) -> Option<f64> {
    (peak > 0.0 && current < peak).then(|| (peak - current) / peak * 100.0)
}

pub struct DrawdownMonitor {
    executor: Executor,
    period: Duration,
}

impl DrawdownMonitor {
    #[must_use]
    pub const fn new(executor: Executor, period: Duration) -> Self {
        Self { executor, period }
    }

    /// Spawns the monitor loop. The first check runs one period after start.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(period_secs = self.period.as_secs(), "drawdown monitor started");

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.check_positions().await;
            }

            tracing::info!("drawdown monitor stopped");
        })
    }

    /// One monitor pass over every open position.
    pub async fn check_positions(&self) -> Vec<(String, TickOutcome)> {
        let positions = match self.executor.exchange().positions().await {
            Ok(positions) => positions,
            Err(err) => {
                tracing::error!(error = %err, "drawdown monitor could not read positions");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(positions.len());
        for position in positions {
            if position.quantity < EPSILON {
                continue;
            }
            let outcome = self.check_position(&position).await;
            outcomes.push((position.symbol.clone(), outcome));
        }
        outcomes
    }

    async fn check_position(&self, position: &PositionSnapshot) -> TickOutcome {
        let book = self.executor.book();
        let roi_pct = position.roi_pct();
        let peak = book.update_peak(&position.symbol, position.side, roi_pct);

        if let Some(drawdown) = drawdown_pct(peak, roi_pct) {
            let profile = RoiProfile::for_leverage(position.leverage);
            if peak >= profile.breakeven && drawdown >= profile.drawdown {
                tracing::warn!(
                    symbol = %position.symbol,
                    side = %position.side,
                    roi_pct,
                    peak,
                    drawdown,
                    "drawdown limit hit, closing position"
                );
                match self
                    .executor
                    .emergency_close(&position.symbol, position.side)
                    .await
                {
                    Ok(_) => {
                        book.clear_peak(&position.symbol, position.side);
                        return TickOutcome::EmergencyClosed { peak, roi_pct };
                    }
                    Err(err) => tracing::error!(
                        symbol = %position.symbol,
                        error = %err,
                        "emergency close failed"
                    ),
                }
            }
        }

        self.executor.apply_dynamic_protection(position).await;
        TickOutcome::Protected { peak, roi_pct }
    }
}
