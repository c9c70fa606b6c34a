use crate::commands::{TraderCommand, TraderState};
use crate::handle::TraderHandle;
use crate::monitor::DrawdownMonitor;
use crate::trader::Trader;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Owns a [`Trader`] and drives its decision cycle alongside the drawdown monitor.
pub struct TraderActor {
    trader: Trader,
    rx: mpsc::Receiver<TraderCommand>,
    shutdown: CancellationToken,
}

impl TraderActor {
    #[must_use]
    pub fn new(trader: Trader, rx: mpsc::Receiver<TraderCommand>) -> Self {
        Self {
            trader,
            rx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns the actor and returns a handle plus the actor's join handle.
    #[must_use]
    pub fn spawn(trader: Trader) -> (TraderHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let actor = Self::new(trader, rx);
        let join = tokio::spawn(actor.run());
        (TraderHandle::new(tx), join)
    }

    /// Runs one cycle immediately, then one per scan interval. A cycle that
    /// overruns the interval delays the next one rather than overlapping it.
    pub async fn run(mut self) {
        let config = self.trader.config();
        tracing::info!(
            trader = %config.id,
            initial_balance = self.trader.initial_balance(),
            scan_interval_secs = config.scan_interval_secs,
            "trader started"
        );

        let monitor = DrawdownMonitor::new(
            self.trader.executor().clone(),
            self.trader.config().monitor_interval(),
        )
        .spawn(self.shutdown.clone());

        let mut ticker = tokio::time::interval(self.trader.config().scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stop_ack: Option<oneshot::Sender<()>> = None;
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(TraderCommand::GetStatus(reply)) => {
                        let _ = reply.send(self.trader.status(state_of(&self.trader)));
                    }
                    Some(TraderCommand::Stop(ack)) => {
                        stop_ack = Some(ack);
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.trader.run_cycle().await {
                        tracing::error!(trader = %self.trader.config().id, error = %err, "cycle failed");
                    }
                }
            }
        }

        self.shutdown.cancel();
        if let Err(err) = monitor.await {
            tracing::error!(error = %err, "drawdown monitor task panicked");
        }
        tracing::info!(trader = %self.trader.config().id, "trader stopped");

        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }
}

fn state_of(trader: &Trader) -> TraderState {
    if trader.executor().breaker().is_paused(Utc::now()) {
        TraderState::Paused
    } else {
        TraderState::Running
    }
}
