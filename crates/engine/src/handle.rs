use crate::commands::{TraderCommand, TraderStatus};
use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone)]
pub struct TraderHandle {
    tx: mpsc::Sender<TraderCommand>,
}

impl TraderHandle {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<TraderCommand>) -> Self {
        Self { tx }
    }

    /// Gets the current status of the trader.
    ///
    /// # Errors
    /// Returns an error if the actor has exited or drops the reply.
    pub async fn status(&self) -> Result<TraderStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(TraderCommand::GetStatus(tx)).await?;
        Ok(rx.await?)
    }

    /// Stops the trader. Resolves once the drawdown monitor has exited.
    ///
    /// An in-flight cycle finishes before the stop is observed.
    ///
    /// # Errors
    /// Returns an error if the actor has already exited.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(TraderCommand::Stop(tx)).await?;
        rx.await?;
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
