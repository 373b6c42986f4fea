//! Background expiry of reservations
//!
//! The sweeper wakes on a fixed interval, removes every reservation whose
//! TTL has elapsed and forwards them to an optional listener (the payment
//! engine uses this to drop stale transaction state).

use crate::{LineLedger, Reservation};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Handle to a running sweeper
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }

    /// Stop the sweeper without waiting
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the sweeper on the current runtime
pub fn spawn_sweeper(
    ledger: Arc<LineLedger>,
    period: Duration,
    expired_tx: Option<mpsc::UnboundedSender<Reservation>>,
) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!("Reservation sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match ledger.expire(chrono::Utc::now()) {
                        Ok(expired) => {
                            if let Some(tx) = &expired_tx {
                                for reservation in expired {
                                    let _ = tx.send(reservation);
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Reservation sweep failed");
                        }
                    }
                }
            }
        }
    });

    SweeperHandle {
        shutdown: Some(shutdown_tx),
        task,
    }
}
