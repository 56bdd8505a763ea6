use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::accrual::processor::AccrualProcessor;

/// Timer-driven reconciliation loop. Each tick runs one batch to
/// completion before the next tick is considered, so batches never overlap.
pub struct AccrualScheduler {
    poll_interval: Duration,
    processor: Arc<AccrualProcessor>,
}

impl AccrualScheduler {
    pub fn new(poll_interval: Duration, processor: Arc<AccrualProcessor>) -> Self {
        Self {
            poll_interval,
            processor,
        }
    }

    /// Spawns the polling loop. The loop exits when `shutdown` flips to
    /// true or its sender is dropped.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.poll_interval, "accrual scheduler started");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("accrual scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    // Tick failures are logged and the loop keeps going;
                    // transient storage outages must not kill the scheduler.
                    if let Err(err) = self.processor.process(shutdown.clone()).await {
                        error!(error = %err, "accrual tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::MockServer;

    use super::*;
    use crate::accrual::client::{AccrualClient, AccrualClientConfig};
    use crate::ledger::memory::MemoryStorage;
    use crate::ledger::store::Storage;

    async fn scheduler_for(server: &MockServer, poll_interval: Duration) -> AccrualScheduler {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let client = AccrualClient::new(AccrualClientConfig {
            base_url: server.uri(),
            retry_attempts: 1,
            retry_wait: Duration::from_millis(1),
            retry_wait_step: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        let processor = Arc::new(AccrualProcessor::new(storage, Arc::new(client), 1));

        AccrualScheduler::new(poll_interval, processor)
    }

    #[tokio::test]
    async fn stops_promptly_on_shutdown_signal() {
        let server = MockServer::start().await;
        let scheduler = scheduler_for(&server, Duration::from_secs(3600)).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = scheduler.start(shutdown_rx);

        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop in time")
            .unwrap();
    }

    #[tokio::test]
    async fn stops_when_shutdown_sender_is_dropped() {
        let server = MockServer::start().await;
        let scheduler = scheduler_for(&server, Duration::from_secs(3600)).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = scheduler.start(shutdown_rx);

        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop in time")
            .unwrap();
    }
}
