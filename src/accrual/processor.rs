use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::accrual::client::{AccrualClient, SettledStatus, SettlementOutcome};
use crate::error::AppError;
use crate::ledger::models::{Order, OrderStatus};
use crate::ledger::store::Storage;

/// Drains one batch of unsettled orders through the settlement client and
/// applies terminal outcomes to the ledger.
///
/// One producer feeds a bounded queue; `pool_size` workers drain it. The
/// queue is closed once the full batch is enqueued, which is the signal for
/// workers to exit after draining, so no order is silently dropped and no
/// order is handled twice within a tick.
pub struct AccrualProcessor {
    storage: Arc<dyn Storage>,
    client: Arc<AccrualClient>,
    pool_size: usize,
}

impl AccrualProcessor {
    pub fn new(storage: Arc<dyn Storage>, client: Arc<AccrualClient>, pool_size: usize) -> Self {
        Self {
            storage,
            client,
            pool_size: pool_size.max(1),
        }
    }

    /// Runs one reconciliation batch to completion. Returns once every
    /// worker is done, so ticks never overlap on the same order set.
    pub async fn process(&self, shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        let orders = self
            .storage
            .orders_by_status(&OrderStatus::unsettled())
            .await?;

        if orders.is_empty() {
            debug!("no unsettled orders this tick");
            return Ok(());
        }

        info!(batch_size = orders.len(), "processing unsettled orders");

        let (queue_tx, queue_rx) = mpsc::channel::<Order>(self.pool_size * 2);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let workers: Vec<_> = (0..self.pool_size)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.client),
                    Arc::clone(&queue_rx),
                    shutdown.clone(),
                ))
            })
            .collect();

        for order in orders {
            if *shutdown.borrow() {
                info!("shutdown observed, not enqueueing remaining orders");
                break;
            }

            // send fails only when every worker is gone already
            if queue_tx.send(order).await.is_err() {
                break;
            }
        }

        // Closing the queue tells the workers to drain and exit.
        drop(queue_tx);

        for (id, worker) in futures::future::join_all(workers).await.into_iter().enumerate() {
            if let Err(err) = worker {
                error!(worker = id, error = %err, "accrual worker panicked");
            }
        }

        Ok(())
    }
}

async fn worker_loop(
    id: usize,
    storage: Arc<dyn Storage>,
    client: Arc<AccrualClient>,
    queue: Arc<Mutex<mpsc::Receiver<Order>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let order = {
            let mut queue = queue.lock().await;

            tokio::select! {
                _ = shutdown.changed() => {
                    info!(worker = id, "shutdown observed, stopping worker");
                    return;
                }
                next = queue.recv() => match next {
                    Some(order) => order,
                    None => {
                        debug!(worker = id, "order queue drained, stopping worker");
                        return;
                    }
                },
            }
        };

        handle_order(id, storage.as_ref(), &client, &order).await;
    }
}

/// Per-order outcome handling. Every error here is non-fatal: the order is
/// left unsettled and the next tick re-reads current state and retries.
async fn handle_order(id: usize, storage: &dyn Storage, client: &AccrualClient, order: &Order) {
    debug!(worker = id, order = %order.number, "processing order");

    let outcome = match client.fetch_order(&order.number).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                worker = id,
                order = %order.number,
                error = %err,
                "accrual fetch failed, will retry next tick",
            );
            return;
        }
    };

    let (status, accrual) = match outcome {
        SettlementOutcome::NotFound => {
            info!(worker = id, order = %order.number, "order not registered upstream yet");
            return;
        }
        SettlementOutcome::InProgress => {
            info!(worker = id, order = %order.number, "order still processing upstream");
            return;
        }
        SettlementOutcome::Settled { status, accrual } => match status {
            SettledStatus::Invalid => (OrderStatus::Invalid, accrual),
            SettledStatus::Processed => (OrderStatus::Processed, accrual),
        },
    };

    match storage.settle_order(&order.number, status, accrual).await {
        Ok(()) => info!(
            worker = id,
            order = %order.number,
            user = %order.user_login,
            %status,
            %accrual,
            "order settled",
        ),
        Err(err) => error!(
            worker = id,
            order = %order.number,
            error = %err,
            "failed to apply settlement, will retry next tick",
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::accrual::client::AccrualClientConfig;
    use crate::ledger::memory::MemoryStorage;
    use crate::ledger::models::{User, Withdrawal};

    async fn processor_for(
        server: &MockServer,
        storage: Arc<dyn Storage>,
        pool_size: usize,
    ) -> AccrualProcessor {
        let client = AccrualClient::new(AccrualClientConfig {
            base_url: server.uri(),
            retry_attempts: 1,
            retry_wait: Duration::from_millis(1),
            retry_wait_step: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        AccrualProcessor::new(storage, Arc::new(client), pool_size)
    }

    async fn seed_order(storage: &dyn Storage, login: &str, number: &str) {
        if storage.get_user(login).await.is_err() {
            let user = User::new(login, "hash").unwrap();
            storage.create_user(&user).await.unwrap();
        }

        let order = Order::new(number, login).unwrap();
        storage.create_order(&order).await.unwrap();
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the whole test.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn processed_order_credits_balance_after_one_tick() {
        let server = MockServer::start().await;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        seed_order(storage.as_ref(), "alice", "79927398713").await;

        Mock::given(method("GET"))
            .and(path("/api/orders/79927398713"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "number": "79927398713",
                "status": "PROCESSED",
                "accrual": 500.00,
            })))
            .mount(&server)
            .await;

        let processor = processor_for(&server, Arc::clone(&storage), 1).await;
        processor.process(no_shutdown()).await.unwrap();

        let order = storage.get_order("79927398713").await.unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, dec!(500.00));

        let balance = storage.balance("alice").await.unwrap();
        assert_eq!(balance.current, dec!(500.00));

        // Settled order is gone from the next tick's query.
        let unsettled = storage
            .orders_by_status(&OrderStatus::unsettled())
            .await
            .unwrap();
        assert!(unsettled.is_empty());
    }

    #[tokio::test]
    async fn settled_balance_supports_exact_payoff_flow() {
        let server = MockServer::start().await;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        seed_order(storage.as_ref(), "alice", "79927398713").await;

        Mock::given(method("GET"))
            .and(path("/api/orders/79927398713"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "number": "79927398713",
                "status": "PROCESSED",
                "accrual": 500.00,
            })))
            .mount(&server)
            .await;

        let processor = processor_for(&server, Arc::clone(&storage), 1).await;
        processor.process(no_shutdown()).await.unwrap();

        let payoff = Withdrawal::new("alice", "2377225624", dec!(500.00)).unwrap();
        storage.withdraw(&payoff).await.unwrap();

        let balance = storage.balance("alice").await.unwrap();
        assert_eq!(balance.current, dec!(0.00));
        assert_eq!(balance.withdrawn, dec!(500.00));

        let extra = Withdrawal::new("alice", "2377225632", dec!(0.01)).unwrap();
        assert!(storage.withdraw(&extra).await.is_err());
    }

    #[tokio::test]
    async fn in_progress_order_is_left_for_the_next_tick() {
        let server = MockServer::start().await;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        seed_order(storage.as_ref(), "alice", "79927398713").await;

        Mock::given(method("GET"))
            .and(path("/api/orders/79927398713"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "number": "79927398713",
                "status": "PROCESSING",
            })))
            .mount(&server)
            .await;

        let processor = processor_for(&server, Arc::clone(&storage), 1).await;
        processor.process(no_shutdown()).await.unwrap();

        let unsettled = storage
            .orders_by_status(&OrderStatus::unsettled())
            .await
            .unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].status, OrderStatus::New);
        assert_eq!(unsettled[0].accrual, Decimal::ZERO);

        let balance = storage.balance("alice").await.unwrap();
        assert_eq!(balance.current, Decimal::ZERO);
    }

    #[tokio::test]
    async fn upstream_failure_leaves_order_untouched() {
        let server = MockServer::start().await;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        seed_order(storage.as_ref(), "alice", "79927398713").await;

        Mock::given(method("GET"))
            .and(path("/api/orders/79927398713"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let processor = processor_for(&server, Arc::clone(&storage), 1).await;
        processor.process(no_shutdown()).await.unwrap();

        let order = storage.get_order("79927398713").await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn batch_is_fully_drained_by_a_worker_pool() {
        let server = MockServer::start().await;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let numbers = ["79927398713", "12345678903", "2377225624", "2377225632"];
        for number in numbers {
            seed_order(storage.as_ref(), "alice", number).await;
            Mock::given(method("GET"))
                .and(path(format!("/api/orders/{number}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "number": number,
                    "status": "PROCESSED",
                    "accrual": 10.00,
                })))
                .mount(&server)
                .await;
        }

        let processor = processor_for(&server, Arc::clone(&storage), 3).await;
        processor.process(no_shutdown()).await.unwrap();

        // Each order credited exactly once even with concurrent workers.
        let balance = storage.balance("alice").await.unwrap();
        assert_eq!(balance.current, dec!(40.00));

        let unsettled = storage
            .orders_by_status(&OrderStatus::unsettled())
            .await
            .unwrap();
        assert!(unsettled.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_skips_the_tick() {
        let server = MockServer::start().await;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let processor = processor_for(&server, storage, 1).await;
        processor.process(no_shutdown()).await.unwrap();

        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_order_number_never_reaches_the_engine() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let user = User::new("alice", "hash").unwrap();
        storage.create_user(&user).await.unwrap();

        assert!(Order::new("1234567812345678", "alice").is_err());

        let unsettled = storage
            .orders_by_status(&OrderStatus::unsettled())
            .await
            .unwrap();
        assert!(unsettled.is_empty());
    }
}
