use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::accrual::client::{AccrualClient, AccrualClientConfig};
use crate::accrual::processor::AccrualProcessor;
use crate::accrual::scheduler::AccrualScheduler;
use crate::api::handlers::AppState;
use crate::auth::TokenManager;
use crate::config::Config;
use crate::error::AppResult;
use crate::ledger::memory::MemoryStorage;
use crate::ledger::postgres::PgStorage;
use crate::ledger::store::Storage;
use crate::middleware::RateLimitLayer;

/// Fully wired application: HTTP state plus the running reconciliation
/// loop and its shutdown handle.
pub struct App {
    pub state: AppState,
    pub accrual: JoinHandle<()>,
    pub shutdown: watch::Sender<bool>,
}

pub async fn initialize(config: &Config) -> AppResult<App> {
    info!("Initializing application components ...");

    let storage: Arc<dyn Storage> = match &config.database_uri {
        Some(uri) => {
            let pool = initialize_database(uri).await?;
            Arc::new(PgStorage::new(pool))
        }
        None => {
            info!("DATABASE_URI not set, using in-memory store");
            Arc::new(MemoryStorage::new())
        }
    };

    let tokens = TokenManager::new(
        &config.jwt_secret,
        chrono::Duration::hours(config.token_ttl_hours),
    );
    let auth_limiter = RateLimitLayer::new(
        config.auth_rate_limit,
        config.auth_rate_limit_period_secs,
    );

    let client = AccrualClient::new(AccrualClientConfig {
        base_url: config.accrual_address.clone(),
        retry_attempts: config.accrual_retry_attempts,
        retry_wait: Duration::from_secs(config.accrual_retry_wait_secs),
        ..AccrualClientConfig::default()
    })?;

    let processor = Arc::new(AccrualProcessor::new(
        storage.clone(),
        Arc::new(client),
        config.accrual_workers,
    ));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let scheduler = AccrualScheduler::new(
        Duration::from_secs(config.accrual_poll_interval_secs),
        processor,
    );
    let accrual = scheduler.start(shutdown_rx);
    info!("✅ Accrual reconciliation loop started");

    Ok(App {
        state: AppState {
            storage,
            tokens,
            auth_limiter,
        },
        accrual,
        shutdown,
    })
}

async fn initialize_database(database_uri: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_uri)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
