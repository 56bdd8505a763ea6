mod accrual;
mod api;
mod auth;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod middleware;
mod server;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,loyalty_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting loyalty points backend");

    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;

    let app = bootstrap::initialize(&config).await?;
    let router = server::create_app(app.state);

    server::run_server(router, &config.run_address, app.shutdown, app.accrual)
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    Ok(())
}
