use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::handlers::{
    balance, create_order, health, list_orders, list_withdrawals, login, register, withdraw,
    AppState,
};
use crate::middleware::{rate_limit, require_auth};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let public = Router::new()
        .route("/api/user/register", post(register))
        .route("/api/user/login", post(login))
        .layer(from_fn_with_state(state.clone(), rate_limit));

    let protected = Router::new()
        .route("/api/user/orders", post(create_order).get(list_orders))
        .route("/api/user/balance", get(balance))
        .route("/api/user/balance/withdraw", post(withdraw))
        .route("/api/user/withdrawals", get(list_withdrawals))
        .layer(from_fn_with_state(state.clone(), require_auth));

    let app = Router::new()
        .route("/health", get(health))
        .merge(public)
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::very_permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: watch::Sender<bool>,
    accrual: JoinHandle<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    // Give the reconciliation loop a moment to finish its batch.
    if tokio::time::timeout(Duration::from_secs(5), accrual)
        .await
        .is_err()
    {
        error!("accrual scheduler did not stop within the grace period");
    }

    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown.send(true);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::TokenManager;
    use crate::ledger::memory::MemoryStorage;
    use crate::ledger::models::OrderStatus;
    use crate::ledger::store::Storage;
    use crate::middleware::RateLimitLayer;

    fn test_app() -> (Router, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let state = AppState {
            storage: storage.clone(),
            tokens: TokenManager::new("test-secret", chrono::Duration::hours(1)),
            auth_limiter: RateLimitLayer::new(1000, 60),
        };

        (create_app(state), storage)
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn text_post(uri: &str, token: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_with_token(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn register_user(app: &Router, login: &str) -> String {
        let response = app
            .clone()
            .oneshot(json_post(
                "/api/user/register",
                serde_json::json!({ "login": login, "password": "s3cret" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let header = response
            .headers()
            .get(header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap();

        header.strip_prefix("Bearer ").unwrap().to_string()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn register_issues_token_and_rejects_duplicates() {
        let (app, _) = test_app();

        let token = register_user(&app, "alice").await;
        assert!(!token.is_empty());

        let response = app
            .oneshot(json_post(
                "/api/user/register",
                serde_json::json!({ "login": "alice", "password": "other" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn login_round_trip_and_wrong_password() {
        let (app, _) = test_app();
        register_user(&app, "alice").await;

        let response = app
            .clone()
            .oneshot(json_post(
                "/api/user/login",
                serde_json::json!({ "login": "alice", "password": "s3cret" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert!(body["token"].as_str().is_some());

        let response = app
            .clone()
            .oneshot(json_post(
                "/api/user/login",
                serde_json::json!({ "login": "alice", "password": "wrong" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(json_post(
                "/api/user/login",
                serde_json::json!({ "login": "nobody", "password": "s3cret" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn order_submission_status_codes() {
        let (app, _) = test_app();
        let alice = register_user(&app, "alice").await;
        let bob = register_user(&app, "bob").await;

        // First submission is accepted for settlement.
        let response = app
            .clone()
            .oneshot(text_post("/api/user/orders", &alice, "79927398713"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // Resubmission by the same user is acknowledged.
        let response = app
            .clone()
            .oneshot(text_post("/api/user/orders", &alice, "79927398713"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Same number from another user is a conflict.
        let response = app
            .clone()
            .oneshot(text_post("/api/user/orders", &bob, "79927398713"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Bad checksum is unprocessable.
        let response = app
            .oneshot(text_post("/api/user/orders", &alice, "79927398710"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn protected_routes_require_a_valid_token() {
        let (app, _) = test_app();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/user/orders")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(get_with_token("/api/user/balance", "bogus-token"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_listings_answer_no_content() {
        let (app, _) = test_app();
        let token = register_user(&app, "alice").await;

        let response = app
            .clone()
            .oneshot(get_with_token("/api/user/orders", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(get_with_token("/api/user/withdrawals", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn order_listing_shows_accrual_only_when_processed() {
        let (app, storage) = test_app();
        let token = register_user(&app, "alice").await;

        app.clone()
            .oneshot(text_post("/api/user/orders", &token, "79927398713"))
            .await
            .unwrap();
        // Distinct upload timestamps keep the listing order deterministic.
        tokio::time::sleep(Duration::from_millis(2)).await;
        app.clone()
            .oneshot(text_post("/api/user/orders", &token, "12345678903"))
            .await
            .unwrap();

        storage
            .settle_order("79927398713", OrderStatus::Processed, dec!(500.00))
            .await
            .unwrap();

        let response = app
            .oneshot(get_with_token("/api/user/orders", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let orders = body.as_array().unwrap();
        assert_eq!(orders.len(), 2);

        // Oldest first.
        assert_eq!(orders[0]["number"], "79927398713");
        assert_eq!(orders[0]["status"], "PROCESSED");
        assert_eq!(orders[0]["accrual"], serde_json::json!(500.0));
        assert_eq!(orders[1]["number"], "12345678903");
        assert_eq!(orders[1]["status"], "NEW");
        assert!(orders[1].get("accrual").is_none());
    }

    #[tokio::test]
    async fn withdrawal_flow_and_insufficient_funds() {
        let (app, storage) = test_app();
        let token = register_user(&app, "alice").await;

        app.clone()
            .oneshot(text_post("/api/user/orders", &token, "79927398713"))
            .await
            .unwrap();
        storage
            .settle_order("79927398713", OrderStatus::Processed, dec!(500.00))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(json_post_with_token(
                "/api/user/balance/withdraw",
                &token,
                serde_json::json!({ "order": "2377225624", "sum": 500.00 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Balance reflects the debit.
        let response = app
            .clone()
            .oneshot(get_with_token("/api/user/balance", &token))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["current"], serde_json::json!(0.0));
        assert_eq!(body["withdrawn"], serde_json::json!(500.0));

        // The account is fully spent now.
        let response = app
            .clone()
            .oneshot(json_post_with_token(
                "/api/user/balance/withdraw",
                &token,
                serde_json::json!({ "order": "2377225632", "sum": 0.01 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        // Bad order number on a withdrawal is unprocessable.
        let response = app
            .clone()
            .oneshot(json_post_with_token(
                "/api/user/balance/withdraw",
                &token,
                serde_json::json!({ "order": "79927398710", "sum": 1.00 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        // History lists the successful withdrawal only.
        let response = app
            .oneshot(get_with_token("/api/user/withdrawals", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let withdrawals = body.as_array().unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0]["order"], "2377225624");
        assert_eq!(withdrawals[0]["sum"], serde_json::json!(500.0));
    }

    #[tokio::test]
    async fn auth_rate_limit_answers_too_many_requests() {
        let storage = Arc::new(MemoryStorage::new());
        let state = AppState {
            storage,
            tokens: TokenManager::new("test-secret", chrono::Duration::hours(1)),
            auth_limiter: RateLimitLayer::new(1, 60),
        };
        let app = create_app(state);

        register_user(&app, "alice").await;

        let response = app
            .oneshot(json_post(
                "/api/user/login",
                serde_json::json!({ "login": "alice", "password": "s3cret" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let (app, _) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    fn json_post_with_token(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}
