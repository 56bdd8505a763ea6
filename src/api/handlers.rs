use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use tracing::info;
use validator::Validate;

use crate::api::models::{
    BalanceResponse, CredentialsRequest, OrderResponse, TokenResponse, WithdrawRequest,
    WithdrawalResponse,
};
use crate::auth::{self, TokenManager};
use crate::error::{AppError, AppResult, StoreError};
use crate::ledger::models::{Order, User, Withdrawal};
use crate::ledger::store::Storage;
use crate::middleware::{AuthUser, RateLimitLayer};

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub tokens: TokenManager,
    pub auth_limiter: RateLimitLayer,
}

/// Successful registration and login both answer with the token in the
/// `Authorization` header as well as the body.
fn token_response(tokens: &TokenManager, login: &str) -> AppResult<Response> {
    let token = tokens.issue(login)?;

    let header_value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|err| AppError::Internal(format!("malformed token header: {err}")))?;

    let mut response = Json(TokenResponse { token }).into_response();
    response
        .headers_mut()
        .insert(header::AUTHORIZATION, header_value);

    Ok(response)
}

pub async fn register(
    State(state): State<AppState>,
    Json(creds): Json<CredentialsRequest>,
) -> AppResult<Response> {
    creds
        .validate()
        .map_err(|err| AppError::InvalidInput(err.to_string()))?;

    let hash = auth::hash_password(&creds.password)?;
    let user = User::new(&creds.login, &hash)?;

    state.storage.create_user(&user).await?;
    info!(login = %user.login, "user registered");

    token_response(&state.tokens, &user.login)
}

pub async fn login(
    State(state): State<AppState>,
    Json(creds): Json<CredentialsRequest>,
) -> AppResult<Response> {
    creds
        .validate()
        .map_err(|err| AppError::InvalidInput(err.to_string()))?;

    let user = state.storage.get_user(&creds.login).await?;

    if !auth::verify_password(&creds.password, &user.password_hash)? {
        return Err(AppError::Unauthorized);
    }

    token_response(&state.tokens, &user.login)
}

/// Accepts an order number as a plain-text body. A resubmission by the same
/// user is acknowledged with 200; the same number from another user is a
/// conflict.
pub async fn create_order(
    State(state): State<AppState>,
    Extension(AuthUser(login)): Extension<AuthUser>,
    body: String,
) -> AppResult<StatusCode> {
    let order = Order::new(body.trim(), &login)?;

    match state.storage.create_order(&order).await {
        Ok(()) => {
            info!(order = %order.number, %login, "order accepted for settlement");
            Ok(StatusCode::ACCEPTED)
        }
        Err(StoreError::OrderAlreadyExists) => {
            let existing = state.storage.get_order(&order.number).await?;

            if existing.user_login == login {
                Ok(StatusCode::OK)
            } else {
                Err(AppError::OrderOwnedByAnotherUser)
            }
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn list_orders(
    State(state): State<AppState>,
    Extension(AuthUser(login)): Extension<AuthUser>,
) -> AppResult<Response> {
    let orders = state.storage.orders_by_login(&login).await?;

    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();

    Ok(Json(body).into_response())
}

pub async fn balance(
    State(state): State<AppState>,
    Extension(AuthUser(login)): Extension<AuthUser>,
) -> AppResult<Json<BalanceResponse>> {
    let balance = state.storage.balance(&login).await?;

    Ok(Json(BalanceResponse::from(balance)))
}

pub async fn withdraw(
    State(state): State<AppState>,
    Extension(AuthUser(login)): Extension<AuthUser>,
    Json(req): Json<WithdrawRequest>,
) -> AppResult<StatusCode> {
    let withdrawal = Withdrawal::new(&login, &req.order, req.sum)?;

    state.storage.withdraw(&withdrawal).await?;
    info!(order = %withdrawal.order_number, %login, amount = %withdrawal.amount, "withdrawal applied");

    Ok(StatusCode::OK)
}

pub async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(AuthUser(login)): Extension<AuthUser>,
) -> AppResult<Response> {
    let withdrawals = state.storage.withdrawals_by_login(&login).await?;

    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<WithdrawalResponse> = withdrawals
        .into_iter()
        .map(WithdrawalResponse::from)
        .collect();

    Ok(Json(body).into_response())
}

pub async fn health(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    state.storage.ping().await?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}
