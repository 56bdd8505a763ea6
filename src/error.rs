use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Accrual service error: {0}")]
    Accrual(#[from] AccrualError),

    #[error("Domain validation error: {0}")]
    Domain(#[from] DomainError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Too many requests")]
    RateLimited,

    #[error("Order already submitted by another user")]
    OrderOwnedByAnotherUser,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Typed outcomes of the ledger store. Conflicts and insufficient funds are
/// expected results, not failures; callers match on them.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("user already exists")]
    UserAlreadyExists,

    #[error("user not found")]
    UserNotFound,

    #[error("order already exists")]
    OrderAlreadyExists,

    #[error("order not found")]
    OrderNotFound,

    #[error("balance not found")]
    BalanceNotFound,

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    #[error("stored row is malformed: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Connection-class failures that the Postgres store retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            )
        )
    }
}

/// Errors surfaced by the accrual settlement client. None of these are fatal:
/// the order stays unsettled and is retried on a future tick.
#[derive(Error, Debug)]
pub enum AccrualError {
    #[error("accrual service rate limited the request")]
    RateLimited,

    #[error("accrual service failed with status {0}")]
    Upstream(u16),

    #[error("accrual service returned unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("accrual service reported unknown order status {0:?}")]
    UnknownStatus(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Validation errors raised before anything reaches the store or the
/// reconciliation engine.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DomainError {
    #[error("user login is empty")]
    EmptyLogin,

    #[error("order number {0:?} failed checksum validation")]
    InvalidOrderNumber(String),

    #[error("withdrawal amount must be positive")]
    NonPositiveAmount,
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Store(StoreError::UserAlreadyExists) => (
                StatusCode::CONFLICT,
                "LOGIN_ALREADY_TAKEN",
                "Login is already taken".to_string(),
                None,
            ),
            AppError::Store(StoreError::UserNotFound) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIALS",
                "Invalid login or password".to_string(),
                None,
            ),
            AppError::Store(StoreError::OrderAlreadyExists) => (
                StatusCode::CONFLICT,
                "ORDER_ALREADY_EXISTS",
                "Order has already been submitted".to_string(),
                None,
            ),
            AppError::Store(StoreError::OrderNotFound) => (
                StatusCode::NOT_FOUND,
                "ORDER_NOT_FOUND",
                "Order not found".to_string(),
                None,
            ),
            AppError::Store(StoreError::BalanceNotFound) => (
                StatusCode::NOT_FOUND,
                "BALANCE_NOT_FOUND",
                "Balance not found".to_string(),
                None,
            ),
            AppError::Store(StoreError::InsufficientFunds {
                requested,
                available,
            }) => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_FUNDS",
                "Not enough points on the balance".to_string(),
                Some(serde_json::json!({
                    "requested": requested,
                    "available": available,
                })),
            ),
            AppError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                "A storage error occurred".to_string(),
                None,
            ),
            AppError::Domain(DomainError::InvalidOrderNumber(number)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "ORDER_NUMBER_INVALID",
                format!("Order number {number:?} is not a valid identifier"),
                None,
            ),
            AppError::Domain(DomainError::NonPositiveAmount) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "WITHDRAWAL_AMOUNT_INVALID",
                "Withdrawal amount must be positive".to_string(),
                None,
            ),
            AppError::Domain(err) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                err.to_string(),
                None,
            ),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg, None),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required".to_string(),
                None,
            ),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "TOO_MANY_REQUESTS",
                "Rate limit exceeded. Please try again later.".to_string(),
                None,
            ),
            AppError::OrderOwnedByAnotherUser => (
                StatusCode::CONFLICT,
                "ORDER_OWNED_BY_ANOTHER_USER",
                "Order has already been submitted by another user".to_string(),
                None,
            ),
            AppError::Accrual(_) => (
                StatusCode::BAD_GATEWAY,
                "ACCRUAL_UNAVAILABLE",
                "Accrual service is unavailable".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(error: bcrypt::BcryptError) -> Self {
        AppError::Internal(format!("Password hashing error: {error:?}"))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {error:?}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        AppError::Store(StoreError::Database(error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
