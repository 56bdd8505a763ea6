use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ledger::models::{Balance, Order, OrderStatus, Withdrawal};

#[derive(Debug, Deserialize, Validate)]
pub struct CredentialsRequest {
    #[validate(length(min = 1, message = "login must not be empty"))]
    pub login: String,
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub number: String,
    pub status: OrderStatus,
    /// Present only once the order reached PROCESSED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let accrual = match order.status {
            OrderStatus::Processed => Some(order.accrual),
            _ => None,
        };

        Self {
            number: order.number,
            status: order.status,
            accrual,
            uploaded_at: order.uploaded_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl From<Balance> for BalanceResponse {
    fn from(balance: Balance) -> Self {
        Self {
            current: balance.current,
            withdrawn: balance.withdrawn,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    pub sum: Decimal,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalResponse {
    pub order: String,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<Withdrawal> for WithdrawalResponse {
    fn from(withdrawal: Withdrawal) -> Self {
        Self {
            order: withdrawal.order_number,
            sum: withdrawal.amount,
            processed_at: withdrawal.processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn accrual_is_omitted_until_processed() {
        let order = Order::new("79927398713", "alice").unwrap();
        let body = serde_json::to_value(OrderResponse::from(order)).unwrap();

        assert_eq!(body["status"], "NEW");
        assert!(body.get("accrual").is_none());
    }

    #[test]
    fn accrual_is_present_once_processed() {
        let mut order = Order::new("79927398713", "alice").unwrap();
        order.status = OrderStatus::Processed;
        order.accrual = dec!(500.00);

        let body = serde_json::to_value(OrderResponse::from(order)).unwrap();

        assert_eq!(body["status"], "PROCESSED");
        assert_eq!(body["accrual"], serde_json::json!(500.0));
    }

    #[test]
    fn empty_credentials_fail_validation() {
        let creds = CredentialsRequest {
            login: String::new(),
            password: "pw".to_string(),
        };

        assert!(creds.validate().is_err());
    }
}
