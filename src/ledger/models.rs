use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle of a submitted order.
///
/// NEW and PROCESSING orders are still awaiting settlement and get picked up
/// by the accrual daemon on every tick. INVALID and PROCESSED are terminal:
/// no transition ever leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    /// Statuses the reconciliation scheduler polls for.
    pub fn unsettled() -> [OrderStatus; 2] {
        [OrderStatus::New, OrderStatus::Processing]
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(format!("unknown order status {other:?}")),
        }
    }
}

/// A registered account. The login is the primary key across the whole
/// ledger; it never changes once created.
#[derive(Debug, Clone)]
pub struct User {
    pub login: String,
    pub password_hash: String,
}

impl User {
    pub fn new(login: impl Into<String>, password_hash: impl Into<String>) -> Result<Self, DomainError> {
        let login = login.into();
        validate_login(&login)?;

        Ok(Self {
            login,
            password_hash: password_hash.into(),
        })
    }
}

/// One submitted claim against the accrual system.
#[derive(Debug, Clone)]
pub struct Order {
    pub number: String,
    pub user_login: String,
    pub status: OrderStatus,
    pub accrual: Decimal,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// Creates a new order in the NEW state, rejecting malformed numbers
    /// before they ever reach the reconciliation engine.
    pub fn new(number: impl Into<String>, user_login: impl Into<String>) -> Result<Self, DomainError> {
        let number = number.into();
        let user_login = user_login.into();

        validate_order_number(&number)?;
        validate_login(&user_login)?;

        Ok(Self {
            number,
            user_login,
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            uploaded_at: Utc::now(),
        })
    }
}

/// Per-user spendable/withdrawn balance pair.
#[derive(Debug, Clone)]
pub struct Balance {
    pub login: String,
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl Balance {
    pub fn zero(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            current: Decimal::ZERO,
            withdrawn: Decimal::ZERO,
        }
    }
}

/// Immutable debit record. The order reference shares the checksum format
/// with accrual orders but lives in a distinct identifier namespace.
#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub user_login: String,
    pub order_number: String,
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn new(
        user_login: impl Into<String>,
        order_number: impl Into<String>,
        amount: Decimal,
    ) -> Result<Self, DomainError> {
        let user_login = user_login.into();
        let order_number = order_number.into();

        validate_login(&user_login)?;
        validate_order_number(&order_number)?;

        if amount <= Decimal::ZERO {
            return Err(DomainError::NonPositiveAmount);
        }

        Ok(Self {
            user_login,
            order_number,
            amount,
            processed_at: Utc::now(),
        })
    }
}

pub fn validate_login(login: &str) -> Result<(), DomainError> {
    if login.is_empty() {
        return Err(DomainError::EmptyLogin);
    }

    Ok(())
}

pub fn validate_order_number(number: &str) -> Result<(), DomainError> {
    if number.is_empty() || !luhn_valid(number) {
        return Err(DomainError::InvalidOrderNumber(number.to_string()));
    }

    Ok(())
}

/// Luhn checksum over a base-10 identifier: double every second digit from
/// the rightmost, subtract 9 when the doubled digit exceeds 9, valid iff the
/// total is divisible by 10. Any non-digit character fails the check.
fn luhn_valid(number: &str) -> bool {
    let mut sum = 0u32;
    let mut double = false;

    for byte in number.bytes().rev() {
        if !byte.is_ascii_digit() {
            return false;
        }

        let mut digit = u32::from(byte - b'0');
        if double {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }

        sum += digit;
        double = !double;
    }

    sum % 10 == 0
}
