use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use tracing::warn;

use crate::error::StoreError;
use crate::ledger::models::{Balance, Order, OrderStatus, User, Withdrawal};
use crate::ledger::store::Storage;

/// Retry policy for connection-class database failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub wait: Duration,
    pub wait_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            wait: Duration::from_secs(1),
            wait_step: Duration::from_secs(2),
        }
    }
}

/// Postgres-backed ledger store. Settlement credit and withdrawal debit run
/// inside single transactions with the balance row locked `FOR UPDATE`.
pub struct PgStorage {
    pool: PgPool,
    retry: RetryPolicy,
}

#[derive(FromRow)]
struct UserRow {
    login: String,
    password_hash: String,
}

#[derive(FromRow)]
struct OrderRow {
    number: String,
    user_login: String,
    status: String,
    accrual: Decimal,
    uploaded_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct BalanceRow {
    login: String,
    current: Decimal,
    withdrawn: Decimal,
}

#[derive(FromRow)]
struct WithdrawalRow {
    user_login: String,
    order_number: String,
    amount: Decimal,
    processed_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<OrderStatus>().map_err(StoreError::Decode)?;

        Ok(Order {
            number: row.number,
            user_login: row.user_login,
            status,
            accrual: row.accrual,
            uploaded_at: row.uploaded_at,
        })
    }
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Retries `op` on connection-class errors with linearly increasing
    /// backoff; all other errors are returned immediately.
    async fn with_retry<T, Fut>(&self, op: impl Fn() -> Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.attempts => {
                    let wait = self.retry.wait + self.retry.wait_step * attempt;
                    warn!(error = %err, attempt, wait = ?wait, "retrying database operation");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn create_user_once(&self, user: &User) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO users (login, password_hash) VALUES ($1, $2) ON CONFLICT (login) DO NOTHING",
        )
        .bind(&user.login)
        .bind(&user.password_hash)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::UserAlreadyExists);
        }

        // The zero balance is born in the same transaction as the user.
        sqlx::query("INSERT INTO balances (login) VALUES ($1)")
            .bind(&user.login)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn get_user_once(&self, login: &str) -> Result<User, StoreError> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT login, password_hash FROM users WHERE login = $1")
                .bind(login)
                .fetch_optional(&self.pool)
                .await?;

        let row = row.ok_or(StoreError::UserNotFound)?;

        Ok(User {
            login: row.login,
            password_hash: row.password_hash,
        })
    }

    async fn create_order_once(&self, order: &Order) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO orders (number, user_login, status, accrual, uploaded_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (number) DO NOTHING",
        )
        .bind(&order.number)
        .bind(&order.user_login)
        .bind(order.status.as_str())
        .bind(order.accrual)
        .bind(order.uploaded_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::OrderAlreadyExists);
        }

        Ok(())
    }

    async fn get_order_once(&self, number: &str) -> Result<Order, StoreError> {
        let row: Option<OrderRow> = sqlx::query_as(
            "SELECT number, user_login, status, accrual, uploaded_at FROM orders WHERE number = $1",
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::OrderNotFound)?.try_into()
    }

    async fn orders_by_login_once(&self, login: &str) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            "SELECT number, user_login, status, accrual, uploaded_at FROM orders \
             WHERE user_login = $1 ORDER BY uploaded_at ASC",
        )
        .bind(login)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    async fn orders_by_status_once(
        &self,
        statuses: &[OrderStatus],
    ) -> Result<Vec<Order>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        let rows: Vec<OrderRow> = sqlx::query_as(
            "SELECT number, user_login, status, accrual, uploaded_at FROM orders \
             WHERE status = ANY($1) ORDER BY uploaded_at ASC",
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    async fn settle_order_once(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<OrderRow> = sqlx::query_as(
            "SELECT number, user_login, status, accrual, uploaded_at FROM orders \
             WHERE number = $1 FOR UPDATE",
        )
        .bind(number)
        .fetch_optional(&mut *tx)
        .await?;

        let order: Order = row.ok_or(StoreError::OrderNotFound)?.try_into()?;

        // Idempotency guard: re-delivery of a terminal outcome is a no-op.
        if order.status.is_terminal() {
            return Ok(());
        }

        sqlx::query("UPDATE orders SET status = $1, accrual = $2 WHERE number = $3")
            .bind(status.as_str())
            .bind(accrual)
            .bind(number)
            .execute(&mut *tx)
            .await?;

        if status == OrderStatus::Processed {
            let updated = sqlx::query("UPDATE balances SET current = current + $1 WHERE login = $2")
                .bind(accrual)
                .bind(&order.user_login)
                .execute(&mut *tx)
                .await?;

            if updated.rows_affected() == 0 {
                return Err(StoreError::BalanceNotFound);
            }
        }

        tx.commit().await?;

        Ok(())
    }

    async fn balance_once(&self, login: &str) -> Result<Balance, StoreError> {
        let row: Option<BalanceRow> =
            sqlx::query_as("SELECT login, current, withdrawn FROM balances WHERE login = $1")
                .bind(login)
                .fetch_optional(&self.pool)
                .await?;

        let row = row.ok_or(StoreError::BalanceNotFound)?;

        Ok(Balance {
            login: row.login,
            current: row.current,
            withdrawn: row.withdrawn,
        })
    }

    async fn withdraw_once(&self, withdrawal: &Withdrawal) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<BalanceRow> = sqlx::query_as(
            "SELECT login, current, withdrawn FROM balances WHERE login = $1 FOR UPDATE",
        )
        .bind(&withdrawal.user_login)
        .fetch_optional(&mut *tx)
        .await?;

        let balance = row.ok_or(StoreError::BalanceNotFound)?;

        if withdrawal.amount > balance.current {
            return Err(StoreError::InsufficientFunds {
                requested: withdrawal.amount,
                available: balance.current,
            });
        }

        sqlx::query(
            "UPDATE balances SET current = current - $1, withdrawn = withdrawn + $1 WHERE login = $2",
        )
        .bind(withdrawal.amount)
        .bind(&withdrawal.user_login)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO withdrawals (user_login, order_number, amount, processed_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&withdrawal.user_login)
        .bind(&withdrawal.order_number)
        .bind(withdrawal.amount)
        .bind(withdrawal.processed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn withdrawals_by_login_once(&self, login: &str) -> Result<Vec<Withdrawal>, StoreError> {
        let rows: Vec<WithdrawalRow> = sqlx::query_as(
            "SELECT user_login, order_number, amount, processed_at FROM withdrawals \
             WHERE user_login = $1 ORDER BY processed_at ASC",
        )
        .bind(login)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Withdrawal {
                user_login: row.user_login,
                order_number: row.order_number,
                amount: row.amount,
                processed_at: row.processed_at,
            })
            .collect())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        self.with_retry(|| self.create_user_once(user)).await
    }

    async fn get_user(&self, login: &str) -> Result<User, StoreError> {
        self.with_retry(|| self.get_user_once(login)).await
    }

    async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
        self.with_retry(|| self.create_order_once(order)).await
    }

    async fn get_order(&self, number: &str) -> Result<Order, StoreError> {
        self.with_retry(|| self.get_order_once(number)).await
    }

    async fn orders_by_login(&self, login: &str) -> Result<Vec<Order>, StoreError> {
        self.with_retry(|| self.orders_by_login_once(login)).await
    }

    async fn orders_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError> {
        self.with_retry(|| self.orders_by_status_once(statuses))
            .await
    }

    async fn settle_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> Result<(), StoreError> {
        self.with_retry(|| self.settle_order_once(number, status, accrual))
            .await
    }

    async fn balance(&self, login: &str) -> Result<Balance, StoreError> {
        self.with_retry(|| self.balance_once(login)).await
    }

    async fn withdraw(&self, withdrawal: &Withdrawal) -> Result<(), StoreError> {
        self.with_retry(|| self.withdraw_once(withdrawal)).await
    }

    async fn withdrawals_by_login(&self, login: &str) -> Result<Vec<Withdrawal>, StoreError> {
        self.with_retry(|| self.withdrawals_by_login_once(login))
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_retry(|| async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }
}
