use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::ledger::models::{Balance, Order, OrderStatus, User, Withdrawal};
use crate::ledger::store::Storage;

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    balances: HashMap<String, Balance>,
    orders: HashMap<String, Order>,
    withdrawals: HashMap<String, Vec<Withdrawal>>,
}

/// In-memory ledger store, used when no database is configured and in tests.
///
/// A single lock guards the whole state, so every operation runs as one
/// coherent transaction and the atomicity contract of [`Storage`] holds
/// trivially.
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        if inner.users.contains_key(&user.login) {
            return Err(StoreError::UserAlreadyExists);
        }

        inner.users.insert(user.login.clone(), user.clone());
        inner
            .balances
            .insert(user.login.clone(), Balance::zero(&user.login));

        Ok(())
    }

    async fn get_user(&self, login: &str) -> Result<User, StoreError> {
        let inner = self.inner.read().await;

        inner
            .users
            .get(login)
            .cloned()
            .ok_or(StoreError::UserNotFound)
    }

    async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        if inner.orders.contains_key(&order.number) {
            return Err(StoreError::OrderAlreadyExists);
        }

        inner.orders.insert(order.number.clone(), order.clone());

        Ok(())
    }

    async fn get_order(&self, number: &str) -> Result<Order, StoreError> {
        let inner = self.inner.read().await;

        inner
            .orders
            .get(number)
            .cloned()
            .ok_or(StoreError::OrderNotFound)
    }

    async fn orders_by_login(&self, login: &str) -> Result<Vec<Order>, StoreError> {
        let inner = self.inner.read().await;

        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|order| order.user_login == login)
            .cloned()
            .collect();

        orders.sort_by_key(|order| order.uploaded_at);

        Ok(orders)
    }

    async fn orders_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError> {
        let inner = self.inner.read().await;

        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|order| statuses.contains(&order.status))
            .cloned()
            .collect();

        orders.sort_by_key(|order| order.uploaded_at);

        Ok(orders)
    }

    async fn settle_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        let order = inner.orders.get(number).ok_or(StoreError::OrderNotFound)?;

        // Idempotency guard: a terminal order never moves again, and its
        // accrual is never credited twice.
        if order.status.is_terminal() {
            return Ok(());
        }

        let login = order.user_login.clone();

        if status == OrderStatus::Processed {
            let balance = inner
                .balances
                .get_mut(&login)
                .ok_or(StoreError::BalanceNotFound)?;
            balance.current += accrual;
        }

        if let Some(order) = inner.orders.get_mut(number) {
            order.status = status;
            order.accrual = accrual;
        }

        Ok(())
    }

    async fn balance(&self, login: &str) -> Result<Balance, StoreError> {
        let inner = self.inner.read().await;

        inner
            .balances
            .get(login)
            .cloned()
            .ok_or(StoreError::BalanceNotFound)
    }

    async fn withdraw(&self, withdrawal: &Withdrawal) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        let balance = inner
            .balances
            .get_mut(&withdrawal.user_login)
            .ok_or(StoreError::BalanceNotFound)?;

        if withdrawal.amount > balance.current {
            return Err(StoreError::InsufficientFunds {
                requested: withdrawal.amount,
                available: balance.current,
            });
        }

        balance.current -= withdrawal.amount;
        balance.withdrawn += withdrawal.amount;

        inner
            .withdrawals
            .entry(withdrawal.user_login.clone())
            .or_default()
            .push(withdrawal.clone());

        Ok(())
    }

    async fn withdrawals_by_login(&self, login: &str) -> Result<Vec<Withdrawal>, StoreError> {
        let inner = self.inner.read().await;

        let mut withdrawals = inner.withdrawals.get(login).cloned().unwrap_or_default();
        withdrawals.sort_by_key(|withdrawal| withdrawal.processed_at);

        Ok(withdrawals)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
