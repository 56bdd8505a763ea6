use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::ledger::models::{Balance, Order, OrderStatus, User, Withdrawal};

/// Transactional boundary of the ledger.
///
/// Every implementation must keep cross-field mutations (order status +
/// balance credit, balance debit + withdrawal record) atomic: either both
/// writes land or neither does. Conflicts are typed results, not generic
/// failures.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates a user together with its zero balance, atomically.
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;

    async fn get_user(&self, login: &str) -> Result<User, StoreError>;

    async fn create_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_order(&self, number: &str) -> Result<Order, StoreError>;

    /// Orders submitted by one user, oldest first.
    async fn orders_by_login(&self, login: &str) -> Result<Vec<Order>, StoreError>;

    /// Orders whose status is in `statuses`, oldest first. The accrual
    /// scheduler uses this to discover unsettled orders every tick.
    async fn orders_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError>;

    /// Applies a terminal settlement outcome to an order and, when the new
    /// status is PROCESSED, credits the owner's spendable balance in the
    /// same transaction.
    ///
    /// Re-applying to an already-terminal order is an Ok no-op, so
    /// re-delivery across ticks can never double-credit.
    async fn settle_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> Result<(), StoreError>;

    async fn balance(&self, login: &str) -> Result<Balance, StoreError>;

    /// Debits the balance and records the withdrawal atomically. Rejects
    /// with `InsufficientFunds` iff the amount strictly exceeds the
    /// spendable balance; paying the balance off exactly is allowed.
    async fn withdraw(&self, withdrawal: &Withdrawal) -> Result<(), StoreError>;

    /// Withdrawals of one user, oldest first. Empty history is an empty
    /// vector, not an error.
    async fn withdrawals_by_login(&self, login: &str) -> Result<Vec<Withdrawal>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
