//! Persisted conditional orders and accounts.

use crate::domain::error::StoreError;
use crate::domain::order::{Account, ConditionalOrder, OrderStatus};
use async_trait::async_trait;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// All `waiting` orders, in id order. Rows that cannot be decoded are
    /// logged and left out.
    async fn list_waiting(&self) -> Result<Vec<ConditionalOrder>, StoreError>;

    /// Persist status, message, exchange order id and `updated_at`.
    ///
    /// Only an order still stored as `waiting` is updated; anything else is
    /// `InvalidTransition`, so a concurrent change is never overwritten.
    async fn save(&self, order: &ConditionalOrder) -> Result<(), StoreError>;

    async fn get(&self, id: i64) -> Result<ConditionalOrder, StoreError>;

    async fn list(&self) -> Result<Vec<ConditionalOrder>, StoreError>;

    /// Store a new order as `waiting` and return its id.
    async fn insert(&self, order: &ConditionalOrder) -> Result<i64, StoreError>;

    async fn get_account(&self, id: i64) -> Result<Account, StoreError>;

    async fn upsert_account(&self, account: &Account) -> Result<(), StoreError>;

    /// Cancel a `waiting` order. Any other status is an invalid transition.
    async fn cancel(&self, id: i64, reason: &str) -> Result<ConditionalOrder, StoreError> {
        let mut order = self.get(id).await?;
        order.transition(OrderStatus::Cancelled, reason)?;
        self.save(&order).await?;
        Ok(order)
    }
}
