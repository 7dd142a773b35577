//! Exchange trading interface and the factory that builds one per account.

use crate::domain::error::ExchangeError;
use crate::domain::order::{
    Account, ConditionalOrder, MarginType, OrderAction, OrderType, PositionSide, Side, SizeType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub margin_type: MarginType,
    pub order_type: OrderType,
    /// Ignored for market orders.
    pub price: f64,
    pub size: f64,
    pub size_type: SizeType,
    /// Closing orders only shrink a position and cost nothing up front.
    pub reduce_only: bool,
    pub client_order_id: String,
}

impl From<&ConditionalOrder> for OrderRequest {
    fn from(order: &ConditionalOrder) -> Self {
        Self {
            symbol: order.symbol.clone(),
            side: order.side,
            position_side: order.position_side,
            margin_type: order.margin_type,
            order_type: order.order_type,
            price: order.price,
            size: order.size,
            size_type: order.size_type,
            reduce_only: order.action == OrderAction::Close,
            client_order_id: format!("co-{}", order.id),
        }
    }
}

/// Result of the affordability pre-check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderCost {
    pub affordable: bool,
    pub contracts: f64,
    pub cost: f64,
    pub available: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub exchange_order_id: String,
    pub filled_contracts: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosePositionRequest {
    pub symbol: String,
    pub position_side: PositionSide,
    pub margin_type: MarginType,
}

impl From<&ConditionalOrder> for ClosePositionRequest {
    fn from(order: &ConditionalOrder) -> Self {
        Self {
            symbol: order.symbol.clone(),
            position_side: order.position_side,
            margin_type: order.margin_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub currency: String,
    pub total: f64,
    pub available: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub position_side: PositionSide,
    /// Signed for net positions, positive otherwise.
    pub contracts: f64,
    pub entry_price: f64,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Establish a session for `account`. Calling it again is a no-op.
    async fn connect(&self, account: &Account) -> Result<(), ExchangeError>;

    async fn balance(&self) -> Result<Balance, ExchangeError>;

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn calc_order_cost(&self, request: &OrderRequest) -> Result<OrderCost, ExchangeError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str)
    -> Result<(), ExchangeError>;

    async fn close_position(&self, request: &ClosePositionRequest) -> Result<(), ExchangeError>;
}

/// Builds exchange sessions of one kind.
pub trait ExchangeFactory: Send + Sync {
    fn kind(&self) -> &str;

    fn create(&self, account: &Account) -> Result<Arc<dyn Exchange>, ExchangeError>;
}
