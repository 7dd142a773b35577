#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use ruletrader::domain::error::{DataError, ExchangeError, StoreError};
use ruletrader::domain::exchange_hub::ExchangeHub;
use ruletrader::domain::order::{Account, ConditionalOrder, OrderStatus, Side};
use ruletrader::domain::registry::Registry;
use ruletrader::domain::scheduler::{Scheduler, SchedulerConfig};
use ruletrader::domain::value::Value;
use ruletrader::ports::data_source_port::{DataSource, WindowParam};
use ruletrader::ports::exchange_port::{
    Balance, ClosePositionRequest, Exchange, ExchangeFactory, OrderCost, OrderRequest,
    OrderResult, Position, Ticker,
};
use ruletrader::ports::order_store_port::OrderStore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MOCK_KIND: &str = "mock";

/// In-memory data source with scripted values, errors and series.
pub struct MockDataSource {
    name: String,
    values: HashMap<(String, String), Value>,
    errors: HashMap<(String, String), String>,
    series: HashMap<(String, String), Vec<f64>>,
    windowed: Vec<WindowParam>,
    pub calls: AtomicUsize,
}

impl MockDataSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: HashMap::new(),
            errors: HashMap::new(),
            series: HashMap::new(),
            windowed: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_value(mut self, entity: &str, field: &str, value: impl Into<Value>) -> Self {
        self.values
            .insert((entity.to_string(), field.to_string()), value.into());
        self
    }

    pub fn with_error(mut self, entity: &str, field: &str, reason: &str) -> Self {
        self.errors
            .insert((entity.to_string(), field.to_string()), reason.to_string());
        self
    }

    pub fn with_series(mut self, entity: &str, field: &str, points: Vec<f64>) -> Self {
        self.series
            .insert((entity.to_string(), field.to_string()), points);
        self
    }

    /// Mark `function`'s argument `arg_index` as the window length for
    /// arguments drawn from this source.
    pub fn with_window_param(mut self, function: &'static str, arg_index: usize) -> Self {
        self.windowed.push(WindowParam::new(function, arg_index));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn key(entity: &str, field: &str) -> (String, String) {
        (entity.to_string(), field.to_string())
    }
}

#[async_trait]
impl DataSource for MockDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_value(&self, entity: &str, field: &str) -> Result<Value, DataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = Self::key(entity, field);
        if let Some(reason) = self.errors.get(&key) {
            return Err(DataError::Provider(reason.clone()));
        }
        self.values.get(&key).cloned().ok_or(DataError::NoData {
            entity: entity.to_string(),
            field: field.to_string(),
        })
    }

    async fn get_window(
        &self,
        entity: &str,
        field: &str,
        length: usize,
    ) -> Result<Vec<f64>, DataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = Self::key(entity, field);
        if let Some(reason) = self.errors.get(&key) {
            return Err(DataError::Provider(reason.clone()));
        }
        let points = self.series.get(&key).ok_or(DataError::NoData {
            entity: entity.to_string(),
            field: field.to_string(),
        })?;
        let start = points.len().saturating_sub(length);
        Ok(points[start..].to_vec())
    }

    fn window_params(&self) -> Vec<WindowParam> {
        self.windowed.clone()
    }
}

/// Scripted exchange. Records every order it is asked to place or close.
pub struct MockExchange {
    pub available: Mutex<f64>,
    pub create_error: Mutex<Option<ExchangeError>>,
    pub close_error: Mutex<Option<ExchangeError>>,
    pub cost_error: Mutex<Option<ExchangeError>>,
    pub delay: Mutex<Option<Duration>>,
    pub created: Mutex<Vec<OrderRequest>>,
    pub closed: Mutex<Vec<ClosePositionRequest>>,
    pub connects: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockExchange {
    pub fn new(available: f64) -> Self {
        Self {
            available: Mutex::new(available),
            create_error: Mutex::new(None),
            close_error: Mutex::new(None),
            cost_error: Mutex::new(None),
            delay: Mutex::new(None),
            created: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn fail_create(&self, err: ExchangeError) {
        *self.create_error.lock().unwrap() = Some(err);
    }

    pub fn fail_close(&self, err: ExchangeError) {
        *self.close_error.lock().unwrap() = Some(err);
    }

    pub fn fail_cost(&self, err: ExchangeError) {
        *self.cost_error.lock().unwrap() = Some(err);
    }

    /// Make every order placement sleep for `delay` first.
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn created_symbols(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.symbol.clone())
            .collect()
    }

    fn reference_price(request: &OrderRequest) -> f64 {
        if request.price > 0.0 { request.price } else { 100.0 }
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &str {
        MOCK_KIND
    }

    async fn connect(&self, _account: &Account) -> Result<(), ExchangeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn balance(&self) -> Result<Balance, ExchangeError> {
        let available = *self.available.lock().unwrap();
        Ok(Balance {
            currency: "USDT".to_string(),
            total: available,
            available,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: 100.0,
            bid: 99.9,
            ask: 100.1,
            timestamp: Utc::now(),
        })
    }

    async fn calc_order_cost(&self, request: &OrderRequest) -> Result<OrderCost, ExchangeError> {
        if let Some(err) = self.cost_error.lock().unwrap().clone() {
            return Err(err);
        }
        let available = *self.available.lock().unwrap();
        let cost = if request.reduce_only {
            0.0
        } else {
            request.size * Self::reference_price(request)
        };
        Ok(OrderCost {
            affordable: cost <= available,
            contracts: request.size,
            cost,
            available,
        })
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.create_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.created.lock().unwrap().push(request.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderResult {
            exchange_order_id: format!("mock-{id}"),
            filled_contracts: request.size,
            avg_price: Self::reference_price(request),
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        Err(ExchangeError::OrderNotFound(exchange_order_id.to_string()))
    }

    async fn close_position(&self, request: &ClosePositionRequest) -> Result<(), ExchangeError> {
        if let Some(err) = self.close_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.closed.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Hands every account the same [`MockExchange`], except accounts listed in
/// `refuse`, which fail to connect.
pub struct MockExchangeFactory {
    pub exchange: Arc<MockExchange>,
    pub refuse: HashSet<i64>,
}

impl MockExchangeFactory {
    pub fn new(exchange: Arc<MockExchange>) -> Self {
        Self {
            exchange,
            refuse: HashSet::new(),
        }
    }

    pub fn refusing(mut self, account_id: i64) -> Self {
        self.refuse.insert(account_id);
        self
    }
}

impl ExchangeFactory for MockExchangeFactory {
    fn kind(&self) -> &str {
        MOCK_KIND
    }

    fn create(&self, account: &Account) -> Result<Arc<dyn Exchange>, ExchangeError> {
        if self.refuse.contains(&account.id) {
            return Err(ExchangeError::Connection(format!(
                "account {} rejected credentials",
                account.id
            )));
        }
        let exchange: Arc<dyn Exchange> = self.exchange.clone();
        Ok(exchange)
    }
}

/// Order store backed by maps. Saving an order in a terminal state counts
/// toward `saves`.
pub struct MockOrderStore {
    orders: Mutex<BTreeMap<i64, ConditionalOrder>>,
    accounts: Mutex<HashMap<i64, Account>>,
    pub saves: AtomicUsize,
    pub fail_listing: Mutex<bool>,
    /// Number of upcoming saves that fail with a database error.
    pub failing_saves: AtomicUsize,
}

impl MockOrderStore {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(BTreeMap::new()),
            accounts: Mutex::new(HashMap::new()),
            saves: AtomicUsize::new(0),
            fail_listing: Mutex::new(false),
            failing_saves: AtomicUsize::new(0),
        }
    }

    pub fn with_account(self, account: Account) -> Self {
        self.accounts.lock().unwrap().insert(account.id, account);
        self
    }

    /// Store `order` under `id` as given, status included.
    pub fn with_order(self, id: i64, mut order: ConditionalOrder) -> Self {
        order.id = id;
        self.orders.lock().unwrap().insert(id, order);
        self
    }

    pub fn order(&self, id: i64) -> ConditionalOrder {
        self.orders.lock().unwrap()[&id].clone()
    }

    pub fn status_of(&self, id: i64) -> OrderStatus {
        self.order(id).status
    }
}

#[async_trait]
impl OrderStore for MockOrderStore {
    async fn list_waiting(&self) -> Result<Vec<ConditionalOrder>, StoreError> {
        if *self.fail_listing.lock().unwrap() {
            return Err(StoreError::Database {
                reason: "database is locked".to_string(),
            });
        }
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.status == OrderStatus::Waiting)
            .cloned()
            .collect())
    }

    async fn save(&self, order: &ConditionalOrder) -> Result<(), StoreError> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Database {
                reason: "disk I/O error".to_string(),
            });
        }

        let mut orders = self.orders.lock().unwrap();
        let stored = orders
            .get_mut(&order.id)
            .ok_or(StoreError::OrderNotFound(order.id))?;
        if stored.status != OrderStatus::Waiting {
            return Err(StoreError::InvalidTransition {
                id: order.id,
                from: stored.status,
                to: order.status,
            });
        }
        stored.status = order.status;
        stored.message = order.message.clone();
        stored.exchange_order_id = order.exchange_order_id.clone();
        stored.updated_at = order.updated_at;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<ConditionalOrder, StoreError> {
        self.orders
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::OrderNotFound(id))
    }

    async fn list(&self) -> Result<Vec<ConditionalOrder>, StoreError> {
        Ok(self.orders.lock().unwrap().values().cloned().collect())
    }

    async fn insert(&self, order: &ConditionalOrder) -> Result<i64, StoreError> {
        let mut orders = self.orders.lock().unwrap();
        let id = orders.keys().next_back().copied().unwrap_or(0) + 1;
        let mut stored = order.clone();
        stored.id = id;
        stored.status = OrderStatus::Waiting;
        orders.insert(id, stored);
        Ok(id)
    }

    async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        self.accounts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::AccountNotFound(id))
    }

    async fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.id, account.clone());
        Ok(())
    }
}

pub fn mock_account(id: i64) -> Account {
    Account::new(id, format!("account-{id}"), MOCK_KIND)
}

pub fn order(account_id: i64, symbol: &str, side: Side, size: f64) -> ConditionalOrder {
    ConditionalOrder::new(account_id, symbol, side, size)
}

pub fn registry_with(sources: Vec<Arc<dyn DataSource>>) -> Registry {
    let mut registry = Registry::with_builtins();
    for source in sources {
        let name = source.name().to_string();
        registry.register_data_source(&name, source);
    }
    registry
}

pub fn hub_with(factory: MockExchangeFactory) -> Arc<ExchangeHub> {
    let mut hub = ExchangeHub::new();
    hub.register(Arc::new(factory));
    Arc::new(hub)
}

/// Fast ticks and a short per-call bound.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(20),
        account_timeout: Duration::from_millis(500),
    }
}

pub fn scheduler(
    registry: Registry,
    store: Arc<MockOrderStore>,
    hub: Arc<ExchangeHub>,
) -> Scheduler {
    Scheduler::new(Arc::new(registry), store, hub, test_config())
}
