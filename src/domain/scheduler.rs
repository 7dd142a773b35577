//! Strategy scheduler.
//!
//! One background task ticks on a fixed interval. Each tick loads the
//! `waiting` orders, groups them by account and processes every account's
//! orders sequentially:
//!
//! 1. no condition: due now
//! 2. condition fails to compile or evaluate: left `waiting`, retried next tick
//! 3. condition false: left `waiting`
//! 4. cost pre-check fails or the account cannot afford it: `failed`
//! 5. open -> `create_order`, close -> `close_position`; the outcome is
//!    persisted as `opened`/`closed` or `failed`
//!
//! Nothing that goes wrong for one order or account stops the pass, and a
//! tick that panics is logged and the loop carries on. Exchange and data
//! calls are bounded by the account timeout, and shutdown is observed between
//! orders, so an order is never left half-updated.
//!
//! Saves are retried a few times. An order that reached the exchange but
//! could not be saved is held in memory: later ticks retry the save and never
//! submit it again.

use crate::domain::condition;
use crate::domain::error::{ExchangeError, SchedulerError, StoreError};
use crate::domain::exchange_hub::ExchangeHub;
use crate::domain::expr_eval::Evaluator;
use crate::domain::order::{ConditionalOrder, OrderAction, OrderStatus};
use crate::domain::registry::Registry;
use crate::ports::exchange_port::{ClosePositionRequest, Exchange, OrderRequest};
use crate::ports::order_store_port::OrderStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Bound on each exchange/data call and on one account's share of a tick.
    pub account_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            account_timeout: Duration::from_secs(30),
        }
    }
}

/// Counts for one pass over the waiting orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub orders: usize,
    pub submitted: usize,
    pub failed: usize,
    /// Left `waiting`: condition false or not evaluable, or deferred.
    pub skipped: usize,
    pub account_errors: usize,
    /// Sent to the exchange but not yet saved; held until the store accepts them.
    pub unsaved: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub ticks: u64,
    /// Ticks that panicked before completing.
    pub failed_ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_report: Option<TickReport>,
}

enum Outcome {
    Submitted,
    Failed,
    Skipped,
    Unsaved,
}

struct Engine {
    registry: Arc<Registry>,
    store: Arc<dyn OrderStore>,
    hub: Arc<ExchangeHub>,
    config: SchedulerConfig,
    status: RwLock<SchedulerStatus>,
    /// Orders whose final state the store has not accepted yet, by id.
    unsaved: Mutex<HashMap<i64, ConditionalOrder>>,
}

struct RunHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    engine: Arc<Engine>,
    run: Mutex<Option<RunHandle>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn OrderStore>,
        hub: Arc<ExchangeHub>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine: Arc::new(Engine {
                registry,
                store,
                hub,
                config,
                status: RwLock::new(SchedulerStatus::default()),
                unsaved: Mutex::new(HashMap::new()),
            }),
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.engine.config
    }

    /// Spawn the tick loop. The first tick runs immediately.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown, receiver) = watch::channel(false);
        self.engine.status.write().await.running = true;
        let engine = self.engine.clone();
        let task = tokio::spawn(async move { engine.run_loop(receiver).await });
        *run = Some(RunHandle { shutdown, task });

        info!(
            tick_interval_secs = self.engine.config.tick_interval.as_secs_f64(),
            account_timeout_secs = self.engine.config.account_timeout.as_secs_f64(),
            "scheduler started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for the in-flight tick, if any, to finish.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let handle = self
            .run
            .lock()
            .await
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        // The loop may already have exited; a closed channel is fine.
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
        self.engine.status.write().await.running = false;
        info!("scheduler stopped");
        Ok(())
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.engine.status.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Run one pass outside the loop.
    pub async fn run_tick(&self) -> TickReport {
        self.engine.tick(None).await
    }
}

impl Engine {
    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            // Each tick runs as its own task so a panic ends only that tick.
            let engine = self.clone();
            let receiver = shutdown.clone();
            let tick = tokio::spawn(async move { engine.tick(Some(&receiver)).await });
            if let Err(e) = tick.await {
                error!(error = %e, "tick panicked; scheduler keeps running");
                let mut status = self.status.write().await;
                status.failed_ticks += 1;
                status.last_tick_at = Some(Utc::now());
            }
        }

        self.status.write().await.running = false;
        debug!("scheduler loop exited");
    }

    async fn tick(&self, shutdown: Option<&watch::Receiver<bool>>) -> TickReport {
        let mut report = TickReport::default();

        match self.store.list_waiting().await {
            Ok(orders) => {
                report.orders = orders.len();
                let orders = self.settle_unsaved(orders, &mut report).await;
                let mut by_account: BTreeMap<i64, Vec<ConditionalOrder>> = BTreeMap::new();
                for order in orders {
                    by_account.entry(order.account_id).or_default().push(order);
                }
                for (account_id, batch) in by_account {
                    self.process_account(account_id, batch, shutdown, &mut report)
                        .await;
                }
            }
            Err(e) => error!(error = %e, "failed to load waiting orders"),
        }

        if report.orders > 0 {
            info!(
                orders = report.orders,
                submitted = report.submitted,
                failed = report.failed,
                skipped = report.skipped,
                account_errors = report.account_errors,
                unsaved = report.unsaved,
                "tick complete"
            );
        }

        let mut status = self.status.write().await;
        status.ticks += 1;
        status.last_tick_at = Some(Utc::now());
        status.last_report = Some(report);
        report
    }

    async fn process_account(
        &self,
        account_id: i64,
        batch: Vec<ConditionalOrder>,
        shutdown: Option<&watch::Receiver<bool>>,
        report: &mut TickReport,
    ) {
        let deadline = Instant::now() + self.config.account_timeout;

        let account = match self.store.get_account(account_id).await {
            Ok(account) => account,
            Err(e) => {
                error!(account_id, error = %e, "failed to load account; orders left waiting");
                report.account_errors += 1;
                report.skipped += batch.len();
                return;
            }
        };

        let exchange = match self.bounded(self.hub.connect(&account)).await {
            Ok(exchange) => exchange,
            Err(e) => {
                error!(account_id, exchange = %account.exchange, error = %e, "exchange connect failed; orders left waiting");
                report.account_errors += 1;
                report.skipped += batch.len();
                return;
            }
        };

        let total = batch.len();
        for (done, mut order) in batch.into_iter().enumerate() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                info!(account_id, deferred = total - done, "shutdown requested; remaining orders deferred");
                report.skipped += total - done;
                return;
            }
            if Instant::now() >= deadline {
                warn!(account_id, deferred = total - done, "account time budget exhausted; remaining orders deferred");
                report.skipped += total - done;
                return;
            }

            match self.process_order(exchange.as_ref(), &mut order).await {
                Outcome::Submitted => report.submitted += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Unsaved => report.unsaved += 1,
            }
        }
    }

    async fn process_order(&self, exchange: &dyn Exchange, order: &mut ConditionalOrder) -> Outcome {
        if order.has_condition() && !self.condition_met(order).await {
            return Outcome::Skipped;
        }

        let request = OrderRequest::from(&*order);
        let cost = match self.bounded(exchange.calc_order_cost(&request)).await {
            Ok(cost) => cost,
            Err(e) => return self.fail(order, format!("cost check failed: {e}")).await,
        };
        if !cost.affordable {
            let message = format!(
                "insufficient balance: order costs {:.4}, available {:.4}",
                cost.cost, cost.available
            );
            return self.fail(order, message).await;
        }

        let (status, message) = match order.action {
            OrderAction::Open => match self.bounded(exchange.create_order(&request)).await {
                Ok(result) => {
                    let message = format!(
                        "opened {} contracts at {}",
                        result.filled_contracts, result.avg_price
                    );
                    order.exchange_order_id = Some(result.exchange_order_id);
                    (OrderStatus::Opened, message)
                }
                Err(e) => return self.fail(order, format!("create order failed: {e}")).await,
            },
            OrderAction::Close => {
                let close = ClosePositionRequest::from(&*order);
                match self.bounded(exchange.close_position(&close)).await {
                    Ok(()) => (OrderStatus::Closed, "position closed".to_string()),
                    Err(e) => return self.fail(order, format!("close position failed: {e}")).await,
                }
            }
        };

        if let Err(e) = order.transition(status, message) {
            error!(order_id = order.id, error = %e, "unexpected order state");
            return Outcome::Failed;
        }
        if !self.persist(order).await {
            return Outcome::Unsaved;
        }
        info!(
            order_id = order.id,
            account_id = order.account_id,
            symbol = %order.symbol,
            status = %order.status,
            exchange_order_id = order.exchange_order_id.as_deref().unwrap_or(""),
            "order submitted"
        );
        Outcome::Submitted
    }

    /// Compile and evaluate the order's condition. Any error leaves the
    /// order waiting.
    async fn condition_met(&self, order: &ConditionalOrder) -> bool {
        let node = match condition::compile(&order.condition, &self.registry) {
            Ok(node) => node,
            Err(e) => {
                warn!(order_id = order.id, condition = %order.condition, error = %e, "invalid condition; order left waiting");
                return false;
            }
        };

        let evaluator = Evaluator::new(&self.registry);
        match tokio::time::timeout(self.config.account_timeout, evaluator.evaluate_to_bool(&node)).await {
            Ok(Ok(met)) => {
                debug!(order_id = order.id, condition = %node, met, "condition evaluated");
                met
            }
            Ok(Err(e)) => {
                warn!(order_id = order.id, condition = %node, error = %e, "condition not evaluable; order left waiting");
                false
            }
            Err(_) => {
                warn!(order_id = order.id, timeout = ?self.config.account_timeout, "condition evaluation timed out");
                false
            }
        }
    }

    async fn fail(&self, order: &mut ConditionalOrder, message: String) -> Outcome {
        warn!(order_id = order.id, account_id = order.account_id, symbol = %order.symbol, reason = %message, "order failed");
        if let Err(e) = order.transition(OrderStatus::Failed, message) {
            error!(order_id = order.id, error = %e, "unexpected order state");
            return Outcome::Failed;
        }
        if !self.persist(order).await {
            return Outcome::Unsaved;
        }
        Outcome::Failed
    }

    /// Save the order's new state, retrying transient store errors. Returns
    /// false when the order had to be held in memory instead.
    async fn persist(&self, order: &ConditionalOrder) -> bool {
        let mut attempt = 1;
        loop {
            match self.store.save(order).await {
                Ok(()) => return true,
                Err(e @ (StoreError::InvalidTransition { .. } | StoreError::OrderNotFound(_))) => {
                    error!(order_id = order.id, status = %order.status, error = %e, "order changed while being processed; outcome not saved");
                    return true;
                }
                Err(e) if attempt < SAVE_ATTEMPTS => {
                    warn!(order_id = order.id, attempt, error = %e, "save failed; retrying");
                    tokio::time::sleep(SAVE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(order_id = order.id, status = %order.status, error = %e, "save failed; order held until the store recovers");
                    self.unsaved.lock().await.insert(order.id, order.clone());
                    return false;
                }
            }
        }
    }

    /// Retry saves held from earlier ticks and drop those orders from this
    /// pass. A held order is forgotten once saved or no longer waiting.
    async fn settle_unsaved(
        &self,
        orders: Vec<ConditionalOrder>,
        report: &mut TickReport,
    ) -> Vec<ConditionalOrder> {
        let mut unsaved = self.unsaved.lock().await;
        if unsaved.is_empty() {
            return orders;
        }

        let (held, orders): (Vec<_>, Vec<_>) = orders
            .into_iter()
            .partition(|order| unsaved.contains_key(&order.id));
        let held: HashSet<i64> = held.iter().map(|order| order.id).collect();
        unsaved.retain(|id, _| held.contains(id));

        let mut settled = Vec::new();
        for (id, order) in unsaved.iter() {
            match self.store.save(order).await {
                Ok(()) => {
                    info!(order_id = *id, status = %order.status, "held order saved");
                    settled.push(*id);
                }
                Err(e @ (StoreError::InvalidTransition { .. } | StoreError::OrderNotFound(_))) => {
                    error!(order_id = *id, status = %order.status, error = %e, "held order changed in the store; outcome not saved");
                    settled.push(*id);
                }
                Err(e) => {
                    warn!(order_id = *id, error = %e, "held order still unsaved");
                    report.unsaved += 1;
                }
            }
        }
        for id in settled {
            unsaved.remove(&id);
        }
        orders
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        match tokio::time::timeout(self.config.account_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(self.config.account_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.account_timeout, Duration::from_secs(30));
    }

    #[test]
    fn status_starts_idle() {
        let status = SchedulerStatus::default();
        assert!(!status.running);
        assert_eq!(status.ticks, 0);
        assert_eq!(status.failed_ticks, 0);
        assert!(status.last_report.is_none());
    }
}
