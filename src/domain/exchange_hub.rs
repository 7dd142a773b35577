//! Per-account exchange sessions.
//!
//! Maps an account's exchange kind to a registered [`ExchangeFactory`] and
//! keeps one session per account id, so repeated ticks reuse it.

use crate::domain::error::ExchangeError;
use crate::domain::order::Account;
use crate::ports::exchange_port::{Exchange, ExchangeFactory};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Default)]
pub struct ExchangeHub {
    factories: HashMap<String, Arc<dyn ExchangeFactory>>,
    sessions: Mutex<HashMap<i64, Arc<dyn Exchange>>>,
}

impl ExchangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn ExchangeFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// The session for `account`, created on first use. `connect` is
    /// called every time; sessions treat repeat calls as no-ops. A failed
    /// connect drops the cached session so the next attempt starts fresh.
    pub async fn connect(&self, account: &Account) -> Result<Arc<dyn Exchange>, ExchangeError> {
        let exchange = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&account.id) {
                Some(existing) => existing.clone(),
                None => {
                    let factory = self
                        .factories
                        .get(&account.exchange)
                        .ok_or_else(|| ExchangeError::UnsupportedExchange(account.exchange.clone()))?;
                    let created = factory.create(account)?;
                    info!(account_id = account.id, exchange = %account.exchange, "exchange session created");
                    sessions.insert(account.id, created.clone());
                    created
                }
            }
        };

        if let Err(e) = exchange.connect(account).await {
            self.sessions.lock().await.remove(&account.id);
            return Err(e);
        }
        debug!(account_id = account.id, "exchange connected");
        Ok(exchange)
    }
}
