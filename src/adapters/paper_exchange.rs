//! Paper trading exchange for simulation and dry runs.
//!
//! Orders fill immediately at the market price (or the limit price for limit
//! orders). Each account gets its own quote balance and positions; prices
//! come from a [`PaperMarket`] shared by every session.

use crate::domain::error::ExchangeError;
use crate::domain::order::{Account, OrderType, PositionSide, Side, SizeType};
use crate::ports::exchange_port::{
    Balance, ClosePositionRequest, Exchange, ExchangeFactory, OrderCost, OrderRequest,
    OrderResult, Position, Ticker,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

pub const PAPER_KIND: &str = "paper";
const QUOTE_CURRENCY: &str = "USDT";

/// Last-trade prices shared by all paper sessions.
#[derive(Debug, Default)]
pub struct PaperMarket {
    prices: RwLock<HashMap<String, f64>>,
}

impl PaperMarket {
    pub fn set_price(&self, symbol: &str, price: f64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(symbol.to_string(), price);
        }
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.prices.read().ok()?.get(symbol).copied()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .prices
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        symbols.sort();
        symbols
    }
}

#[derive(Debug)]
struct PaperState {
    connected: Option<i64>,
    cash: f64,
    positions: HashMap<(String, PositionSide), Position>,
    filled: HashSet<String>,
    next_id: u64,
}

pub struct PaperExchange {
    market: Arc<PaperMarket>,
    fee_rate: f64,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(market: Arc<PaperMarket>, balance: f64, fee_rate: f64) -> Self {
        Self {
            market,
            fee_rate,
            state: Mutex::new(PaperState {
                connected: None,
                cash: balance,
                positions: HashMap::new(),
                filled: HashSet::new(),
                next_id: 1,
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, PaperState>, ExchangeError> {
        self.state
            .lock()
            .map_err(|_| ExchangeError::Connection("paper exchange state poisoned".into()))
    }

    /// Connected state, or `NotConnected`.
    fn session(&self) -> Result<MutexGuard<'_, PaperState>, ExchangeError> {
        let state = self.state()?;
        if state.connected.is_none() {
            return Err(ExchangeError::NotConnected(0));
        }
        Ok(state)
    }

    fn market_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.market
            .price(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    fn fill_price(&self, request: &OrderRequest) -> Result<f64, ExchangeError> {
        match request.order_type {
            OrderType::Limit if request.price > 0.0 => Ok(request.price),
            _ => self.market_price(&request.symbol),
        }
    }

    fn quote(&self, request: &OrderRequest, available: f64) -> Result<OrderCost, ExchangeError> {
        let price = self.fill_price(request)?;
        if request.size <= 0.0 {
            return Err(ExchangeError::OrderRejected(format!(
                "size must be positive, got {}",
                request.size
            )));
        }
        let contracts = match request.size_type {
            SizeType::Contracts => request.size,
            SizeType::Quote => request.size / price,
        };
        let cost = if request.reduce_only {
            0.0
        } else {
            let notional = contracts * price;
            notional + notional * self.fee_rate
        };
        Ok(OrderCost {
            affordable: cost <= available,
            contracts,
            cost,
            available,
        })
    }
}

fn signed(side: Side, position_side: PositionSide, contracts: f64) -> f64 {
    match (position_side, side) {
        (PositionSide::Net, Side::Sell) => -contracts,
        _ => contracts,
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        PAPER_KIND
    }

    async fn connect(&self, account: &Account) -> Result<(), ExchangeError> {
        let mut state = self.state()?;
        if state.connected != Some(account.id) {
            state.connected = Some(account.id);
            debug!(account_id = account.id, "paper session connected");
        }
        Ok(())
    }

    async fn balance(&self) -> Result<Balance, ExchangeError> {
        let state = self.session()?;
        let margin: f64 = state
            .positions
            .values()
            .map(|p| p.contracts.abs() * p.entry_price)
            .sum();
        Ok(Balance {
            currency: QUOTE_CURRENCY.to_string(),
            total: state.cash + margin,
            available: state.cash,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let state = self.session()?;
        let mut positions: Vec<Position> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let last = self.market_price(symbol)?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: last,
            ask: last,
            timestamp: Utc::now(),
        })
    }

    async fn calc_order_cost(&self, request: &OrderRequest) -> Result<OrderCost, ExchangeError> {
        let available = self.session()?.cash;
        self.quote(request, available)
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut state = self.session()?;
        let quote = self.quote(request, state.cash)?;
        if !quote.affordable {
            return Err(ExchangeError::InsufficientBalance {
                required: quote.cost,
                available: quote.available,
            });
        }
        let price = self.fill_price(request)?;
        let delta = signed(request.side, request.position_side, quote.contracts);

        state.cash -= quote.cost;
        let key = (request.symbol.clone(), request.position_side);
        let position = state.positions.entry(key).or_insert_with(|| Position {
            symbol: request.symbol.clone(),
            position_side: request.position_side,
            contracts: 0.0,
            entry_price: price,
        });
        let total = position.contracts + delta;
        if total.abs() > f64::EPSILON && position.contracts.signum() == delta.signum() {
            position.entry_price =
                (position.entry_price * position.contracts.abs() + price * delta.abs()) / total.abs();
        }
        position.contracts = total;

        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;
        state.filled.insert(id.clone());
        info!(
            exchange_order_id = %id,
            symbol = %request.symbol,
            contracts = quote.contracts,
            price,
            "paper order filled"
        );
        Ok(OrderResult {
            exchange_order_id: id,
            filled_contracts: quote.contracts,
            avg_price: price,
        })
    }

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let state = self.session()?;
        if state.filled.contains(exchange_order_id) {
            return Err(ExchangeError::OrderRejected(format!(
                "{exchange_order_id} on {symbol} is already filled"
            )));
        }
        Err(ExchangeError::OrderNotFound(exchange_order_id.to_string()))
    }

    async fn close_position(&self, request: &ClosePositionRequest) -> Result<(), ExchangeError> {
        let last = self.market_price(&request.symbol)?;
        let mut state = self.session()?;
        let key = (request.symbol.clone(), request.position_side);
        let position = state
            .positions
            .remove(&key)
            .filter(|p| p.contracts.abs() > f64::EPSILON)
            .ok_or_else(|| ExchangeError::PositionNotFound {
                symbol: request.symbol.clone(),
                side: request.position_side.to_string(),
            })?;

        let direction = match request.position_side {
            PositionSide::Short => -1.0,
            _ => position.contracts.signum(),
        };
        let size = position.contracts.abs();
        let pnl = (last - position.entry_price) * size * direction;
        let fee = size * last * self.fee_rate;
        state.cash += position.entry_price * size + pnl - fee;
        info!(symbol = %request.symbol, side = %request.position_side, pnl, "paper position closed");
        Ok(())
    }
}

/// Creates one [`PaperExchange`] per account, all sharing `market`.
pub struct PaperExchangeFactory {
    market: Arc<PaperMarket>,
    balance: f64,
    fee_rate: f64,
}

impl PaperExchangeFactory {
    pub fn new(market: Arc<PaperMarket>, balance: f64, fee_rate: f64) -> Self {
        Self {
            market,
            balance,
            fee_rate,
        }
    }
}

impl ExchangeFactory for PaperExchangeFactory {
    fn kind(&self) -> &str {
        PAPER_KIND
    }

    fn create(&self, _account: &Account) -> Result<Arc<dyn Exchange>, ExchangeError> {
        Ok(Arc::new(PaperExchange::new(
            self.market.clone(),
            self.balance,
            self.fee_rate,
        )))
    }
}
