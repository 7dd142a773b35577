//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::paper_exchange::{PaperExchangeFactory, PaperMarket};
use crate::adapters::snapshot_source::{self, SnapshotSource};
use crate::domain::condition;
use crate::domain::config_validation::{
    build_scheduler_config, history_fallback, validate_engine_config, validate_paper_config,
    validate_store_config,
};
use crate::domain::error::EngineError;
use crate::domain::exchange_hub::ExchangeHub;
use crate::domain::expr::Node;
use crate::domain::expr_eval::Evaluator;
use crate::domain::order::{
    Account, ConditionalOrder, MarginType, OrderAction, OrderType, PositionSide, Side, SizeType,
};
use crate::domain::registry::Registry;
use crate::domain::scheduler::{Scheduler, SchedulerStatus};
use crate::logging;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_source_port::{DataSource, HistoryFallback};
use crate::ports::order_store_port::OrderStore;

/// Data sources every registry knows, even when the snapshot has no rows
/// for them.
pub const DEFAULT_SOURCES: [&str; 3] = ["candles", "market", "news"];

#[derive(Parser, Debug)]
#[command(name = "ruletrader", about = "Conditional order engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler until Ctrl-C
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Parse and validate a condition
    Validate {
        #[arg(short, long)]
        expr: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Evaluate a condition against the snapshot data
    Eval {
        #[arg(short, long)]
        expr: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Create or update a trading account
    AddAccount {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "paper")]
        exchange: String,
        #[arg(long)]
        testnet: bool,
    },
    /// Create a conditional order in the waiting state
    AddOrder {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        account: i64,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        side: Side,
        #[arg(long)]
        size: f64,
        /// Limit price; omit for a market order
        #[arg(long)]
        price: Option<f64>,
        #[arg(long, default_value = "contracts")]
        size_type: SizeType,
        #[arg(long)]
        position_side: Option<PositionSide>,
        #[arg(long, default_value = "cross")]
        margin_type: MarginType,
        #[arg(long, default_value = "open")]
        action: OrderAction,
        /// Condition expression; omit for an unconditional order
        #[arg(long = "when")]
        condition: Option<String>,
    },
    /// List conditional orders
    ListOrders {
        #[arg(short, long)]
        config: PathBuf,
        /// Only orders still waiting
        #[arg(long)]
        waiting: bool,
    },
    /// Cancel a waiting order
    CancelOrder {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Run { config } => run_engine(&config),
        Command::Validate { expr, config } => run_validate(&expr, config.as_ref()),
        Command::Eval { expr, config } => run_eval(&expr, config.as_ref()),
        Command::AddAccount {
            config,
            id,
            name,
            exchange,
            testnet,
        } => {
            let mut account = Account::new(id, name, exchange);
            account.testnet = testnet;
            run_add_account(&config, account)
        }
        Command::AddOrder {
            config,
            account,
            symbol,
            side,
            size,
            price,
            size_type,
            position_side,
            margin_type,
            action,
            condition,
        } => {
            let mut order = ConditionalOrder::new(account, symbol, side, size);
            if let Some(price) = price {
                order = order.with_limit_price(price);
            }
            order.size_type = size_type;
            order.margin_type = margin_type;
            if let Some(position_side) = position_side {
                order.position_side = position_side;
            }
            order = order
                .with_action(action)
                .with_condition(condition.unwrap_or_default());
            run_add_order(&config, order)
        }
        Command::ListOrders { config, waiting } => run_list_orders(&config, waiting),
        Command::CancelOrder { config, id, reason } => run_cancel_order(&config, id, &reason),
    }
}

pub fn load_config(path: &PathBuf) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| {
        let err = EngineError::ConfigParse {
            file: path.display().to_string(),
            reason: e.to_string(),
        };
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

fn finish(result: Result<(), EngineError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output, EngineError> {
    let runtime = tokio::runtime::Runtime::new()?;
    Ok(runtime.block_on(future))
}

/// Snapshot sources from `[data] snapshot_path`, plus empty defaults for
/// any of [`DEFAULT_SOURCES`] the snapshot does not mention.
pub fn load_sources(config: Option<&dyn ConfigPort>) -> Result<Vec<SnapshotSource>, EngineError> {
    let fallback = match config {
        Some(config) => history_fallback(config)?,
        None => HistoryFallback::default(),
    };
    let mut sources = match config.and_then(|c| c.get_string("data", "snapshot_path")) {
        Some(path) => snapshot_source::load_csv(path, fallback)?,
        None => Vec::new(),
    };
    for name in DEFAULT_SOURCES {
        if !sources.iter().any(|s| s.name() == name) {
            sources.push(SnapshotSource::new(name).with_fallback(fallback));
        }
    }
    Ok(sources)
}

pub fn build_registry(sources: &[SnapshotSource]) -> Registry {
    let mut registry = Registry::with_builtins();
    for source in sources {
        registry.register_data_source(source.name(), Arc::new(source.clone()));
    }
    registry
}

/// Paper prices seeded from `market.<symbol>.last_px`.
pub fn paper_market(sources: &[SnapshotSource]) -> Arc<PaperMarket> {
    let market = Arc::new(PaperMarket::default());
    for source in sources.iter().filter(|s| s.name() == "market") {
        for (symbol, price) in source.numbers_for("last_px") {
            market.set_price(&symbol, price);
        }
    }
    market
}

#[cfg(feature = "sqlite")]
fn open_store(config: &dyn ConfigPort) -> Result<Arc<dyn OrderStore>, EngineError> {
    use crate::adapters::sqlite_adapter::SqliteOrderStore;

    validate_store_config(config)?;
    Ok(Arc::new(SqliteOrderStore::from_config(config)?))
}

#[cfg(not(feature = "sqlite"))]
fn open_store(config: &dyn ConfigPort) -> Result<Arc<dyn OrderStore>, EngineError> {
    validate_store_config(config)?;
    Err(EngineError::ConfigInvalid {
        section: "sqlite".into(),
        key: "path".into(),
        reason: "built without the sqlite feature".into(),
    })
}

/// Compile `expr`, printing the parse error with a caret on failure.
fn compile_reporting(expr: &str, registry: &Registry) -> Result<Node, EngineError> {
    condition::compile(expr, registry).inspect_err(|e| {
        if let EngineError::Parse(parse) = e {
            eprintln!("{}", parse.display_with_context(expr));
        }
    })
}

fn run_engine(config_path: &PathBuf) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    logging::setup_from_config(&config);
    finish(engine(&config))
}

fn engine(config: &FileConfigAdapter) -> Result<(), EngineError> {
    validate_engine_config(config)?;
    validate_paper_config(config)?;
    let status = block_on(serve(config))??;

    let last = status
        .last_report
        .map(|r| {
            format!(
                " (last: {} orders, {} submitted, {} failed, {} skipped)",
                r.orders, r.submitted, r.failed, r.skipped
            )
        })
        .unwrap_or_default();
    eprintln!("Stopped after {} ticks{last}", status.ticks);
    Ok(())
}

async fn serve(config: &FileConfigAdapter) -> Result<SchedulerStatus, EngineError> {
    let store = open_store(config)?;
    let sources = load_sources(Some(config as &dyn ConfigPort))?;
    let registry = Arc::new(build_registry(&sources));

    let market = paper_market(&sources);
    info!(symbols = ?market.symbols(), "paper market ready");
    let mut hub = ExchangeHub::new();
    hub.register(Arc::new(PaperExchangeFactory::new(
        market,
        config.get_double("paper", "balance", 10_000.0),
        config.get_double("paper", "fee_rate", 0.0005),
    )));

    info!(
        sources = ?registry.data_source_names(),
        functions = ?registry.function_names(),
        "registry ready"
    );
    let scheduler = Scheduler::new(registry, store, Arc::new(hub), build_scheduler_config(config)?);
    scheduler.start().await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    scheduler.stop().await?;
    Ok(scheduler.status().await)
}

fn optional_config(path: Option<&PathBuf>) -> Result<Option<FileConfigAdapter>, ExitCode> {
    path.map(load_config).transpose()
}

fn run_validate(expr: &str, config_path: Option<&PathBuf>) -> ExitCode {
    let config = match optional_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    finish(validate_expr(expr, config.as_ref()))
}

fn validate_expr(expr: &str, config: Option<&FileConfigAdapter>) -> Result<(), EngineError> {
    let sources = load_sources(config.map(|c| c as &dyn ConfigPort))?;
    let node = compile_reporting(expr, &build_registry(&sources))?;
    let fields: Vec<String> = node.field_refs().iter().map(|f| f.to_string()).collect();
    eprintln!("  Parsed: {node}");
    eprintln!("  Raw:    {expr}");
    if !fields.is_empty() {
        eprintln!("  Fields: {}", fields.join(", "));
    }
    eprintln!("\nCondition is valid.");
    Ok(())
}

fn run_eval(expr: &str, config_path: Option<&PathBuf>) -> ExitCode {
    let config = match optional_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    finish(eval_expr(expr, config.as_ref()))
}

fn eval_expr(expr: &str, config: Option<&FileConfigAdapter>) -> Result<(), EngineError> {
    let sources = load_sources(config.map(|c| c as &dyn ConfigPort))?;
    let registry = build_registry(&sources);
    let node = compile_reporting(expr, &registry)?;
    let value = block_on(Evaluator::new(&registry).evaluate(&node))??;
    println!("{value}");
    Ok(())
}

fn run_add_account(config_path: &PathBuf, account: Account) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    finish(add_account(&config, &account))
}

fn add_account(config: &FileConfigAdapter, account: &Account) -> Result<(), EngineError> {
    let store = open_store(config)?;
    block_on(store.upsert_account(account))??;
    eprintln!("Account {} ({}) saved", account.id, account.exchange);
    Ok(())
}

fn run_add_order(config_path: &PathBuf, order: ConditionalOrder) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    finish(add_order(&config, &order))
}

fn add_order(config: &FileConfigAdapter, order: &ConditionalOrder) -> Result<(), EngineError> {
    if order.size.is_nan() || order.size <= 0.0 {
        return Err(EngineError::ConfigInvalid {
            section: "order".into(),
            key: "size".into(),
            reason: format!("size must be positive, got {}", order.size),
        });
    }
    if order.has_condition() {
        let sources = load_sources(Some(config as &dyn ConfigPort))?;
        compile_reporting(&order.condition, &build_registry(&sources))?;
    }

    let store = open_store(config)?;
    let id = block_on(async {
        store.get_account(order.account_id).await?;
        store.insert(order).await
    })??;
    println!("{id}");

    let price = match order.order_type {
        OrderType::Limit => format!(" @ {}", order.price),
        OrderType::Market => String::new(),
    };
    eprintln!(
        "Order {id} waiting: {} {} {} {}{price}",
        order.action, order.side, order.size, order.symbol
    );
    Ok(())
}

fn run_list_orders(config_path: &PathBuf, waiting_only: bool) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    finish(list_orders(&config, waiting_only))
}

fn list_orders(config: &FileConfigAdapter, waiting_only: bool) -> Result<(), EngineError> {
    let store = open_store(config)?;
    let orders = block_on(async {
        if waiting_only {
            store.list_waiting().await
        } else {
            store.list().await
        }
    })??;

    if orders.is_empty() {
        eprintln!("No orders found");
        return Ok(());
    }
    println!(
        "{:>5}  {:>7}  {:<12}  {:<4}  {:<5}  {:<9}  {:<24}  {}",
        "id", "account", "symbol", "side", "act", "status", "condition", "message"
    );
    for order in &orders {
        let condition = if order.has_condition() {
            order.condition.as_str()
        } else {
            "-"
        };
        println!(
            "{:>5}  {:>7}  {:<12}  {:<4}  {:<5}  {:<9}  {:<24}  {}",
            order.id,
            order.account_id,
            order.symbol,
            order.side,
            order.action,
            order.status,
            condition,
            order.message
        );
    }
    eprintln!("{} orders", orders.len());
    Ok(())
}

fn run_cancel_order(config_path: &PathBuf, id: i64, reason: &str) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    finish(cancel_order(&config, id, reason))
}

fn cancel_order(config: &FileConfigAdapter, id: i64, reason: &str) -> Result<(), EngineError> {
    let store = open_store(config)?;
    let order = block_on(store.cancel(id, reason))??;
    eprintln!("Order {} {}", order.id, order.status);
    Ok(())
}
