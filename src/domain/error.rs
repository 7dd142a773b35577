//! Domain error types.
//!
//! Each layer of the engine owns one error enum; [`EngineError`] collects them
//! for the command line and maps every family onto a process exit code.

use crate::domain::expr::BinaryOp;
use crate::domain::order::OrderStatus;
use crate::domain::registry::ArgKind;
use std::time::Duration;

/// A parse error with position information for condition parsing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }

    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let column = input
            .get(..self.position.min(input.len()))
            .map(|prefix| prefix.chars().count())
            .unwrap_or(self.position);
        let caret = " ".repeat(column) + "^";
        format!("{input}\n{caret}\n{self}")
    }
}

/// Static problems found by checking a parsed tree against the registry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' expects {expected} arguments, got {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("argument {index} of '{function}' must be {expected}")]
    ArgumentType {
        function: String,
        index: usize,
        expected: ArgKind,
    },

    #[error("unknown data source '{0}'")]
    UnknownDataSource(String),

    #[error("field reference '{0}' has an empty component")]
    EmptyComponent(String),

    #[error("argument {index} of '{function}' asks for more than {max} points")]
    WindowTooLarge {
        function: String,
        index: usize,
        max: usize,
    },
}

/// Failures reported by data-source providers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataError {
    #[error("no data for {entity}.{field}")]
    NoData { entity: String, field: String },

    #[error("insufficient history for {entity}.{field}: requested {requested}, have {available}")]
    InsufficientHistory {
        entity: String,
        field: String,
        requested: usize,
        available: usize,
    },

    #[error("windowed lookups are not supported for {entity}.{field}")]
    WindowUnsupported { entity: String, field: String },

    #[error("provider error: {0}")]
    Provider(String),
}

/// Runtime evaluation failures. Nested variants carry the failing
/// sub-expression so the final message names the exact operand or argument.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("data source '{0}' not found")]
    DataSourceNotFound(String),

    #[error("no data for entity '{entity}' field '{field}' in data source '{module}'")]
    NoDataForEntity {
        module: String,
        entity: String,
        field: String,
    },

    #[error("data source '{module}': {cause}")]
    Data {
        module: String,
        #[source]
        cause: DataError,
    },

    #[error("function '{0}' not found")]
    UnknownFunction(String),

    #[error("function '{function}' expects {expected} arguments, got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("argument {index} of '{function}': {cause}")]
    Argument {
        function: String,
        index: usize,
        #[source]
        cause: Box<EvalError>,
    },

    #[error("{side} operand of '{op}': {cause}")]
    Operand {
        op: BinaryOp,
        side: &'static str,
        #[source]
        cause: Box<EvalError>,
    },

    #[error("cannot convert {value} ({kind}) to {target}")]
    Coercion {
        value: String,
        kind: &'static str,
        target: &'static str,
    },
}

/// Failures reported by exchange adapters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    #[error("unsupported exchange '{0}'")]
    UnsupportedExchange(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("account {0} is not connected")]
    NotConnected(i64),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("insufficient balance: required {required:.4}, available {available:.4}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("no {side} position for {symbol}")]
    PositionNotFound { symbol: String, side: String },

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures reported by the order store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    Query { reason: String },

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("account {0} not found")]
    AccountNotFound(i64),

    #[error("invalid status transition for order {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Lifecycle misuse of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,
}

/// Top-level error type for ruletrader.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&EngineError> for std::process::ExitCode {
    fn from(err: &EngineError) -> Self {
        let code: u8 = match err {
            EngineError::Io(_) | EngineError::Scheduler(_) => 1,
            EngineError::ConfigParse { .. }
            | EngineError::ConfigMissing { .. }
            | EngineError::ConfigInvalid { .. } => 2,
            EngineError::Store(_) => 3,
            EngineError::Parse(_) | EngineError::Validation(_) => 4,
            EngineError::Eval(_) | EngineError::Data(_) | EngineError::Exchange(_) => 5,
        };
        std::process::ExitCode::from(code)
    }
}
