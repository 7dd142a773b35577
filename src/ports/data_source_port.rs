//! Data-source provider port.
//!
//! A provider answers `entity.field` lookups for one module of the condition
//! language (`market`, `candles`, `news`, ...). Providers that keep history
//! also answer windowed lookups and declare which function arguments carry
//! the window length.

use crate::domain::error::DataError;
use crate::domain::value::Value;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// `function`'s argument at `arg_index` supplies the window length when one
/// of this provider's fields is passed to `function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParam {
    pub function: &'static str,
    pub arg_index: usize,
}

impl WindowParam {
    pub const fn new(function: &'static str, arg_index: usize) -> Self {
        Self {
            function,
            arg_index,
        }
    }
}

/// Longest window a condition may request.
pub const MAX_WINDOW: usize = 10_000;

/// Extra query parameters derived from the enclosing call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub window: Option<usize>,
}

impl QueryParams {
    /// Window of `length` points, capped at [`MAX_WINDOW`].
    pub fn window(length: usize) -> Self {
        Self {
            window: Some(length.min(MAX_WINDOW)),
        }
    }
}

/// What a provider does when asked for a window it has no history for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryFallback {
    /// Fabricate a deterministic series anchored on the current value.
    #[default]
    Synthetic,
    /// Report `DataError::InsufficientHistory`.
    Error,
}

impl FromStr for HistoryFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" => Ok(Self::Synthetic),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "unknown history fallback '{other}' (expected synthetic or error)"
            )),
        }
    }
}

impl fmt::Display for HistoryFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synthetic => f.write_str("synthetic"),
            Self::Error => f.write_str("error"),
        }
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn get_value(&self, entity: &str, field: &str) -> Result<Value, DataError>;

    /// Up to `length` most recent points, oldest first.
    async fn get_window(
        &self,
        entity: &str,
        field: &str,
        length: usize,
    ) -> Result<Vec<f64>, DataError> {
        let _ = length;
        Err(DataError::WindowUnsupported {
            entity: entity.to_string(),
            field: field.to_string(),
        })
    }

    fn window_params(&self) -> Vec<WindowParam> {
        Vec::new()
    }
}
