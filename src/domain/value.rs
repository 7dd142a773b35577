//! Runtime values and the coercions comparison operators rely on.
//!
//! Comparisons are tiered: both sides as numbers, else both as times, else
//! the formatted strings lexicographically.

use crate::domain::error::EvalError;
use crate::domain::expr::Literal;
use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    List(Vec<String>),
    Bool(bool),
    Time(DateTime<Utc>),
    /// Historical window, oldest first.
    Series(Vec<f64>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::List(_) => "string array",
            Value::Bool(_) => "bool",
            Value::Time(_) => "time",
            Value::Series(_) => "series",
        }
    }

    pub(crate) fn coercion_error(&self, target: &'static str) -> EvalError {
        EvalError::Coercion {
            value: self.to_string(),
            kind: self.kind(),
            target,
        }
    }

    pub fn as_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Text(s) => Ok(s == "true"),
            Value::Number(n) => Ok(*n != 0.0),
            other => Err(other.coercion_error("bool")),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            Value::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            Value::Number(secs) => from_unix_seconds(*secs),
            _ => None,
        }
    }

    /// Points for aggregate functions. A scalar number counts as a
    /// one-point window.
    pub fn as_series(&self) -> Option<Vec<f64>> {
        match self {
            Value::Series(points) => Some(points.clone()),
            Value::Number(n) => Some(vec![*n]),
            _ => None,
        }
    }

    /// Right-hand side of `in`/`not_in`.
    pub fn as_list(&self) -> Result<&[String], EvalError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(other.coercion_error("string array")),
        }
    }

    /// Right-hand side of `has`: a single string or any of several.
    pub fn as_needles(&self) -> Result<Vec<String>, EvalError> {
        match self {
            Value::List(items) => Ok(items.clone()),
            Value::Text(s) => Ok(vec![s.clone()]),
            Value::Number(_) | Value::Bool(_) | Value::Time(_) => Ok(vec![self.to_string()]),
            Value::Series(_) => Err(self.coercion_error("string")),
        }
    }
}

impl From<&Literal> for Value {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Number(n) => Value::Number(*n),
            Literal::Text(s) => Value::Text(s.clone()),
            Literal::List(items) => Value::List(items.clone()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
            Value::List(items) => write!(f, "[{}]", items.join(" ")),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Time(t) => f.write_str(&t.to_rfc3339()),
            Value::Series(points) => {
                let parts: Vec<String> = points.iter().map(|p| p.to_string()).collect();
                write!(f, "[{}]", parts.join(" "))
            }
        }
    }
}

pub fn from_unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    Utc.timestamp_opt(whole as i64, nanos).single()
}

/// Tiered ordering. `Ok(None)` means the operands are unordered (NaN).
pub fn compare(left: &Value, right: &Value) -> Result<Option<Ordering>, EvalError> {
    for side in [left, right] {
        if matches!(side, Value::Series(_)) {
            return Err(side.coercion_error("scalar"));
        }
    }
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return Ok(a.partial_cmp(&b));
    }
    if let (Some(a), Some(b)) = (left.as_time(), right.as_time()) {
        return Ok(Some(a.cmp(&b)));
    }
    Ok(Some(left.to_string().cmp(&right.to_string())))
}
