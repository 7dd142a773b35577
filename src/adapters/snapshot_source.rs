//! In-memory snapshot data source, optionally loaded from CSV.
//!
//! CSV columns: `source,entity,field,kind,value`, where `kind` is one of
//! `number`, `text`, `time` (RFC 3339) or `series` (`;`-separated numbers,
//! oldest first). Each distinct `source` becomes one data source.

use crate::domain::builtins::AGGREGATES;
use crate::domain::error::{DataError, EngineError};
use crate::domain::value::Value;
use crate::ports::data_source_port::{DataSource, HistoryFallback, MAX_WINDOW, WindowParam};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Step between synthetic points, as a fraction of the anchor value.
const SYNTHETIC_STEP: f64 = 0.001;

type Key = (String, String);

#[derive(Debug, Clone)]
pub struct SnapshotSource {
    name: String,
    values: HashMap<Key, Value>,
    series: HashMap<Key, Vec<f64>>,
    fallback: HistoryFallback,
}

impl SnapshotSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: HashMap::new(),
            series: HashMap::new(),
            fallback: HistoryFallback::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: HistoryFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_value(mut self, entity: &str, field: &str, value: impl Into<Value>) -> Self {
        self.set_value(entity, field, value.into());
        self
    }

    pub fn with_series(mut self, entity: &str, field: &str, points: Vec<f64>) -> Self {
        self.set_series(entity, field, points);
        self
    }

    pub fn set_value(&mut self, entity: &str, field: &str, value: Value) {
        self.values
            .insert((entity.to_string(), field.to_string()), value);
    }

    /// Store history; scalar lookups of a series-only field return its
    /// latest point.
    pub fn set_series(&mut self, entity: &str, field: &str, points: Vec<f64>) {
        self.series
            .insert((entity.to_string(), field.to_string()), points);
    }

    pub fn fallback(&self) -> HistoryFallback {
        self.fallback
    }

    /// Numeric scalar values of `field` for every entity that has one.
    pub fn numbers_for(&self, field: &str) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .values
            .iter()
            .filter(|((_, f), _)| f == field)
            .filter_map(|((entity, _), value)| value.as_number().map(|n| (entity.clone(), n)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn key(entity: &str, field: &str) -> Key {
        (entity.to_string(), field.to_string())
    }

    fn scalar(&self, key: &Key) -> Option<Value> {
        self.values.get(key).cloned().or_else(|| {
            self.series
                .get(key)
                .and_then(|points| points.last())
                .map(|last| Value::Number(*last))
        })
    }
}

/// Deterministic ramp of `length` points ending at `anchor`, at most
/// [`MAX_WINDOW`] long.
fn synthetic_series(anchor: f64, length: usize) -> Vec<f64> {
    let length = length.min(MAX_WINDOW);
    (0..length)
        .map(|i| {
            let steps_back = (length - 1 - i) as f64;
            anchor * (1.0 - SYNTHETIC_STEP * steps_back)
        })
        .collect()
}

#[async_trait]
impl DataSource for SnapshotSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_value(&self, entity: &str, field: &str) -> Result<Value, DataError> {
        self.scalar(&Self::key(entity, field))
            .ok_or_else(|| DataError::NoData {
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
        let key = Self::key(entity, field);
        if let Some(points) = self.series.get(&key) {
            let start = points.len().saturating_sub(length);
            return Ok(points[start..].to_vec());
        }

        let anchor = self.scalar(&key).ok_or_else(|| DataError::NoData {
            entity: entity.to_string(),
            field: field.to_string(),
        })?;
        match self.fallback {
            HistoryFallback::Error => Err(DataError::InsufficientHistory {
                entity: entity.to_string(),
                field: field.to_string(),
                requested: length,
                available: 0,
            }),
            HistoryFallback::Synthetic => {
                let anchor = anchor.as_number().ok_or_else(|| {
                    DataError::Provider(format!(
                        "{entity}.{field} is not numeric and has no history"
                    ))
                })?;
                warn!(source = %self.name, entity, field, length, "no history; using synthetic series");
                Ok(synthetic_series(anchor, length))
            }
        }
    }

    fn window_params(&self) -> Vec<WindowParam> {
        AGGREGATES
            .iter()
            .map(|&function| WindowParam::new(function, 1))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotRow {
    source: String,
    entity: String,
    field: String,
    kind: String,
    value: String,
}

fn parse_row(row: &SnapshotRow) -> Result<RowValue, String> {
    let value = row.value.trim();
    match row.kind.trim().to_ascii_lowercase().as_str() {
        "number" => value
            .parse::<f64>()
            .map(|n| RowValue::Scalar(Value::Number(n)))
            .map_err(|e| format!("invalid number '{value}': {e}")),
        "text" => Ok(RowValue::Scalar(Value::Text(row.value.clone()))),
        "time" => DateTime::parse_from_rfc3339(value)
            .map(|t| RowValue::Scalar(Value::Time(t.with_timezone(&Utc))))
            .map_err(|e| format!("invalid time '{value}': {e}")),
        "series" => value
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<f64>().map_err(|e| format!("invalid point '{p}': {e}")))
            .collect::<Result<Vec<f64>, String>>()
            .map(RowValue::Series),
        other => Err(format!("unknown kind '{other}'")),
    }
}

enum RowValue {
    Scalar(Value),
    Series(Vec<f64>),
}

/// Read snapshot rows, one source per distinct `source` column, sorted by name.
pub fn from_reader<R: Read>(
    reader: R,
    fallback: HistoryFallback,
) -> Result<Vec<SnapshotSource>, EngineError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut sources: BTreeMap<String, SnapshotSource> = BTreeMap::new();

    for (index, result) in rdr.deserialize::<SnapshotRow>().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let row = result.map_err(|e| {
            EngineError::Data(DataError::Provider(format!(
                "snapshot line {line}: {e}"
            )))
        })?;
        let value = parse_row(&row).map_err(|reason| {
            EngineError::Data(DataError::Provider(format!(
                "snapshot line {line}: {reason}"
            )))
        })?;

        let source = sources
            .entry(row.source.clone())
            .or_insert_with(|| SnapshotSource::new(row.source.clone()).with_fallback(fallback));
        match value {
            RowValue::Scalar(v) => source.set_value(&row.entity, &row.field, v),
            RowValue::Series(points) => source.set_series(&row.entity, &row.field, points),
        }
    }

    debug!(sources = sources.len(), "snapshot loaded");
    Ok(sources.into_values().collect())
}

pub fn load_csv<P: AsRef<Path>>(
    path: P,
    fallback: HistoryFallback,
) -> Result<Vec<SnapshotSource>, EngineError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| {
        EngineError::Data(DataError::Provider(format!(
            "failed to read {}: {}",
            path.display(),
            e
        )))
    })?;
    from_reader(file, fallback)
}
