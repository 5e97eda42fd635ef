//! # Pipeline Domain Types
//!
//! A pipeline is a named, scheduled chain of fetch -> transform* -> send
//! operations: it pulls from exactly one data source, threads the result
//! through an ordered list of pure transformations, and delivers the final
//! value to one or more targets (cache keys and/or widget fan-out keys).
//!
//! Transformations are pure functions of (input, config); they carry no
//! state and have no side effects beyond the value they return.

pub mod engine;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::core::error::{EngineError, Result};

pub use engine::PipelineEngine;

/// Where a pipeline's final value goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Plain cache write under this key.
    Cache { key: String },
    /// Subscriber fan-out on this widget key (which also cache-writes).
    Widget { key: String },
}

/// When a pipeline runs.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Re-run a fixed duration after each run.
    Interval(Duration),
    /// Cron expression, evaluated in the pipeline's timezone or
    /// process-local time when unset.
    Cron { expr: String, tz: Option<Tz> },
    /// Never self-scheduled; runs only when the named event is triggered.
    Event { name: String },
}

impl Schedule {
    /// Computes the next run instant after `now`. `Event` schedules never
    /// self-arm and yield `None`. Invalid cron expressions fail here, which
    /// `create_pipeline` surfaces at creation time.
    pub fn next_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Interval(interval) => {
                let delta = chrono::Duration::from_std(*interval).map_err(|e| {
                    EngineError::InvalidSchedule {
                        expr: format!("interval {:?}", interval),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(now + delta))
            }
            Schedule::Cron { expr, tz } => {
                let schedule =
                    cron::Schedule::from_str(expr).map_err(|e| EngineError::InvalidSchedule {
                        expr: expr.clone(),
                        reason: e.to_string(),
                    })?;
                let next = match tz {
                    Some(tz) => schedule
                        .after(&now.with_timezone(tz))
                        .next()
                        .map(|at| at.with_timezone(&Utc)),
                    None => schedule
                        .after(&now.with_timezone(&chrono::Local))
                        .next()
                        .map(|at| at.with_timezone(&Utc)),
                };
                Ok(next)
            }
            Schedule::Event { .. } => Ok(None),
        }
    }
}

/// The supported transformation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Filter,
    Aggregate,
    Join,
    Compute,
    Enrich,
}

/// One stage in a pipeline. `order` ranks stages; ties are broken by
/// insertion order when the pipeline is created (stable sort), so the
/// effective order is never ambiguous afterwards.
#[derive(Debug, Clone)]
pub struct Transformation {
    pub id: String,
    pub kind: TransformKind,
    pub config: Value,
    pub order: i32,
}

impl Transformation {
    pub fn new(id: &str, kind: TransformKind, config: Value, order: i32) -> Self {
        Self {
            id: id.to_string(),
            kind,
            config,
            order,
        }
    }

    /// Applies this stage to the previous stage's output. Any error aborts
    /// the whole run; stages are never skipped.
    pub fn apply(&self, input: Value) -> std::result::Result<Value, String> {
        match self.kind {
            TransformKind::Filter => self.apply_filter(input),
            TransformKind::Aggregate => self.apply_aggregate(input),
            TransformKind::Join => self.apply_join(input),
            TransformKind::Compute => self.apply_compute(input),
            TransformKind::Enrich => self.apply_enrich(input),
        }
    }

    fn apply_filter(&self, input: Value) -> std::result::Result<Value, String> {
        let field = self.str_config("field")?;
        let op = self.config["op"].as_str().unwrap_or("eq");
        let needle = self.config["value"].clone();
        let items = into_array(input, "filter")?;
        let kept = items
            .into_iter()
            .filter(|item| predicate_matches(item.get(&field), op, &needle))
            .collect();
        Ok(Value::Array(kept))
    }

    fn apply_aggregate(&self, input: Value) -> std::result::Result<Value, String> {
        let op = self.str_config("op")?;
        let items = into_array(input, "aggregate")?;
        if op == "count" {
            return Ok(json!({ "op": "count", "value": items.len() }));
        }
        let field = self.str_config("field")?;
        let numbers: Vec<f64> = items
            .iter()
            .filter_map(|item| item.get(&field).and_then(Value::as_f64))
            .collect();
        let value = match op.as_str() {
            "sum" => Some(numbers.iter().sum::<f64>()),
            "avg" if numbers.is_empty() => None,
            "avg" => Some(numbers.iter().sum::<f64>() / numbers.len() as f64),
            "min" => numbers.iter().copied().reduce(f64::min),
            "max" => numbers.iter().copied().reduce(f64::max),
            other => return Err(format!("aggregate: unknown op '{}'", other)),
        };
        Ok(json!({
            "op": op,
            "field": field,
            "value": value,
            "count": numbers.len(),
        }))
    }

    fn apply_join(&self, input: Value) -> std::result::Result<Value, String> {
        let left_key = self.str_config("left_key")?;
        let right_key = self.str_config("right_key")?;
        let rows = self.config["rows"]
            .as_array()
            .ok_or("join: missing 'rows' array in config")?
            .clone();
        let items = into_array(input, "join")?;
        let joined = items
            .into_iter()
            .map(|item| {
                let Some(join_value) = item.get(&left_key).cloned() else {
                    return item;
                };
                let matched = rows
                    .iter()
                    .find(|row| row.get(&right_key) == Some(&join_value));
                match (item, matched) {
                    (Value::Object(mut obj), Some(Value::Object(row))) => {
                        for (k, v) in row {
                            // Input fields win over joined row fields.
                            obj.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                        Value::Object(obj)
                    }
                    (item, _) => item,
                }
            })
            .collect();
        Ok(Value::Array(joined))
    }

    fn apply_compute(&self, input: Value) -> std::result::Result<Value, String> {
        let target = self.str_config("target")?;
        let left = self.str_config("left")?;
        let right = self.str_config("right")?;
        let op = self.str_config("op")?;
        let items = into_array(input, "compute")?;
        let computed = items
            .into_iter()
            .map(|item| {
                let (Some(l), Some(r)) = (
                    item.get(&left).and_then(Value::as_f64),
                    item.get(&right).and_then(Value::as_f64),
                ) else {
                    return Err(format!(
                        "compute: fields '{}'/'{}' missing or non-numeric",
                        left, right
                    ));
                };
                let value = match op.as_str() {
                    "add" => l + r,
                    "sub" => l - r,
                    "mul" => l * r,
                    "div" if r == 0.0 => return Err("compute: division by zero".to_string()),
                    "div" => l / r,
                    other => return Err(format!("compute: unknown op '{}'", other)),
                };
                match item {
                    Value::Object(mut obj) => {
                        obj.insert(target.clone(), json!(value));
                        Ok(Value::Object(obj))
                    }
                    _ => Err("compute: expected object elements".to_string()),
                }
            })
            .collect::<std::result::Result<Vec<Value>, String>>()?;
        Ok(Value::Array(computed))
    }

    fn apply_enrich(&self, input: Value) -> std::result::Result<Value, String> {
        let fields = self.config["fields"]
            .as_object()
            .ok_or("enrich: missing 'fields' object in config")?
            .clone();
        match input {
            Value::Object(obj) => Ok(Value::Object(merge_fields(obj, &fields))),
            Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(obj) => Value::Object(merge_fields(obj, &fields)),
                        other => other,
                    })
                    .collect(),
            )),
            _ => Err("enrich: expected an object or array input".to_string()),
        }
    }

    fn str_config(&self, key: &str) -> std::result::Result<String, String> {
        self.config[key]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("{}: missing '{}' in config", self.id, key))
    }
}

fn into_array(input: Value, stage: &str) -> std::result::Result<Vec<Value>, String> {
    match input {
        Value::Array(items) => Ok(items),
        other => Err(format!(
            "{}: expected an array input, got {}",
            stage,
            type_name(&other)
        )),
    }
}

fn merge_fields(mut obj: Map<String, Value>, fields: &Map<String, Value>) -> Map<String, Value> {
    for (k, v) in fields {
        obj.insert(k.clone(), v.clone());
    }
    obj
}

fn predicate_matches(field_value: Option<&Value>, op: &str, needle: &Value) -> bool {
    let Some(value) = field_value else {
        return false;
    };
    match op {
        "eq" => value == needle,
        "ne" => value != needle,
        "gt" | "gte" | "lt" | "lte" => match (value.as_f64(), needle.as_f64()) {
            (Some(l), Some(r)) => match op {
                "gt" => l > r,
                "gte" => l >= r,
                "lt" => l < r,
                _ => l <= r,
            },
            _ => false,
        },
        "contains" => match (value, needle) {
            (Value::String(haystack), Value::String(sub)) => haystack.contains(sub.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A registered pipeline. Retirement is logical: `active = false` keeps the
/// record but refuses runs and stops scheduling.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub source_id: String,
    pub transformations: Vec<Transformation>,
    pub targets: Vec<Target>,
    pub schedule: Schedule,
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}
