//! Leaf operator table keyed by (value type, operator name).

use crate::types::ValueType;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Compares the value found in the facts against the rule's expected value.
pub type OperatorFn = fn(&Value, &Value) -> bool;

/// Operator lookup. Unknown (type, operator) pairs evaluate to false.
#[derive(Clone, Default)]
pub struct OperatorTable {
    ops: HashMap<(ValueType, String), OperatorFn>,
}

impl OperatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ty: ValueType, operator: &str, f: OperatorFn) -> &mut Self {
        self.ops.insert((ty, operator.to_string()), f);
        self
    }

    pub fn supports(&self, ty: ValueType, operator: &str) -> bool {
        self.ops.contains_key(&(ty, operator.to_string()))
    }

    pub fn apply(&self, ty: ValueType, operator: &str, actual: &Value, expected: &Value) -> bool {
        match self.ops.get(&(ty, operator.to_string())) {
            Some(f) => f(actual, expected),
            None => false,
        }
    }
}

/// Registers `=`, `!=` and the four ordering operators for a comparator.
macro_rules! ordering_ops {
    ($table:expr, $ty:expr, $cmp:ident) => {
        $table
            .register($ty, "=", |a, e| $cmp(a, e) == Some(Ordering::Equal))
            .register($ty, "!=", |a, e| $cmp(a, e) != Some(Ordering::Equal))
            .register($ty, "<", |a, e| $cmp(a, e) == Some(Ordering::Less))
            .register($ty, "<=", |a, e| {
                matches!($cmp(a, e), Some(Ordering::Less | Ordering::Equal))
            })
            .register($ty, ">", |a, e| $cmp(a, e) == Some(Ordering::Greater))
            .register($ty, ">=", |a, e| {
                matches!($cmp(a, e), Some(Ordering::Greater | Ordering::Equal))
            })
    };
}

static DEFAULT_TABLE: Lazy<OperatorTable> = Lazy::new(|| {
    let mut table = OperatorTable::new();

    for ty in [
        ValueType::String,
        ValueType::Number,
        ValueType::Boolean,
        ValueType::Date,
        ValueType::Array,
    ] {
        table.register(ty, "is set", is_set);
        table.register(ty, "is not set", |a, e| !is_set(a, e));
    }

    table
        .register(ValueType::String, "=", |a, e| text_cmp(a, e, |a, e| a == e))
        .register(ValueType::String, "!=", |a, e| !text_cmp(a, e, |a, e| a == e))
        .register(ValueType::String, "contains", |a, e| {
            text_cmp(a, e, |a, e| a.contains(e))
        })
        .register(ValueType::String, "not contain", |a, e| {
            !text_cmp(a, e, |a, e| a.contains(e))
        })
        .register(ValueType::String, "starts with", |a, e| {
            text_cmp(a, e, |a, e| a.starts_with(e))
        })
        .register(ValueType::String, "not start with", |a, e| {
            !text_cmp(a, e, |a, e| a.starts_with(e))
        });

    ordering_ops!(table, ValueType::Number, numeric_cmp);
    ordering_ops!(table, ValueType::Date, date_cmp);

    table
        .register(ValueType::Boolean, "=", |a, e| a.as_bool().is_some() && a == e)
        .register(ValueType::Boolean, "!=", |a, e| a != e)
        .register(ValueType::Boolean, "is true", |a, _| a.as_bool() == Some(true))
        .register(ValueType::Boolean, "is false", |a, _| a.as_bool() == Some(false));

    table
        .register(ValueType::Array, "=", |a, e| a == e)
        .register(ValueType::Array, "!=", |a, e| a != e)
        .register(ValueType::Array, "any", array_any)
        .register(ValueType::Array, "none", |a, e| !array_any(a, e));

    table
});

/// The built-in operator table.
pub fn default_table() -> &'static OperatorTable {
    &DEFAULT_TABLE
}

fn is_set(actual: &Value, _expected: &Value) -> bool {
    !actual.is_null()
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text_cmp(actual: &Value, expected: &Value, f: fn(&str, &str) -> bool) -> bool {
    match (as_text(actual), as_text(expected)) {
        (Some(a), Some(e)) => f(&a, &e),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    as_number(a)?.partial_cmp(&as_number(b)?)
}

/// RFC 3339 timestamps, `YYYY-MM-DD` dates, or epoch milliseconds.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| d.and_utc())
            }),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

pub fn date_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    Some(parse_date(a)?.cmp(&parse_date(b)?))
}

fn array_any(actual: &Value, expected: &Value) -> bool {
    let Some(items) = actual.as_array() else {
        return false;
    };
    match expected {
        Value::Array(wanted) => wanted.iter().any(|w| items.contains(w)),
        other => items.contains(other),
    }
}
