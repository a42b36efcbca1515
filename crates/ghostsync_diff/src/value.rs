//! Value helpers shared by diff, apply and transform.

use crate::error::{DiffError, DiffResult};
use serde_json::{Number, Value};

/// Coarse type of a JSON value as the differ sees it.
///
/// Booleans and numbers are separate kinds even though [`equals`] coerces
/// between them, so `diff(true, 2)` is a type change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `null`.
    Null,
    /// `true` / `false`.
    Bool,
    /// Any JSON number.
    Number,
    /// A string.
    String,
    /// An array.
    Array,
    /// An object.
    Object,
}

impl ValueKind {
    /// Returns the kind of `value`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Returns a short name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }
}

/// Deep equality with numeric coercion between booleans and numbers.
///
/// `true == 1`, `false == 0`, and `1 == 1.0`. Containers compare
/// element-wise with the same rules.
pub fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| equals(x, y)))
        }
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        _ => match (as_numeric(a), as_numeric(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Numeric view of a boolean or number.
pub(crate) fn as_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Adds `delta` to `base`, keeping integer precision when both are integers.
pub(crate) fn add_numbers(base: &Value, delta: &Value) -> DiffResult<Value> {
    let (Value::Number(a), Value::Number(b)) = (base, delta) else {
        return Err(DiffError::invalid_diff(format!(
            "cannot increment {} by {}",
            ValueKind::of(base).name(),
            ValueKind::of(delta).name()
        )));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Value::Number(sum.into()));
        }
    }

    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| DiffError::invalid_diff("increment produced a non-finite number"))
}
