//! The recursive diff type and its wire encoding.
//!
//! On the wire every delta is an object `{"o": <code>, "v": <value>}`:
//!
//! | code | variant | `v` |
//! |------|---------|-----|
//! | `+` | [`DiffDelta::Add`] | the new value |
//! | `-` | [`DiffDelta::Remove`] | absent |
//! | `r` | [`DiffDelta::Replace`] | the new value |
//! | `I` | [`DiffDelta::Increment`] | a number |
//! | `L` | [`DiffDelta::ListDiff`] | object keyed by decimal index |
//! | `O` | [`DiffDelta::ObjectDiff`] | object keyed by field name |
//! | `d` | [`DiffDelta::TextDelta`] | a text delta string |

use crate::error::{DiffError, DiffResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-key deltas describing how one object becomes another.
pub type ObjectOperationSet = BTreeMap<String, DiffDelta>;

/// Per-index deltas describing how one array becomes another.
pub type ListOperationSet = BTreeMap<usize, DiffDelta>;

/// A single structural change to a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffDelta {
    /// Insert a value at a key or index that did not exist.
    Add(Value),
    /// Delete the key or index.
    Remove,
    /// Overwrite the slot with a new value.
    Replace(Value),
    /// Add a number to a numeric slot.
    Increment(Value),
    /// Positional changes inside an array.
    ListDiff(ListOperationSet),
    /// Per-key changes inside an object.
    ObjectDiff(ObjectOperationSet),
    /// Character-level patch of a string, in delta encoding.
    TextDelta(String),
}

impl DiffDelta {
    /// Returns the single-character wire code of this delta.
    pub fn op_code(&self) -> &'static str {
        match self {
            DiffDelta::Add(_) => "+",
            DiffDelta::Remove => "-",
            DiffDelta::Replace(_) => "r",
            DiffDelta::Increment(_) => "I",
            DiffDelta::ListDiff(_) => "L",
            DiffDelta::ObjectDiff(_) => "O",
            DiffDelta::TextDelta(_) => "d",
        }
    }

    /// Returns true for deltas that modify an existing value in place.
    ///
    /// These are the deltas a remote removal turns back into an `Add`.
    pub fn is_modification(&self) -> bool {
        matches!(
            self,
            DiffDelta::Increment(_)
                | DiffDelta::ListDiff(_)
                | DiffDelta::ObjectDiff(_)
                | DiffDelta::TextDelta(_)
        )
    }

    /// Encodes this delta into its wire representation.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("o".into(), Value::String(self.op_code().into()));
        let v = match self {
            DiffDelta::Add(v) | DiffDelta::Replace(v) | DiffDelta::Increment(v) => Some(v.clone()),
            DiffDelta::Remove => None,
            DiffDelta::ListDiff(ops) => Some(Value::Object(
                ops.iter()
                    .map(|(index, delta)| (index.to_string(), delta.to_value()))
                    .collect(),
            )),
            DiffDelta::ObjectDiff(ops) => Some(operations_to_value(ops)),
            DiffDelta::TextDelta(delta) => Some(Value::String(delta.clone())),
        };
        if let Some(v) = v {
            obj.insert("v".into(), v);
        }
        Value::Object(obj)
    }

    /// Decodes a delta from its wire representation.
    pub fn from_value(value: &Value) -> DiffResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| DiffError::invalid_encoding("delta must be an object"))?;
        let code = obj
            .get("o")
            .and_then(Value::as_str)
            .ok_or_else(|| DiffError::invalid_encoding("delta is missing \"o\""))?;
        let v = obj.get("v");
        let require = |v: Option<&Value>| {
            v.cloned()
                .ok_or_else(|| DiffError::invalid_encoding(format!("delta \"{code}\" needs \"v\"")))
        };

        match code {
            "+" => Ok(DiffDelta::Add(require(v)?)),
            "-" => Ok(DiffDelta::Remove),
            "r" => Ok(DiffDelta::Replace(require(v)?)),
            "I" => {
                let n = require(v)?;
                if !n.is_number() {
                    return Err(DiffError::invalid_encoding("increment must be a number"));
                }
                Ok(DiffDelta::Increment(n))
            }
            "L" => {
                let entries = v.and_then(Value::as_object).ok_or_else(|| {
                    DiffError::invalid_encoding("list diff needs an object of indices")
                })?;
                let mut ops = ListOperationSet::new();
                for (key, delta) in entries {
                    let index: usize = key.parse().map_err(|_| {
                        DiffError::invalid_encoding(format!("invalid list index {key:?}"))
                    })?;
                    ops.insert(index, DiffDelta::from_value(delta)?);
                }
                Ok(DiffDelta::ListDiff(ops))
            }
            "O" => {
                let entries = v
                    .ok_or_else(|| DiffError::invalid_encoding("object diff needs \"v\""))?;
                Ok(DiffDelta::ObjectDiff(operations_from_value(entries)?))
            }
            "d" => v
                .and_then(Value::as_str)
                .map(|s| DiffDelta::TextDelta(s.to_string()))
                .ok_or_else(|| DiffError::invalid_encoding("text delta must be a string")),
            other => Err(DiffError::invalid_encoding(format!(
                "unknown delta code {other:?}"
            ))),
        }
    }
}

/// Encodes an object operation set as a JSON object of deltas.
pub fn operations_to_value(ops: &ObjectOperationSet) -> Value {
    Value::Object(
        ops.iter()
            .map(|(key, delta)| (key.clone(), delta.to_value()))
            .collect(),
    )
}

/// Decodes an object operation set from a JSON object of deltas.
pub fn operations_from_value(value: &Value) -> DiffResult<ObjectOperationSet> {
    let entries = value
        .as_object()
        .ok_or_else(|| DiffError::invalid_encoding("operation set must be an object"))?;
    entries
        .iter()
        .map(|(key, delta)| Ok((key.clone(), DiffDelta::from_value(delta)?)))
        .collect()
}

impl Serialize for DiffDelta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DiffDelta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        DiffDelta::from_value(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_nested_wire_format() {
        let wire = json!({
            "o": "O",
            "v": {
                "title": {"o": "d", "v": "=2\t+D"},
                "tags": {"o": "L", "v": {"1": {"o": "-"}, "0": {"o": "r", "v": "x"}}},
                "count": {"o": "I", "v": 2},
                "gone": {"o": "-"},
                "fresh": {"o": "+", "v": null}
            }
        });

        let delta: DiffDelta = serde_json::from_value(wire.clone()).unwrap();
        let DiffDelta::ObjectDiff(ops) = &delta else {
            panic!("expected object diff, got {delta:?}");
        };
        assert_eq!(ops["title"], DiffDelta::TextDelta("=2\t+D".into()));
        assert_eq!(ops["fresh"], DiffDelta::Add(Value::Null));
        assert_eq!(ops["gone"], DiffDelta::Remove);
        let DiffDelta::ListDiff(list) = &ops["tags"] else {
            panic!("expected list diff");
        };
        assert_eq!(list.keys().copied().collect::<Vec<_>>(), vec![0, 1]);

        assert_eq!(serde_json::to_value(&delta).unwrap(), wire);
    }

    #[test]
    fn rejects_malformed_deltas() {
        assert!(DiffDelta::from_value(&json!({"o": "?"})).is_err());
        assert!(DiffDelta::from_value(&json!({"o": "+"})).is_err());
        assert!(DiffDelta::from_value(&json!({"o": "I", "v": "1"})).is_err());
        assert!(DiffDelta::from_value(&json!({"o": "L", "v": {"x": {"o": "-"}}})).is_err());
        assert!(DiffDelta::from_value(&json!("r")).is_err());
    }

    #[test]
    fn remove_has_no_value() {
        assert_eq!(DiffDelta::Remove.to_value(), json!({"o": "-"}));
    }
}
