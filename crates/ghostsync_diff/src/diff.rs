//! Structural diff and patch over JSON values.

use crate::delta::{DiffDelta, ListOperationSet, ObjectOperationSet};
use crate::error::{DiffError, DiffResult};
use crate::text::{apply_text_delta, text_diff};
use crate::value::{add_numbers, equals, ValueKind};
use serde_json::{Map, Value};

/// Options for a [`JsonDiff`] engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Diff arrays positionally. When false, changed arrays are replaced whole.
    pub list_diff: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self { list_diff: true }
    }
}

/// The diff engine.
///
/// All operations are pure: inputs are borrowed and never modified, results
/// are freshly allocated.
///
/// ```
/// use ghostsync_diff::JsonDiff;
/// use serde_json::json;
///
/// let jd = JsonDiff::default();
/// let a = json!({"title": "AC", "done": false});
/// let b = json!({"title": "ABC", "done": true});
/// let ops = jd.object_diff(&a, &b);
/// assert_eq!(jd.apply_object_diff(&a, &ops).unwrap(), b);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDiff {
    options: DiffOptions,
}

impl JsonDiff {
    /// Creates an engine with the given options.
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    /// Returns the engine options.
    pub fn options(&self) -> DiffOptions {
        self.options
    }

    /// Computes the delta that turns `a` into `b`, or `None` when they are equal.
    pub fn diff(&self, a: &Value, b: &Value) -> Option<DiffDelta> {
        if equals(a, b) {
            return None;
        }
        match (a, b) {
            (Value::Object(_), Value::Object(_)) => Some(DiffDelta::ObjectDiff(self.object_diff(a, b))),
            (Value::Array(x), Value::Array(y)) if self.options.list_diff => {
                Some(DiffDelta::ListDiff(self.list_diff(x, y)))
            }
            (Value::String(x), Value::String(y)) => text_diff(x, y).map(DiffDelta::TextDelta),
            _ => Some(DiffDelta::Replace(b.clone())),
        }
    }

    /// Computes per-key deltas from object `a` to object `b`.
    ///
    /// A value that is not an object is treated as an empty object.
    pub fn object_diff(&self, a: &Value, b: &Value) -> ObjectOperationSet {
        let empty = Map::new();
        let a = a.as_object().unwrap_or(&empty);
        let b = b.as_object().unwrap_or(&empty);

        let mut ops = ObjectOperationSet::new();
        for (key, old) in a {
            match b.get(key) {
                None => {
                    ops.insert(key.clone(), DiffDelta::Remove);
                }
                Some(new) => {
                    if let Some(delta) = self.diff(old, new) {
                        ops.insert(key.clone(), delta);
                    }
                }
            }
        }
        for (key, new) in b {
            if !a.contains_key(key) {
                ops.insert(key.clone(), DiffDelta::Add(new.clone()));
            }
        }
        ops
    }

    /// Computes positional deltas from list `a` to list `b`.
    ///
    /// The common prefix and suffix are trimmed first; indices in the result
    /// refer to the untrimmed lists.
    pub fn list_diff(&self, a: &[Value], b: &[Value]) -> ListOperationSet {
        let prefix = a
            .iter()
            .zip(b)
            .take_while(|(x, y)| equals(x, y))
            .count();
        let room = a.len().min(b.len()) - prefix;
        let suffix = a
            .iter()
            .rev()
            .zip(b.iter().rev())
            .take(room)
            .take_while(|(x, y)| equals(x, y))
            .count();
        let a_end = a.len() - suffix;
        let b_end = b.len() - suffix;

        let mut ops = ListOperationSet::new();
        for i in prefix..a_end.min(b_end) {
            if let Some(delta) = self.diff(&a[i], &b[i]) {
                ops.insert(i, delta);
            }
        }
        for i in b_end..a_end {
            ops.insert(i, DiffDelta::Remove);
        }
        for (i, value) in b.iter().enumerate().take(b_end).skip(a_end) {
            ops.insert(i, DiffDelta::Add(value.clone()));
        }
        ops
    }

    /// Applies per-key deltas to an object, returning the patched copy.
    ///
    /// `null` is patched as an empty object.
    pub fn apply_object_diff(&self, s: &Value, ops: &ObjectOperationSet) -> DiffResult<Value> {
        let mut map = match s {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(DiffError::invalid_diff(format!(
                    "object diff applied to {}",
                    ValueKind::of(other).name()
                )))
            }
        };

        for (key, delta) in ops {
            match self.apply_delta(map.get(key), delta)? {
                Some(value) => {
                    map.insert(key.clone(), value);
                }
                None => {
                    map.remove(key);
                }
            }
        }
        Ok(Value::Object(map))
    }

    /// Applies positional deltas to a list, returning the patched copy.
    ///
    /// Indices name positions before any removal in the same diff; a running
    /// deletion count maps them onto the shrinking copy.
    pub fn apply_list_diff(&self, s: &Value, ops: &ListOperationSet) -> DiffResult<Value> {
        let mut list = s.as_array().cloned().ok_or_else(|| {
            DiffError::invalid_diff(format!("list diff applied to {}", ValueKind::of(s).name()))
        })?;

        let mut deleted = 0usize;
        for (index, delta) in ops {
            let at = index.checked_sub(deleted).ok_or_else(|| {
                DiffError::invalid_diff(format!("list index {index} precedes a removal"))
            })?;
            match delta {
                DiffDelta::Add(value) => {
                    if at > list.len() {
                        return Err(out_of_range(*index, list.len()));
                    }
                    list.insert(at, value.clone());
                }
                DiffDelta::Remove => {
                    if at >= list.len() {
                        return Err(out_of_range(*index, list.len()));
                    }
                    list.remove(at);
                    deleted += 1;
                }
                other => {
                    let len = list.len();
                    let slot = list
                        .get_mut(at)
                        .ok_or_else(|| out_of_range(*index, len))?;
                    *slot = self.patch_value(slot, other)?;
                }
            }
        }
        Ok(Value::Array(list))
    }

    /// Applies one delta to an optional slot value.
    ///
    /// Returns `None` when the delta removes the slot. Deltas that modify a
    /// value in place fail on an empty slot.
    pub fn apply_delta(&self, current: Option<&Value>, delta: &DiffDelta) -> DiffResult<Option<Value>> {
        match (delta, current) {
            (DiffDelta::Remove, _) => Ok(None),
            (DiffDelta::Add(v) | DiffDelta::Replace(v), _) => Ok(Some(v.clone())),
            (_, Some(value)) => self.patch_value(value, delta).map(Some),
            (_, None) => Err(DiffError::invalid_diff(format!(
                "delta \"{}\" applied to a missing value",
                delta.op_code()
            ))),
        }
    }

    pub(crate) fn patch_value(&self, value: &Value, delta: &DiffDelta) -> DiffResult<Value> {
        match delta {
            DiffDelta::Add(v) | DiffDelta::Replace(v) => Ok(v.clone()),
            DiffDelta::Increment(n) => add_numbers(value, n),
            DiffDelta::ListDiff(ops) => self.apply_list_diff(value, ops),
            DiffDelta::ObjectDiff(ops) => self.apply_object_diff(value, ops),
            DiffDelta::TextDelta(d) => match value {
                Value::String(s) => apply_text_delta(s, d).map(Value::String),
                other => Err(DiffError::invalid_diff(format!(
                    "text delta applied to {}",
                    ValueKind::of(other).name()
                ))),
            },
            DiffDelta::Remove => Err(DiffError::invalid_diff("remove has no patched value")),
        }
    }
}

pub(crate) fn out_of_range(index: usize, len: usize) -> DiffError {
    DiffError::invalid_diff(format!("list index {index} out of range for length {len}"))
}
