//! # ghostsync diff
//!
//! Structural diff, patch and operational transform over JSON values.
//!
//! The engine produces [`DiffDelta`] trees that describe how one value
//! becomes another, applies them without touching its inputs, and rebases
//! one diff over a concurrent one so that both replicas converge.
//!
//! ## Delta kinds
//!
//! - Objects diff per key: added, removed, or recursively changed.
//! - Arrays diff per index after trimming the common prefix and suffix.
//! - Strings diff per character as a compact text delta.
//! - Anything else (including a change of type) is replaced whole.
//!
//! ## Usage
//!
//! ```
//! use ghostsync_diff::JsonDiff;
//! use serde_json::json;
//!
//! let jd = JsonDiff::default();
//! let origin = json!({"title": "AC"});
//! let local = jd.object_diff(&origin, &json!({"title": "ACD"}));
//! let remote = jd.object_diff(&origin, &json!({"title": "ABC"}));
//!
//! let rebased = jd.transform_object_diff(&local, &remote, &origin).unwrap();
//! let merged = jd.apply_object_diff(&json!({"title": "ABC"}), &rebased).unwrap();
//! assert_eq!(merged, json!({"title": "ABCD"}));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod delta;
mod diff;
mod error;
mod text;
mod transform;
mod value;

pub use delta::{operations_from_value, operations_to_value, DiffDelta, ListOperationSet, ObjectOperationSet};
pub use diff::{DiffOptions, JsonDiff};
pub use error::{DiffError, DiffResult};
pub use text::{apply_ops, apply_text_delta, parse_delta, text_diff, to_delta, transform_ops, TextOp};
pub use transform::ConflictPolicy;
pub use value::{equals, ValueKind};
