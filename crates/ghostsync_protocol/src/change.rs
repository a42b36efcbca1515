//! Change records exchanged with the server.
//!
//! Outbound, the client sends [`LocalChange`]s. Inbound, a `c:` batch holds
//! [`ChangeRecord`]s: either a [`NetworkChange`] broadcast by the server or a
//! [`ChangeErrorRecord`] rejecting something this client sent.

use crate::error::{ProtocolError, ProtocolResult};
use ghostsync_diff::{operations_from_value, ObjectOperationSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    /// The object was created or modified.
    #[serde(rename = "M")]
    Modify,
    /// The object was removed.
    #[serde(rename = "-")]
    Remove,
}

impl ChangeOp {
    /// Returns the wire code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Modify => "M",
            ChangeOp::Remove => "-",
        }
    }

    /// Parses a wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "M" => Some(ChangeOp::Modify),
            "-" => Some(ChangeOp::Remove),
            _ => None,
        }
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of one [`LocalChange`] instance.
///
/// Every constructed change receives a fresh token; clones share it. Two
/// changes with equal contents but different tokens are different changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeToken(u64);

impl ChangeToken {
    fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw generation number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A change made on this client, waiting to be sent or acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    /// Modify or remove.
    pub op: ChangeOp,
    /// Object id.
    pub id: String,
    /// Client change id the server echoes back when it accepts the change.
    pub ccid: String,
    /// Ghost version the diff was computed against, when synced.
    pub sv: Option<u64>,
    /// Per-key diff; absent for removals.
    pub diff: Option<ObjectOperationSet>,
    /// Full object attached after the server rejected the diff.
    pub full_object: Option<Value>,
    /// The local object this change moves to.
    pub target: Value,
    /// Set once the change has been resent with its full object.
    pub full_object_sent: bool,
    token: ChangeToken,
}

impl LocalChange {
    /// Creates a modify change.
    pub fn modify(
        id: impl Into<String>,
        diff: ObjectOperationSet,
        sv: Option<u64>,
        target: Value,
    ) -> Self {
        Self {
            op: ChangeOp::Modify,
            id: id.into(),
            ccid: Uuid::new_v4().to_string(),
            sv,
            diff: Some(diff),
            full_object: None,
            target,
            full_object_sent: false,
            token: ChangeToken::next(),
        }
    }

    /// Creates a remove change.
    pub fn remove(id: impl Into<String>) -> Self {
        Self {
            op: ChangeOp::Remove,
            id: id.into(),
            ccid: Uuid::new_v4().to_string(),
            sv: None,
            diff: None,
            full_object: None,
            target: Value::Null,
            full_object_sent: false,
            token: ChangeToken::next(),
        }
    }

    /// Returns this change's identity.
    pub fn token(&self) -> ChangeToken {
        self.token
    }

    /// Returns true for a removal.
    pub fn is_remove(&self) -> bool {
        self.op == ChangeOp::Remove
    }

    /// Returns true if the change carries no edits.
    pub fn is_empty(&self) -> bool {
        self.op == ChangeOp::Modify && self.diff.as_ref().map_or(true, |d| d.is_empty())
    }

    /// Returns a copy that carries `object` in full, flagged as a full resend.
    ///
    /// The copy keeps the client change id and gets a fresh token.
    pub fn with_full_object(&self, object: Value) -> Self {
        Self {
            full_object: Some(object),
            full_object_sent: true,
            token: ChangeToken::next(),
            ..self.clone()
        }
    }

    /// Encodes the wire record `{o, id, ccid, sv?, v?, d?}`.
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("o".into(), Value::String(self.op.as_str().into()));
        obj.insert("id".into(), Value::String(self.id.clone()));
        obj.insert("ccid".into(), Value::String(self.ccid.clone()));
        if let Some(sv) = self.sv {
            obj.insert("sv".into(), Value::from(sv));
        }
        if let Some(diff) = &self.diff {
            obj.insert("v".into(), ghostsync_diff::operations_to_value(diff));
        }
        if let Some(full) = &self.full_object {
            obj.insert("d".into(), full.clone());
        }
        Value::Object(obj)
    }
}

/// A change broadcast by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkChange {
    /// Modify or remove.
    pub op: ChangeOp,
    /// Object id.
    pub id: String,
    /// Server change-version cursor after this change.
    pub cv: String,
    /// Client change ids folded into this change.
    pub ccids: Vec<String>,
    /// Object version this change starts from.
    pub sv: Option<u64>,
    /// Object version this change produces.
    pub ev: u64,
    /// Per-key diff; absent for removals.
    pub diff: Option<ObjectOperationSet>,
}

impl NetworkChange {
    /// Returns true if the server folded `ccid` into this change.
    pub fn acknowledges(&self, ccid: &str) -> bool {
        self.ccids.iter().any(|c| c == ccid)
    }
}

/// Server error codes for rejected changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeErrorCode {
    /// 400: malformed change.
    BadRequest,
    /// 401: not allowed to write this object.
    Unauthorized,
    /// 404: object does not exist.
    NotFound,
    /// 405: the start version is not one the server knows.
    InvalidVersion,
    /// 409: the server already applied this change id.
    DuplicateChange,
    /// 412: the change had no effect.
    EmptyResponse,
    /// 413: the resulting object is too large.
    DocumentTooLarge,
    /// 440: the diff does not apply to the server's object.
    InvalidDiff,
    /// Any other code.
    Other(u16),
}

impl ChangeErrorCode {
    /// Converts from a numeric code.
    pub fn from_code(code: u16) -> Self {
        match code {
            400 => ChangeErrorCode::BadRequest,
            401 => ChangeErrorCode::Unauthorized,
            404 => ChangeErrorCode::NotFound,
            405 => ChangeErrorCode::InvalidVersion,
            409 => ChangeErrorCode::DuplicateChange,
            412 => ChangeErrorCode::EmptyResponse,
            413 => ChangeErrorCode::DocumentTooLarge,
            440 => ChangeErrorCode::InvalidDiff,
            other => ChangeErrorCode::Other(other),
        }
    }

    /// Converts to a numeric code.
    pub fn to_code(&self) -> u16 {
        match self {
            ChangeErrorCode::BadRequest => 400,
            ChangeErrorCode::Unauthorized => 401,
            ChangeErrorCode::NotFound => 404,
            ChangeErrorCode::InvalidVersion => 405,
            ChangeErrorCode::DuplicateChange => 409,
            ChangeErrorCode::EmptyResponse => 412,
            ChangeErrorCode::DocumentTooLarge => 413,
            ChangeErrorCode::InvalidDiff => 440,
            ChangeErrorCode::Other(code) => *code,
        }
    }

    /// Returns true for codes answered by resending the full object.
    pub fn wants_full_object(&self) -> bool {
        matches!(
            self,
            ChangeErrorCode::InvalidVersion | ChangeErrorCode::InvalidDiff
        )
    }
}

impl fmt::Display for ChangeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_code())
    }
}

/// A server rejection of a change this client sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeErrorRecord {
    /// The error code.
    pub code: ChangeErrorCode,
    /// Object id.
    pub id: String,
    /// Client change ids the error refers to.
    pub ccids: Vec<String>,
}

impl ChangeErrorRecord {
    /// Returns true if the error refers to `ccid`.
    pub fn refers_to(&self, ccid: &str) -> bool {
        self.ccids.iter().any(|c| c == ccid)
    }
}

/// One entry of a `c:` batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    /// A change to apply.
    Change(NetworkChange),
    /// A rejected local change.
    Error(ChangeErrorRecord),
}

impl ChangeRecord {
    /// Returns the object id the record is about.
    pub fn id(&self) -> &str {
        match self {
            ChangeRecord::Change(change) => &change.id,
            ChangeRecord::Error(error) => &error.id,
        }
    }

    /// Decodes one record.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::malformed_record("record must be an object"))?;
        let id = required_str(obj, "id")?.to_string();
        let ccids: Vec<String> = match obj.get("ccids") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|c| {
                    c.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ProtocolError::malformed_record("ccids must be strings"))
                })
                .collect::<ProtocolResult<_>>()?,
            Some(_) => return Err(ProtocolError::malformed_record("ccids must be an array")),
        };

        if let Some(error) = obj.get("error") {
            let code = error
                .as_u64()
                .and_then(|c| u16::try_from(c).ok())
                .ok_or_else(|| ProtocolError::malformed_record("error must be a status code"))?;
            return Ok(ChangeRecord::Error(ChangeErrorRecord {
                code: ChangeErrorCode::from_code(code),
                id,
                ccids,
            }));
        }

        let op = ChangeOp::from_code(required_str(obj, "o")?)
            .ok_or_else(|| ProtocolError::malformed_record("unknown change operation"))?;
        let cv = required_str(obj, "cv")?.to_string();
        let sv = optional_version(obj, "sv")?;
        let (ev, diff) = match op {
            ChangeOp::Modify => {
                let ev = optional_version(obj, "ev")?
                    .ok_or_else(|| ProtocolError::malformed_record("modify needs \"ev\""))?;
                let v = obj
                    .get("v")
                    .ok_or_else(|| ProtocolError::malformed_record("modify needs \"v\""))?;
                (ev, Some(operations_from_value(v)?))
            }
            ChangeOp::Remove => (optional_version(obj, "ev")?.unwrap_or(0), None),
        };

        Ok(ChangeRecord::Change(NetworkChange {
            op,
            id,
            cv,
            ccids,
            sv,
            ev,
            diff,
        }))
    }
}

/// Parses a `c:` payload.
///
/// The outer array must parse; each record then succeeds or fails on its own.
pub fn parse_change_batch(payload: &str) -> ProtocolResult<Vec<ProtocolResult<ChangeRecord>>> {
    let value: Value = serde_json::from_str(payload)?;
    let records = value
        .as_array()
        .ok_or_else(|| ProtocolError::malformed_frame("change batch must be an array"))?;
    Ok(records.iter().map(ChangeRecord::from_value).collect())
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &str) -> ProtocolResult<&'a str> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::malformed_record(format!("missing string \"{field}\"")))
}

fn optional_version(obj: &Map<String, Value>, field: &str) -> ProtocolResult<Option<u64>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ProtocolError::malformed_record(format!("\"{field}\" must be a version"))),
    }
}
