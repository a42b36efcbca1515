//! Frames and the payloads carried by each command.
//!
//! A frame is `<command>:<payload>`. On a multiplexed connection it is
//! prefixed with the channel index, `<n>:<command>:<payload>`.

use crate::change::LocalChange;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Commands understood by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `init`: client hello with credentials.
    Init,
    /// `auth`: server answer to `init`.
    Auth,
    /// `i`: index page request or response.
    Index,
    /// `c`: a change, or a batch of change records.
    Changes,
    /// `e`: object version request or response.
    Entity,
    /// `cv`: change-version request or rejection.
    ChangeVersion,
}

impl Command {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Init => "init",
            Command::Auth => "auth",
            Command::Index => "i",
            Command::Changes => "c",
            Command::Entity => "e",
            Command::ChangeVersion => "cv",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "init" => Some(Command::Init),
            "auth" => Some(Command::Auth),
            "i" => Some(Command::Index),
            "c" => Some(Command::Changes),
            "e" => Some(Command::Entity),
            "cv" => Some(Command::ChangeVersion),
            _ => None,
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The command.
    pub command: Command,
    /// Everything after the first `:`.
    pub payload: String,
}

impl Frame {
    /// Creates a frame.
    pub fn new(command: Command, payload: impl Into<String>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Parses `<command>:<payload>`.
    pub fn parse(frame: &str) -> ProtocolResult<Self> {
        let (name, payload) = frame
            .split_once(':')
            .ok_or_else(|| ProtocolError::malformed_frame("missing command separator"))?;
        let command =
            Command::from_name(name).ok_or_else(|| ProtocolError::unknown_command(name))?;
        Ok(Self::new(command, payload))
    }

    /// Encodes the frame for the wire.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.command.as_str(), self.payload)
    }

    /// `init:{json}`.
    pub fn init(message: &InitMessage) -> ProtocolResult<Self> {
        Ok(Self::new(Command::Init, serde_json::to_string(message)?))
    }

    /// `i:1:<mark>::<limit>`.
    pub fn index(mark: Option<&str>, limit: usize) -> Self {
        Self::new(
            Command::Index,
            format!("1:{}::{}", mark.unwrap_or_default(), limit),
        )
    }

    /// `c:{change}`.
    pub fn change(change: &LocalChange) -> Self {
        Self::new(Command::Changes, change.to_wire().to_string())
    }

    /// `e:<id>.<version>`.
    pub fn entity(id: &str, version: u64) -> Self {
        Self::new(Command::Entity, format!("{id}.{version}"))
    }

    /// `cv:<cv>`.
    pub fn change_version(cv: &str) -> Self {
        Self::new(Command::ChangeVersion, cv)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.command.as_str(), self.payload)
    }
}

/// Splits a multiplexed frame into its channel index and the inner frame.
///
/// Returns `None` when the frame has no numeric prefix.
pub fn split_channel_prefix(frame: &str) -> Option<(usize, &str)> {
    let (head, rest) = frame.split_once(':')?;
    if head.is_empty() || !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    head.parse().ok().map(|index| (index, rest))
}

/// Payload of the `init` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    /// Bucket name.
    pub name: String,
    /// Client id, stable for the life of the client.
    pub clientid: String,
    /// Protocol api version.
    pub api: String,
    /// Access token.
    pub token: String,
    /// Application id.
    pub app_id: String,
    /// Client library name.
    pub library: String,
    /// Client library version.
    pub version: String,
}

/// Server answer to `init`.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResponse {
    /// Authenticated as the named user.
    Authorized(String),
    /// Rejected; the payload describes why.
    Unauthorized(Value),
}

impl AuthResponse {
    /// Parses an `auth` payload. A JSON payload is a rejection, anything else
    /// names the authenticated user.
    pub fn parse(payload: &str) -> Self {
        match serde_json::from_str::<Value>(payload) {
            Ok(detail) => AuthResponse::Unauthorized(detail),
            Err(_) => AuthResponse::Authorized(payload.to_string()),
        }
    }
}

/// One object in an index page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Object id.
    pub id: String,
    /// Object version.
    pub v: u64,
    /// Object data.
    #[serde(default)]
    pub d: Value,
}

/// Response to an index request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPage {
    /// Objects on this page.
    #[serde(default)]
    pub index: Vec<IndexEntry>,
    /// Cursor for the next page; absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark: Option<String>,
    /// Change version of the bucket when the index was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
}

impl IndexPage {
    /// Parses an `i` response payload.
    pub fn parse(payload: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Returns true when no further page follows.
    pub fn is_last(&self) -> bool {
        self.mark.is_none()
    }
}

/// Response to an `e:<id>.<version>` request.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionResponse {
    /// Object id.
    pub id: String,
    /// Requested version.
    pub version: u64,
    /// Object data at that version, or `None` when the server has no such version.
    pub data: Option<Value>,
}

impl VersionResponse {
    /// Parses `<id>.<version>\n<json>` or `<id>.<version>\n?`.
    pub fn parse(payload: &str) -> ProtocolResult<Self> {
        let (header, body) = payload
            .split_once('\n')
            .ok_or_else(|| ProtocolError::malformed_frame("version response has no body"))?;
        let (id, version) = header
            .rsplit_once('.')
            .ok_or_else(|| ProtocolError::malformed_frame("version response has no version"))?;
        let version = version.parse().map_err(|_| {
            ProtocolError::malformed_frame(format!("invalid version {version:?}"))
        })?;
        let data = if body.trim() == "?" {
            None
        } else {
            Some(serde_json::from_str(body)?)
        };
        Ok(Self {
            id: id.to_string(),
            version,
            data,
        })
    }
}
