//! Events a channel reports to its owner.

use ghostsync_diff::ObjectOperationSet;
use ghostsync_protocol::ChangeErrorCode;
use serde_json::Value;

/// Why a local change failed for good.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeFailure {
    /// The server rejected the change with this code.
    Rejected(ChangeErrorCode),
    /// The server does not have a version a remote change started from.
    VersionUnavailable {
        /// The missing version.
        version: u64,
    },
    /// A missing version was requested repeatedly without an answer.
    VersionTimeout {
        /// The missing version.
        version: u64,
        /// Requests sent.
        attempts: u32,
    },
    /// A remote change does not apply to the stored ghost and was skipped.
    Inapplicable {
        /// The diff or protocol error.
        message: String,
    },
    /// Queued local edits could not be rebased over a remote change.
    Unmergeable {
        /// The diff error.
        message: String,
    },
}

/// Something observers of a bucket need to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The server accepted the channel's credentials.
    Authenticated {
        /// Authenticated user.
        user: String,
    },
    /// The server rejected the channel's credentials. The channel is done.
    Unauthorized {
        /// Server-provided detail.
        detail: Value,
    },
    /// An object changed on the server, or arrived during indexing.
    Update {
        /// Object id.
        id: String,
        /// The object after the change, including rebased local edits.
        data: Value,
        /// The ghost data the remote change was applied to.
        original: Option<Value>,
        /// The remote diff.
        patch: Option<ObjectOperationSet>,
        /// True for objects delivered by the index.
        indexing: bool,
    },
    /// An object was removed on the server.
    Remove {
        /// Object id.
        id: String,
    },
    /// The server accepted a local change.
    Acknowledge {
        /// Object id.
        id: String,
        /// Client change id of the accepted change.
        ccid: String,
    },
    /// The index bootstrap finished and the channel is syncing.
    Indexed,
    /// Historical versions of an object, newest first.
    Revisions {
        /// Object id.
        id: String,
        /// `(version, data)` pairs that could be fetched.
        revisions: Vec<(u64, Value)>,
    },
    /// A local change was given up on after the server kept rejecting it.
    ChangeDropped {
        /// Object id.
        id: String,
        /// Client change id of the dropped change.
        ccid: String,
        /// The last error code.
        code: ChangeErrorCode,
    },
    /// A change could not be applied or was rejected without retry.
    ChangeError {
        /// Object id.
        id: String,
        /// What went wrong.
        failure: ChangeFailure,
    },
}

impl ChannelEvent {
    /// Returns the object id the event is about, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            ChannelEvent::Update { id, .. }
            | ChannelEvent::Remove { id }
            | ChannelEvent::Acknowledge { id, .. }
            | ChannelEvent::Revisions { id, .. }
            | ChannelEvent::ChangeDropped { id, .. }
            | ChannelEvent::ChangeError { id, .. } => Some(id),
            ChannelEvent::Authenticated { .. }
            | ChannelEvent::Unauthorized { .. }
            | ChannelEvent::Indexed => None,
        }
    }
}
