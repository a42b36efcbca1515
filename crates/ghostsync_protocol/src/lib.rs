//! # ghostsync protocol
//!
//! Wire types and change utilities for ghostsync.
//!
//! This crate provides:
//! - [`Ghost`], the last acknowledged state of an object
//! - [`LocalChange`] and [`NetworkChange`] change records
//! - [`Frame`] parsing and the payloads of each command
//! - [`change_util`] for building, compressing and rebasing changes
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
pub mod change_util;
mod error;
mod ghost;
mod messages;

pub use change::{
    parse_change_batch, ChangeErrorCode, ChangeErrorRecord, ChangeOp, ChangeRecord, ChangeToken,
    LocalChange, NetworkChange,
};
pub use error::{ProtocolError, ProtocolResult};
pub use ghost::Ghost;
pub use messages::{
    split_channel_prefix, AuthResponse, Command, Frame, IndexEntry, IndexPage, InitMessage,
    VersionResponse,
};
