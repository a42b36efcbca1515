//! # ghostsync engine
//!
//! Client-side sync channel for ghostsync buckets.
//!
//! This crate provides:
//! - [`Channel`], the per-bucket state machine
//!   (unauthenticated → authenticated → indexing → syncing)
//! - [`LocalQueue`], at most one change in flight per object with
//!   compression of everything queued behind it
//! - [`NetworkQueue`], per-object serialization of inbound changes
//! - [`GhostStore`], storage for the last acknowledged object states
//! - [`ChannelDriver`], a tokio task running a channel against a [`FrameSink`]
//!
//! ## Architecture
//!
//! The channel is sans-I/O. Inbound frames go to [`Channel::handle_message`];
//! outbound frames and [`ChannelEvent`]s are drained by the owner. Remote
//! changes that overlap pending local edits are merged by rebasing the local
//! edits over the remote diff, so every replica converges.
//!
//! ## Key Invariants
//!
//! - At most one local change per object is on the wire
//! - Remote changes for one object apply in arrival order
//! - A change is only applied to the ghost version it starts from
//! - Acknowledgments are matched by change identity, not by value

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod config;
mod driver;
mod error;
mod event;
mod local_queue;
mod network_queue;
mod store;
mod transport;

pub use channel::{Channel, ChannelState, ChannelStats, SyncPhase};
pub use config::{ChannelConfig, API_VERSION};
pub use driver::{ChannelCommand, ChannelDriver, DriverHandle, DRIVER_BUFFER};
pub use error::{SyncError, SyncResult};
pub use event::{ChangeFailure, ChannelEvent};
pub use local_queue::{Acknowledgement, LocalQueue, QueueSignal};
pub use network_queue::{KeyQueue, NetworkQueue};
pub use store::{GhostStore, MemoryGhostStore};
pub use transport::{ChannelSink, FrameSink, MockSink, MultiplexSink};
