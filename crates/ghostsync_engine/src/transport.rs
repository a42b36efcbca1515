//! Transport layer abstraction for outbound frames.
//!
//! The channel itself performs no I/O. A [`FrameSink`] is whatever carries
//! its frames to the server: a websocket writer, a multiplexing connection or
//! a test double.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Carries encoded frames to the server.
pub trait FrameSink: Send {
    /// Sends one frame.
    fn send(&self, frame: String) -> SyncResult<()>;
}

/// Sink that feeds an unbounded tokio channel, typically drained by a
/// connection writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    /// Wraps a sender.
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl FrameSink for ChannelSink {
    fn send(&self, frame: String) -> SyncResult<()> {
        self.tx.send(frame).map_err(|_| SyncError::NotConnected)
    }
}

/// Sink that prefixes every frame with a channel index, for connections
/// carrying several buckets.
#[derive(Debug, Clone)]
pub struct MultiplexSink<T> {
    index: usize,
    inner: T,
}

impl<T: FrameSink> MultiplexSink<T> {
    /// Creates a sink for channel `index` over `inner`.
    pub fn new(index: usize, inner: T) -> Self {
        Self { index, inner }
    }
}

impl<T: FrameSink> FrameSink for MultiplexSink<T> {
    fn send(&self, frame: String) -> SyncResult<()> {
        self.inner.send(format!("{}:{}", self.index, frame))
    }
}

/// A mock sink for testing.
#[derive(Debug)]
pub struct MockSink {
    frames: Mutex<Vec<String>>,
    connected: Mutex<bool>,
}

impl MockSink {
    /// Creates a connected mock sink.
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            connected: Mutex::new(true),
        }
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock() = connected;
    }

    /// Drains the frames sent so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.frames.lock())
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for MockSink {
    fn send(&self, frame: String) -> SyncResult<()> {
        if !*self.connected.lock() {
            return Err(SyncError::NotConnected);
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}

impl<T: FrameSink + Sync> FrameSink for std::sync::Arc<T> {
    fn send(&self, frame: String) -> SyncResult<()> {
        (**self).send(frame)
    }
}
