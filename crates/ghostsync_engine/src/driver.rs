//! Async driver that runs a [`Channel`] on a tokio task.
//!
//! The driver owns the channel. Inbound frames and owner commands arrive on
//! bounded mpsc queues, outbound frames leave through a [`FrameSink`] and
//! events are forwarded to an unbounded mpsc sender. A periodic tick drives
//! catch-up retries and revision timeouts.

use crate::channel::Channel;
use crate::error::{SyncError, SyncResult};
use crate::event::ChannelEvent;
use crate::store::GhostStore;
use crate::transport::FrameSink;
use serde_json::Value;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Capacity of the inbound frame and command queues.
pub const DRIVER_BUFFER: usize = 64;

/// Commands an owner sends to a running channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    /// Send `init` on a fresh connection.
    Connect,
    /// Record a local edit.
    Update {
        /// Object id.
        id: String,
        /// New object state.
        data: Value,
    },
    /// Record a local removal.
    Remove {
        /// Object id.
        id: String,
    },
    /// Fetch historical versions of an object.
    RequestRevisions {
        /// Object id.
        id: String,
        /// How many versions back to go.
        depth: u64,
    },
    /// The connection dropped.
    Disconnect,
    /// Stop the driver.
    Close,
}

/// Handle for talking to a running driver.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    frames: mpsc::Sender<String>,
    commands: mpsc::Sender<ChannelCommand>,
}

impl DriverHandle {
    /// Delivers an inbound frame, already stripped of any channel prefix.
    pub async fn deliver(&self, frame: impl Into<String>) -> SyncResult<()> {
        self.frames
            .send(frame.into())
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Sends a command.
    pub async fn command(&self, command: ChannelCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Starts the handshake.
    pub async fn connect(&self) -> SyncResult<()> {
        self.command(ChannelCommand::Connect).await
    }

    /// Records a local edit.
    pub async fn update(&self, id: impl Into<String>, data: Value) -> SyncResult<()> {
        self.command(ChannelCommand::Update {
            id: id.into(),
            data,
        })
        .await
    }

    /// Records a local removal.
    pub async fn remove(&self, id: impl Into<String>) -> SyncResult<()> {
        self.command(ChannelCommand::Remove { id: id.into() }).await
    }

    /// Requests historical versions of an object.
    pub async fn request_revisions(&self, id: impl Into<String>, depth: u64) -> SyncResult<()> {
        self.command(ChannelCommand::RequestRevisions {
            id: id.into(),
            depth,
        })
        .await
    }

    /// Reports a dropped connection.
    pub async fn disconnect(&self) -> SyncResult<()> {
        self.command(ChannelCommand::Disconnect).await
    }

    /// Stops the driver.
    pub async fn close(&self) -> SyncResult<()> {
        self.command(ChannelCommand::Close).await
    }
}

enum Step {
    Frame(String),
    Command(ChannelCommand),
    Tick,
    Stop,
}

/// Runs a channel against a sink.
pub struct ChannelDriver<S: GhostStore, K: FrameSink> {
    channel: Channel<S>,
    sink: K,
    events: mpsc::UnboundedSender<ChannelEvent>,
    inbound: mpsc::Receiver<String>,
    commands: mpsc::Receiver<ChannelCommand>,
}

impl<S: GhostStore, K: FrameSink> ChannelDriver<S, K> {
    /// Creates a driver and the handle used to feed it.
    pub fn new(
        channel: Channel<S>,
        sink: K,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> (Self, DriverHandle) {
        let (frame_tx, inbound) = mpsc::channel(DRIVER_BUFFER);
        let (command_tx, commands) = mpsc::channel(DRIVER_BUFFER);
        let driver = Self {
            channel,
            sink,
            events,
            inbound,
            commands,
        };
        let handle = DriverHandle {
            frames: frame_tx,
            commands: command_tx,
        };
        (driver, handle)
    }

    /// Runs until closed, all handles are dropped, or the channel reaches a
    /// terminal state. Returns the channel.
    ///
    /// Commands are served before inbound frames when both are ready.
    pub async fn run(mut self) -> SyncResult<Channel<S>> {
        let mut ticker = tokio::time::interval(self.channel.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(bucket = %self.channel.config().bucket, "channel driver started");

        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => command.map_or(Step::Stop, Step::Command),
                frame = self.inbound.recv() => frame.map_or(Step::Stop, Step::Frame),
                _ = ticker.tick() => Step::Tick,
            };

            let result = match step {
                Step::Frame(frame) => self.channel.handle_message(&frame),
                Step::Command(ChannelCommand::Close) | Step::Stop => {
                    self.channel.close();
                    self.flush();
                    break;
                }
                Step::Command(command) => self.apply(command),
                Step::Tick => self.channel.tick(Instant::now()),
            };
            if let Err(err) = result {
                warn!(bucket = %self.channel.config().bucket, error = %err, "channel step failed");
            }
            self.flush();

            if self.channel.state().is_terminal() {
                debug!(state = ?self.channel.state(), "channel reached a terminal state");
                break;
            }
        }

        info!(bucket = %self.channel.config().bucket, "channel driver stopped");
        Ok(self.channel)
    }

    fn apply(&mut self, command: ChannelCommand) -> SyncResult<()> {
        match command {
            ChannelCommand::Connect => self.channel.connect(),
            ChannelCommand::Update { id, data } => self.channel.update(&id, data),
            ChannelCommand::Remove { id } => self.channel.remove(&id),
            ChannelCommand::RequestRevisions { id, depth } => {
                self.channel.request_revisions(&id, depth)
            }
            ChannelCommand::Disconnect => {
                self.channel.on_disconnect();
                Ok(())
            }
            ChannelCommand::Close => {
                self.channel.close();
                Ok(())
            }
        }
    }

    fn flush(&mut self) {
        for frame in self.channel.take_frames() {
            if let Err(err) = self.sink.send(frame) {
                warn!(error = %err, "frame could not be sent, treating connection as lost");
                self.channel.on_disconnect();
                // The rest is rebuilt from the queues on the next connect.
                self.channel.take_frames();
                break;
            }
        }
        for event in self.channel.take_events() {
            if self.events.send(event).is_err() {
                debug!("event receiver dropped");
                break;
            }
        }
    }
}
