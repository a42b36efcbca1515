//! The per-bucket sync state machine.
//!
//! A [`Channel`] owns the ghosts of one bucket, the outbound [`LocalQueue`]
//! and the inbound per-object [`NetworkQueue`]. It performs no I/O: inbound
//! frames are fed to [`Channel::handle_message`], outbound frames are drained
//! with [`Channel::take_frames`] and observers read [`Channel::take_events`].

use crate::config::ChannelConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::{ChangeFailure, ChannelEvent};
use crate::local_queue::{LocalQueue, QueueSignal};
use crate::network_queue::NetworkQueue;
use crate::store::GhostStore;
use ghostsync_diff::{DiffResult, JsonDiff, ObjectOperationSet};
use ghostsync_protocol::change_util::{build_change, compress_changes, rebase};
use ghostsync_protocol::{
    parse_change_batch, AuthResponse, ChangeErrorCode, ChangeErrorRecord, ChangeOp, ChangeRecord,
    ChangeToken, Command, Frame, Ghost, IndexPage, InitMessage, LocalChange, NetworkChange, ProtocolError,
    VersionResponse,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What an authenticated channel is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Downloading the bucket index. Local changes are held back.
    Indexing,
    /// Exchanging changes.
    Syncing,
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the server to answer `init`.
    Unauthenticated,
    /// The server accepted the credentials.
    Authenticated(SyncPhase),
    /// The server rejected the credentials. Terminal.
    Unauthorized,
    /// Closed by the owner. Terminal.
    Disconnected,
}

impl ChannelState {
    /// Returns true once the server accepted the credentials.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ChannelState::Authenticated(_))
    }

    /// Returns true for states a channel never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Unauthorized | ChannelState::Disconnected)
    }

    fn name(&self) -> &'static str {
        match self {
            ChannelState::Unauthenticated => "unauthenticated",
            ChannelState::Authenticated(SyncPhase::Indexing) => "indexing",
            ChannelState::Authenticated(SyncPhase::Syncing) => "syncing",
            ChannelState::Unauthorized => "unauthorized",
            ChannelState::Disconnected => "disconnected",
        }
    }
}

/// Counters about a channel's traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Remote changes applied to ghosts.
    pub changes_applied: u64,
    /// Local changes put on the wire, resends included.
    pub changes_sent: u64,
    /// Local changes the server acknowledged.
    pub changes_acknowledged: u64,
    /// Remote changes that overlapped pending local edits.
    pub rebases: u64,
    /// Catch-up version requests sent.
    pub version_requests: u64,
    /// Index pages received.
    pub index_pages: u64,
}

enum TaskState {
    Done,
    Suspended,
}

/// A remote change parked until the version it starts from arrives.
struct VersionWait {
    change: NetworkChange,
    version: u64,
    requested_at: Instant,
    attempts: u32,
}

struct RevisionFetch {
    pending: BTreeSet<u64>,
    received: BTreeMap<u64, Value>,
    started: Instant,
}

struct Rebased {
    merged: Value,
    sent: Option<(ObjectOperationSet, Value)>,
}

/// Sync state machine for one bucket.
pub struct Channel<S: GhostStore> {
    config: ChannelConfig,
    store: S,
    diff: JsonDiff,
    state: ChannelState,
    user: Option<String>,
    local: LocalQueue,
    network: NetworkQueue<ChangeRecord>,
    awaiting: HashMap<String, VersionWait>,
    revisions: HashMap<String, RevisionFetch>,
    indexed: Option<HashSet<String>>,
    frames: VecDeque<Frame>,
    events: VecDeque<ChannelEvent>,
    stats: ChannelStats,
}

impl<S: GhostStore> Channel<S> {
    /// Creates a channel over `store`.
    pub fn new(config: ChannelConfig, store: S) -> Self {
        let diff = JsonDiff::new(config.diff_options());
        Self {
            local: LocalQueue::new(diff),
            diff,
            config,
            store,
            state: ChannelState::Unauthenticated,
            user: None,
            network: NetworkQueue::new(),
            awaiting: HashMap::new(),
            revisions: HashMap::new(),
            indexed: None,
            frames: VecDeque::new(),
            events: VecDeque::new(),
            stats: ChannelStats::default(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns the authenticated user.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Returns the ghost store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the outbound queue.
    pub fn local_queue(&self) -> &LocalQueue {
        &self.local
    }

    /// Returns traffic counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Returns true while a remote change for `id` waits for a missing version.
    pub fn is_awaiting_version(&self, id: &str) -> bool {
        self.awaiting.contains_key(id)
    }

    /// Drains the frames to put on the wire, oldest first.
    pub fn take_frames(&mut self) -> Vec<String> {
        self.frames.drain(..).map(|frame| frame.encode()).collect()
    }

    /// Drains pending events, oldest first.
    pub fn take_events(&mut self) -> Vec<ChannelEvent> {
        self.events.drain(..).collect()
    }

    /// Sends `init`, starting (or restarting after a reconnect) the handshake.
    pub fn connect(&mut self) -> SyncResult<()> {
        if self.state.is_terminal() {
            return Err(self.transition_error("unauthenticated"));
        }
        self.state = ChannelState::Unauthenticated;
        let init = InitMessage {
            name: self.config.bucket.clone(),
            clientid: self.config.client_id.clone(),
            api: self.config.api_version.clone(),
            token: self.config.access_token.clone(),
            app_id: self.config.app_id.clone(),
            library: self.config.library.clone(),
            version: self.config.library_version.clone(),
        };
        self.send(Frame::init(&init)?);
        debug!(bucket = %self.config.bucket, "sent init");
        Ok(())
    }

    /// The connection dropped. Local edits keep queueing until [`Channel::connect`].
    pub fn on_disconnect(&mut self) {
        self.local.pause();
        self.network.clear();
        self.awaiting.clear();
        self.indexed = None;
        if !self.state.is_terminal() {
            self.state = ChannelState::Unauthenticated;
        }
        info!(bucket = %self.config.bucket, "connection lost");
    }

    /// Shuts the channel down for good.
    pub fn close(&mut self) {
        self.local.pause();
        self.network.clear();
        self.awaiting.clear();
        self.revisions.clear();
        self.indexed = None;
        self.state = ChannelState::Disconnected;
        info!(bucket = %self.config.bucket, "channel closed");
    }

    /// Records a local edit of `id` to `data`.
    ///
    /// The diff is taken against the newest pending state of the object so
    /// consecutive edits chain.
    pub fn update(&mut self, id: &str, data: Value) -> SyncResult<()> {
        if self.state == ChannelState::Disconnected {
            return Err(SyncError::Closed);
        }
        let ghost = self.store.get(id)?;
        let base = self
            .local
            .latest_target(id)
            .cloned()
            .unwrap_or_else(|| ghost.data.clone());
        let change = build_change(
            &self.diff,
            ChangeOp::Modify,
            id,
            &data,
            &Ghost::new(id, ghost.version, base),
        );
        if change.is_empty() {
            debug!(id = %id, "update changes nothing");
            return Ok(());
        }
        let signal = self.local.queue(change, &self.store)?;
        self.dispatch(signal);
        Ok(())
    }

    /// Records a local removal of `id`.
    pub fn remove(&mut self, id: &str) -> SyncResult<()> {
        if self.state == ChannelState::Disconnected {
            return Err(SyncError::Closed);
        }
        let signal = self.local.queue(LocalChange::remove(id), &self.store)?;
        self.dispatch(signal);
        Ok(())
    }

    /// Requests up to `depth` versions of `id` preceding the ghost.
    ///
    /// A [`ChannelEvent::Revisions`] is emitted once every reply arrived or
    /// the revision timeout passed.
    pub fn request_revisions(&mut self, id: &str, depth: u64) -> SyncResult<()> {
        if !self.state.is_authenticated() {
            return Err(SyncError::NotConnected);
        }
        let ghost = self.store.get(id)?;
        let newest = ghost.version.saturating_sub(1);
        let oldest = ghost.version.saturating_sub(depth).max(1);
        if depth == 0 || newest < oldest {
            self.events.push_back(ChannelEvent::Revisions {
                id: id.to_string(),
                revisions: Vec::new(),
            });
            return Ok(());
        }
        if self.revisions.contains_key(id) {
            debug!(id = %id, "replacing running revision request");
        }
        let pending: BTreeSet<u64> = (oldest..=newest).collect();
        for version in pending.iter().rev() {
            self.send(Frame::entity(id, *version));
        }
        self.revisions.insert(
            id.to_string(),
            RevisionFetch {
                pending,
                received: BTreeMap::new(),
                started: Instant::now(),
            },
        );
        Ok(())
    }

    /// Handles one inbound frame, without a channel prefix.
    pub fn handle_message(&mut self, raw: &str) -> SyncResult<()> {
        match self.state {
            ChannelState::Disconnected => return Err(SyncError::Closed),
            ChannelState::Unauthorized => {
                return Err(SyncError::Unauthorized(self.config.bucket.clone()))
            }
            _ => {}
        }
        let frame = Frame::parse(raw)?;
        debug!(command = frame.command.as_str(), "frame received");
        match frame.command {
            Command::Auth => self.on_auth(&frame.payload),
            Command::Init => {
                Err(ProtocolError::malformed_frame("init is only sent by clients").into())
            }
            command if !self.state.is_authenticated() => {
                Err(self.transition_error(command.as_str()))
            }
            Command::Index => self.on_index(&frame.payload),
            Command::Changes => self.on_changes(&frame.payload),
            Command::Entity => self.on_entity(&frame.payload),
            Command::ChangeVersion => self.on_change_version(&frame.payload),
        }
    }

    /// Re-sends catch-up requests that went unanswered and gives up on those
    /// past their last attempt. Expires revision requests.
    pub fn tick(&mut self, now: Instant) -> SyncResult<()> {
        let timeout = self.config.version_request_timeout;
        let mut expired: Vec<String> = self
            .awaiting
            .iter()
            .filter(|(_, wait)| now.saturating_duration_since(wait.requested_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for id in expired {
            let Some(wait) = self.awaiting.get_mut(&id) else {
                continue;
            };
            if wait.attempts < self.config.max_version_requests {
                wait.attempts += 1;
                wait.requested_at = now;
                let (version, attempts) = (wait.version, wait.attempts);
                debug!(id = %id, version, attempts, "re-requesting missing version");
                self.stats.version_requests += 1;
                self.send(Frame::entity(&id, version));
            } else if let Some(wait) = self.awaiting.remove(&id) {
                warn!(
                    id = %id,
                    version = wait.version,
                    attempts = wait.attempts,
                    "missing version never arrived, dropping remote change"
                );
                self.events.push_back(ChannelEvent::ChangeError {
                    id: id.clone(),
                    failure: ChangeFailure::VersionTimeout {
                        version: wait.version,
                        attempts: wait.attempts,
                    },
                });
                self.settle(&id, Ok(TaskState::Done))?;
            }
        }

        let revision_timeout = self.config.revision_timeout;
        let mut stale: Vec<String> = self
            .revisions
            .iter()
            .filter(|(_, fetch)| now.saturating_duration_since(fetch.started) >= revision_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        for id in stale {
            debug!(id = %id, "revision request timed out");
            self.finish_revisions(&id);
        }
        Ok(())
    }

    fn transition_error(&self, to: &str) -> SyncError {
        SyncError::InvalidStateTransition {
            from: self.state.name().to_string(),
            to: to.to_string(),
        }
    }

    fn send(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }

    fn dispatch(&mut self, signal: Option<QueueSignal>) {
        match signal {
            Some(QueueSignal::Send(change)) => {
                debug!(id = %change.id, ccid = %change.ccid, op = change.op.as_str(), "sending change");
                self.stats.changes_sent += 1;
                self.send(Frame::change(&change));
            }
            Some(QueueSignal::Wait { id }) => {
                debug!(id = %id, "change queued behind one in flight");
            }
            None => {}
        }
    }

    fn start_local(&mut self) -> SyncResult<()> {
        for signal in self.local.resend_sent_changes() {
            self.dispatch(Some(signal));
        }
        for signal in self.local.start(&self.store)? {
            self.dispatch(Some(signal));
        }
        Ok(())
    }

    fn on_auth(&mut self, payload: &str) -> SyncResult<()> {
        match AuthResponse::parse(payload) {
            AuthResponse::Unauthorized(detail) => {
                warn!(bucket = %self.config.bucket, "server rejected credentials");
                self.state = ChannelState::Unauthorized;
                self.local.pause();
                self.events.push_back(ChannelEvent::Unauthorized { detail });
                Ok(())
            }
            AuthResponse::Authorized(user) => {
                info!(bucket = %self.config.bucket, user = %user, "authenticated");
                self.user = Some(user.clone());
                self.events.push_back(ChannelEvent::Authenticated { user });
                match self.store.change_version()? {
                    Some(cv) => {
                        self.state = ChannelState::Authenticated(SyncPhase::Syncing);
                        self.send(Frame::change_version(&cv));
                        self.start_local()
                    }
                    None => {
                        self.start_indexing();
                        Ok(())
                    }
                }
            }
        }
    }

    fn start_indexing(&mut self) {
        info!(bucket = %self.config.bucket, "indexing bucket");
        self.state = ChannelState::Authenticated(SyncPhase::Indexing);
        self.local.pause();
        self.indexed = Some(HashSet::new());
        self.send(Frame::index(None, self.config.index_page_size));
    }

    fn on_index(&mut self, payload: &str) -> SyncResult<()> {
        if self.state != ChannelState::Authenticated(SyncPhase::Indexing) {
            debug!("index page outside of indexing, ignoring");
            return Ok(());
        }
        let page = IndexPage::parse(payload)?;
        self.stats.index_pages += 1;
        debug!(objects = page.index.len(), last = page.is_last(), "index page");

        for entry in page.index {
            self.store.put(&entry.id, entry.v, entry.d.clone())?;
            if let Some(seen) = self.indexed.as_mut() {
                seen.insert(entry.id.clone());
            }
            self.events.push_back(ChannelEvent::Update {
                id: entry.id,
                data: entry.d,
                original: None,
                patch: None,
                indexing: true,
            });
        }

        match page.mark {
            Some(mark) => {
                self.send(Frame::index(Some(&mark), self.config.index_page_size));
                Ok(())
            }
            None => self.finish_indexing(page.current),
        }
    }

    fn finish_indexing(&mut self, current: Option<String>) -> SyncResult<()> {
        let seen = self.indexed.take().unwrap_or_default();
        let mut stale = Vec::new();
        self.store.for_each_ghost(&mut |ghost| {
            if !seen.contains(&ghost.key) {
                stale.push(ghost.key.clone());
            }
        })?;
        for id in stale {
            debug!(id = %id, "removing ghost missing from the index");
            self.store.remove(&id)?;
            self.events.push_back(ChannelEvent::Remove { id });
        }

        match current {
            Some(cv) => self.store.set_change_version(&cv)?,
            None => warn!(bucket = %self.config.bucket, "index finished without a change version"),
        }
        self.state = ChannelState::Authenticated(SyncPhase::Syncing);
        info!(bucket = %self.config.bucket, objects = seen.len(), "index complete");
        self.start_local()?;
        self.events.push_back(ChannelEvent::Indexed);
        Ok(())
    }

    fn on_change_version(&mut self, payload: &str) -> SyncResult<()> {
        if payload.trim() == "?" {
            warn!(bucket = %self.config.bucket, "server does not know our change version, re-indexing");
            self.store.clear_change_version()?;
            self.start_indexing();
        } else {
            debug!(payload = %payload, "ignoring change version frame");
        }
        Ok(())
    }

    /// Runs every record of a batch. A record that fails only affects its
    /// own object; store failures are returned once the batch is done.
    fn on_changes(&mut self, payload: &str) -> SyncResult<()> {
        let mut store_error = None;
        for record in parse_change_batch(payload)? {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping malformed change record");
                    continue;
                }
            };
            let id = record.id().to_string();
            if let Some(task) = self.network.add(&id, record) {
                let result = self.run_record(task);
                if let Err(err) = self.settle(&id, result) {
                    store_error.get_or_insert(err);
                }
            }
        }
        store_error.map_or(Ok(()), Err)
    }

    /// Finishes the running task for `id` and runs whatever queued behind it
    /// until a task suspends or the queue drains.
    ///
    /// A record that cannot be applied is reported and skipped. Only store
    /// failures abandon the object's queue.
    fn settle(&mut self, id: &str, mut result: SyncResult<TaskState>) -> SyncResult<()> {
        loop {
            match result {
                Ok(TaskState::Suspended) => return Ok(()),
                Ok(TaskState::Done) => match self.network.complete(id) {
                    Some(next) => result = self.run_record(next),
                    None => return Ok(()),
                },
                Err(err @ SyncError::Store { .. }) => {
                    let dropped = self.network.discard(id);
                    warn!(id = %id, error = %err, dropped, "remote change failed");
                    return Err(err);
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "remote change does not apply, skipping it");
                    self.events.push_back(ChannelEvent::ChangeError {
                        id: id.to_string(),
                        failure: ChangeFailure::Inapplicable {
                            message: err.to_string(),
                        },
                    });
                    result = Ok(TaskState::Done);
                }
            }
        }
    }

    fn run_record(&mut self, record: ChangeRecord) -> SyncResult<TaskState> {
        match record {
            ChangeRecord::Error(error) => {
                self.handle_change_error(error)?;
                Ok(TaskState::Done)
            }
            ChangeRecord::Change(change) => {
                let ghost = self.store.get(&change.id)?;
                self.apply_change(change, ghost)
            }
        }
    }

    fn apply_change(&mut self, change: NetworkChange, ghost: Ghost) -> SyncResult<TaskState> {
        if change.op == ChangeOp::Remove {
            self.apply_remove(change)?;
            return Ok(TaskState::Done);
        }

        let ghost = match change.sv {
            None if ghost.is_synced() => {
                debug!(id = %change.id, "change recreates the object");
                Ghost::empty(&change.id)
            }
            _ => ghost,
        };
        if !ghost.matches_start_version(change.sv) {
            if ghost.is_synced() && change.ev <= ghost.version {
                debug!(id = %change.id, ev = change.ev, have = ghost.version, "change already applied");
                self.store.set_change_version(&change.cv)?;
                return Ok(TaskState::Done);
            }
            let version = change.sv.unwrap_or_default();
            self.request_version(change, version, ghost.version);
            return Ok(TaskState::Suspended);
        }

        self.apply_modify(change, ghost)?;
        Ok(TaskState::Done)
    }

    fn request_version(&mut self, change: NetworkChange, version: u64, have: u64) {
        info!(id = %change.id, have, want = version, "requesting missing version");
        self.stats.version_requests += 1;
        self.send(Frame::entity(&change.id, version));
        self.awaiting.insert(
            change.id.clone(),
            VersionWait {
                change,
                version,
                requested_at: Instant::now(),
                attempts: 1,
            },
        );
    }

    fn acknowledged_token(&self, change: &NetworkChange) -> Option<ChangeToken> {
        self.local
            .sent(&change.id)
            .filter(|sent| change.acknowledges(&sent.ccid))
            .map(LocalChange::token)
    }

    fn acknowledge(&mut self, id: &str, token: ChangeToken) -> SyncResult<()> {
        if let Some(ack) = self.local.acknowledge(id, token, &self.store)? {
            self.stats.changes_acknowledged += 1;
            self.dispatch(ack.next);
            self.events.push_back(ChannelEvent::Acknowledge {
                id: id.to_string(),
                ccid: ack.change.ccid,
            });
        }
        Ok(())
    }

    fn apply_remove(&mut self, change: NetworkChange) -> SyncResult<()> {
        let id = change.id.clone();
        self.store.remove(&id)?;
        match self.acknowledged_token(&change) {
            Some(token) => self.acknowledge(&id, token)?,
            None => {
                let dropped = self.local.dequeue_changes_for(&id);
                if !dropped.is_empty() {
                    info!(id = %id, dropped = dropped.len(), "object removed remotely, discarding local changes");
                }
                self.events.push_back(ChannelEvent::Remove { id });
            }
        }
        self.stats.changes_applied += 1;
        self.store.set_change_version(&change.cv)?;
        Ok(())
    }

    fn apply_modify(&mut self, change: NetworkChange, ghost: Ghost) -> SyncResult<()> {
        let id = change.id.clone();
        let remote = change.diff.clone().unwrap_or_default();
        let data = self.diff.apply_object_diff(&ghost.data, &remote)?;

        if let Some(token) = self.acknowledged_token(&change) {
            self.store.put(&id, change.ev, data)?;
            debug!(id = %id, version = change.ev, "change acknowledged");
            self.acknowledge(&id, token)?;
        } else {
            self.merge_remote(&change, ghost, data, remote)?;
        }

        self.stats.changes_applied += 1;
        self.store.set_change_version(&change.cv)?;
        Ok(())
    }

    /// Applies a change made by someone else, carrying pending local edits
    /// over it.
    fn merge_remote(
        &mut self,
        change: &NetworkChange,
        ghost: Ghost,
        data: Value,
        remote: ObjectOperationSet,
    ) -> SyncResult<()> {
        let id = change.id.as_str();
        let sent = self.local.sent(id).cloned();
        let queued = self.local.dequeue_queued_for(id);

        if sent.as_ref().is_some_and(LocalChange::is_remove) || queued.iter().any(LocalChange::is_remove) {
            for change in queued.into_iter().rev() {
                self.local.requeue_front(change);
            }
            self.store.put(id, change.ev, data)?;
            debug!(id = %id, "remote change to an object pending local removal");
            return Ok(());
        }

        if sent.is_some() || !queued.is_empty() {
            self.stats.rebases += 1;
        }
        let (merged, sent_rebase) =
            match self.rebase_pending(sent.as_ref(), &queued, &ghost.data, &data, &remote) {
                Ok(rebased) => (rebased.merged, rebased.sent),
                Err(err) => {
                    warn!(id = %id, error = %err, dropped = queued.len(), "local changes no longer apply, dropping them");
                    if !queued.is_empty() {
                        self.events.push_back(ChannelEvent::ChangeError {
                            id: id.to_string(),
                            failure: ChangeFailure::Unmergeable {
                                message: err.to_string(),
                            },
                        });
                    }
                    (data.clone(), None)
                }
            };

        self.store.put(id, change.ev, data.clone())?;
        let base = match sent_rebase {
            Some((diff, predicted)) => {
                self.local
                    .rebase_sent(id, diff, Some(change.ev), predicted.clone());
                predicted
            }
            None => data,
        };
        let pending = self.diff.object_diff(&base, &merged);
        if !pending.is_empty() {
            let requeued = LocalChange::modify(id, pending, Some(change.ev), merged.clone());
            let signal = self.local.queue(requeued, &self.store)?;
            self.dispatch(signal);
        }

        self.events.push_back(ChannelEvent::Update {
            id: id.to_string(),
            data: merged,
            original: Some(ghost.data),
            patch: Some(remote),
            indexing: false,
        });
        Ok(())
    }

    /// Rebases the pending local edits, all relative to `pre`, over `remote`.
    ///
    /// Returns the merged object and, for an in-flight change, its diff
    /// relative to `new` together with the state it is expected to produce.
    fn rebase_pending(
        &self,
        sent: Option<&LocalChange>,
        queued: &[LocalChange],
        pre: &Value,
        new: &Value,
        remote: &ObjectOperationSet,
    ) -> DiffResult<Rebased> {
        let policy = self.config.conflict_policy;
        let pending: Vec<LocalChange> = sent.into_iter().chain(queued).cloned().collect();
        let local = compress_changes(&self.diff, &pending, pre)?.unwrap_or_default();
        let rebased = rebase(&self.diff, &local, remote, pre, policy)?;
        let merged = self.diff.apply_object_diff(new, &rebased)?;

        let sent = match sent.and_then(|change| change.diff.as_ref()) {
            Some(diff) => {
                let diff = rebase(&self.diff, diff, remote, pre, policy)?;
                let predicted = self.diff.apply_object_diff(new, &diff)?;
                Some((diff, predicted))
            }
            None => None,
        };
        Ok(Rebased { merged, sent })
    }

    fn handle_change_error(&mut self, error: ChangeErrorRecord) -> SyncResult<()> {
        let id = error.id.clone();
        let Some(sent) = self
            .local
            .sent(&id)
            .filter(|sent| error.refers_to(&sent.ccid))
            .cloned()
        else {
            let code = error.code;
            if matches!(code, ChangeErrorCode::DuplicateChange | ChangeErrorCode::EmptyResponse)
                || code.wants_full_object()
            {
                debug!(id = %id, code = %code, "error for a change not in flight");
            } else {
                warn!(id = %id, code = %code, "change rejected after it left flight");
                self.events.push_back(ChannelEvent::ChangeError {
                    id,
                    failure: ChangeFailure::Rejected(code),
                });
            }
            return Ok(());
        };

        match error.code {
            ChangeErrorCode::DuplicateChange | ChangeErrorCode::EmptyResponse => {
                debug!(id = %id, code = %error.code, "treating rejection as acknowledgment");
                self.acknowledge(&id, sent.token())
            }
            code if code.wants_full_object() && !sent.full_object_sent && !sent.is_remove() => {
                warn!(id = %id, code = %code, "change rejected, resending with the full object");
                let signal = self.local.resend(sent.with_full_object(sent.target.clone()));
                self.dispatch(Some(signal));
                Ok(())
            }
            code if code.wants_full_object() => {
                warn!(id = %id, ccid = %sent.ccid, code = %code, "change rejected again, dropping it");
                self.drop_sent(&id)?;
                self.events.push_back(ChannelEvent::ChangeDropped {
                    id: id.clone(),
                    ccid: sent.ccid,
                    code,
                });
                let signal = self.local.process(&id, &self.store)?;
                self.dispatch(signal);
                Ok(())
            }
            code => {
                warn!(id = %id, ccid = %sent.ccid, code = %code, "change rejected");
                self.drop_sent(&id)?;
                self.events.push_back(ChannelEvent::ChangeError {
                    id: id.clone(),
                    failure: ChangeFailure::Rejected(code),
                });
                let signal = self.local.process(&id, &self.store)?;
                self.dispatch(signal);
                Ok(())
            }
        }
    }

    fn drop_sent(&mut self, id: &str) -> SyncResult<()> {
        let ghost = self.store.get(id)?;
        self.local.drop_sent(id, &ghost.data);
        Ok(())
    }

    fn on_entity(&mut self, payload: &str) -> SyncResult<()> {
        let response = VersionResponse::parse(payload)?;
        let id = response.id.clone();
        let mut handled = false;

        if let Some(fetch) = self.revisions.get_mut(&id) {
            if fetch.pending.remove(&response.version) {
                handled = true;
                if let Some(data) = &response.data {
                    fetch.received.insert(response.version, data.clone());
                }
                if fetch.pending.is_empty() {
                    self.finish_revisions(&id);
                }
            }
        }

        let wanted = self
            .awaiting
            .get(&id)
            .is_some_and(|wait| wait.version == response.version);
        if let Some(wait) = wanted.then(|| self.awaiting.remove(&id)).flatten() {
            handled = true;
            match response.data {
                Some(data) => {
                    debug!(id = %id, version = response.version, "missing version arrived");
                    let ghost = Ghost::new(id.as_str(), response.version, data);
                    let result = self.apply_change(wait.change, ghost);
                    self.settle(&id, result)?;
                }
                None => {
                    warn!(id = %id, version = response.version, "server does not have the version a change starts from, dropping it");
                    self.events.push_back(ChannelEvent::ChangeError {
                        id: id.clone(),
                        failure: ChangeFailure::VersionUnavailable {
                            version: response.version,
                        },
                    });
                    self.settle(&id, Ok(TaskState::Done))?;
                }
            }
        }

        if !handled {
            debug!(id = %id, version = response.version, "unsolicited version response");
        }
        Ok(())
    }

    fn finish_revisions(&mut self, id: &str) {
        if let Some(fetch) = self.revisions.remove(id) {
            self.events.push_back(ChannelEvent::Revisions {
                id: id.to_string(),
                revisions: fetch.received.into_iter().rev().collect(),
            });
        }
    }
}
