//! Outbound local changes.
//!
//! Per object id the queue holds at most one change on the wire (`sent`)
//! and an ordered list of changes made while it was outstanding (`queued`).
//! When the in-flight change is acknowledged the queued run is compressed
//! into a single change and sent.

use crate::error::SyncResult;
use crate::store::GhostStore;
use ghostsync_diff::{JsonDiff, ObjectOperationSet};
use ghostsync_protocol::change_util::compress_changes;
use ghostsync_protocol::{ChangeOp, ChangeToken, Ghost, LocalChange};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// What the queue wants the channel to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueSignal {
    /// Put this change on the wire.
    Send(LocalChange),
    /// A change for this id is still in flight; the new one waits.
    Wait {
        /// Object id.
        id: String,
    },
}

/// Result of acknowledging the in-flight change for an id.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    /// The change that was cleared.
    pub change: LocalChange,
    /// What to do with the changes queued behind it.
    pub next: Option<QueueSignal>,
}

/// Outbound queue of local changes.
#[derive(Debug)]
pub struct LocalQueue {
    diff: JsonDiff,
    sent: BTreeMap<String, LocalChange>,
    queued: BTreeMap<String, VecDeque<LocalChange>>,
    running: bool,
}

impl LocalQueue {
    /// Creates a paused queue.
    pub fn new(diff: JsonDiff) -> Self {
        Self {
            diff,
            sent: BTreeMap::new(),
            queued: BTreeMap::new(),
            running: false,
        }
    }

    /// Returns true once started.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts processing and sends whatever is queued.
    pub fn start<S: GhostStore + ?Sized>(&mut self, store: &S) -> SyncResult<Vec<QueueSignal>> {
        self.running = true;
        let ids: Vec<String> = self.queued.keys().cloned().collect();
        let mut signals = Vec::new();
        for id in ids {
            signals.extend(self.process(&id, store)?);
        }
        Ok(signals)
    }

    /// Stops processing. Queued changes are kept.
    pub fn pause(&mut self) {
        self.running = false;
    }

    /// Queues a change and, when running, tries to send it.
    pub fn queue<S: GhostStore + ?Sized>(
        &mut self,
        change: LocalChange,
        store: &S,
    ) -> SyncResult<Option<QueueSignal>> {
        let id = change.id.clone();
        self.queued.entry(id.clone()).or_default().push_back(change);
        if !self.running {
            return Ok(None);
        }
        self.process(&id, store)
    }

    /// Sends the queued changes for `id` unless one is already in flight.
    pub fn process<S: GhostStore + ?Sized>(
        &mut self,
        id: &str,
        store: &S,
    ) -> SyncResult<Option<QueueSignal>> {
        if self.queued.get(id).map_or(true, VecDeque::is_empty) {
            return Ok(None);
        }
        if self.sent.contains_key(id) {
            debug!(id = %id, "change in flight, waiting");
            return Ok(Some(QueueSignal::Wait { id: id.to_string() }));
        }
        let ghost = store.get(id)?;
        Ok(self.compress_and_send(id, &ghost))
    }

    /// Folds the leading run of queued modifications into one change against
    /// `ghost` and marks it sent.
    ///
    /// The run stops before a remove, which is sent on its own later. A single
    /// queued change is sent as is. A run that folds to nothing is discarded.
    pub fn compress_and_send(&mut self, id: &str, ghost: &Ghost) -> Option<QueueSignal> {
        if self.sent.contains_key(id) {
            return Some(QueueSignal::Wait { id: id.to_string() });
        }

        while let Some(batch) = self.next_batch(id) {
            let change = match <[LocalChange; 1]>::try_from(batch) {
                Ok([mut single]) => {
                    if single.op == ChangeOp::Modify {
                        single.sv = ghost.is_synced().then_some(ghost.version);
                    }
                    single
                }
                Err(batch) => match self.fold(id, &batch, ghost) {
                    Some(change) => change,
                    None => {
                        debug!(id = %id, folded = batch.len(), "queued changes cancel out");
                        continue;
                    }
                },
            };
            self.sent.insert(id.to_string(), change.clone());
            return Some(QueueSignal::Send(change));
        }
        None
    }

    fn next_batch(&mut self, id: &str) -> Option<Vec<LocalChange>> {
        let queue = self.queued.get_mut(id)?;
        let batch: Vec<LocalChange> = match queue.front() {
            None => Vec::new(),
            Some(head) if head.is_remove() => queue.pop_front().into_iter().collect(),
            Some(_) => {
                let run = queue.iter().take_while(|c| !c.is_remove()).count();
                queue.drain(..run).collect()
            }
        };
        if queue.is_empty() {
            self.queued.remove(id);
        }
        (!batch.is_empty()).then_some(batch)
    }

    fn fold(&self, id: &str, batch: &[LocalChange], ghost: &Ghost) -> Option<LocalChange> {
        let target = batch.last()?.target.clone();
        let diff = match compress_changes(&self.diff, batch, &ghost.data) {
            Ok(Some(diff)) => diff,
            Ok(None) => self.diff.object_diff(&ghost.data, &target),
            Err(err) => {
                warn!(id = %id, error = %err, "queued diffs no longer fold, diffing against the ghost");
                self.diff.object_diff(&ghost.data, &target)
            }
        };
        if diff.is_empty() {
            return None;
        }
        let sv = ghost.is_synced().then_some(ghost.version);
        Some(LocalChange::modify(id, diff, sv, target))
    }

    /// Clears the in-flight change for `id` if `token` identifies it, then
    /// resumes sending.
    ///
    /// Returns `None` when `token` is not the in-flight change.
    pub fn acknowledge<S: GhostStore + ?Sized>(
        &mut self,
        id: &str,
        token: ChangeToken,
        store: &S,
    ) -> SyncResult<Option<Acknowledgement>> {
        if self.sent.get(id).map(LocalChange::token) != Some(token) {
            return Ok(None);
        }
        let Some(change) = self.sent.remove(id) else {
            return Ok(None);
        };
        let next = if self.running {
            self.process(id, store)?
        } else {
            None
        };
        Ok(Some(Acknowledgement { change, next }))
    }

    /// Returns the in-flight change for `id`.
    pub fn sent(&self, id: &str) -> Option<&LocalChange> {
        self.sent.get(id)
    }

    /// Returns the changes queued behind the in-flight one.
    pub fn queued(&self, id: &str) -> impl Iterator<Item = &LocalChange> {
        self.queued.get(id).into_iter().flatten()
    }

    /// Returns true if anything is in flight or queued for `id`.
    pub fn has_pending(&self, id: &str) -> bool {
        self.sent.contains_key(id) || self.queued.contains_key(id)
    }

    /// The object state the newest pending change moves `id` to.
    pub fn latest_target(&self, id: &str) -> Option<&Value> {
        self.queued
            .get(id)
            .and_then(VecDeque::back)
            .or_else(|| self.sent.get(id))
            .map(|change| &change.target)
    }

    /// Removes and returns both the in-flight and the queued changes for `id`.
    pub fn dequeue_changes_for(&mut self, id: &str) -> Vec<LocalChange> {
        let mut changes: Vec<LocalChange> = self.sent.remove(id).into_iter().collect();
        changes.extend(self.dequeue_queued_for(id));
        changes
    }

    /// Removes and returns the queued changes for `id`, leaving the in-flight one.
    pub fn dequeue_queued_for(&mut self, id: &str) -> Vec<LocalChange> {
        self.queued
            .remove(id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Puts a change back at the head of its queue.
    pub fn requeue_front(&mut self, change: LocalChange) {
        self.queued
            .entry(change.id.clone())
            .or_default()
            .push_front(change);
    }

    /// Replaces the in-flight change for its id and sends it again.
    pub fn resend(&mut self, change: LocalChange) -> QueueSignal {
        self.sent.insert(change.id.clone(), change.clone());
        QueueSignal::Send(change)
    }

    /// Re-expresses the in-flight change for `id` against a newer ghost.
    ///
    /// The client change id is kept so the server's acknowledgment still
    /// matches; a resend after reconnecting carries the rebased diff.
    pub fn rebase_sent(
        &mut self,
        id: &str,
        diff: ObjectOperationSet,
        sv: Option<u64>,
        target: Value,
    ) {
        if let Some(change) = self.sent.get_mut(id) {
            change.diff = Some(diff);
            change.sv = sv;
            change.target = target;
        }
    }

    /// Gives up on the in-flight change for `id`.
    ///
    /// The head of the queue was chained on the dropped change, so its diff
    /// is re-derived from `base`, the last state the server acknowledged.
    pub fn drop_sent(&mut self, id: &str, base: &Value) -> Option<LocalChange> {
        let dropped = self.sent.remove(id)?;
        if let Some(head) = self.queued.get_mut(id).and_then(VecDeque::front_mut) {
            if head.op == ChangeOp::Modify {
                head.diff = Some(self.diff.object_diff(base, &head.target));
            }
        }
        Some(dropped)
    }

    /// Re-emits every in-flight change.
    pub fn resend_sent_changes(&self) -> Vec<QueueSignal> {
        self.sent.values().cloned().map(QueueSignal::Send).collect()
    }
}
