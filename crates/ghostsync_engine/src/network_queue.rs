//! Per-key serialization of inbound work.
//!
//! Tasks for one key run strictly in arrival order: a task handed out by
//! [`NetworkQueue::add`] or [`NetworkQueue::complete`] owns its key until it
//! is completed. A task may suspend (for example while a missing version is
//! fetched); nothing else for that key runs in the meantime. Different keys
//! are independent.

use std::collections::{HashMap, VecDeque};

/// FIFO of tasks waiting behind the running task for one key.
#[derive(Debug)]
pub struct KeyQueue<T> {
    pending: VecDeque<T>,
}

impl<T> KeyQueue<T> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Number of tasks waiting behind the running one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Registry of per-key queues, created on demand and torn down when drained.
#[derive(Debug)]
pub struct NetworkQueue<T> {
    queues: HashMap<String, KeyQueue<T>>,
}

impl<T> Default for NetworkQueue<T> {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }
}

impl<T> NetworkQueue<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task for `key`.
    ///
    /// Returns the task back when the key was idle: the caller must run it
    /// now and call [`NetworkQueue::complete`] when done. Otherwise the task
    /// waits its turn and `None` is returned.
    pub fn add(&mut self, key: &str, task: T) -> Option<T> {
        match self.queues.get_mut(key) {
            Some(queue) => {
                queue.pending.push_back(task);
                None
            }
            None => {
                self.queues.insert(key.to_string(), KeyQueue::new());
                Some(task)
            }
        }
    }

    /// Marks the running task for `key` as finished.
    ///
    /// Returns the next task to run, or `None` after tearing the key's queue
    /// down.
    pub fn complete(&mut self, key: &str) -> Option<T> {
        let queue = self.queues.get_mut(key)?;
        match queue.pending.pop_front() {
            Some(next) => Some(next),
            None => {
                self.queues.remove(key);
                None
            }
        }
    }

    /// Drops every task for `key`, returning how many were waiting.
    pub fn discard(&mut self, key: &str) -> usize {
        self.queues.remove(key).map_or(0, |queue| queue.len())
    }

    /// Returns true while a task for `key` is running.
    pub fn is_busy(&self, key: &str) -> bool {
        self.queues.contains_key(key)
    }

    /// Returns the waiting tasks for `key`.
    pub fn queue(&self, key: &str) -> Option<&KeyQueue<T>> {
        self.queues.get(key)
    }

    /// Number of keys with a running task.
    pub fn active_keys(&self) -> usize {
        self.queues.len()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
