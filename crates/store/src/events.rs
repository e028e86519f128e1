//! Store change notifications.
//!
//! Each committed write that mutated something produces exactly one
//! `StoreChange`, broadcast after commit while the writer lock is still
//! held, so observers receive changes in commit order. Every subscriber has
//! its own unbounded channel; receivers that have been dropped are pruned
//! on the next broadcast.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use parking_lot::Mutex;

use crate::record::RecordKey;

/// Net effect of one committed write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreChange {
    /// Revision produced by the write (monotonic per process).
    pub revision: u64,
    pub inserted: Vec<RecordKey>,
    pub updated: Vec<RecordKey>,
    pub deleted: Vec<RecordKey>,
}

impl StoreChange {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    /// Whether any key in this change belongs to `collection`.
    pub fn touches(&self, collection: &str) -> bool {
        self.inserted
            .iter()
            .chain(&self.updated)
            .chain(&self.deleted)
            .any(|key| key.collection == collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// Accumulates intents during a transaction and folds them into a net
/// change: insert+update is an insert, insert+delete cancels out,
/// delete+insert is an update.
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    entries: BTreeMap<RecordKey, ChangeKind>,
}

impl ChangeSet {
    pub(crate) fn record_insert(&mut self, key: RecordKey) {
        let next = match self.entries.get(&key) {
            Some(ChangeKind::Deleted) => ChangeKind::Updated,
            Some(kind) => *kind,
            None => ChangeKind::Inserted,
        };
        self.entries.insert(key, next);
    }

    pub(crate) fn record_update(&mut self, key: RecordKey) {
        if !self.entries.contains_key(&key) {
            self.entries.insert(key, ChangeKind::Updated);
        }
    }

    pub(crate) fn record_delete(&mut self, key: RecordKey) {
        match self.entries.get(&key) {
            Some(ChangeKind::Inserted) => {
                self.entries.remove(&key);
            }
            _ => {
                self.entries.insert(key, ChangeKind::Deleted);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_change(self, revision: u64) -> StoreChange {
        let mut change = StoreChange { revision, ..StoreChange::default() };
        for (key, kind) in self.entries {
            match kind {
                ChangeKind::Inserted => change.inserted.push(key),
                ChangeKind::Updated => change.updated.push(key),
                ChangeKind::Deleted => change.deleted.push(key),
            }
        }
        change
    }
}

/// Registry of change observers for one store.
#[derive(Default)]
pub(crate) struct ChangeRegistry {
    senders: Mutex<Vec<(u64, Sender<StoreChange>)>>,
    next_id: AtomicU64,
}

impl ChangeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self) -> ChangeSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.senders.lock().push((id, tx));
        ChangeSubscription { id, rx }
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.senders.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    pub(crate) fn broadcast(&self, change: &StoreChange) {
        let mut senders = self.senders.lock();
        senders.retain(|(id, tx)| {
            let delivered = tx.send(change.clone()).is_ok();
            if !delivered {
                log::debug!("Pruning disconnected change subscriber {}", id);
            }
            delivered
        });
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}

/// Receiving end of a change subscription.
pub struct ChangeSubscription {
    id: u64,
    rx: Receiver<StoreChange>,
}

impl ChangeSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// All pending changes, oldest first. Never blocks.
    pub fn drain(&self) -> Vec<StoreChange> {
        self.rx.try_iter().collect()
    }

    /// Wait for the next change.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StoreChange> {
        match self.rx.recv_timeout(timeout) {
            Ok(change) => Some(change),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}
