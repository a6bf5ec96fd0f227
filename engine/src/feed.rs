//! Change notifications and the per-observer coalescing buffer.
//!
//! Every mutation applied to the local store produces a [`RecordChange`] with
//! a sequence number taken in apply order. Observers read changes through a
//! [`ChangeBuffer`]: if a newer change for a key arrives before the previous
//! one was delivered, the stale one is dropped and the newer one queues behind
//! everything applied before it.

use crate::{CollectionName, Record, RecordKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Why a record changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// A local write
    Local,
    /// A change received from the remote store
    Remote,
    /// The remote store confirmed a local write
    Acknowledged,
    /// A failed operation was rolled back to the last confirmed state
    Rollback,
    /// Initial state delivered when an observer starts
    Snapshot,
}

/// Notification for one applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    /// Apply-order sequence number
    pub seq: u64,
    /// Collection of the changed record
    pub collection: CollectionName,
    /// Key of the changed record
    pub key: RecordKey,
    /// What caused the change
    pub origin: ChangeOrigin,
    /// The record after the change, `None` if it was purged
    pub record: Option<Record>,
}

impl RecordChange {
    /// Whether the record no longer exists locally.
    pub fn is_purge(&self) -> bool {
        self.record.is_none()
    }
}

/// Coalescing FIFO of undelivered changes.
#[derive(Debug, Default)]
pub struct ChangeBuffer {
    queue: BTreeMap<u64, RecordChange>,
    index: HashMap<(CollectionName, RecordKey), u64>,
}

impl ChangeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a change. Returns `true` if it replaced an undelivered change
    /// for the same key.
    pub fn push(&mut self, change: RecordChange) -> bool {
        let slot = (change.collection.clone(), change.key.clone());
        let coalesced = match self.index.insert(slot, change.seq) {
            Some(previous) => self.queue.remove(&previous).is_some(),
            None => false,
        };
        self.queue.insert(change.seq, change);
        coalesced
    }

    /// Take the oldest undelivered change.
    pub fn pop(&mut self) -> Option<RecordChange> {
        let (_, change) = self.queue.pop_first()?;
        let slot = (change.collection.clone(), change.key.clone());
        if self.index.get(&slot) == Some(&change.seq) {
            self.index.remove(&slot);
        }
        Some(change)
    }

    /// Number of undelivered changes.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
