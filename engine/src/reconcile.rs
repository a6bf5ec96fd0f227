//! Reconciliation of local writes, push outcomes and remote changes.
//!
//! The [`Replica`] is the single writer of the local store. Everything that
//! mutates state goes through it, and every mutation returns the
//! [`RecordChange`]s it produced so callers can publish them in order.
//!
//! # Rules
//!
//! 1. A local write is validated, takes the next local revision, is applied
//!    to the store and folded into the key's single pending operation
//! 2. At most one push per key is in flight; writes made meanwhile stay
//!    queued in the same pending operation
//! 3. `Acknowledged` stamps the record with the remote revision and drops the
//!    operation, unless newer writes are queued behind it
//! 4. `Rejected` and an exhausted retry budget roll the record back to its
//!    last confirmed state and surface a [`FailedOperation`]
//! 5. `Unreachable` schedules a retry with exponential backoff
//! 6. Remote changes for keys with a pending operation are deferred until
//!    the operation resolves; otherwise the higher remote revision wins

use crate::{
    error::Result, BackoffPolicy, ChangeOrigin, CollectionName, CursorTable, Error,
    FailedOperation, FailureReason, Fields, InFlight, LocalRevision, LocalStore, NodeId, OpKind,
    OperationId, Origin, PendingOperation, PushOutcome, Query, Record, RecordChange, RecordKey,
    RemoteChange, RemoteChangeKind, RemoteRevision, RevisionCounter, Schema, SyncCursor,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of retries before an unreachable push fails.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

type SlotKey = (CollectionName, RecordKey);

/// A write requested by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalWrite {
    /// Create a record; fails if an active record exists
    Create(Fields),
    /// Replace the fields of an existing record
    Update(Fields),
    /// Create or replace
    Put(Fields),
    /// Soft-delete an existing record
    Delete,
}

impl LocalWrite {
    fn fields(&self) -> Option<&Fields> {
        match self {
            LocalWrite::Create(fields) | LocalWrite::Update(fields) | LocalWrite::Put(fields) => {
                Some(fields)
            }
            LocalWrite::Delete => None,
        }
    }

    fn into_fields(self) -> Option<Fields> {
        match self {
            LocalWrite::Create(fields) | LocalWrite::Update(fields) | LocalWrite::Put(fields) => {
                Some(fields)
            }
            LocalWrite::Delete => None,
        }
    }

    /// Whether the write ignores whatever currently occupies the slot.
    fn replaces_slot(&self) -> bool {
        matches!(self, LocalWrite::Create(_) | LocalWrite::Put(_))
    }
}

/// Result of applying a local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    /// Local revision assigned to the write
    pub local_revision: LocalRevision,
    /// Pending operation now carrying the write, `None` if the write
    /// cancelled a never-pushed record
    pub op_id: Option<OperationId>,
    /// Changes applied to the store
    pub changes: Vec<RecordChange>,
}

/// Result of offering a remote change to the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteApply {
    /// The change was applied
    Applied(Vec<RecordChange>),
    /// The local record already holds this or a newer remote revision
    Stale,
    /// A pending operation holds the key; the change waits until it resolves
    Deferred,
}

/// Result of resolving a push attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Changes applied to the store
    pub changes: Vec<RecordChange>,
    /// Terminal failure to surface, if any
    pub failure: Option<FailedOperation>,
    /// When the operation will be retried, if it was unreachable
    pub retry_at: Option<Timestamp>,
}

/// The local replica: store, pending queue, cursors and deferred events.
#[derive(Debug, Clone)]
pub struct Replica {
    schema: Schema,
    node_id: NodeId,
    revisions: RevisionCounter,
    store: LocalStore,
    pending: BTreeMap<SlotKey, PendingOperation>,
    deferred: BTreeMap<SlotKey, RemoteChange>,
    cursors: CursorTable,
    backoff: BackoffPolicy,
    max_retries: u32,
    next_seq: u64,
}

impl Replica {
    /// Create an empty replica.
    pub fn new(schema: Schema, node_id: impl Into<NodeId>) -> Self {
        Self {
            schema,
            node_id: node_id.into(),
            revisions: RevisionCounter::new(),
            store: LocalStore::new(),
            pending: BTreeMap::new(),
            deferred: BTreeMap::new(),
            cursors: CursorTable::new(),
            backoff: BackoffPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            next_seq: 0,
        }
    }

    /// Builder-style method to set the retry policy.
    pub fn with_retry_policy(mut self, backoff: BackoffPolicy, max_retries: u32) -> Self {
        self.backoff = backoff;
        self.max_retries = max_retries;
        self
    }

    pub(crate) fn restore(
        schema: Schema,
        node_id: NodeId,
        revisions: RevisionCounter,
        store: LocalStore,
        pending: Vec<PendingOperation>,
        deferred: Vec<RemoteChange>,
        cursors: CursorTable,
    ) -> Self {
        let mut replica = Self::new(schema, node_id);
        replica.revisions = revisions;
        replica.store = store;
        for mut op in pending {
            // A push that was in flight when the process stopped never reported
            // an outcome; send it again.
            op.in_flight = None;
            replica.pending.insert((op.collection.clone(), op.key.clone()), op);
        }
        for change in deferred {
            replica
                .deferred
                .insert((change.collection.clone(), change.key.clone()), change);
        }
        replica.cursors = cursors;
        replica
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Get the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get the local store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Last local revision handed out.
    pub fn revision(&self) -> LocalRevision {
        self.revisions.current
    }

    /// Get an active record.
    pub fn get(&self, collection: &str, key: &str) -> Result<Option<&Record>> {
        self.store.get(collection, key)
    }

    /// Query a collection.
    pub fn query(&self, collection: &str) -> Query<'_> {
        self.store.query(collection)
    }

    /// Pending operation for a key.
    pub fn pending(&self, collection: &str, key: &str) -> Option<&PendingOperation> {
        self.pending
            .get(&(collection.to_string(), key.to_string()))
    }

    /// All pending operations in collection and key order.
    pub fn pending_ops(&self) -> impl Iterator<Item = &PendingOperation> {
        self.pending.values()
    }

    /// Number of pending operations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deferred remote change for a key.
    pub fn deferred(&self, collection: &str, key: &str) -> Option<&RemoteChange> {
        self.deferred
            .get(&(collection.to_string(), key.to_string()))
    }

    /// All deferred remote changes.
    pub fn deferred_changes(&self) -> impl Iterator<Item = &RemoteChange> {
        self.deferred.values()
    }

    /// Number of deferred remote changes.
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Cursor for a collection.
    pub fn cursor(&self, collection: &str) -> Option<&SyncCursor> {
        self.cursors.get(collection)
    }

    /// All cursors.
    pub fn cursors(&self) -> &CursorTable {
        &self.cursors
    }

    /// Retry policy in use.
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Apply a local write and queue it for the remote store.
    pub fn write(
        &mut self,
        collection: &str,
        key: &str,
        write: LocalWrite,
        now: Timestamp,
    ) -> Result<WriteResult> {
        self.schema.validate_write(collection, write.fields())?;

        let existing = match self.store.get_including_deleted(collection, key) {
            Ok(found) => found.cloned(),
            Err(Error::StorageCorruption { .. }) if write.replaces_slot() => None,
            Err(err) => return Err(err),
        };

        match (&write, &existing) {
            (LocalWrite::Create(_), Some(record)) if record.is_active() => {
                return Err(Error::RecordAlreadyExists(key.to_string()));
            }
            (LocalWrite::Update(_) | LocalWrite::Delete, None) => {
                return Err(Error::RecordNotFound(key.to_string()));
            }
            (LocalWrite::Update(_) | LocalWrite::Delete, Some(record)) if record.deleted => {
                return Err(Error::OperationOnDeleted(key.to_string()));
            }
            _ => {}
        }

        let slot = (collection.to_string(), key.to_string());
        let revision = self.revisions.tick();
        let deleting = matches!(write, LocalWrite::Delete);
        let remote_has_record = existing.as_ref().is_some_and(Record::is_acknowledged);
        let in_flight = self.pending.get(&slot).is_some_and(|op| op.is_in_flight());

        if deleting && !remote_has_record && !in_flight {
            // The remote store never saw this record: forget it entirely.
            self.pending.remove(&slot);
            self.store.purge(collection, key);
            let mut changes = vec![self.change(ChangeOrigin::Local, &slot, None)];
            changes.extend(self.release_deferred(&slot, now));
            return Ok(WriteResult {
                local_revision: revision,
                op_id: None,
                changes,
            });
        }

        let base = existing.clone().filter(Record::is_acknowledged);
        let payload = write.into_fields();
        let record = match (existing, payload.clone()) {
            (Some(_), None) => self
                .store
                .delete(collection, key, revision, now, Origin::Local)?
                .clone(),
            (Some(mut record), Some(fields)) => {
                record.replace_fields(fields, revision, now, Origin::Local);
                self.store.put(record.clone());
                record
            }
            (None, fields) => {
                let record = Record::new(
                    collection,
                    key,
                    fields.unwrap_or_default(),
                    revision,
                    now,
                );
                self.store.put(record.clone());
                record
            }
        };

        let op_id = self.op_id(revision);
        let kind = OpKind::for_remote(remote_has_record, deleting);
        match self.pending.get_mut(&slot) {
            Some(op) => {
                op.op_id = op_id.clone();
                op.kind = kind;
                op.payload = payload;
                op.local_revision = revision;
            }
            None => {
                self.pending.insert(
                    slot.clone(),
                    PendingOperation {
                        op_id: op_id.clone(),
                        kind,
                        collection: collection.to_string(),
                        key: key.to_string(),
                        payload,
                        local_revision: revision,
                        enqueued_at: now,
                        retry_count: 0,
                        next_attempt_at: now,
                        in_flight: None,
                        base,
                    },
                );
            }
        }

        let changes = vec![self.change(ChangeOrigin::Local, &slot, Some(record))];
        Ok(WriteResult {
            local_revision: revision,
            op_id: Some(op_id),
            changes,
        })
    }

    /// Mark every ready operation as in flight and return the attempts to push.
    pub fn dispatch_ready(&mut self, now: Timestamp) -> Vec<PendingOperation> {
        let mut attempts = Vec::new();
        for op in self.pending.values_mut() {
            if !op.is_ready(now) {
                continue;
            }
            op.in_flight = Some(InFlight {
                op_id: op.op_id.clone(),
                kind: op.kind,
                local_revision: op.local_revision,
                payload: op.payload.clone(),
                started_at: now,
            });
            attempts.push(op.clone());
        }
        attempts
    }

    /// Earliest scheduled attempt among operations that are not in flight.
    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.pending
            .values()
            .filter(|op| !op.is_in_flight())
            .map(|op| op.next_attempt_at)
            .min()
    }

    /// Make every waiting operation ready now and refill its retry budget.
    /// Returns how many operations were rescheduled.
    pub fn retry_now(&mut self, now: Timestamp) -> usize {
        let mut rescheduled = 0;
        for op in self.pending.values_mut().filter(|op| !op.is_in_flight()) {
            op.next_attempt_at = now;
            op.retry_count = 0;
            rescheduled += 1;
        }
        rescheduled
    }

    /// Fold the outcome of a push attempt back into the replica.
    ///
    /// `jitter_sample` must be uniform in `[-1.0, 1.0]`; it is only used when
    /// the outcome is `Unreachable`.
    pub fn resolve(
        &mut self,
        attempt: &PendingOperation,
        outcome: PushOutcome,
        now: Timestamp,
        jitter_sample: f64,
    ) -> Result<Resolution> {
        let slot = (attempt.collection.clone(), attempt.key.clone());
        let sent = match self.pending.get(&slot).and_then(|op| op.in_flight.as_ref()) {
            Some(sent) if sent.op_id == attempt.op_id => sent.clone(),
            _ => return Err(Error::UnknownOperation(attempt.op_id.clone())),
        };

        let resolution = match outcome {
            PushOutcome::Acknowledged(revision) => self.acknowledge(&slot, &sent, revision, now),
            PushOutcome::Rejected(reason) => self.fail(&slot, FailureReason::Rejected(reason), now),
            PushOutcome::Unreachable => self.retry_later(&slot, now, jitter_sample),
        };
        Ok(resolution)
    }

    fn acknowledge(
        &mut self,
        slot: &SlotKey,
        sent: &InFlight,
        revision: RemoteRevision,
        now: Timestamp,
    ) -> Resolution {
        let Some(mut op) = self.pending.remove(slot) else {
            return Resolution::default();
        };
        op.in_flight = None;
        let superseded = op.local_revision != sent.local_revision;
        let current = self
            .store
            .get_including_deleted(&slot.0, &slot.1)
            .ok()
            .flatten()
            .cloned();
        let mut changes = Vec::new();

        if sent.kind == OpKind::Delete {
            if superseded {
                // Revived locally after the delete went out; the remote copy is gone.
                if let Some(mut record) = current {
                    record.remote_revision = None;
                    self.store.put(record.clone());
                    changes.push(self.change(ChangeOrigin::Acknowledged, slot, Some(record)));
                }
                op.base = None;
                op.kind = OpKind::for_remote(false, op.payload.is_none());
            } else {
                self.store.purge(&slot.0, &slot.1);
                changes.push(self.change(ChangeOrigin::Acknowledged, slot, None));
            }
        } else {
            if let Some(mut record) = current {
                record.remote_revision = Some(revision.clone());
                self.store.put(record.clone());
                if superseded {
                    let mut confirmed = record.clone();
                    confirmed.fields = sent.payload.clone().unwrap_or_default();
                    confirmed.deleted = false;
                    confirmed.local_revision = sent.local_revision;
                    op.base = Some(confirmed);
                }
                changes.push(self.change(ChangeOrigin::Acknowledged, slot, Some(record)));
            }
            op.kind = OpKind::for_remote(true, op.payload.is_none());
        }

        if superseded {
            op.retry_count = 0;
            op.next_attempt_at = now;
            self.pending.insert(slot.clone(), op);
        } else {
            changes.extend(self.release_deferred(slot, now));
        }

        Resolution {
            changes,
            failure: None,
            retry_at: None,
        }
    }

    fn fail(&mut self, slot: &SlotKey, reason: FailureReason, now: Timestamp) -> Resolution {
        let Some(operation) = self.pending.remove(slot) else {
            return Resolution::default();
        };

        let mut changes = Vec::new();
        match operation.base.clone() {
            Some(mut confirmed) => {
                confirmed.local_revision = self.revisions.tick();
                confirmed.metadata.touch(now, Origin::Remote);
                self.store.put(confirmed.clone());
                changes.push(self.change(ChangeOrigin::Rollback, slot, Some(confirmed)));
            }
            None => {
                if self.store.purge(&slot.0, &slot.1).is_some() {
                    changes.push(self.change(ChangeOrigin::Rollback, slot, None));
                }
            }
        }
        changes.extend(self.release_deferred(slot, now));

        Resolution {
            changes,
            failure: Some(FailedOperation {
                operation,
                reason,
                failed_at: now,
            }),
            retry_at: None,
        }
    }

    fn retry_later(&mut self, slot: &SlotKey, now: Timestamp, jitter_sample: f64) -> Resolution {
        let max_retries = self.max_retries;
        let backoff = self.backoff;
        let exhausted = match self.pending.get_mut(slot) {
            Some(op) => {
                op.in_flight = None;
                op.retry_count += 1;
                if op.retry_count > max_retries {
                    true
                } else {
                    op.next_attempt_at = backoff.next_attempt(now, op.retry_count, jitter_sample);
                    return Resolution {
                        changes: Vec::new(),
                        failure: None,
                        retry_at: Some(op.next_attempt_at),
                    };
                }
            }
            None => false,
        };

        if exhausted {
            self.fail(slot, FailureReason::RetriesExhausted, now)
        } else {
            Resolution::default()
        }
    }

    /// Offer a change received from a collection subscription.
    pub fn apply_remote(&mut self, change: RemoteChange, now: Timestamp) -> RemoteApply {
        self.cursors.advance(&change.collection, change.cursor.clone());

        let slot = (change.collection.clone(), change.key.clone());
        if self.pending.contains_key(&slot) {
            let newer = self
                .deferred
                .get(&slot)
                .map_or(true, |held| change.remote_revision > held.remote_revision);
            if newer {
                self.deferred.insert(slot, change);
            }
            return RemoteApply::Deferred;
        }

        self.apply_remote_now(change, now)
    }

    fn apply_remote_now(&mut self, change: RemoteChange, now: Timestamp) -> RemoteApply {
        let slot = (change.collection.clone(), change.key.clone());
        // A corrupt slot is replaced by the remote copy.
        let current = self
            .store
            .get_including_deleted(&slot.0, &slot.1)
            .ok()
            .flatten()
            .cloned();

        let already_seen = current
            .as_ref()
            .and_then(|record| record.remote_revision.as_ref())
            .is_some_and(|seen| *seen >= change.remote_revision);
        if already_seen {
            return RemoteApply::Stale;
        }

        match change.kind {
            RemoteChangeKind::Upsert(fields) => {
                let revision = self.revisions.tick();
                let record = match current {
                    Some(mut record) => {
                        record.replace_fields(fields, revision, now, Origin::Remote);
                        record.remote_revision = Some(change.remote_revision);
                        record
                    }
                    None => Record::from_remote(
                        change.collection,
                        change.key,
                        fields,
                        change.remote_revision,
                        revision,
                        now,
                    ),
                };
                self.store.put(record.clone());
                RemoteApply::Applied(vec![self.change(ChangeOrigin::Remote, &slot, Some(record))])
            }
            RemoteChangeKind::Removed => {
                let existed = current.is_some() || self.store.is_corrupt(&slot.0, &slot.1);
                if !existed {
                    return RemoteApply::Stale;
                }
                self.store.purge(&slot.0, &slot.1);
                RemoteApply::Applied(vec![self.change(ChangeOrigin::Remote, &slot, None)])
            }
        }
    }

    fn release_deferred(&mut self, slot: &SlotKey, now: Timestamp) -> Vec<RecordChange> {
        match self.deferred.remove(slot) {
            Some(change) => match self.apply_remote_now(change, now) {
                RemoteApply::Applied(changes) => changes,
                RemoteApply::Stale | RemoteApply::Deferred => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Current matching records as snapshot changes, sequenced after
    /// everything applied so far.
    pub fn snapshot_changes<F>(&mut self, predicate: F) -> Vec<RecordChange>
    where
        F: Fn(&Record) -> bool,
    {
        let records: Vec<Record> = self
            .store
            .records()
            .filter(|record| record.is_active() && predicate(record))
            .cloned()
            .collect();

        records
            .into_iter()
            .map(|record| {
                let slot = (record.collection.clone(), record.key.clone());
                self.change(ChangeOrigin::Snapshot, &slot, Some(record))
            })
            .collect()
    }

    fn change(
        &mut self,
        origin: ChangeOrigin,
        slot: &SlotKey,
        record: Option<Record>,
    ) -> RecordChange {
        self.next_seq += 1;
        RecordChange {
            seq: self.next_seq,
            collection: slot.0.clone(),
            key: slot.1.clone(),
            origin,
            record,
        }
    }

    fn op_id(&self, revision: LocalRevision) -> OperationId {
        format!("{}-{}", self.node_id, revision)
    }
}
