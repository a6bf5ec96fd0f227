//! Snapshot types for persisting and restoring replica state.
//!
//! A snapshot carries everything needed to resume after a restart: records,
//! the pending queue, sync cursors, deferred remote events and the revision
//! counter. Records are kept as raw JSON values so each one decodes on its
//! own; a record that fails to decode becomes a corrupt slot instead of
//! failing the whole load.

use crate::{
    error::Result, CollectionName, CorruptEntry, CursorTable, Error, LocalStore, NodeId,
    PendingOperation, Record, RecordKey, RemoteChange, Replica, RevisionCounter, Schema,
    SchemaVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the replica.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Node ID of the replica
    pub node_id: NodeId,
    /// Revision counter state
    pub revision: RevisionCounter,
    /// Raw records organized by collection, then by key
    pub collections: BTreeMap<CollectionName, BTreeMap<RecordKey, serde_json::Value>>,
    /// Pending operations not yet confirmed
    #[serde(default)]
    pub pending: Vec<PendingOperation>,
    /// Sync cursor per collection
    #[serde(default)]
    pub cursors: CursorTable,
    /// Remote changes held back by pending operations
    #[serde(default)]
    pub deferred: Vec<RemoteChange>,
}

impl ReplicaSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion, node_id: impl Into<NodeId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            node_id: node_id.into(),
            revision: RevisionCounter::new(),
            collections: BTreeMap::new(),
            pending: Vec::new(),
            cursors: CursorTable::new(),
            deferred: Vec::new(),
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: &Record) -> Result<()> {
        let value =
            serde_json::to_value(record).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        self.collections
            .entry(record.collection.clone())
            .or_default()
            .insert(record.key.clone(), value);
        Ok(())
    }

    /// Count stored entries across all collections.
    pub fn record_count(&self) -> usize {
        self.collections.values().map(|c| c.len()).sum()
    }

    /// Validate the snapshot against a schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }

        for collection_name in self.collections.keys() {
            if !schema.collections.contains_key(collection_name) {
                return Err(Error::CollectionNotFound(collection_name.clone()));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }

    /// Decode the stored records into a local store.
    pub fn decode_store(&self) -> LocalStore {
        let mut store = LocalStore::new();
        for (collection, entries) in &self.collections {
            for (key, raw) in entries {
                match decode_record(collection, key, raw) {
                    Ok(record) => {
                        store.put(record);
                    }
                    Err(reason) => store.insert_corrupt(CorruptEntry {
                        collection: collection.clone(),
                        key: key.clone(),
                        raw: raw.clone(),
                        reason,
                    }),
                }
            }
        }
        store
    }
}

fn decode_record(
    collection: &str,
    key: &str,
    raw: &serde_json::Value,
) -> std::result::Result<Record, String> {
    let record: Record = serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
    if record.collection != collection || record.key != key {
        return Err(format!(
            "stored under {}/{} but names {}/{}",
            collection, key, record.collection, record.key
        ));
    }
    Ok(record)
}

impl Replica {
    /// Capture the full replica state.
    pub fn export_snapshot(&self) -> Result<ReplicaSnapshot> {
        let mut snapshot = ReplicaSnapshot::new(self.schema().version, self.node_id().clone());
        snapshot.revision = RevisionCounter::starting_at(self.revision());

        for record in self.store().records() {
            snapshot.add_record(record)?;
        }
        for entry in self.store().corrupted() {
            snapshot
                .collections
                .entry(entry.collection.clone())
                .or_default()
                .insert(entry.key.clone(), entry.raw.clone());
        }

        snapshot.pending = self.pending_ops().cloned().collect();
        snapshot.cursors = self.cursors().clone();
        snapshot.deferred = self.deferred_changes().cloned().collect();
        Ok(snapshot)
    }

    /// Rebuild a replica from a snapshot.
    ///
    /// The node ID is taken from the snapshot. Pushes that were in flight are
    /// made ready again; their outcome was never recorded.
    pub fn from_snapshot(schema: Schema, snapshot: ReplicaSnapshot) -> Result<Self> {
        snapshot.validate(&schema)?;

        let store = snapshot.decode_store();
        let mut revisions = snapshot.revision.clone();
        for record in store.records() {
            revisions.observe(record.local_revision);
        }
        for op in &snapshot.pending {
            revisions.observe(op.local_revision);
        }

        Ok(Replica::restore(
            schema,
            snapshot.node_id,
            revisions,
            store,
            snapshot.pending,
            snapshot.deferred,
            snapshot.cursors,
        ))
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version
    pub schema_version: SchemaVersion,
    /// Node ID
    pub node_id: NodeId,
    /// Last local revision handed out
    pub revision: u64,
    /// Total stored entry count
    pub record_count: usize,
    /// Pending operation count
    pub pending_count: usize,
    /// Deferred remote change count
    pub deferred_count: usize,
}

impl From<&ReplicaSnapshot> for SnapshotMetadata {
    fn from(snapshot: &ReplicaSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            schema_version: snapshot.schema_version,
            node_id: snapshot.node_id.clone(),
            revision: snapshot.revision.current,
            record_count: snapshot.record_count(),
            pending_count: snapshot.pending.len(),
            deferred_count: snapshot.deferred.len(),
        }
    }
}
