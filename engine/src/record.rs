//! Record types for storing data.

use crate::{CollectionName, LocalRevision, RecordKey, RemoteRevision, Timestamp};
use serde::{Deserialize, Serialize};

/// Field name to value mapping held by a record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Origin of the last change to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Written on this device
    Local,
    /// Received from the remote store
    Remote,
}

/// Metadata associated with a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the record was first stored (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last changed (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Whether the last change came from this device or the remote store
    pub origin: Origin,
}

impl Metadata {
    fn new(timestamp: Timestamp, origin: Origin) -> Self {
        Self {
            created_at: timestamp,
            updated_at: timestamp,
            origin,
        }
    }

    /// Update metadata for a modification.
    pub fn touch(&mut self, timestamp: Timestamp, origin: Origin) {
        self.updated_at = timestamp;
        self.origin = origin;
    }
}

/// A data record in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Collection this record belongs to
    pub collection: CollectionName,
    /// Stable key within the collection
    pub key: RecordKey,
    /// Field values (whole-record replacement on every write)
    pub fields: Fields,
    /// Local revision of the last mutation
    pub local_revision: LocalRevision,
    /// Revision confirmed by the remote store, `None` until acknowledged
    pub remote_revision: Option<RemoteRevision>,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// Record metadata
    pub metadata: Metadata,
}

impl Record {
    /// Create a record from a local write.
    pub fn new(
        collection: impl Into<CollectionName>,
        key: impl Into<RecordKey>,
        fields: Fields,
        local_revision: LocalRevision,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            fields,
            local_revision,
            remote_revision: None,
            deleted: false,
            metadata: Metadata::new(timestamp, Origin::Local),
        }
    }

    /// Create a record received from the remote store.
    pub fn from_remote(
        collection: impl Into<CollectionName>,
        key: impl Into<RecordKey>,
        fields: Fields,
        remote_revision: RemoteRevision,
        local_revision: LocalRevision,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            fields,
            local_revision,
            remote_revision: Some(remote_revision),
            deleted: false,
            metadata: Metadata::new(timestamp, Origin::Remote),
        }
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Whether the remote store is known to hold a version of this record.
    pub fn is_acknowledged(&self) -> bool {
        self.remote_revision.is_some()
    }

    /// Look up a single field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Replace all fields, reviving the record if it was a tombstone.
    pub fn replace_fields(
        &mut self,
        fields: Fields,
        local_revision: LocalRevision,
        timestamp: Timestamp,
        origin: Origin,
    ) {
        self.fields = fields;
        self.deleted = false;
        self.local_revision = local_revision;
        self.metadata.touch(timestamp, origin);
    }

    /// Mark record as deleted (tombstone). Fields are kept for rollback views.
    pub fn mark_deleted(
        &mut self,
        local_revision: LocalRevision,
        timestamp: Timestamp,
        origin: Origin,
    ) {
        self.deleted = true;
        self.local_revision = local_revision;
        self.metadata.touch(timestamp, origin);
    }
}
