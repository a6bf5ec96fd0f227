//! Change events produced by the remote store.

use crate::{CollectionName, Fields, RecordKey, RemoteRevision, SyncCursor};
use serde::{Deserialize, Serialize};

/// What happened to a remote document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "fields", rename_all = "lowercase")]
pub enum RemoteChangeKind {
    /// The document was created or replaced
    Upsert(Fields),
    /// The document was removed
    Removed,
}

/// One event from a collection subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    /// Collection the document belongs to
    pub collection: CollectionName,
    /// Document key
    pub key: RecordKey,
    /// Revision the remote store assigned to this change
    pub remote_revision: RemoteRevision,
    /// Watermark to resume the subscription after this event
    pub cursor: SyncCursor,
    /// The change itself
    pub kind: RemoteChangeKind,
}

impl RemoteChange {
    /// Build an upsert event.
    pub fn upsert(
        collection: impl Into<CollectionName>,
        key: impl Into<RecordKey>,
        fields: Fields,
        remote_revision: RemoteRevision,
        cursor: SyncCursor,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            remote_revision,
            cursor,
            kind: RemoteChangeKind::Upsert(fields),
        }
    }

    /// Build a removal event.
    pub fn removed(
        collection: impl Into<CollectionName>,
        key: impl Into<RecordKey>,
        remote_revision: RemoteRevision,
        cursor: SyncCursor,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            remote_revision,
            cursor,
            kind: RemoteChangeKind::Removed,
        }
    }

    /// Whether this event removes the document.
    pub fn is_removal(&self) -> bool {
        matches!(self.kind, RemoteChangeKind::Removed)
    }
}
