//! Per-collection sync cursors.
//!
//! A cursor is the watermark of the last remote change observed for a
//! collection. Subscriptions resume from it after a restart instead of
//! re-fetching the whole collection.

use crate::CollectionName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque watermark issued by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    /// Wrap a watermark received from the remote store.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw watermark.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cursors for every collection that has seen a remote change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorTable {
    cursors: BTreeMap<CollectionName, SyncCursor>,
}

impl CursorTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor for a collection, `None` if nothing has been observed yet.
    pub fn get(&self, collection: &str) -> Option<&SyncCursor> {
        self.cursors.get(collection)
    }

    /// Record the watermark of the latest observed change.
    ///
    /// Events arrive in order per collection, so the newest event always wins.
    pub fn advance(&mut self, collection: &str, cursor: SyncCursor) {
        self.cursors.insert(collection.to_string(), cursor);
    }

    /// Iterate over all cursors in collection order.
    pub fn iter(&self) -> impl Iterator<Item = (&CollectionName, &SyncCursor)> {
        self.cursors.iter()
    }

    /// Number of collections with a cursor.
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    /// Whether no cursor has been recorded.
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_replaces_previous() {
        let mut table = CursorTable::new();
        assert!(table.get("figuras").is_none());

        table.advance("figuras", SyncCursor::new("c1"));
        table.advance("figuras", SyncCursor::new("c2"));
        table.advance("usuarios", SyncCursor::new("u9"));

        assert_eq!(table.get("figuras"), Some(&SyncCursor::new("c2")));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn serializes_as_plain_map() {
        let mut table = CursorTable::new();
        table.advance("figuras", SyncCursor::new("c2"));

        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"figuras":"c2"}"#);

        let parsed: CursorTable = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, table);
    }
}
