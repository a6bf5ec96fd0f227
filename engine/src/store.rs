//! Local store - durable keyed record storage.
//!
//! The store holds every record the device knows about, grouped by
//! collection. A slot is either an intact [`Record`] or a [`CorruptEntry`]
//! kept from a snapshot that could not be decoded; corrupt slots surface as
//! [`Error::StorageCorruption`] on every read that touches them.
//!
//! The store itself applies no sync rules. Revisions and pending operations
//! are assigned by the [`Replica`](crate::Replica), which is the only writer.

use crate::{
    error::Result, CollectionName, Error, LocalRevision, Origin, Record, RecordKey, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A persisted record that could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorruptEntry {
    /// Collection the entry was stored under
    pub collection: CollectionName,
    /// Key the entry was stored under
    pub key: RecordKey,
    /// The raw persisted value, kept so it is not lost on the next save
    pub raw: serde_json::Value,
    /// Decoder error
    pub reason: String,
}

impl CorruptEntry {
    /// The error reported for reads of this entry.
    pub fn to_error(&self) -> Error {
        Error::StorageCorruption {
            collection: self.collection.clone(),
            key: self.key.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Intact(Record),
    Corrupt(CorruptEntry),
}

impl Slot {
    fn record(&self) -> Result<&Record> {
        match self {
            Slot::Intact(record) => Ok(record),
            Slot::Corrupt(entry) => Err(entry.to_error()),
        }
    }
}

/// A collection of record slots ordered by key.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    slots: BTreeMap<RecordKey, Slot>,
}

impl Collection {
    /// Number of active (non-deleted) records.
    pub fn len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Intact(r) if r.is_active()))
            .count()
    }

    /// Check if collection has no active records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sort direction for [`Query::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ascending,
    Descending,
}

/// The on-device record store.
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    collections: BTreeMap<CollectionName, Collection>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an active record. Tombstones read as absent.
    pub fn get(&self, collection: &str, key: &str) -> Result<Option<&Record>> {
        Ok(self
            .get_including_deleted(collection, key)?
            .filter(|record| record.is_active()))
    }

    /// Get a record including tombstones.
    pub fn get_including_deleted(&self, collection: &str, key: &str) -> Result<Option<&Record>> {
        match self.slot(collection, key) {
            Some(slot) => slot.record().map(Some),
            None => Ok(None),
        }
    }

    /// Whether the slot for a key holds a corrupt entry.
    pub fn is_corrupt(&self, collection: &str, key: &str) -> bool {
        matches!(self.slot(collection, key), Some(Slot::Corrupt(_)))
    }

    /// Query a collection. Unknown collections yield an empty query.
    pub fn query(&self, collection: &str) -> Query<'_> {
        Query::new(self.collections.get(collection))
    }

    /// Store a record, replacing whatever occupied its slot (including a
    /// corrupt entry). Returns the previous intact record.
    pub fn put(&mut self, record: Record) -> Option<Record> {
        let previous = self
            .collections
            .entry(record.collection.clone())
            .or_default()
            .slots
            .insert(record.key.clone(), Slot::Intact(record));
        match previous {
            Some(Slot::Intact(record)) => Some(record),
            _ => None,
        }
    }

    /// Soft-delete a record, leaving a tombstone until the remote confirms
    /// the removal. Returns the tombstone.
    pub fn delete(
        &mut self,
        collection: &str,
        key: &str,
        local_revision: LocalRevision,
        timestamp: Timestamp,
        origin: Origin,
    ) -> Result<&Record> {
        let slot = self
            .collections
            .get_mut(collection)
            .and_then(|c| c.slots.get_mut(key))
            .ok_or_else(|| Error::RecordNotFound(key.to_string()))?;

        match slot {
            Slot::Corrupt(entry) => Err(entry.to_error()),
            Slot::Intact(record) if record.deleted => {
                Err(Error::OperationOnDeleted(key.to_string()))
            }
            Slot::Intact(record) => {
                record.mark_deleted(local_revision, timestamp, origin);
                Ok(record)
            }
        }
    }

    /// Remove a slot entirely. Returns the removed record if it was intact.
    pub fn purge(&mut self, collection: &str, key: &str) -> Option<Record> {
        let removed = self.collections.get_mut(collection)?.slots.remove(key);
        match removed {
            Some(Slot::Intact(record)) => Some(record),
            _ => None,
        }
    }

    /// Keep an undecodable entry so it is reported instead of dropped.
    pub fn insert_corrupt(&mut self, entry: CorruptEntry) {
        self.collections
            .entry(entry.collection.clone())
            .or_default()
            .slots
            .insert(entry.key.clone(), Slot::Corrupt(entry));
    }

    /// All corrupt entries, in collection and key order.
    pub fn corrupted(&self) -> impl Iterator<Item = &CorruptEntry> {
        self.collections.values().flat_map(|c| {
            c.slots.values().filter_map(|slot| match slot {
                Slot::Corrupt(entry) => Some(entry),
                Slot::Intact(_) => None,
            })
        })
    }

    /// All intact records including tombstones, in collection and key order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.collections.values().flat_map(|c| {
            c.slots.values().filter_map(|slot| match slot {
                Slot::Intact(record) => Some(record),
                Slot::Corrupt(_) => None,
            })
        })
    }

    /// Get a collection by name.
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    /// Names of collections holding at least one slot.
    pub fn collection_names(&self) -> impl Iterator<Item = &CollectionName> {
        self.collections.keys()
    }

    /// Number of slots across all collections, tombstones and corrupt entries included.
    pub fn slot_count(&self) -> usize {
        self.collections.values().map(|c| c.slots.len()).sum()
    }

    fn slot(&self, collection: &str, key: &str) -> Option<&Slot> {
        self.collections.get(collection)?.slots.get(key)
    }
}

type Predicate<'a> = Box<dyn Fn(&Record) -> bool + 'a>;

/// A restartable query over one collection.
///
/// Nothing is read until [`Query::iter`] is called, and `iter` can be called
/// any number of times. Corrupt slots are yielded as errors; with
/// [`Query::order_by`] they come first, followed by the sorted records.
pub struct Query<'a> {
    collection: Option<&'a Collection>,
    include_deleted: bool,
    predicates: Vec<Predicate<'a>>,
    order: Option<(String, Direction)>,
    limit: Option<usize>,
}

impl std::fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("include_deleted", &self.include_deleted)
            .field("predicates", &self.predicates.len())
            .field("order", &self.order)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<'a> Query<'a> {
    fn new(collection: Option<&'a Collection>) -> Self {
        Self {
            collection,
            include_deleted: false,
            predicates: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Include tombstones in results.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Keep only records matching the predicate. Filters combine with AND.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + 'a,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    /// Sort by a field value. Missing fields sort as null, before any value.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order = Some((field.into(), direction));
        self
    }

    /// Yield at most `n` records.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn matches(&self, record: &Record) -> bool {
        (self.include_deleted || record.is_active()) && self.predicates.iter().all(|p| p(record))
    }

    /// Iterate over the results.
    pub fn iter(&self) -> Box<dyn Iterator<Item = Result<&'a Record>> + '_> {
        Box::new(self.slots().map(|slot| slot.map_err(CorruptEntry::to_error)))
    }

    /// Matching slots. The limit bounds records only; every corrupt slot is
    /// yielded whether or not the limit was reached.
    fn slots(
        &self,
    ) -> Box<dyn Iterator<Item = std::result::Result<&'a Record, &'a CorruptEntry>> + '_> {
        let slots = match self.collection {
            Some(collection) => collection.slots.values(),
            None => return Box::new(std::iter::empty()),
        };
        let limit = self.limit.unwrap_or(usize::MAX);

        let Some((field, direction)) = &self.order else {
            let mut taken = 0;
            let lazy = slots.filter_map(move |slot| match slot {
                Slot::Corrupt(entry) => Some(Err(entry)),
                Slot::Intact(record) if taken < limit && self.matches(record) => {
                    taken += 1;
                    Some(Ok(record))
                }
                Slot::Intact(_) => None,
            });
            return Box::new(lazy);
        };

        let mut corrupt = Vec::new();
        let mut records = Vec::new();
        for slot in slots {
            match slot {
                Slot::Corrupt(entry) => corrupt.push(Err(entry)),
                Slot::Intact(record) if self.matches(record) => records.push(record),
                Slot::Intact(_) => {}
            }
        }
        records.sort_by(|a, b| {
            let ordering = compare_values(a.field(field), b.field(field));
            match direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            }
        });

        Box::new(
            corrupt
                .into_iter()
                .chain(records.into_iter().take(limit).map(Ok)),
        )
    }

    /// Collect all matching records, failing on the first corrupt slot.
    ///
    /// Use [`Query::partition`] to read around corrupt slots.
    pub fn all(&self) -> Result<Vec<&'a Record>> {
        self.iter().collect()
    }

    /// Split the results into intact records and corrupt slots.
    pub fn partition(&self) -> (Vec<&'a Record>, Vec<&'a CorruptEntry>) {
        let mut records = Vec::new();
        let mut corrupt = Vec::new();
        for slot in self.slots() {
            match slot {
                Ok(record) => records.push(record),
                Err(entry) => corrupt.push(entry),
            }
        }
        (records, corrupt)
    }

    /// Get the first matching record.
    pub fn first(&self) -> Result<Option<&'a Record>> {
        self.iter().next().transpose()
    }

    /// Count matching records, ignoring corrupt slots.
    pub fn count(&self) -> usize {
        self.iter().filter(|r| r.is_ok()).count()
    }
}

fn value_rank(value: Option<&serde_json::Value>) -> u8 {
    match value {
        None | Some(serde_json::Value::Null) => 0,
        Some(serde_json::Value::Bool(_)) => 1,
        Some(serde_json::Value::Number(_)) => 2,
        Some(serde_json::Value::String(_)) => 3,
        Some(serde_json::Value::Array(_)) => 4,
        Some(serde_json::Value::Object(_)) => 5,
    }
}

/// Total order over optional JSON values used for sorting query results.
fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => x.len().cmp(&y.len()),
        (Some(Value::Object(x)), Some(Value::Object(y))) => x.len().cmp(&y.len()),
        _ => value_rank(a).cmp(&value_rank(b)),
    }
}
