//! # Laguna Engine
//!
//! The deterministic core of the KameHouseLaguna offline-first sync layer.
//!
//! This crate holds every rule that decides what the on-device cache looks
//! like: how local writes are applied and queued, how push outcomes are
//! folded back in, and how changes coming from the remote document store are
//! merged. It performs no IO and reads no clocks; callers pass timestamps and
//! jitter samples in, so the same inputs always produce the same state.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Data lives in [`Record`]s, addressed by collection and key, with:
//! - a JSON object of fields (validated against the collection [`Schema`])
//! - a local revision, taken from a store-wide [`RevisionCounter`]
//! - a [`RemoteRevision`] token, set once the remote store confirms a write
//! - a soft delete flag (tombstone)
//!
//! ### Pending operations
//!
//! Every local write leaves exactly one [`PendingOperation`] per key. Later
//! writes to the same key supersede its payload instead of queueing a second
//! operation, and at most one push per key is in flight at a time.
//!
//! ### Replica
//!
//! The [`Replica`] is the single authority that ties the [`LocalStore`], the
//! pending queue, the per-collection [`SyncCursor`]s and the deferred remote
//! events together. Conflicts resolve by whole-record replacement: local state
//! wins until it is acknowledged, after that the remote revision decides.
//!
//! ## Quick Start
//!
//! ```rust
//! use laguna_engine::{
//!     CollectionSchema, FieldDef, FieldType, LocalWrite, PushOutcome, RemoteRevision,
//!     Replica, Schema,
//! };
//! use serde_json::json;
//!
//! let schema = Schema::new(1).with_collection(CollectionSchema::new(
//!     "figuras",
//!     vec![FieldDef::required("nombre", FieldType::String)],
//! ));
//! let mut replica = Replica::new(schema, "device-1");
//!
//! let fields = json!({"nombre": "Goku"}).as_object().cloned().unwrap();
//! let written = replica
//!     .write("figuras", "r1", LocalWrite::Create(fields), 1_000)
//!     .unwrap();
//! assert_eq!(written.local_revision, 1);
//!
//! let attempts = replica.dispatch_ready(1_000);
//! assert_eq!(attempts.len(), 1);
//!
//! let resolution = replica
//!     .resolve(&attempts[0], PushOutcome::Acknowledged(RemoteRevision::new("v7")), 1_050, 0.0)
//!     .unwrap();
//! assert!(resolution.failure.is_none());
//!
//! let record = replica.get("figuras", "r1").unwrap().unwrap();
//! assert_eq!(record.remote_revision, Some(RemoteRevision::new("v7")));
//! assert!(replica.pending("figuras", "r1").is_none());
//! ```
//!
//! ## Persistence
//!
//! Use [`Replica::export_snapshot`] and [`Replica::from_snapshot`] with
//! [`ReplicaSnapshot`]. Records are stored as individual JSON values, so a
//! record that no longer deserializes is isolated as a corrupt slot instead
//! of poisoning the whole snapshot.

pub mod backoff;
pub mod change;
pub mod cursor;
pub mod error;
pub mod feed;
pub mod operation;
pub mod reconcile;
pub mod record;
pub mod revision;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use backoff::BackoffPolicy;
pub use change::{RemoteChange, RemoteChangeKind};
pub use cursor::{CursorTable, SyncCursor};
pub use error::Error;
pub use feed::{ChangeBuffer, ChangeOrigin, RecordChange};
pub use operation::{
    FailedOperation, FailureReason, InFlight, OpKind, OperationId, PendingOperation, PushOutcome,
};
pub use reconcile::{LocalWrite, RemoteApply, Replica, Resolution, WriteResult};
pub use record::{Fields, Metadata, Origin, Record};
pub use revision::{RemoteRevision, RevisionCounter};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use snapshot::{ReplicaSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use store::{CorruptEntry, Direction, LocalStore, Query};

/// Type aliases for clarity
pub type RecordKey = String;
pub type CollectionName = String;
pub type NodeId = String;
pub type LocalRevision = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
