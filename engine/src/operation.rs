//! Pending operations and push outcomes.
//!
//! Local writes are not sent as individual mutations. Each key owns at most
//! one [`PendingOperation`] holding the newest desired state; further writes
//! supersede its payload. While a push is in flight the operation remembers
//! what was sent in [`InFlight`], so the outcome can be matched and any newer
//! state stays queued behind it.

use crate::{
    CollectionName, Fields, LocalRevision, Record, RecordKey, RemoteRevision, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Unique identifier for a push attempt payload.
pub type OperationId = String;

/// The kind of change a pending operation asks the remote store to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    /// Kind to push given whether the remote store holds the record and
    /// whether the latest local write deletes it.
    pub fn for_remote(remote_has_record: bool, deleting: bool) -> Self {
        match (deleting, remote_has_record) {
            (true, _) => OpKind::Delete,
            (false, true) => OpKind::Update,
            (false, false) => OpKind::Create,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Create => write!(f, "create"),
            OpKind::Update => write!(f, "update"),
            OpKind::Delete => write!(f, "delete"),
        }
    }
}

/// A push attempt that has been handed to the remote gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlight {
    /// Operation ID that was sent
    pub op_id: OperationId,
    /// Kind that was sent
    pub kind: OpKind,
    /// Local revision the sent payload represents
    pub local_revision: LocalRevision,
    /// Payload that was sent (`None` for deletes)
    pub payload: Option<Fields>,
    /// When the attempt started
    pub started_at: Timestamp,
}

/// A queued local mutation awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Operation ID of the current payload
    pub op_id: OperationId,
    /// Kind to push
    pub kind: OpKind,
    /// Target collection
    pub collection: CollectionName,
    /// Target record key
    pub key: RecordKey,
    /// Snapshot of the record fields to push (`None` for deletes)
    pub payload: Option<Fields>,
    /// Local revision of the newest write folded into this operation
    pub local_revision: LocalRevision,
    /// When the first write of this operation was enqueued
    pub enqueued_at: Timestamp,
    /// Failed attempts since the payload was last confirmed
    pub retry_count: u32,
    /// Earliest time the next attempt may start
    pub next_attempt_at: Timestamp,
    /// Attempt currently awaiting an outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<InFlight>,
    /// Last confirmed state of the record, restored if the operation fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Record>,
}

impl PendingOperation {
    /// Whether a push for this operation is awaiting an outcome.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether the operation may be dispatched at `now`.
    pub fn is_ready(&self, now: Timestamp) -> bool {
        self.in_flight.is_none() && self.next_attempt_at <= now
    }

    /// Whether newer writes arrived after the in-flight attempt was sent.
    pub fn is_superseded_in_flight(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|attempt| attempt.local_revision != self.local_revision)
    }
}

/// Outcome of pushing an operation to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "camelCase")]
pub enum PushOutcome {
    /// The remote store applied the write and issued a revision
    Acknowledged(RemoteRevision),
    /// The remote store refused the write; not retryable
    Rejected(String),
    /// The remote store could not be reached; retry with backoff
    Unreachable,
}

/// Why an operation reached a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "reason", rename_all = "camelCase")]
pub enum FailureReason {
    /// The remote store rejected the write
    Rejected(String),
    /// The retry budget ran out while the remote was unreachable
    RetriesExhausted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Rejected(reason) => write!(f, "rejected: {}", reason),
            FailureReason::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}

/// A pending operation that failed terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedOperation {
    /// The operation as it stood when it failed
    pub operation: PendingOperation,
    /// Why it failed
    pub reason: FailureReason,
    /// When it failed
    pub failed_at: Timestamp,
}
