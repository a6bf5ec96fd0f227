//! In-process remote document store.
//!
//! Behaves like the hosted document database the app talks to: documents
//! addressed by collection and key, a revision issued per committed write,
//! and an ordered change log that subscriptions replay from a cursor before
//! switching to live delivery. Switches let callers take it offline, deny
//! writes or subscriptions for a collection, or hold pushes in flight.

use super::{ChangeStream, GatewayError, RemoteGateway};
use crate::session::Session;
use async_trait::async_trait;
use futures::StreamExt;
use laguna_engine::{
    CollectionName, Fields, OpKind, OperationId, PendingOperation, PushOutcome, RecordKey,
    RemoteChange, RemoteRevision, Schema, SyncCursor,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

const LIVE_CAPACITY: usize = 1024;

/// A document as stored remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub fields: Fields,
    pub revision: RemoteRevision,
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    change: RemoteChange,
}

#[derive(Debug)]
struct RemoteState {
    documents: HashMap<(CollectionName, RecordKey), RemoteDocument>,
    log: Vec<LogEntry>,
    next_revision: u64,
    applied: HashMap<OperationId, RemoteRevision>,
    denied: HashMap<CollectionName, String>,
    unreadable: HashMap<CollectionName, String>,
    pushes: usize,
}

impl RemoteState {
    /// Commit a write and append it to the change log.
    fn commit(&mut self, collection: &str, key: &str, fields: Option<Fields>) -> LogEntry {
        let seq = self.next_revision;
        self.next_revision += 1;

        let revision = RemoteRevision::new(format!("v{}", seq));
        let cursor = SyncCursor::new(seq.to_string());
        let slot = (collection.to_string(), key.to_string());

        let change = match fields {
            Some(fields) => {
                self.documents.insert(
                    slot,
                    RemoteDocument {
                        fields: fields.clone(),
                        revision: revision.clone(),
                    },
                );
                RemoteChange::upsert(collection, key, fields, revision, cursor)
            }
            None => {
                self.documents.remove(&slot);
                RemoteChange::removed(collection, key, revision, cursor)
            }
        };

        let entry = LogEntry { seq, change };
        self.log.push(entry.clone());
        entry
    }
}

/// In-process implementation of [`RemoteGateway`].
#[derive(Debug)]
pub struct MemoryGateway {
    session: Session,
    schema: Option<Schema>,
    state: Mutex<RemoteState>,
    live: broadcast::Sender<LogEntry>,
    online: watch::Sender<bool>,
    held: watch::Sender<bool>,
}

impl MemoryGateway {
    /// Create an empty, online store for a session.
    pub fn new(session: Session) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let (online, _) = watch::channel(true);
        let (held, _) = watch::channel(false);
        Self {
            session,
            schema: None,
            state: Mutex::new(RemoteState {
                documents: HashMap::new(),
                log: Vec::new(),
                next_revision: 1,
                applied: HashMap::new(),
                denied: HashMap::new(),
                unreadable: HashMap::new(),
                pushes: 0,
            }),
            live,
            online,
            held,
        }
    }

    /// Builder-style method to reject pushes that fail schema validation.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Builder-style method to set the number of the next issued revision.
    pub fn with_next_revision(self, next: u64) -> Self {
        self.lock().next_revision = next;
        self
    }

    /// Session the store was opened with.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Connect or disconnect. Going offline ends every open subscription.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
        tracing::debug!(online, "Memory gateway connectivity changed");
    }

    /// Whether the store is reachable.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Reject every push to `collection` with `reason`.
    pub fn deny_writes(&self, collection: impl Into<CollectionName>, reason: impl Into<String>) {
        self.lock().denied.insert(collection.into(), reason.into());
    }

    /// Lift a write denial.
    pub fn allow_writes(&self, collection: &str) {
        self.lock().denied.remove(collection);
    }

    /// Refuse subscriptions to `collection` with `reason`.
    pub fn deny_subscriptions(
        &self,
        collection: impl Into<CollectionName>,
        reason: impl Into<String>,
    ) {
        self.lock()
            .unreadable
            .insert(collection.into(), reason.into());
    }

    /// Lift a subscription denial.
    pub fn allow_subscriptions(&self, collection: &str) {
        self.lock().unreadable.remove(collection);
    }

    /// Keep pushes waiting until [`release_pushes`](Self::release_pushes).
    pub fn hold_pushes(&self) {
        self.held.send_replace(true);
    }

    /// Let held pushes proceed.
    pub fn release_pushes(&self) {
        self.held.send_replace(false);
    }

    /// Write a document as another device would. Works while offline;
    /// subscribers see it once they reconnect.
    pub fn inject_remote(
        &self,
        collection: &str,
        key: &str,
        fields: Option<Fields>,
    ) -> RemoteRevision {
        let mut state = self.lock();
        let entry = state.commit(collection, key, fields);
        let revision = entry.change.remote_revision.clone();
        let _ = self.live.send(entry);
        revision
    }

    /// Current remote copy of a document.
    pub fn document(&self, collection: &str, key: &str) -> Option<RemoteDocument> {
        self.lock()
            .documents
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of pushes that reached the store.
    pub fn push_count(&self) -> usize {
        self.lock().pushes
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait_for_release(&self) {
        let mut held = self.held.subscribe();
        while *held.borrow_and_update() {
            if held.changed().await.is_err() {
                break;
            }
        }
    }

    fn commit_push(&self, operation: &PendingOperation) -> PushOutcome {
        let mut state = self.lock();
        state.pushes += 1;

        if let Some(revision) = state.applied.get(&operation.op_id) {
            return PushOutcome::Acknowledged(revision.clone());
        }
        if let Some(reason) = state.denied.get(&operation.collection) {
            return PushOutcome::Rejected(reason.clone());
        }

        let collection = operation.collection.as_str();
        let key = operation.key.as_str();
        let fields = match (operation.kind, &operation.payload) {
            (OpKind::Delete, _) => None,
            (_, None) => return PushOutcome::Rejected("missing payload".into()),
            (kind, Some(fields)) => {
                if let Some(schema) = &self.schema {
                    if let Err(err) = schema.validate_write(collection, Some(fields)) {
                        return PushOutcome::Rejected(err.to_string());
                    }
                }
                let exists = state
                    .documents
                    .contains_key(&(collection.to_string(), key.to_string()));
                if kind == OpKind::Update && !exists {
                    return PushOutcome::Rejected(format!(
                        "document not found: {}/{}",
                        collection, key
                    ));
                }
                Some(fields.clone())
            }
        };

        let entry = state.commit(collection, key, fields);
        let revision = entry.change.remote_revision.clone();
        state
            .applied
            .insert(operation.op_id.clone(), revision.clone());
        let _ = self.live.send(entry);
        PushOutcome::Acknowledged(revision)
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn push(&self, operation: &PendingOperation) -> PushOutcome {
        self.wait_for_release().await;

        if !self.is_online() {
            return PushOutcome::Unreachable;
        }
        if !self.session.is_active() {
            return PushOutcome::Rejected("not signed in".into());
        }

        let outcome = self.commit_push(operation);
        tracing::debug!(
            op_id = %operation.op_id,
            kind = %operation.kind,
            key = %operation.key,
            ?outcome,
            "Memory gateway handled push"
        );
        outcome
    }

    async fn subscribe(
        &self,
        collection: &str,
        since: Option<SyncCursor>,
    ) -> Result<ChangeStream, GatewayError> {
        if !self.is_online() {
            return Err(GatewayError::Unreachable("offline".into()));
        }
        if !self.session.is_active() {
            return Err(GatewayError::Denied("not signed in".into()));
        }
        if let Some(reason) = self.lock().unreadable.get(collection) {
            return Err(GatewayError::Denied(reason.clone()));
        }

        let after = since
            .as_ref()
            .and_then(|cursor| cursor.as_str().parse::<u64>().ok())
            .unwrap_or(0);

        // Take the backlog and the live receiver under one lock so no commit
        // falls between them.
        let (backlog, live) = {
            let state = self.lock();
            let backlog: VecDeque<LogEntry> = state
                .log
                .iter()
                .filter(|entry| entry.seq > after && entry.change.collection == collection)
                .cloned()
                .collect();
            (backlog, self.live.subscribe())
        };

        let subscription = Subscription {
            collection: collection.to_string(),
            last_seq: backlog.back().map_or(after, |entry| entry.seq),
            backlog,
            live,
            online: self.online.subscribe(),
        };
        Ok(futures::stream::unfold(subscription, next_change).boxed())
    }
}

struct Subscription {
    collection: CollectionName,
    last_seq: u64,
    backlog: VecDeque<LogEntry>,
    live: broadcast::Receiver<LogEntry>,
    online: watch::Receiver<bool>,
}

async fn next_change(mut sub: Subscription) -> Option<(RemoteChange, Subscription)> {
    if let Some(entry) = sub.backlog.pop_front() {
        return Some((entry.change, sub));
    }

    loop {
        if !*sub.online.borrow_and_update() {
            return None;
        }

        // Disconnects win over live entries committed in the same instant.
        tokio::select! {
            biased;

            changed = sub.online.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            received = sub.live.recv() => match received {
                Ok(_) if !*sub.online.borrow() => return None,
                Ok(entry) if entry.change.collection == sub.collection && entry.seq > sub.last_seq => {
                    sub.last_seq = entry.seq;
                    return Some((entry.change, sub));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        collection = %sub.collection,
                        skipped,
                        "Subscription lagged; ending stream"
                    );
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            },
        }
    }
}
