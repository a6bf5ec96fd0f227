//! Remote document store boundary.
//!
//! The [`RemoteGateway`] trait is all the runtime knows about the cloud
//! backend: push one pending operation, or subscribe to a collection's change
//! stream from a cursor. [`MemoryGateway`] implements it in-process.

mod memory;

pub use memory::{MemoryGateway, RemoteDocument};

use async_trait::async_trait;
use futures::stream::BoxStream;
use laguna_engine::{PendingOperation, PushOutcome, RemoteChange, SyncCursor};

/// Errors opening a subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The remote store could not be reached; retry with backoff
    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    /// The remote store refused the subscription
    #[error("subscription denied: {0}")]
    Denied(String),
}

impl GatewayError {
    /// Whether retrying later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unreachable(_))
    }
}

/// Stream of remote changes for one collection. Dropping it cancels the
/// subscription.
pub type ChangeStream = BoxStream<'static, RemoteChange>;

/// Access to the remote document store.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Push the operation's current payload.
    ///
    /// `Unreachable` is retryable; `Rejected` is terminal for the operation.
    async fn push(&self, operation: &PendingOperation) -> PushOutcome;

    /// Subscribe to changes of a collection made after `since`, or to the
    /// full collection when `since` is `None`.
    ///
    /// The stream ends when the connection drops; callers resubscribe from
    /// their latest cursor.
    async fn subscribe(
        &self,
        collection: &str,
        since: Option<SyncCursor>,
    ) -> Result<ChangeStream, GatewayError>;
}
