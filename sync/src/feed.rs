//! Change feed dispatcher.
//!
//! Tracks active observers and hands every applied change to the ones whose
//! predicate matches. Each observer reads from its own coalescing
//! [`ChangeBuffer`], so a slow reader only ever sees the latest undelivered
//! state of a key and never holds up the apply path.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::task::AtomicWaker;
use futures::Stream;
use laguna_engine::{ChangeBuffer, RecordChange};

/// Predicate selecting the changes an observer receives.
pub type ChangePredicate = Arc<dyn Fn(&RecordChange) -> bool + Send + Sync>;

/// State shared between the dispatcher and one observer.
#[derive(Debug, Default)]
struct Mailbox {
    buffer: Mutex<ChangeBuffer>,
    waker: AtomicWaker,
    closed: AtomicBool,
}

impl Mailbox {
    fn buffer(&self) -> MutexGuard<'_, ChangeBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// A registered observer.
struct Registration {
    predicate: ChangePredicate,
    mailbox: Arc<Mailbox>,
}

/// Manages active observers.
///
/// Thread-safe and shared between the sync engine and its observers via `Arc`.
#[derive(Default)]
pub struct ChangeFeed {
    observers: DashMap<String, Registration>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("observers", &self.observers.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ChangeFeed {
    /// Create a new change feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new change feed wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register an observer for changes matching `predicate`.
    pub fn observe<F>(self: &Arc<Self>, predicate: F) -> Observer
    where
        F: Fn(&RecordChange) -> bool + Send + Sync + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let mailbox = Arc::new(Mailbox::default());
        if self.closed.load(Ordering::Acquire) {
            mailbox.close();
        }

        self.observers.insert(
            id.clone(),
            Registration {
                predicate: Arc::new(predicate),
                mailbox: mailbox.clone(),
            },
        );

        tracing::debug!(observer_id = %id, "Observer registered");

        Observer {
            id,
            feed: self.clone(),
            mailbox,
        }
    }

    /// Unregister an observer.
    pub fn unregister(&self, observer_id: &str) {
        if let Some((_, registration)) = self.observers.remove(observer_id) {
            registration.mailbox.close();
            tracing::debug!(observer_id = %observer_id, "Observer unregistered");
        }
    }

    /// Deliver changes, in order, to every matching observer.
    ///
    /// Returns the number of (observer, change) deliveries queued.
    pub fn publish(&self, changes: &[RecordChange]) -> usize {
        if changes.is_empty() {
            return 0;
        }

        let mut queued = 0;
        let mut coalesced = 0;

        for entry in self.observers.iter() {
            let registration = entry.value();
            let mut delivered = false;
            {
                let mut buffer = registration.mailbox.buffer();
                for change in changes {
                    if !(registration.predicate)(change) {
                        continue;
                    }
                    if buffer.push(change.clone()) {
                        coalesced += 1;
                    }
                    queued += 1;
                    delivered = true;
                }
            }
            if delivered {
                registration.mailbox.waker.wake();
            }
        }

        tracing::trace!(
            changes = changes.len(),
            queued,
            coalesced,
            observers = self.observers.len(),
            "Published changes"
        );

        queued
    }

    /// End every observer stream once its buffer drains, and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for entry in self.observers.iter() {
            entry.value().mailbox.close();
        }
    }

    /// Get the number of active observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

/// A live view of applied changes.
///
/// Implements [`Stream`]; the stream ends after [`cancel`](Observer::cancel)
/// or when the feed closes. Dropping the observer unregisters it.
pub struct Observer {
    id: String,
    feed: Arc<ChangeFeed>,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("buffered", &self.buffered())
            .finish()
    }
}

impl Observer {
    /// Observer ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of changes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.mailbox.buffer().len()
    }

    /// Stop receiving changes. Already buffered changes are discarded.
    pub fn cancel(&self) {
        self.feed.unregister(&self.id);
        let mut buffer = self.mailbox.buffer();
        while buffer.pop().is_some() {}
    }

    /// Queue changes for this observer only, ahead of anything published later.
    pub(crate) fn prime(&self, changes: Vec<RecordChange>) {
        let mut buffer = self.mailbox.buffer();
        for change in changes {
            buffer.push(change);
        }
    }
}

impl Stream for Observer {
    type Item = RecordChange;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mailbox = &self.mailbox;

        if let Some(change) = mailbox.buffer().pop() {
            return Poll::Ready(Some(change));
        }

        mailbox.waker.register(cx.waker());

        // Re-check after registering so a publish in between is not missed.
        if let Some(change) = mailbox.buffer().pop() {
            return Poll::Ready(Some(change));
        }
        if mailbox.closed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.feed.unregister(&self.id);
    }
}
