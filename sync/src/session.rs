//! Signed-in user session.
//!
//! A [`Session`] is created by [`Session::sign_in`] and torn down by
//! [`Session::sign_out`]. Gateways are built from a session, and a running
//! sync engine shuts itself down once its session closes.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

struct SessionInner {
    user_id: String,
    node_id: String,
    token: String,
    closed: watch::Sender<bool>,
}

/// Handle to the current user session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session for an authenticated user on this device.
    pub fn sign_in(
        user_id: impl Into<String>,
        node_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let session = Self {
            inner: Arc::new(SessionInner {
                user_id: user_id.into(),
                node_id: node_id.into(),
                token: token.into(),
                closed,
            }),
        };
        tracing::info!(
            user_id = %session.inner.user_id,
            node_id = %session.inner.node_id,
            "Session opened"
        );
        session
    }

    /// Open a session with a freshly generated device node ID.
    pub fn sign_in_new_device(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        let node_id = uuid::Uuid::new_v4().to_string();
        Self::sign_in(user_id, node_id, token)
    }

    /// Close the session. Idempotent.
    pub fn sign_out(&self) {
        let was_open = !self.inner.closed.send_replace(true);
        if was_open {
            tracing::info!(user_id = %self.inner.user_id, "Session closed");
        }
    }

    /// Authenticated user ID.
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Device node ID.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Credentials token presented to the remote store.
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Whether the session is still open.
    pub fn is_active(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        while !*closed.borrow_and_update() {
            // The sender lives in `inner`, which `self` keeps alive.
            if closed.changed().await.is_err() {
                break;
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.inner.user_id)
            .field("node_id", &self.inner.node_id)
            .field("token", &"<redacted>")
            .field("active", &self.is_active())
            .finish()
    }
}
