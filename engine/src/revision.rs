//! Local and remote revisions.
//!
//! Local revisions come from a single store-wide counter so they strictly
//! increase on every mutation. Remote revisions are opaque tokens issued by
//! the document store; they only need a total order that agrees with the
//! order the store issued them in.

use crate::LocalRevision;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Monotonic source of local revision numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionCounter {
    /// Last revision handed out (0 = none yet)
    pub current: LocalRevision,
}

impl RevisionCounter {
    /// Create a counter that has not handed out any revision.
    pub fn new() -> Self {
        Self { current: 0 }
    }

    /// Resume a counter from a persisted value.
    pub fn starting_at(current: LocalRevision) -> Self {
        Self { current }
    }

    /// Advance the counter and return the new revision.
    pub fn tick(&mut self) -> LocalRevision {
        self.current += 1;
        self.current
    }

    /// Make sure the counter is at least `seen`.
    /// Used when restoring records whose revisions outran the persisted counter.
    pub fn observe(&mut self, seen: LocalRevision) {
        self.current = self.current.max(seen);
    }
}

/// Opaque revision token issued by the remote store.
///
/// Ordering rules:
/// 1. Tokens are split into a prefix and a trailing run of digits
/// 2. Prefixes compare lexicographically
/// 3. With equal prefixes the digits compare numerically (`v9 < v10`)
/// 4. Remaining ties (leading zeros) fall back to the raw string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRevision(String);

impl RemoteRevision {
    /// Wrap a token received from the remote store.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(&self) -> (&str, &str) {
        let digits = self
            .0
            .bytes()
            .rev()
            .take_while(|b| b.is_ascii_digit())
            .count();
        self.0.split_at(self.0.len() - digits)
    }
}

fn numeric_key(digits: &str) -> (usize, &str) {
    let trimmed = digits.trim_start_matches('0');
    (trimmed.len(), trimmed)
}

impl Ord for RemoteRevision {
    fn cmp(&self, other: &Self) -> Ordering {
        let (prefix_a, digits_a) = self.split();
        let (prefix_b, digits_b) = other.split();

        prefix_a
            .cmp(prefix_b)
            .then_with(|| numeric_key(digits_a).cmp(&numeric_key(digits_b)))
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for RemoteRevision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RemoteRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteRevision {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}
