//! Call identifiers and the record of calls that have ended.

use chrono::Utc;
use log::debug;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

const RANDOM_SUFFIX_LEN: usize = 12;

/// Opaque call identifier, generated by the calling side and echoed in every
/// message of that call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Millisecond timestamp prefix plus a random alphanumeric suffix.
    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LEN)
            .map(char::from)
            .collect();
        Self(format!("{:x}-{}", Utc::now().timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Hands out call identifiers and remembers which ones have terminated.
///
/// The terminated set is append-only for the lifetime of the process.
#[derive(Debug, Default)]
pub struct CallIdentityTracker {
    terminated: HashSet<CallId>,
}

impl CallIdentityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh identifier that has never been marked terminated.
    pub fn new_id(&self) -> CallId {
        loop {
            let id = CallId::generate();
            if !self.terminated.contains(&id) {
                return id;
            }
        }
    }

    pub fn mark_terminated(&mut self, id: &CallId) {
        if self.terminated.insert(id.clone()) {
            debug!(target: "Calls/Identity", "Call {id} marked terminated");
        }
    }

    pub fn is_terminated(&self, id: &CallId) -> bool {
        self.terminated.contains(id)
    }

    pub fn terminated_count(&self) -> usize {
        self.terminated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);

        let (prefix, suffix) = a.as_str().split_once('-').unwrap();
        assert!(i64::from_str_radix(prefix, 16).is_ok());
        assert_eq!(suffix.len(), RANDOM_SUFFIX_LEN);
    }

    #[test]
    fn terminated_set_is_append_only() {
        let mut tracker = CallIdentityTracker::new();
        let id = tracker.new_id();
        assert!(!tracker.is_terminated(&id));

        tracker.mark_terminated(&id);
        tracker.mark_terminated(&id);
        assert!(tracker.is_terminated(&id));
        assert_eq!(tracker.terminated_count(), 1);

        let next = tracker.new_id();
        assert_ne!(next, id);
        assert!(!tracker.is_terminated(&next));
    }
}
