// src/correlation.rs

//! Correlation identifiers linking a dispatched action to its responses

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque token echoed on every inbound event related to one dispatch.
///
/// The prefix embedded in generated IDs is for log readability; nothing
/// parses it back out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generates IDs of the form `{prefix}-{millis}-{sequence}-{hex}`.
///
/// `millis` never decreases even if the wall clock steps back, and the
/// sequence makes two IDs from the same millisecond distinct.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    last_millis: AtomicI64,
    sequence: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        Self {
            last_millis: AtomicI64::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next(&self, prefix: &str) -> CorrelationId {
        let now = Utc::now().timestamp_millis();
        let previous = self.last_millis.fetch_max(now, Ordering::SeqCst);
        let millis = previous.max(now);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let suffix: u32 = rand::thread_rng().gen();

        let prefix = if prefix.trim().is_empty() { "op" } else { prefix };
        CorrelationId(format!("{}-{}-{}-{:08x}", prefix, millis, sequence, suffix))
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide generator behind [`new_correlation_id`]
static GENERATOR: CorrelationIdGenerator = CorrelationIdGenerator {
    last_millis: AtomicI64::new(0),
    sequence: AtomicU64::new(0),
};

pub fn new_correlation_id(prefix: &str) -> CorrelationId {
    GENERATOR.next(prefix)
}
