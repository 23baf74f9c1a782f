//! In-memory expiry store with a simulated background expiry sweep

use super::ExpiryStore;
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Store operation, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    OldestTimestamp,
    CountOlderThan,
    SetExpireAfter,
    AnyOlderThan,
}

/// An [`ExpiryStore`] that keeps TTL field values in memory.
///
/// Each document is represented only by its TTL field value; `None` stands
/// for a document where the field is missing or not a datetime. The
/// simulated sweep runs when [`ExpiryStore::any_older_than`] is polled and
/// removes documents older than the wall clock minus the current
/// expire-after value, after lagging for a configurable number of polls
/// following each threshold change.
pub struct MemoryStore {
    collection: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    docs: Vec<Option<DateTime<Utc>>>,
    expire_after: Option<i64>,
    applied: Vec<i64>,
    sweep_lag: u32,
    polls_until_sweep: u32,
    polls: u64,
    fail_on: Option<Operation>,
}

impl MemoryStore {
    /// Create an empty store for `collection`.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Add documents with the given TTL field values.
    pub fn with_documents(self, timestamps: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
        self.state
            .lock()
            .docs
            .extend(timestamps.into_iter().map(Some));
        self
    }

    /// Number of polls the sweep waits after each threshold change.
    pub fn with_sweep_lag(self, polls: u32) -> Self {
        self.state.lock().sweep_lag = polls;
        self
    }

    /// Make every call to `operation` fail with a database error.
    pub fn fail_on(self, operation: Operation) -> Self {
        self.state.lock().fail_on = Some(operation);
        self
    }

    /// Insert one document.
    pub fn insert(&self, timestamp: DateTime<Utc>) {
        self.state.lock().docs.push(Some(timestamp));
    }

    /// Insert one document that lacks the TTL field.
    pub fn insert_without_field(&self) {
        self.state.lock().docs.push(None);
    }

    /// Every threshold applied so far, in seconds, oldest first.
    pub fn applied_thresholds(&self) -> Vec<i64> {
        self.state.lock().applied.clone()
    }

    /// The current expire-after value, if one was ever set.
    pub fn expire_after(&self) -> Option<i64> {
        self.state.lock().expire_after
    }

    /// Remaining TTL field values, oldest first.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        let mut ts: Vec<_> = self.state.lock().docs.iter().flatten().copied().collect();
        ts.sort();
        ts
    }

    /// Number of remaining documents.
    pub fn len(&self) -> usize {
        self.state.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of existence checks made so far.
    pub fn polls(&self) -> u64 {
        self.state.lock().polls
    }

    fn check(&self, state: &State, operation: Operation) -> Result<()> {
        if state.fail_on == Some(operation) {
            return Err(MigrationError::Database(format!(
                "injected failure on {:?} for collection '{}'",
                operation, self.collection
            )));
        }
        Ok(())
    }
}

impl State {
    fn sweep(&mut self, now: DateTime<Utc>) {
        let Some(seconds) = self.expire_after else {
            return;
        };
        if self.polls_until_sweep > 0 {
            self.polls_until_sweep -= 1;
            return;
        }
        let cutoff = now - Duration::seconds(seconds);
        self.docs.retain(|ts| match ts {
            Some(ts) => *ts >= cutoff,
            None => true,
        });
    }
}

#[async_trait]
impl ExpiryStore for MemoryStore {
    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn oldest_timestamp(&self, field: &str) -> Result<DateTime<Utc>> {
        let state = self.state.lock();
        self.check(&state, Operation::OldestTimestamp)?;

        if state.docs.is_empty() {
            return Err(MigrationError::EmptyCollection {
                collection: self.collection.clone(),
            });
        }
        // Missing values sort before every datetime.
        match state.docs.iter().min().copied().flatten() {
            Some(ts) => Ok(ts),
            None => Err(MigrationError::InvalidTtlField {
                collection: self.collection.clone(),
                field: field.to_string(),
            }),
        }
    }

    async fn count_older_than(&self, _field: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let state = self.state.lock();
        self.check(&state, Operation::CountOlderThan)?;

        Ok(state
            .docs
            .iter()
            .flatten()
            .filter(|ts| **ts < cutoff)
            .count() as u64)
    }

    async fn set_expire_after(&self, _field: &str, seconds: i64) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, Operation::SetExpireAfter)?;

        state.expire_after = Some(seconds);
        state.applied.push(seconds);
        state.polls_until_sweep = state.sweep_lag;
        Ok(())
    }

    async fn any_older_than(&self, _field: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();
        self.check(&state, Operation::AnyOlderThan)?;

        state.polls += 1;
        state.sweep(Utc::now());
        Ok(state.docs.iter().flatten().any(|ts| *ts < cutoff))
    }
}
