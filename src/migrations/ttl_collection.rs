//! TTL collection migration - gradually lowers a collection's TTL index
//!
//! Lowering a TTL index from months to hours in one step makes every
//! document in between eligible for deletion at once, and the resulting
//! delete burst can starve the cluster of I/O. This job walks the threshold
//! down instead: each step picks the largest TTL that exposes at least a
//! batch's worth of documents (or the goal, whichever comes first), applies
//! it, and waits for the server's expiry monitor to finish deleting before
//! taking the next step.

use super::{ensure_not_cancelled, Migration};
use crate::config::{parse_duration, MigrationOptions};
use crate::db::Database;
use crate::error::{MigrationError, Result, ResultExt};
use crate::store::ExpiryStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const NAME: &str = "ttlCollection";

/// How often to check whether the expiry monitor has caught up.
pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

pub const GOAL_TTL_ENV_VAR: &str = "GOAL_TTL";
pub const TTL_DECREMENT_ENV_VAR: &str = "TTL_DECREMENT";
pub const TTL_FIELD_ENV_VAR: &str = "TTL_FIELD";

/// Reduction plan for one collection's TTL index.
#[derive(Debug, Clone)]
pub struct TtlCollection {
    database: String,
    collection: String,
    batch_size: u64,
    goal_ttl: Duration,
    ttl_decrement: Duration,
    ttl_field: String,
    poll_interval: std::time::Duration,
}

/// Registry constructor for [`TtlCollection`].
pub fn factory(opts: &MigrationOptions) -> Result<Box<dyn Migration>> {
    Ok(Box::new(TtlCollection::new(opts)?))
}

impl TtlCollection {
    /// Validate `opts` and build the plan.
    ///
    /// Reads `GOAL_TTL`, `TTL_DECREMENT` and `TTL_FIELD` from the options'
    /// environment. Every problem is collected into one
    /// [`MigrationError::InvalidOptions`].
    pub fn new(opts: &MigrationOptions) -> Result<Self> {
        let mut problems = opts.validate();
        let collection = opts.require_collection(&mut problems);

        let goal_ttl = parse_duration_var(opts, GOAL_TTL_ENV_VAR, "goal TTL", &mut problems);
        if goal_ttl.is_some_and(|goal| goal < Duration::zero()) {
            problems.push("goal TTL must not be negative".to_string());
        }
        if goal_ttl.is_some_and(|goal| goal != Duration::seconds(goal.num_seconds())) {
            problems.push("goal TTL must be a whole number of seconds".to_string());
        }

        let ttl_decrement =
            parse_duration_var(opts, TTL_DECREMENT_ENV_VAR, "TTL decrement", &mut problems);
        if ttl_decrement.is_some_and(|dec| dec <= Duration::zero()) {
            problems.push("TTL decrement must be positive".to_string());
        }

        let ttl_field = opts
            .require_env(TTL_FIELD_ENV_VAR, &mut problems)
            .unwrap_or_default()
            .to_string();
        if ttl_field.is_empty() && opts.env.var(TTL_FIELD_ENV_VAR).is_some() {
            problems.push("TTL field name is empty".to_string());
        }

        MigrationOptions::resolve(problems)?;

        Ok(Self {
            database: opts.database.clone(),
            collection,
            batch_size: opts.batch_size_or_default(),
            goal_ttl: goal_ttl.unwrap_or_else(Duration::zero),
            ttl_decrement: ttl_decrement.unwrap_or_else(Duration::zero),
            ttl_field,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override how often the wait phase polls for remaining documents.
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn goal_ttl(&self) -> Duration {
        self.goal_ttl
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Lower the TTL step by step until the goal has been applied and honoured.
    ///
    /// Each iteration captures `now` once; the TTL search and the wait
    /// cutoff are both evaluated against it.
    pub async fn run(&self, store: &dyn ExpiryStore, cancel: &CancellationToken) -> Result<()> {
        info!(
            database = %self.database,
            collection = %self.collection,
            field = %self.ttl_field,
            goal_ttl_secs = self.goal_ttl.num_seconds(),
            decrement_secs = self.ttl_decrement.num_seconds(),
            batch_size = self.batch_size,
            "Starting TTL reduction"
        );

        let mut last_applied: Option<Duration> = None;
        loop {
            ensure_not_cancelled(cancel)?;

            let now = Utc::now();

            let mut next_ttl = self.next_ttl(store, now, cancel).await.with_context(|| {
                format!("getting next TTL for collection '{}'", self.collection)
            })?;
            // The applied TTL never increases between steps.
            if let Some(last) = last_applied {
                if next_ttl > last {
                    debug!(
                        computed_secs = next_ttl.num_seconds(),
                        previous_secs = last.num_seconds(),
                        "Holding TTL at previous step"
                    );
                    next_ttl = last;
                }
            }

            let seconds = next_ttl.num_seconds();
            info!(
                collection = %self.collection,
                ttl_secs = seconds,
                cutoff = %(now - next_ttl).format("%Y-%m-%d %H:%M:%S"),
                "Applying TTL"
            );

            ensure_not_cancelled(cancel)?;
            store
                .set_expire_after(&self.ttl_field, seconds)
                .await
                .with_context(|| {
                    format!(
                        "setting TTL of {}s on field '{}' of collection '{}'",
                        seconds, self.ttl_field, self.collection
                    )
                })?;
            last_applied = Some(next_ttl);

            self.wait_for_ttl(store, now, next_ttl, cancel)
                .await
                .with_context(|| {
                    format!(
                        "waiting for TTL job on collection '{}' at {}s",
                        self.collection, seconds
                    )
                })?;

            if next_ttl == self.goal_ttl {
                info!(
                    collection = %self.collection,
                    ttl_secs = seconds,
                    "TTL reduction reached goal"
                );
                return Ok(());
            }
        }
    }

    /// Largest TTL at or below the oldest document's age that exposes at
    /// least `batch_size` documents, clamped to the goal.
    ///
    /// `cancel` is checked before every count query.
    pub async fn next_ttl(
        &self,
        store: &dyn ExpiryStore,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        let oldest = store
            .oldest_timestamp(&self.ttl_field)
            .await
            .context("getting oldest document")?;
        let mut ttl = now - oldest;

        loop {
            ensure_not_cancelled(cancel)?;
            let count = store
                .count_older_than(&self.ttl_field, now - ttl)
                .await
                .with_context(|| format!("getting document count at TTL {}s", ttl.num_seconds()))?;
            if count >= self.batch_size || ttl <= self.goal_ttl {
                break;
            }
            debug!(
                ttl_secs = ttl.num_seconds(),
                count = count,
                "Batch not yet full, lowering TTL"
            );
            ttl = ttl - self.ttl_decrement;
        }

        Ok(ttl.max(self.goal_ttl))
    }

    /// Block until no document is older than `now - ttl`.
    ///
    /// Polls every `poll_interval` with no deadline. Only confirmed absence,
    /// a query error or cancellation ends the wait.
    pub async fn wait_for_ttl(
        &self,
        store: &dyn ExpiryStore,
        now: DateTime<Utc>,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cutoff = now - ttl;
        loop {
            let remaining = store
                .any_older_than(&self.ttl_field, cutoff)
                .await
                .context("checking for remaining documents to TTL")?;
            if !remaining {
                return Ok(());
            }

            debug!(
                collection = %store.collection_name(),
                cutoff = %cutoff,
                "Documents remain past TTL, waiting"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(MigrationError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

fn parse_duration_var(
    opts: &MigrationOptions,
    key: &str,
    label: &str,
    problems: &mut Vec<String>,
) -> Option<Duration> {
    let raw = opts.require_env(key, problems)?;
    match parse_duration(raw) {
        Ok(duration) => Some(duration),
        Err(e) => {
            problems.push(format!("can't parse {} '{}' as duration: {}", label, raw, e));
            None
        }
    }
}

#[async_trait]
impl Migration for TtlCollection {
    async fn execute(&self, db: &Database, cancel: &CancellationToken) -> Result<()> {
        let store = db.expiry_store(&self.collection);
        self.run(&store, cancel).await
    }
}
