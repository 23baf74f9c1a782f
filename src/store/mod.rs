//! Expiry store abstraction
//!
//! The retention reducer only ever needs four things from the database:
//! the oldest document's timestamp, a count of documents older than a
//! cutoff, a way to change the TTL index threshold, and an existence check
//! used to wait for the background expiry sweep.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Database operations the retention reducer depends on, bound to one collection.
#[async_trait]
pub trait ExpiryStore: Send + Sync {
    /// Name of the collection this store operates on
    fn collection_name(&self) -> &str;

    /// Timestamp held in `field` by the document that sorts first on it.
    ///
    /// Fails with `EmptyCollection` if there are no documents, or
    /// `InvalidTtlField` if that document lacks the field or it is not a datetime.
    async fn oldest_timestamp(&self, field: &str) -> Result<DateTime<Utc>>;

    /// Number of documents whose `field` is strictly before `cutoff`.
    async fn count_older_than(&self, field: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Set the TTL index on `field` to expire documents after `seconds`.
    async fn set_expire_after(&self, field: &str, seconds: i64) -> Result<()>;

    /// Whether any document's `field` is strictly before `cutoff`.
    async fn any_older_than(&self, field: &str, cutoff: DateTime<Utc>) -> Result<bool>;
}
