//! Database access layer over the MongoDB driver

use crate::error::{MigrationError, Result};
use crate::store::ExpiryStore;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use mongodb::options::{AuthMechanism, ClientOptions, Credential};
use mongodb::{Client, Collection};
use std::time::Duration;
use tracing::info;

/// Auth source used with the MONGODB-AWS mechanism.
const AWS_AUTH_SOURCE: &str = "$external";

/// How the client authenticates to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// MONGODB-AWS against the `$external` source
    Aws,
    /// Whatever the connection string specifies
    None,
}

/// MongoDB client bound to one target database
#[derive(Clone)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    /// Connect to the cluster at `url` and bind to database `name`.
    pub async fn connect(url: &str, name: &str, auth: AuthMode) -> Result<Self> {
        let mut options = ClientOptions::parse(url)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to parse URL: {}", e)))?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        options.connect_timeout = Some(Duration::from_secs(10));

        if auth == AuthMode::Aws {
            options.credential = Some(
                Credential::builder()
                    .mechanism(AuthMechanism::MongoDbAws)
                    .source(AWS_AUTH_SOURCE.to_string())
                    .build(),
            );
        }

        let client = Client::with_options(options)
            .map_err(|e| MigrationError::Database(format!("Failed to connect: {}", e)))?;

        info!(database = %name, "Database client created");
        Ok(Self {
            client,
            name: name.to_string(),
        })
    }

    /// Name of the bound database
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the underlying driver database handle
    pub fn handle(&self) -> mongodb::Database {
        self.client.database(&self.name)
    }

    /// Untyped handle to a collection in the bound database
    pub fn collection(&self, name: &str) -> Collection<Document> {
        self.handle().collection(name)
    }

    /// Expiry store for `collection` in the bound database
    pub fn expiry_store(&self, collection: &str) -> MongoExpiryStore {
        MongoExpiryStore {
            database: self.handle(),
            collection: collection.to_string(),
        }
    }
}

/// [`ExpiryStore`] backed by a live MongoDB collection and its TTL index.
pub struct MongoExpiryStore {
    database: mongodb::Database,
    collection: String,
}

impl MongoExpiryStore {
    fn coll(&self) -> Collection<Document> {
        self.database.collection(&self.collection)
    }
}

fn ascending(field: &str) -> Document {
    doc! { field: 1 }
}

/// `collMod` changing the expiry of the TTL index on `field`.
fn collmod_command(collection: &str, field: &str, seconds: i64) -> Document {
    doc! {
        "collMod": collection,
        "index": {
            "keyPattern": ascending(field),
            "expireAfterSeconds": seconds,
        },
    }
}

fn older_than(field: &str, cutoff: DateTime<Utc>) -> Document {
    doc! { field: { "$lt": bson::DateTime::from_chrono(cutoff) } }
}

#[async_trait]
impl ExpiryStore for MongoExpiryStore {
    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn oldest_timestamp(&self, field: &str) -> Result<DateTime<Utc>> {
        let oldest = self
            .coll()
            .find_one(doc! {})
            .sort(ascending(field))
            .await?
            .ok_or_else(|| MigrationError::EmptyCollection {
                collection: self.collection.clone(),
            })?;

        match oldest.get(field) {
            Some(Bson::DateTime(ts)) => Ok(ts.to_chrono()),
            _ => Err(MigrationError::InvalidTtlField {
                collection: self.collection.clone(),
                field: field.to_string(),
            }),
        }
    }

    async fn count_older_than(&self, field: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self.coll().count_documents(older_than(field, cutoff)).await?)
    }

    async fn set_expire_after(&self, field: &str, seconds: i64) -> Result<()> {
        self.database
            .run_command(collmod_command(&self.collection, field, seconds))
            .await?;
        Ok(())
    }

    async fn any_older_than(&self, field: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let found = self.coll().find_one(older_than(field, cutoff)).await?;
        Ok(found.is_some())
    }
}
