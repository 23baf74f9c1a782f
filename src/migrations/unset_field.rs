//! Field deletion migrations - unset a sensitive field across a collection

use super::{ensure_not_cancelled, Migration};
use crate::config::MigrationOptions;
use crate::db::Database;
use crate::error::{Result, ResultExt};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures_util::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const DELETE_PROJECT_VARS: &str = "deleteProjectVars";
pub const DELETE_GITHUB_APP_KEYS: &str = "deleteGitHubAppKeys";

/// Which field to unset, where, and which environment variables page the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsetTarget {
    pub collection: &'static str,
    pub field: &'static str,
    /// Resume from this `_id` (inclusive)
    pub start_at_env: &'static str,
    /// Process at most this many documents
    pub limit_env: &'static str,
    pub description: &'static str,
}

pub const PROJECT_VARS: UnsetTarget = UnsetTarget {
    collection: "project_vars",
    field: "vars",
    start_at_env: "START_AT_PROJECT_ID",
    limit_env: "PROJECT_LIMIT",
    description: "project vars",
};

pub const GITHUB_APP_KEYS: UnsetTarget = UnsetTarget {
    collection: "github_app_auth",
    field: "private_key",
    start_at_env: "START_AT_GITHUB_APP_AUTH_ID",
    limit_env: "GITHUB_APP_AUTH_LIMIT",
    description: "GitHub app private key",
};

/// Removes `target.field` from every document in `target.collection` that has it.
#[derive(Debug, Clone)]
pub struct UnsetField {
    target: UnsetTarget,
    start_at: Option<String>,
    limit: Option<i64>,
}

pub fn project_vars_factory(opts: &MigrationOptions) -> Result<Box<dyn Migration>> {
    Ok(Box::new(UnsetField::new(PROJECT_VARS, opts)?))
}

pub fn github_app_keys_factory(opts: &MigrationOptions) -> Result<Box<dyn Migration>> {
    Ok(Box::new(UnsetField::new(GITHUB_APP_KEYS, opts)?))
}

impl UnsetField {
    pub fn new(target: UnsetTarget, opts: &MigrationOptions) -> Result<Self> {
        let mut problems = opts.validate();
        let limit = opts.limit(target.limit_env, &mut problems);
        MigrationOptions::resolve(problems)?;

        Ok(Self {
            target,
            start_at: opts.env.non_empty(target.start_at_env).map(str::to_string),
            limit,
        })
    }

    /// Documents that still carry the field, from the resume point onwards.
    fn filter(&self) -> Document {
        let mut filter = doc! { self.target.field: { "$exists": true } };
        if let Some(start_at) = &self.start_at {
            filter.insert("_id", doc! { "$gte": start_at.as_str() });
        }
        filter
    }

    async fn find_ids(&self, db: &Database) -> Result<Vec<Bson>> {
        let collection = db.collection(self.target.collection);
        let mut find = collection
            .find(self.filter())
            .projection(doc! { "_id": 1 });
        if self.start_at.is_some() {
            find = find.sort(doc! { "_id": 1 });
        }
        if let Some(limit) = self.limit {
            find = find.limit(limit);
        }

        let docs: Vec<Document> = find
            .await
            .with_context(|| format!("finding {} documents", self.target.description))?
            .try_collect()
            .await
            .with_context(|| format!("iterating over {} documents", self.target.description))?;

        Ok(docs
            .into_iter()
            .filter_map(|mut d| d.remove("_id"))
            .collect())
    }
}

#[async_trait]
impl Migration for UnsetField {
    async fn execute(&self, db: &Database, cancel: &CancellationToken) -> Result<()> {
        let ids = self
            .find_ids(db)
            .await
            .with_context(|| format!("finding {} IDs to update", self.target.description))?;
        info!(
            collection = self.target.collection,
            count = ids.len(),
            "Found documents to update"
        );

        let collection = db.collection(self.target.collection);
        for id in ids {
            ensure_not_cancelled(cancel)?;

            info!(id = %id, "Deleting {}", self.target.description);
            collection
                .update_one(
                    doc! { "_id": id.clone() },
                    doc! { "$unset": { self.target.field: "" } },
                )
                .await
                .with_context(|| {
                    format!("deleting {} for document '{}'", self.target.description, id)
                })?;
        }

        Ok(())
    }
}
