//! Project event redaction migration
//!
//! Retroactively replaces project variable values and GitHub app private
//! keys recorded in historical project modification events.

use super::{ensure_not_cancelled, Migration};
use crate::config::MigrationOptions;
use crate::db::Database;
use crate::error::{MigrationError, Result, ResultExt};
use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const NAME: &str = "redactProjectEventSecrets";

/// Placeholder written over every secret value.
pub const REDACTED_VALUE: &str = "{REDACTED}";

const START_AT_PROJECT_ID_ENV_VAR: &str = "START_AT_PROJECT_ID";
const START_AT_REPO_ID_ENV_VAR: &str = "START_AT_REPO_ID";
/// Total projects processed across both ref collections.
const PROJECT_LIMIT_ENV_VAR: &str = "PROJECT_LIMIT";
/// Events processed per project.
const EVENT_LIMIT_ENV_VAR: &str = "EVENT_LIMIT";

const PROJECT_REF_COLLECTION: &str = "project_ref";
const REPO_REF_COLLECTION: &str = "repo_ref";
const EVENT_COLLECTION: &str = "events";

const RESOURCE_ID_KEY: &str = "r_id";
const RESOURCE_TYPE_KEY: &str = "r_type";
const EVENT_TYPE_KEY: &str = "e_type";
const TIMESTAMP_KEY: &str = "ts";

const RESOURCE_TYPE_PROJECT: &str = "PROJECT";
const EVENT_TYPE_PROJECT_MODIFIED: &str = "PROJECT_MODIFIED";

#[derive(Debug, Deserialize)]
struct RefId {
    #[serde(rename = "_id")]
    id: String,
}

/// Walks project and repo refs in `_id` order and redacts their modification events.
#[derive(Debug, Clone)]
pub struct RedactProjectEventSecrets {
    start_at_project: Option<String>,
    start_at_repo: Option<String>,
    project_limit: Option<i64>,
    event_limit: Option<i64>,
}

pub fn factory(opts: &MigrationOptions) -> Result<Box<dyn Migration>> {
    Ok(Box::new(RedactProjectEventSecrets::new(opts)?))
}

impl RedactProjectEventSecrets {
    pub fn new(opts: &MigrationOptions) -> Result<Self> {
        let mut problems = opts.validate();
        let project_limit = opts.limit(PROJECT_LIMIT_ENV_VAR, &mut problems);
        let event_limit = opts.limit(EVENT_LIMIT_ENV_VAR, &mut problems);
        MigrationOptions::resolve(problems)?;

        Ok(Self {
            start_at_project: opts
                .env
                .non_empty(START_AT_PROJECT_ID_ENV_VAR)
                .map(str::to_string),
            start_at_repo: opts.env.non_empty(START_AT_REPO_ID_ENV_VAR).map(str::to_string),
            project_limit: project_limit.filter(|l| *l > 0),
            event_limit: event_limit.filter(|l| *l > 0),
        })
    }

    async fn redact_for_project(
        &self,
        db: &Database,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        info!(project_id = %project_id, "Redacting project vars from events");

        let events = db.collection(EVENT_COLLECTION);
        let mut find = events
            .find(doc! {
                RESOURCE_ID_KEY: project_id,
                RESOURCE_TYPE_KEY: RESOURCE_TYPE_PROJECT,
                EVENT_TYPE_KEY: EVENT_TYPE_PROJECT_MODIFIED,
            })
            .sort(doc! { TIMESTAMP_KEY: 1 });
        if let Some(limit) = self.event_limit {
            find = find.limit(limit);
        }
        let mut cursor = find.await.context("finding project modification events")?;

        let mut updated = 0;
        while let Some(event) = cursor
            .try_next()
            .await
            .context("iterating over project modification events")?
        {
            ensure_not_cancelled(cancel)?;

            let set_fields = redaction_update(&event);
            if set_fields.is_empty() {
                continue;
            }
            let event_id = event.get("_id").cloned().unwrap_or(Bson::Null);
            events
                .update_one(doc! { "_id": event_id.clone() }, doc! { "$set": set_fields })
                .await
                .with_context(|| {
                    format!(
                        "updating project modification event data for event '{}'",
                        event_id
                    )
                })?;
            updated += 1;
        }

        Ok(updated)
    }
}

/// The `$set` document that redacts `event`, empty if nothing needs redacting.
pub fn redaction_update(event: &Document) -> Document {
    let mut set_fields = Document::new();
    let Ok(data) = event.get_document("data") else {
        return set_fields;
    };

    for side in ["before", "after"] {
        let Ok(snapshot) = data.get_document(side) else {
            continue;
        };

        if let Ok(vars) = snapshot
            .get_document("vars")
            .and_then(|v| v.get_document("vars"))
        {
            let needs_redaction = vars
                .values()
                .any(|value| value.as_str() != Some(REDACTED_VALUE));
            if needs_redaction {
                let redacted: Document = vars
                    .keys()
                    .map(|name| (name.clone(), Bson::String(REDACTED_VALUE.to_string())))
                    .collect();
                set_fields.insert(format!("data.{}.vars.vars", side), redacted);
            }
        }

        if let Ok(auth) = snapshot.get_document("github_app_auth") {
            if let Some(Bson::Binary(key)) = auth.get("private_key") {
                if !key.bytes.is_empty() && key.bytes != REDACTED_VALUE.as_bytes() {
                    set_fields.insert(
                        format!("data.{}.github_app_auth.private_key", side),
                        Binary {
                            subtype: BinarySubtype::Generic,
                            bytes: REDACTED_VALUE.as_bytes().to_vec(),
                        },
                    );
                }
            }
        }
    }

    set_fields
}

#[async_trait]
impl Migration for RedactProjectEventSecrets {
    async fn execute(&self, db: &Database, cancel: &CancellationToken) -> Result<()> {
        let collections = [
            (PROJECT_REF_COLLECTION, &self.start_at_project),
            (REPO_REF_COLLECTION, &self.start_at_repo),
        ];

        let mut projects_processed: i64 = 0;
        for (name, start_at) in collections {
            let mut filter = Document::new();
            if let Some(start_at) = start_at {
                info!(collection = name, start_at = %start_at, "Starting at project");
                filter.insert("_id", doc! { "$gte": start_at.as_str() });
            }

            let refs = db.handle().collection::<RefId>(name);
            let mut find = refs
                .find(filter)
                .sort(doc! { "_id": 1 })
                .projection(doc! { "_id": 1 });
            if let Some(limit) = self.project_limit {
                find = find.limit(limit - projects_processed);
            }
            let mut cursor = find
                .await
                .with_context(|| format!("finding project refs in collection '{}'", name))?;

            while let Some(project) = cursor
                .try_next()
                .await
                .context("iterating over project refs")?
            {
                ensure_not_cancelled(cancel)?;

                if let Some(limit) = self.project_limit {
                    if projects_processed >= limit {
                        info!(limit = limit, "Reached project limit, stopping");
                        return Ok(());
                    }
                }
                if project.id.is_empty() {
                    return Err(MigrationError::InvalidDocument(format!(
                        "project ID is empty in collection '{}'",
                        name
                    )));
                }

                let updated = self
                    .redact_for_project(db, &project.id, cancel)
                    .await
                    .with_context(|| {
                        format!(
                            "redacting project vars from events for project '{}'",
                            project.id
                        )
                    })?;
                info!(project_id = %project.id, events_updated = updated, "Project redacted");

                projects_processed += 1;
            }

            if self.project_limit.is_some_and(|limit| projects_processed >= limit) {
                info!(projects = projects_processed, "Reached project limit, stopping");
                return Ok(());
            }
        }

        Ok(())
    }
}
