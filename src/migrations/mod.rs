//! Named one-shot migration jobs and the registry that resolves them

pub mod hello_world;
pub mod redact_project_events;
pub mod ttl_collection;
pub mod unset_field;

use crate::config::MigrationOptions;
use crate::db::Database;
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// A runnable job bound to validated options.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Run the job to completion against `db`.
    ///
    /// Implementations check `cancel` between units of work and return
    /// [`MigrationError::Cancelled`] once it fires.
    async fn execute(&self, db: &Database, cancel: &CancellationToken) -> Result<()>;
}

/// Builds a job from shared options, reporting every validation problem at once.
pub type MigrationFactory = fn(&MigrationOptions) -> Result<Box<dyn Migration>>;

/// Mapping from job name to constructor.
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<&'static str, MigrationFactory>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every job shipped with this crate.
    pub fn builtin() -> Self {
        Self::new()
            .register(ttl_collection::NAME, ttl_collection::factory)
            .register(hello_world::NAME, hello_world::factory)
            .register(unset_field::DELETE_PROJECT_VARS, unset_field::project_vars_factory)
            .register(
                unset_field::DELETE_GITHUB_APP_KEYS,
                unset_field::github_app_keys_factory,
            )
            .register(
                redact_project_events::NAME,
                redact_project_events::factory,
            )
    }

    /// Add or replace the job registered as `name`.
    pub fn register(mut self, name: &'static str, factory: MigrationFactory) -> Self {
        self.factories.insert(name, factory);
        self
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Resolve `name` and construct the job from `opts`.
    pub fn migration(&self, name: &str, opts: &MigrationOptions) -> Result<Box<dyn Migration>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| MigrationError::UnknownMigration(name.to_string()))?;
        factory(opts)
    }
}

/// Return `Cancelled` if the token has fired.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(MigrationError::Cancelled);
    }
    Ok(())
}
