//! Hello world migration - prints one document to check connectivity

use super::Migration;
use crate::config::MigrationOptions;
use crate::db::Database;
use crate::error::{MigrationError, Result, ResultExt};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use tokio_util::sync::CancellationToken;

pub const NAME: &str = "hello-world";

/// Prints the first document of a collection as pretty JSON.
#[derive(Debug, Clone)]
pub struct HelloWorld {
    collection: String,
}

pub fn factory(opts: &MigrationOptions) -> Result<Box<dyn Migration>> {
    let mut problems = opts.validate();
    let collection = opts.require_collection(&mut problems);
    MigrationOptions::resolve(problems)?;

    Ok(Box::new(HelloWorld { collection }))
}

/// Render a document as indented relaxed extended JSON.
pub fn render(document: Document) -> Result<String> {
    let json = Bson::Document(document).into_relaxed_extjson();
    Ok(serde_json::to_string_pretty(&json)?)
}

#[async_trait]
impl Migration for HelloWorld {
    async fn execute(&self, db: &Database, _cancel: &CancellationToken) -> Result<()> {
        let document = db
            .collection(&self.collection)
            .find_one(doc! {})
            .await
            .with_context(|| format!("finding document in collection '{}'", self.collection))?
            .ok_or_else(|| MigrationError::EmptyCollection {
                collection: self.collection.clone(),
            })?;

        let output = render(document).context("pretty printing json output")?;
        println!("{}", output);
        Ok(())
    }
}
