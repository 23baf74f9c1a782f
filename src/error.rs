//! Migration error types and context wrapping

use thiserror::Error;

/// Migration error types
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Every problem found while validating a job's options, reported together.
    #[error("invalid options: {}", .0.join("; "))]
    InvalidOptions(Vec<String>),

    #[error("no migration exists for name '{0}'")]
    UnknownMigration(String),

    #[error("collection '{collection}' has no documents")]
    EmptyCollection { collection: String },

    #[error("TTL field '{field}' does not exist or is not a time in collection '{collection}'")]
    InvalidTtlField { collection: String, field: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("migration cancelled")]
    Cancelled,
}

/// Result type alias using MigrationError
pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Wrap this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        MigrationError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context layers.
    pub fn root(&self) -> &MigrationError {
        match self {
            MigrationError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the run stopped because cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), MigrationError::Cancelled)
    }
}

/// Attach operation context to fallible results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<MigrationError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

impl From<mongodb::error::Error> for MigrationError {
    fn from(err: mongodb::error::Error) -> Self {
        MigrationError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::InvalidDocument(err.to_string())
    }
}
