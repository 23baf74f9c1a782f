//! mongo-migrator - run named one-shot migrations against MongoDB

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use mongo_migrator::config::{Environment, MigrationOptions};
use mongo_migrator::db::{AuthMode, Database};
use mongo_migrator::error::MigrationError;
use mongo_migrator::migrations::{Migration, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run migrations against a database
#[derive(Debug, Parser)]
#[command(name = "mongo-migrator", version, about)]
struct Cli {
    /// Database URL
    #[arg(long, env = "MONGODB_URL")]
    url: String,

    /// Database name
    #[arg(long, env = "MIGRATOR_DB")]
    db: String,

    /// Name of the script to run
    #[arg(long, env = "MIGRATOR_SCRIPT")]
    script: String,

    /// Collection to run the script against
    #[arg(long, env = "MIGRATOR_COLLECTION")]
    collection: Option<String>,

    /// Batch size for the script to process at once
    #[arg(long, env = "MIGRATOR_BATCH_SIZE")]
    batch_size: Option<u64>,

    /// How to authenticate to the cluster
    #[arg(long, value_enum, default_value_t = Auth::Aws)]
    auth: Auth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Auth {
    /// MONGODB-AWS with the $external auth source
    Aws,
    /// Use whatever the URL specifies
    None,
}

impl From<Auth> for AuthMode {
    fn from(auth: Auth) -> Self {
        match auth {
            Auth::Aws => AuthMode::Aws,
            Auth::None => AuthMode::None,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let registry = Registry::builtin();

    if let Err(e) = run(cli, &registry).await {
        let cancelled = e
            .downcast_ref::<MigrationError>()
            .is_some_and(MigrationError::is_cancelled);
        if cancelled {
            warn!(error = %format!("{:#}", e), "Migration cancelled before completion");
        } else {
            error!(error = %format!("{:#}", e), "Migration failed");
        }
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mongo_migrator=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    // stdout is reserved for job output
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli, registry: &Registry) -> anyhow::Result<()> {
    let opts = MigrationOptions {
        database: cli.db.clone(),
        collection: cli.collection.clone(),
        batch_size: cli.batch_size,
        env: Environment::from_process(),
    };

    let migration = match registry.migration(&cli.script, &opts) {
        Ok(migration) => migration,
        Err(e @ MigrationError::UnknownMigration(_)) => {
            let available: Vec<_> = registry.names().collect();
            return Err(anyhow!("{} (available: {})", e, available.join(", ")));
        }
        Err(e) => return Err(e).context("getting migration script"),
    };

    let db = Database::connect(&cli.url, &cli.db, cli.auth.into())
        .await
        .context("getting mongo client")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    info!(
        script = %cli.script,
        database = %db.name(),
        collection = cli.collection.as_deref().unwrap_or("-"),
        "Running migration"
    );
    migration
        .execute(&db, &cancel)
        .await
        .with_context(|| format!("running migration '{}'", cli.script))?;

    info!(script = %cli.script, "Migration complete");
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn cancel_on_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Shutdown signal received, stopping after the current step");
    cancel.cancel();
}
