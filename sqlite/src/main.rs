//! Ferry SQLite runner - synchronizes a client database with a server database.
//!
//! Both databases are provisioned on first use. Tables are created and
//! written by the application; this runner only exchanges changes.

use ferry_engine::metadata::tracking_tables;
use ferry_engine::{
    DefaultResolver, RetryPolicy, SyncAgent, SyncProvider, SyncSummary, TracingObserver,
};
use ferry_sqlite::{AppError, Config, Result, SqliteProvider};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_sqlite=info,ferry_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    match run().await {
        Ok(summary) => {
            tracing::info!(
                uploaded = summary.applied_remote.counts.applied(),
                downloaded = summary.applied_local.counts.applied(),
                conflicts = summary.conflicts(),
                tombstones_purged = summary.tombstones_purged,
                "Synchronization finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Synchronization failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run() -> Result<SyncSummary> {
    let config = Config::from_env()?;
    tracing::info!(scope = %config.scope.name, tables = config.scope.tables.len(), "Starting Ferry");

    let server = Arc::new(SqliteProvider::connect("server", &config.server_url).await?);
    let client = Arc::new(SqliteProvider::connect("client", &config.client_url).await?);

    if config.print_tracking {
        print_tracking(client.as_ref(), &config).await?;
    }

    let mut resolver = DefaultResolver::new();
    if let Some(action) = config.on_local_no_row.clone() {
        resolver = resolver.on_local_no_row(action);
    }

    let agent = SyncAgent::new(client.clone(), server.clone(), config.scope.clone())
        .with_resolver(resolver)
        .with_observer(TracingObserver);

    let result = agent
        .synchronize_with_retry(&config.options, &RetryPolicy::default())
        .await;

    client.close().await?;
    server.close().await?;
    Ok(result?)
}

/// Log the statements provisioning would run on `provider`.
async fn print_tracking(provider: &SqliteProvider, config: &Config) -> Result<()> {
    let mut tx = provider.begin().await?;
    let listed = async {
        for tracking in tracking_tables(&mut *tx, &config.scope).await? {
            let existing = tx.tracking_columns(&tracking).await?;
            let builder = provider.tracking_builder(tracking);
            for statement in builder.provision_script(existing.as_deref()) {
                tracing::info!(table = %builder.tracking().base_name(), "{}", statement);
            }
        }
        Ok::<_, AppError>(())
    }
    .await;
    tx.rollback().await?;
    listed
}
