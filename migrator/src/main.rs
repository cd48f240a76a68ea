// Migrator binary entry point
// Brings the storefront schema up to the configured target version

use anyhow::Context;
use common::config::Settings;
use common::db::{MySqlConnector, PoolManager, SchemaBootstrapper, SchemaScript, TransactionExecutor};
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.json_logs,
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!("Starting storefront schema migrator");
    settings.validate().context("Invalid configuration")?;

    info!(
        host = %settings.database.host,
        port = settings.database.port,
        database = %settings.database.database,
        script = %settings.schema.script_path.display(),
        target_version = settings.schema.target_version,
        "Configuration loaded"
    );

    let script_text = std::fs::read_to_string(&settings.schema.script_path).with_context(|| {
        format!(
            "Failed to read schema script {}",
            settings.schema.script_path.display()
        )
    })?;
    let script = SchemaScript::parse(&script_text);
    info!(statements = script.len(), "Schema script loaded");

    // Initialize database connection pool
    let pool = Arc::new(PoolManager::new(MySqlConnector::new()));
    pool.initialize(settings.database.clone())
        .await
        .context("Failed to initialize database pool")?;

    let executor = TransactionExecutor::from_config(pool.clone(), &settings.transaction);
    let bootstrapper = SchemaBootstrapper::from_config(executor, &settings.schema)
        .context("Invalid schema configuration")?;

    let outcome = bootstrapper
        .migrate_if_needed(settings.schema.target_version, script.statements())
        .await;

    // Always close the pool, even when the migration failed
    pool.shutdown().await;
    let stats = serde_json::to_string(&pool.stats())?;

    match outcome {
        Ok(outcome) => {
            info!(
                outcome = %serde_json::to_string(&outcome)?,
                stats = %stats,
                "Migrator finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, stats = %stats, "Schema migration failed");
            Err(e).context("Schema migration failed")
        }
    }
}
