use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{path::Path, str::FromStr, sync::Arc};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use datamaker::config::{BackendSettings, Settings};
use datamaker::models::run::RunParameters;
use datamaker::services::maker::DataMaker;
use datamaker::services::storage_service::LocalStore;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting at {}", Utc::now());

    // --- Parse config ---
    let settings = Settings::from_env_and_args();
    let backend_cfg = BackendSettings::from_settings(&settings);

    // --- Ensure storage directory exists ---
    if !backend_cfg.storage_dir.exists() {
        fs::create_dir_all(&backend_cfg.storage_dir)
            .await
            .with_context(|| format!("creating {}", backend_cfg.storage_dir.display()))?;
        tracing::info!("Created storage directory at {}", backend_cfg.storage_dir.display());
    }

    // --- Initialize SQLite connection ---
    let db_url = &backend_cfg.database_url;
    let db_path = Path::new(
        db_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:"),
    );
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).await?;
        tracing::info!("Created missing directory {:?}", parent);
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );

    let store = LocalStore::new(db, backend_cfg.storage_dir.clone()).with_limits(backend_cfg.limits);
    store.migrate().await.context("running migrations")?;

    // --- Handle migration mode ---
    if settings.migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let params = RunParameters::from_settings(&settings);
    let spec = settings.container_spec();

    // --- Ctrl-C cancels the run ---
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Cancelling at {}", Utc::now());
            signal.cancel();
        }
    });

    tracing::info!("Running at {}", Utc::now());
    let maker = DataMaker::new(Arc::new(store));
    let outcome = maker.run(&params, &spec, cancel.clone()).await;

    if cancel.is_cancelled() {
        tracing::info!("Canceled at {}", Utc::now());
    }
    tracing::info!("Ending at {}", Utc::now());

    outcome?;
    Ok(())
}
