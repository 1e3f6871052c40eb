use anyhow::{Context, Result};
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing_subscriber::EnvFilter;
use tus_server::{
    config::{AppConfig, Backend},
    routes::routes::app,
    services::{
        file_store::{FileStore, connect_configstore},
        memory_store::MemoryStore,
        store::DataStore,
    },
    state::AppState,
};

/// Upper bound between two expiry sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting tus-server with config: {:?}", cfg);

    // --- Handle migration mode ---
    if migrate {
        let pool = connect_configstore(&cfg.database_url)
            .await
            .with_context(|| format!("opening configstore at {}", cfg.database_url))?;
        pool.close().await;
        tracing::info!("Configstore schema applied.");
        return Ok(()); // exit after migration
    }

    // --- Initialize store ---
    let mut file_store = None;
    let store: Arc<dyn DataStore> = match cfg.backend {
        Backend::File => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            let pool = connect_configstore(&cfg.database_url)
                .await
                .with_context(|| format!("opening configstore at {}", cfg.database_url))?;
            let store = FileStore::new(Arc::new(pool), &cfg.storage_dir);
            file_store = Some(store.clone());
            Arc::new(store)
        }
        Backend::Memory => {
            tracing::warn!("Using in-memory store; uploads are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let settings = cfg.tus_settings();
    tracing::info!(
        base_path = %settings.base_path,
        extensions = %settings.extensions.header_value(),
        "Protocol settings"
    );

    let expiry_task = settings
        .expiration
        .map(|retention| spawn_expiry_sweeper(store.clone(), retention));

    // --- Build router ---
    let app = app(AppState::new(store, settings));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Shutdown ---
    if let Some(task) = expiry_task {
        task.abort();
    }
    if let Some(store) = file_store {
        store.close().await;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Periodically drop incomplete uploads older than `retention`.
fn spawn_expiry_sweeper(store: Arc<dyn DataStore>, retention: chrono::Duration) -> JoinHandle<()> {
    let period = retention
        .to_std()
        .map(|d| d.min(MAX_SWEEP_INTERVAL))
        .unwrap_or(MAX_SWEEP_INTERVAL);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let cutoff = chrono::Utc::now() - retention;
            match store.remove_expired(cutoff).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "Removed expired uploads"),
                Err(err) => tracing::warn!(error = %err, "Expiry sweep failed"),
            }
        }
    })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(err) => {
            tracing::error!("Failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    }
}
