use anyhow::{Context, Result};
use axum::Router;
use object_uploader::{
    backend::{LocalBackend, MemoryBackend, ObjectBackend, S3Backend},
    config::{AppConfig, BackendKind},
    routes,
    services::{FileService, validation::ValidationGate},
};
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-uploader with config: {:?}", cfg);

    // --- Initialize storage backend ---
    let backend = connect_backend(&cfg).await?;

    // --- Initialize core service ---
    let scanner = Arc::new(ValidationGate::new(&cfg.denylist));
    let files = FileService::new(
        backend,
        cfg.bucket.clone(),
        cfg.transfer.clone(),
        scanner,
        cfg.max_list_pages,
    )
    .context("building file service")?;

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(files);

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
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the backend selected by `cfg.backend`.
async fn connect_backend(cfg: &AppConfig) -> Result<Arc<dyn ObjectBackend>> {
    let backend: Arc<dyn ObjectBackend> = match cfg.backend {
        BackendKind::Memory => {
            tracing::warn!("Using in-memory backend; objects are lost on exit");
            Arc::new(MemoryBackend::new().with_page_size(cfg.list_page_size))
        }
        BackendKind::Local => {
            // Create the database's parent directory if needed
            let db_path = cfg
                .database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:")
                .trim_start_matches("file:");
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                    tracing::info!("Created missing directory {:?}", parent);
                }
            }

            tracing::debug!("Connecting to metadata database {}", cfg.database_url);
            let backend = LocalBackend::connect(&cfg.database_url, &cfg.storage_dir)
                .await
                .with_context(|| format!("opening local storage at {}", cfg.storage_dir))?;
            Arc::new(backend.with_page_size(cfg.list_page_size))
        }
        BackendKind::S3 => {
            tracing::info!(
                "Using S3 backend in {} (endpoint: {})",
                cfg.s3_region,
                cfg.s3_endpoint.as_deref().unwrap_or("default")
            );
            let backend = S3Backend::connect(&cfg.s3_region, cfg.s3_endpoint.as_deref()).await;
            Arc::new(backend.with_page_size(cfg.list_page_size))
        }
    };
    Ok(backend)
}
