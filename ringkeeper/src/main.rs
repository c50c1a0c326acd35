// ABOUTME: Registry service binary: loads config, picks a store backend, serves the HTTP surface
// ABOUTME: Shuts down gracefully on Ctrl+C or SIGTERM, draining requests and stopping the index refresher

use anyhow::Context;
use dotenv::dotenv;
use ringkeeper_api::{app_routes, AppState};
use ringkeeper_core::{
    MemoryRegistryStore, PgRegistryStore, RedisRegistryStore, Registry, RegistryConfig,
    RegistryStore, StoreBackend,
};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Validate backend-specific environment variables at startup
fn validate_environment(backend: StoreBackend) -> anyhow::Result<()> {
    let required = match backend {
        StoreBackend::Memory => None,
        StoreBackend::Postgres => Some("DATABASE_URL"),
        StoreBackend::Redis => Some("REDIS_URL"),
    };
    if let Some(key) = required {
        if env::var(key).is_err() {
            anyhow::bail!("{key} must be set when STORE_BACKEND={backend}");
        }
    }
    if backend == StoreBackend::Memory {
        tracing::warn!("STORE_BACKEND=memory: membership is lost on restart and not shared between processes");
    }
    Ok(())
}

async fn connect_store(backend: StoreBackend) -> anyhow::Result<Arc<dyn RegistryStore>> {
    let store: Arc<dyn RegistryStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryRegistryStore::new()),
        StoreBackend::Postgres => {
            let database_url = env::var("DATABASE_URL")?; // Validated above
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&database_url)
                .await
                .context("connecting to PostgreSQL")?;
            ringkeeper_core::setup(&pool).await?;
            Arc::new(PgRegistryStore::new(pool))
        }
        StoreBackend::Redis => {
            let redis_url = env::var("REDIS_URL")?; // Validated above
            Arc::new(
                RedisRegistryStore::connect(&redis_url)
                    .await
                    .context("connecting to Redis")?,
            )
        }
    };
    tracing::info!(store = store.name(), "✔︎ Registry store ready");
    Ok(store)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let worker_threads = env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| num_cpus::get().max(2));

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(async_main(worker_threads))
}

async fn async_main(worker_threads: usize) -> anyhow::Result<()> {
    // JSON logs in production for structured log ingestion
    let is_production = env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = RegistryConfig::from_env().context("invalid registry configuration")?;
    let backend = StoreBackend::from_env()?;
    validate_environment(backend)?;

    let store = connect_store(backend).await?;
    let registry = Arc::new(Registry::start(store, &config));

    let app = app_routes(AppState::new(Arc::clone(&registry), &config));

    let bind_addr: SocketAddr = env::var("BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
        .parse()
        .context("BIND_ADDR must be host:port")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;

    tracing::info!(
        %bind_addr,
        worker_threads,
        application = %config.application,
        datacenter = %config.datacenter,
        "🌐 Registry listening"
    );

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    wait_for_shutdown_signal().await;
    shutdown.cancel();

    tracing::info!("Shutting down gracefully...");

    // Wait for in-flight requests to drain
    match tokio::time::timeout(Duration::from_secs(25), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("API server error: {}", e),
        Ok(Err(e)) => tracing::warn!("API server task error: {:?}", e),
        Err(_) => tracing::warn!("API server shutdown timed out after 25s"),
    }

    registry.shutdown().await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}
