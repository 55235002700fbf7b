// Main entry point for the kernel server

use anyhow::{Context, Result};
use keelson_core::kernel::jobs::TaskRegistry;
use keelson_core::kernel::Kernel;
use keelson_core::server::build_app;
use keelson_core::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,keelson_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keelson application kernel");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let port = config.port;

    // Products register their entities and tasks here before init; the bare
    // server ships with the kernel's own entities only.
    let registry = Kernel::base_registry();
    let tasks = TaskRegistry::new();

    // Initialize the kernel: storage, migrations, kv, services. Migration
    // failure aborts startup by design.
    let kernel = Kernel::init(config, registry, tasks)
        .await
        .context("Failed to initialize kernel")?;
    tracing::info!("Kernel initialized");

    // Embedded worker pool; run a separate worker binary instead by leaving
    // WORKER_CONCURRENCY at 0.
    let shutdown = CancellationToken::new();
    if kernel.config.worker_concurrency > 0 {
        kernel.spawn_workers(shutdown.clone());
    }

    // Build application
    let app = build_app(kernel);

    // Start server
    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/healthz", port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        server_shutdown.cancel();
    })
    .await
    .context("Server error")?;

    Ok(())
}
