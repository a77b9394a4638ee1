mod api;
mod bus;
mod cache;
mod classify;
mod clock;
mod config;
mod display;
mod lookup;
mod mdns;
mod pipeline;
mod pipeline_manager;
mod radio;
mod staging;
mod store;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::pipeline_manager::PipelineHandle;
use crate::radio::replay::ReplayDriver;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("collectord=info")),
        )
        .init();

    tracing::info!("Starting collectord");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/blecollector/collectord.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let driver = ReplayDriver::open(
        &config.scanner.capture,
        config.scanner.realtime,
        config.scanner.loop_capture,
    )
    .with_context(|| format!("Failed to open capture {}", config.scanner.capture.display()))?;

    // Start the pipeline thread; it owns every cache and the store
    let bus = bus::new_bus();
    let (digest_tx, digest_rx) = watch::channel(String::new());
    let pipeline = PipelineHandle::spawn(config.clone(), bus, Box::new(driver), digest_tx)?;

    let api_port = config
        .api
        .listen
        .rsplit(':')
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(8054);

    // Optional self-advertisement
    let advertised = match &config.advertise {
        Some(advertise) => {
            let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
            let info = mdns::advertise::register_collector(
                &daemon,
                advertise,
                config.cache.auxiliary_memory,
                api_port,
            )?;
            Some((daemon, info))
        }
        None => None,
    };

    let cancel = CancellationToken::new();

    // Build API router
    let app_state = api::routes::AppState {
        pipeline: pipeline.clone(),
        digest_rx,
        capacities: config.cache.capacities(),
        auxiliary_memory: config.cache.auxiliary_memory,
        api_port,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = server_handle.await;

    if let Some((daemon, info)) = advertised {
        if let Err(e) = mdns::advertise::unregister_collector(&daemon, &info) {
            tracing::error!("Failed to unregister mDNS service: {}", e);
        }
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }

    // Stop the pipeline between scans
    if let Err(e) = pipeline.shutdown().await {
        tracing::error!("Failed to shutdown pipeline: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
