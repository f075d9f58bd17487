//! Stream Client Probe
//!
//! Headless client that opens a tile for every camera in `STREAM_ENDPOINTS`
//! and records each live stream to disk. Useful for checking that the
//! camera endpoints serve a playable stream.
//!
//! # Servers
//!
//! - HTTP server for health endpoints and Prometheus metrics
//!   (default: 0.0.0.0:9095)
//!
//! # Startup Flow
//!
//! 1. Initialize tracing from `RUST_LOG` / `STREAM_LOG_JSON`
//! 2. Load configuration from environment
//! 3. Initialize Prometheus metrics recorder
//! 4. Start health HTTP server (liveness, readiness, metrics)
//! 5. Spawn the tile controller and open every catalog camera
//! 6. Track tile events until a shutdown signal arrives

#![warn(clippy::pedantic)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::config::{ObservabilityConfig, DEFAULT_LOG_FILTER};
use common::types::CameraId;
use stream_client::actors::{SessionEvent, SessionSettings, TileControllerHandle, TileEvent};
use stream_client::config::Config;
use stream_client::observability::{init_metrics_recorder, observability_router, HealthState};
use stream_client::receiver::WsConnector;
use stream_client::sink::file::FileSinkFactory;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long tiles get to close on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let observability = ObservabilityConfig::from_vars(&std::env::vars().collect::<HashMap<_, _>>());
    let filter = EnvFilter::try_new(&observability.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting stream client probe");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        cameras = config.catalog.len(),
        connect_timeout_ms = config.connect_timeout.as_millis(),
        append_timeout_ms = config.append_timeout.as_millis(),
        reconnect = ?config.reconnect,
        live_mode = config.live_mode,
        record_dir = %config.record_dir.display(),
        metrics_bind_address = %config.metrics_bind_address,
        "Configuration loaded successfully"
    );

    if config.catalog.is_empty() {
        warn!("STREAM_ENDPOINTS lists no cameras, nothing to record");
    }

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Start health HTTP server
    let health_addr: SocketAddr = config.metrics_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.metrics_bind_address, "Invalid metrics bind address");
        format!("Invalid metrics bind address: {e}")
    })?;

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let sink_factory = FileSinkFactory::open(config.record_dir.clone())
        .await
        .map_err(|e| {
            error!(
                error = %e,
                dir = %config.record_dir.display(),
                "Failed to create recording directory"
            );
            format!(
                "Failed to create recording directory {}: {e}",
                config.record_dir.display()
            )
        })?;

    let (controller, mut events) = TileControllerHandle::new(
        config.catalog.clone(),
        SessionSettings::from_config(&config),
        Arc::new(WsConnector::new(config.connect_timeout)),
        Arc::new(sink_factory),
    );

    let app = observability_router(Arc::clone(&health_state), prometheus_handle);
    let health_shutdown_token = controller.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    for camera in config.catalog.cameras() {
        match controller.open_tile(camera.clone(), None, None).await {
            Ok(()) => info!(camera = %camera, "Tile opened"),
            Err(e) => error!(camera = %camera, error = %e, "Failed to open tile"),
        }
    }

    info!("Stream client running - press Ctrl+C to shutdown");

    let mut streaming = HashSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received, initiating graceful shutdown...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Tile event channel closed");
                    break;
                };
                track_tile_event(&health_state, &mut streaming, event);
            }
        }
    }

    health_state.set_not_live();

    if let Err(e) = controller.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Tile controller shutdown error");
    }

    // Log the final events of each tile
    while let Some(event) = events.recv().await {
        track_tile_event(&health_state, &mut streaming, event);
    }

    info!("Stream client shutdown complete");
    Ok(())
}

/// Log a tile event and keep readiness in step with streaming tiles.
fn track_tile_event(health: &HealthState, streaming: &mut HashSet<CameraId>, tile_event: TileEvent) {
    let TileEvent { camera, event } = tile_event;
    match event {
        SessionEvent::Connected => {
            info!(camera = %camera, "Tile connected");
        }
        SessionEvent::Initialized { codec } => {
            info!(camera = %camera, codec = %codec, "Tile streaming");
            if streaming.insert(camera) {
                health.tile_streaming();
            }
        }
        SessionEvent::Reconnecting { attempt, delay } => {
            info!(
                camera = %camera,
                attempt,
                delay_ms = delay.as_millis(),
                "Tile reconnecting"
            );
        }
        SessionEvent::StreamEnded => {
            warn!(camera = %camera, "Tile stream ended");
            if streaming.remove(&camera) {
                health.tile_stopped();
            }
        }
        SessionEvent::StreamError { error } => {
            error!(
                camera = %camera,
                error_code = error.error_code(),
                error = %error,
                "Tile stream error: {}",
                error.host_message()
            );
            if streaming.remove(&camera) {
                health.tile_stopped();
            }
        }
        SessionEvent::Closed { reason } => {
            info!(camera = %camera, reason = %reason, "Tile closed");
            if streaming.remove(&camera) {
                health.tile_stopped();
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
