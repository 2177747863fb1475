//! Kanshi Server: headless recorder
//!
//! Supervises every enabled camera in the catalog, records bounded segments,
//! emits detection events and enforces retention until Ctrl-C.
//!
//! ## Usage
//!
//! ```bash
//! # Start with config/kanshi.yaml (defaults when the file is absent)
//! kanshi-server
//!
//! # Custom config file
//! KANSHI_CONFIG=/etc/kanshi.yaml kanshi-server
//!
//! # Override storage location and retention
//! KANSHI_STORAGE_PATH=/var/lib/kanshi/recordings KANSHI_RETENTION_DAYS=7 kanshi-server
//! ```
//!
//! Cameras use the synthetic source (`synthetic://<name>`); a demo camera is
//! added when the catalog has none.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use kanshi::capture::{NullInference, SyntheticCapture};
use kanshi::catalog::{Catalog, SqliteCatalog};
use kanshi::live::{EventSink, LiveHub, LiveMessage};
use kanshi::retention::RetentionEngine;
use kanshi::storage::RawSegmentBackend;
use kanshi::{Backends, CameraId, CameraRegistry, CaptureSettings, Config, NewCamera, Resolution};

const DEFAULT_CONFIG_PATH: &str = "config/kanshi.yaml";

/// Load the config file named by `KANSHI_CONFIG`, then apply `KANSHI_*` overrides
fn load_config() -> Result<Config> {
    let path = std::env::var("KANSHI_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = if path.exists() {
        info!("  Config: {:?}", path);
        Config::load(&path)?
    } else {
        info!("  Config: {:?} not found, using defaults", path);
        Config::default()
    };

    if let Ok(storage_path) = std::env::var("KANSHI_STORAGE_PATH") {
        config.storage.path = PathBuf::from(storage_path);
    }
    if let Ok(catalog_path) = std::env::var("KANSHI_CATALOG_PATH") {
        config.storage.catalog_path = PathBuf::from(catalog_path);
    }
    if let Some(max_gb) = env_parse("KANSHI_STORAGE_MAX_GB") {
        config.storage.max_size_gb = max_gb;
    }
    if let Some(days) = env_parse("KANSHI_RETENTION_DAYS") {
        config.storage.retention_days = days;
    }
    if let Some(port) = env_parse("KANSHI_WEB_PORT") {
        config.server.port = port;
    }

    config.validate()?;
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Settings for the seeded demo camera: small, so raw segments stay modest
fn demo_settings() -> CaptureSettings {
    CaptureSettings {
        fps: 5,
        resolution: Resolution::new(160, 120),
        codec: "raw".to_string(),
        bitrate: 0,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Kanshi Server starting");
    let config = Arc::new(load_config()?);
    info!("  Storage path: {:?}", config.storage.path);
    info!("  Storage max: {} GB", config.storage.max_size_gb);
    info!("  Retention: {} days", config.storage.retention_days);
    info!("  Catalog: {:?}", config.storage.catalog_path);

    let catalog: Arc<dyn Catalog> = Arc::new(
        SqliteCatalog::open(&config.storage.catalog_path).context("Failed to open catalog")?,
    );

    let live = LiveHub::new(config.server.buffer_capacity);
    let sink: Arc<dyn EventSink> = Arc::new(live.clone());

    let backends = Backends {
        capture: Arc::new(SyntheticCapture::new()),
        writer: Arc::new(RawSegmentBackend),
        inference: Arc::new(NullInference),
    };
    let registry = Arc::new(CameraRegistry::new(
        config.clone(),
        catalog.clone(),
        backends,
        sink,
    ));

    if registry.cameras().await?.is_empty() {
        let camera = registry
            .add(
                NewCamera::new("Demo", "synthetic://demo")
                    .with_id(CameraId::new("demo")?)
                    .with_settings(demo_settings()),
            )
            .await?;
        info!(camera = %camera.id, "Seeded demo camera");
    }
    let running = registry.load().await?;
    info!("  Cameras running: {}", running);

    let mut retention = RetentionEngine::new(config.retention(), catalog.clone());
    retention.start();

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Log live events as they happen
    {
        let mut rx = live.subscribe();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = rx.recv() => match result {
                        Ok(LiveMessage::Event(event)) => info!(
                            camera = %event.camera_id,
                            kind = event.kind.as_str(),
                            label = %event.label,
                            "Event"
                        ),
                        Ok(LiveMessage::Status(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event log lagged, missed {} messages", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    // Periodic status fan-out
    {
        let registry = registry.clone();
        let cancel = cancel.clone();
        let period = Duration::from_secs(config.server.status_interval_secs.max(1));
        tracker.spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.publish_status().await,
                }
            }
        });
    }

    tracker.close();

    run_headless(&registry, &retention, cancel.clone()).await;

    info!("Shutting down");
    cancel.cancel();
    retention.stop().await;
    let abandoned = registry.shutdown().await;
    if abandoned > 0 {
        warn!("{} cameras did not stop cleanly", abandoned);
    }
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kanshi=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Log stats periodically until SIGINT
async fn run_headless(
    registry: &CameraRegistry,
    retention: &RetentionEngine,
    cancel: CancellationToken,
) {
    let mut stats_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = stats_interval.tick() => {
                let statuses = registry.statuses().await;
                let frames: u64 = statuses.iter().map(|s| s.stream.frames_since_connect).sum();
                let segments: u64 = statuses.iter().map(|s| s.recording.segments_registered).sum();
                let events: u64 = statuses.iter().map(|s| s.detection.events_emitted).sum();
                let storage = match retention.storage_info().await {
                    Ok(info) => format!("{} MB", info.total_bytes / (1024 * 1024)),
                    Err(e) => format!("unavailable ({e})"),
                };
                info!(
                    "Stats: {} cameras, {} frames, {} segments, {} events, {} stored",
                    statuses.len(), frames, segments, events, storage
                );
                match serde_json::to_string(&statuses) {
                    Ok(json) => debug!(status = %json, "Camera status"),
                    Err(e) => debug!(error = %e, "Failed to serialize status"),
                }
            }
        }
    }
}
