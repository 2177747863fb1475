//! Retention engine
//!
//! Enforces the age and capacity policies over catalog and filesystem
//! together. Runs periodically, on demand via [`RetentionEngine::trigger`],
//! or as a single deterministic pass via [`RetentionEngine::run_once`].
//!
//! Eviction order for one recording: delete the file (already gone is fine),
//! then delete the row, which also deletes its events. If the file cannot be
//! deleted the row is kept and the recording is retried on the next pass.
//! Only committed recordings are ever considered, so a segment that is still
//! being written is never touched.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Order, RecordingFilter};
use crate::model::Recording;
use crate::storage::{self, StorageUsage};
use crate::worker::WorkerHandle;

const PAGE: usize = 100;

/// Retention policy
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub storage_root: PathBuf,
    /// Capacity limit for everything under `storage_root`
    pub max_size_bytes: u64,
    /// Maximum recording age; `None` disables age eviction
    pub retention: Option<Duration>,
    /// Time between periodic passes
    pub interval: Duration,
    /// How long `stop` waits for an in-flight pass before abandoning it
    pub stop_grace: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./recordings"),
            max_size_bytes: 100 * 1024 * 1024 * 1024, // 100 GB
            retention: Some(Duration::from_secs(30 * 24 * 60 * 60)),
            interval: Duration::from_secs(3600), // 1 hour
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Outcome of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub age_evicted: u64,
    pub capacity_evicted: u64,
    pub bytes_freed: u64,
    pub events_deleted: u64,
    /// Catalog rows whose file is missing on disk
    pub missing_files: u64,
    /// Recordings that could not be evicted this pass
    pub failures: u64,
    pub usage_before: StorageUsage,
    pub usage_after: StorageUsage,
}

/// Storage usage and policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageInfo {
    pub storage_root: PathBuf,
    pub total_bytes: u64,
    pub file_count: u64,
    pub max_size_bytes: u64,
    pub retention_secs: Option<u64>,
}

/// Delete one recording's file, then its row.
///
/// Returns the bytes freed on disk. A file error other than not-found leaves
/// the row in place and is returned as an error.
pub async fn evict_recording(catalog: &dyn Catalog, recording: &Recording) -> Result<u64> {
    let path = &recording.file_path;
    let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);

    storage::remove_file_if_exists(path)
        .await
        .with_context(|| format!("Failed to delete segment {:?}", path))?;

    if let Err(e) = catalog.delete_recording(recording.id).await {
        if !e.is_not_found() {
            return Err(e).with_context(|| format!("Failed to delete recording {}", recording.id));
        }
    }

    debug!(
        camera = %recording.camera_id,
        recording = %recording.id,
        path = %path.display(),
        bytes = size,
        "Recording evicted"
    );
    Ok(size)
}

struct Inner {
    config: RetentionConfig,
    catalog: Arc<dyn Catalog>,
    trigger: Notify,
    last_report: Mutex<Option<RetentionReport>>,
}

impl Inner {
    async fn run_once(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport {
            usage_before: storage::scan_usage(&self.config.storage_root).await?,
            ..Default::default()
        };

        let cutoff = self
            .config
            .retention
            .and_then(|r| TimeDelta::from_std(r).ok())
            .map(|r| now - r);

        if let Some(cutoff) = cutoff {
            self.age_pass(cutoff, &mut report).await?;
        }
        self.capacity_pass(&mut report).await?;
        if let Some(cutoff) = cutoff {
            report.events_deleted = self.catalog.delete_unlinked_events_before(cutoff).await?;
        }
        report.missing_files = self.reconcile().await?;
        report.usage_after = storage::scan_usage(&self.config.storage_root).await?;

        if report.age_evicted + report.capacity_evicted + report.events_deleted > 0 {
            info!(
                age_evicted = report.age_evicted,
                capacity_evicted = report.capacity_evicted,
                bytes_freed = report.bytes_freed,
                events_deleted = report.events_deleted,
                usage_bytes = report.usage_after.total_bytes,
                "Retention pass complete"
            );
        } else {
            debug!(usage_bytes = report.usage_after.total_bytes, "Retention pass: nothing to clean");
        }
        if report.failures > 0 {
            warn!(failures = report.failures, "Some recordings could not be evicted, will retry");
        }

        *self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report.clone());
        Ok(report)
    }

    async fn evict(&self, recording: &Recording) -> Result<u64> {
        let freed = evict_recording(self.catalog.as_ref(), recording).await?;
        // Drop the emptied date directory, never the storage root itself
        if let Some(dir) = recording.file_path.parent() {
            if dir != self.config.storage_root.as_path() && dir.starts_with(&self.config.storage_root) {
                let _ = tokio::fs::remove_dir(dir).await;
            }
        }
        Ok(freed)
    }

    /// Evict every recording created before `cutoff`
    async fn age_pass(&self, cutoff: DateTime<Utc>, report: &mut RetentionReport) -> Result<()> {
        let mut failed = 0usize;
        loop {
            let page = self
                .catalog
                .list_recordings(&RecordingFilter {
                    created_before: Some(cutoff),
                    order: Order::Ascending,
                    offset: failed,
                    limit: Some(PAGE),
                    ..Default::default()
                })
                .await?;
            if page.is_empty() {
                return Ok(());
            }
            for recording in &page {
                match self.evict(recording).await {
                    Ok(freed) => {
                        report.age_evicted += 1;
                        report.bytes_freed += freed;
                    }
                    Err(e) => {
                        warn!(recording = %recording.id, error = %format!("{e:#}"), "Age eviction failed");
                        failed += 1;
                        report.failures += 1;
                    }
                }
            }
        }
    }

    /// Evict oldest-first until usage is at or under the limit
    async fn capacity_pass(&self, report: &mut RetentionReport) -> Result<()> {
        let max = self.config.max_size_bytes;
        let mut usage = storage::scan_usage(&self.config.storage_root).await?.total_bytes;
        if usage <= max {
            return Ok(());
        }
        info!(usage_bytes = usage, max_bytes = max, "Storage over capacity, evicting oldest recordings");

        let mut failed = 0usize;
        while usage > max {
            let page = self
                .catalog
                .list_recordings(&RecordingFilter {
                    order: Order::Ascending,
                    offset: failed,
                    limit: Some(PAGE),
                    ..Default::default()
                })
                .await?;
            if page.is_empty() {
                warn!(
                    usage_bytes = usage,
                    max_bytes = max,
                    "Still over capacity with no evictable recordings left"
                );
                break;
            }
            for recording in &page {
                if usage <= max {
                    break;
                }
                match self.evict(recording).await {
                    Ok(freed) => {
                        usage = usage.saturating_sub(freed);
                        report.capacity_evicted += 1;
                        report.bytes_freed += freed;
                    }
                    Err(e) => {
                        warn!(recording = %recording.id, error = %format!("{e:#}"), "Capacity eviction failed");
                        failed += 1;
                        report.failures += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Count catalog rows whose file no longer exists
    async fn reconcile(&self) -> Result<u64> {
        let mut missing = 0u64;
        let mut offset = 0usize;
        loop {
            let page = self
                .catalog
                .list_recordings(&RecordingFilter {
                    order: Order::Ascending,
                    offset,
                    limit: Some(PAGE),
                    ..Default::default()
                })
                .await?;
            for recording in &page {
                if !tokio::fs::try_exists(&recording.file_path).await.unwrap_or(true) {
                    missing += 1;
                    debug!(
                        camera = %recording.camera_id,
                        recording = %recording.id,
                        path = %recording.file_path.display(),
                        "Recording file missing"
                    );
                }
            }
            if page.len() < PAGE {
                break;
            }
            offset += page.len();
        }
        if missing > 0 {
            warn!(missing, "Catalog references missing segment files");
        }
        Ok(missing)
    }
}

/// Periodic and on-demand retention
pub struct RetentionEngine {
    inner: Arc<Inner>,
    worker: Option<WorkerHandle>,
}

impl RetentionEngine {
    pub fn new(config: RetentionConfig, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                trigger: Notify::new(),
                last_report: Mutex::new(None),
            }),
            worker: None,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.inner.config
    }

    /// Run one pass now, as of `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        self.inner.run_once(now).await
    }

    /// Spawn the periodic task. The first pass runs immediately.
    pub fn start(&mut self) {
        if self.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        self.worker = Some(WorkerHandle::spawn("retention", move |cancel| {
            retention_loop(inner, cancel)
        }));
        info!(
            interval_secs = self.inner.config.interval.as_secs(),
            max_bytes = self.inner.config.max_size_bytes,
            "Retention engine started"
        );
    }

    /// Request a pass as soon as possible
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    pub async fn stop(&mut self) -> bool {
        match self.worker.take() {
            Some(worker) => worker.stop(self.inner.config.stop_grace).await,
            None => true,
        }
    }

    pub fn last_report(&self) -> Option<RetentionReport> {
        self.inner
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Current usage under the storage root plus the configured policy
    pub async fn storage_info(&self) -> Result<StorageInfo> {
        let config = &self.inner.config;
        let usage = storage::scan_usage(&config.storage_root).await?;
        Ok(StorageInfo {
            storage_root: config.storage_root.clone(),
            total_bytes: usage.total_bytes,
            file_count: usage.file_count,
            max_size_bytes: config.max_size_bytes,
            retention_secs: config.retention.map(|r| r.as_secs()),
        })
    }
}

async fn retention_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Retention task shutting down");
                break;
            }
            _ = interval.tick() => {}
            _ = inner.trigger.notified() => {
                debug!("Retention pass triggered");
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = inner.run_once(Utc::now()) => {
                if let Err(e) = result {
                    warn!(error = %format!("{e:#}"), "Retention pass failed");
                }
            }
        }
    }
}
