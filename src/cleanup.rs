//! Periodic reclamation of expired state.
//!
//! One scheduler task, two jobs: every `CLEANUP_INTERVAL` the TTL store is
//! swept of expired entries (no file I/O); every hour expired request
//! contexts are drained and the temp files they own are unlinked, then
//! orphaned spool files whose context was already evicted lazily are
//! removed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::service::OptimizationService;

const DEEP_PASS_INTERVAL: Duration = Duration::from_secs(3600);

pub struct CleanupScheduler {
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl CleanupScheduler {
    /// Spawn the scheduler task.
    pub fn start(service: OptimizationService, upload_dir: PathBuf) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let sweep_every = service.config().cleanup_interval;
        let orphan_age = service.config().client_context_ttl;

        tokio::spawn(async move {
            let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
            let mut deep = interval_at(Instant::now() + DEEP_PASS_INTERVAL, DEEP_PASS_INTERVAL);
            info!(
                sweep_secs = sweep_every.as_secs(),
                "cleanup scheduler started"
            );
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        Self::sweep_store(&service).await;
                    }
                    _ = deep.tick() => {
                        Self::sweep_contexts(&service).await;
                        Self::remove_orphans(&upload_dir, orphan_age).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("cleanup scheduler shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Fast pass: eagerly evict expired TTL-store entries and report the
    /// count. Temp-file reclamation belongs to the hourly pass.
    async fn sweep_store(service: &OptimizationService) {
        let swept = service.contexts().sweep().await;
        if swept > 0 {
            info!(swept, "swept expired ttl entries");
        }
    }

    /// Hourly pass: drain expired request contexts and unlink the temp
    /// files each deleted context still owns.
    async fn sweep_contexts(service: &OptimizationService) {
        let drained = service.contexts().drain_expired().await;
        if drained.is_empty() {
            return;
        }
        let mut unlinked = 0usize;
        for (id, context) in &drained {
            for path in context.temp_paths() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => unlinked += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(id = %id, path = %path.display(), %err, "failed to unlink temp file");
                    }
                }
            }
        }
        info!(
            expired = drained.len(),
            unlinked, "swept expired request contexts"
        );
    }

    /// Remove spool files older than the context TTL. Anything that old has
    /// no live context left to claim it.
    async fn remove_orphans(upload_dir: &Path, max_age: Duration) {
        let mut entries = match tokio::fs::read_dir(upload_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %upload_dir.display(), %err, "upload dir not readable");
                return;
            }
        };
        let mut removed = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default();
            if age > max_age {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        warn!(path = %entry.path().display(), %err, "failed to remove orphan");
                    }
                }
            }
        }
        if removed > 0 {
            info!(removed, "removed orphaned upload files");
        }
    }
}
