//! Checkpoint-driven segment retention.

use crate::error::Result;
use crate::meta::MetaPersister;
use crate::naming::SegmentScanner;
use crate::segment::remove_closed_segment;
use crate::storage::ExternalStorage;
use crate::RedoError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deletes closed segments wholly below the checkpoint.
pub struct RetentionController {
    dir: PathBuf,
    changefeed_id: String,
    meta: Arc<MetaPersister>,
    storage: Option<Arc<dyn ExternalStorage>>,
}

impl RetentionController {
    pub fn new(
        dir: impl Into<PathBuf>,
        changefeed_id: impl Into<String>,
        meta: Arc<MetaPersister>,
        storage: Option<Arc<dyn ExternalStorage>>,
    ) -> Self {
        Self {
            dir: dir.into(),
            changefeed_id: changefeed_id.into(),
            meta,
            storage,
        }
    }

    /// Runs one retention pass.
    ///
    /// Segments with a max commit-ts strictly below the checkpoint are
    /// collected. The raised `gc_ts` is flushed to meta before the first
    /// deletion; a failed flush aborts the pass. Per-file deletion failures
    /// are reported, not returned.
    pub fn tick(&self) -> Result<RetentionReport> {
        let checkpoint_ts = self.meta.checkpoint_ts();
        let mut report = RetentionReport {
            checkpoint_ts,
            ..Default::default()
        };

        let candidates: Vec<_> =
            SegmentScanner::list_closed_segments(&self.dir, &self.changefeed_id, None)?
                .into_iter()
                .filter(|(_, name)| name.ts < checkpoint_ts)
                .collect();

        let Some(gc_ts) = candidates.iter().map(|(_, name)| name.ts).max() else {
            return Ok(report);
        };

        self.meta.set_gc_ts(gc_ts);
        self.meta.flush()?;
        report.gc_ts = self.meta.gc_ts();

        for (path, name) in candidates {
            match remove_closed_segment(&path, &name, self.storage.as_deref()) {
                Ok(()) => {
                    tracing::debug!("Deleted redo segment {}", path.display());
                    report.deleted.push(path);
                }
                Err(e) => {
                    tracing::warn!("Failed to delete redo segment {}: {}", path.display(), e);
                    report.failures.push((path, e));
                }
            }
        }

        if !report.deleted.is_empty() || !report.failures.is_empty() {
            tracing::info!(
                "Redo retention complete: {} segments deleted, {} failures (checkpoint_ts={})",
                report.deleted.len(),
                report.failures.len(),
                checkpoint_ts
            );
        }

        Ok(report)
    }

    /// Runs the retention loop until `token` is cancelled.
    pub async fn run(&self, interval: Duration, token: CancellationToken) {
        tracing::info!(
            "Redo retention started for changefeed {} (interval={:?})",
            self.changefeed_id,
            interval
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.tick() {
                tracing::error!("Redo retention pass failed: {}", e);
            }
        }

        tracing::info!("Redo retention stopped");
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Default)]
pub struct RetentionReport {
    pub checkpoint_ts: u64,
    /// Meta `gc_ts` after the pass.
    pub gc_ts: u64,
    pub deleted: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, RedoError)>,
}

impl RetentionReport {
    /// Folds the per-file failures into one error.
    pub fn into_result(self) -> Result<usize> {
        let deleted = self.deleted.len();
        RedoError::collect(self.failures.into_iter().map(|(_, e)| e).collect())?;
        Ok(deleted)
    }
}
