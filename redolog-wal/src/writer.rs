//! Write-side facade of the redo log.
//!
//! A [`LogWriter`] owns one row and one DDL [`SegmentWriter`], the
//! [`MetaPersister`] and the [`RetentionController`] of a changefeed. It is
//! constructed explicitly by the owning changefeed and lives until
//! [`LogWriter::close`].

use crate::entry::RedoRecord;
use crate::error::{RedoError, Result};
use crate::meta::{LogMeta, MetaPersister};
use crate::model::{DdlEvent, LogKind, RedoLog, RowChangedEvent, TableId};
use crate::naming::{validate_identity, MetaName};
use crate::retention::{RetentionController, RetentionReport};
use crate::segment::{SegmentWriter, SegmentWriterConfig};
use crate::storage::{ExternalStorage, StorageUri};
use crate::{
    check_cancelled, DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_INTERVAL, DEFAULT_GC_INTERVAL,
    DEFAULT_SEGMENT_SIZE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Log writer configuration.
#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    /// Local directory for segments and meta.
    pub dir: PathBuf,
    /// Capture identity, used as the file name prefix.
    pub capture_id: String,
    pub changefeed_id: String,
    /// Maximum segment size before rotation.
    pub max_log_size: u64,
    pub buffer_size: usize,
    /// Background segment flush period.
    pub flush_interval: Duration,
    /// Background retention period.
    pub gc_interval: Duration,
    /// Optional mirror, e.g. `file:///mnt/redo`.
    pub storage_uri: Option<String>,
}

impl LogWriterConfig {
    pub fn new(
        dir: impl Into<PathBuf>,
        capture_id: impl Into<String>,
        changefeed_id: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            capture_id: capture_id.into(),
            changefeed_id: changefeed_id.into(),
            max_log_size: DEFAULT_SEGMENT_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            gc_interval: DEFAULT_GC_INTERVAL,
            storage_uri: None,
        }
    }

    pub fn with_max_log_size(mut self, size: u64) -> Self {
        self.max_log_size = size;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_storage_uri(mut self, uri: impl Into<String>) -> Self {
        self.storage_uri = Some(uri.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identity("capture id", &self.capture_id)?;
        validate_identity("changefeed id", &self.changefeed_id)?;
        if self.max_log_size == 0 {
            return Err(RedoError::InvalidConfig(
                "max_log_size must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval.is_zero() || self.gc_interval.is_zero() {
            return Err(RedoError::InvalidConfig(
                "flush and gc intervals must be greater than 0".to_string(),
            ));
        }
        if let Some(uri) = &self.storage_uri {
            StorageUri::parse(uri)?;
        }
        Ok(())
    }

    fn segment_config(&self, kind: LogKind) -> SegmentWriterConfig {
        SegmentWriterConfig::new(&self.dir, &self.capture_id, &self.changefeed_id, kind)
            .with_max_segment_size(self.max_log_size)
            .with_buffer_size(self.buffer_size)
    }
}

/// Write counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogWriterStats {
    pub rows_written: u64,
    pub ddls_written: u64,
    pub bytes_written: u64,
    pub flushes: u64,
}

/// Persists row changes, DDL events and progress markers of one changefeed.
pub struct LogWriter {
    config: LogWriterConfig,
    row: Arc<SegmentWriter>,
    ddl: Arc<SegmentWriter>,
    meta: Arc<MetaPersister>,
    retention: Arc<RetentionController>,
    stopped: AtomicBool,
    /// Cancels background tasks; child of the token given to `spawn_background`.
    background: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
    stats_rows: AtomicU64,
    stats_ddls: AtomicU64,
    stats_bytes: AtomicU64,
    stats_flushes: AtomicU64,
}

impl LogWriter {
    /// Opens the writer, recovering leftover segments and seeding the meta
    /// from the most advanced meta file already on disk.
    pub fn open(config: LogWriterConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| RedoError::file_op("create", &config.dir, e))?;

        let storage: Option<Arc<dyn ExternalStorage>> = match &config.storage_uri {
            Some(uri) => Some(StorageUri::parse(uri)?.open()?),
            None => None,
        };

        let row = Arc::new(SegmentWriter::open(
            config.segment_config(LogKind::Row),
            storage.clone(),
        )?);
        let ddl = Arc::new(SegmentWriter::open(
            config.segment_config(LogKind::Ddl),
            storage.clone(),
        )?);

        let (name, initial) = match LogMeta::load_latest(&config.dir, &config.changefeed_id) {
            Ok((name, meta)) if name.prefix == config.capture_id => (name, meta),
            Ok((_, meta)) => (Self::new_meta_name(&config), meta),
            Err(e) if e.is_not_found() => (Self::new_meta_name(&config), LogMeta::default()),
            Err(e) => return Err(e),
        };
        let meta = Arc::new(MetaPersister::new(&config.dir, name, initial, storage.clone()));
        meta.flush()?;

        let retention = Arc::new(RetentionController::new(
            &config.dir,
            &config.changefeed_id,
            meta.clone(),
            storage,
        ));

        tracing::info!(
            "Redo log writer opened for changefeed {} at {} (checkpoint_ts={}, resolved_ts={})",
            config.changefeed_id,
            config.dir.display(),
            meta.checkpoint_ts(),
            meta.resolved_ts()
        );

        Ok(Self {
            config,
            row,
            ddl,
            meta,
            retention,
            stopped: AtomicBool::new(false),
            background: Mutex::new(None),
            stats_rows: AtomicU64::new(0),
            stats_ddls: AtomicU64::new(0),
            stats_bytes: AtomicU64::new(0),
            stats_flushes: AtomicU64::new(0),
        })
    }

    fn new_meta_name(config: &LogWriterConfig) -> MetaName {
        MetaName {
            prefix: config.capture_id.clone(),
            changefeed_id: config.changefeed_id.clone(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn config(&self) -> &LogWriterConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn check(&self, token: &CancellationToken) -> Result<()> {
        check_cancelled(token)?;
        if self.is_stopped() {
            return Err(RedoError::Stopped);
        }
        Ok(())
    }

    /// Appends `rows` of one table in input order.
    ///
    /// Returns the largest commit-ts among `rows` (0 when empty). The table
    /// offset is updated in memory only; it becomes durable with the next
    /// meta flush.
    pub fn write_log(
        &self,
        token: &CancellationToken,
        table_id: TableId,
        rows: Vec<RowChangedEvent>,
    ) -> Result<u64> {
        self.check(token)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let records = rows
            .into_iter()
            .map(|row| RedoRecord::from_log(&RedoLog::Row(row)))
            .collect::<Result<Vec<_>>>()?;

        let mut max_commit_ts = 0;
        let mut bytes = 0;
        for record in &records {
            self.row.append(record)?;
            max_commit_ts = max_commit_ts.max(record.commit_ts());
            bytes += record.disk_size() as u64;
        }

        self.meta.set_table_offset(table_id, max_commit_ts);
        self.stats_rows
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        self.stats_bytes.fetch_add(bytes, Ordering::Relaxed);

        Ok(max_commit_ts)
    }

    /// Appends a DDL event.
    pub fn send_ddl(&self, token: &CancellationToken, ddl: DdlEvent) -> Result<()> {
        self.check(token)?;
        let record = RedoRecord::from_log(&RedoLog::Ddl(ddl))?;
        self.ddl.append(&record)?;
        self.stats_ddls.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes
            .fetch_add(record.disk_size() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Durability barrier: bumps the table offset, then flushes both
    /// segment streams and the meta.
    pub fn flush_log(&self, token: &CancellationToken, table_id: TableId, ts: u64) -> Result<()> {
        self.check(token)?;
        self.meta.set_table_offset(table_id, ts);
        self.flush_all()
    }

    /// Advances the checkpoint and makes everything written so far durable.
    pub fn emit_checkpoint_ts(&self, token: &CancellationToken, ts: u64) -> Result<()> {
        self.check(token)?;
        self.meta.set_checkpoint_ts(ts);
        self.flush_all()
    }

    /// Advances the resolved ts and makes everything written so far durable.
    pub fn emit_resolved_ts(&self, token: &CancellationToken, ts: u64) -> Result<()> {
        self.check(token)?;
        self.meta.set_resolved_ts(ts);
        self.flush_all()
    }

    /// Point-in-time read of table offsets; unknown tables are omitted.
    pub fn get_current_offset(
        &self,
        token: &CancellationToken,
        table_ids: &[TableId],
    ) -> Result<HashMap<TableId, u64>> {
        self.check(token)?;
        Ok(self.meta.table_offsets(table_ids))
    }

    /// Runs one retention pass immediately.
    pub fn gc(&self, token: &CancellationToken) -> Result<RetentionReport> {
        self.check(token)?;
        self.retention.tick()
    }

    /// Returns a copy of the in-memory meta.
    pub fn meta(&self) -> LogMeta {
        self.meta.snapshot()
    }

    pub fn stats(&self) -> LogWriterStats {
        LogWriterStats {
            rows_written: self.stats_rows.load(Ordering::Relaxed),
            ddls_written: self.stats_ddls.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes.load(Ordering::Relaxed),
            flushes: self.stats_flushes.load(Ordering::Relaxed),
        }
    }

    fn flush_all(&self) -> Result<()> {
        self.row.flush()?;
        self.ddl.flush()?;
        self.meta.flush()?;
        self.stats_flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Starts the periodic segment flush and retention tasks.
    ///
    /// Both tasks stop when `parent` is cancelled or the writer is closed.
    /// Must be called from within a tokio runtime.
    pub fn spawn_background(&self, parent: &CancellationToken) -> Result<()> {
        if self.is_stopped() {
            return Err(RedoError::Stopped);
        }
        let mut background = self.background.lock();
        if background.is_some() {
            return Ok(());
        }

        let token = parent.child_token();

        let retention = self.retention.clone();
        let gc_interval = self.config.gc_interval;
        let gc_token = token.clone();
        let gc_task = tokio::spawn(async move { retention.run(gc_interval, gc_token).await });

        let row = self.row.clone();
        let ddl = self.ddl.clone();
        let meta = self.meta.clone();
        let flush_interval = self.config.flush_interval;
        let flush_token = token.clone();
        let flush_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = flush_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for writer in [&row, &ddl] {
                    if let Err(e) = writer.flush() {
                        tracing::error!(
                            "Background flush of {} segment failed: {}",
                            writer.kind(),
                            e
                        );
                    }
                }
                if let Err(e) = meta.flush() {
                    tracing::error!("Background flush of redo meta failed: {}", e);
                }
            }
        });

        *background = Some((token, vec![gc_task, flush_task]));
        Ok(())
    }

    /// Stops the writer.
    ///
    /// Cancels background tasks, finalizes both segment streams and flushes
    /// the meta. Errors are aggregated. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some((token, _)) = self.background.lock().as_ref() {
            token.cancel();
        }

        let mut errors = Vec::new();
        for writer in [&self.row, &self.ddl] {
            if let Err(e) = writer.close() {
                tracing::error!("Failed to close {} segment writer: {}", writer.kind(), e);
                errors.push(e);
            }
        }
        if let Err(e) = self.meta.flush() {
            errors.push(e);
        }

        tracing::info!(
            "Redo log writer closed for changefeed {} (checkpoint_ts={})",
            self.config.changefeed_id,
            self.meta.checkpoint_ts()
        );
        RedoError::collect(errors)
    }

    /// Waits for background tasks to exit after `close` or parent cancellation.
    pub async fn join_background(&self) {
        let handles = match self.background.lock().as_mut() {
            Some((_, handles)) => std::mem::take(handles),
            None => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Redo background task failed: {}", e);
            }
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close redo log writer: {}", e);
        }
    }
}
