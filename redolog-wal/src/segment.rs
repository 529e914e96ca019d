//! Rotating segment writer.
//!
//! One writer owns one stream of segments (row or DDL) for a changefeed:
//! - Append: records are buffered into the active `.log.tmp` segment
//! - Rotation: a new segment is started before the active one would exceed
//!   its size limit
//! - Close: the active segment is renamed to its final name, which carries
//!   the largest commit-ts it holds

use crate::entry::RedoRecord;
use crate::error::{RedoError, Result};
use crate::model::LogKind;
use crate::naming::{SegmentName, SegmentScanner, SegmentState};
use crate::recovery;
use crate::storage::{self, ExternalStorage};
use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_SEGMENT_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fsyncs a directory so renames and deletions inside it are durable.
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path).map_err(|e| RedoError::file_op("open", path, e))?;
        dir.sync_all()
            .map_err(|e| RedoError::file_op("sync", path, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Deletes a closed segment locally and from the mirror.
///
/// Active segments are refused.
pub fn remove_closed_segment(
    path: &Path,
    name: &SegmentName,
    storage: Option<&dyn ExternalStorage>,
) -> Result<()> {
    if !name.is_closed() {
        return Err(RedoError::Storage(format!(
            "refusing to delete active segment {}",
            path.display()
        )));
    }
    std::fs::remove_file(path).map_err(|e| RedoError::file_op("delete", path, e))?;
    if let Some(storage) = storage {
        storage.delete(&name.file_name())?;
    }
    Ok(())
}

/// Segment writer configuration.
#[derive(Debug, Clone)]
pub struct SegmentWriterConfig {
    /// Directory holding the segments.
    pub dir: PathBuf,
    /// Capture prefix in file names.
    pub prefix: String,
    pub changefeed_id: String,
    pub kind: LogKind,
    /// Maximum segment size before rotation.
    pub max_segment_size: u64,
    /// In-memory write buffer size.
    pub buffer_size: usize,
}

impl SegmentWriterConfig {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        changefeed_id: impl Into<String>,
        kind: LogKind,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            changefeed_id: changefeed_id.into(),
            kind,
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// The segment currently being appended to.
struct ActiveSegment {
    name: SegmentName,
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    records: u64,
    max_commit_ts: u64,
    sorted: bool,
}

impl ActiveSegment {
    fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| RedoError::file_op("write", &self.path, e))?;
        self.file
            .get_ref()
            .sync_data()
            .map_err(|e| RedoError::file_op("sync", &self.path, e))?;
        Ok(())
    }
}

struct Inner {
    active: Option<ActiveSegment>,
    /// Creation stamp of the most recently created segment.
    last_created_at: i64,
}

/// Appends framed records to a rotating stream of segment files.
pub struct SegmentWriter {
    config: SegmentWriterConfig,
    storage: Option<Arc<dyn ExternalStorage>>,
    inner: Mutex<Inner>,
    /// Largest commit-ts ever appended through this writer.
    max_commit_ts: AtomicU64,
    stopped: AtomicBool,
}

impl SegmentWriter {
    /// Opens a writer, finalizing segments left active by a previous process.
    pub fn open(
        config: SegmentWriterConfig,
        storage: Option<Arc<dyn ExternalStorage>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| RedoError::file_op("create", &config.dir, e))?;

        let writer = Self {
            config,
            storage,
            inner: Mutex::new(Inner {
                active: None,
                last_created_at: 0,
            }),
            max_commit_ts: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        };

        writer.recover_leftovers()?;

        let latest = SegmentScanner::latest_created_at(
            &writer.config.dir,
            &writer.config.changefeed_id,
            writer.config.kind,
        )?;
        writer.inner.lock().last_created_at = latest.unwrap_or(0);

        Ok(writer)
    }

    /// Finalizes `.log.tmp` files written by an earlier instance of this writer.
    fn recover_leftovers(&self) -> Result<()> {
        let segments = SegmentScanner::list_segments(
            &self.config.dir,
            &self.config.changefeed_id,
            Some(self.config.kind),
        )?;

        for (path, name) in segments {
            if name.is_closed() || name.prefix != self.config.prefix {
                continue;
            }

            let scan = recovery::scan_file(&path)?;
            if let Some(problem) = &scan.problem {
                tracing::warn!(
                    "Truncating torn tail of {} at offset {}: {}",
                    path.display(),
                    scan.valid_len,
                    problem
                );
                recovery::truncate_to(&path, scan.valid_len)?;
            }

            if scan.valid_records == 0 {
                std::fs::remove_file(&path).map_err(|e| RedoError::file_op("delete", &path, e))?;
                continue;
            }

            let state = if scan.sorted {
                SegmentState::Sorted
            } else {
                SegmentState::Closed
            };
            let final_name = name.finalized(scan.max_commit_ts, state);
            self.install(&path, &name, &final_name)?;
            self.max_commit_ts
                .fetch_max(scan.max_commit_ts, Ordering::SeqCst);
            tracing::info!(
                "Recovered {} segment {} ({} records)",
                self.config.kind,
                final_name.file_name(),
                scan.valid_records
            );
        }

        Ok(())
    }

    /// Returns the writer configuration.
    pub fn config(&self) -> &SegmentWriterConfig {
        &self.config
    }

    pub fn kind(&self) -> LogKind {
        self.config.kind
    }

    /// Returns whether the writer has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Largest commit-ts appended so far.
    pub fn max_commit_ts(&self) -> u64 {
        self.max_commit_ts.load(Ordering::SeqCst)
    }

    /// Path of the active segment, if one is open.
    pub fn active_path(&self) -> Option<PathBuf> {
        self.inner.lock().active.as_ref().map(|a| a.path.clone())
    }

    /// Appends a record, returning its offset within the active segment.
    pub fn append(&self, record: &RedoRecord) -> Result<u64> {
        if self.is_stopped() {
            return Err(RedoError::Stopped);
        }

        let encoded = record.encode()?;
        let len = encoded.len() as u64;
        let commit_ts = record.commit_ts();

        let mut inner = self.inner.lock();

        let needs_rotation = inner
            .active
            .as_ref()
            .is_some_and(|a| a.size > 0 && a.size + len > self.config.max_segment_size);
        if needs_rotation {
            self.finalize_active(&mut inner)?;
        }
        if inner.active.is_none() {
            let active = self.create_segment(&mut inner)?;
            inner.active = Some(active);
        }

        let active = inner
            .active
            .as_mut()
            .ok_or_else(|| RedoError::Storage("active segment missing".to_string()))?;
        let offset = active.size;

        active
            .file
            .write_all(&encoded)
            .map_err(|e| RedoError::file_op("write", &active.path, e))?;
        active.size += len;
        active.records += 1;
        if commit_ts < active.max_commit_ts {
            active.sorted = false;
        }
        active.max_commit_ts = active.max_commit_ts.max(commit_ts);

        self.max_commit_ts.fetch_max(commit_ts, Ordering::SeqCst);

        Ok(offset)
    }

    /// Forces buffered bytes of the active segment to durable storage.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(active) = inner.active.as_mut() {
            active.flush()?;
            if let Some(storage) = &self.storage {
                storage::upload_file(storage.as_ref(), &active.path)?;
            }
        }
        Ok(())
    }

    /// Closes the active segment; the next append starts a new one.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.finalize_active(&mut inner)
    }

    /// Stops the writer and finalizes the active segment.
    ///
    /// Closing an already closed writer is a no-op.
    pub fn close(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        let mut inner = self.inner.lock();
        self.finalize_active(&mut inner)
    }

    /// Lists this writer's closed segments, oldest first.
    pub fn closed_segments(&self) -> Result<Vec<(PathBuf, SegmentName)>> {
        SegmentScanner::list_closed_segments(
            &self.config.dir,
            &self.config.changefeed_id,
            Some(self.config.kind),
        )
    }

    fn create_segment(&self, inner: &mut Inner) -> Result<ActiveSegment> {
        let now = chrono::Utc::now().timestamp();
        let created_at = now.max(inner.last_created_at + 1);

        let name = SegmentName {
            prefix: self.config.prefix.clone(),
            changefeed_id: self.config.changefeed_id.clone(),
            created_at,
            kind: self.config.kind,
            ts: self.max_commit_ts(),
            state: SegmentState::Active,
        };
        let path = self.config.dir.join(name.file_name());
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| RedoError::file_op("create", &path, e))?;

        inner.last_created_at = created_at;
        tracing::debug!("Opened {} segment {}", self.config.kind, path.display());

        Ok(ActiveSegment {
            name,
            path,
            file: BufWriter::with_capacity(self.config.buffer_size, file),
            size: 0,
            records: 0,
            max_commit_ts: 0,
            sorted: true,
        })
    }

    fn finalize_active(&self, inner: &mut Inner) -> Result<()> {
        let Some(mut active) = inner.active.take() else {
            return Ok(());
        };

        if let Err(e) = active.flush() {
            // Keep the segment so a later close can retry.
            inner.active = Some(active);
            return Err(e);
        }

        if active.records == 0 {
            drop(active.file);
            std::fs::remove_file(&active.path)
                .map_err(|e| RedoError::file_op("delete", &active.path, e))?;
            if let Some(storage) = &self.storage {
                storage.delete(&active.name.file_name())?;
            }
            return Ok(());
        }

        let state = if active.sorted {
            SegmentState::Sorted
        } else {
            SegmentState::Closed
        };
        let final_name = active.name.finalized(active.max_commit_ts, state);
        drop(active.file);
        self.install(&active.path, &active.name, &final_name)?;

        tracing::info!(
            "Closed {} segment {} ({} records, {} bytes)",
            self.config.kind,
            final_name.file_name(),
            active.records,
            active.size
        );
        Ok(())
    }

    /// Renames an active file to its final name and mirrors it.
    fn install(&self, path: &Path, active: &SegmentName, final_name: &SegmentName) -> Result<()> {
        let target = self.config.dir.join(final_name.file_name());
        std::fs::rename(path, &target).map_err(|e| RedoError::file_op("rename", &target, e))?;
        sync_dir(&self.config.dir)?;

        if let Some(storage) = &self.storage {
            storage::upload_file(storage.as_ref(), &target)?;
            storage.delete(&active.file_name())?;
        }
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if !self.is_stopped() {
            if let Err(e) = self.close() {
                tracing::error!(
                    "Failed to close {} segment writer: {}",
                    self.config.kind,
                    e
                );
            }
        }
    }
}
