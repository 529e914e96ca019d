//! Read-side facade of the redo log.
//!
//! A [`LogReader`] lives for one recovery pass: it loads the meta, opens the
//! changefeed's segments for a `[start_ts, end_ts)` window and streams row and
//! DDL records in commit-ts order.
//!
//! Segments a writer had not closed yet (for instance because its process
//! died) are read up to their last complete record.

mod merge;
mod segment_reader;

pub use merge::MergeReader;
pub use segment_reader::{sort_segment, ActiveSegmentSource, RecordSource, SegmentReader};

use crate::check_cancelled;
use crate::entry::RedoRecord;
use crate::error::{RedoError, Result};
use crate::meta::LogMeta;
use crate::model::{DdlEvent, LogKind, RedoLog, RowChangedEvent};
use crate::naming::{validate_identity, MetaName, SegmentName, SegmentScanner, SegmentState};
use crate::storage::{self, ExternalStorage, Refresh, StorageUri};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Log reader configuration.
#[derive(Debug, Clone)]
pub struct LogReaderConfig {
    /// Directory holding segments and meta (download target with a mirror).
    pub dir: PathBuf,
    pub changefeed_id: String,
    /// Where sorted copies of unsorted segments are written; defaults to `dir`.
    pub work_dir: Option<PathBuf>,
    pub storage_uri: Option<String>,
}

impl LogReaderConfig {
    pub fn new(dir: impl Into<PathBuf>, changefeed_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            changefeed_id: changefeed_id.into(),
            work_dir: None,
            storage_uri: None,
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_storage_uri(mut self, uri: impl Into<String>) -> Self {
        self.storage_uri = Some(uri.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identity("changefeed id", &self.changefeed_id)?;
        if let Some(uri) = &self.storage_uri {
            StorageUri::parse(uri)?;
        }
        Ok(())
    }

    fn work_dir(&self) -> &PathBuf {
        self.work_dir.as_ref().unwrap_or(&self.dir)
    }
}

/// Replays a changefeed's redo log.
pub struct LogReader {
    config: LogReaderConfig,
    storage: Option<Arc<dyn ExternalStorage>>,
    rows: Option<MergeReader>,
    ddls: Option<MergeReader>,
    window: Option<(u64, u64)>,
}

impl LogReader {
    pub fn new(config: LogReaderConfig) -> Result<Self> {
        config.validate()?;
        let storage = match &config.storage_uri {
            Some(uri) => Some(StorageUri::parse(uri)?.open()?),
            None => None,
        };
        Ok(Self {
            config,
            storage,
            rows: None,
            ddls: None,
            window: None,
        })
    }

    pub fn config(&self) -> &LogReaderConfig {
        &self.config
    }

    /// Current `[start_ts, end_ts)` window, if the reader has been reset.
    pub fn window(&self) -> Option<(u64, u64)> {
        self.window
    }

    /// Fetches the changefeed's segments and meta files from the mirror.
    ///
    /// Meta files and active segments change in place, so local copies of
    /// them are refreshed when the mirror holds a later version.
    fn download(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let changefeed_id = self.config.changefeed_id.as_str();
        let fetched = storage::download_matching(storage.as_ref(), &self.config.dir, |name| {
            if let Some(segment) = SegmentName::parse(name) {
                if segment.changefeed_id != changefeed_id {
                    return None;
                }
                return Some(match segment.state {
                    SegmentState::Active => Refresh::WhenLonger,
                    _ => Refresh::Never,
                });
            }
            MetaName::parse(name)
                .filter(|meta| meta.changefeed_id == changefeed_id)
                .map(|_| Refresh::WhenNewer(meta_is_newer))
        })?;
        if fetched > 0 {
            tracing::info!(
                "Downloaded {} redo files for changefeed {}",
                fetched,
                changefeed_id
            );
        }
        Ok(())
    }

    /// Loads the full meta of the changefeed.
    pub fn read_log_meta(&self, token: &CancellationToken) -> Result<LogMeta> {
        check_cancelled(token)?;
        self.download()?;
        LogMeta::load(&self.config.dir, &self.config.changefeed_id)
    }

    /// Returns `(checkpoint_ts, resolved_ts)`.
    pub fn read_meta(&self, token: &CancellationToken) -> Result<(u64, u64)> {
        let meta = self.read_log_meta(token)?;
        Ok((meta.checkpoint_ts, meta.resolved_ts))
    }

    /// Opens the segments relevant to `[start_ts, end_ts)`.
    ///
    /// An invalid window is rejected before any state changes. Fails with
    /// `NotFound` when no meta exists or when part of the window may have
    /// been garbage collected.
    pub fn reset_reader(
        &mut self,
        token: &CancellationToken,
        start_ts: u64,
        end_ts: u64,
    ) -> Result<()> {
        check_cancelled(token)?;
        if start_ts >= end_ts {
            return Err(RedoError::InvalidWindow { start_ts, end_ts });
        }

        self.close()?;
        self.download()?;

        let meta = LogMeta::load(&self.config.dir, &self.config.changefeed_id)?;
        self.prune_local_copies(meta.gc_ts);
        if meta.gc_ts > 0 && start_ts <= meta.gc_ts {
            return Err(RedoError::NotFound(format!(
                "records up to ts {} of changefeed '{}' were garbage collected, cannot read from {}",
                meta.gc_ts, self.config.changefeed_id, start_ts
            )));
        }

        let rows = self.open_merge(LogKind::Row, start_ts, end_ts)?;
        let ddls = match self.open_merge(LogKind::Ddl, start_ts, end_ts) {
            Ok(ddls) => ddls,
            Err(e) => {
                let mut rows = rows;
                if let Err(close_err) = rows.close() {
                    tracing::warn!("Failed to close row segments: {}", close_err);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Redo reader reset to [{}, {}): {} row segments, {} ddl segments",
            start_ts,
            end_ts,
            rows.source_count(),
            ddls.source_count()
        );

        self.rows = Some(rows);
        self.ddls = Some(ddls);
        self.window = Some((start_ts, end_ts));
        Ok(())
    }

    /// Lists the segments of one kind that may hold records at or above
    /// `start_ts`, one file per segment: a sorted copy is preferred over an
    /// unsorted one, and a closed segment over its active leftover.
    fn relevant_segments(
        &self,
        kind: LogKind,
        start_ts: u64,
    ) -> Result<Vec<(PathBuf, SegmentName)>> {
        let changefeed_id = &self.config.changefeed_id;
        let mut candidates =
            SegmentScanner::list_segments(&self.config.dir, changefeed_id, Some(kind))?;
        if let Some(work_dir) = self.separate_work_dir() {
            candidates.extend(SegmentScanner::list_closed_segments(
                work_dir,
                changefeed_id,
                Some(kind),
            )?);
        }

        // Creation stamps are unique per writer and kind
        let mut by_identity: BTreeMap<(i64, String), (PathBuf, SegmentName)> = BTreeMap::new();
        for (path, name) in candidates {
            let key = (name.created_at, name.prefix.clone());
            let replace = match by_identity.get(&key) {
                Some((_, existing)) => state_rank(name.state) > state_rank(existing.state),
                None => true,
            };
            if replace {
                by_identity.insert(key, (path, name));
            }
        }

        // The ts of an active segment does not bound its records
        Ok(by_identity
            .into_values()
            .filter(|(_, name)| !name.is_closed() || name.ts >= start_ts)
            .collect())
    }

    fn open_merge(&self, kind: LogKind, start_ts: u64, end_ts: u64) -> Result<MergeReader> {
        let mut sources: Vec<Box<dyn RecordSource>> = Vec::new();
        for (path, name) in self.relevant_segments(kind, start_ts)? {
            sources.push(self.open_source(path, &name)?);
        }
        MergeReader::new(sources, start_ts, end_ts)
    }

    fn open_source(&self, path: PathBuf, name: &SegmentName) -> Result<Box<dyn RecordSource>> {
        match name.state {
            SegmentState::Sorted => Ok(Box::new(SegmentReader::open(path)?)),
            SegmentState::Closed => {
                let sorted = sort_segment(&path, name, self.config.work_dir())?;
                Ok(Box::new(SegmentReader::open(sorted)?))
            }
            SegmentState::Active => match ActiveSegmentSource::open(path) {
                Ok(source) => Ok(Box::new(source)),
                // Closed by its writer since the directory was listed
                Err(RedoError::FileOperation { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    match self.closed_counterpart(name)? {
                        Some((path, closed)) => self.open_source(path, &closed),
                        None => Err(RedoError::NotFound(format!(
                            "segment '{}' disappeared while opening it",
                            name.file_name()
                        ))),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }

    fn closed_counterpart(&self, name: &SegmentName) -> Result<Option<(PathBuf, SegmentName)>> {
        Ok(SegmentScanner::list_closed_segments(
            &self.config.dir,
            &self.config.changefeed_id,
            Some(name.kind),
        )?
        .into_iter()
        .find(|(_, closed)| closed.prefix == name.prefix && closed.created_at == name.created_at))
    }

    fn separate_work_dir(&self) -> Option<&Path> {
        let work_dir = self.config.work_dir();
        (work_dir != &self.config.dir && work_dir.exists()).then_some(work_dir.as_path())
    }

    /// Deletes local files no reader can use any more: segments at or below
    /// `gc_ts` in directories retention does not manage (the scratch
    /// directory, and the download directory when a mirror is used), and
    /// active segment copies whose closed segment is present.
    ///
    /// Failures are logged; the files are retried on the next reset.
    fn prune_local_copies(&self, gc_ts: u64) {
        let changefeed_id = &self.config.changefeed_id;
        let mut collected_dirs: Vec<&Path> = Vec::new();
        if let Some(work_dir) = self.separate_work_dir() {
            collected_dirs.push(work_dir);
        }
        if self.storage.is_some() {
            collected_dirs.push(&self.config.dir);
        }

        let mut stale = Vec::new();
        if gc_ts > 0 {
            for dir in collected_dirs {
                match SegmentScanner::list_closed_segments(dir, changefeed_id, None) {
                    Ok(segments) => stale.extend(
                        segments
                            .into_iter()
                            .filter(|(_, name)| name.ts <= gc_ts)
                            .map(|(path, _)| path),
                    ),
                    Err(e) => tracing::warn!("Failed to list {}: {}", dir.display(), e),
                }
            }
        }

        match SegmentScanner::list_segments(&self.config.dir, changefeed_id, None) {
            Ok(segments) => {
                let closed: HashSet<(String, i64, LogKind)> = segments
                    .iter()
                    .filter(|(_, name)| name.is_closed())
                    .map(|(_, name)| (name.prefix.clone(), name.created_at, name.kind))
                    .collect();
                stale.extend(
                    segments
                        .into_iter()
                        .filter(|(_, name)| {
                            let key = (name.prefix.clone(), name.created_at, name.kind);
                            !name.is_closed() && closed.contains(&key)
                        })
                        .map(|(path, _)| path),
                );
            }
            Err(e) => tracing::warn!("Failed to list {}: {}", self.config.dir.display(), e),
        }

        let mut removed = 0usize;
        for path in stale {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to delete {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            tracing::info!(
                "Deleted {} stale local segment copies of changefeed {}",
                removed,
                changefeed_id
            );
        }
    }

    fn next_records(
        reader: Option<&mut MergeReader>,
        token: &CancellationToken,
        max_num: usize,
    ) -> Result<Vec<RedoRecord>> {
        check_cancelled(token)?;
        match reader {
            Some(reader) => reader.read_next(max_num),
            None => Err(RedoError::NotFound(
                "no read window; call reset_reader first".to_string(),
            )),
        }
    }

    /// Returns up to `max_num` row changes in commit-ts order.
    ///
    /// A batch shorter than `max_num` means the window is exhausted.
    pub fn read_next_log(
        &mut self,
        token: &CancellationToken,
        max_num: usize,
    ) -> Result<Vec<RowChangedEvent>> {
        Self::next_records(self.rows.as_mut(), token, max_num)?
            .iter()
            .map(|record| match record.to_log()? {
                RedoLog::Row(row) => Ok(row),
                RedoLog::Ddl(_) => Err(unexpected_kind(LogKind::Row, record)),
            })
            .collect()
    }

    /// Returns up to `max_num` DDL events in commit-ts order.
    pub fn read_next_ddl(
        &mut self,
        token: &CancellationToken,
        max_num: usize,
    ) -> Result<Vec<DdlEvent>> {
        Self::next_records(self.ddls.as_mut(), token, max_num)?
            .iter()
            .map(|record| match record.to_log()? {
                RedoLog::Ddl(ddl) => Ok(ddl),
                RedoLog::Row(_) => Err(unexpected_kind(LogKind::Ddl, record)),
            })
            .collect()
    }

    /// Closes every open segment, aggregating errors. Safe to call twice.
    pub fn close(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        for mut reader in [self.rows.take(), self.ddls.take()].into_iter().flatten() {
            if let Err(e) = reader.close() {
                errors.push(e);
            }
        }
        self.window = None;
        RedoError::collect(errors)
    }
}

fn state_rank(state: SegmentState) -> u8 {
    match state {
        SegmentState::Active => 0,
        SegmentState::Closed => 1,
        SegmentState::Sorted => 2,
    }
}

fn meta_is_newer(local: &[u8], remote: &[u8]) -> bool {
    match (LogMeta::decode(local), LogMeta::decode(remote)) {
        (Ok(local), Ok(remote)) => remote.supersedes(&local),
        (Err(_), Ok(_)) => true,
        _ => false,
    }
}

fn unexpected_kind(expected: LogKind, record: &RedoRecord) -> RedoError {
    RedoError::InvalidHeader {
        offset: 0,
        reason: format!(
            "{:?} record at commit ts {} in a {} segment",
            record.header.record_type,
            record.commit_ts(),
            expected
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaPersister;
    use crate::model::{DdlType, TableName};
    use crate::segment::{SegmentWriter, SegmentWriterConfig};
    use crate::writer::{LogWriter, LogWriterConfig};
    use tempfile::TempDir;

    fn row(table_id: i64, commit_ts: u64) -> RowChangedEvent {
        RowChangedEvent::new(TableName::new("test", "t1", table_id), 1, commit_ts, commit_ts)
    }

    fn write_rows(dir: &std::path::Path, batches: &[(i64, Vec<u64>)]) {
        let writer = LogWriter::open(LogWriterConfig::new(dir, "cp", "test-cf")).unwrap();
        let token = CancellationToken::new();
        for (table_id, timestamps) in batches {
            let rows = timestamps.iter().map(|ts| row(*table_id, *ts)).collect();
            writer.write_log(&token, *table_id, rows).unwrap();
        }
        writer.close().unwrap();
    }

    fn read_all(reader: &mut LogReader) -> Vec<u64> {
        let token = CancellationToken::new();
        let mut out = Vec::new();
        loop {
            let batch = reader.read_next_log(&token, 3).unwrap();
            let short = batch.len() < 3;
            out.extend(batch.iter().map(|r| r.commit_ts));
            if short {
                return out;
            }
        }
    }

    #[test]
    fn test_read_meta_missing() {
        let dir = TempDir::new().unwrap();
        let reader = LogReader::new(LogReaderConfig::new(dir.path(), "test-cf")).unwrap();
        let err = reader.read_meta(&CancellationToken::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_reads_interleaved_tables_in_order() {
        let dir = TempDir::new().unwrap();
        // Two tables interleave inside one segment, so it closes unsorted
        write_rows(dir.path(), &[(1, vec![10, 30]), (2, vec![5, 20, 40])]);

        let mut reader = LogReader::new(LogReaderConfig::new(dir.path(), "test-cf")).unwrap();
        let token = CancellationToken::new();
        reader.reset_reader(&token, 1, 100).unwrap();
        assert_eq!(read_all(&mut reader), vec![5, 10, 20, 30, 40]);

        // The sorted copy is used on the next reset
        reader.reset_reader(&token, 20, 40).unwrap();
        assert_eq!(read_all(&mut reader), vec![20, 30]);
        assert_eq!(reader.window(), Some((20, 40)));
        reader.close().unwrap();
        reader.close().unwrap();
    }

    #[test]
    fn test_invalid_window_keeps_state() {
        let dir = TempDir::new().unwrap();
        write_rows(dir.path(), &[(1, vec![5, 6])]);

        let mut reader = LogReader::new(LogReaderConfig::new(dir.path(), "test-cf")).unwrap();
        let token = CancellationToken::new();
        reader.reset_reader(&token, 1, 10).unwrap();

        for (start, end) in [(10, 10), (11, 10)] {
            assert!(matches!(
                reader.reset_reader(&token, start, end),
                Err(RedoError::InvalidWindow { .. })
            ));
        }
        assert_eq!(reader.window(), Some((1, 10)));
        assert_eq!(read_all(&mut reader), vec![5, 6]);
    }

    #[test]
    fn test_read_without_reset() {
        let dir = TempDir::new().unwrap();
        let mut reader = LogReader::new(LogReaderConfig::new(dir.path(), "test-cf")).unwrap();
        assert!(reader
            .read_next_ddl(&CancellationToken::new(), 1)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_cancelled_read() {
        let dir = TempDir::new().unwrap();
        write_rows(dir.path(), &[(1, vec![5])]);
        let mut reader = LogReader::new(LogReaderConfig::new(dir.path(), "test-cf")).unwrap();
        let token = CancellationToken::new();
        reader.reset_reader(&token, 1, 10).unwrap();

        token.cancel();
        assert!(matches!(
            reader.read_next_log(&token, 1),
            Err(RedoError::Cancelled)
        ));
        assert!(matches!(
            reader.reset_reader(&token, 1, 10),
            Err(RedoError::Cancelled)
        ));
    }

    #[test]
    fn test_ddl_stream() {
        let dir = TempDir::new().unwrap();
        {
            let writer =
                LogWriter::open(LogWriterConfig::new(dir.path(), "cp", "test-cf")).unwrap();
            let token = CancellationToken::new();
            for ts in [3, 7] {
                let ddl = DdlEvent::new("TRUNCATE TABLE t1", DdlType::TruncateTable, ts, ts);
                writer.send_ddl(&token, ddl).unwrap();
            }
            writer.close().unwrap();
        }

        let mut reader = LogReader::new(LogReaderConfig::new(dir.path(), "test-cf")).unwrap();
        let token = CancellationToken::new();
        reader.reset_reader(&token, 1, 10).unwrap();
        let ddls = reader.read_next_ddl(&token, 10).unwrap();
        assert_eq!(ddls.iter().map(|d| d.commit_ts).collect::<Vec<_>>(), vec![3, 7]);
        assert!(reader.read_next_log(&token, 10).unwrap().is_empty());
    }

    #[test]
    fn test_reads_through_mirror() {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        let uri = format!("file://{}", remote.display());

        let writer = LogWriter::open(
            LogWriterConfig::new(dir.path().join("writer"), "cp", "test-cf").with_storage_uri(&uri),
        )
        .unwrap();
        let token = CancellationToken::new();
        writer.write_log(&token, 1, vec![row(1, 5), row(1, 6)]).unwrap();
        writer.emit_checkpoint_ts(&token, 5).unwrap();
        writer.close().unwrap();

        let mut reader = LogReader::new(
            LogReaderConfig::new(dir.path().join("reader"), "test-cf").with_storage_uri(&uri),
        )
        .unwrap();
        assert_eq!(reader.read_meta(&token).unwrap(), (5, 5));
        reader.reset_reader(&token, 1, 10).unwrap();
        assert_eq!(read_all(&mut reader), vec![5, 6]);
    }

    #[test]
    fn test_reads_active_segment_left_by_crash() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let writer = LogWriter::open(LogWriterConfig::new(dir.path(), "cp", "test-cf")).unwrap();
        writer.write_log(&token, 1, vec![row(1, 5), row(1, 6)]).unwrap();
        writer.write_log(&token, 2, vec![row(2, 3)]).unwrap();
        writer.emit_checkpoint_ts(&token, 5).unwrap();
        std::mem::forget(writer);

        // A record torn by the crash
        let (active, _) = SegmentScanner::list_segments(dir.path(), "test-cf", Some(LogKind::Row))
            .unwrap()
            .into_iter()
            .find(|(_, name)| !name.is_closed())
            .unwrap();
        let mut data = std::fs::read(&active).unwrap();
        data.extend_from_slice(b"RDLG\x01\x00");
        std::fs::write(&active, data).unwrap();

        let mut reader = LogReader::new(LogReaderConfig::new(dir.path(), "test-cf")).unwrap();
        assert_eq!(reader.read_meta(&token).unwrap(), (5, 5));
        reader.reset_reader(&token, 1, 10).unwrap();
        assert_eq!(read_all(&mut reader), vec![3, 5, 6]);

        // Once a writer finalizes the leftover, the same records are read once
        LogWriter::open(LogWriterConfig::new(dir.path(), "cp", "test-cf"))
            .unwrap()
            .close()
            .unwrap();
        reader.reset_reader(&token, 1, 10).unwrap();
        assert_eq!(read_all(&mut reader), vec![3, 5, 6]);
    }

    #[test]
    fn test_mirror_refreshes_meta_and_active_segments() {
        let dir = TempDir::new().unwrap();
        let uri = format!("file://{}", dir.path().join("remote").display());
        let token = CancellationToken::new();

        let writer = LogWriter::open(
            LogWriterConfig::new(dir.path().join("writer"), "cp", "test-cf").with_storage_uri(&uri),
        )
        .unwrap();
        writer.write_log(&token, 1, vec![row(1, 5)]).unwrap();
        writer.emit_checkpoint_ts(&token, 5).unwrap();

        let reader_dir = dir.path().join("reader");
        let mut reader =
            LogReader::new(LogReaderConfig::new(&reader_dir, "test-cf").with_storage_uri(&uri))
                .unwrap();
        assert_eq!(reader.read_meta(&token).unwrap(), (5, 5));
        reader.reset_reader(&token, 1, 100).unwrap();
        assert_eq!(read_all(&mut reader), vec![5]);

        writer.write_log(&token, 1, vec![row(1, 50)]).unwrap();
        writer.emit_checkpoint_ts(&token, 50).unwrap();
        assert_eq!(reader.read_meta(&token).unwrap(), (50, 50));
        reader.reset_reader(&token, 1, 100).unwrap();
        assert_eq!(read_all(&mut reader), vec![5, 50]);

        // The closed segment replaces the downloaded active copy
        writer.close().unwrap();
        reader.reset_reader(&token, 1, 100).unwrap();
        assert_eq!(read_all(&mut reader), vec![5, 50]);
        let local = SegmentScanner::list_segments(&reader_dir, "test-cf", Some(LogKind::Row))
            .unwrap();
        assert_eq!(local.len(), 1);
        assert!(local[0].1.is_closed());
    }

    #[test]
    fn test_sorted_copies_below_gc_ts_are_pruned() {
        let dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let token = CancellationToken::new();
        write_rows(dir.path(), &[(1, vec![10, 30]), (2, vec![5, 20, 40])]);
        write_rows(dir.path(), &[(1, vec![110, 130]), (2, vec![105, 120, 150])]);

        let config = LogReaderConfig::new(dir.path(), "test-cf").with_work_dir(work.path());
        let mut reader = LogReader::new(config).unwrap();
        reader.reset_reader(&token, 1, 200).unwrap();
        assert_eq!(read_all(&mut reader).len(), 10);
        let copies = |dir: &Path| -> Vec<u64> {
            SegmentScanner::list_closed_segments(dir, "test-cf", None)
                .unwrap()
                .into_iter()
                .map(|(_, name)| name.ts)
                .collect()
        };
        assert_eq!(copies(work.path()), vec![40, 150]);

        let writer = LogWriter::open(LogWriterConfig::new(dir.path(), "cp", "test-cf")).unwrap();
        writer.emit_checkpoint_ts(&token, 100).unwrap();
        assert_eq!(writer.gc(&token).unwrap().gc_ts, 40);
        writer.close().unwrap();

        reader.reset_reader(&token, 41, 200).unwrap();
        assert_eq!(read_all(&mut reader), vec![105, 110, 120, 130, 150]);
        assert_eq!(copies(work.path()), vec![150]);
    }

    #[test]
    fn test_window_below_gc_ts_is_not_found() {
        let dir = TempDir::new().unwrap();
        let name = MetaName {
            prefix: "cp".to_string(),
            changefeed_id: "test-cf".to_string(),
            created_at: 1,
        };
        let meta = MetaPersister::new(dir.path(), name, LogMeta::default(), None);
        meta.set_checkpoint_ts(100);
        meta.set_gc_ts(50);
        meta.flush().unwrap();

        let segments = SegmentWriter::open(
            SegmentWriterConfig::new(dir.path(), "cp", "test-cf", LogKind::Row),
            None,
        )
        .unwrap();
        segments
            .append(&RedoRecord::from_log(&RedoLog::Row(row(1, 120))).unwrap())
            .unwrap();
        segments.close().unwrap();

        let mut reader = LogReader::new(LogReaderConfig::new(dir.path(), "test-cf")).unwrap();
        let token = CancellationToken::new();
        assert!(reader.reset_reader(&token, 50, 200).unwrap_err().is_not_found());
        reader.reset_reader(&token, 51, 200).unwrap();
        assert_eq!(read_all(&mut reader), vec![120]);
    }
}
