//! Checkpoint, resolved-ts and per-table offset persistence.
//!
//! The meta file holds a single framed record (see [`crate::entry`]) whose
//! payload is the JSON encoded [`LogMeta`]. It is replaced atomically:
//! write `*.meta.tmp`, fsync, rename over the canonical name, fsync the
//! directory. A reader therefore sees either the previous or the new meta.

use crate::entry::{RecordType, RedoRecord};
use crate::error::{RedoError, Result};
use crate::model::TableId;
use crate::naming::{MetaName, SegmentScanner};
use crate::segment::sync_dir;
use crate::storage::{self, ExternalStorage};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Durable progress of one changefeed's redo log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMeta {
    pub checkpoint_ts: u64,
    pub resolved_ts: u64,
    /// Largest durably written commit-ts per table.
    #[serde(default)]
    pub offsets: BTreeMap<TableId, u64>,
    /// Highest segment ts the retention controller has scheduled for deletion.
    #[serde(default)]
    pub gc_ts: u64,
}

impl LogMeta {
    /// Encodes the meta into a framed record.
    pub fn encode(&self) -> Result<BytesMut> {
        let payload = serde_json::to_vec(self)?;
        RedoRecord::new(RecordType::Meta, self.checkpoint_ts, Bytes::from(payload)).encode()
    }

    /// Decodes a complete meta file.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(data);
        let record = RedoRecord::decode(&mut buf, 0)?.ok_or(RedoError::TruncatedRecord {
            offset: 0,
            available: data.len(),
            needed: RedoRecord::needed_len(data),
        })?;
        if record.header.record_type != RecordType::Meta {
            return Err(RedoError::InvalidHeader {
                offset: 0,
                reason: format!("expected meta record, got {:?}", record.header.record_type),
            });
        }
        if !buf.is_empty() {
            return Err(RedoError::InvalidHeader {
                offset: record.disk_size() as u64,
                reason: format!("{} trailing bytes after meta record", buf.len()),
            });
        }
        let meta: LogMeta = serde_json::from_slice(&record.payload)?;
        Ok(meta)
    }

    /// Returns whether `self` is a later state of `other`: every field has
    /// moved forward or stayed put, and at least one differs.
    pub fn supersedes(&self, other: &LogMeta) -> bool {
        self != other
            && self.checkpoint_ts >= other.checkpoint_ts
            && self.resolved_ts >= other.resolved_ts
            && self.gc_ts >= other.gc_ts
            && other
                .offsets
                .iter()
                .all(|(table_id, ts)| self.offsets.get(table_id).is_some_and(|own| own >= ts))
    }

    /// Loads the most advanced valid meta file of a changefeed in `dir`.
    ///
    /// Files that fail to decode are skipped; `NotFound` is returned when
    /// no valid meta file exists.
    pub fn load(dir: &Path, changefeed_id: &str) -> Result<Self> {
        Self::load_latest(dir, changefeed_id).map(|(_, meta)| meta)
    }

    /// Like [`LogMeta::load`], also returning the name of the chosen file.
    pub fn load_latest(dir: &Path, changefeed_id: &str) -> Result<(MetaName, Self)> {
        let mut best: Option<(PathBuf, MetaName, LogMeta)> = None;

        for (path, name) in SegmentScanner::list_meta_files(dir, changefeed_id)? {
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Skipping unreadable meta file {}: {}", path.display(), e);
                    continue;
                }
            };
            let meta = match LogMeta::decode(&data) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!("Skipping invalid meta file {}: {}", path.display(), e);
                    continue;
                }
            };

            let better = match &best {
                Some((_, _, current)) => {
                    (meta.checkpoint_ts, meta.resolved_ts)
                        > (current.checkpoint_ts, current.resolved_ts)
                }
                None => true,
            };
            if better {
                best = Some((path, name, meta));
            }
        }

        match best {
            Some((path, name, meta)) => {
                tracing::debug!(
                    "Loaded redo meta from {} (checkpoint_ts={}, resolved_ts={})",
                    path.display(),
                    meta.checkpoint_ts,
                    meta.resolved_ts
                );
                Ok((name, meta))
            }
            None => Err(RedoError::NotFound(format!(
                "no valid meta file for changefeed '{}' in {}",
                changefeed_id,
                dir.display()
            ))),
        }
    }
}

/// In-memory [`LogMeta`] with dirty tracking and atomic flushes.
pub struct MetaPersister {
    dir: PathBuf,
    name: MetaName,
    meta: RwLock<LogMeta>,
    dirty: AtomicBool,
    /// Serializes flushes so an older snapshot never replaces a newer one.
    flush_lock: Mutex<()>,
    storage: Option<Arc<dyn ExternalStorage>>,
}

impl MetaPersister {
    pub fn new(
        dir: impl Into<PathBuf>,
        name: MetaName,
        initial: LogMeta,
        storage: Option<Arc<dyn ExternalStorage>>,
    ) -> Self {
        Self {
            dir: dir.into(),
            name,
            meta: RwLock::new(initial),
            dirty: AtomicBool::new(true),
            flush_lock: Mutex::new(()),
            storage,
        }
    }

    /// Canonical path of the meta file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(self.name.file_name())
    }

    pub fn name(&self) -> &MetaName {
        &self.name
    }

    pub fn gc_ts(&self) -> u64 {
        self.meta.read().gc_ts
    }

    /// Returns a copy of the current in-memory meta.
    pub fn snapshot(&self) -> LogMeta {
        self.meta.read().clone()
    }

    pub fn checkpoint_ts(&self) -> u64 {
        self.meta.read().checkpoint_ts
    }

    pub fn resolved_ts(&self) -> u64 {
        self.meta.read().resolved_ts
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Advances the checkpoint; resolved-ts is raised along with it.
    pub fn set_checkpoint_ts(&self, ts: u64) {
        let mut meta = self.meta.write();
        if ts < meta.checkpoint_ts {
            tracing::debug!(
                "Ignoring checkpoint regression {} -> {}",
                meta.checkpoint_ts,
                ts
            );
            return;
        }
        if ts == meta.checkpoint_ts {
            return;
        }
        meta.checkpoint_ts = ts;
        if meta.resolved_ts < ts {
            meta.resolved_ts = ts;
        }
        self.mark_dirty();
    }

    pub fn set_resolved_ts(&self, ts: u64) {
        let mut meta = self.meta.write();
        if ts < meta.resolved_ts {
            tracing::debug!(
                "Ignoring resolved ts regression {} -> {}",
                meta.resolved_ts,
                ts
            );
            return;
        }
        if ts > meta.resolved_ts {
            meta.resolved_ts = ts;
            self.mark_dirty();
        }
    }

    /// Advances a table's offset, returning the table's current offset.
    pub fn set_table_offset(&self, table_id: TableId, ts: u64) -> u64 {
        let mut meta = self.meta.write();
        let offset = meta.offsets.entry(table_id).or_insert(0);
        if ts > *offset {
            *offset = ts;
            self.mark_dirty();
        }
        *offset
    }

    /// Raises the garbage-collection horizon.
    pub fn set_gc_ts(&self, ts: u64) {
        let mut meta = self.meta.write();
        if ts > meta.gc_ts {
            meta.gc_ts = ts;
            self.mark_dirty();
        }
    }

    /// Point-in-time read of the offsets of `table_ids`.
    ///
    /// Tables that never recorded an offset are absent from the result.
    pub fn table_offsets(&self, table_ids: &[TableId]) -> HashMap<TableId, u64> {
        let meta = self.meta.read();
        table_ids
            .iter()
            .filter_map(|id| meta.offsets.get(id).map(|ts| (*id, *ts)))
            .collect()
    }

    /// Persists the meta if it changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock();

        let data = {
            let meta = self.meta.read();
            if !self.dirty.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            meta.encode()
        };

        let result = data.and_then(|data| self.write_atomic(&data));
        if result.is_err() {
            self.mark_dirty();
        }
        result
    }

    fn write_atomic(&self, data: &[u8]) -> Result<()> {
        let tmp = self.dir.join(self.name.tmp_file_name());
        let path = self.path();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| RedoError::file_op("create", &tmp, e))?;
        file.write_all(data)
            .map_err(|e| RedoError::file_op("write", &tmp, e))?;
        file.sync_all()
            .map_err(|e| RedoError::file_op("sync", &tmp, e))?;
        drop(file);

        std::fs::rename(&tmp, &path).map_err(|e| RedoError::file_op("rename", &path, e))?;
        sync_dir(&self.dir)?;

        if let Some(storage) = &self.storage {
            storage::upload_file(storage.as_ref(), &path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    fn meta_name(created_at: i64) -> MetaName {
        MetaName {
            prefix: "cp".to_string(),
            changefeed_id: "test-changefeed".to_string(),
            created_at,
        }
    }

    #[test]
    fn test_meta_encode_decode() {
        let mut meta = LogMeta {
            checkpoint_ts: 11,
            resolved_ts: 22,
            ..Default::default()
        };
        meta.offsets.insert(1, 20);

        let data = meta.encode().unwrap();
        assert_eq!(LogMeta::decode(&data).unwrap(), meta);

        // Partial file
        assert!(matches!(
            LogMeta::decode(&data[..data.len() - 1]),
            Err(RedoError::TruncatedRecord { .. })
        ));
    }

    #[test]
    fn test_supersedes() {
        let old = LogMeta {
            checkpoint_ts: 5,
            resolved_ts: 5,
            offsets: BTreeMap::from([(1, 6)]),
            gc_ts: 0,
        };
        let mut new = old.clone();
        assert!(!new.supersedes(&old));

        new.checkpoint_ts = 50;
        new.resolved_ts = 50;
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));

        // A table offset went backwards
        new.offsets.insert(1, 2);
        assert!(!new.supersedes(&old));
    }

    #[test]
    fn test_setters_only_move_forward() {
        let dir = TempDir::new().unwrap();
        let persister = MetaPersister::new(dir.path(), meta_name(1), LogMeta::default(), None);

        persister.set_resolved_ts(20);
        persister.set_checkpoint_ts(10);
        persister.set_checkpoint_ts(5);
        persister.set_resolved_ts(15);
        assert_eq!(persister.checkpoint_ts(), 10);
        assert_eq!(persister.resolved_ts(), 20);

        // Checkpoint above resolved drags resolved along
        persister.set_checkpoint_ts(30);
        assert_eq!(persister.resolved_ts(), 30);

        assert_eq!(persister.set_table_offset(1, 7), 7);
        assert_eq!(persister.set_table_offset(1, 3), 7);
        let offsets = persister.table_offsets(&[1, 2]);
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[&1], 7);
        assert!(persister.table_offsets(&[]).is_empty());
    }

    #[test]
    fn test_flush_coalesces_and_is_loadable() {
        let dir = TempDir::new().unwrap();
        let persister = MetaPersister::new(dir.path(), meta_name(1), LogMeta::default(), None);

        persister.set_checkpoint_ts(5);
        persister.set_resolved_ts(8);
        persister.flush().unwrap();
        assert!(!persister.is_dirty());
        assert!(!dir.path().join(meta_name(1).tmp_file_name()).exists());

        let loaded = LogMeta::load(dir.path(), "test-changefeed").unwrap();
        assert_eq!(loaded.checkpoint_ts, 5);
        assert_eq!(loaded.resolved_ts, 8);

        // Clean flush does not touch the file
        std::fs::remove_file(persister.path()).unwrap();
        persister.flush().unwrap();
        assert!(!persister.path().exists());
    }

    #[test]
    fn test_load_picks_most_advanced_and_skips_garbage() {
        let dir = TempDir::new().unwrap();

        let first = MetaPersister::new(dir.path(), meta_name(1), LogMeta::default(), None);
        first.set_checkpoint_ts(11);
        first.set_resolved_ts(22);
        first.flush().unwrap();

        let second = MetaPersister::new(dir.path(), meta_name(2), LogMeta::default(), None);
        second.set_checkpoint_ts(111);
        second.flush().unwrap();

        std::fs::write(
            dir.path().join(meta_name(3).file_name()),
            b"definitely not a meta record",
        )
        .unwrap();
        // Leftover temp file from an interrupted flush is ignored
        std::fs::write(dir.path().join(meta_name(4).tmp_file_name()), b"RDLG").unwrap();

        let (name, loaded) = LogMeta::load_latest(dir.path(), "test-changefeed").unwrap();
        assert_eq!(name, meta_name(2));
        assert_eq!(loaded.checkpoint_ts, 111);
        assert_eq!(loaded.resolved_ts, 111);
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        let err = LogMeta::load(dir.path(), "test-changefeed").unwrap_err();
        assert!(err.is_not_found());

        let err = LogMeta::load(Path::new("xxx"), "test-changefeed").unwrap_err();
        assert!(matches!(err, RedoError::FileOperation { .. }));
    }

    #[test]
    fn test_interrupted_flush_never_exposes_partial_meta() {
        let dir = TempDir::new().unwrap();
        let persister = MetaPersister::new(dir.path(), meta_name(1), LogMeta::default(), None);

        for ts in 1..=20u64 {
            persister.set_checkpoint_ts(ts * 10);
            persister.flush().unwrap();

            // Simulate dying after writing part of the next temp file.
            let next = LogMeta {
                checkpoint_ts: ts * 10 + 5,
                resolved_ts: ts * 10 + 5,
                ..Default::default()
            };
            let encoded = next.encode().unwrap();
            let cut = (ts as usize * 7) % encoded.len();
            std::fs::write(dir.path().join(meta_name(1).tmp_file_name()), &encoded[..cut])
                .unwrap();

            let loaded = LogMeta::load(dir.path(), "test-changefeed").unwrap();
            assert_eq!(loaded.checkpoint_ts, ts * 10);
        }
    }

    #[test]
    fn test_flush_uploads_to_mirror() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(LocalStorage::open(dir.path().join("remote")).unwrap());
        let local = dir.path().join("local");
        std::fs::create_dir_all(&local).unwrap();

        let persister =
            MetaPersister::new(&local, meta_name(1), LogMeta::default(), Some(remote.clone()));
        persister.set_checkpoint_ts(3);
        persister.flush().unwrap();

        let data = remote.get(&meta_name(1).file_name()).unwrap();
        assert_eq!(LogMeta::decode(&data).unwrap().checkpoint_ts, 3);
    }
}
