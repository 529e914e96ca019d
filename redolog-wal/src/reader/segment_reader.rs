//! Sequential reader over one segment file.

use crate::entry::RedoRecord;
use crate::error::{RedoError, Result};
use crate::naming::{SegmentName, SegmentState};
use crate::recovery;
use crate::segment::sync_dir;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A stream of records in file order.
pub trait RecordSource: Send {
    /// Returns the next record, or `None` at end of stream.
    fn next_record(&mut self) -> Result<Option<RedoRecord>>;

    /// Releases the underlying resources. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Lazily decodes the records of one segment.
pub struct SegmentReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    buf: BytesMut,
    chunk: Vec<u8>,
    /// File offset of the first byte in `buf`.
    offset: u64,
    eof: bool,
}

impl SegmentReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| RedoError::file_op("open", &path, e))?;
        Ok(Self {
            path,
            file: Some(BufReader::new(file)),
            buf: BytesMut::new(),
            chunk: vec![0; READ_CHUNK_SIZE],
            offset: 0,
            eof: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every remaining record.
    pub fn read_all(&mut self) -> Result<Vec<RedoRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn fill(&mut self) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            self.eof = true;
            return Ok(());
        };
        let n = file
            .read(&mut self.chunk)
            .map_err(|e| RedoError::file_op("read", &self.path, e))?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
        Ok(())
    }
}

impl RecordSource for SegmentReader {
    fn next_record(&mut self) -> Result<Option<RedoRecord>> {
        loop {
            if let Some(record) = RedoRecord::decode(&mut self.buf, self.offset)? {
                self.offset += record.disk_size() as u64;
                return Ok(Some(record));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RedoError::TruncatedRecord {
                    offset: self.offset,
                    available: self.buf.len(),
                    needed: RedoRecord::needed_len(&self.buf),
                });
            }

            self.fill()?;
        }
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        self.buf.clear();
        self.eof = true;
        Ok(())
    }
}

/// Records of a segment that may still be appended to, held in memory in
/// commit-ts order.
///
/// Only the valid prefix is read: a record torn by a crash or still being
/// written is left out.
pub struct ActiveSegmentSource {
    path: PathBuf,
    records: VecDeque<RedoRecord>,
}

impl ActiveSegmentSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (mut records, scan) = recovery::read_valid_prefix(&path)?;
        if let Some(problem) = &scan.problem {
            tracing::warn!(
                "Ignoring tail of active segment {} after {} records: {}",
                path.display(),
                scan.valid_records,
                problem
            );
        }
        if !scan.sorted {
            records.sort_by_key(|r| r.commit_ts());
        }
        Ok(Self {
            path,
            records: records.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSource for ActiveSegmentSource {
    fn next_record(&mut self) -> Result<Option<RedoRecord>> {
        Ok(self.records.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.records.clear();
        Ok(())
    }
}

/// Writes a commit-ts ordered copy of an unsorted segment into `work_dir`.
///
/// Returns the path of the sorted copy. An existing copy is reused.
pub fn sort_segment(path: &Path, name: &SegmentName, work_dir: &Path) -> Result<PathBuf> {
    let sorted_name = name.finalized(name.ts, SegmentState::Sorted);
    let target = work_dir.join(sorted_name.file_name());
    if target.exists() {
        return Ok(target);
    }

    let mut records = SegmentReader::open(path)?.read_all()?;
    records.sort_by_key(|r| r.commit_ts());

    std::fs::create_dir_all(work_dir).map_err(|e| RedoError::file_op("create", work_dir, e))?;
    let tmp = work_dir.join(format!("{}.tmp", sorted_name.file_name()));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| RedoError::file_op("create", &tmp, e))?;
    let mut writer = BufWriter::new(file);
    for record in &records {
        writer
            .write_all(&record.encode()?)
            .map_err(|e| RedoError::file_op("write", &tmp, e))?;
    }
    let file = writer
        .into_inner()
        .map_err(|e| RedoError::file_op("write", &tmp, e.into_error()))?;
    file.sync_all()
        .map_err(|e| RedoError::file_op("sync", &tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, &target).map_err(|e| RedoError::file_op("rename", &target, e))?;
    sync_dir(work_dir)?;

    tracing::debug!(
        "Sorted {} records of {} into {}",
        records.len(),
        path.display(),
        target.display()
    );
    Ok(target)
}
