//! Segment scanning and repair.
//!
//! Handles:
//! - Partial writes (incomplete records at the end of an active segment)
//! - Corrupted records
//! - Offline verification of a whole redo directory

use crate::entry::RedoRecord;
use crate::error::{RedoError, Result};
use crate::naming::{SegmentName, SegmentScanner};
use bytes::BytesMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Result of scanning one segment file.
#[derive(Debug, Clone, Default)]
pub struct FileScan {
    /// Number of records that decoded cleanly.
    pub valid_records: u64,
    /// Length of the valid prefix in bytes.
    pub valid_len: u64,
    /// File length in bytes.
    pub file_len: u64,
    /// Largest commit-ts in the valid prefix.
    pub max_commit_ts: u64,
    /// Whether the valid prefix is in non-decreasing commit-ts order.
    pub sorted: bool,
    /// Why scanning stopped before the end of the file, if it did.
    pub problem: Option<String>,
}

impl FileScan {
    pub fn bytes_invalid(&self) -> u64 {
        self.file_len - self.valid_len
    }
}

/// Scans a segment file, stopping at the first record that does not decode.
pub fn scan_file(path: &Path) -> Result<FileScan> {
    scan_records(path, |_| {})
}

/// Reads the records of a segment's valid prefix, ignoring a torn or
/// corrupted tail. Used for segments a writer may still be appending to.
pub fn read_valid_prefix(path: &Path) -> Result<(Vec<RedoRecord>, FileScan)> {
    let mut records = Vec::new();
    let scan = scan_records(path, |record| records.push(record))?;
    Ok((records, scan))
}

fn scan_records(path: &Path, mut visit: impl FnMut(RedoRecord)) -> Result<FileScan> {
    let data = std::fs::read(path).map_err(|e| RedoError::file_op("read", path, e))?;
    let mut buf = BytesMut::from(&data[..]);

    let mut scan = FileScan {
        file_len: data.len() as u64,
        sorted: true,
        ..Default::default()
    };
    let mut last_ts = 0u64;

    while !buf.is_empty() {
        match RedoRecord::decode(&mut buf, scan.valid_len) {
            Ok(Some(record)) => {
                let ts = record.commit_ts();
                if ts < last_ts {
                    scan.sorted = false;
                }
                last_ts = ts;
                scan.max_commit_ts = scan.max_commit_ts.max(ts);
                scan.valid_records += 1;
                scan.valid_len += record.disk_size() as u64;
                visit(record);
            }
            Ok(None) => {
                scan.problem = Some(format!(
                    "torn record at offset {}: {} of {} bytes present",
                    scan.valid_len,
                    buf.len(),
                    RedoRecord::needed_len(&buf)
                ));
                break;
            }
            Err(e) => {
                scan.problem = Some(e.to_string());
                break;
            }
        }
    }

    Ok(scan)
}

/// Truncates a file to its valid prefix.
pub fn truncate_to(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| RedoError::file_op("open", path, e))?;
    file.set_len(len)
        .map_err(|e| RedoError::file_op("truncate", path, e))?;
    file.sync_all()
        .map_err(|e| RedoError::file_op("sync", path, e))?;
    Ok(())
}

/// Result of verifying a redo directory.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Bytes that could not be decoded (or were truncated during repair).
    pub bytes_invalid: u64,
    /// Segments scanned, with their scan results.
    pub segments: Vec<(PathBuf, SegmentName, FileScan)>,
    /// Segments that had problems.
    pub segments_with_errors: Vec<(PathBuf, String)>,
    /// Maximum commit-ts found.
    pub max_commit_ts: u64,
}

impl VerifyResult {
    pub fn is_clean(&self) -> bool {
        self.segments_with_errors.is_empty()
    }
}

/// Scans every segment in `dir`, optionally truncating torn tails.
fn scan_dir(dir: &Path, repair: bool) -> Result<VerifyResult> {
    let mut result = VerifyResult::default();

    for (path, name) in SegmentScanner::list_all_segments(dir)? {
        let scan = match scan_file(&path) {
            Ok(scan) => scan,
            Err(e) => {
                result.segments_with_errors.push((path, e.to_string()));
                continue;
            }
        };

        result.valid_records += scan.valid_records;
        result.bytes_invalid += scan.bytes_invalid();
        result.max_commit_ts = result.max_commit_ts.max(scan.max_commit_ts);

        if let Some(problem) = &scan.problem {
            result
                .segments_with_errors
                .push((path.clone(), problem.clone()));
            if repair {
                truncate_to(&path, scan.valid_len)?;
                tracing::warn!(
                    "Truncated segment {} at offset {} (removed {} bytes)",
                    path.display(),
                    scan.valid_len,
                    scan.bytes_invalid()
                );
            }
        }

        result.segments.push((path, name, scan));
    }

    Ok(result)
}

/// Verifies every segment in a directory without modifying anything.
pub fn verify_segments(dir: impl AsRef<Path>) -> Result<VerifyResult> {
    scan_dir(dir.as_ref(), false)
}

/// Repairs segments by truncating everything after their valid prefix.
pub fn repair_segments(dir: impl AsRef<Path>) -> Result<VerifyResult> {
    scan_dir(dir.as_ref(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::RecordType;
    use bytes::Bytes;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_records(path: &Path, timestamps: &[u64]) {
        let mut file = std::fs::File::create(path).unwrap();
        for &ts in timestamps {
            let record = RedoRecord::new(
                RecordType::Row,
                ts,
                Bytes::from(format!(r#"{{"ts":{}}}"#, ts)),
            );
            file.write_all(&record.encode().unwrap()).unwrap();
        }
        file.sync_all().unwrap();
    }

    #[test]
    fn test_scan_clean_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp_cf_1_row_5.log");
        write_records(&path, &[1, 2, 5]);

        let scan = scan_file(&path).unwrap();
        assert_eq!(scan.valid_records, 3);
        assert_eq!(scan.max_commit_ts, 5);
        assert!(scan.sorted);
        assert!(scan.problem.is_none());
        assert_eq!(scan.bytes_invalid(), 0);
    }

    #[test]
    fn test_scan_detects_unsorted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp_cf_1_row_9.log");
        write_records(&path, &[3, 9, 4]);

        let scan = scan_file(&path).unwrap();
        assert!(!scan.sorted);
        assert_eq!(scan.max_commit_ts, 9);
    }

    #[test]
    fn test_read_valid_prefix_ignores_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp_cf_1_row_0.log.tmp");
        write_records(&path, &[7, 4]);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"RDLG\x01").unwrap();
        drop(file);

        let (records, scan) = read_valid_prefix(&path).unwrap();
        let ts: Vec<u64> = records.iter().map(|r| r.commit_ts()).collect();
        assert_eq!(ts, vec![7, 4]);
        assert_eq!(scan.valid_records, 2);
        assert_eq!(scan.bytes_invalid(), 5);
        assert!(scan.problem.is_some());
    }

    #[test]
    fn test_verify_and_repair_partial_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp_cf_1_row_3.log.tmp");
        write_records(&path, &[1, 2, 3]);

        // Append garbage to simulate a partial write
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"RDLG\x01\x00\x00\x00").unwrap();
        drop(file);

        let result = verify_segments(dir.path()).unwrap();
        assert_eq!(result.valid_records, 3);
        assert_eq!(result.bytes_invalid, 8);
        assert!(!result.is_clean());

        let result = repair_segments(dir.path()).unwrap();
        assert_eq!(result.valid_records, 3);

        let result = verify_segments(dir.path()).unwrap();
        assert!(result.is_clean());
        assert_eq!(result.bytes_invalid, 0);
        assert_eq!(result.max_commit_ts, 3);
    }
}
