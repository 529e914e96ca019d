//! Segment and meta file naming.
//!
//! Segment files: `{prefix}_{changefeed}_{created}_{kind}_{ts}{ext}` where
//! `ext` is `.log.tmp` while the segment is being written, `.log` once closed
//! and `.log.sort` once closed with its records in commit-ts order. For a
//! closed segment `ts` is the largest commit-ts it holds.
//!
//! Meta files: `{prefix}_{changefeed}_{created}_meta.meta`.

use crate::error::{RedoError, Result};
use crate::model::LogKind;
use std::path::{Path, PathBuf};

pub const LOG_EXT: &str = ".log";
pub const SORT_LOG_EXT: &str = ".sort";
pub const TMP_EXT: &str = ".tmp";
pub const META_EXT: &str = ".meta";
pub const META_FILE_KIND: &str = "meta";

/// Lifecycle stage encoded in a segment's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    /// `.log.tmp`: still being appended to.
    Active,
    /// `.log`: closed, records may interleave commit-ts across tables.
    Closed,
    /// `.log.sort`: closed, records in non-decreasing commit-ts order.
    Sorted,
}

impl SegmentState {
    fn extension(&self) -> String {
        match self {
            SegmentState::Active => format!("{LOG_EXT}{TMP_EXT}"),
            SegmentState::Closed => LOG_EXT.to_string(),
            SegmentState::Sorted => format!("{LOG_EXT}{SORT_LOG_EXT}"),
        }
    }
}

/// Parsed segment file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName {
    pub prefix: String,
    pub changefeed_id: String,
    pub created_at: i64,
    pub kind: LogKind,
    pub ts: u64,
    pub state: SegmentState,
}

impl SegmentName {
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}{}",
            self.prefix,
            self.changefeed_id,
            self.created_at,
            self.kind.as_str(),
            self.ts,
            self.state.extension()
        )
    }

    pub fn parse(name: &str) -> Option<Self> {
        let (stem, state) = if let Some(stem) = name.strip_suffix(".log.tmp") {
            (stem, SegmentState::Active)
        } else if let Some(stem) = name.strip_suffix(".log.sort") {
            (stem, SegmentState::Sorted)
        } else if let Some(stem) = name.strip_suffix(LOG_EXT) {
            (stem, SegmentState::Closed)
        } else {
            return None;
        };

        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 5 || parts[0].is_empty() || parts[1].is_empty() {
            return None;
        }

        Some(Self {
            prefix: parts[0].to_string(),
            changefeed_id: parts[1].to_string(),
            created_at: parts[2].parse().ok()?,
            kind: LogKind::parse(parts[3])?,
            ts: parts[4].parse().ok()?,
            state,
        })
    }

    /// Returns the same name at a different lifecycle stage and ts.
    pub fn finalized(&self, ts: u64, state: SegmentState) -> Self {
        Self {
            ts,
            state,
            ..self.clone()
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self.state, SegmentState::Active)
    }
}

/// Parsed meta file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaName {
    pub prefix: String,
    pub changefeed_id: String,
    pub created_at: i64,
}

impl MetaName {
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}{}",
            self.prefix, self.changefeed_id, self.created_at, META_FILE_KIND, META_EXT
        )
    }

    pub fn tmp_file_name(&self) -> String {
        format!("{}{}", self.file_name(), TMP_EXT)
    }

    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(META_EXT)?;
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 4 || parts[3] != META_FILE_KIND {
            return None;
        }
        if parts[0].is_empty() || parts[1].is_empty() {
            return None;
        }
        Some(Self {
            prefix: parts[0].to_string(),
            changefeed_id: parts[1].to_string(),
            created_at: parts[2].parse().ok()?,
        })
    }
}

/// Checks that an identity can be embedded in a file name.
pub fn validate_identity(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RedoError::InvalidConfig(format!("{what} must not be empty")));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(RedoError::InvalidConfig(format!(
            "{what} '{value}' may only contain ASCII letters, digits and '-'"
        )));
    }
    Ok(())
}

/// Directory scanner for redo files.
pub struct SegmentScanner;

impl SegmentScanner {
    fn read_names(dir: &Path) -> Result<Vec<String>> {
        let entries =
            std::fs::read_dir(dir).map_err(|e| RedoError::file_op("read directory", dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RedoError::file_op("read directory", dir, e))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Lists segments of a changefeed, optionally of one kind, in write order.
    pub fn list_segments(
        dir: &Path,
        changefeed_id: &str,
        kind: Option<LogKind>,
    ) -> Result<Vec<(PathBuf, SegmentName)>> {
        let mut segments: Vec<(PathBuf, SegmentName)> = Self::read_names(dir)?
            .into_iter()
            .filter_map(|name| {
                let parsed = SegmentName::parse(&name)?;
                if parsed.changefeed_id != changefeed_id {
                    return None;
                }
                if kind.is_some_and(|k| k != parsed.kind) {
                    return None;
                }
                Some((dir.join(&name), parsed))
            })
            .collect();

        segments.sort_by(|a, b| {
            (a.1.created_at, a.1.ts, a.1.kind).cmp(&(b.1.created_at, b.1.ts, b.1.kind))
        });
        Ok(segments)
    }

    /// Lists closed segments only.
    pub fn list_closed_segments(
        dir: &Path,
        changefeed_id: &str,
        kind: Option<LogKind>,
    ) -> Result<Vec<(PathBuf, SegmentName)>> {
        let mut segments = Self::list_segments(dir, changefeed_id, kind)?;
        segments.retain(|(_, name)| name.is_closed());
        Ok(segments)
    }

    /// Lists all segments in a directory regardless of changefeed.
    pub fn list_all_segments(dir: &Path) -> Result<Vec<(PathBuf, SegmentName)>> {
        let mut segments: Vec<(PathBuf, SegmentName)> = Self::read_names(dir)?
            .into_iter()
            .filter_map(|name| SegmentName::parse(&name).map(|parsed| (dir.join(&name), parsed)))
            .collect();
        segments.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(segments)
    }

    /// Lists meta files of a changefeed.
    pub fn list_meta_files(dir: &Path, changefeed_id: &str) -> Result<Vec<(PathBuf, MetaName)>> {
        let mut metas: Vec<(PathBuf, MetaName)> = Self::read_names(dir)?
            .into_iter()
            .filter_map(|name| {
                let parsed = MetaName::parse(&name)?;
                (parsed.changefeed_id == changefeed_id).then(|| (dir.join(&name), parsed))
            })
            .collect();
        metas.sort_by_key(|(_, name)| name.created_at);
        Ok(metas)
    }

    /// Largest creation stamp among a writer's segments, if any.
    pub fn latest_created_at(dir: &Path, changefeed_id: &str, kind: LogKind) -> Result<Option<i64>> {
        Ok(Self::list_segments(dir, changefeed_id, Some(kind))?
            .iter()
            .map(|(_, name)| name.created_at)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn name(state: SegmentState) -> SegmentName {
        SegmentName {
            prefix: "cp".to_string(),
            changefeed_id: "test-cf".to_string(),
            created_at: 1700000000,
            kind: LogKind::Row,
            ts: 100,
            state,
        }
    }

    #[test]
    fn test_segment_file_name() {
        assert_eq!(
            name(SegmentState::Closed).file_name(),
            "cp_test-cf_1700000000_row_100.log"
        );
        assert_eq!(
            name(SegmentState::Sorted).file_name(),
            "cp_test-cf_1700000000_row_100.log.sort"
        );
        assert_eq!(
            name(SegmentState::Active).file_name(),
            "cp_test-cf_1700000000_row_100.log.tmp"
        );
    }

    #[test]
    fn test_parse_segment_file_name() {
        for state in [
            SegmentState::Active,
            SegmentState::Closed,
            SegmentState::Sorted,
        ] {
            let original = name(state);
            assert_eq!(SegmentName::parse(&original.file_name()), Some(original));
        }

        assert_eq!(SegmentName::parse("cp_test-cf_1_meta.meta"), None);
        assert_eq!(SegmentName::parse("cp_test-cf_1_blob_10.log"), None);
        assert_eq!(SegmentName::parse("cp_test_cf_1_row_10.log"), None);
        assert_eq!(SegmentName::parse("cp_test-cf_x_row_10.log"), None);
        assert_eq!(SegmentName::parse("0000000000000000.wal"), None);
    }

    #[test]
    fn test_meta_file_name() {
        let meta = MetaName {
            prefix: "cp".to_string(),
            changefeed_id: "test-changefeed".to_string(),
            created_at: 42,
        };
        assert_eq!(meta.file_name(), "cp_test-changefeed_42_meta.meta");
        assert_eq!(meta.tmp_file_name(), "cp_test-changefeed_42_meta.meta.tmp");
        assert_eq!(MetaName::parse(&meta.file_name()), Some(meta.clone()));
        assert_eq!(MetaName::parse(&meta.tmp_file_name()), None);
        assert_eq!(MetaName::parse("cp_test-changefeed_42_row_1.log"), None);
    }

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity("changefeed id", "test-cf-1").is_ok());
        assert!(validate_identity("changefeed id", "").is_err());
        assert!(validate_identity("changefeed id", "has_underscore").is_err());
        assert!(validate_identity("changefeed id", "has space").is_err());
    }

    #[test]
    fn test_list_segments_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        for file in [
            "cp_cf-a_20_row_5.log",
            "cp_cf-a_10_row_9.log.sort",
            "cp_cf-a_30_row_7.log.tmp",
            "cp_cf-a_15_ddl_3.log",
            "cp_cf-b_5_row_1.log",
            "cp_cf-a_1_meta.meta",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(file), b"").unwrap();
        }

        let rows = SegmentScanner::list_segments(dir.path(), "cf-a", Some(LogKind::Row)).unwrap();
        let created: Vec<i64> = rows.iter().map(|(_, n)| n.created_at).collect();
        assert_eq!(created, vec![10, 20, 30]);

        let closed =
            SegmentScanner::list_closed_segments(dir.path(), "cf-a", Some(LogKind::Row)).unwrap();
        assert_eq!(closed.len(), 2);

        let all = SegmentScanner::list_segments(dir.path(), "cf-a", None).unwrap();
        assert_eq!(all.len(), 4);

        let metas = SegmentScanner::list_meta_files(dir.path(), "cf-a").unwrap();
        assert_eq!(metas.len(), 1);

        assert_eq!(
            SegmentScanner::latest_created_at(dir.path(), "cf-a", LogKind::Row).unwrap(),
            Some(30)
        );
        assert_eq!(
            SegmentScanner::latest_created_at(dir.path(), "cf-c", LogKind::Row).unwrap(),
            None
        );
    }

    #[test]
    fn test_list_missing_directory() {
        let err = SegmentScanner::list_segments(Path::new("/definitely/not/here"), "cf", None)
            .unwrap_err();
        assert!(matches!(err, RedoError::FileOperation { .. }));
    }
}
