//! # redolog-wal
//!
//! Redo log for change-data-capture changefeeds.
//!
//! This crate provides a durable, replayable log of row and DDL changes with:
//! - Per-record checksums for corruption detection
//! - Size-rotated segment files named for discovery without opening them
//! - Atomically replaced checkpoint / resolved-ts meta
//! - Checkpoint-driven retention of consumed segments
//! - Commit-ts ordered replay over a `[start_ts, end_ts)` window

pub mod config;
pub mod entry;
pub mod error;
pub mod meta;
pub mod model;
pub mod naming;
pub mod reader;
pub mod recovery;
pub mod retention;
pub mod segment;
pub mod storage;
pub mod writer;

pub use config::RedoConfig;
pub use entry::{RecordType, RedoRecord};
pub use error::{RedoError, Result};
pub use meta::{LogMeta, MetaPersister};
pub use model::{Column, DdlEvent, DdlType, LogKind, RedoLog, RowChangedEvent, TableId, TableName};
pub use naming::{MetaName, SegmentName, SegmentScanner, SegmentState};
pub use reader::{
    ActiveSegmentSource, LogReader, LogReaderConfig, MergeReader, RecordSource, SegmentReader,
};
pub use recovery::{repair_segments, verify_segments, VerifyResult};
pub use retention::{RetentionController, RetentionReport};
pub use segment::{SegmentWriter, SegmentWriterConfig};
pub use storage::{ExternalStorage, LocalStorage, StorageUri};
pub use writer::{LogWriter, LogWriterConfig, LogWriterStats};

pub use tokio_util::sync::CancellationToken;

use std::time::Duration;

/// Default segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default segment write buffer (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default period of the background segment flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default period of the background retention pass.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;

pub(crate) fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(RedoError::Cancelled);
    }
    Ok(())
}
