//! Redo log configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via REDO_CONFIG or --config)
//! 3. Environment variables

use crate::error::{RedoError, Result};
use crate::naming::validate_identity;
use crate::reader::LogReaderConfig;
use crate::storage::StorageUri;
use crate::writer::LogWriterConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Redo log configuration for one changefeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedoConfig {
    /// Local directory holding segments and meta.
    pub dir: PathBuf,
    pub changefeed_id: String,
    /// Capture identity, used as the file name prefix.
    pub capture_id: String,
    /// Segment size in megabytes before rotation.
    pub max_log_size_mb: u64,
    /// Write buffer size in kilobytes.
    pub buffer_size_kb: usize,
    /// Background segment flush period in milliseconds.
    pub flush_interval_ms: u64,
    /// Retention period in seconds.
    pub gc_interval_secs: u64,
    /// Optional mirror URI, e.g. `file:///mnt/redo`.
    pub storage_uri: Option<String>,
    /// Scratch directory for sorted segment copies.
    pub work_dir: Option<PathBuf>,
}

impl Default for RedoConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./redo"),
            changefeed_id: "default".to_string(),
            capture_id: "capture".to_string(),
            max_log_size_mb: 64,
            buffer_size_kb: 64,
            flush_interval_ms: 1000,
            gc_interval_secs: 300,
            storage_uri: None,
            work_dir: None,
        }
    }
}

impl RedoConfig {
    /// Loads configuration from `path` (or `REDO_CONFIG`), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("REDO_CONFIG") {
                Ok(path) => Self::from_file(&path)?,
                Err(_) => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| RedoError::file_op("read", path, e))?;
        serde_yaml::from_str(&content).map_err(|e| {
            RedoError::InvalidConfig(format!("failed to parse '{}': {}", path.display(), e))
        })
    }

    /// Applies overrides looked up by variable name.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("REDO_DIR") {
            self.dir = PathBuf::from(dir);
        }
        if let Some(id) = lookup("REDO_CHANGEFEED") {
            self.changefeed_id = id;
        }
        if let Some(id) = lookup("REDO_CAPTURE") {
            self.capture_id = id;
        }
        if let Some(size) = lookup("REDO_MAX_LOG_SIZE_MB") {
            if let Ok(mb) = size.parse() {
                self.max_log_size_mb = mb;
            }
        }
        if let Some(interval) = lookup("REDO_FLUSH_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.flush_interval_ms = ms;
            }
        }
        if let Some(interval) = lookup("REDO_GC_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse() {
                self.gc_interval_secs = secs;
            }
        }
        if let Some(uri) = lookup("REDO_STORAGE_URI") {
            self.storage_uri = (!uri.is_empty()).then_some(uri);
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identity("changefeed id", &self.changefeed_id)?;
        validate_identity("capture id", &self.capture_id)?;
        if self.max_log_size_mb == 0 {
            return Err(RedoError::InvalidConfig(
                "max_log_size_mb must be greater than 0".to_string(),
            ));
        }
        if self.buffer_size_kb == 0 {
            return Err(RedoError::InvalidConfig(
                "buffer_size_kb must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 || self.gc_interval_secs == 0 {
            return Err(RedoError::InvalidConfig(
                "flush_interval_ms and gc_interval_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(uri) = &self.storage_uri {
            StorageUri::parse(uri)?;
        }
        Ok(())
    }

    pub fn max_log_size(&self) -> u64 {
        self.max_log_size_mb * 1024 * 1024
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn writer_config(&self) -> LogWriterConfig {
        let config = LogWriterConfig::new(&self.dir, &self.capture_id, &self.changefeed_id)
            .with_max_log_size(self.max_log_size())
            .with_buffer_size(self.buffer_size_kb * 1024)
            .with_flush_interval(self.flush_interval())
            .with_gc_interval(self.gc_interval());
        match &self.storage_uri {
            Some(uri) => config.with_storage_uri(uri),
            None => config,
        }
    }

    pub fn reader_config(&self) -> LogReaderConfig {
        let mut config = LogReaderConfig::new(&self.dir, &self.changefeed_id);
        if let Some(dir) = &self.work_dir {
            config = config.with_work_dir(dir);
        }
        if let Some(uri) = &self.storage_uri {
            config = config.with_storage_uri(uri);
        }
        config
    }
}
