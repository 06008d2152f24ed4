//! File store configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::crc::IEEE;
use crate::error::StoreResult;
use crate::utils::time::duration_secs;

/// Options of a file store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreOptions {
    /// Maximum size of the write buffers; 0 writes straight to the files
    pub buffer_size: usize,
    /// Enable compaction of the subscription and client logs
    pub compact_enabled: bool,
    /// Minimum time between two compactions of the same log
    #[serde(with = "duration_secs")]
    pub compact_interval: Duration,
    /// Percentage of dead records required before compacting
    pub compact_fragmentation: u32,
    /// Files smaller than this are never compacted (0 or less: no minimum)
    pub compact_min_file_size: i64,
    /// Verify checksums when reading records
    pub do_crc: bool,
    /// Reversed CRC-32 polynomial
    pub crc_polynomial: u32,
    /// Sync files to disk on flush
    pub do_sync: bool,
    /// Messages per slice (0: not checked)
    pub slice_max_msgs: usize,
    /// Bytes per slice, index included (0: not checked)
    pub slice_max_bytes: u64,
    /// Time covered by a slice from its first message (0: not checked)
    #[serde(with = "duration_secs")]
    pub slice_max_age: Duration,
    /// Script invoked with `<channel> <dat.bak> <idx.bak>` when a slice
    /// is retired
    pub slice_archive_script: Option<PathBuf>,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            buffer_size: 2 * 1024 * 1024,
            compact_enabled: true,
            compact_interval: Duration::from_secs(5 * 60),
            compact_fragmentation: 50,
            compact_min_file_size: 1024 * 1024,
            do_crc: true,
            crc_polynomial: IEEE,
            do_sync: true,
            slice_max_msgs: 0,
            slice_max_bytes: 64 * 1024 * 1024,
            slice_max_age: Duration::ZERO,
            slice_archive_script: None,
        }
    }
}

impl FileStoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_compact_enabled(mut self, enabled: bool) -> Self {
        self.compact_enabled = enabled;
        self
    }

    pub fn with_compact_interval(mut self, interval: Duration) -> Self {
        self.compact_interval = interval;
        self
    }

    pub fn with_compact_fragmentation(mut self, percent: u32) -> Self {
        self.compact_fragmentation = percent;
        self
    }

    pub fn with_compact_min_file_size(mut self, size: i64) -> Self {
        self.compact_min_file_size = size;
        self
    }

    pub fn with_crc(mut self, enabled: bool) -> Self {
        self.do_crc = enabled;
        self
    }

    pub fn with_crc_polynomial(mut self, polynomial: u32) -> Self {
        self.crc_polynomial = polynomial;
        self
    }

    pub fn with_sync(mut self, enabled: bool) -> Self {
        self.do_sync = enabled;
        self
    }

    /// Set the slice limits and archive script at once.
    ///
    /// If every limit is 0, slices are sized from the channel limits.
    pub fn with_slice_config(
        mut self,
        max_msgs: usize,
        max_bytes: u64,
        max_age: Duration,
        archive_script: Option<PathBuf>,
    ) -> Self {
        self.slice_max_msgs = max_msgs;
        self.slice_max_bytes = max_bytes;
        self.slice_max_age = max_age;
        self.slice_archive_script = archive_script;
        self
    }

    /// Parse options from a JSON document (durations in seconds)
    pub fn from_json_str(json: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load options from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// True if any slice limit is configured
    pub fn has_slice_limits(&self) -> bool {
        self.slice_max_msgs > 0 || self.slice_max_bytes > 0 || !self.slice_max_age.is_zero()
    }
}
