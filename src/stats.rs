//! Disk usage of a file store root
//!
//! Walks the root without opening the store, so it can run next to a live
//! server:
//! - root file sizes (server info, clients)
//! - per channel: slices, data and index bytes, subscription log size
//! - slices renamed for archiving and not yet picked up

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreResult;
use crate::file_store::{BAK_SUFFIX, CLIENTS_FILE, DAT_SUFFIX, IDX_SUFFIX, MSG_FILES_PREFIX, SERVER_FILE, SUBS_FILE};

/// Disk usage of one channel directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelDiskStats {
    /// Slice numbers, ascending
    pub slices: Vec<u32>,
    /// Bytes of message data files
    pub data_size: u64,
    /// Bytes of index files
    pub index_size: u64,
    /// Bytes of the subscription log
    pub subs_size: u64,
    /// Files waiting for the archive script
    pub archived_files: usize,
}

impl ChannelDiskStats {
    pub fn total_size(&self) -> u64 {
        self.data_size + self.index_size + self.subs_size
    }
}

/// Disk usage of a store root
#[derive(Debug, Clone, Default)]
pub struct StoreDiskStats {
    pub server_file_size: u64,
    pub clients_file_size: u64,
    pub channels: BTreeMap<String, ChannelDiskStats>,
}

impl StoreDiskStats {
    /// Calculate total storage size
    pub fn total_size(&self) -> u64 {
        self.server_file_size
            + self.clients_file_size
            + self.channels.values().map(ChannelDiskStats::total_size).sum::<u64>()
    }

    /// Format size in human-readable format
    pub fn format_size(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

/// Collector for store disk statistics
pub struct StatsCollector {
    root: PathBuf,
}

impl StatsCollector {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Collect all statistics
    pub fn collect(&self) -> StoreResult<StoreDiskStats> {
        let mut stats = StoreDiskStats {
            server_file_size: file_size(&self.root.join(SERVER_FILE))?,
            clients_file_size: file_size(&self.root.join(CLIENTS_FILE))?,
            ..Default::default()
        };
        if !self.root.exists() {
            return Ok(stats);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let channel = entry.file_name().to_string_lossy().into_owned();
            stats.channels.insert(channel, self.analyze_channel(&entry.path())?);
        }
        Ok(stats)
    }

    fn analyze_channel(&self, dir: &Path) -> StoreResult<ChannelDiskStats> {
        let mut stats = ChannelDiskStats::default();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == SUBS_FILE {
                stats.subs_size = meta.len();
            } else if name.ends_with(BAK_SUFFIX) {
                stats.archived_files += 1;
            } else if let Some(rest) = name.strip_prefix(MSG_FILES_PREFIX) {
                if let Some(number) = rest.strip_suffix(DAT_SUFFIX) {
                    if let Ok(n) = number.parse::<u32>() {
                        stats.slices.push(n);
                    }
                    stats.data_size += meta.len();
                } else if rest.ends_with(IDX_SUFFIX) {
                    stats.index_size += meta.len();
                }
            }
        }
        stats.slices.sort_unstable();
        Ok(stats)
    }
}

fn file_size(path: &Path) -> StoreResult<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}
