//! File-backed store
//!
//! Layout of a store root:
//!
//! ```text
//! <root>/
//! ├── server.dat          # server info (one record, rewritten by init)
//! ├── clients.dat         # client add/delete records
//! └── <channel>/
//!     ├── subs.dat        # subscription log
//!     ├── msgs.1.dat      # message slices and their indexes
//!     ├── msgs.1.idx
//!     └── ...
//! ```
//!
//! Opening a root recovers everything found in it and returns the
//! recovered state so the server can restore its sessions.

mod buffer;
mod cache;
pub mod crc;
mod msgs;
pub mod options;
mod record;
mod subs;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::limits::{ChannelLimits, StoreLimits};
use crate::logger::{default_logger, SharedLogger};
use crate::store::{
    ChannelStore, GenericStore, MsgStore, RecoveredState, Store, SubStore, TYPE_FILE,
};
use crate::types::{Client, ClientInfo, ServerInfo, UserData};
use crate::utils::{cleanup_temp_files, swap_files, temp_path_for};

use self::crc::CrcTable;
use self::record::{
    create_versioned, decode_payload, open_file, open_file_with, read_record, write_record, NO_TYPE,
    RECORD_HEADER_SIZE, VERSION_SIZE,
};

pub use self::msgs::{FileMsgStore, MSG_INDEX_REC_SIZE, MSG_RECORD_OVERHEAD};
pub use self::options::FileStoreOptions;
pub use self::subs::FileSubStore;

pub const SERVER_FILE: &str = "server.dat";
pub const CLIENTS_FILE: &str = "clients.dat";
pub const SUBS_FILE: &str = "subs.dat";
pub const MSG_FILES_PREFIX: &str = "msgs.";
pub const DAT_SUFFIX: &str = ".dat";
pub const IDX_SUFFIX: &str = ".idx";
pub const BAK_SUFFIX: &str = ".bak";

/// Buffers never shrink below these sizes
pub(crate) const MSG_BUF_MIN_SHRINK_SIZE: usize = 512;
pub(crate) const SUB_BUF_MIN_SHRINK_SIZE: usize = 128;

pub(crate) const BUF_SHRINK_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const BKG_TASKS_INTERVAL: Duration = Duration::from_secs(1);

/// Buffer used to rewrite a file during compaction
pub(crate) const COMPACT_BUF_SIZE: usize = 32 * 1024;

const CLIENT_REC_ADD: u8 = 1;
const CLIENT_REC_DEL: u8 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct ClientDelete {
    id: String,
}

/// Configuration shared by every log of a store
pub(crate) struct FileShared {
    pub options: FileStoreOptions,
    pub crc: CrcTable,
    pub logger: SharedLogger,
}

impl FileShared {
    pub fn new(options: FileStoreOptions, logger: SharedLogger) -> Self {
        Self {
            crc: CrcTable::new(options.crc_polynomial),
            options,
            logger,
        }
    }
}

/// Root-level files of a file store
pub(crate) struct FileRoot {
    root: PathBuf,
    shared: Arc<FileShared>,
    server_file: Option<File>,
    clients_file: Option<File>,
    /// Bytes of client records, and how many are deletes
    cli_file_size: u64,
    cli_delete_recs: usize,
    cli_compact_ts: Option<Instant>,
    scratch: Vec<u8>,
}

impl FileRoot {
    fn clients_path(&self) -> PathBuf {
        self.root.join(CLIENTS_FILE)
    }

    /// Truncate the server file to its version and write `info`.
    fn write_server_info(&mut self, info: &ServerInfo) -> StoreResult<()> {
        let file = self.server_file.as_mut().ok_or(StoreError::Closed)?;
        file.set_len(VERSION_SIZE)?;
        file.seek(SeekFrom::Start(VERSION_SIZE))?;
        write_record(file, &mut self.scratch, NO_TYPE, info, &self.shared.crc)?;
        Ok(())
    }

    /// Server info of a previous run, `None` for a fresh store.
    fn recover_server_info(&mut self) -> StoreResult<Option<ServerInfo>> {
        let file = self.server_file.as_mut().ok_or(StoreError::Closed)?;
        let mut buf = Vec::new();
        let Some((_, size)) = read_record(file, &mut buf, false, &self.shared.crc, self.shared.options.do_crc)?
        else {
            return Ok(None);
        };
        let expected = VERSION_SIZE + (RECORD_HEADER_SIZE + size) as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(StoreError::Corrupted(format!(
                "incorrect file size, expected {} bytes, got {} bytes",
                expected, actual
            )));
        }
        Ok(Some(decode_payload(&buf[..size])?))
    }

    /// Replay the client log into the final set of clients.
    fn recover_clients(&mut self) -> StoreResult<HashMap<String, ClientInfo>> {
        let check_crc = self.shared.options.do_crc;
        let file = self.clients_file.as_ref().ok_or(StoreError::Closed)?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut clients = HashMap::new();

        while let Some((rec_type, size)) = read_record(&mut reader, &mut buf, true, &self.shared.crc, check_crc)? {
            self.cli_file_size += (RECORD_HEADER_SIZE + size) as u64;
            match rec_type {
                CLIENT_REC_ADD => {
                    let info: ClientInfo = decode_payload(&buf[..size])?;
                    clients.insert(info.id.clone(), info);
                }
                CLIENT_REC_DEL => {
                    let del: ClientDelete = decode_payload(&buf[..size])?;
                    clients.remove(&del.id);
                    self.cli_delete_recs += 1;
                }
                other => {
                    return Err(StoreError::Corrupted(format!(
                        "invalid client record type: {}",
                        other
                    )))
                }
            }
        }
        Ok(clients)
    }

    fn write_client_record<T: Serialize>(&mut self, rec_type: u8, rec: &T) -> StoreResult<()> {
        let file = self.clients_file.as_mut().ok_or(StoreError::Closed)?;
        let size = write_record(file, &mut self.scratch, rec_type, rec, &self.shared.crc)?;
        self.cli_file_size += size as u64;
        Ok(())
    }

    fn should_compact_clients(&self, live: usize) -> bool {
        let opts = &self.shared.options;
        if !opts.compact_enabled {
            return false;
        }
        if opts.compact_min_file_size > 0 && (self.cli_file_size as i64) < opts.compact_min_file_size {
            return false;
        }
        let total = self.cli_delete_recs + live;
        let frag = if total == 0 { 0 } else { self.cli_delete_recs * 100 / total };
        if frag < opts.compact_fragmentation as usize {
            return false;
        }
        match self.cli_compact_ts {
            Some(ts) => ts.elapsed() >= opts.compact_interval,
            None => true,
        }
    }

    /// Rewrite the live clients into a temporary file and swap it in.
    fn compact_clients(&mut self, clients: &HashMap<String, Arc<Client>>) -> StoreResult<()> {
        let path = self.clients_path();
        let temp_path = temp_path_for(&path);
        let written = self.write_live_clients(&temp_path, clients);
        let (temp, file_size) = match written {
            Ok(w) => w,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&temp_path) {
                    tracing::warn!(path = %temp_path.display(), error = %rm, "unable to remove compaction file");
                }
                return Err(e);
            }
        };

        let active = self.clients_file.take().ok_or(StoreError::Closed)?;
        let (file, swapped) = swap_files(temp, &temp_path, active, &path, open_file);
        self.clients_file = file;
        swapped?;

        tracing::debug!(before = self.cli_file_size, after = file_size, "compacted clients file");
        self.cli_delete_recs = 0;
        self.cli_file_size = file_size;
        self.cli_compact_ts = Some(Instant::now());
        Ok(())
    }

    fn write_live_clients(
        &mut self,
        temp_path: &Path,
        clients: &HashMap<String, Arc<Client>>,
    ) -> StoreResult<(File, u64)> {
        let temp = create_versioned(temp_path)?;
        let mut bw = BufWriter::with_capacity(COMPACT_BUF_SIZE, temp);
        let mut ids: Vec<&String> = clients.keys().collect();
        ids.sort();
        let mut file_size = 0u64;
        for id in ids {
            let info = &clients[id].info;
            file_size += write_record(&mut bw, &mut self.scratch, CLIENT_REC_ADD, info, &self.shared.crc)? as u64;
        }
        let temp = bw.into_inner().map_err(|e| e.into_error())?;
        temp.sync_all()?;
        Ok((temp, file_size))
    }

    fn close(&mut self) -> StoreResult<()> {
        self.server_file = None;
        self.clients_file = None;
        Ok(())
    }
}

/// Store persisting channels, subscriptions and clients under a root
/// directory
pub struct FileStore {
    generic: GenericStore<FileRoot>,
}

impl FileStore {
    /// Open (or create) the store at `root`, logging through `tracing`.
    ///
    /// Returns the recovered state if the root holds server info from a
    /// previous run.
    pub fn open<P: AsRef<Path>>(
        root: P,
        limits: &StoreLimits,
        options: FileStoreOptions,
    ) -> StoreResult<(Self, Option<RecoveredState>)> {
        Self::open_with_logger(root, limits, options, default_logger())
    }

    pub fn open_with_logger<P: AsRef<Path>>(
        root: P,
        limits: &StoreLimits,
        options: FileStoreOptions,
        logger: SharedLogger,
    ) -> StoreResult<(Self, Option<RecoveredState>)> {
        Self::open_root(root.as_ref(), limits, options, logger, true)
    }

    /// Open an existing root to look at it without changing it.
    ///
    /// Without `limits` nothing is evicted on recovery, and leftover
    /// compaction files are kept since a live store may still own them.
    /// Returns `None` when `root` holds no server info.
    pub fn open_for_inspection<P: AsRef<Path>>(
        root: P,
        limits: Option<&StoreLimits>,
        options: FileStoreOptions,
    ) -> StoreResult<Option<(Self, RecoveredState)>> {
        let root = root.as_ref();
        if !root.join(SERVER_FILE).is_file() {
            return Ok(None);
        }
        let unlimited = StoreLimits::unlimited();
        let limits = limits.unwrap_or(&unlimited);
        let (store, recovered) = Self::open_root(root, limits, options, default_logger(), false)?;
        Ok(recovered.map(|recovered| (store, recovered)))
    }

    fn open_root(
        root: &Path,
        limits: &StoreLimits,
        options: FileStoreOptions,
        logger: SharedLogger,
        cleanup_temp: bool,
    ) -> StoreResult<(Self, Option<RecoveredState>)> {
        let root = root.to_path_buf();
        let shared = Arc::new(FileShared::new(options, Arc::clone(&logger)));
        let ext = FileRoot {
            root: root.clone(),
            shared: Arc::clone(&shared),
            server_file: None,
            clients_file: None,
            cli_file_size: 0,
            cli_delete_recs: 0,
            cli_compact_ts: None,
            scratch: Vec::new(),
        };
        // From here on, dropping the store on error closes whatever was opened.
        let store = Self {
            generic: GenericStore::new(TYPE_FILE, limits, logger, ext)?,
        };

        fs::create_dir_all(&root)?;
        if cleanup_temp {
            let cleaned = cleanup_temp_files(&root)?;
            if cleaned > 0 {
                tracing::debug!(root = %root.display(), cleaned, "removed leftover temporary files");
            }
        }

        let (info, clients) = {
            let mut st = store.generic.write();
            let state = &mut *st;
            let ext = &mut state.ext;
            ext.server_file = Some(open_file_with(
                &root.join(SERVER_FILE),
                OpenOptions::new().read(true).write(true).create(true),
            )?);
            ext.clients_file = Some(open_file(&ext.clients_path())?);

            let Some(info) = ext.recover_server_info()? else {
                drop(st);
                return Ok((store, None));
            };
            let clients = ext.recover_clients()?;
            for ci in clients.into_values() {
                let client = Arc::new(Client::new(ci.id.clone(), ci.hb_inbox, None));
                state.clients.insert(ci.id, client);
            }
            (info, state.clients.clone())
        };

        let mut recovered_subs = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let channel = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();
            if cleanup_temp {
                cleanup_temp_files(&dir)?;
            }

            let limits = store.generic.channel_limits(&channel);
            let msgs = FileMsgStore::open(Arc::clone(&shared), &dir, &channel, limits.msgs, true)?;
            let subs = FileSubStore::open(Arc::clone(&shared), &dir, &channel, limits.subs, true)?;
            recovered_subs.insert(channel.clone(), subs.recovered_subs());
            store.generic.insert_channel(&channel, Arc::new(msgs), Arc::new(subs));
        }

        let mut clients: Vec<Arc<Client>> = clients.into_values().collect();
        clients.sort_by(|a, b| a.id().cmp(b.id()));
        tracing::debug!(
            root = %root.display(),
            clients = clients.len(),
            channels = recovered_subs.len(),
            "recovered file store"
        );
        let recovered = RecoveredState {
            info,
            clients,
            subs: recovered_subs,
        };
        Ok((store, Some(recovered)))
    }

    /// Root directory of the store
    pub fn root(&self) -> PathBuf {
        self.generic.read().ext.root.clone()
    }

    /// Options the store was opened with
    pub fn options(&self) -> FileStoreOptions {
        self.generic.read().ext.shared.options.clone()
    }

    /// Effective limits of `channel`
    pub fn channel_limits(&self, channel: &str) -> ChannelLimits {
        self.generic.channel_limits(channel)
    }
}

impl Store for FileStore {
    fn name(&self) -> &'static str {
        self.generic.name()
    }

    fn init(&self, info: &ServerInfo) -> StoreResult<()> {
        self.generic.write().ext.write_server_info(info)
    }

    fn create_channel(
        &self,
        channel: &str,
        user_data: Option<UserData>,
    ) -> StoreResult<(Arc<ChannelStore>, bool)> {
        self.generic.create_channel_with(channel, user_data, |ext, limits| {
            let dir = ext.root.join(channel);
            fs::create_dir_all(&dir)?;
            let msgs = FileMsgStore::open(Arc::clone(&ext.shared), &dir, channel, limits.msgs, false)?;
            let subs = FileSubStore::open(Arc::clone(&ext.shared), &dir, channel, limits.subs, false)?;
            let msgs: Arc<dyn MsgStore> = Arc::new(msgs);
            let subs: Arc<dyn SubStore> = Arc::new(subs);
            Ok((msgs, subs))
        })
    }

    fn lookup_channel(&self, channel: &str) -> Option<Arc<ChannelStore>> {
        self.generic.lookup_channel(channel)
    }

    fn has_channel(&self) -> bool {
        self.generic.has_channel()
    }

    fn msgs_state(&self, channel: &str) -> StoreResult<(usize, u64)> {
        self.generic.msgs_state(channel)
    }

    fn set_limits(&self, limits: &StoreLimits) -> StoreResult<()> {
        self.generic.set_limits(limits)
    }

    fn add_client(
        &self,
        client_id: &str,
        hb_inbox: &str,
        user_data: Option<UserData>,
    ) -> StoreResult<(Arc<Client>, bool)> {
        self.generic.add_client_with(client_id, hb_inbox, user_data, |ext, info| {
            ext.write_client_record(CLIENT_REC_ADD, info)
        })
    }

    fn get_client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.generic.get_client(client_id)
    }

    fn get_clients(&self) -> HashMap<String, Arc<Client>> {
        self.generic.get_clients()
    }

    fn get_clients_count(&self) -> usize {
        self.generic.get_clients_count()
    }

    fn delete_client(&self, client_id: &str) -> StoreResult<Option<Arc<Client>>> {
        self.generic.delete_client_with(client_id, |ext, info, remaining| {
            ext.write_client_record(CLIENT_REC_DEL, &ClientDelete { id: info.id.clone() })?;
            ext.cli_delete_recs += 1;
            if ext.should_compact_clients(remaining.len()) {
                if let Err(e) = ext.compact_clients(remaining) {
                    ext.shared
                        .logger
                        .error(&format!("STAN: Unable to compact clients file: {}", e));
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> StoreResult<()> {
        self.generic.close_with(|ext| ext.close())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = Store::close(self);
    }
}
