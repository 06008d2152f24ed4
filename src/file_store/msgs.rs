//! File message log
//!
//! A channel's messages are spread over numbered slices, each a data file
//! (`msgs.<n>.dat`, one record per message) and an index file
//! (`msgs.<n>.idx`, one 32-byte entry per message). Only the last slice is
//! written to. Retention removes messages from the head of the first slice
//! and retires a slice once all its messages are gone.
//!
//! With a write buffer, index entries of messages still sitting in the
//! buffer are kept in memory and written once the buffer is flushed, so the
//! index never points past the data on disk.
//!
//! One background thread per log closes idle slice files, shrinks the
//! buffer, expires messages by age and evicts the cache.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::buffer::BufferedWriter;
use super::cache::{MsgsCache, CACHE_TTL};
use super::crc::CrcTable;
use super::record::{
    decode_payload, encode_record, open_file, open_file_with, read_record, write_encoded, Buffered,
    NO_TYPE, RECORD_HEADER_SIZE, VERSION_SIZE,
};
use super::{
    FileShared, BAK_SUFFIX, BKG_TASKS_INTERVAL, BUF_SHRINK_INTERVAL, DAT_SUFFIX, IDX_SUFFIX,
    MSG_BUF_MIN_SHRINK_SIZE, MSG_FILES_PREFIX,
};
use crate::error::{StoreError, StoreResult};
use crate::limits::MsgStoreLimits;
use crate::store::{MsgLogBase, MsgStore};
use crate::types::Message;
use crate::utils::{duration_nanos, next_timestamp, now_nanos};

/// Size of an index entry: seq, offset, timestamp, size, CRC
pub const MSG_INDEX_REC_SIZE: usize = 8 + 8 + 8 + 4 + 4;

/// Bytes accounted per message on top of its encoded size
pub const MSG_RECORD_OVERHEAD: u64 = (RECORD_HEADER_SIZE + MSG_INDEX_REC_SIZE) as u64;

/// Slice files opened for lookups are closed after this idle time
const SLICE_IDLE_NANOS: i64 = 1_000_000_000;

/// Location and size of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MsgRecord {
    offset: u64,
    timestamp: i64,
    size: u32,
}

impl MsgRecord {
    fn accounted_size(&self) -> u64 {
        self.size as u64 + MSG_RECORD_OVERHEAD
    }
}

#[derive(Debug)]
struct FileSlice {
    dat_path: PathBuf,
    idx_path: PathBuf,
    first_seq: u64,
    last_seq: u64,
    /// Messages removed by retention
    rm_count: usize,
    msgs_count: usize,
    msgs_size: u64,
    /// Timestamp of the first message written to the slice
    first_write: i64,
    /// Data file opened for lookups
    file: Option<File>,
    last_used: i64,
}

impl FileSlice {
    fn new(dat_path: PathBuf, idx_path: PathBuf) -> Self {
        Self {
            dat_path,
            idx_path,
            first_seq: 0,
            last_seq: 0,
            rm_count: 0,
            msgs_count: 0,
            msgs_size: 0,
            first_write: 0,
            file: None,
            last_used: 0,
        }
    }

    fn contains(&self, seq: u64) -> bool {
        self.first_seq <= seq && seq <= self.last_seq
    }

    fn add(&mut self, seq: u64, rec: &MsgRecord) {
        if self.first_seq == 0 {
            self.first_seq = seq;
        }
        self.last_seq = seq;
        self.msgs_count += 1;
        self.msgs_size += rec.accounted_size();
        if self.first_write == 0 {
            self.first_write = rec.timestamp;
        }
    }

    fn is_drained(&self) -> bool {
        self.msgs_count == self.rm_count
    }
}

/// Thresholds starting a new slice (0: not checked)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SliceLimits {
    max_msgs: usize,
    max_bytes: u64,
    max_age: i64,
}

impl SliceLimits {
    /// Configured slice limits, or limits derived from the channel limits
    /// (a quarter of each) when none are configured.
    fn new(shared: &FileShared, limits: &MsgStoreLimits) -> Self {
        let opts = &shared.options;
        if opts.has_slice_limits() {
            return Self {
                max_msgs: opts.slice_max_msgs,
                max_bytes: opts.slice_max_bytes,
                max_age: duration_nanos(opts.slice_max_age),
            };
        }
        let mut sl = Self::default();
        if limits.max_msgs > 0 {
            sl.max_msgs = (limits.max_msgs as usize / 4).max(1);
        }
        if limits.max_bytes > 0 {
            sl.max_bytes = (limits.max_bytes as u64 / 4).max(1);
        }
        if !limits.max_age.is_zero() {
            sl.max_age = (duration_nanos(limits.max_age) / 4).max(1_000_000_000);
        }
        sl
    }

    fn is_set(&self) -> bool {
        self.max_msgs > 0 || self.max_bytes > 0 || self.max_age > 0
    }

    fn is_full(&self, slice: &FileSlice, now: i64) -> bool {
        (self.max_bytes > 0 && slice.msgs_size >= self.max_bytes)
            || (self.max_msgs > 0 && slice.msgs_count >= self.max_msgs)
            || (self.max_age > 0 && slice.first_write > 0 && now - slice.first_write >= self.max_age)
    }
}

/// Message whose index entry waits for the buffer to be flushed
struct BufferedMsg {
    msg: Arc<Message>,
    rec: MsgRecord,
}

struct FileMsgState {
    base: MsgLogBase,
    shared: Arc<FileShared>,
    dir: PathBuf,
    scratch: Vec<u8>,
    /// Data and index files of the current slice
    file: Option<File>,
    idx_file: Option<File>,
    writer: Option<BufferedWriter>,
    slices: BTreeMap<u32, FileSlice>,
    curr_slice: Option<u32>,
    last_slice_seq: u32,
    slice_limits: SliceLimits,
    /// Records of sequences `first..=last`
    records: VecDeque<MsgRecord>,
    /// Write offset in the current data file
    w_offset: u64,
    last_timestamp: i64,
    first_msg: Option<Arc<Message>>,
    last_msg: Option<Arc<Message>>,
    /// Next age expiration (0: none)
    expiration: i64,
    pending: BTreeMap<u64, BufferedMsg>,
    cache: MsgsCache,
    /// Some slice file is open for lookups
    check_slices: bool,
    wake: Option<SyncSender<()>>,
    archive_tasks: Vec<JoinHandle<()>>,
}

impl FileMsgState {
    fn new(shared: Arc<FileShared>, dir: &Path, channel: &str, limits: MsgStoreLimits) -> Self {
        let slice_limits = SliceLimits::new(&shared, &limits);
        let writer = match shared.options.buffer_size {
            0 => None,
            max => Some(BufferedWriter::new(MSG_BUF_MIN_SHRINK_SIZE, max)),
        };
        Self {
            base: MsgLogBase::new(channel, limits, Arc::clone(&shared.logger)),
            shared,
            dir: dir.to_path_buf(),
            scratch: Vec::new(),
            file: None,
            idx_file: None,
            writer,
            slices: BTreeMap::new(),
            curr_slice: None,
            last_slice_seq: 0,
            slice_limits,
            records: VecDeque::with_capacity(64),
            w_offset: VERSION_SIZE,
            last_timestamp: 0,
            first_msg: None,
            last_msg: None,
            expiration: 0,
            pending: BTreeMap::new(),
            cache: MsgsCache::new(),
            check_slices: false,
            wake: None,
            archive_tasks: Vec::new(),
        }
    }

    fn slice_paths(&self, slice_seq: u32) -> (PathBuf, PathBuf) {
        let name = format!("{}{}", MSG_FILES_PREFIX, slice_seq);
        (
            self.dir.join(format!("{}{}", name, DAT_SUFFIX)),
            self.dir.join(format!("{}{}", name, IDX_SUFFIX)),
        )
    }

    fn record(&self, seq: u64) -> Option<MsgRecord> {
        if self.base.first == 0 || seq < self.base.first {
            return None;
        }
        self.records.get((seq - self.base.first) as usize).copied()
    }

    fn open_data_and_index_files(&mut self, dat_path: &Path, idx_path: &Path) -> StoreResult<()> {
        let file = open_file(dat_path)?;
        let idx_file = open_file(idx_path)?;
        self.file = Some(file);
        self.idx_file = Some(idx_file);
        Ok(())
    }

    /// Flush, then release the current data and index files.
    fn close_data_and_index_files(&mut self) -> StoreResult<()> {
        let result = self.flush();
        self.file = None;
        self.idx_file = None;
        result
    }

    fn flush(&mut self) -> StoreResult<()> {
        if let (Some(writer), Some(file)) = (self.writer.as_mut(), self.file.as_mut()) {
            writer.flush(file)?;
        }
        self.process_buffered_msgs()?;
        if self.shared.options.do_sync {
            if let Some(file) = &self.file {
                file.sync_data()?;
            }
            if let Some(idx) = &self.idx_file {
                idx.sync_data()?;
            }
        }
        Ok(())
    }

    /// Write the index entries of messages whose data left the buffer.
    fn process_buffered_msgs(&mut self) -> StoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let Some(idx_file) = self.idx_file.as_mut() else {
            return Ok(());
        };
        let mut buf = Vec::with_capacity(self.pending.len() * MSG_INDEX_REC_SIZE);
        for (seq, bm) in &self.pending {
            buf.extend_from_slice(&encode_index(*seq, &bm.rec, &self.shared.crc));
        }
        idx_file.write_all(&buf)?;
        self.pending.clear();
        Ok(())
    }

    /// Start a new slice if there is none or the current one is full.
    fn roll_slice_if_needed(&mut self, now: i64) -> StoreResult<()> {
        let full = match self.curr_slice.and_then(|s| self.slices.get(&s)) {
            None => true,
            Some(slice) => self.slice_limits.is_set() && self.slice_limits.is_full(slice, now),
        };
        if !full {
            return Ok(());
        }

        let previous = self.curr_slice;
        let new_seq = self.last_slice_seq + 1;
        if previous.is_some() {
            self.close_data_and_index_files()?;
        }
        let (dat_path, idx_path) = self.slice_paths(new_seq);
        self.open_data_and_index_files(&dat_path, &idx_path)?;

        tracing::debug!(channel = %self.base.subject, slice = new_seq, "new message slice");
        self.slices.insert(new_seq, FileSlice::new(dat_path, idx_path));
        self.curr_slice = Some(new_seq);
        self.last_slice_seq = new_seq;
        self.w_offset = VERSION_SIZE;

        // A drained first slice is kept while it is the only one.
        if self.slices.len() == 2 {
            if let Some(prev) = previous.and_then(|p| self.slices.get(&p)) {
                if prev.is_drained() {
                    self.remove_first_slice();
                }
            }
        }
        Ok(())
    }

    fn store(&mut self, data: &[u8]) -> StoreResult<u64> {
        if self.base.closed {
            return Err(StoreError::Closed);
        }
        let now = now_nanos();
        self.roll_slice_if_needed(now)?;

        let seq = self.base.last + 1;
        let timestamp = next_timestamp(self.last_timestamp);
        let msg = Arc::new(Message::new(seq, self.base.subject.clone(), data.to_vec(), timestamp));

        let total = encode_record(&mut self.scratch, NO_TYPE, &*msg, &self.shared.crc)?;
        let rec = MsgRecord {
            offset: self.w_offset,
            timestamp,
            size: (total - RECORD_HEADER_SIZE) as u32,
        };

        let needs_expand = self.writer.as_ref().map_or(false, |w| total > w.available());
        if needs_expand {
            if let (Some(writer), Some(file)) = (self.writer.as_mut(), self.file.as_mut()) {
                writer.expand(file, total)?;
            }
            self.process_buffered_msgs()?;
        }

        let in_buffer = {
            let Self {
                file,
                writer,
                scratch,
                ..
            } = self;
            let file = file.as_mut().ok_or(StoreError::Closed)?;
            match writer.as_mut() {
                Some(writer) => {
                    write_encoded(&mut Buffered { writer: &mut *writer, file }, &scratch[..total])?;
                    if writer.shrink_requested() {
                        writer.check_shrink_request();
                    }
                    writer.buffered() >= total
                }
                None => {
                    write_encoded(file, &scratch[..total])?;
                    false
                }
            }
        };

        if in_buffer {
            self.pending.insert(
                seq,
                BufferedMsg {
                    msg: Arc::clone(&msg),
                    rec,
                },
            );
        } else if let Some(idx_file) = self.idx_file.as_mut() {
            idx_file.write_all(&encode_index(seq, &rec, &self.shared.crc))?;
        }

        if self.base.first == 0 || self.base.first == seq {
            self.base.first = seq;
            self.first_msg = Some(Arc::clone(&msg));
            let max_age = duration_nanos(self.base.limits.max_age);
            if max_age > 0 {
                self.expiration = timestamp + max_age;
                if let Some(wake) = &self.wake {
                    let _ = wake.try_send(());
                }
            }
        }
        self.base.last = seq;
        self.last_timestamp = timestamp;
        self.last_msg = Some(Arc::clone(&msg));
        self.records.push_back(rec);
        self.cache.add(msg, timestamp + CACHE_TTL);
        self.w_offset += total as u64;

        self.base.total_count += 1;
        self.base.total_bytes += rec.accounted_size();
        if let Some(slice) = self.curr_slice.and_then(|s| self.slices.get_mut(&s)) {
            slice.add(seq, &rec);
        }

        if self.base.has_count_limits() {
            self.enforce_limits(true);
        }
        Ok(seq)
    }

    /// Evict from the head until within count and byte limits.
    fn enforce_limits(&mut self, report: bool) {
        while self.base.over_limits() {
            self.remove_first_msg();
            if report {
                self.base.report_hit_limit();
            }
        }
    }

    /// Remove expired messages; returns the next expiration (0: none).
    fn expire_msgs(&mut self, now: i64) -> i64 {
        let max_age = duration_nanos(self.base.limits.max_age);
        loop {
            let Some(rec) = self.records.front() else {
                self.expiration = 0;
                break;
            };
            let elapsed = now - rec.timestamp;
            if elapsed < max_age {
                self.expiration = now + (max_age - elapsed);
                break;
            }
            self.remove_first_msg();
        }
        self.expiration
    }

    /// Remove the first message, retiring its slice if it is now empty and
    /// not the last one.
    fn remove_first_msg(&mut self) {
        let Some(rec) = self.records.pop_front() else {
            return;
        };
        let removed = self.base.first;
        self.base.total_count -= 1;
        self.base.total_bytes = self.base.total_bytes.saturating_sub(rec.accounted_size());
        self.base.first += 1;
        self.cache.remove(removed);
        self.first_msg = None;
        if self.base.first > self.base.last {
            self.last_msg = None;
        }

        let slice_count = self.slices.len();
        let Some(slice) = self.slices.values_mut().next() else {
            return;
        };
        slice.rm_count += 1;
        if slice.is_drained() && slice_count > 1 {
            self.remove_first_slice();
        } else {
            slice.first_seq = self.base.first;
        }
    }

    /// Remove (or hand to the archive script) the first slice. The last
    /// slice is never removed.
    fn remove_first_slice(&mut self) {
        if self.slices.len() < 2 {
            return;
        }
        let Some((slice_seq, mut slice)) = self.slices.pop_first() else {
            return;
        };
        slice.file = None;
        tracing::debug!(channel = %self.base.subject, slice = slice_seq, "removing message slice");

        let mut remove = true;
        if let Some(script) = self.shared.options.slice_archive_script.clone() {
            let dat_bak = with_suffix(&slice.dat_path, BAK_SUFFIX);
            let idx_bak = with_suffix(&slice.idx_path, BAK_SUFFIX);
            let logger = Arc::clone(&self.base.logger);
            let renamed = fs::rename(&slice.dat_path, &dat_bak).and_then(|_| {
                fs::rename(&slice.idx_path, &idx_bak).inspect_err(|_| {
                    if let Err(e) = fs::remove_file(&dat_bak) {
                        logger.error(&format!("STAN: Unable to remove {}: {}", dat_bak.display(), e));
                    }
                })
            });
            match renamed {
                Ok(()) => {
                    remove = false;
                    self.run_archive_script(script, dat_bak, idx_bak);
                }
                Err(e) => self.base.logger.error(&format!(
                    "STAN: Unable to rename slice files of {:?} for archiving: {}",
                    self.base.subject, e
                )),
            }
        }
        if remove {
            for path in [&slice.dat_path, &slice.idx_path] {
                if let Err(e) = fs::remove_file(path) {
                    self.base.logger.error(&format!(
                        "STAN: Unable to remove slice file {} of {:?}: {}",
                        path.display(),
                        self.base.subject,
                        e
                    ));
                }
            }
        }
    }

    fn run_archive_script(&mut self, script: PathBuf, dat_bak: PathBuf, idx_bak: PathBuf) {
        let subject = self.base.subject.clone();
        let logger = Arc::clone(&self.base.logger);
        let spawned = thread::Builder::new()
            .name("msg-store-archive".to_string())
            .spawn(move || {
                let output = Command::new(&script).arg(&subject).arg(&dat_bak).arg(&idx_bak).output();
                match output {
                    Ok(out) if out.status.success() => logger.notice(&format!(
                        "STAN: Output of archive script for {} ({} and {}): {}",
                        subject,
                        dat_bak.display(),
                        idx_bak.display(),
                        combined_output(&out)
                    )),
                    Ok(out) => logger.error(&format!(
                        "STAN: Error invoking archive script {:?}: {} (output={})",
                        script,
                        out.status,
                        combined_output(&out)
                    )),
                    Err(e) => logger.error(&format!(
                        "STAN: Error invoking archive script {:?}: {}",
                        script, e
                    )),
                }
            });
        match spawned {
            Ok(handle) => self.archive_tasks.push(handle),
            Err(e) => self.base.logger.error(&format!("STAN: Unable to start archive script: {}", e)),
        }
    }

    /// Data file holding `seq`, opening a retired-for-writing slice on demand.
    fn file_for_seq(&mut self, seq: u64, now: i64) -> StoreResult<&mut File> {
        let in_current = self
            .curr_slice
            .and_then(|s| self.slices.get(&s))
            .map_or(false, |s| s.contains(seq));
        if in_current {
            return self.file.as_mut().ok_or(StoreError::Closed);
        }

        let subject = &self.base.subject;
        let slice = self
            .slices
            .values_mut()
            .find(|s| s.contains(seq))
            .ok_or_else(|| {
                StoreError::Corrupted(format!(
                    "could not find file slice for store {:?}, message seq: {}",
                    subject, seq
                ))
            })?;
        slice.last_used = now;
        if slice.file.is_none() {
            slice.file = Some(open_file_with(&slice.dat_path, OpenOptions::new().read(true))?);
            self.check_slices = true;
        }
        slice.file.as_mut().ok_or(StoreError::Closed)
    }

    fn lookup(&mut self, seq: u64) -> StoreResult<Option<Arc<Message>>> {
        let Some(rec) = self.record(seq) else {
            return Ok(None);
        };
        let now = now_nanos();
        if let Some(msg) = self.cache.get(seq, now) {
            return Ok(Some(msg));
        }
        if let Some(bm) = self.pending.get(&seq) {
            let msg = Arc::clone(&bm.msg);
            self.cache.add(Arc::clone(&msg), now + CACHE_TTL);
            return Ok(Some(msg));
        }

        let check_crc = self.shared.options.do_crc;
        let crc = self.shared.crc.clone();
        let mut buf = std::mem::take(&mut self.scratch);
        let read = (|| -> StoreResult<Message> {
            let file = self.file_for_seq(seq, now)?;
            file.seek(SeekFrom::Start(rec.offset))?;
            match read_record(file, &mut buf, false, &crc, check_crc)? {
                Some((_, size)) => decode_payload::<Message>(&buf[..size]),
                None => Err(StoreError::Corrupted(format!("no record at offset {}", rec.offset))),
            }
        })();
        self.scratch = buf;
        let msg = read?;
        if msg.sequence != seq {
            return Err(StoreError::Corrupted(format!(
                "expected message {} at offset {}, found {}",
                seq, rec.offset, msg.sequence
            )));
        }
        let msg = Arc::new(msg);
        self.cache.add(Arc::clone(&msg), now + CACHE_TTL);
        Ok(Some(msg))
    }

    fn get_sequence_from_timestamp(&self, timestamp: i64) -> u64 {
        if self.records.is_empty() {
            return self.base.last + 1;
        }
        let index = self.records.partition_point(|r| r.timestamp < timestamp);
        self.base.first + index as u64
    }

    /// One pass of the background tasks.
    fn background_tick(&mut self, now: i64, shrink_due: bool) {
        if self.check_slices {
            let mut opened = 0;
            for slice in self.slices.values_mut() {
                if slice.file.is_some() {
                    if now - slice.last_used >= SLICE_IDLE_NANOS {
                        slice.file = None;
                    } else {
                        opened += 1;
                    }
                }
            }
            self.check_slices = opened > 0;
        }

        if shrink_due {
            if let Err(e) = self.try_shrink_buffer() {
                self.base
                    .logger
                    .error(&format!("STAN: Unable to shrink buffer of {:?}: {}", self.base.subject, e));
            }
        }

        if !self.base.limits.max_age.is_zero() && self.expiration > 0 && now >= self.expiration {
            self.expire_msgs(now);
        }

        if !self.cache.is_empty() {
            self.cache.evict(now);
        }
    }

    fn try_shrink_buffer(&mut self) -> StoreResult<()> {
        if let (Some(writer), Some(file)) = (self.writer.as_mut(), self.file.as_mut()) {
            writer.try_shrink(file)?;
            if writer.buffered() == 0 {
                self.process_buffered_msgs()?;
            }
        }
        Ok(())
    }

    /// Rebuild the state of one slice from its index, or from its data file
    /// when there is no index (writing the index along the way).
    fn recover_slice(&mut self, slice_seq: u32) -> StoreResult<()> {
        let (dat_path, idx_path) = self.slice_paths(slice_seq);
        let use_idx = idx_path.exists();
        self.open_data_and_index_files(&dat_path, &idx_path)?;
        let mut slice = FileSlice::new(dat_path, idx_path);

        let result = if use_idx {
            self.recover_from_index(&mut slice)
        } else {
            let rebuilt = self.recover_from_data(&mut slice);
            if rebuilt.is_err() {
                // Scan the data file again on next start.
                self.idx_file = None;
                if let Err(e) = fs::remove_file(&slice.idx_path) {
                    tracing::error!(path = %slice.idx_path.display(), error = %e, "unable to remove partial index");
                }
            }
            rebuilt
        };

        let closed = self.close_data_and_index_files();
        result?;
        closed?;

        if slice.msgs_count > 0 {
            self.base.total_count += slice.msgs_count;
            self.base.total_bytes += slice.msgs_size;
            self.slices.insert(slice_seq, slice);
            self.last_slice_seq = self.last_slice_seq.max(slice_seq);
        }
        Ok(())
    }

    fn recover_from_index(&mut self, slice: &mut FileSlice) -> StoreResult<()> {
        let do_crc = self.shared.options.do_crc;
        let idx_file = self.idx_file.as_mut().ok_or(StoreError::Closed)?;
        let mut reader = BufReader::new(idx_file);
        let mut entries = Vec::new();
        let mut buf = [0u8; MSG_INDEX_REC_SIZE];
        loop {
            match reader.read_exact(&mut buf) {
                Ok(()) => entries.push(decode_index(&buf, &self.shared.crc, do_crc)?),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        for (seq, rec) in entries {
            self.add_recovered(slice, seq, rec)?;
        }
        Ok(())
    }

    fn recover_from_data(&mut self, slice: &mut FileSlice) -> StoreResult<()> {
        let do_crc = self.shared.options.do_crc;
        let crc = self.shared.crc.clone();
        let dat_file = self.file.as_mut().ok_or(StoreError::Closed)?;
        let mut reader = BufReader::new(&*dat_file);
        let mut recovered = Vec::new();
        let mut buf = Vec::new();
        let mut offset = VERSION_SIZE;
        while let Some((_, size)) = read_record(&mut reader, &mut buf, false, &crc, do_crc)? {
            let msg: Message = decode_payload(&buf[..size])?;
            let rec = MsgRecord {
                offset,
                timestamp: msg.timestamp,
                size: size as u32,
            };
            recovered.push((msg.sequence, rec));
            offset += (RECORD_HEADER_SIZE + size) as u64;
        }

        let idx_file = self.idx_file.as_mut().ok_or(StoreError::Closed)?;
        let mut idx = BufWriter::with_capacity(MSG_INDEX_REC_SIZE * 1000, &*idx_file);
        for (seq, rec) in &recovered {
            idx.write_all(&encode_index(*seq, rec, &crc))?;
        }
        idx.flush()?;
        drop(idx);
        idx_file.sync_all()?;

        for (seq, rec) in recovered {
            self.add_recovered(slice, seq, rec)?;
        }
        Ok(())
    }

    fn add_recovered(&mut self, slice: &mut FileSlice, seq: u64, rec: MsgRecord) -> StoreResult<()> {
        if self.base.first == 0 {
            self.base.first = seq;
        } else if seq != self.base.last + 1 {
            return Err(StoreError::Corrupted(format!(
                "message {} follows message {} in {}",
                seq,
                self.base.last,
                slice.dat_path.display()
            )));
        }
        self.base.last = seq;
        self.last_timestamp = rec.timestamp;
        self.records.push_back(rec);
        slice.add(seq, &rec);
        Ok(())
    }

    /// Recover every slice found in the channel directory and reopen the
    /// last one for writing.
    fn recover(&mut self) -> StoreResult<()> {
        let mut slice_seqs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(number) = name
                .strip_prefix(MSG_FILES_PREFIX)
                .and_then(|n| n.strip_suffix(DAT_SUFFIX))
            else {
                continue;
            };
            let slice_seq = number.parse::<u32>().map_err(|_| {
                StoreError::Corrupted(format!("message log has an invalid name: {}", name))
            })?;
            slice_seqs.push(slice_seq);
        }
        slice_seqs.sort_unstable();

        for slice_seq in slice_seqs {
            self.recover_slice(slice_seq)?;
        }

        if let Some((&last, slice)) = self.slices.last_key_value() {
            let (dat_path, idx_path) = (slice.dat_path.clone(), slice.idx_path.clone());
            self.open_data_and_index_files(&dat_path, &idx_path)?;
            if let Some(file) = self.file.as_mut() {
                self.w_offset = file.seek(SeekFrom::End(0))?;
            }
            self.curr_slice = Some(last);
        }

        self.enforce_limits(false);
        if !self.base.limits.max_age.is_zero() && self.base.total_count > 0 {
            self.expire_msgs(now_nanos());
        }
        tracing::debug!(
            channel = %self.base.subject,
            slices = self.slices.len(),
            first = self.base.first,
            last = self.base.last,
            "recovered message log"
        );
        Ok(())
    }

    /// Mark closed and release files. Returns the threads to join.
    fn close(&mut self) -> (StoreResult<()>, Vec<JoinHandle<()>>) {
        self.base.closed = true;
        for slice in self.slices.values_mut() {
            slice.file = None;
        }
        let result = if self.file.is_some() {
            self.close_data_and_index_files()
        } else {
            Ok(())
        };
        self.wake = None;
        (result, std::mem::take(&mut self.archive_tasks))
    }
}

/// Message log of a channel stored in files
pub struct FileMsgStore {
    state: Arc<RwLock<FileMsgState>>,
    tasks: Mutex<Option<JoinHandle<()>>>,
}

impl FileMsgStore {
    /// Create the log of `channel` in `dir`, recovering existing slices if
    /// `recover` is set.
    pub(crate) fn open(
        shared: Arc<FileShared>,
        dir: &Path,
        channel: &str,
        limits: MsgStoreLimits,
        recover: bool,
    ) -> StoreResult<Self> {
        let action = if recover { "recover" } else { "create" };
        let mut state = FileMsgState::new(shared, dir, channel, limits);
        if recover {
            if let Err(e) = state.recover() {
                let (_, archive_tasks) = state.close();
                join_all(archive_tasks);
                return Err(StoreError::channel("message", action, channel, e));
            }
        }

        let (wake_tx, wake_rx) = mpsc::sync_channel(1);
        state.wake = Some(wake_tx);
        let state = Arc::new(RwLock::new(state));

        let worker = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(format!("msg-store-{}", channel))
            .spawn(move || background_tasks(worker, wake_rx));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                let (_, archive_tasks) = state.write().close();
                join_all(archive_tasks);
                return Err(StoreError::channel("message", action, channel, e.into()));
            }
        };

        Ok(Self {
            state,
            tasks: Mutex::new(Some(handle)),
        })
    }

    /// Number of slices currently holding messages
    pub fn slice_count(&self) -> usize {
        self.state.read().slices.len()
    }

    /// Message count of each slice, in slice order
    pub fn slice_msg_counts(&self) -> Vec<usize> {
        self.state
            .read()
            .slices
            .values()
            .map(|s| s.msgs_count - s.rm_count)
            .collect()
    }
}

impl MsgStore for FileMsgStore {
    fn store(&self, data: &[u8]) -> StoreResult<u64> {
        self.state.write().store(data)
    }

    fn lookup(&self, seq: u64) -> StoreResult<Option<Arc<Message>>> {
        self.state.write().lookup(seq)
    }

    fn first_msg(&self) -> StoreResult<Option<Arc<Message>>> {
        let mut st = self.state.write();
        if st.first_msg.is_none() {
            let first = st.base.first;
            st.first_msg = st.lookup(first)?;
        }
        Ok(st.first_msg.clone())
    }

    fn last_msg(&self) -> StoreResult<Option<Arc<Message>>> {
        let mut st = self.state.write();
        if st.last_msg.is_none() {
            let last = st.base.last;
            st.last_msg = st.lookup(last)?;
        }
        Ok(st.last_msg.clone())
    }

    fn first_sequence(&self) -> u64 {
        self.state.read().base.first
    }

    fn last_sequence(&self) -> u64 {
        self.state.read().base.last
    }

    fn first_and_last_sequence(&self) -> (u64, u64) {
        let st = self.state.read();
        (st.base.first, st.base.last)
    }

    fn get_sequence_from_timestamp(&self, timestamp: i64) -> u64 {
        self.state.read().get_sequence_from_timestamp(timestamp)
    }

    fn state(&self) -> StoreResult<(usize, u64)> {
        let st = self.state.read();
        Ok((st.base.total_count, st.base.total_bytes))
    }

    fn flush(&self) -> StoreResult<()> {
        let mut st = self.state.write();
        if st.base.closed {
            return Ok(());
        }
        st.flush()
    }

    fn close(&self) -> StoreResult<()> {
        let (result, archive_tasks) = {
            let mut st = self.state.write();
            if st.base.closed {
                return Ok(());
            }
            st.close()
        };
        if let Some(handle) = self.tasks.lock().take() {
            let _ = handle.join();
        }
        join_all(archive_tasks);
        result
    }
}

impl Drop for FileMsgStore {
    fn drop(&mut self) {
        let _ = MsgStore::close(self);
    }
}

fn background_tasks(state: Arc<RwLock<FileMsgState>>, wake: Receiver<()>) {
    let mut last_shrink = now_nanos();
    let shrink_interval = duration_nanos(BUF_SHRINK_INTERVAL);
    loop {
        let now = now_nanos();
        let shrink_due = now - last_shrink >= shrink_interval;
        if shrink_due {
            last_shrink = now;
        }
        {
            let mut st = state.write();
            if st.base.closed {
                return;
            }
            st.background_tick(now, shrink_due);
        }
        match wake.recv_timeout(BKG_TASKS_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.join();
    }
}

fn encode_index(seq: u64, rec: &MsgRecord, crc: &CrcTable) -> [u8; MSG_INDEX_REC_SIZE] {
    let mut buf = [0u8; MSG_INDEX_REC_SIZE];
    buf[..8].copy_from_slice(&seq.to_le_bytes());
    buf[8..16].copy_from_slice(&rec.offset.to_le_bytes());
    buf[16..24].copy_from_slice(&rec.timestamp.to_le_bytes());
    buf[24..28].copy_from_slice(&rec.size.to_le_bytes());
    let checksum = crc.checksum(&buf[..28]);
    buf[28..].copy_from_slice(&checksum.to_le_bytes());
    buf
}

fn decode_index(buf: &[u8; MSG_INDEX_REC_SIZE], crc: &CrcTable, check_crc: bool) -> StoreResult<(u64, MsgRecord)> {
    let u64_at = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[at..at + 8]);
        u64::from_le_bytes(b)
    };
    let u32_at = |at: usize| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[at..at + 4]);
        u32::from_le_bytes(b)
    };
    if check_crc {
        let stored = u32_at(28);
        let computed = crc.checksum(&buf[..28]);
        if stored != computed {
            return Err(StoreError::Corrupted(format!(
                "expected crc to be 0x{:08x}, got 0x{:08x}",
                stored, computed
            )));
        }
    }
    let rec = MsgRecord {
        offset: u64_at(8),
        timestamp: u64_at(16) as i64,
        size: u32_at(24),
    };
    Ok((u64_at(0), rec))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn combined_output(out: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::options::FileStoreOptions;
    use crate::logger::testing::CaptureLogger;
    use crate::logger::SharedLogger;
    use tempfile::TempDir;

    fn shared(options: FileStoreOptions) -> Arc<FileShared> {
        shared_with_logger(options, Arc::new(CaptureLogger::default()))
    }

    fn shared_with_logger(options: FileStoreOptions, logger: SharedLogger) -> Arc<FileShared> {
        Arc::new(FileShared::new(options, logger))
    }

    fn slice_opts(max_msgs: usize) -> FileStoreOptions {
        FileStoreOptions::default().with_slice_config(max_msgs, 0, Duration::ZERO, None)
    }

    fn open(dir: &TempDir, options: FileStoreOptions, limits: MsgStoreLimits, recover: bool) -> FileMsgStore {
        FileMsgStore::open(shared(options), dir.path(), "foo", limits, recover).unwrap()
    }

    #[test]
    fn test_index_entry_layout() {
        let crc = CrcTable::default();
        let rec = MsgRecord {
            offset: 4,
            timestamp: 1234,
            size: 20,
        };
        let buf = encode_index(7, &rec, &crc);
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 7);
        assert_eq!(decode_index(&buf, &crc, true).unwrap(), (7, rec));

        let mut bad = buf;
        bad[9] ^= 0xFF;
        assert!(decode_index(&bad, &crc, true).unwrap_err().is_corruption());
        assert!(decode_index(&bad, &crc, false).is_ok());
    }

    #[test]
    fn test_slice_limits_derived_from_channel_limits() {
        let none = FileStoreOptions::default().with_slice_config(0, 0, Duration::ZERO, None);
        let limits = MsgStoreLimits {
            max_msgs: 10,
            max_bytes: 2,
            max_age: Duration::from_secs(2),
        };
        let sl = SliceLimits::new(&shared(none.clone()), &limits);
        assert_eq!(sl.max_msgs, 2);
        assert_eq!(sl.max_bytes, 1);
        assert_eq!(sl.max_age, 1_000_000_000);

        let sl = SliceLimits::new(&shared(none), &MsgStoreLimits::default());
        assert!(!sl.is_set());

        let sl = SliceLimits::new(&shared(slice_opts(5)), &limits);
        assert_eq!((sl.max_msgs, sl.max_bytes), (5, 0));
    }

    #[test]
    fn test_rollover_and_recovery() {
        let dir = TempDir::new().unwrap();
        let ms = open(&dir, slice_opts(10), MsgStoreLimits::default(), false);
        for i in 0..25u32 {
            assert_eq!(ms.store(&i.to_le_bytes()).unwrap(), i as u64 + 1);
        }
        assert_eq!(ms.slice_msg_counts(), vec![10, 10, 5]);
        let before = ms.state().unwrap();
        ms.close().unwrap();
        for n in 1..=3 {
            assert!(dir.path().join(format!("msgs.{}.dat", n)).exists());
            assert!(dir.path().join(format!("msgs.{}.idx", n)).exists());
        }

        let ms = open(&dir, slice_opts(10), MsgStoreLimits::default(), true);
        assert_eq!(ms.first_and_last_sequence(), (1, 25));
        assert_eq!(ms.state().unwrap(), before);
        for seq in [1u64, 10, 11, 25] {
            let msg = ms.lookup(seq).unwrap().unwrap();
            assert_eq!(msg.data, ((seq - 1) as u32).to_le_bytes());
        }
        // Appends continue in the last slice.
        assert_eq!(ms.store(b"next").unwrap(), 26);
        assert_eq!(ms.slice_msg_counts(), vec![10, 10, 6]);
    }

    #[test]
    fn test_missing_index_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let ms = open(&dir, FileStoreOptions::default(), MsgStoreLimits::default(), false);
        for data in [b"a", b"b", b"c"] {
            ms.store(data).unwrap();
        }
        ms.close().unwrap();
        let idx = dir.path().join("msgs.1.idx");
        let idx_len = fs::metadata(&idx).unwrap().len();
        fs::remove_file(&idx).unwrap();

        let ms = open(&dir, FileStoreOptions::default(), MsgStoreLimits::default(), true);
        assert_eq!(ms.first_and_last_sequence(), (1, 3));
        assert_eq!(ms.lookup(2).unwrap().unwrap().data, b"b");
        ms.close().unwrap();
        assert_eq!(fs::metadata(&idx).unwrap().len(), idx_len);
    }

    #[test]
    fn test_corrupted_data_fails_recovery_and_removes_partial_index() {
        let dir = TempDir::new().unwrap();
        let ms = open(&dir, FileStoreOptions::default(), MsgStoreLimits::default(), false);
        ms.store(b"hello").unwrap();
        ms.close().unwrap();

        let dat = dir.path().join("msgs.1.dat");
        let mut content = fs::read(&dat).unwrap();
        let last = content.len() - 3;
        content[last] ^= 0x01;
        fs::write(&dat, content).unwrap();
        fs::remove_file(dir.path().join("msgs.1.idx")).unwrap();

        let err = FileMsgStore::open(shared(FileStoreOptions::default()), dir.path(), "foo", MsgStoreLimits::default(), true)
            .err()
            .unwrap();
        assert!(err.is_corruption());
        assert!(err.to_string().starts_with("unable to recover message store for [foo]"));
        assert!(!dir.path().join("msgs.1.idx").exists());

        // Without CRC verification the payload is accepted.
        let opts = FileStoreOptions::default().with_crc(false);
        let ms = open(&dir, opts, MsgStoreLimits::default(), true);
        assert_eq!(ms.first_and_last_sequence(), (1, 1));
    }

    #[test]
    fn test_buffered_messages_are_served_from_memory() {
        let dir = TempDir::new().unwrap();
        let opts = FileStoreOptions::default().with_sync(false);
        let ms = open(&dir, opts, MsgStoreLimits::default(), false);
        ms.store(b"one").unwrap();
        ms.store(b"two").unwrap();
        // Nothing but versions reached the disk yet.
        assert_eq!(fs::metadata(dir.path().join("msgs.1.idx")).unwrap().len(), VERSION_SIZE);
        {
            let mut st = ms.state.write();
            st.cache.clear();
        }
        assert_eq!(ms.lookup(2).unwrap().unwrap().data, b"two");

        ms.flush().unwrap();
        assert_eq!(
            fs::metadata(dir.path().join("msgs.1.idx")).unwrap().len(),
            VERSION_SIZE + 2 * MSG_INDEX_REC_SIZE as u64
        );
        {
            let mut st = ms.state.write();
            st.cache.clear();
        }
        assert_eq!(ms.lookup(1).unwrap().unwrap().data, b"one");
    }

    #[test]
    fn test_count_limit_removes_drained_slices() {
        let dir = TempDir::new().unwrap();
        let limits = MsgStoreLimits {
            max_msgs: 5,
            ..Default::default()
        };
        let logger = Arc::new(CaptureLogger::default());
        let ms = FileMsgStore::open(
            shared_with_logger(slice_opts(2), logger.clone()),
            dir.path(),
            "foo",
            limits,
            false,
        )
        .unwrap();
        for _ in 0..9 {
            ms.store(b"x").unwrap();
        }
        assert_eq!(ms.first_and_last_sequence(), (5, 9));
        assert_eq!(ms.state().unwrap().0, 5);
        // Slices 1 and 2 are gone, slice 3 keeps message 5 and 6.
        assert!(!dir.path().join("msgs.1.dat").exists());
        assert!(!dir.path().join("msgs.2.dat").exists());
        assert_eq!(ms.slice_msg_counts(), vec![2, 2, 1]);
        assert_eq!(ms.first_msg().unwrap().unwrap().sequence, 5);
        assert!(ms.lookup(4).unwrap().is_none());
        assert_eq!(logger.count_containing("dropping old messages"), 1);
    }

    #[test]
    fn test_failed_slice_removal_is_logged() {
        let dir = TempDir::new().unwrap();
        let limits = MsgStoreLimits {
            max_msgs: 5,
            ..Default::default()
        };
        let logger = Arc::new(CaptureLogger::default());
        let ms = FileMsgStore::open(
            shared_with_logger(slice_opts(2), logger.clone()),
            dir.path(),
            "foo",
            limits,
            false,
        )
        .unwrap();
        for _ in 0..4 {
            ms.store(b"x").unwrap();
        }
        fs::remove_file(dir.path().join("msgs.1.dat")).unwrap();
        for _ in 0..3 {
            ms.store(b"x").unwrap();
        }
        // Slice 1 is retired anyway, its index file included.
        assert_eq!(ms.first_and_last_sequence(), (3, 7));
        assert!(!dir.path().join("msgs.1.idx").exists());
        assert_eq!(logger.count_containing("Unable to remove slice file"), 1);
        assert_eq!(logger.count_containing("msgs.1.dat"), 1);
    }

    #[test]
    fn test_lookup_in_closed_slice_reopens_file() {
        let dir = TempDir::new().unwrap();
        let ms = open(&dir, slice_opts(2), MsgStoreLimits::default(), false);
        for data in [b"a", b"b", b"c"] {
            ms.store(data).unwrap();
        }
        {
            let mut st = ms.state.write();
            st.cache.clear();
        }
        assert_eq!(ms.lookup(1).unwrap().unwrap().data, b"a");
        assert!(ms.state.read().check_slices);

        // The background task closes the idle slice file.
        thread::sleep(Duration::from_millis(3500));
        let st = ms.state.read();
        assert!(!st.check_slices);
        assert!(st.slices.values().all(|s| s.file.is_none()));
    }

    #[test]
    fn test_age_expiry_in_background() {
        let dir = TempDir::new().unwrap();
        let limits = MsgStoreLimits {
            max_age: Duration::from_millis(200),
            ..Default::default()
        };
        let ms = open(&dir, FileStoreOptions::default(), limits, false);
        ms.store(b"a").unwrap();
        ms.store(b"b").unwrap();
        thread::sleep(Duration::from_millis(1500));
        assert_eq!(ms.state().unwrap(), (0, 0));
        assert_eq!(ms.first_and_last_sequence(), (3, 2));
        assert!(ms.first_msg().unwrap().is_none());
        assert_eq!(ms.store(b"c").unwrap(), 3);
    }

    #[test]
    fn test_recovery_expires_old_messages() {
        let dir = TempDir::new().unwrap();
        let ms = open(&dir, FileStoreOptions::default(), MsgStoreLimits::default(), false);
        ms.store(b"old").unwrap();
        ms.close().unwrap();
        thread::sleep(Duration::from_millis(50));

        let limits = MsgStoreLimits {
            max_age: Duration::from_millis(10),
            ..Default::default()
        };
        let ms = open(&dir, FileStoreOptions::default(), limits, true);
        assert_eq!(ms.state().unwrap().0, 0);
        assert_eq!(ms.first_and_last_sequence(), (2, 1));
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_script_receives_renamed_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("archive.sh");
        let archived = dir.path().join("archived.txt");
        fs::write(
            &script,
            format!("#!/bin/sh\necho \"$1 $2 $3\" >> {}\n", archived.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let chan_dir = dir.path().join("foo");
        fs::create_dir(&chan_dir).unwrap();
        let opts = FileStoreOptions::default().with_slice_config(1, 0, Duration::ZERO, Some(script));
        let limits = MsgStoreLimits {
            max_msgs: 1,
            ..Default::default()
        };
        let logger = Arc::new(CaptureLogger::default());
        let ms = FileMsgStore::open(shared_with_logger(opts, logger.clone()), &chan_dir, "foo", limits, false)
            .unwrap();
        ms.store(b"a").unwrap();
        ms.store(b"b").unwrap();
        ms.close().unwrap();

        assert!(chan_dir.join("msgs.1.dat.bak").exists());
        assert!(chan_dir.join("msgs.1.idx.bak").exists());
        assert!(!chan_dir.join("msgs.1.dat").exists());
        let line = fs::read_to_string(&archived).unwrap();
        assert!(line.starts_with("foo "));
        assert!(line.contains("msgs.1.dat.bak"));
        assert_eq!(logger.count_containing("Output of archive script"), 1);
    }

    #[test]
    fn test_store_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let ms = open(&dir, FileStoreOptions::default(), MsgStoreLimits::default(), false);
        ms.close().unwrap();
        ms.close().unwrap();
        assert!(matches!(ms.store(b"x"), Err(StoreError::Closed)));
    }
}
