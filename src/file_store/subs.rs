//! File subscription log
//!
//! `subs.dat` is an append-only log of typed records. Replaying it rebuilds
//! every subscription and its pending sequences. Updates, deletes and acks
//! turn earlier records into dead space, which compaction reclaims by
//! rewriting only the live state.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::buffer::BufferedWriter;
use super::record::{
    create_versioned, decode_payload, encode_record, open_file, read_record, write_encoded, Buffered,
    RECORD_HEADER_SIZE,
};
use super::{FileShared, BUF_SHRINK_INTERVAL, COMPACT_BUF_SIZE, SUBS_FILE, SUB_BUF_MIN_SHRINK_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::limits::SubStoreLimits;
use crate::store::{SubLogBase, SubStore};
use crate::types::{PendingAcks, RecoveredSubState, SubState};
use crate::utils::{swap_files, temp_path_for, Timer};

const SUB_REC_NEW: u8 = 1;
const SUB_REC_UPDATE: u8 = 2;
const SUB_REC_DEL: u8 = 3;
const SUB_REC_ACK: u8 = 4;
const SUB_REC_MSG: u8 = 5;

#[derive(Debug, Serialize, Deserialize)]
struct SubDelete {
    id: u64,
}

/// Pending (msg) or acknowledged (ack) sequence of a subscription
#[derive(Debug, Serialize, Deserialize)]
struct SubSeq {
    id: u64,
    seqno: u64,
}

#[derive(Debug)]
struct FileSub {
    state: SubState,
    pending: PendingAcks,
}

impl FileSub {
    fn new(state: SubState) -> Self {
        Self {
            state,
            pending: PendingAcks::new(),
        }
    }

    fn sorted_pending(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self.pending.iter().copied().collect();
        seqs.sort_unstable();
        seqs
    }
}

struct FileSubState {
    base: SubLogBase,
    shared: Arc<FileShared>,
    channel: String,
    path: PathBuf,
    file: Option<File>,
    writer: Option<BufferedWriter>,
    scratch: Vec<u8>,
    subs: BTreeMap<u64, FileSub>,
    /// Records written, and how many of them are dead
    num_recs: usize,
    del_recs: usize,
    /// Bytes of records in the file
    file_size: u64,
    compact_ts: Option<Instant>,
    /// Something was written since the last flush
    activity: bool,
}

impl FileSubState {
    fn write_record<T: Serialize>(&mut self, rec_type: u8, rec: &T) -> StoreResult<()> {
        let total = encode_record(&mut self.scratch, rec_type, rec, &self.shared.crc)?;
        let record = &self.scratch[..total];
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;
        match self.writer.as_mut() {
            Some(writer) => {
                if writer.size() != writer.max_size() && total > writer.available() {
                    writer.expand(file, total)?;
                }
                write_encoded(
                    &mut Buffered {
                        writer: &mut *writer,
                        file: &mut *file,
                    },
                    record,
                )?;
                if writer.shrink_requested() {
                    writer.check_shrink_request();
                }
            }
            None => write_encoded(file, record)?,
        }
        self.activity = true;
        match rec_type {
            SUB_REC_NEW | SUB_REC_MSG => self.num_recs += 1,
            SUB_REC_UPDATE => {
                self.num_recs += 1;
                self.del_recs += 1;
            }
            _ => self.del_recs += 1,
        }
        self.file_size += total as u64;
        Ok(())
    }

    fn should_compact(&self) -> bool {
        let opts = &self.shared.options;
        if !opts.compact_enabled {
            return false;
        }
        if opts.compact_min_file_size > 0 && (self.file_size as i64) < opts.compact_min_file_size {
            return false;
        }
        let frag = if self.num_recs == 0 {
            100
        } else {
            self.del_recs * 100 / self.num_recs
        };
        if frag < opts.compact_fragmentation as usize {
            return false;
        }
        match self.compact_ts {
            Some(ts) => ts.elapsed() >= opts.compact_interval,
            None => true,
        }
    }

    fn compact_if_needed(&mut self) {
        if !self.should_compact() {
            return;
        }
        if let Err(e) = self.compact() {
            self.shared.logger.error(&format!(
                "STAN: Unable to compact subscriptions file of {:?}: {}",
                self.channel, e
            ));
        }
    }

    /// Rewrite the live subscriptions and their pending sequences into a
    /// temporary file and swap it in. Counters only change on success.
    fn compact(&mut self) -> StoreResult<()> {
        if self.file.is_none() {
            return Err(StoreError::Closed);
        }
        self.flush_buffer()?;
        let temp_path = temp_path_for(&self.path);
        let written = self.write_live_records(&temp_path);
        let (temp, num_recs, file_size) = match written {
            Ok(w) => w,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&temp_path) {
                    tracing::warn!(path = %temp_path.display(), error = %rm, "unable to remove compaction file");
                }
                return Err(e);
            }
        };

        let active = self.file.take().ok_or(StoreError::Closed)?;
        let (file, swapped) = swap_files(temp, &temp_path, active, &self.path, open_file);
        self.file = file;
        swapped?;

        if let Some(writer) = self.writer.as_mut() {
            writer.reset();
        }
        tracing::debug!(
            channel = %self.channel,
            before = self.file_size,
            after = file_size,
            "compacted subscriptions file"
        );
        self.num_recs = num_recs;
        self.del_recs = 0;
        self.file_size = file_size;
        self.compact_ts = Some(Instant::now());
        Ok(())
    }

    fn write_live_records(&mut self, temp_path: &Path) -> StoreResult<(File, usize, u64)> {
        let temp = create_versioned(temp_path)?;
        let mut bw = BufWriter::with_capacity(COMPACT_BUF_SIZE, temp);
        let mut num_recs = 0;
        let mut file_size = 0u64;
        for sub in self.subs.values() {
            let total = encode_record(&mut self.scratch, SUB_REC_NEW, &sub.state, &self.shared.crc)?;
            write_encoded(&mut bw, &self.scratch[..total])?;
            num_recs += 1;
            file_size += total as u64;
            for seqno in sub.sorted_pending() {
                let rec = SubSeq {
                    id: sub.state.id,
                    seqno,
                };
                let total = encode_record(&mut self.scratch, SUB_REC_MSG, &rec, &self.shared.crc)?;
                write_encoded(&mut bw, &self.scratch[..total])?;
                num_recs += 1;
                file_size += total as u64;
            }
        }
        let temp = bw.into_inner().map_err(|e| e.into_error())?;
        temp.sync_all()?;
        Ok((temp, num_recs, file_size))
    }

    fn flush_buffer(&mut self) -> StoreResult<()> {
        if let (Some(writer), Some(file)) = (self.writer.as_mut(), self.file.as_mut()) {
            writer.flush(file)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        if !self.activity {
            return Ok(());
        }
        self.activity = false;
        self.flush_buffer()?;
        if self.shared.options.do_sync {
            if let Some(file) = &self.file {
                file.sync_data()?;
            }
        }
        Ok(())
    }

    /// Replay the log into the subscription map.
    fn recover(&mut self) -> StoreResult<()> {
        let check_crc = self.shared.options.do_crc;
        let crc = self.shared.crc.clone();
        let file = self.file.as_ref().ok_or(StoreError::Closed)?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();

        while let Some((rec_type, size)) = read_record(&mut reader, &mut buf, true, &crc, check_crc)? {
            self.file_size += (size + RECORD_HEADER_SIZE) as u64;
            let payload = &buf[..size];
            match rec_type {
                SUB_REC_NEW => {
                    let sub: SubState = decode_payload(payload)?;
                    self.base.max_sub_id = self.base.max_sub_id.max(sub.id);
                    self.base.subs_count += 1;
                    self.subs.insert(sub.id, FileSub::new(sub));
                    self.num_recs += 1;
                }
                SUB_REC_UPDATE => {
                    let sub: SubState = decode_payload(payload)?;
                    self.base.max_sub_id = self.base.max_sub_id.max(sub.id);
                    match self.subs.get_mut(&sub.id) {
                        Some(existing) => {
                            existing.state = sub;
                            self.del_recs += 1;
                        }
                        None => {
                            self.subs.insert(sub.id, FileSub::new(sub));
                        }
                    }
                    self.num_recs += 1;
                }
                SUB_REC_DEL => {
                    let del: SubDelete = decode_payload(payload)?;
                    self.base.max_sub_id = self.base.max_sub_id.max(del.id);
                    if let Some(removed) = self.subs.remove(&del.id) {
                        self.base.sub_removed();
                        self.del_recs += 1 + removed.pending.len();
                    }
                }
                SUB_REC_MSG => {
                    let rec: SubSeq = decode_payload(payload)?;
                    if let Some(sub) = self.subs.get_mut(&rec.id) {
                        sub.state.last_sent = sub.state.last_sent.max(rec.seqno);
                        sub.pending.insert(rec.seqno);
                        self.num_recs += 1;
                    }
                }
                SUB_REC_ACK => {
                    let rec: SubSeq = decode_payload(payload)?;
                    if let Some(sub) = self.subs.get_mut(&rec.id) {
                        sub.pending.remove(&rec.seqno);
                        self.del_recs += 1;
                    }
                }
                other => {
                    return Err(StoreError::Corrupted(format!(
                        "unexpected record type: {}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        self.base.closed = true;
        let result = if self.file.is_some() { self.flush() } else { Ok(()) };
        self.file = None;
        result
    }
}

/// Subscription log of a channel stored in `subs.dat`
pub struct FileSubStore {
    state: Arc<RwLock<FileSubState>>,
    shrink_timer: Mutex<Option<Timer>>,
}

impl FileSubStore {
    /// Open the log of `channel` in `dir`, replaying it if `recover` is set.
    pub(crate) fn open(
        shared: Arc<FileShared>,
        dir: &Path,
        channel: &str,
        limits: SubStoreLimits,
        recover: bool,
    ) -> StoreResult<Self> {
        let path = dir.join(SUBS_FILE);
        let max_buf = shared.options.buffer_size;
        let opened = open_file(&path).map_err(|e| StoreError::channel("subscription", "create", channel, e))?;
        let mut state = FileSubState {
            base: SubLogBase::new(limits),
            shared,
            channel: channel.to_string(),
            path,
            file: Some(opened),
            writer: (max_buf > 0).then(|| BufferedWriter::new(SUB_BUF_MIN_SHRINK_SIZE, max_buf)),
            scratch: Vec::new(),
            subs: BTreeMap::new(),
            num_recs: 0,
            del_recs: 0,
            file_size: 0,
            compact_ts: None,
            activity: false,
        };
        if recover {
            if let Err(e) = state.recover() {
                let _ = state.close();
                return Err(StoreError::channel("subscription", "recover", channel, e));
            }
        }

        let store = Self {
            state: Arc::new(RwLock::new(state)),
            shrink_timer: Mutex::new(None),
        };
        if max_buf > SUB_BUF_MIN_SHRINK_SIZE {
            let worker = Arc::clone(&store.state);
            let timer = Timer::start("sub-store-shrink", BUF_SHRINK_INTERVAL, move || {
                let mut st = worker.write();
                if st.base.closed {
                    return None;
                }
                let st = &mut *st;
                if let (Some(writer), Some(file)) = (st.writer.as_mut(), st.file.as_mut()) {
                    if let Err(e) = writer.try_shrink(file) {
                        st.shared.logger.error(&format!(
                            "STAN: Unable to shrink buffer of subscriptions store for {:?}: {}",
                            st.channel, e
                        ));
                    }
                }
                Some(BUF_SHRINK_INTERVAL)
            })
            .map_err(|e| StoreError::channel("subscription", "create", channel, e.into()))?;
            *store.shrink_timer.lock() = Some(timer);
        }
        Ok(store)
    }

    /// Number of live subscriptions
    pub fn subs_count(&self) -> usize {
        self.state.read().base.subs_count
    }

    /// Pending sequences of a subscription, sorted
    pub fn pending(&self, sub_id: u64) -> Option<Vec<u64>> {
        self.state.read().subs.get(&sub_id).map(FileSub::sorted_pending)
    }

    /// Live subscriptions with their pending sequences, by ID
    pub fn recovered_subs(&self) -> Vec<RecoveredSubState> {
        self.state
            .read()
            .subs
            .values()
            .map(|s| RecoveredSubState {
                sub: s.state.clone(),
                pending: s.pending.clone(),
            })
            .collect()
    }
}

impl SubStore for FileSubStore {
    fn create_sub(&self, sub: &mut SubState) -> StoreResult<()> {
        let mut st = self.state.write();
        st.base.create_sub(sub)?;
        if let Err(e) = st.write_record(SUB_REC_NEW, &*sub) {
            st.base.cancel_create();
            return Err(e);
        }
        st.subs.insert(sub.id, FileSub::new(sub.clone()));
        Ok(())
    }

    fn update_sub(&self, sub: &SubState) -> StoreResult<()> {
        let mut st = self.state.write();
        st.write_record(SUB_REC_UPDATE, sub)?;
        match st.subs.get_mut(&sub.id) {
            Some(existing) => existing.state = sub.clone(),
            None => {
                st.subs.insert(sub.id, FileSub::new(sub.clone()));
            }
        }
        Ok(())
    }

    fn delete_sub(&self, sub_id: u64) -> StoreResult<()> {
        let mut st = self.state.write();
        st.write_record(SUB_REC_DEL, &SubDelete { id: sub_id })?;
        if let Some(removed) = st.subs.remove(&sub_id) {
            st.base.sub_removed();
            st.del_recs += removed.pending.len();
            st.compact_if_needed();
        }
        Ok(())
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> StoreResult<()> {
        let mut st = self.state.write();
        st.write_record(SUB_REC_MSG, &SubSeq { id: sub_id, seqno: seq })?;
        if let Some(sub) = st.subs.get_mut(&sub_id) {
            sub.state.last_sent = sub.state.last_sent.max(seq);
            sub.pending.insert(seq);
        }
        Ok(())
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> StoreResult<()> {
        let mut st = self.state.write();
        st.write_record(SUB_REC_ACK, &SubSeq { id: sub_id, seqno: seq })?;
        if let Some(sub) = st.subs.get_mut(&sub_id) {
            sub.pending.remove(&seq);
            st.compact_if_needed();
        }
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        self.state.write().flush()
    }

    fn close(&self) -> StoreResult<()> {
        let result = {
            let mut st = self.state.write();
            if st.base.closed {
                return Ok(());
            }
            st.close()
        };
        if let Some(timer) = self.shrink_timer.lock().take() {
            timer.stop();
        }
        result
    }
}

impl Drop for FileSubStore {
    fn drop(&mut self) {
        let _ = SubStore::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::options::FileStoreOptions;
    use crate::logger::testing::CaptureLogger;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_with(dir: &TempDir, options: FileStoreOptions, max_subs: i64, recover: bool) -> FileSubStore {
        let shared = Arc::new(FileShared::new(options, Arc::new(CaptureLogger::default())));
        FileSubStore::open(
            shared,
            dir.path(),
            "foo",
            SubStoreLimits {
                max_subscriptions: max_subs,
            },
            recover,
        )
        .unwrap()
    }

    fn no_compact() -> FileStoreOptions {
        FileStoreOptions::default().with_compact_enabled(false)
    }

    #[test]
    fn test_replay_restores_subs_and_pending() {
        let dir = TempDir::new().unwrap();
        let ss = open_with(&dir, no_compact(), 0, false);
        let mut a = SubState::new("me", "foo").with_inbox("in.a");
        let mut b = SubState::new("me", "foo").durable("dur");
        ss.create_sub(&mut a).unwrap();
        ss.create_sub(&mut b).unwrap();
        assert_eq!((a.id, b.id), (1, 2));

        for seq in 1..=4 {
            ss.add_seq_pending(a.id, seq).unwrap();
        }
        ss.ack_seq_pending(a.id, 2).unwrap();
        b.max_in_flight = 10;
        ss.update_sub(&b).unwrap();
        let mut c = SubState::new("other", "foo");
        ss.create_sub(&mut c).unwrap();
        ss.add_seq_pending(c.id, 1).unwrap();
        ss.delete_sub(c.id).unwrap();
        ss.close().unwrap();

        let ss = open_with(&dir, no_compact(), 0, true);
        assert_eq!(ss.subs_count(), 2);
        assert_eq!(ss.pending(a.id).unwrap(), vec![1, 3, 4]);
        assert!(ss.pending(c.id).is_none());
        let recovered = ss.recovered_subs();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].sub.last_sent, 4);
        assert_eq!(recovered[1].sub.max_in_flight, 10);
        assert!(recovered[1].sub.is_durable);

        // IDs keep increasing past deleted subscriptions.
        let mut d = SubState::new("me", "foo");
        ss.create_sub(&mut d).unwrap();
        assert_eq!(d.id, 4);
    }

    #[test]
    fn test_delete_frees_subscription_slot() {
        let dir = TempDir::new().unwrap();
        let ss = open_with(&dir, no_compact(), 1, false);
        let mut a = SubState::new("me", "foo");
        ss.create_sub(&mut a).unwrap();
        assert!(matches!(
            ss.create_sub(&mut SubState::new("me", "foo")),
            Err(StoreError::TooManySubs)
        ));
        ss.delete_sub(a.id).unwrap();
        assert_eq!(ss.subs_count(), 0);
        ss.create_sub(&mut SubState::new("me", "foo")).unwrap();
    }

    #[test]
    fn test_compaction_shrinks_file_and_keeps_live_state() {
        let dir = TempDir::new().unwrap();
        let opts = FileStoreOptions::default()
            .with_compact_min_file_size(0)
            .with_compact_fragmentation(50)
            .with_compact_interval(Duration::ZERO)
            .with_buffer_size(0);
        let ss = open_with(&dir, no_compact().with_buffer_size(0), 0, false);
        let mut a = SubState::new("me", "foo");
        ss.create_sub(&mut a).unwrap();
        for seq in 1..=100 {
            ss.add_seq_pending(a.id, seq).unwrap();
        }
        for seq in 1..=90 {
            ss.ack_seq_pending(a.id, seq).unwrap();
        }
        ss.close().unwrap();
        let path = dir.path().join(SUBS_FILE);
        let before = fs::metadata(&path).unwrap().len();

        let ss = open_with(&dir, opts, 0, true);
        let expected: Vec<u64> = (91..=100).collect();
        assert_eq!(ss.pending(a.id).unwrap(), expected);
        // The next ack triggers compaction.
        ss.ack_seq_pending(a.id, 91).unwrap();
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "{} >= {}", after, before);
        assert!(!dir.path().join("subs.tmp").exists());
        {
            let st = ss.state.read();
            assert_eq!(st.del_recs, 0);
            assert_eq!(st.num_recs, 10);
        }
        ss.close().unwrap();

        let ss = open_with(&dir, no_compact(), 0, true);
        assert_eq!(ss.pending(a.id).unwrap(), (92..=100).collect::<Vec<u64>>());
        assert_eq!(ss.subs_count(), 1);
    }

    #[test]
    fn test_compaction_waits_for_interval() {
        let dir = TempDir::new().unwrap();
        let opts = FileStoreOptions::default()
            .with_compact_min_file_size(0)
            .with_compact_interval(Duration::from_secs(3600))
            .with_buffer_size(0);
        let ss = open_with(&dir, opts, 0, false);
        let mut a = SubState::new("me", "foo");
        ss.create_sub(&mut a).unwrap();
        ss.add_seq_pending(a.id, 1).unwrap();
        ss.ack_seq_pending(a.id, 1).unwrap();
        // First compaction happened; the next one is too soon.
        assert!(ss.state.read().compact_ts.is_some());
        ss.add_seq_pending(a.id, 2).unwrap();
        ss.ack_seq_pending(a.id, 2).unwrap();
        assert_eq!(ss.state.read().del_recs, 1);
    }

    #[test]
    fn test_buffered_records_reach_disk_on_flush() {
        let dir = TempDir::new().unwrap();
        let ss = open_with(&dir, no_compact().with_sync(false), 0, false);
        let path = dir.path().join(SUBS_FILE);
        ss.create_sub(&mut SubState::new("me", "foo")).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 4);
        ss.flush().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 4);
    }

    #[test]
    fn test_unknown_record_type_is_corruption() {
        let dir = TempDir::new().unwrap();
        let ss = open_with(&dir, no_compact().with_buffer_size(0), 0, false);
        ss.create_sub(&mut SubState::new("me", "foo")).unwrap();
        ss.close().unwrap();

        let path = dir.path().join(SUBS_FILE);
        let mut content = fs::read(&path).unwrap();
        // Record type lives in the high byte of the first header word.
        content[7] = 9;
        fs::write(&path, content).unwrap();

        let shared = Arc::new(FileShared::new(no_compact(), Arc::new(CaptureLogger::default())));
        let err = FileSubStore::open(shared, dir.path(), "foo", SubStoreLimits::default(), true)
            .err()
            .unwrap();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("unable to recover subscription store for [foo]"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ss = open_with(&dir, FileStoreOptions::default(), 0, false);
        ss.close().unwrap();
        ss.close().unwrap();
        assert!(matches!(
            ss.add_seq_pending(1, 1),
            Err(StoreError::Closed)
        ));
    }
}
