//! In-memory backend
//!
//! Nothing is persisted. Messages live in a deque indexed by
//! `sequence - first`; age expiry runs on a [`Timer`] re-armed to the next
//! message's expiration.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::generic::{GenericStore, MsgLogBase, SubLogBase};
use super::{ChannelStore, MsgStore, Store, SubStore, TYPE_MEMORY};
use crate::error::{StoreError, StoreResult};
use crate::limits::{MsgStoreLimits, StoreLimits, SubStoreLimits};
use crate::logger::{default_logger, SharedLogger};
use crate::types::{Client, Message, PendingAcks, ServerInfo, SubState, UserData};
use crate::utils::{duration_nanos, next_timestamp, now_nanos, Timer};

/// Store keeping everything in memory
pub struct MemoryStore {
    generic: GenericStore<()>,
}

impl MemoryStore {
    /// Create a memory store logging through `tracing`
    pub fn new(limits: &StoreLimits) -> StoreResult<Self> {
        Self::with_logger(limits, default_logger())
    }

    pub fn with_logger(limits: &StoreLimits, logger: SharedLogger) -> StoreResult<Self> {
        Ok(Self {
            generic: GenericStore::new(TYPE_MEMORY, limits, logger, ())?,
        })
    }

    /// Effective limits of `channel`
    pub fn channel_limits(&self, channel: &str) -> crate::limits::ChannelLimits {
        self.generic.channel_limits(channel)
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        self.generic.name()
    }

    fn init(&self, _info: &ServerInfo) -> StoreResult<()> {
        Ok(())
    }

    fn create_channel(
        &self,
        channel: &str,
        user_data: Option<UserData>,
    ) -> StoreResult<(Arc<ChannelStore>, bool)> {
        let logger = Arc::clone(self.generic.logger());
        self.generic.create_channel_with(channel, user_data, |_, limits| {
            let msgs: Arc<dyn MsgStore> = Arc::new(MemoryMsgStore::new(channel, limits.msgs, logger));
            let subs: Arc<dyn SubStore> = Arc::new(MemorySubStore::new(limits.subs));
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
        self.generic.add_client_with(client_id, hb_inbox, user_data, |_, _| Ok(()))
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
        self.generic.delete_client_with(client_id, |_, _, _| Ok(()))
    }

    fn close(&self) -> StoreResult<()> {
        self.generic.close_with(|_| Ok(()))
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let _ = Store::close(self);
    }
}

struct MemoryMsgState {
    base: MsgLogBase,
    msgs: VecDeque<Arc<Message>>,
    last_timestamp: i64,
    /// An expiry timer is pending or running
    timer_armed: bool,
}

impl MemoryMsgState {
    fn get(&self, seq: u64) -> Option<Arc<Message>> {
        if seq < self.base.first {
            return None;
        }
        self.msgs.get((seq - self.base.first) as usize).cloned()
    }

    fn remove_first_msg(&mut self) {
        if let Some(m) = self.msgs.pop_front() {
            self.base.total_bytes -= m.size();
            self.base.total_count -= 1;
            self.base.first += 1;
        }
    }

    /// Remove expired messages; returns the delay until the next expiration.
    fn expire_msgs(&mut self) -> Option<Duration> {
        let now = now_nanos();
        let max_age = duration_nanos(self.base.limits.max_age);
        while let Some(m) = self.msgs.front() {
            let elapsed = now - m.timestamp;
            if elapsed < max_age {
                return Some(Duration::from_nanos((max_age - elapsed) as u64));
            }
            self.remove_first_msg();
        }
        None
    }
}

/// Message log held in memory
pub struct MemoryMsgStore {
    state: Arc<RwLock<MemoryMsgState>>,
    age_timer: Mutex<Option<Timer>>,
}

impl MemoryMsgStore {
    pub(crate) fn new(subject: &str, limits: MsgStoreLimits, logger: SharedLogger) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryMsgState {
                base: MsgLogBase::new(subject, limits, logger),
                msgs: VecDeque::with_capacity(64),
                last_timestamp: 0,
                timer_armed: false,
            })),
            age_timer: Mutex::new(None),
        }
    }

    /// Start the expiry timer. Called with the state lock held, on an open
    /// store, when no timer is armed. Returns false if no timer could start.
    fn arm_age_timer(&self, delay: Duration) -> bool {
        let state = Arc::clone(&self.state);
        let callback = move || {
            let mut st = state.write();
            let next = if st.base.closed { None } else { st.expire_msgs() };
            if next.is_none() {
                st.timer_armed = false;
            }
            next
        };
        match Timer::start("msg-store-expiry", delay, callback) {
            Ok(timer) => {
                // A previous timer has already returned from its last
                // callback, so dropping it only joins an exiting thread.
                *self.age_timer.lock() = Some(timer);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "unable to start expiry timer");
                false
            }
        }
    }
}

impl MsgStore for MemoryMsgStore {
    fn store(&self, data: &[u8]) -> StoreResult<u64> {
        let mut st = self.state.write();
        if st.base.closed {
            return Err(StoreError::Closed);
        }

        if st.base.first == 0 {
            st.base.first = 1;
        }
        st.base.last += 1;
        let timestamp = next_timestamp(st.last_timestamp);
        st.last_timestamp = timestamp;
        let msg = Arc::new(Message::new(st.base.last, st.base.subject.clone(), data.to_vec(), timestamp));
        st.base.total_count += 1;
        st.base.total_bytes += msg.size();
        st.msgs.push_back(msg);

        let max_age = st.base.limits.max_age;
        if !max_age.is_zero() && !st.timer_armed && !st.base.closed {
            st.timer_armed = self.arm_age_timer(max_age);
        }

        if st.base.has_count_limits() {
            while st.base.over_limits() {
                st.remove_first_msg();
                st.base.report_hit_limit();
            }
        }
        Ok(st.base.last)
    }

    fn lookup(&self, seq: u64) -> StoreResult<Option<Arc<Message>>> {
        Ok(self.state.read().get(seq))
    }

    fn first_msg(&self) -> StoreResult<Option<Arc<Message>>> {
        Ok(self.state.read().msgs.front().cloned())
    }

    fn last_msg(&self) -> StoreResult<Option<Arc<Message>>> {
        Ok(self.state.read().msgs.back().cloned())
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
        let st = self.state.read();
        if st.msgs.is_empty() {
            return st.base.last + 1;
        }
        let index = st.msgs.partition_point(|m| m.timestamp < timestamp);
        st.base.first + index as u64
    }

    fn state(&self) -> StoreResult<(usize, u64)> {
        let st = self.state.read();
        Ok((st.base.total_count, st.base.total_bytes))
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        {
            let mut st = self.state.write();
            if st.base.closed {
                return Ok(());
            }
            st.base.closed = true;
        }
        // Store() no longer touches the timer once closed is set.
        if let Some(timer) = self.age_timer.lock().take() {
            timer.stop();
        }
        Ok(())
    }
}

impl Drop for MemoryMsgStore {
    fn drop(&mut self) {
        let _ = MsgStore::close(self);
    }
}

struct MemorySubState {
    base: SubLogBase,
    subs: HashMap<u64, (SubState, PendingAcks)>,
}

/// Subscription log held in memory
pub struct MemorySubStore {
    state: RwLock<MemorySubState>,
}

impl MemorySubStore {
    pub(crate) fn new(limits: SubStoreLimits) -> Self {
        Self {
            state: RwLock::new(MemorySubState {
                base: SubLogBase::new(limits),
                subs: HashMap::new(),
            }),
        }
    }

    /// Number of live subscriptions
    pub fn subs_count(&self) -> usize {
        self.state.read().base.subs_count
    }

    /// Pending sequences of a subscription, sorted
    pub fn pending(&self, sub_id: u64) -> Option<Vec<u64>> {
        let st = self.state.read();
        let (_, pending) = st.subs.get(&sub_id)?;
        let mut seqs: Vec<u64> = pending.iter().copied().collect();
        seqs.sort_unstable();
        Some(seqs)
    }
}

impl SubStore for MemorySubStore {
    fn create_sub(&self, sub: &mut SubState) -> StoreResult<()> {
        let mut st = self.state.write();
        st.base.create_sub(sub)?;
        st.subs.insert(sub.id, (sub.clone(), PendingAcks::new()));
        Ok(())
    }

    fn update_sub(&self, sub: &SubState) -> StoreResult<()> {
        let mut st = self.state.write();
        match st.subs.get_mut(&sub.id) {
            Some((state, _)) => *state = sub.clone(),
            None => {
                st.subs.insert(sub.id, (sub.clone(), PendingAcks::new()));
            }
        }
        Ok(())
    }

    fn delete_sub(&self, sub_id: u64) -> StoreResult<()> {
        let mut st = self.state.write();
        if st.subs.remove(&sub_id).is_some() {
            st.base.sub_removed();
        }
        Ok(())
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> StoreResult<()> {
        let mut st = self.state.write();
        if let Some((sub, pending)) = st.subs.get_mut(&sub_id) {
            sub.last_sent = sub.last_sent.max(seq);
            pending.insert(seq);
        }
        Ok(())
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> StoreResult<()> {
        let mut st = self.state.write();
        if let Some((_, pending)) = st.subs.get_mut(&sub_id) {
            pending.remove(&seq);
        }
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.state.write().base.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ChannelLimits;
    use crate::logger::testing::CaptureLogger;
    use crate::store::ALL_CHANNELS;
    use std::thread;

    fn msg_store(limits: MsgStoreLimits) -> (MemoryMsgStore, Arc<CaptureLogger>) {
        let logger = Arc::new(CaptureLogger::default());
        (MemoryMsgStore::new("foo", limits, logger.clone()), logger)
    }

    #[test]
    fn test_sequences_are_gap_free() {
        let (ms, _) = msg_store(MsgStoreLimits::default());
        assert_eq!(ms.first_and_last_sequence(), (0, 0));
        for expected in 1..=5 {
            assert_eq!(ms.store(b"x").unwrap(), expected);
        }
        assert_eq!(ms.first_and_last_sequence(), (1, 5));
        assert_eq!(ms.lookup(3).unwrap().unwrap().data, b"x");
        assert!(ms.lookup(6).unwrap().is_none());
        assert!(ms.lookup(0).unwrap().is_none());
    }

    #[test]
    fn test_count_limit_evicts_oldest_and_notices_once() {
        let (ms, logger) = msg_store(MsgStoreLimits {
            max_msgs: 3,
            ..Default::default()
        });
        for _ in 0..10 {
            ms.store(b"abc").unwrap();
        }
        assert_eq!(ms.first_and_last_sequence(), (8, 10));
        assert_eq!(ms.state().unwrap().0, 3);
        assert_eq!(ms.first_msg().unwrap().unwrap().sequence, 8);
        assert_eq!(logger.count_containing("dropping old messages"), 1);
    }

    #[test]
    fn test_byte_limit_keeps_last_message() {
        let (ms, _) = msg_store(MsgStoreLimits {
            max_bytes: 10,
            ..Default::default()
        });
        ms.store(&[0u8; 100]).unwrap();
        let (count, bytes) = ms.state().unwrap();
        assert_eq!(count, 1);
        assert!(bytes > 10);

        ms.store(&[0u8; 100]).unwrap();
        assert_eq!(ms.first_and_last_sequence(), (2, 2));
    }

    #[test]
    fn test_age_expiry() {
        let (ms, _) = msg_store(MsgStoreLimits {
            max_age: Duration::from_millis(100),
            ..Default::default()
        });
        ms.store(b"a").unwrap();
        ms.store(b"b").unwrap();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(ms.state().unwrap(), (0, 0));
        // Drained log: first moved past last
        assert_eq!(ms.first_and_last_sequence(), (3, 2));
        assert!(ms.first_msg().unwrap().is_none());

        // The timer is re-armed by the next store.
        ms.store(b"c").unwrap();
        assert_eq!(ms.first_and_last_sequence(), (3, 3));
        thread::sleep(Duration::from_millis(400));
        assert_eq!(ms.state().unwrap().0, 0);
        ms.close().unwrap();
    }

    #[test]
    fn test_sequence_from_timestamp() {
        let (ms, _) = msg_store(MsgStoreLimits::default());
        for data in [b"a", b"b", b"c"] {
            ms.store(data).unwrap();
        }
        let second = ms.lookup(2).unwrap().unwrap();
        assert_eq!(ms.get_sequence_from_timestamp(second.timestamp), 2);
        assert_eq!(ms.get_sequence_from_timestamp(0), 1);
        assert_eq!(ms.get_sequence_from_timestamp(i64::MAX), 4);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (ms, _) = msg_store(MsgStoreLimits {
            max_age: Duration::from_secs(60),
            ..Default::default()
        });
        ms.store(b"a").unwrap();
        ms.close().unwrap();
        ms.close().unwrap();
    }

    #[test]
    fn test_sub_store_tracks_pending() {
        let ss = MemorySubStore::new(SubStoreLimits { max_subscriptions: 2 });
        let mut sub = SubState::new("me", "foo");
        ss.create_sub(&mut sub).unwrap();
        assert_eq!(sub.id, 1);

        ss.add_seq_pending(1, 5).unwrap();
        ss.add_seq_pending(1, 3).unwrap();
        ss.ack_seq_pending(1, 5).unwrap();
        assert_eq!(ss.pending(1), Some(vec![3]));

        let mut other = SubState::new("me", "foo");
        ss.create_sub(&mut other).unwrap();
        let mut third = SubState::new("me", "foo");
        assert!(matches!(ss.create_sub(&mut third), Err(StoreError::TooManySubs)));

        ss.delete_sub(1).unwrap();
        // Deleting twice does not free another slot.
        ss.delete_sub(1).unwrap();
        assert_eq!(ss.subs_count(), 1);
        ss.create_sub(&mut third).unwrap();
        assert_eq!(third.id, 3);
        assert!(matches!(ss.create_sub(&mut SubState::default()), Err(StoreError::TooManySubs)));
    }

    #[test]
    fn test_store_channels_and_clients() {
        let mut limits = StoreLimits::default();
        limits.max_channels = 2;
        limits.add_per_channel("small", ChannelLimits::with_max_msgs(2));
        let store = MemoryStore::new(&limits).unwrap();
        assert_eq!(store.name(), TYPE_MEMORY);
        assert!(!store.has_channel());

        let (small, is_new) = store.create_channel("small", None).unwrap();
        assert!(is_new);
        let (again, is_new) = store.create_channel("small", None).unwrap();
        assert!(!is_new);
        assert!(Arc::ptr_eq(&small, &again));
        store.create_channel("big", None).unwrap();
        assert!(matches!(
            store.create_channel("third", None),
            Err(StoreError::TooManyChannels)
        ));
        assert!(store.lookup_channel("third").is_none());

        for _ in 0..5 {
            small.msgs.store(b"hello").unwrap();
        }
        store.lookup_channel("big").unwrap().msgs.store(b"x").unwrap();
        assert_eq!(store.msgs_state("small").unwrap().0, 2);
        assert_eq!(store.msgs_state(ALL_CHANNELS).unwrap().0, 3);
        assert_eq!(store.msgs_state("unknown").unwrap(), (0, 0));

        let (c1, is_new) = store.add_client("c1", "hb1", None).unwrap();
        assert!(is_new);
        let (c1b, is_new) = store.add_client("c1", "other", None).unwrap();
        assert!(!is_new);
        assert_eq!(c1b.hb_inbox(), c1.hb_inbox());
        assert_eq!(store.get_clients_count(), 1);
        assert!(store.delete_client("c1").unwrap().is_some());
        assert!(store.delete_client("c1").unwrap().is_none());

        store.close().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_set_limits_rejects_without_replacing() {
        let store = MemoryStore::new(&StoreLimits::default()).unwrap();
        let mut bad = StoreLimits::default();
        bad.add_per_channel("foo", ChannelLimits::with_max_msgs(bad.global.msgs.max_msgs + 1));
        assert!(store.set_limits(&bad).is_err());
        assert_eq!(store.channel_limits("foo").msgs.max_msgs, 1_000_000);

        let mut good = StoreLimits::default();
        good.add_per_channel("foo", ChannelLimits::with_max_msgs(5));
        store.set_limits(&good).unwrap();
        assert_eq!(store.channel_limits("foo").msgs.max_msgs, 5);
    }
}
