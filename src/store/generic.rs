//! Bookkeeping shared by every backend
//!
//! [`GenericStore`] holds channels, clients and limits behind one
//! reader/writer lock. The backend-specific part of the state (files for the
//! file store, nothing for the memory store) is the extension `E`, and
//! backend hooks are passed as closures running under the store lock.
//!
//! [`MsgLogBase`] and [`SubLogBase`] carry the counters every message and
//! subscription log keeps, whatever the backend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{dropping_msgs_notice, validate_channel_name, ChannelStore, MsgStore, SubStore, ALL_CHANNELS};
use crate::error::{StoreError, StoreResult};
use crate::limits::{ChannelLimits, MsgStoreLimits, StoreLimits, SubStoreLimits};
use crate::logger::SharedLogger;
use crate::types::{Client, ClientInfo, SubState, UserData};

/// State guarded by the store lock
pub struct StoreState<E> {
    pub limits: StoreLimits,
    pub channels: HashMap<String, Arc<ChannelStore>>,
    pub clients: HashMap<String, Arc<Client>>,
    pub closed: bool,
    /// Backend-specific state
    pub ext: E,
}

/// Channels, clients and limits of a store
pub struct GenericStore<E> {
    name: &'static str,
    logger: SharedLogger,
    state: RwLock<StoreState<E>>,
}

impl<E> GenericStore<E> {
    /// Create the generic part of a store. The limits are copied and built.
    pub fn new(name: &'static str, limits: &StoreLimits, logger: SharedLogger, ext: E) -> StoreResult<Self> {
        let mut limits = limits.clone();
        limits.build()?;
        Ok(Self {
            name,
            logger,
            state: RwLock::new(StoreState {
                limits,
                channels: HashMap::new(),
                clients: HashMap::new(),
                closed: false,
                ext,
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }

    pub fn read(&self) -> RwLockReadGuard<'_, StoreState<E>> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, StoreState<E>> {
        self.state.write()
    }

    /// Validate a copy of `limits` and swap it in on success.
    pub fn set_limits(&self, limits: &StoreLimits) -> StoreResult<()> {
        let mut copy = limits.clone();
        copy.build()?;
        self.state.write().limits = copy;
        Ok(())
    }

    /// Effective limits of a channel
    pub fn channel_limits(&self, channel: &str) -> ChannelLimits {
        self.state.read().limits.for_channel(channel)
    }

    /// Return the existing channel, or check limits and let `make` build
    /// its logs. `make` runs under the store lock.
    pub fn create_channel_with<F>(
        &self,
        channel: &str,
        user_data: Option<UserData>,
        make: F,
    ) -> StoreResult<(Arc<ChannelStore>, bool)>
    where
        F: FnOnce(&mut E, ChannelLimits) -> StoreResult<(Arc<dyn MsgStore>, Arc<dyn SubStore>)>,
    {
        let mut state = self.state.write();
        if let Some(existing) = state.channels.get(channel) {
            return Ok((Arc::clone(existing), false));
        }
        validate_channel_name(channel)?;
        let max = state.limits.max_channels;
        if max > 0 && state.channels.len() as i64 >= max {
            return Err(StoreError::TooManyChannels);
        }

        let limits = state.limits.for_channel(channel);
        let (msgs, subs) = make(&mut state.ext, limits)?;
        let cs = Arc::new(ChannelStore { user_data, subs, msgs });
        state.channels.insert(channel.to_string(), Arc::clone(&cs));
        Ok((cs, true))
    }

    /// Register channel logs recovered from a backend.
    pub fn insert_channel(&self, channel: &str, msgs: Arc<dyn MsgStore>, subs: Arc<dyn SubStore>) {
        let cs = Arc::new(ChannelStore {
            user_data: None,
            subs,
            msgs,
        });
        self.state.write().channels.insert(channel.to_string(), cs);
    }

    pub fn lookup_channel(&self, channel: &str) -> Option<Arc<ChannelStore>> {
        self.state.read().channels.get(channel).cloned()
    }

    pub fn has_channel(&self) -> bool {
        !self.state.read().channels.is_empty()
    }

    pub fn msgs_state(&self, channel: &str) -> StoreResult<(usize, u64)> {
        if channel != ALL_CHANNELS {
            return match self.lookup_channel(channel) {
                Some(cs) => cs.msgs.state(),
                None => Ok((0, 0)),
            };
        }

        let channels: Vec<Arc<ChannelStore>> = self.state.read().channels.values().cloned().collect();
        let mut count = 0;
        let mut bytes = 0;
        for cs in channels {
            let (c, b) = cs.msgs.state()?;
            count += c;
            bytes += b;
        }
        Ok((count, bytes))
    }

    /// Register a client, calling `persist` (under the store lock) only if
    /// the ID is new. Nothing is registered if `persist` fails.
    pub fn add_client_with<F>(
        &self,
        client_id: &str,
        hb_inbox: &str,
        user_data: Option<UserData>,
        persist: F,
    ) -> StoreResult<(Arc<Client>, bool)>
    where
        F: FnOnce(&mut E, &ClientInfo) -> StoreResult<()>,
    {
        let mut state = self.state.write();
        if let Some(existing) = state.clients.get(client_id) {
            return Ok((Arc::clone(existing), false));
        }
        let client = Arc::new(Client::new(client_id, hb_inbox, user_data));
        persist(&mut state.ext, &client.info)?;
        state.clients.insert(client_id.to_string(), Arc::clone(&client));
        Ok((client, true))
    }

    pub fn get_client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.state.read().clients.get(client_id).cloned()
    }

    pub fn get_clients(&self) -> HashMap<String, Arc<Client>> {
        self.state.read().clients.clone()
    }

    pub fn get_clients_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// Remove a client, then call `persist` with the remaining clients. The
    /// client is put back if `persist` fails.
    pub fn delete_client_with<F>(&self, client_id: &str, persist: F) -> StoreResult<Option<Arc<Client>>>
    where
        F: FnOnce(&mut E, &ClientInfo, &HashMap<String, Arc<Client>>) -> StoreResult<()>,
    {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(client) = state.clients.remove(client_id) else {
            return Ok(None);
        };
        if let Err(e) = persist(&mut state.ext, &client.info, &state.clients) {
            state.clients.insert(client_id.to_string(), client);
            return Err(e);
        }
        Ok(Some(client))
    }

    /// Close every channel (subscriptions first), then `close_ext`.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned. A closed store does nothing.
    pub fn close_with<F>(&self, close_ext: F) -> StoreResult<()>
    where
        F: FnOnce(&mut E) -> StoreResult<()>,
    {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let mut result = Ok(());
        for cs in state.channels.values() {
            let subs = cs.subs.close();
            let msgs = cs.msgs.close();
            if result.is_ok() {
                result = subs.and(msgs);
            }
        }
        let ext = close_ext(&mut state.ext);
        if result.is_ok() {
            result = ext;
        }
        result
    }
}

/// Counters and limits common to every message log
pub(crate) struct MsgLogBase {
    pub subject: String,
    pub limits: MsgStoreLimits,
    pub first: u64,
    pub last: u64,
    pub total_count: usize,
    pub total_bytes: u64,
    /// Set once the dropping-messages notice was logged
    pub hit_limit: bool,
    pub closed: bool,
    pub logger: SharedLogger,
}

impl MsgLogBase {
    pub fn new(subject: &str, limits: MsgStoreLimits, logger: SharedLogger) -> Self {
        Self {
            subject: subject.to_string(),
            limits,
            first: 0,
            last: 0,
            total_count: 0,
            total_bytes: 0,
            hit_limit: false,
            closed: false,
            logger,
        }
    }

    /// True while count or bytes exceed the limits. The last message is
    /// never evicted.
    pub fn over_limits(&self) -> bool {
        let max_msgs = self.limits.max_msgs;
        let max_bytes = self.limits.max_bytes;
        self.total_count > 1
            && ((max_msgs > 0 && self.total_count as i64 > max_msgs)
                || (max_bytes > 0 && self.total_bytes > max_bytes as u64))
    }

    pub fn has_count_limits(&self) -> bool {
        self.limits.max_msgs > 0 || self.limits.max_bytes > 0
    }

    /// Log the dropping-messages notice, once per log.
    pub fn report_hit_limit(&mut self) {
        if self.hit_limit {
            return;
        }
        self.hit_limit = true;
        self.logger.notice(&dropping_msgs_notice(
            &self.subject,
            self.total_count,
            self.limits.max_msgs,
            self.total_bytes,
            self.limits.max_bytes,
        ));
    }
}

/// Counters and limits common to every subscription log
pub(crate) struct SubLogBase {
    pub limits: SubStoreLimits,
    pub subs_count: usize,
    pub max_sub_id: u64,
    pub closed: bool,
}

impl SubLogBase {
    pub fn new(limits: SubStoreLimits) -> Self {
        Self {
            limits,
            subs_count: 0,
            max_sub_id: 0,
            closed: false,
        }
    }

    /// Check the subscription limit and assign the next ID to `sub`.
    pub fn create_sub(&mut self, sub: &mut SubState) -> StoreResult<()> {
        let max = self.limits.max_subscriptions;
        if max > 0 && self.subs_count as i64 >= max {
            return Err(StoreError::TooManySubs);
        }
        self.max_sub_id += 1;
        self.subs_count += 1;
        sub.id = self.max_sub_id;
        Ok(())
    }

    /// Undo a `create_sub` whose record could not be persisted.
    pub fn cancel_create(&mut self) {
        self.subs_count = self.subs_count.saturating_sub(1);
    }

    pub fn sub_removed(&mut self) {
        self.subs_count = self.subs_count.saturating_sub(1);
    }
}
