//! Store contract
//!
//! A [`Store`] owns channels and the client registry. Each channel has one
//! [`MsgStore`] (the message log) and one [`SubStore`] (the subscription
//! log). Callers only depend on these traits; the in-memory backend is
//! [`MemoryStore`] and the file backend in [`crate::file_store`].

mod generic;
mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::limits::StoreLimits;
use crate::types::{Client, Message, RecoveredSubState, ServerInfo, SubState, UserData};

pub use generic::{GenericStore, StoreState};
pub(crate) use generic::{MsgLogBase, SubLogBase};
pub use memory::{MemoryMsgStore, MemoryStore, MemorySubStore};

/// Type name of the in-memory store
pub const TYPE_MEMORY: &str = "MEMORY";

/// Type name of the file store
pub const TYPE_FILE: &str = "FILE";

/// Channel name selecting every channel in [`Store::msgs_state`]
pub const ALL_CHANNELS: &str = "*";

/// Message and subscription logs of one channel
pub struct ChannelStore {
    /// Value attached by the embedding server at creation
    pub user_data: Option<UserData>,
    /// Subscription log
    pub subs: Arc<dyn SubStore>,
    /// Message log
    pub msgs: Arc<dyn MsgStore>,
}

impl std::fmt::Debug for ChannelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStore")
            .field("user_data", &self.user_data.is_some())
            .finish_non_exhaustive()
    }
}

/// State found on disk when opening a store
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub info: ServerInfo,
    pub clients: Vec<Arc<Client>>,
    /// Subscriptions (with their pending messages) keyed by channel
    pub subs: HashMap<String, Vec<RecoveredSubState>>,
}

/// Top-level store: channels, clients and limits
pub trait Store: Send + Sync {
    /// Type name of this store (`MEMORY`, `FILE`)
    fn name(&self) -> &'static str;

    /// Persist the server information. Calling it again replaces it.
    fn init(&self, info: &ServerInfo) -> StoreResult<()>;

    /// Create the logs of a channel. Returns `false` with the existing
    /// channel if it was already created.
    fn create_channel(
        &self,
        channel: &str,
        user_data: Option<UserData>,
    ) -> StoreResult<(Arc<ChannelStore>, bool)>;

    fn lookup_channel(&self, channel: &str) -> Option<Arc<ChannelStore>>;

    /// True if at least one channel exists
    fn has_channel(&self) -> bool;

    /// Message count and byte size of one channel, or of all of them with
    /// [`ALL_CHANNELS`]. An unknown channel reports zeros.
    fn msgs_state(&self, channel: &str) -> StoreResult<(usize, u64)>;

    /// Replace the limits. Channels already created keep theirs.
    fn set_limits(&self, limits: &StoreLimits) -> StoreResult<()>;

    /// Register a client. Returns `false` with the existing entry if the ID
    /// was already registered.
    fn add_client(
        &self,
        client_id: &str,
        hb_inbox: &str,
        user_data: Option<UserData>,
    ) -> StoreResult<(Arc<Client>, bool)>;

    fn get_client(&self, client_id: &str) -> Option<Arc<Client>>;

    /// Snapshot of the registered clients
    fn get_clients(&self) -> HashMap<String, Arc<Client>>;

    fn get_clients_count(&self) -> usize;

    /// Remove a client, returning it if it was registered
    fn delete_client(&self, client_id: &str) -> StoreResult<Option<Arc<Client>>>;

    /// Close every channel. A second call does nothing.
    fn close(&self) -> StoreResult<()>;
}

/// Message log of a channel
pub trait MsgStore: Send + Sync {
    /// Append a message, returning its sequence
    fn store(&self, data: &[u8]) -> StoreResult<u64>;

    fn lookup(&self, seq: u64) -> StoreResult<Option<Arc<Message>>>;

    fn first_msg(&self) -> StoreResult<Option<Arc<Message>>>;

    fn last_msg(&self) -> StoreResult<Option<Arc<Message>>>;

    fn first_sequence(&self) -> u64;

    fn last_sequence(&self) -> u64;

    fn first_and_last_sequence(&self) -> (u64, u64);

    /// Sequence of the first message whose timestamp is at or after
    /// `timestamp`; `last + 1` if there is none.
    fn get_sequence_from_timestamp(&self, timestamp: i64) -> u64;

    /// Message count and byte size
    fn state(&self) -> StoreResult<(usize, u64)>;

    fn flush(&self) -> StoreResult<()>;

    fn close(&self) -> StoreResult<()>;
}

/// Subscription log of a channel
pub trait SubStore: Send + Sync {
    /// Record a new subscription; assigns `sub.id`.
    fn create_sub(&self, sub: &mut SubState) -> StoreResult<()>;

    fn update_sub(&self, sub: &SubState) -> StoreResult<()>;

    fn delete_sub(&self, sub_id: u64) -> StoreResult<()>;

    /// Record that `seq` was sent to the subscription and awaits an ack
    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> StoreResult<()>;

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> StoreResult<()>;

    fn flush(&self) -> StoreResult<()>;

    fn close(&self) -> StoreResult<()>;
}

/// Reject names that cannot be a channel (wildcards) or a directory.
pub fn validate_channel_name(name: &str) -> StoreResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.split('.').any(|token| token == "*" || token == ">" || token.is_empty());
    if invalid {
        return Err(StoreError::InvalidChannel(name.to_string()));
    }
    Ok(())
}

/// Notice logged the first time a channel drops messages to honor limits
pub(crate) fn dropping_msgs_notice(
    subject: &str,
    count: usize,
    max_msgs: i64,
    bytes: u64,
    max_bytes: i64,
) -> String {
    format!(
        "WARNING: Reached limits for store {:?} (msgs={}/{} bytes={}/{}), \
         dropping old messages to make room for new ones.",
        subject, count, max_msgs, bytes, max_bytes
    )
}
