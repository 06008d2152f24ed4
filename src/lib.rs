//! Durable message store for a pub/sub server
//!
//! Channels are independent, ordered message logs with their own
//! subscription state. Two backends implement the same [`Store`] contract:
//!
//! - [`MemoryStore`]: everything in memory, nothing survives a restart
//! - [`FileStore`]: sliced, indexed message files with crash recovery,
//!   compaction of the subscription and client logs, and retention by
//!   count, size and age
//!
//! # Modules
//!
//! - `store`: the `Store` / `MsgStore` / `SubStore` traits and the memory backend
//! - `file_store`: the file backend and its options
//! - `limits`: store, channel and per-channel limits
//! - `types`: messages, subscriptions, clients, server info
//! - `logger`: the logging hook stores report notices through
//! - `stats`: disk usage of a file store root
//! - `error`: error type shared by every backend
//!
//! # Example
//!
//! ```no_run
//! use msg_store::{FileStore, FileStoreOptions, Store, StoreLimits};
//!
//! fn main() -> msg_store::StoreResult<()> {
//!     let (store, recovered) = FileStore::open("datastore", &StoreLimits::default(), FileStoreOptions::default())?;
//!     if recovered.is_none() {
//!         store.init(&msg_store::ServerInfo::new("test-cluster", "_STAN"))?;
//!     }
//!     let (orders, _) = store.create_channel("orders", None)?;
//!     let seq = orders.msgs.store(b"hello")?;
//!     assert_eq!(orders.msgs.lookup(seq)?.map(|m| m.data.clone()), Some(b"hello".to_vec()));
//!     store.close()
//! }
//! ```

pub mod error;
pub mod file_store;
pub mod limits;
pub mod logger;
pub mod stats;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use error::{StoreError, StoreResult};
pub use file_store::{FileMsgStore, FileStore, FileStoreOptions, FileSubStore};
pub use limits::{ChannelLimits, MsgStoreLimits, StoreLimits, SubStoreLimits};
pub use logger::{Logger, SharedLogger, TracingLogger};
pub use store::{
    ChannelStore, MemoryMsgStore, MemoryStore, MemorySubStore, MsgStore, RecoveredState, Store,
    SubStore, ALL_CHANNELS, TYPE_FILE, TYPE_MEMORY,
};
pub use types::{
    Client, ClientInfo, Message, PendingAcks, RecoveredSubState, ServerInfo, SubState, UserData,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
