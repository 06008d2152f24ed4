//! Data types shared by the store backends
//!
//! This module contains the records the stores persist and hand back to
//! the embedding server.

mod client;
mod message;
mod subscription;

pub use client::{Client, ClientInfo, ServerInfo, UserData};
pub use message::Message;
pub use subscription::{PendingAcks, RecoveredSubState, SubState};
