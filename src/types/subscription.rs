//! Subscription state persisted by the subscription stores

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Durable state of a subscription.
///
/// The store does not interpret these fields, except `id` (assigned by
/// `create_sub`) and `last_sent` (raised by `add_seq_pending`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubState {
    pub id: u64,
    pub client_id: String,
    pub subject: String,
    pub qgroup: String,
    pub inbox: String,
    pub ack_inbox: String,
    pub durable_name: String,
    pub max_in_flight: i32,
    pub ack_wait_in_secs: i32,
    pub last_sent: u64,
    pub is_durable: bool,
}

impl SubState {
    /// Create a subscription state for the given client and subject
    pub fn new(client_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            subject: subject.into(),
            ..Default::default()
        }
    }

    /// Set the inbox messages are delivered to
    pub fn with_inbox(mut self, inbox: impl Into<String>) -> Self {
        self.inbox = inbox.into();
        self
    }

    /// Make this a durable subscription with the given name
    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.durable_name = name.into();
        self.is_durable = true;
        self
    }
}

/// Set of message sequences waiting to be acknowledged
pub type PendingAcks = HashSet<u64>;

/// A subscription recovered from disk, with its pending messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredSubState {
    pub sub: SubState,
    pub pending: PendingAcks,
}
