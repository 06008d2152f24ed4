//! Message type stored in a channel's message log

use serde::{Deserialize, Serialize};

/// A message as stored in a channel's message log.
///
/// Messages are immutable once stored; stores hand them out as `Arc<Message>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sequence within the channel, starting at 1
    pub sequence: u64,
    /// Channel the message was published on
    pub subject: String,
    /// Opaque payload
    pub data: Vec<u8>,
    /// Store timestamp in nanoseconds since the Unix epoch
    pub timestamp: i64,
}

impl Message {
    /// Create a new message
    pub fn new(sequence: u64, subject: impl Into<String>, data: Vec<u8>, timestamp: i64) -> Self {
        Self {
            sequence,
            subject: subject.into(),
            data,
            timestamp,
        }
    }

    /// Number of bytes this message accounts for in the in-memory store
    pub fn size(&self) -> u64 {
        // sequence + timestamp
        (self.subject.len() + self.data.len() + 16) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_counts_subject_and_payload() {
        let msg = Message::new(1, "orders", b"abc".to_vec(), 0);
        assert_eq!(msg.size(), 6 + 3 + 16);
    }
}
