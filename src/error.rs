//! Error types shared by every store backend

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("too many channels")]
    TooManyChannels,

    #[error("too many subscriptions per channel")]
    TooManySubs,

    #[error("invalid limits: {0}")]
    InvalidLimits(String),

    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("corrupted data, {0}")]
    Corrupted(String),

    #[error("unsupported file version: {found} (supports [1..{supported}])")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("record size too big: {0} bytes")]
    RecordTooBig(usize),

    #[error("store is closed")]
    Closed,

    /// Failure while creating or recovering the logs of a channel
    #[error("unable to {action} {store} store for [{channel}]: {source}")]
    Channel {
        store: &'static str,
        action: &'static str,
        channel: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decoding error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl StoreError {
    /// Wrap an error with the channel it happened on.
    pub(crate) fn channel(
        store: &'static str,
        action: &'static str,
        channel: &str,
        source: StoreError,
    ) -> Self {
        StoreError::Channel {
            store,
            action,
            channel: channel.to_string(),
            source: Box::new(source),
        }
    }

    /// True if the error (or the error it wraps) reports on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        match self {
            StoreError::Corrupted(_)
            | StoreError::Decode(_)
            | StoreError::UnsupportedVersion { .. } => true,
            StoreError::Channel { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_wrapper_message() {
        let err = StoreError::channel(
            "message",
            "recover",
            "orders",
            StoreError::Corrupted("expected crc to be 0x00000001, got 0x00000002".into()),
        );
        assert_eq!(
            err.to_string(),
            "unable to recover message store for [orders]: corrupted data, expected crc to be 0x00000001, got 0x00000002"
        );
        assert!(err.is_corruption());
    }

    #[test]
    fn test_io_is_not_corruption() {
        let err: StoreError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(!err.is_corruption());
    }
}
