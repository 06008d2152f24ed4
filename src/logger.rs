//! Logging hook injected into stores at construction
//!
//! Storage internals report operator-facing notices (limits reached, archive
//! script output) through a [`Logger`] instead of a process-wide function.
//! The default implementation forwards to `tracing`.

use std::sync::Arc;

/// Sink for notices emitted by store internals
pub trait Logger: Send + Sync {
    /// Informational notice (e.g. "limits reached, dropping messages")
    fn notice(&self, msg: &str);

    /// Failure that is reported but not returned to the caller
    fn error(&self, msg: &str) {
        self.notice(msg);
    }
}

/// Logger forwarding to the `tracing` ecosystem
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn notice(&self, msg: &str) {
        tracing::info!(target: "msg_store", "{}", msg);
    }

    fn error(&self, msg: &str) {
        tracing::error!(target: "msg_store", "{}", msg);
    }
}

/// Shared logger handle
pub type SharedLogger = Arc<dyn Logger>;

/// Logger used when the caller does not provide one
pub fn default_logger() -> SharedLogger {
    Arc::new(TracingLogger)
}
