//! Utility functions and helpers
//!
//! Timestamps, atomic file replacement and the re-armable timer used by
//! the stores.

pub mod atomic;
pub mod time;
pub mod timer;

pub use atomic::{cleanup_temp_files, swap_files, temp_path_for};
pub use time::{duration_nanos, next_timestamp, now_nanos};
pub use timer::Timer;
