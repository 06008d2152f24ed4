//! Store limits
//!
//! Global limits apply to every channel unless a per-channel override exists.
//! For global limits a value of 0 means "unlimited"; for per-channel limits
//! it means "use the global value".
//!
//! [`StoreLimits::build`] validates the whole configuration and only then
//! applies inheritance, so a rejected configuration is never half-applied.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::utils::time::duration_secs;

/// Limits for a channel's message log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgStoreLimits {
    /// How many messages are kept
    pub max_msgs: i64,
    /// How many bytes are kept
    pub max_bytes: i64,
    /// How long messages are kept
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
}

/// Limits for a channel's subscription log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubStoreLimits {
    /// How many subscriptions are allowed
    pub max_subscriptions: i64,
}

/// Limits applying to one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelLimits {
    #[serde(flatten)]
    pub msgs: MsgStoreLimits,
    #[serde(flatten)]
    pub subs: SubStoreLimits,
}

impl ChannelLimits {
    /// Channel limits with only the message count set
    pub fn with_max_msgs(max_msgs: i64) -> Self {
        let mut limits = Self::default();
        limits.msgs.max_msgs = max_msgs;
        limits
    }
}

/// Limits of a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLimits {
    /// How many channels are allowed
    pub max_channels: i64,
    /// Global limits
    #[serde(flatten)]
    pub global: ChannelLimits,
    /// Per-channel overrides
    pub per_channel: HashMap<String, ChannelLimits>,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_channels: 100,
            global: ChannelLimits {
                msgs: MsgStoreLimits {
                    max_msgs: 1_000_000,
                    max_bytes: 1_000_000 * 1024,
                    max_age: Duration::ZERO,
                },
                subs: SubStoreLimits {
                    max_subscriptions: 1000,
                },
            },
            per_channel: HashMap::new(),
        }
    }
}

impl StoreLimits {
    /// Limits where nothing is limited
    pub fn unlimited() -> Self {
        Self {
            max_channels: 0,
            global: ChannelLimits::default(),
            per_channel: HashMap::new(),
        }
    }

    /// Add (or replace) the limits of a given channel
    pub fn add_per_channel(&mut self, channel: impl Into<String>, limits: ChannelLimits) -> &mut Self {
        self.per_channel.insert(channel.into(), limits);
        self
    }

    /// Parse limits from a JSON document (`max_age` in seconds)
    pub fn from_json_str(json: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load limits from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Validate the limits and apply inheritance.
    ///
    /// Calling this on already built limits is a no-op.
    pub fn build(&mut self) -> StoreResult<()> {
        self.check_global_limits()?;
        if self.per_channel.is_empty() {
            return Ok(());
        }
        if self.max_channels > 0 && self.per_channel.len() as i64 > self.max_channels {
            return Err(StoreError::InvalidLimits(format!(
                "too many channels defined ({}), the max channels limit is set to {}",
                self.per_channel.len(),
                self.max_channels
            )));
        }
        for (name, limits) in &self.per_channel {
            self.check_channel_limits(name, limits)?;
        }
        self.apply_inheritance();
        Ok(())
    }

    /// Effective limits of a channel: the override if present, global otherwise.
    pub fn for_channel(&self, channel: &str) -> ChannelLimits {
        self.per_channel.get(channel).copied().unwrap_or(self.global)
    }

    fn check_global_limits(&self) -> StoreResult<()> {
        check_non_negative("max_channels", self.max_channels, None)?;
        check_non_negative("max_msgs", self.global.msgs.max_msgs, None)?;
        check_non_negative("max_bytes", self.global.msgs.max_bytes, None)?;
        check_non_negative("max_subscriptions", self.global.subs.max_subscriptions, None)?;
        Ok(())
    }

    fn check_channel_limits(&self, name: &str, cl: &ChannelLimits) -> StoreResult<()> {
        let global = &self.global;
        check_non_negative("max_msgs", cl.msgs.max_msgs, Some(name))?;
        check_non_negative("max_bytes", cl.msgs.max_bytes, Some(name))?;
        check_non_negative("max_subscriptions", cl.subs.max_subscriptions, Some(name))?;

        check_not_above("max_msgs", cl.msgs.max_msgs, global.msgs.max_msgs, name)?;
        check_not_above("max_bytes", cl.msgs.max_bytes, global.msgs.max_bytes, name)?;
        check_not_above(
            "max_subscriptions",
            cl.subs.max_subscriptions,
            global.subs.max_subscriptions,
            name,
        )?;
        if !global.msgs.max_age.is_zero() && cl.msgs.max_age > global.msgs.max_age {
            return Err(StoreError::InvalidLimits(format!(
                "max_age for channel {:?} ({:?}) cannot be higher than global limit ({:?})",
                name, cl.msgs.max_age, global.msgs.max_age
            )));
        }
        Ok(())
    }

    fn apply_inheritance(&mut self) {
        let global = self.global;
        for cl in self.per_channel.values_mut() {
            if cl.msgs.max_msgs == 0 {
                cl.msgs.max_msgs = global.msgs.max_msgs;
            }
            if cl.msgs.max_bytes == 0 {
                cl.msgs.max_bytes = global.msgs.max_bytes;
            }
            if cl.msgs.max_age.is_zero() {
                cl.msgs.max_age = global.msgs.max_age;
            }
            if cl.subs.max_subscriptions == 0 {
                cl.subs.max_subscriptions = global.subs.max_subscriptions;
            }
        }
    }
}

fn check_non_negative(field: &str, value: i64, channel: Option<&str>) -> StoreResult<()> {
    if value >= 0 {
        return Ok(());
    }
    Err(StoreError::InvalidLimits(match channel {
        Some(name) => format!("{} for channel {:?} cannot be negative ({})", field, name, value),
        None => format!("{} cannot be negative ({})", field, value),
    }))
}

fn check_not_above(field: &str, value: i64, global: i64, channel: &str) -> StoreResult<()> {
    // A global value of 0 is unlimited: any override fits.
    if global > 0 && value > global {
        return Err(StoreError::InvalidLimits(format!(
            "{} for channel {:?} ({}) cannot be higher than global limit ({})",
            field, channel, value, global
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits_with_global_msgs(max_msgs: i64) -> StoreLimits {
        let mut sl = StoreLimits::default();
        sl.global.msgs.max_msgs = max_msgs;
        sl
    }

    #[test]
    fn test_zero_override_inherits_global() {
        let mut sl = limits_with_global_msgs(100);
        sl.add_per_channel("foo", ChannelLimits::default());
        sl.build().unwrap();

        let foo = sl.for_channel("foo");
        assert_eq!(foo.msgs.max_msgs, 100);
        assert_eq!(foo.msgs.max_bytes, sl.global.msgs.max_bytes);
        assert_eq!(foo.subs.max_subscriptions, sl.global.subs.max_subscriptions);
    }

    #[test]
    fn test_explicit_override_is_kept() {
        let mut sl = limits_with_global_msgs(100);
        sl.add_per_channel("foo", ChannelLimits::with_max_msgs(50));
        sl.build().unwrap();
        assert_eq!(sl.for_channel("foo").msgs.max_msgs, 50);
        assert_eq!(sl.for_channel("bar").msgs.max_msgs, 100);
    }

    #[test]
    fn test_override_above_global_fails() {
        let mut sl = limits_with_global_msgs(100);
        sl.add_per_channel("foo", ChannelLimits::with_max_msgs(200));
        let err = sl.build().unwrap_err();
        assert!(matches!(err, StoreError::InvalidLimits(_)));
    }

    #[test]
    fn test_failed_build_leaves_overrides_untouched() {
        let mut sl = limits_with_global_msgs(100);
        sl.add_per_channel("ok", ChannelLimits::default());
        sl.add_per_channel("bad", ChannelLimits::with_max_msgs(200));
        assert!(sl.build().is_err());
        // No inheritance was applied to the valid entry either.
        assert_eq!(sl.per_channel["ok"].msgs.max_msgs, 0);
    }

    #[test]
    fn test_negative_values_rejected() {
        let mut sl = StoreLimits::default();
        sl.global.msgs.max_bytes = -1;
        assert!(sl.build().is_err());

        let mut sl = StoreLimits::default();
        sl.max_channels = -1;
        assert!(sl.build().is_err());

        let mut sl = StoreLimits::default();
        let mut cl = ChannelLimits::default();
        cl.subs.max_subscriptions = -5;
        sl.add_per_channel("foo", cl);
        assert!(sl.build().is_err());
    }

    #[test]
    fn test_too_many_overrides() {
        let mut sl = StoreLimits::default();
        sl.max_channels = 1;
        sl.add_per_channel("a", ChannelLimits::default());
        sl.add_per_channel("b", ChannelLimits::default());
        assert!(sl.build().is_err());
    }

    #[test]
    fn test_unlimited_global_accepts_any_override() {
        let mut sl = StoreLimits::unlimited();
        sl.add_per_channel("foo", ChannelLimits::with_max_msgs(1_000_000));
        sl.build().unwrap();
        assert_eq!(sl.for_channel("foo").msgs.max_msgs, 1_000_000);
    }

    #[test]
    fn test_build_is_idempotent() {
        let mut sl = limits_with_global_msgs(100);
        sl.add_per_channel("foo", ChannelLimits::default());
        sl.build().unwrap();
        let once = sl.clone();
        sl.build().unwrap();
        assert_eq!(sl, once);
    }

    #[test]
    fn test_age_override_above_global_fails() {
        let mut sl = StoreLimits::default();
        sl.global.msgs.max_age = Duration::from_secs(10);
        let mut cl = ChannelLimits::default();
        cl.msgs.max_age = Duration::from_secs(20);
        sl.add_per_channel("foo", cl);
        assert!(sl.build().is_err());
    }

    #[test]
    fn test_from_json() {
        let sl = StoreLimits::from_json_str(
            r#"{
                "max_channels": 10,
                "max_msgs": 100,
                "max_age": 60,
                "per_channel": { "orders": { "max_msgs": 50 } }
            }"#,
        )
        .unwrap();
        assert_eq!(sl.max_channels, 10);
        assert_eq!(sl.global.msgs.max_msgs, 100);
        assert_eq!(sl.global.msgs.max_age, Duration::from_secs(60));
        assert_eq!(sl.per_channel["orders"].msgs.max_msgs, 50);
        // Unspecified fields fall back to the defaults.
        assert_eq!(sl.global.subs.max_subscriptions, 1000);
    }
}
