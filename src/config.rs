//! Ring setup configuration.

use crate::constants::QUEUE_DEPTH_DEFAULT;

/// Environment variable overriding [`RingConfig::queue_depth`].
pub const ENV_QUEUE_DEPTH: &str = "URING_QUEUE_DEPTH";
/// Environment variable overriding [`RingConfig::flags`].
pub const ENV_SETUP_FLAGS: &str = "URING_SETUP_FLAGS";

/// Parameters for [`Ring::setup_with`](crate::io::Ring::setup_with).
///
/// Values are passed through to the transport unvalidated; the kernel (or the
/// transport standing in for it) decides whether a depth or flag set is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Requested submission-queue depth.
    pub queue_depth: u32,
    /// `IORING_SETUP_*` bits, see [`crate::constants`].
    pub flags: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            queue_depth: QUEUE_DEPTH_DEFAULT,
            flags: 0,
        }
    }
}

impl RingConfig {
    pub fn builder() -> RingConfigBuilder {
        RingConfigBuilder::default()
    }

    /// Defaults overridden by [`ENV_QUEUE_DEPTH`] and [`ENV_SETUP_FLAGS`].
    ///
    /// Missing or unparsable variables fall back to the default value.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(name).and_then(|value| parse_u32(&value));
        let defaults = Self::default();
        Self {
            queue_depth: parse(ENV_QUEUE_DEPTH).unwrap_or(defaults.queue_depth),
            flags: parse(ENV_SETUP_FLAGS).unwrap_or(defaults.flags),
        }
    }
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_u32(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RingConfigBuilder {
    config: RingConfig,
}

impl RingConfigBuilder {
    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.config.queue_depth = depth;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.config.flags = flags;
        self
    }

    pub fn build(self) -> RingConfig {
        self.config
    }
}
