//! Process-level configuration for the bridge.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::{Level, warn};

/// Default capacity of the native log queue drained by host runtimes.
pub const DEFAULT_LOG_CAPACITY: usize = 256;

/// Codec parameters applied when an SDP format omits them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecDefaults {
    /// Sample rate in Hertz used when `rate` is absent.
    pub sample_rate: u32,
    /// Bitrate in bits per second used when `bitrate` is absent.
    pub bitrate_bps: u32,
    /// Packet duration in milliseconds used when `frame_size_ms` is absent.
    pub frame_size_ms: u32,
}

impl Default for CodecDefaults {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            bitrate_bps: 64_000,
            frame_size_ms: 20,
        }
    }
}

/// Tunables shared by the bridge components.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Maximum tracing level forwarded to subscribers.
    pub log_level: Level,
    /// Bounded size of the in-memory log queue.
    pub log_capacity: usize,
    /// Interval used by polling hotplug watchers.
    pub hotplug_poll_interval: Duration,
    /// Capture delay subtracted from custom audio source timestamps.
    pub capture_delay_us: i64,
    /// Fallback codec parameters.
    pub codec_defaults: CodecDefaults,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            log_capacity: DEFAULT_LOG_CAPACITY,
            hotplug_poll_interval: Duration::from_secs(1),
            capture_delay_us: 0,
            codec_defaults: CodecDefaults::default(),
        }
    }
}

impl BridgeConfig {
    /// Build a configuration from the defaults overridden by `MEDIA_BRIDGE_*` variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`BridgeConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(level) = parse_var::<Level>(&lookup, "MEDIA_BRIDGE_LOG") {
            config.log_level = level;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "MEDIA_BRIDGE_LOG_CAPACITY") {
            config.log_capacity = capacity.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MEDIA_BRIDGE_HOTPLUG_POLL_MS") {
            config.hotplug_poll_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(delay) = parse_var::<i64>(&lookup, "MEDIA_BRIDGE_CAPTURE_DELAY_US") {
            config.capture_delay_us = delay;
        }
        if let Some(rate) = parse_var::<u32>(&lookup, "MEDIA_BRIDGE_CODEC_RATE") {
            config.codec_defaults.sample_rate = rate;
        }
        if let Some(bitrate) = parse_var::<u32>(&lookup, "MEDIA_BRIDGE_CODEC_BITRATE") {
            config.codec_defaults.bitrate_bps = bitrate;
        }
        if let Some(ms) = parse_var::<u32>(&lookup, "MEDIA_BRIDGE_CODEC_FRAME_MS") {
            config.codec_defaults.frame_size_ms = ms;
        }
        config
    }
}

fn parse_var<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}
