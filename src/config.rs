//! Runtime tunables for the stores and trackers.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Messages fetched per page, for the initial load and each backfill.
pub const PAGE_SIZE: usize = 20;

/// Quick-react picker vocabulary. Reaction storage accepts any emoji key;
/// this set is a UI convenience only.
pub const QUICK_REACTIONS: [&str; 6] = ["\u{1F44D}", "\u{2764}\u{FE0F}", "\u{1F602}", "\u{1F62E}", "\u{1F622}", "\u{1F389}"];

/// Tunables with defaults matching the production deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between presence heartbeats.
    pub heartbeat_interval_secs: u64,

    /// Trailing window, in seconds, within which a heartbeat counts as active.
    pub active_window_secs: i64,

    /// How long a DM preview stays visible, in milliseconds.
    pub preview_display_ms: u64,

    /// Grace period for the preview hide animation, in milliseconds.
    pub preview_grace_ms: u64,

    /// Pauses between send attempts, in milliseconds. The attempt count is
    /// one more than the number of pauses.
    pub retry_delays_ms: Vec<u64>,

    /// Debounce window for user search, in milliseconds.
    pub search_debounce_ms: u64,

    /// Maximum number of cached images before oldest-entry eviction.
    pub image_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            active_window_secs: 5 * 60,
            preview_display_ms: 4000,
            preview_grace_ms: 300,
            retry_delays_ms: vec![300, 800],
            search_debounce_ms: 250,
            image_cache_capacity: 64,
        }
    }
}

impl Config {
    /// Parse a configuration from a TOML document, filling missing fields
    /// with defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|err| Error::Config(err.to_string()))
    }

    /// Interval between presence heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Trailing activity window for the active-user set.
    pub fn active_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.active_window_secs)
    }

    /// Total lifetime of a DM preview: display time plus the hide-animation
    /// grace period.
    pub fn preview_ttl(&self) -> Duration {
        Duration::from_millis(self.preview_display_ms + self.preview_grace_ms)
    }

    /// Pauses between send attempts.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    /// Debounce window for user search.
    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }
}
