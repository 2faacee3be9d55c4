//! Tunables for sessions and hubs. The binaries fill these from their
//! command-line arguments.

use std::time::Duration;

/// Client-side session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a remote-edit highlight stays visible.
    pub decoration_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            decoration_ttl: Duration::from_millis(2000),
        }
    }
}

impl SessionConfig {
    pub fn with_decoration_ttl(mut self, ttl: Duration) -> Self {
        self.decoration_ttl = ttl;
        self
    }
}

/// Hub-side settings for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Applied changes kept for transforming late edits and catching up
    /// rejoining participants. Anything older forces a full resync.
    pub history_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { history_limit: 256 }
    }
}

impl HubConfig {
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }
}
