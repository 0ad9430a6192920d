//! Runtime configuration injected into the core at call time.
//!
//! The server owns a [`CoreConfig`] that admins may change while running;
//! every gate check receives a snapshot of it rather than reading globals.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use duolog_shared::constants::{
    DEFAULT_MONETIZE_INTERVAL_HOURS, DEFAULT_MONETIZE_MIN_WAIT_SECONDS,
    DEFAULT_MONETIZE_TOKEN_TTL_MINUTES, DEFAULT_WARN_THRESHOLD,
};

/// Global monetization gate defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Global switch, used for users without a per-user override.
    pub enabled: bool,
    /// Hours unlocked by one completed challenge.
    pub interval_hours: i64,
    /// Lifetime of an issued token.
    pub token_ttl_minutes: i64,
    /// Completions faster than this after issue are rejected.
    pub min_wait_seconds: i64,
    /// External link presented with every challenge.
    pub short_url: String,
}

impl GateConfig {
    pub fn interval(&self) -> Duration {
        Duration::hours(self.interval_hours)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::minutes(self.token_ttl_minutes)
    }

    pub fn min_wait(&self) -> Duration {
        Duration::seconds(self.min_wait_seconds)
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: DEFAULT_MONETIZE_INTERVAL_HOURS,
            token_ttl_minutes: DEFAULT_MONETIZE_TOKEN_TTL_MINUTES,
            min_wait_seconds: DEFAULT_MONETIZE_MIN_WAIT_SECONDS,
            short_url: "https://example.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Warnings at which a user is banned automatically.
    pub warn_threshold: u32,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            warn_threshold: DEFAULT_WARN_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub gate: GateConfig,
    pub moderation: ModerationConfig,
}
