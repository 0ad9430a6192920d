//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use duolog_core::CoreConfig;

#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: the platform data directory (see `Database::default_path`).
    pub database_path: Option<PathBuf>,

    /// Gate and moderation settings handed to the core. Admins may change
    /// them at runtime through `/admin/config`.
    /// Env: `MONETIZE_ENABLED`, `MONETIZE_INTERVAL_HOURS`,
    /// `MONETIZE_TOKEN_TTL_MINUTES`, `MONETIZE_MIN_WAIT_SECONDS`,
    /// `SHORT_URL`, `WARN_THRESHOLD`
    pub core: CoreConfig,

    /// Admin API bearer token.
    /// Env: `ADMIN_TOKEN`
    /// Default: unset (admin API disabled).
    pub admin_token: Option<String>,

    /// Shared secret the chat gateway presents on every `/users/*` request
    /// in the `x-gateway-token` header.
    /// Env: `GATEWAY_TOKEN`
    /// Default: unset (user API disabled).
    pub gateway_token: Option<String>,

    /// Sessions without traffic for this long are closed.
    /// Env: `SESSION_IDLE_TIMEOUT_SECS`
    /// Default: `1800`
    pub session_idle_timeout_secs: u64,

    /// Upper bound between two matching passes. Queue changes trigger a pass
    /// immediately.
    /// Env: `MATCH_INTERVAL_SECS`
    /// Default: `2`
    pub match_interval_secs: u64,

    /// Period of the idle/token sweep.
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: `60`
    pub sweep_interval_secs: u64,

    /// Sustained messages per second per user.
    /// Env: `RELAY_RATE_PER_SEC`
    /// Default: `5`
    pub relay_rate_per_sec: f64,

    /// Message burst per user.
    /// Env: `RELAY_BURST`
    /// Default: `20`
    pub relay_burst: f64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("core", &self.core)
            .field("admin_enabled", &self.admin_token.is_some())
            .field("gateway_enabled", &self.gateway_token.is_some())
            .field("session_idle_timeout_secs", &self.session_idle_timeout_secs)
            .field("match_interval_secs", &self.match_interval_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("relay_rate_per_sec", &self.relay_rate_per_sec)
            .field("relay_burst", &self.relay_burst)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: None,
            core: CoreConfig::default(),
            admin_token: None,
            gateway_token: None,
            session_idle_timeout_secs: 1800,
            match_interval_secs: 2,
            sweep_interval_secs: 60,
            relay_rate_per_sec: 5.0,
            relay_burst: 20.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        // -- Gate --

        if let Some(val) = lookup("MONETIZE_ENABLED") {
            config.core.gate.enabled = parse_flag(&val);
        }
        parse_into(
            &lookup,
            "MONETIZE_INTERVAL_HOURS",
            &mut config.core.gate.interval_hours,
        );
        parse_into(
            &lookup,
            "MONETIZE_TOKEN_TTL_MINUTES",
            &mut config.core.gate.token_ttl_minutes,
        );
        parse_into(
            &lookup,
            "MONETIZE_MIN_WAIT_SECONDS",
            &mut config.core.gate.min_wait_seconds,
        );
        if let Some(url) = lookup("SHORT_URL").filter(|u| !u.is_empty()) {
            config.core.gate.short_url = url;
        }

        // -- Moderation & admin --

        parse_into(
            &lookup,
            "WARN_THRESHOLD",
            &mut config.core.moderation.warn_threshold,
        );
        if let Some(token) = lookup("ADMIN_TOKEN").filter(|t| !t.is_empty()) {
            config.admin_token = Some(token);
        }
        if let Some(token) = lookup("GATEWAY_TOKEN").filter(|t| !t.is_empty()) {
            config.gateway_token = Some(token);
        }

        // -- Background tasks & limits --

        parse_into(
            &lookup,
            "SESSION_IDLE_TIMEOUT_SECS",
            &mut config.session_idle_timeout_secs,
        );
        parse_into(&lookup, "MATCH_INTERVAL_SECS", &mut config.match_interval_secs);
        parse_into(&lookup, "SWEEP_INTERVAL_SECS", &mut config.sweep_interval_secs);
        parse_into(&lookup, "RELAY_RATE_PER_SEC", &mut config.relay_rate_per_sec);
        parse_into(&lookup, "RELAY_BURST", &mut config.relay_burst);

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.session_idle_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn match_interval(&self) -> Duration {
        Duration::from_secs(self.match_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_flag(value: &str) -> bool {
    value != "false" && value != "0"
}

/// Overwrite `target` when `name` is set and parses; keep the default and
/// warn otherwise.
fn parse_into<F, T>(lookup: &F, name: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(var = name, value = %raw, "Invalid value, using default"),
    }
}
