//! Runtime configuration, loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_URL: &str = "sqlite:reliefnet.db?mode=rwc";

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the HTTP and websocket server listens on.
    pub port: u16,

    /// SQLite connection string (e.g. "sqlite:reliefnet.db?mode=rwc" or "sqlite::memory:").
    pub database_url: String,

    /// Upper bound on pooled database connections.
    pub max_connections: u32,

    /// How long a live location update waits before it is written to the
    /// user record. Newer updates arriving within the window supersede it.
    pub location_persist_delay: Duration,

    /// Radius used by the nearby-incidents query when the caller gives none.
    pub nearby_radius_meters: f64,

    /// Page size used when a list request does not specify `limit`.
    pub default_page_limit: u32,

    /// Credential for an admin account created at startup, if any.
    pub bootstrap_admin_token: Option<String>,

    /// Events a live session may have queued before further ones are dropped.
    pub session_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_URL.to_string(),
            max_connections: 5,
            location_persist_delay: Duration::from_secs(10),
            nearby_radius_meters: 10_000.0,
            default_page_limit: 10,
            bootstrap_admin_token: None,
            session_queue_capacity: 256,
        }
    }
}

impl Config {
    /// Build a configuration from `RELIEFNET_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: parse_var("RELIEFNET_PORT").unwrap_or(defaults.port),
            database_url: env::var("RELIEFNET_DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse_var("RELIEFNET_DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            location_persist_delay: parse_var::<u64>("RELIEFNET_LOCATION_PERSIST_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.location_persist_delay),
            nearby_radius_meters: parse_var("RELIEFNET_NEARBY_RADIUS_METERS")
                .unwrap_or(defaults.nearby_radius_meters),
            default_page_limit: parse_var("RELIEFNET_DEFAULT_PAGE_LIMIT")
                .unwrap_or(defaults.default_page_limit),
            bootstrap_admin_token: env::var("RELIEFNET_BOOTSTRAP_ADMIN_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            session_queue_capacity: parse_var("RELIEFNET_SESSION_QUEUE_CAPACITY")
                .unwrap_or(defaults.session_queue_capacity),
        }
    }

    /// Configuration for tests: in-memory database, no persistence delay.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            location_persist_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}
