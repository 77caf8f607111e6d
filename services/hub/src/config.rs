//! Hub configuration, read once from `STAR_`-prefixed environment
//! variables at process start. Grounded on the source's
//! `StarConfig.from_env()`: every option keeps its default when the
//! variable is absent, and is parsed eagerly (a malformed numeric value
//! panics at startup rather than silently falling back).

use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must parse as {}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => raw.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// All tunables a hub process reads at start. See `spec.md` §6.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub hub_host: String,
    pub hub_port: u16,
    pub hub_max_connections: usize,

    /// Parsed and stored but unread: `axum`/`tokio-tungstenite` already
    /// handle WebSocket-level ping/pong transparently, and connection
    /// liveness is instead tracked at the application level by
    /// `heartbeat_interval` and the heartbeat sweeper. Kept as config
    /// surface for parity with the source's `StarConfig`, documented as a
    /// Non-goal in DESIGN.md rather than silently dropped.
    pub ws_ping_interval: Duration,
    pub ws_ping_timeout: Duration,
    pub ws_close_timeout: Duration,

    pub log_level: String,
    /// Parsed and stored but unread: the source's `log_format` is a
    /// Python `logging` format string; `tracing_subscriber`'s formatter
    /// has no equivalent template knob. See DESIGN.md.
    pub log_format: String,
    /// Parsed and stored but unread: file-based log output and a "rich"
    /// console renderer are both out of scope for this port's ambient
    /// logging stack (`tracing_subscriber::fmt` to stderr only). See
    /// DESIGN.md.
    pub log_file: Option<String>,
    pub enable_rich_logging: bool,

    /// Parsed and stored but unread: metrics export to files is explicitly
    /// out of scope (see DESIGN.md).
    pub metrics_enabled: bool,
    pub metrics_export_interval: Duration,
    pub metrics_file: Option<String>,

    pub message_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_host: "localhost".to_string(),
            hub_port: 8000,
            hub_max_connections: 1000,
            ws_ping_interval: Duration::from_secs_f64(30.0),
            ws_ping_timeout: Duration::from_secs_f64(10.0),
            ws_close_timeout: Duration::from_secs_f64(10.0),
            log_level: "info".to_string(),
            log_format: "%(asctime)s - %(name)s - %(levelname)s - %(message)s".to_string(),
            log_file: None,
            enable_rich_logging: false,
            metrics_enabled: false,
            metrics_export_interval: Duration::from_secs_f64(60.0),
            metrics_file: None,
            message_timeout: Duration::from_secs_f64(30.0),
            heartbeat_interval: Duration::from_secs_f64(60.0),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            hub_host: env_string("STAR_HUB_HOST", &defaults.hub_host),
            hub_port: env_parsed("STAR_HUB_PORT", defaults.hub_port),
            hub_max_connections: env_parsed("STAR_HUB_MAX_CONNECTIONS", defaults.hub_max_connections),
            ws_ping_interval: Duration::from_secs_f64(env_parsed(
                "STAR_WS_PING_INTERVAL",
                defaults.ws_ping_interval.as_secs_f64(),
            )),
            ws_ping_timeout: Duration::from_secs_f64(env_parsed(
                "STAR_WS_PING_TIMEOUT",
                defaults.ws_ping_timeout.as_secs_f64(),
            )),
            ws_close_timeout: Duration::from_secs_f64(env_parsed(
                "STAR_WS_CLOSE_TIMEOUT",
                defaults.ws_close_timeout.as_secs_f64(),
            )),
            log_level: env_string("STAR_LOG_LEVEL", &defaults.log_level),
            log_format: env_string("STAR_LOG_FORMAT", &defaults.log_format),
            log_file: env_opt_string("STAR_LOG_FILE"),
            enable_rich_logging: env_bool("STAR_ENABLE_RICH_LOGGING", defaults.enable_rich_logging),
            metrics_enabled: env_bool("STAR_METRICS_ENABLED", defaults.metrics_enabled),
            metrics_export_interval: Duration::from_secs_f64(env_parsed(
                "STAR_METRICS_EXPORT_INTERVAL",
                defaults.metrics_export_interval.as_secs_f64(),
            )),
            metrics_file: env_opt_string("STAR_METRICS_FILE"),
            message_timeout: Duration::from_secs_f64(env_parsed(
                "STAR_MESSAGE_TIMEOUT",
                defaults.message_timeout.as_secs_f64(),
            )),
            heartbeat_interval: Duration::from_secs_f64(env_parsed(
                "STAR_HEARTBEAT_INTERVAL",
                defaults.heartbeat_interval.as_secs_f64(),
            )),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.hub_host, self.hub_port)
    }

    /// Applies a sparse set of overrides, returning a new `Config`. Does
    /// not affect already-open sockets — callers hold a `Config` snapshot
    /// from the time their listener/connection was constructed.
    pub fn apply_overrides(&self, patch: ConfigPatch) -> Self {
        let mut next = self.clone();
        if let Some(v) = patch.hub_max_connections {
            next.hub_max_connections = v;
        }
        if let Some(v) = patch.heartbeat_interval {
            next.heartbeat_interval = v;
        }
        if let Some(v) = patch.message_timeout {
            next.message_timeout = v;
        }
        if let Some(v) = patch.log_level {
            next.log_level = v;
        }
        next
    }
}

/// A sparse patch for [`Config::apply_overrides`]; unset fields are left
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub hub_max_connections: Option<usize>,
    pub heartbeat_interval: Option<Duration>,
    pub message_timeout: Option<Duration>,
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.hub_port, 8000);
        assert_eq!(config.hub_max_connections, 1000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
    }

    #[test]
    fn apply_overrides_only_touches_named_fields() {
        let config = Config::default();
        let patched = config.apply_overrides(ConfigPatch {
            hub_max_connections: Some(42),
            ..Default::default()
        });
        assert_eq!(patched.hub_max_connections, 42);
        assert_eq!(patched.hub_port, config.hub_port);
    }
}
