// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Every setting the relay reads lives here so components get
// their values injected rather than reaching into the environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::access::AccessPolicy;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;
const DEFAULT_DISPATCH_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Postgres pool settings for the document-access lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Refuse connection strings that do not require TLS.
    pub require_tls: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
            require_tls: true,
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string for the document-access lookup.
    pub database_url: Option<String>,
    pub pool: PoolConfig,
    /// Redis URL for the cross-process bus. Without it the relay runs
    /// single-node on an in-process bus.
    pub redis_url: Option<String>,
    /// How ownership and membership combine into an access decision.
    pub access_policy: AccessPolicy,
    /// Per-connection outbound queue bound; overflow drops the newest event.
    pub outbound_queue_capacity: usize,
    /// Bound of the queue between the bus subscription and the dispatcher.
    pub dispatch_queue_capacity: usize,
    /// Ping cadence for connected sockets.
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered before the socket is closed.
    pub heartbeat_timeout: Duration,
    /// Log filter directive (e.g. `info`, `marginalia_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `MARGINALIA_RELAY_HOST` | `0.0.0.0` |
    /// | `MARGINALIA_RELAY_PORT` | `8080` |
    /// | `MARGINALIA_RELAY_DATABASE_URL` | *(none)* |
    /// | `MARGINALIA_RELAY_DB_MIN_CONNECTIONS` | `2` |
    /// | `MARGINALIA_RELAY_DB_MAX_CONNECTIONS` | `20` |
    /// | `MARGINALIA_RELAY_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    /// | `MARGINALIA_RELAY_DB_REQUIRE_TLS` | `true` |
    /// | `MARGINALIA_RELAY_REDIS_URL` | *(none: in-process bus)* |
    /// | `MARGINALIA_RELAY_ACCESS_POLICY` | `owner_or_member` |
    /// | `MARGINALIA_RELAY_OUTBOUND_QUEUE_CAPACITY` | `64` |
    /// | `MARGINALIA_RELAY_DISPATCH_QUEUE_CAPACITY` | `1024` |
    /// | `MARGINALIA_RELAY_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `MARGINALIA_RELAY_HEARTBEAT_TIMEOUT_MS` | `10000` |
    /// | `MARGINALIA_RELAY_LOG_FILTER` | `info` |
    /// | `MARGINALIA_RELAY_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("MARGINALIA_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_var(&env, "MARGINALIA_RELAY_PORT").unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("MARGINALIA_RELAY_DATABASE_URL").ok().filter(|v| !v.is_empty());
        let pool = PoolConfig {
            min_connections: parse_var(&env, "MARGINALIA_RELAY_DB_MIN_CONNECTIONS")
                .unwrap_or(DEFAULT_DB_MIN_CONNECTIONS),
            max_connections: parse_var(&env, "MARGINALIA_RELAY_DB_MAX_CONNECTIONS")
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(
                parse_var(&env, "MARGINALIA_RELAY_DB_ACQUIRE_TIMEOUT_SECS")
                    .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
            ),
            require_tls: parse_var(&env, "MARGINALIA_RELAY_DB_REQUIRE_TLS").unwrap_or(true),
        };

        let redis_url = env("MARGINALIA_RELAY_REDIS_URL").ok().filter(|v| !v.is_empty());

        let access_policy = env("MARGINALIA_RELAY_ACCESS_POLICY")
            .ok()
            .and_then(|value| AccessPolicy::parse(&value))
            .unwrap_or_default();

        let outbound_queue_capacity = parse_var(&env, "MARGINALIA_RELAY_OUTBOUND_QUEUE_CAPACITY")
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY);
        let dispatch_queue_capacity = parse_var(&env, "MARGINALIA_RELAY_DISPATCH_QUEUE_CAPACITY")
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(DEFAULT_DISPATCH_QUEUE_CAPACITY);

        let heartbeat_interval = Duration::from_millis(
            parse_var(&env, "MARGINALIA_RELAY_HEARTBEAT_INTERVAL_MS")
                .filter(|millis: &u64| *millis > 0)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
        );
        let heartbeat_timeout = Duration::from_millis(
            parse_var(&env, "MARGINALIA_RELAY_HEARTBEAT_TIMEOUT_MS")
                .filter(|millis: &u64| *millis > 0)
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        );

        let log_filter = env("MARGINALIA_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("MARGINALIA_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            database_url,
            pool,
            redis_url,
            access_policy,
            outbound_queue_capacity,
            dispatch_queue_capacity,
            heartbeat_interval,
            heartbeat_timeout,
            log_filter,
            log_format,
        }
    }
}

fn parse_var<F, T>(env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok())
}
