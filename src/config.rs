//! Configuration loading from `.env` files.

use std::{env, time::Duration};

use anyhow::{bail, Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base domain whose subdomain labels carry publisher keys.
    pub base_domain: String,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// Seed relays used to discover per-user relay lists.
    pub default_relays: Vec<String>,
    /// Fallback blob servers for users without a server list.
    pub default_servers: Vec<String>,
    /// Cache backend selector: `memory`, `kv://host:port[/db]`, or `file://path`.
    pub cache_backend: String,
    /// Default TTL applied when a caller does not pick one.
    pub cache_default_ttl: Duration,
    /// Short TTL for negative marks.
    pub negative_cache_ttl: Duration,
    /// TTL for cached blob bytes.
    pub content_cache_ttl: Duration,
    /// Entry bound for the memory backend.
    pub cache_max_entries: usize,
    /// Refresh TTLs on read for the read-path namespaces.
    pub sliding_expiration: bool,
    /// Maximum wall time for a single relay query.
    pub relay_query_timeout: Duration,
    /// Close relay connections idle longer than this.
    pub connection_idle_threshold: Duration,
    /// How often the connection janitor runs.
    pub cleanup_interval: Duration,
    /// Run the invalidation subscriber.
    pub realtime_invalidation: bool,
    /// Relays the invalidation subscriber listens to.
    pub invalidation_relays: Vec<String>,
    /// Delay before the subscriber reconnects after a drop.
    pub invalidation_reconnect_delay: Duration,
    /// Maximum blob size fetched from a server, in bytes.
    pub max_file_size: usize,
    /// Per-server deadline for blob fetches.
    pub request_timeout: Duration,
    /// Optional SOCKS5 proxy (host:port) for outbound relay connections.
    pub tor_socks: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let base_domain = env::var("BASE_DOMAIN")
            .context("BASE_DOMAIN is required")?
            .to_lowercase();
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP is required")?;
        let default_relays = csv_strings(env::var("DEFAULT_RELAYS").unwrap_or_default());
        if default_relays.is_empty() {
            bail!("DEFAULT_RELAYS must list at least one relay");
        }
        let default_servers = csv_strings(env::var("DEFAULT_SERVERS").unwrap_or_default());
        if default_servers.is_empty() {
            bail!("DEFAULT_SERVERS must list at least one blob server");
        }
        let cache_backend = env::var("CACHE_BACKEND").unwrap_or_else(|_| "memory".into());
        let invalidation_relays = {
            let v = csv_strings(env::var("INVALIDATION_RELAYS").unwrap_or_default());
            if v.is_empty() {
                default_relays.clone()
            } else {
                v
            }
        };
        Ok(Self {
            base_domain,
            bind_http,
            default_relays,
            default_servers,
            cache_backend,
            cache_default_ttl: env_secs("CACHE_DEFAULT_TTL", 3600),
            negative_cache_ttl: env_secs("NEGATIVE_CACHE_TTL", 10),
            content_cache_ttl: env_secs("CONTENT_CACHE_TTL", 1800),
            cache_max_entries: env_usize("CACHE_MAX_ENTRIES", 16384),
            sliding_expiration: env_flag("SLIDING_EXPIRATION", false),
            relay_query_timeout: env_secs("RELAY_QUERY_TIMEOUT", 2),
            connection_idle_threshold: env_secs("CONNECTION_IDLE_THRESHOLD", 3600),
            cleanup_interval: env_secs("CLEANUP_INTERVAL", 300),
            realtime_invalidation: env_flag("REALTIME_INVALIDATION", true),
            invalidation_relays,
            invalidation_reconnect_delay: env_secs("INVALIDATION_RECONNECT_DELAY", 5),
            max_file_size: env_usize("MAX_FILE_SIZE", 10 * 1024 * 1024),
            request_timeout: env_secs("REQUEST_TIMEOUT", 10),
            tor_socks: env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty()),
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Read a duration in whole seconds, falling back to `default`.
fn env_secs(name: &str, default: u64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Read an unsigned size, falling back to `default`.
fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Read a `0`/`1` flag, falling back to `default`.
fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v == "1",
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "BASE_DOMAIN",
        "BIND_HTTP",
        "DEFAULT_RELAYS",
        "DEFAULT_SERVERS",
        "CACHE_BACKEND",
        "CACHE_DEFAULT_TTL",
        "NEGATIVE_CACHE_TTL",
        "CONTENT_CACHE_TTL",
        "CACHE_MAX_ENTRIES",
        "SLIDING_EXPIRATION",
        "RELAY_QUERY_TIMEOUT",
        "CONNECTION_IDLE_THRESHOLD",
        "CLEANUP_INTERVAL",
        "REALTIME_INVALIDATION",
        "INVALIDATION_RELAYS",
        "INVALIDATION_RECONNECT_DELAY",
        "MAX_FILE_SIZE",
        "REQUEST_TIMEOUT",
        "TOR_SOCKS",
    ];

    fn clear_vars() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BASE_DOMAIN=Example.COM\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "DEFAULT_RELAYS=wss://r1,wss://r2\n",
                "DEFAULT_SERVERS=https://s1\n",
                "CACHE_BACKEND=file:///tmp/cache.db\n",
                "CACHE_DEFAULT_TTL=60\n",
                "NEGATIVE_CACHE_TTL=5\n",
                "CONTENT_CACHE_TTL=120\n",
                "CACHE_MAX_ENTRIES=10\n",
                "SLIDING_EXPIRATION=1\n",
                "RELAY_QUERY_TIMEOUT=3\n",
                "CONNECTION_IDLE_THRESHOLD=600\n",
                "CLEANUP_INTERVAL=30\n",
                "REALTIME_INVALIDATION=0\n",
                "INVALIDATION_RELAYS=wss://fast\n",
                "INVALIDATION_RECONNECT_DELAY=2\n",
                "MAX_FILE_SIZE=1000\n",
                "REQUEST_TIMEOUT=4\n",
                "TOR_SOCKS=127.0.0.1:9050\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.base_domain, "example.com");
        assert_eq!(cfg.bind_http, "127.0.0.1:8080");
        assert_eq!(cfg.default_relays, vec!["wss://r1", "wss://r2"]);
        assert_eq!(cfg.default_servers, vec!["https://s1"]);
        assert_eq!(cfg.cache_backend, "file:///tmp/cache.db");
        assert_eq!(cfg.cache_default_ttl, Duration::from_secs(60));
        assert_eq!(cfg.negative_cache_ttl, Duration::from_secs(5));
        assert_eq!(cfg.content_cache_ttl, Duration::from_secs(120));
        assert_eq!(cfg.cache_max_entries, 10);
        assert!(cfg.sliding_expiration);
        assert_eq!(cfg.relay_query_timeout, Duration::from_secs(3));
        assert_eq!(cfg.connection_idle_threshold, Duration::from_secs(600));
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(30));
        assert!(!cfg.realtime_invalidation);
        assert_eq!(cfg.invalidation_relays, vec!["wss://fast"]);
        assert_eq!(cfg.invalidation_reconnect_delay, Duration::from_secs(2));
        assert_eq!(cfg.max_file_size, 1000);
        assert_eq!(cfg.request_timeout, Duration::from_secs(4));
        assert_eq!(cfg.tor_socks, Some("127.0.0.1:9050".into()));
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BASE_DOMAIN=example.com\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "DEFAULT_RELAYS=wss://r1\n",
                "DEFAULT_SERVERS=https://s1\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.cache_backend, "memory");
        assert_eq!(cfg.cache_default_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.negative_cache_ttl, Duration::from_secs(10));
        assert_eq!(cfg.content_cache_ttl, Duration::from_secs(1800));
        assert!(!cfg.sliding_expiration);
        assert_eq!(cfg.relay_query_timeout, Duration::from_secs(2));
        assert_eq!(cfg.connection_idle_threshold, Duration::from_secs(3600));
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(300));
        assert!(cfg.realtime_invalidation);
        // subscriber relays fall back to the default relay set
        assert_eq!(cfg.invalidation_relays, cfg.default_relays);
        assert_eq!(cfg.max_file_size, 10 * 1024 * 1024);
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
        assert!(cfg.tor_socks.is_none());
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BIND_HTTP=127.0.0.1:8080\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn empty_relay_or_server_lists_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BASE_DOMAIN=example.com\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "DEFAULT_RELAYS=\n",
                "DEFAULT_SERVERS=https://s1\n"
            ),
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BASE_DOMAIN=example.com\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "DEFAULT_RELAYS=wss://r1\n",
                "DEFAULT_SERVERS=https://s1\n",
                "CACHE_DEFAULT_TTL=notanumber\n",
                "MAX_FILE_SIZE=nah\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.cache_default_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.max_file_size, 10 * 1024 * 1024);
    }
}
