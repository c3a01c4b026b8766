//! Configuration for the session server.
//!
//! Defaults, overridable via environment variables:
//!
//! - `SESSION_BIND_ADDR`      (default: "0.0.0.0")
//! - `SESSION_PORT`           (default: "9000")
//! - `SESSION_MAX_CLIENTS`    (default: "1024")
//! - `SESSION_TICK_HZ`        (default: "120")
//! - `SESSION_TOKEN_FILE`     (optional JSON token table)
//! - `SESSION_WORLD_FILE`     (optional JSON world catalog)
//! - `SESSION_USER_FILE`      (optional JSON user directory)
//! - `SESSION_CONNECT_POLICY` (`strict` | `single`, default: "single")
//! - `SESSION_PLAYER_LIMIT`   (default: "4")

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use session_core::conquest::{WorldCatalog, MAX_PLAYERS};
use session_core::{ConnectPolicy, ConquestSettings, RegistrySettings};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// IP address / interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,

    /// TCP port to listen on; 0 picks a free port.
    pub port: u16,

    /// Maximum number of simultaneously connected streams.
    pub max_clients: usize,

    /// Engine tick frequency.
    pub tick_hz: u32,

    pub token_file: Option<PathBuf>,
    pub world_file: Option<PathBuf>,
    pub user_file: Option<PathBuf>,

    pub connect_policy: ConnectPolicy,
    pub player_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 9000,
            max_clients: 1024,
            tick_hz: 120,
            token_file: None,
            world_file: None,
            user_file: None,
            connect_policy: ConnectPolicy::default(),
            player_limit: MAX_PLAYERS,
        }
    }
}

impl Config {
    /// Construct a `Config` from environment variables, falling back
    /// to the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let bind_addr = env::var("SESSION_BIND_ADDR").unwrap_or(defaults.bind_addr);
        let port = read_env_or_default("SESSION_PORT", defaults.port)?;
        let max_clients = read_env_or_default("SESSION_MAX_CLIENTS", defaults.max_clients)?;
        let tick_hz = read_env_or_default("SESSION_TICK_HZ", defaults.tick_hz)?;
        let connect_policy = read_env_or_default("SESSION_CONNECT_POLICY", defaults.connect_policy)?;
        let player_limit = read_env_or_default("SESSION_PLAYER_LIMIT", defaults.player_limit)?;

        Ok(Config {
            bind_addr,
            port,
            max_clients,
            tick_hz: tick_hz.max(1),
            token_file: env::var_os("SESSION_TOKEN_FILE").map(PathBuf::from),
            world_file: env::var_os("SESSION_WORLD_FILE").map(PathBuf::from),
            user_file: env::var_os("SESSION_USER_FILE").map(PathBuf::from),
            connect_policy,
            player_limit,
        })
    }

    /// Loopback on a free port, for tests.
    pub fn local() -> Self {
        Config {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn tick_interval_ms(&self) -> u64 {
        (1000 / u64::from(self.tick_hz.max(1))).max(1)
    }

    /// World catalog from `SESSION_WORLD_FILE`, or the built-in one.
    pub fn load_worlds(&self) -> anyhow::Result<WorldCatalog> {
        let Some(path) = &self.world_file else {
            return Ok(WorldCatalog::builtin());
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading world file {}", path.display()))?;
        WorldCatalog::from_json(&text).with_context(|| format!("parsing world file {}", path.display()))
    }

    pub fn registry_settings(&self, worlds: WorldCatalog) -> RegistrySettings {
        let conquest = ConquestSettings {
            player_limit: self.player_limit,
            worlds,
            ..ConquestSettings::default()
        };

        RegistrySettings {
            connect_policy: self.connect_policy,
            tick_interval_ms: self.tick_interval_ms(),
            conquest: Arc::new(conquest),
            seed: None,
        }
    }
}

fn read_env_or_default<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(val) => val.parse::<T>().with_context(|| format!("invalid value for {key}: {val:?}")),
        Err(_) => Ok(default),
    }
}
