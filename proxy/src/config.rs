//! Proxy configuration, loaded from a TOML file.
//!
//! ```toml
//! max_staleness_ms = 5000
//!
//! [rate_limit]
//! capacity = 20
//! refill_rate = 5.0
//!
//! [[backends]]
//! name = "main"
//! listen = "0.0.0.0:27016"
//! address = "127.0.0.1:27015"
//! poll_interval_ms = 2000
//! timeout_ms = 1000
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use shared::{QueryType, DEFAULT_MAX_PACKET_SIZE, MAX_DATAGRAM_SIZE};

use crate::error::ProxyError;

const MIN_PACKET_SIZE: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: u64,
    #[serde(default = "default_cache_idle_eviction_ttl_ms")]
    pub cache_idle_eviction_ttl_ms: u64,
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default)]
    pub require_info_challenge: bool,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    #[serde(default = "default_max_pending_clients")]
    pub max_pending_clients: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub abuse: Option<AbuseConfig>,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Bucket size, i.e. the burst a fresh address may send
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    #[serde(default = "default_bucket_idle_ttl_ms")]
    pub idle_ttl_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            idle_ttl_ms: default_bucket_idle_ttl_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }
}

/// Escalation from rate limiting to the denylist
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AbuseConfig {
    /// Consecutive rate-limited requests before an address is denied
    pub drop_threshold: u32,
    pub ban_duration_ms: u64,
}

impl AbuseConfig {
    pub fn ban_duration(&self) -> Duration {
        Duration::from_millis(self.ban_duration_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub name: String,
    /// Client-facing address answering on behalf of this backend
    pub listen: SocketAddr,
    /// The real game server
    pub address: SocketAddr,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub players_poll_interval_ms: Option<u64>,
    pub rules_poll_interval_ms: Option<u64>,
    #[serde(default = "default_socket_lifetime_ms")]
    pub socket_lifetime_ms: u64,
}

/// Index of a backend in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub usize);

/// Runtime view of one backend, read-only once the proxy starts
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: BackendId,
    pub name: String,
    pub listen: SocketAddr,
    pub address: SocketAddr,
    pub poll_interval: Duration,
    pub players_poll_interval: Duration,
    pub rules_poll_interval: Duration,
    pub timeout: Duration,
    pub socket_lifetime: Duration,
}

impl Backend {
    pub fn from_config(id: BackendId, config: &BackendConfig) -> Self {
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        Self {
            id,
            name: config.name.clone(),
            listen: config.listen,
            address: config.address,
            poll_interval,
            players_poll_interval: config
                .players_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(poll_interval),
            rules_poll_interval: config
                .rules_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(poll_interval),
            timeout: Duration::from_millis(config.timeout_ms),
            socket_lifetime: Duration::from_millis(config.socket_lifetime_ms),
        }
    }

    /// Keep-alive cadence for one query type
    pub fn poll_interval_for(&self, query: QueryType) -> Duration {
        match query {
            QueryType::Info => self.poll_interval,
            QueryType::Players => self.players_poll_interval,
            QueryType::Rules => self.rules_poll_interval,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ProxyError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.backends.is_empty() {
            return Err(ProxyError::Config("at least one backend is required".into()));
        }
        if self.max_staleness_ms == 0 || self.client_timeout_ms == 0 {
            return Err(ProxyError::Config(
                "max_staleness_ms and client_timeout_ms must be positive".into(),
            ));
        }
        if self.sweep_interval_ms == 0 || self.stats_interval_ms == 0 {
            return Err(ProxyError::Config(
                "sweep_interval_ms and stats_interval_ms must be positive".into(),
            ));
        }
        if !(MIN_PACKET_SIZE..=MAX_DATAGRAM_SIZE).contains(&self.max_packet_size) {
            return Err(ProxyError::Config(format!(
                "max_packet_size must be between {} and {}",
                MIN_PACKET_SIZE, MAX_DATAGRAM_SIZE
            )));
        }
        if self.rate_limit.capacity == 0 {
            return Err(ProxyError::Config("rate_limit.capacity must be at least 1".into()));
        }
        if !self.rate_limit.refill_rate.is_finite() || self.rate_limit.refill_rate < 0.0 {
            return Err(ProxyError::Config(
                "rate_limit.refill_rate must be a non-negative number".into(),
            ));
        }
        if let Some(abuse) = &self.abuse {
            if abuse.drop_threshold == 0 {
                return Err(ProxyError::Config("abuse.drop_threshold must be at least 1".into()));
            }
        }

        let mut names = HashSet::new();
        let mut listeners = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(ProxyError::Config(format!(
                    "duplicate backend name {}",
                    backend.name
                )));
            }
            // Port 0 asks the OS for a fresh port, so it never collides.
            if backend.listen.port() != 0 && !listeners.insert(backend.listen) {
                return Err(ProxyError::Config(format!(
                    "listen address {} is used by more than one backend",
                    backend.listen
                )));
            }
            let intervals = [
                Some(backend.poll_interval_ms),
                backend.players_poll_interval_ms,
                backend.rules_poll_interval_ms,
            ];
            if intervals.iter().flatten().any(|&ms| ms == 0)
                || backend.timeout_ms == 0
                || backend.socket_lifetime_ms == 0
            {
                return Err(ProxyError::Config(format!(
                    "backend {}: intervals, timeout and socket lifetime must be positive",
                    backend.name
                )));
            }
        }

        Ok(())
    }

    pub fn backends(&self) -> Vec<Backend> {
        self.backends
            .iter()
            .enumerate()
            .map(|(i, config)| Backend::from_config(BackendId(i), config))
            .collect()
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.max_staleness_ms)
    }

    pub fn cache_idle_eviction_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_idle_eviction_ttl_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

fn default_max_staleness_ms() -> u64 {
    5_000
}

fn default_cache_idle_eviction_ttl_ms() -> u64 {
    300_000
}

fn default_client_timeout_ms() -> u64 {
    1_000
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_stats_interval_ms() -> u64 {
    60_000
}

fn default_max_pending_clients() -> usize {
    1_024
}

fn default_capacity() -> u32 {
    20
}

fn default_refill_rate() -> f64 {
    5.0
}

fn default_bucket_idle_ttl_ms() -> u64 {
    60_000
}

fn default_socket_lifetime_ms() -> u64 {
    300_000
}
