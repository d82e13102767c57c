use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::model::Ms;
use crate::reservation::DEFAULT_TTL_MS;

/// Per-engine tuning. One copy per tenant.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reservation_ttl_ms: Ms,
    /// Bound on every single lock acquisition.
    pub lock_timeout: Duration,
    /// Bound on the whole lock-acquisition phase of a checkout.
    pub checkout_timeout: Duration,
    /// How long settled reservations survive WAL compaction.
    pub retention_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: DEFAULT_TTL_MS,
            lock_timeout: Duration::from_millis(2000),
            checkout_timeout: Duration::from_millis(5000),
            retention_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Server settings, read from `STOCKHOLD_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            reservation_ttl_ms: parse_var(&lookup, "STOCKHOLD_RESERVATION_TTL_SECS")
                .map(|s: u64| s as Ms * 1000)
                .unwrap_or(defaults.reservation_ttl_ms),
            lock_timeout: parse_var(&lookup, "STOCKHOLD_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            checkout_timeout: parse_var(&lookup, "STOCKHOLD_CHECKOUT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.checkout_timeout),
            retention_ms: parse_var(&lookup, "STOCKHOLD_RETENTION_SECS")
                .map(|s: u64| s as Ms * 1000)
                .unwrap_or(defaults.retention_ms),
        };

        let config = Self {
            port: parse_var(&lookup, "STOCKHOLD_PORT").unwrap_or(5480),
            bind: lookup("STOCKHOLD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("STOCKHOLD_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: lookup("STOCKHOLD_PASSWORD").unwrap_or_else(|| "stockhold".into()),
            max_connections: parse_var(&lookup, "STOCKHOLD_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parse_var(&lookup, "STOCKHOLD_COMPACT_THRESHOLD").unwrap_or(1000),
            sweep_interval: parse_var(&lookup, "STOCKHOLD_SWEEP_INTERVAL_SECS")
                .and_then(|secs: u64| {
                    if secs == 0 {
                        warn!("ignoring STOCKHOLD_SWEEP_INTERVAL_SECS=0, the sweeper needs a non-zero period");
                        None
                    } else {
                        Some(Duration::from_secs(secs))
                    }
                })
                .unwrap_or(Duration::from_secs(60)),
            metrics_port: parse_var(&lookup, "STOCKHOLD_METRICS_PORT"),
            engine,
        };

        if config.sweep_interval.as_millis() as Ms >= config.engine.reservation_ttl_ms {
            warn!(
                "sweep interval {:?} is not shorter than the reservation TTL ({} ms); \
                 stock will stay held well past expiry",
                config.sweep_interval, config.engine.reservation_ttl_ms
            );
        }
        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}
