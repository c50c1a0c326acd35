use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::token::Partitioner;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Which backend holds the membership records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local; records vanish on restart. Single-node setups and tests.
    #[default]
    Memory,
    /// PostgreSQL via `DATABASE_URL`.
    Postgres,
    /// Redis via `REDIS_URL`.
    Redis,
}

impl StoreBackend {
    /// Parse the backend from the STORE_BACKEND environment variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var("STORE_BACKEND") {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            _ => Err(ConfigError::Invalid {
                key: "STORE_BACKEND",
                value: s.to_string(),
                reason: "expected memory, postgres or redis".into(),
            }),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settings shared by the allocation engine, the membership index and the
/// control surface.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Cluster name used for every record created through the control surface.
    pub application: String,
    /// Datacenter of the nodes this registry serves.
    pub datacenter: String,
    /// Rack order used to interleave token segments. Racks seen at runtime
    /// but not listed here are appended in sorted order.
    pub racks: Vec<String>,
    /// Expected nodes per rack; with the rack count this sizes the segments.
    pub nodes_per_rack: u32,
    pub partitioner: Partitioner,
    /// Token candidates tried before giving up with `AllocationExhausted`.
    pub max_attempts: u32,
    /// Base delay of the randomized exponential backoff between candidates.
    pub backoff: Duration,
    /// Deadline of a single store round trip.
    pub store_timeout: Duration,
    /// Deadline of a whole registry call.
    pub call_timeout: Duration,
    /// Serve reads from an invalidated snapshot instead of the store.
    pub index_cache: bool,
    /// How often cached snapshots are rebuilt from the store. `None` disables
    /// the background refresh.
    pub refresh_interval: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            application: "cass_cluster".into(),
            datacenter: "us-east-1".into(),
            racks: Vec::new(),
            nodes_per_rack: 3,
            partitioner: Partitioner::default(),
            max_attempts: 10,
            backoff: Duration::from_millis(20),
            store_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(10),
            index_cache: true,
            refresh_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl RegistryConfig {
    /// Load from `RINGKEEPER_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let racks = match lookup("RINGKEEPER_RACKS") {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.racks,
        };

        let refresh_secs: u64 = parse(
            &lookup,
            "RINGKEEPER_REFRESH_SECS",
            defaults.refresh_interval.map_or(0, |d| d.as_secs()),
        )?;

        let config = Self {
            application: lookup("RINGKEEPER_APP").unwrap_or(defaults.application),
            datacenter: lookup("RINGKEEPER_DC").unwrap_or(defaults.datacenter),
            racks,
            nodes_per_rack: parse(&lookup, "RINGKEEPER_NODES_PER_RACK", defaults.nodes_per_rack)?,
            partitioner: match lookup("RINGKEEPER_PARTITIONER") {
                Some(value) => value.parse::<Partitioner>().map_err(|reason| ConfigError::Invalid {
                    key: "RINGKEEPER_PARTITIONER",
                    value,
                    reason,
                })?,
                None => defaults.partitioner,
            },
            max_attempts: parse(&lookup, "RINGKEEPER_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff: Duration::from_millis(parse(
                &lookup,
                "RINGKEEPER_BACKOFF_MS",
                defaults.backoff.as_millis() as u64,
            )?),
            store_timeout: Duration::from_millis(parse(
                &lookup,
                "RINGKEEPER_STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
            call_timeout: Duration::from_millis(parse(
                &lookup,
                "RINGKEEPER_CALL_TIMEOUT_MS",
                defaults.call_timeout.as_millis() as u64,
            )?),
            index_cache: parse(&lookup, "RINGKEEPER_INDEX_CACHE", defaults.index_cache)?,
            refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.application.trim().is_empty() {
            return Err(ConfigError::Missing("RINGKEEPER_APP"));
        }
        if self.datacenter.trim().is_empty() {
            return Err(ConfigError::Missing("RINGKEEPER_DC"));
        }
        let positive = [
            ("RINGKEEPER_NODES_PER_RACK", self.nodes_per_rack as u64),
            ("RINGKEEPER_MAX_ATTEMPTS", self.max_attempts as u64),
            ("RINGKEEPER_STORE_TIMEOUT_MS", self.store_timeout.as_millis() as u64),
            ("RINGKEEPER_CALL_TIMEOUT_MS", self.call_timeout.as_millis() as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".into(),
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
