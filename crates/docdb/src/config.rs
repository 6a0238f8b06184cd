//! Configuration for the document-store adapter.
//!
//! Configuration arrives as plain key/value pairs from the hosting server and
//! is bound into [`DocumentStoreConfig`]. Durations use the human-readable
//! `humantime` format (`"30s"`, `"250ms"`).
//!
//! # Example
//!
//! ```
//! use helios_docdb::config::DocumentStoreConfig;
//!
//! let config = DocumentStoreConfig::from_key_values([
//!     ("host", "https://docs.example.net:443"),
//!     ("collection", "fhir"),
//!     ("retry.max_attempts", "5"),
//!     ("continuation_cache.ttl", "15m"),
//! ])
//! .unwrap();
//!
//! assert_eq!(config.retry.max_attempts, 5);
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult, ValidationError};

/// Endpoint used when no host is configured.
pub const LOCAL_EMULATOR_HOST: &str = "https://localhost:8081";

/// Consistency level requested from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Linearizable reads.
    Strong,
    /// Reads lag writes by a bounded amount.
    BoundedStaleness,
    /// Read-your-writes within a session.
    #[default]
    Session,
    /// No ordering guarantees.
    Eventual,
    /// Reads never see out-of-order writes.
    ConsistentPrefix,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyLevel::Strong => "Strong",
            ConsistencyLevel::BoundedStaleness => "BoundedStaleness",
            ConsistencyLevel::Session => "Session",
            ConsistencyLevel::Eventual => "Eventual",
            ConsistencyLevel::ConsistentPrefix => "ConsistentPrefix",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strong" => Ok(ConsistencyLevel::Strong),
            "boundedstaleness" => Ok(ConsistencyLevel::BoundedStaleness),
            "session" => Ok(ConsistencyLevel::Session),
            "eventual" => Ok(ConsistencyLevel::Eventual),
            "consistentprefix" => Ok(ConsistencyLevel::ConsistentPrefix),
            _ => Err(invalid(format!("unknown consistency level '{s}'"))),
        }
    }
}

/// Caller-side retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on the cumulative time spent waiting between attempts.
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,

    /// Base delay of the exponential curve.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_wait: default_max_wait(),
            base_delay: default_base_delay(),
        }
    }
}

/// Continuation token cache limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationCacheConfig {
    /// How long an issued cursor stays resolvable.
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum number of live cursors; the oldest are evicted first.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for ContinuationCacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// Settings for lock-gated collection upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Identifier of the lock that serializes upgrades.
    #[serde(default = "default_upgrade_lock_id")]
    pub lock_id: String,

    /// Lease requested for each upgrade run.
    #[serde(default = "default_upgrade_lease", with = "humantime_serde")]
    pub lease: Duration,

    /// How long to keep polling for the lock before giving up.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Pause between acquisition attempts.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            lock_id: default_upgrade_lock_id(),
            lease: default_upgrade_lease(),
            acquire_timeout: default_acquire_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Document store adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStoreConfig {
    /// Store endpoint.
    #[serde(default)]
    pub host: String,

    /// Account key. The MongoDB binding uses it as the password of the user
    /// named in `host`.
    #[serde(default)]
    pub key: String,

    /// Database name.
    #[serde(default = "default_database")]
    pub database: String,

    /// Collection holding resources, history and lock documents.
    #[serde(default = "default_collection")]
    pub collection: String,

    /// JSON path of the partition key in stored documents. The MongoDB
    /// binding keeps the partition key in this top-level field.
    #[serde(default = "default_partition_key_path")]
    pub partition_key_path: String,

    /// Consistency level; selects the store's read and write guarantees.
    #[serde(default)]
    pub consistency_level: ConsistencyLevel,

    /// Caller-side retry settings.
    #[serde(default)]
    pub retry: RetryOptions,

    /// Continuation token cache limits.
    #[serde(default)]
    pub continuation_cache: ContinuationCacheConfig,

    /// Collection upgrade settings.
    #[serde(default)]
    pub upgrade: UpgradeConfig,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            key: String::new(),
            database: default_database(),
            collection: default_collection(),
            partition_key_path: default_partition_key_path(),
            consistency_level: ConsistencyLevel::default(),
            retry: RetryOptions::default(),
            continuation_cache: ContinuationCacheConfig::default(),
            upgrade: UpgradeConfig::default(),
        }
    }
}

fn default_database() -> String {
    "health".to_string()
}

fn default_collection() -> String {
    "fhir".to_string()
}

fn default_partition_key_path() -> String {
    "/partitionKey".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_upgrade_lock_id() -> String {
    "collection-upgrade".to_string()
}

fn default_upgrade_lease() -> Duration {
    Duration::from_secs(60)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::Validation(ValidationError::InvalidConfiguration {
        message: message.into(),
    })
}

fn parse_duration(key: &str, value: &str) -> StoreResult<Duration> {
    humantime::parse_duration(value).map_err(|e| invalid(format!("{key}: {e}")))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> StoreResult<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| invalid(format!("{key}: {e}")))
}

impl DocumentStoreConfig {
    /// Binds plain key/value settings over the defaults.
    ///
    /// Keys are the field names, with nested sections separated by `.`.
    /// Unknown keys are rejected so that typos do not go unnoticed.
    pub fn from_key_values<I, K, V>(pairs: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in pairs {
            let key = key.as_ref().trim();
            let value = value.as_ref();
            match key {
                "host" => config.host = value.to_string(),
                "key" => config.key = value.to_string(),
                "database" => config.database = value.to_string(),
                "collection" => config.collection = value.to_string(),
                "partition_key_path" => config.partition_key_path = value.to_string(),
                "consistency_level" => config.consistency_level = value.parse()?,
                "retry.max_attempts" => config.retry.max_attempts = parse_number(key, value)?,
                "retry.max_wait" => config.retry.max_wait = parse_duration(key, value)?,
                "retry.base_delay" => config.retry.base_delay = parse_duration(key, value)?,
                "continuation_cache.ttl" => {
                    config.continuation_cache.ttl = parse_duration(key, value)?
                }
                "continuation_cache.max_entries" => {
                    config.continuation_cache.max_entries = parse_number(key, value)?
                }
                "upgrade.lock_id" => config.upgrade.lock_id = value.to_string(),
                "upgrade.lease" => config.upgrade.lease = parse_duration(key, value)?,
                "upgrade.acquire_timeout" => {
                    config.upgrade.acquire_timeout = parse_duration(key, value)?
                }
                "upgrade.poll_interval" => {
                    config.upgrade.poll_interval = parse_duration(key, value)?
                }
                other => return Err(invalid(format!("unknown configuration key '{other}'"))),
            }
        }

        Ok(config)
    }

    /// Returns the configured host, falling back to the local emulator.
    pub fn effective_host(&self) -> &str {
        if self.host.trim().is_empty() {
            LOCAL_EMULATOR_HOST
        } else {
            &self.host
        }
    }

    /// Validates configuration invariants.
    pub fn validate(&self) -> StoreResult<()> {
        if self.database.trim().is_empty() {
            return Err(invalid("database must not be empty"));
        }

        if self.collection.trim().is_empty() {
            return Err(invalid("collection must not be empty"));
        }

        if !self.partition_key_path.starts_with('/') || self.partition_key_path.len() < 2 {
            return Err(invalid("partition_key_path must be a path such as '/partitionKey'"));
        }

        let host = self.effective_host().to_ascii_lowercase();
        if !host.starts_with("http://")
            && !host.starts_with("https://")
            && !host.starts_with("mongodb://")
            && !host.starts_with("mongodb+srv://")
        {
            return Err(invalid(
                "host must start with http://, https://, mongodb:// or mongodb+srv://",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be > 0"));
        }

        if self.continuation_cache.max_entries == 0 {
            return Err(invalid("continuation_cache.max_entries must be > 0"));
        }

        if self.continuation_cache.ttl.is_zero() {
            return Err(invalid("continuation_cache.ttl must be > 0"));
        }

        if self.upgrade.lock_id.trim().is_empty() {
            return Err(invalid("upgrade.lock_id must not be empty"));
        }

        if self.upgrade.lease.is_zero() {
            return Err(invalid("upgrade.lease must be > 0"));
        }

        if self.upgrade.poll_interval.is_zero() {
            return Err(invalid("upgrade.poll_interval must be > 0"));
        }

        Ok(())
    }
}

/// Serde adapter storing [`Duration`] as a `humantime` string.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
