//! Cache configuration options

use crate::directive::{CacheDirective, Invalidation, Scope};
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the result cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Maximum number of entries held in memory
    pub max_entries: usize,
    /// Memory budget in bytes (approximate)
    pub max_memory_bytes: usize,
    /// Default time-to-live; zero disables expiry
    #[serde(rename = "default_ttl_millis", with = "duration_millis")]
    pub default_ttl: Duration,
    /// Scope used when the source does not supply a directive
    pub default_scope: Scope,
    /// Default memory preference
    pub prefer_memory: bool,
    /// Default read-ahead behavior
    pub read_all: bool,
    /// Default updatability
    pub updatable: bool,
    /// Default reaction to table modifications
    pub invalidation: Invalidation,
    /// How long a request waits for an identical in-flight execution
    #[serde(rename = "wait_timeout_millis", with = "duration_millis")]
    pub wait_timeout: Duration,
    /// Directory of the durable tier; `None` keeps everything in memory
    pub durable_dir: Option<PathBuf>,
    /// Byte budget of the durable tier
    pub max_durable_bytes: usize,
    /// Period of the background expiration sweep
    #[serde(rename = "sweep_interval_millis", with = "duration_millis")]
    pub sweep_interval: Duration,
    /// Per-source eligibility overrides (source name -> cacheable)
    pub source_overrides: HashMap<String, bool>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            max_memory_bytes: 100 * 1024 * 1024, // 100 MB
            default_ttl: Duration::from_secs(300), // 5 minutes
            default_scope: Scope::Vdb,
            prefer_memory: false,
            read_all: true,
            updatable: false,
            invalidation: Invalidation::Immediate,
            wait_timeout: Duration::from_secs(30),
            durable_dir: None,
            max_durable_bytes: 1024 * 1024 * 1024, // 1 GB
            sweep_interval: Duration::from_secs(60),
            source_overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration with custom settings
    pub fn new(max_entries: usize, max_memory_bytes: usize, ttl_secs: u64) -> Self {
        Self {
            max_entries,
            max_memory_bytes,
            default_ttl: Duration::from_secs(ttl_secs),
            ..Default::default()
        }
    }

    /// Create a disabled cache configuration
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> CacheResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse a configuration from JSON; absent fields take their defaults
    pub fn from_json(contents: &str) -> CacheResult<Self> {
        let config: CacheConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a JSON file
    pub fn save(&self, path: &Path) -> CacheResult<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the cache cannot operate with
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Config("max_entries must be positive".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(CacheError::Config(
                "sweep_interval_millis must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Directive applied when the source does not supply its own
    pub fn default_directive(&self) -> CacheDirective {
        CacheDirective::new(self.default_scope)
            .with_ttl(self.default_ttl)
            .with_prefer_memory(self.prefer_memory)
            .with_read_all(self.read_all)
            .with_updatable(self.updatable)
            .with_invalidation(self.invalidation)
    }

    /// Set the maximum number of entries
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the maximum memory usage
    pub fn with_max_memory(mut self, max_memory_bytes: usize) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }

    /// Set the default TTL duration
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Enable or disable the cache
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_default_scope(mut self, scope: Scope) -> Self {
        self.default_scope = scope;
        self
    }

    pub fn with_prefer_memory(mut self, prefer_memory: bool) -> Self {
        self.prefer_memory = prefer_memory;
        self
    }

    pub fn with_read_all(mut self, read_all: bool) -> Self {
        self.read_all = read_all;
        self
    }

    pub fn with_updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }

    pub fn with_invalidation(mut self, invalidation: Invalidation) -> Self {
        self.invalidation = invalidation;
        self
    }

    /// Set how long followers wait for an in-flight execution
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Enable the durable tier in the given directory
    pub fn with_durable_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.durable_dir = Some(dir.into());
        self
    }

    pub fn with_max_durable_bytes(mut self, max_durable_bytes: usize) -> Self {
        self.max_durable_bytes = max_durable_bytes;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Force a source to be cacheable (`true`) or never cached (`false`)
    pub fn with_source_override(mut self, source: impl Into<String>, cacheable: bool) -> Self {
        self.source_overrides.insert(source.into(), cacheable);
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
