//! Configuration management for TallyVault
//!
//! Defaults, TOML files and environment overrides, all validated before use.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_crdt::ConflictPolicy;
use crate::core_crypto::{Algorithm, BatchLimitConfig};
use crate::core_keys::master_key::MIN_MEMORY_KIB;
use crate::core_store::model::FieldType;
use crate::core_store::store::StoreLimits;

/// Seven years, the shortest audit retention accepted
pub const MIN_AUDIT_RETENTION: Duration = crate::core_audit::MIN_RETENTION;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local store configuration
    pub store: StoreConfig,

    /// Key derivation and rotation
    pub keys: KeyConfig,

    /// Field encryption
    pub crypto: CryptoConfig,

    /// Relay exchange
    pub sync: SyncConfig,

    /// Conflict policy
    pub conflicts: ConflictConfig,

    /// Audit trail
    pub audit: AuditConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Data directory for persistent storage
    pub data_dir: PathBuf,

    /// SQLite file name inside `data_dir`
    pub database_file: String,

    /// SQLite connection pool size
    pub pool_size: u32,

    /// Page size when a request does not name one
    pub default_page_size: usize,

    /// Upper bound for any page
    pub max_page_size: usize,

    pub max_entities_per_company: u64,

    /// Largest encoded field value in bytes
    pub max_field_bytes: usize,
}

/// Key derivation and rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Argon2id memory cost in KiB
    pub kdf_memory_kib: u32,

    /// Argon2id passes
    pub kdf_iterations: u32,

    /// Argon2id lanes
    pub kdf_parallelism: u32,

    /// Accept memory costs below the production floor (tests only)
    pub allow_insecure_kdf: bool,

    /// How long a retired key stays decryptable
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Entities read per page while rotating
    pub rotation_page_size: usize,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// AEAD used for new ciphertext
    pub algorithm: Algorithm,

    /// Sustained bulk re-encryption rate
    pub batch_fields_per_second: u32,

    /// Bulk re-encryption burst
    pub batch_burst: u32,
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Bound on a single push or pull
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// First retry delay
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Largest retry delay
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Attempts per exchange, including the first
    pub max_attempts: u32,

    /// Operations per push envelope batch
    pub batch_size: usize,

    /// Pause between background exchanges
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Remote timestamps further ahead than this are rejected
    #[serde(with = "humantime_serde")]
    pub max_clock_drift: Duration,
}

/// Conflict policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Field types settled by last-writer-wins instead of a conflict record
    pub last_writer_wins: Vec<FieldType>,
}

/// Audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Minimum retention of every entry
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,

    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let limits = StoreLimits::default();
        Self {
            data_dir: PathBuf::from("./data"),
            database_file: "vault.db".to_string(),
            pool_size: 4,
            default_page_size: limits.default_page_size,
            max_page_size: limits.max_page_size,
            max_entities_per_company: limits.max_entities_per_company,
            max_field_bytes: 64 * 1024,
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            kdf_memory_kib: 64 * 1024,
            kdf_iterations: 3,
            kdf_parallelism: 1,
            allow_insecure_kdf: false,
            grace_period: Duration::from_secs(30 * 24 * 60 * 60),
            rotation_page_size: 100,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        let batch = BatchLimitConfig::default();
        Self {
            algorithm: Algorithm::default(),
            batch_fields_per_second: batch.fields_per_second,
            batch_burst: batch.burst,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            max_attempts: 5,
            batch_size: 200,
            interval: Duration::from_secs(15),
            max_clock_drift: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention: MIN_AUDIT_RETENTION,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
            log_file: None,
        }
    }
}

impl StoreConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn limits(&self) -> StoreLimits {
        StoreLimits {
            max_page_size: self.max_page_size,
            default_page_size: self.default_page_size,
            max_entities_per_company: self.max_entities_per_company,
        }
    }
}

impl CryptoConfig {
    pub fn batch_limits(&self) -> BatchLimitConfig {
        BatchLimitConfig {
            fields_per_second: self.batch_fields_per_second,
            burst: self.batch_burst,
        }
    }
}

impl ConflictConfig {
    pub fn policy(&self) -> Result<ConflictPolicy, ConfigError> {
        ConflictPolicy::with_last_writer_wins(&self.last_writer_wins)
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

fn env_duration(name: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: TALLYVAULT_<SECTION>_<KEY>
    /// Example: TALLYVAULT_SYNC_TIMEOUT=10s
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables onto this configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Store config
        if let Ok(data_dir) = env::var("TALLYVAULT_STORE_DATA_DIR") {
            self.store.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(file) = env::var("TALLYVAULT_STORE_DATABASE_FILE") {
            self.store.database_file = file;
        }
        if let Some(v) = env_value("TALLYVAULT_STORE_POOL_SIZE")? {
            self.store.pool_size = v;
        }
        if let Some(v) = env_value("TALLYVAULT_STORE_MAX_PAGE_SIZE")? {
            self.store.max_page_size = v;
        }
        if let Some(v) = env_value("TALLYVAULT_STORE_MAX_ENTITIES_PER_COMPANY")? {
            self.store.max_entities_per_company = v;
        }
        if let Some(v) = env_value("TALLYVAULT_STORE_MAX_FIELD_BYTES")? {
            self.store.max_field_bytes = v;
        }

        // Key config
        if let Some(v) = env_value("TALLYVAULT_KEYS_KDF_MEMORY_KIB")? {
            self.keys.kdf_memory_kib = v;
        }
        if let Some(v) = env_value("TALLYVAULT_KEYS_KDF_ITERATIONS")? {
            self.keys.kdf_iterations = v;
        }
        if let Some(v) = env_duration("TALLYVAULT_KEYS_GRACE_PERIOD")? {
            self.keys.grace_period = v;
        }

        // Crypto config
        if let Some(v) = env_value("TALLYVAULT_CRYPTO_BATCH_FIELDS_PER_SECOND")? {
            self.crypto.batch_fields_per_second = v;
        }

        // Sync config
        if let Some(v) = env_duration("TALLYVAULT_SYNC_TIMEOUT")? {
            self.sync.timeout = v;
        }
        if let Some(v) = env_value("TALLYVAULT_SYNC_MAX_ATTEMPTS")? {
            self.sync.max_attempts = v;
        }
        if let Some(v) = env_duration("TALLYVAULT_SYNC_INTERVAL")? {
            self.sync.interval = v;
        }

        // Audit config
        if let Some(v) = env_duration("TALLYVAULT_AUDIT_RETENTION")? {
            self.audit.retention = v;
        }

        // Logging config
        if let Ok(level) = env::var("TALLYVAULT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = env_value("TALLYVAULT_LOG_JSON")? {
            self.logging.json_format = v;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate store config
        if self.store.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        if self.store.max_page_size == 0 || self.store.default_page_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "page sizes must be greater than 0".to_string(),
            ));
        }
        if self.store.default_page_size > self.store.max_page_size {
            return Err(ConfigError::ValidationFailed(
                "default_page_size exceeds max_page_size".to_string(),
            ));
        }
        if self.store.max_field_bytes == 0 || self.store.max_entities_per_company == 0 {
            return Err(ConfigError::ValidationFailed(
                "store quotas must be greater than 0".to_string(),
            ));
        }

        // Validate key config
        if self.keys.kdf_memory_kib < MIN_MEMORY_KIB && !self.keys.allow_insecure_kdf {
            return Err(ConfigError::ValidationFailed(format!(
                "kdf_memory_kib must be at least {}",
                MIN_MEMORY_KIB
            )));
        }
        if self.keys.kdf_iterations == 0 || self.keys.kdf_parallelism == 0 {
            return Err(ConfigError::ValidationFailed(
                "kdf_iterations and kdf_parallelism must be greater than 0".to_string(),
            ));
        }
        if self.keys.grace_period.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "grace_period must be greater than 0".to_string(),
            ));
        }
        if self.keys.rotation_page_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "rotation_page_size must be greater than 0".to_string(),
            ));
        }

        // Validate crypto config
        if self.crypto.batch_fields_per_second == 0 || self.crypto.batch_burst == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch limits must be greater than 0".to_string(),
            ));
        }

        // Validate sync config
        if self.sync.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sync timeout must be greater than 0".to_string(),
            ));
        }
        if self.sync.backoff_base > self.sync.backoff_max {
            return Err(ConfigError::ValidationFailed(
                "backoff_base exceeds backoff_max".to_string(),
            ));
        }
        if self.sync.max_attempts == 0 || self.sync.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts and batch_size must be greater than 0".to_string(),
            ));
        }

        // Validate conflict policy
        self.conflicts.policy()?;

        // Validate audit config
        if self.audit.retention < MIN_AUDIT_RETENTION {
            return Err(ConfigError::ValidationFailed(
                "audit retention must be at least seven years".to_string(),
            ));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
