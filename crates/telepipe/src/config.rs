//! Configuration management for telepipe.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::crypto::{HandoffConfig, KeyMaterial};
use crate::error::{Error, Result};
use crate::privacy::ScrubConfig;
use crate::transport::DispatcherConfig;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "telepipe";

/// Default dead-letter database file name.
const DEAD_LETTER_FILE_NAME: &str = "dead_letters.db";

/// Environment variable prefix.
const ENV_PREFIX: &str = "TELEPIPE_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `TELEPIPE_`, sections split on `__`)
/// 2. TOML config file at `~/.config/telepipe/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Batching configuration.
    pub collector: CollectorSettings,
    /// Encryption handoff configuration.
    pub handoff: HandoffSettings,
    /// Outbound transport configuration.
    pub transport: TransportSettings,
    /// Session key material.
    pub keys: KeySettings,
    /// Metric cache configuration.
    pub cache: CacheSettings,
    /// HTTP server configuration.
    pub server: ServerSettings,
    /// Privacy configuration.
    pub privacy: PrivacySettings,
    /// Dead-letter storage configuration.
    pub storage: StorageSettings,
}

/// Batching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Interval between timer-driven flushes in milliseconds.
    pub flush_interval_ms: u64,
    /// Events per buffer that trigger an immediate flush.
    pub max_batch_size: usize,
}

/// Encryption handoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffSettings {
    /// Records held while key material is absent.
    pub pending_capacity: usize,
    /// How long a record may wait for key material, in milliseconds.
    pub key_wait_timeout_ms: u64,
}

/// Outbound transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Ingestion endpoint URL.
    pub endpoint: String,
    /// Failed attempts before a record is discarded.
    pub max_retries: u32,
    /// Concurrent sends.
    pub max_in_flight: usize,
    /// Per-attempt timeout in milliseconds.
    pub send_timeout_ms: u64,
    /// Base retry delay in milliseconds, multiplied by the retry count.
    pub retry_backoff_ms: u64,
}

/// Session key material, base64 encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    /// AES key (16 or 32 bytes once decoded).
    pub key: Option<String>,
    /// CBC initialization vector (16 bytes once decoded).
    pub iv: Option<String>,
}

/// Metric cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Prefix of every cache key.
    pub namespace: String,
    /// Width of one time bucket in minutes.
    pub window_minutes: u32,
    /// Entry lifetime after its last update, in seconds.
    pub ttl_secs: u64,
    /// Samples kept per entry.
    pub max_points: usize,
    /// Interval between expiry sweeps, in seconds.
    pub sweep_interval_secs: u64,
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address to listen on.
    pub bind: String,
}

/// Privacy-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacySettings {
    /// Enable payload scrubbing.
    pub enabled: bool,
    /// Additional patterns to redact (regex).
    pub custom_patterns: Vec<String>,
}

/// Dead-letter storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Path to the dead-letter database.
    /// Defaults to `~/.local/share/telepipe/dead_letters.db`
    pub dead_letter_path: Option<PathBuf>,
    /// Maximum age of dead letters to retain in days.
    /// Set to 0 for unlimited.
    pub max_age_days: u32,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5000,
            max_batch_size: 20,
        }
    }
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            pending_capacity: 256,
            key_wait_timeout_ms: 10_000,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/api/telemetry/ingest".to_string(),
            max_retries: 3,
            max_in_flight: 4,
            send_timeout_ms: 5000,
            retry_backoff_ms: 250,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: "telemetry".to_string(),
            window_minutes: 1,
            ttl_secs: 3600,
            max_points: 1000,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            custom_patterns: Vec::new(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            dead_letter_path: None, // Will be resolved to default at runtime
            max_age_days: 7,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `TELEPIPE_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate batching and handoff limits
        if self.collector.max_batch_size == 0 {
            return Err(Error::config("max_batch_size must be greater than 0"));
        }
        if self.collector.flush_interval_ms == 0 {
            return Err(Error::config("flush_interval_ms must be greater than 0"));
        }
        if self.handoff.pending_capacity == 0 {
            return Err(Error::config("pending_capacity must be greater than 0"));
        }

        // Validate transport config
        if self.transport.max_in_flight == 0 {
            return Err(Error::config("max_in_flight must be greater than 0"));
        }
        if self.transport.send_timeout_ms == 0 {
            return Err(Error::config("send_timeout_ms must be greater than 0"));
        }

        // Validate cache config
        if self.cache.window_minutes == 0 {
            return Err(Error::config("window_minutes must be greater than 0"));
        }
        if self.cache.max_points == 0 {
            return Err(Error::config("max_points must be greater than 0"));
        }
        if self.cache.namespace.is_empty() || self.cache.namespace.contains(':') {
            return Err(Error::config(format!(
                "cache namespace must be non-empty and contain no ':', got {:?}",
                self.cache.namespace
            )));
        }

        // Endpoint must be an absolute http(s) URL
        match reqwest::Url::parse(&self.transport.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(Error::config(format!(
                    "endpoint must use http or https, got {}",
                    url.scheme()
                )))
            }
            Err(e) => {
                return Err(Error::config(format!(
                    "invalid endpoint {}: {e}",
                    self.transport.endpoint
                )))
            }
        }

        // Validate server config
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(Error::config(format!(
                "invalid bind address: {}",
                self.server.bind
            )));
        }

        // Key and IV must decode to valid lengths
        self.key_material()?;

        // Validate regex patterns
        for pattern in &self.privacy.custom_patterns {
            if regex::Regex::new(pattern).is_err() {
                return Err(Error::config(format!("invalid regex pattern: {pattern}")));
            }
        }

        Ok(())
    }

    /// Decode the configured key material.
    ///
    /// Returns `Ok(None)` when neither key nor IV is set.
    ///
    /// # Errors
    ///
    /// Returns an error if only one of the two is set, or if either fails to
    /// decode to a valid length.
    pub fn key_material(&self) -> Result<Option<KeyMaterial>> {
        match (&self.keys.key, &self.keys.iv) {
            (None, None) => Ok(None),
            (Some(key), Some(iv)) => KeyMaterial::from_base64(key, iv).map(Some),
            _ => Err(Error::config("keys.key and keys.iv must be set together")),
        }
    }

    /// Get the dead-letter database path, resolving defaults if not set.
    #[must_use]
    pub fn dead_letter_path(&self) -> PathBuf {
        self.storage
            .dead_letter_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DEAD_LETTER_FILE_NAME))
    }

    /// Get the dead-letter max age, or `None` for unlimited.
    #[must_use]
    pub fn max_age(&self) -> Option<chrono::Duration> {
        if self.storage.max_age_days == 0 {
            None
        } else {
            Some(chrono::Duration::days(i64::from(self.storage.max_age_days)))
        }
    }

    /// Get the flush interval as a Duration.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.collector.flush_interval_ms)
    }

    /// Get the cache sweep interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs.max(1))
    }

    /// Parse the server bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is malformed.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address {}: {e}", self.server.bind)))
    }

    /// Settings for the encryption worker.
    #[must_use]
    pub fn handoff_config(&self) -> HandoffConfig {
        HandoffConfig {
            pending_capacity: self.handoff.pending_capacity,
            key_wait_timeout: Duration::from_millis(self.handoff.key_wait_timeout_ms),
        }
    }

    /// Settings for the transport dispatcher.
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_retries: self.transport.max_retries,
            max_in_flight: self.transport.max_in_flight,
            send_timeout: Duration::from_millis(self.transport.send_timeout_ms),
            retry_backoff: Duration::from_millis(self.transport.retry_backoff_ms),
        }
    }

    /// Settings for the metric cache.
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            namespace: self.cache.namespace.clone(),
            window: chrono::Duration::minutes(i64::from(self.cache.window_minutes)),
            ttl: Duration::from_secs(self.cache.ttl_secs),
            max_points: self.cache.max_points,
        }
    }

    /// Settings for the payload scrubber.
    #[must_use]
    pub fn scrub_config(&self) -> ScrubConfig {
        ScrubConfig {
            enabled: self.privacy.enabled,
            custom_patterns: self.privacy.custom_patterns.clone(),
            ..ScrubConfig::default()
        }
    }

    /// Serialize the configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.collector.flush_interval_ms, 5000);
        assert_eq!(config.collector.max_batch_size, 20);
        assert_eq!(config.handoff.pending_capacity, 256);
        assert_eq!(config.handoff.key_wait_timeout_ms, 10_000);
        assert_eq!(config.transport.max_retries, 3);
        assert_eq!(config.transport.max_in_flight, 4);
        assert_eq!(config.cache.namespace, "telemetry");
        assert_eq!(config.cache.window_minutes, 1);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(config.privacy.enabled);
        assert!(config.keys.key.is_none());
        assert_eq!(config.storage.max_age_days, 7);
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let mut config = Config::default();
        config.collector.max_batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_validate_zero_flush_interval() {
        let mut config = Config::default();
        config.collector.flush_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_in_flight() {
        let mut config = Config::default();
        config.transport.max_in_flight = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_in_flight"));
    }

    #[test]
    fn test_validate_zero_window() {
        let mut config = Config::default();
        config.cache.window_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_namespace_with_separator() {
        let mut config = Config::default();
        config.cache.namespace = "a:b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_endpoint_scheme() {
        let mut config = Config::default();
        config.transport.endpoint = "ftp://example.com/ingest".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("http or https"));

        config.transport.endpoint = "not a url".to_string();
        assert!(config.validate().is_err());

        config.transport.endpoint = "https://telemetry.example.com/api/telemetry/ingest".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bind_address() {
        let mut config = Config::default();
        config.server.bind = "localhost".to_string();
        assert!(config.validate().is_err());
        assert!(config.bind_addr().is_err());

        config.server.bind = "0.0.0.0:9000".to_string();
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_validate_invalid_regex() {
        let mut config = Config::default();
        config.privacy.custom_patterns = vec!["[invalid".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid regex pattern"));
    }

    #[test]
    fn test_key_material_absent() {
        assert!(Config::default().key_material().unwrap().is_none());
    }

    #[test]
    fn test_key_material_roundtrip() {
        let material = KeyMaterial::generate(false).unwrap();
        let mut config = Config::default();
        config.keys.key = Some(material.key_base64());
        config.keys.iv = Some(material.iv_base64());

        assert!(config.validate().is_ok());
        assert_eq!(config.key_material().unwrap(), Some(material));
    }

    #[test]
    fn test_key_material_requires_both() {
        let mut config = Config::default();
        config.keys.key = Some(KeyMaterial::generate(false).unwrap().key_base64());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("set together"));
    }

    #[test]
    fn test_key_material_bad_length() {
        let mut config = Config::default();
        config.keys.key = Some("AAAA".to_string());
        config.keys.iv = Some("AAAA".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dead_letter_path_default() {
        let config = Config::default();
        let path = config.dead_letter_path();
        assert!(path.ends_with("telepipe/dead_letters.db"));
    }

    #[test]
    fn test_dead_letter_path_custom() {
        let mut config = Config::default();
        config.storage.dead_letter_path = Some(PathBuf::from("/tmp/dl.db"));
        assert_eq!(config.dead_letter_path(), PathBuf::from("/tmp/dl.db"));
    }

    #[test]
    fn test_max_age() {
        let mut config = Config::default();
        assert_eq!(config.max_age(), Some(chrono::Duration::days(7)));
        config.storage.max_age_days = 0;
        assert_eq!(config.max_age(), None);
    }

    #[test]
    fn test_component_configs() {
        let config = Config::default();

        let handoff = config.handoff_config();
        assert_eq!(handoff.pending_capacity, 256);
        assert_eq!(handoff.key_wait_timeout, Duration::from_secs(10));

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.max_retries, 3);
        assert_eq!(dispatcher.send_timeout, Duration::from_secs(5));
        assert_eq!(dispatcher.retry_backoff, Duration::from_millis(250));

        let cache = config.cache_config();
        assert_eq!(cache.window, chrono::Duration::minutes(1));
        assert_eq!(cache.ttl, Duration::from_secs(3600));
        assert_eq!(cache.max_points, 1000);

        let scrub = config.scrub_config();
        assert!(scrub.enabled);
        assert!(scrub.custom_patterns.is_empty());

        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_nonexistent_file_uses_defaults() {
        let config = Config::load_from(Some(PathBuf::from("/nonexistent/telepipe.toml"))).unwrap();
        assert_eq!(config.collector.max_batch_size, 20);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[collector]
max_batch_size = 50

[cache]
namespace = "web"
ttl_secs = 120

[privacy]
custom_patterns = ["secret-\\d+"]
"#
        )
        .unwrap();

        let config = Config::load_from(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.collector.max_batch_size, 50);
        assert_eq!(config.collector.flush_interval_ms, 5000);
        assert_eq!(config.cache.namespace, "web");
        assert_eq!(config.cache.ttl_secs, 120);
        assert_eq!(config.privacy.custom_patterns, vec!["secret-\\d+".to_string()]);
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[collector]\nmax_batch_size = 0").unwrap();
        assert!(Config::load_from(Some(file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_load_keys_section_from_file() {
        let material = KeyMaterial::generate(false).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[keys]\nkey = \"{}\"\niv = \"{}\"\n\n[transport]\nmax_in_flight = 2",
            material.key_base64(),
            material.iv_base64()
        )
        .unwrap();

        let config = Config::load_from(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.transport.max_in_flight, 2);
        assert_eq!(config.key_material().unwrap(), Some(material));
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[collector]"));
        assert!(rendered.contains("max_batch_size = 20"));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_default_paths() {
        assert!(Config::default_config_path().ends_with("telepipe/config.toml"));
        assert!(Config::default_data_dir().ends_with("telepipe"));
    }
}
