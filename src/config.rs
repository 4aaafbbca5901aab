//! Configuration loading.
//!
//! Settings and secrets live in two TOML files that share one layout; the
//! secrets file is merged over the settings file before parsing, so any key
//! may be placed in either.
//!
//! ```toml
//! # settings.toml
//! [feed]
//! url = "https://api.wmata.com/gtfs/rail-gtfsrt-vehiclepositions.pb"
//!
//! [elasticsearch]
//! index = "vehicle-positions"
//!
//! [scheduler]
//! interval = "10s"
//!
//! # secrets.toml
//! [feed]
//! api_key = "..."
//!
//! [elasticsearch]
//! url = "https://localhost:9200"
//! username = "elastic"
//! password = "..."
//! ```

use crate::client::FeedClientConfig;
use crate::dedup::{Deduplicator, SeenStoreError};
use crate::indexer::{Credentials, ElasticsearchConfig, RetryPolicy};
use crate::scheduler::{DeliveryMode, SchedulerConfig};
use crate::storage::JournalSeenStore;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the settings file.
pub const SETTINGS_FILE_ENV: &str = "CONFIG_SETTINGS_FILE";
/// Environment variable naming the secrets file.
pub const SECRETS_FILE_ENV: &str = "CONFIG_SECRETS_FILE";
pub const DEFAULT_SETTINGS_FILE: &str = "config/settings.toml";
pub const DEFAULT_SECRETS_FILE: &str = "config/secrets.toml";

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("[{section}] is missing required field '{field}'")]
    MissingField {
        section: &'static str,
        field: &'static str,
    },

    #[error("[{section}] has invalid {field}: {message}")]
    InvalidValue {
        section: &'static str,
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn missing(section: &'static str, field: &'static str) -> Self {
        Self::MissingField { section, field }
    }

    fn invalid(section: &'static str, field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            section,
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    feed: RawFeed,
    elasticsearch: RawElasticsearch,
    scheduler: RawScheduler,
    dedup: DedupConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawFeed {
    url: Option<String>,
    api_key: Option<String>,
    api_key_header: String,
    #[serde(with = "humantime_serde")]
    timeout: Duration,
}

impl Default for RawFeed {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            api_key_header: "api_key".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawElasticsearch {
    url: Option<String>,
    index: Option<String>,
    username: Option<String>,
    password: Option<String>,
    api_key: Option<String>,
    #[serde(with = "humantime_serde")]
    timeout: Duration,
    bulk_chunk_size: usize,
    max_attempts: u32,
    #[serde(with = "humantime_serde")]
    initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    max_backoff: Duration,
}

impl Default for RawElasticsearch {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            url: None,
            index: None,
            username: None,
            password: None,
            api_key: None,
            timeout: Duration::from_secs(30),
            bulk_chunk_size: 500,
            max_attempts: retry.max_attempts,
            initial_backoff: retry.initial_backoff,
            max_backoff: retry.max_backoff,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawScheduler {
    #[serde(with = "humantime_serde")]
    interval: Duration,
    #[serde(with = "humantime_serde")]
    max_interval: Option<Duration>,
    delivery_mode: DeliveryMode,
}

impl Default for RawScheduler {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            interval: defaults.interval,
            max_interval: defaults.max_interval,
            delivery_mode: defaults.delivery_mode,
        }
    }
}

/// Seen-set settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Forget fingerprints not observed for this long
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// Persist fingerprints in a journal at this path
    pub journal_path: Option<PathBuf>,
}

impl DedupConfig {
    /// Build the deduplicator, opening the journal if one is configured.
    pub fn open(&self) -> std::result::Result<Deduplicator, SeenStoreError> {
        let dedup = match &self.journal_path {
            Some(path) => Deduplicator::new(Box::new(JournalSeenStore::open(path)?)),
            None => Deduplicator::in_memory(),
        };
        Ok(match self.ttl {
            Some(ttl) => dedup.with_ttl(ttl),
            None => dedup,
        })
    }
}

/// Validated service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub feed: FeedClientConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub scheduler: SchedulerConfig,
    pub dedup: DedupConfig,
}

impl Config {
    /// Load and validate the settings file with the secrets file merged over it.
    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(settings: P, secrets: Q) -> Result<Self> {
        let mut table = read_table(settings.as_ref())?;
        merge_tables(&mut table, read_table(secrets.as_ref())?);
        Self::from_table(table)
    }

    /// Parse and validate a single TOML document.
    pub fn parse(s: &str) -> Result<Self> {
        Self::from_table(toml::from_str(s)?)
    }

    fn from_table(table: toml::Table) -> Result<Self> {
        let raw: RawConfig = toml::Value::Table(table).try_into()?;
        raw.validate()
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(toml::from_str(&contents)?)
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn required(value: Option<String>, section: &'static str, field: &'static str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::missing(section, field)),
    }
}

fn http_url(value: String, section: &'static str) -> Result<String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(value)
    } else {
        Err(ConfigError::invalid(
            section,
            "url",
            format!("'{value}' is not an http(s) URL"),
        ))
    }
}

impl RawConfig {
    fn validate(self) -> Result<Config> {
        let feed = self.feed.validate()?;
        let elasticsearch = self.elasticsearch.validate()?;
        let scheduler = self.scheduler.validate()?;

        if self.dedup.ttl.is_some_and(|ttl| ttl < Duration::from_secs(1)) {
            return Err(ConfigError::invalid("dedup", "ttl", "must be at least 1s"));
        }

        Ok(Config {
            feed,
            elasticsearch,
            scheduler,
            dedup: self.dedup,
        })
    }
}

impl RawFeed {
    fn validate(self) -> Result<FeedClientConfig> {
        let url = http_url(required(self.url, "feed", "url")?, "feed")?;
        let api_key = required(self.api_key, "feed", "api_key")?;
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("feed", "timeout", "must be positive"));
        }

        Ok(FeedClientConfig::new(url, api_key)
            .with_api_key_header(self.api_key_header)
            .with_timeout(self.timeout))
    }
}

impl RawElasticsearch {
    fn validate(self) -> Result<ElasticsearchConfig> {
        const SECTION: &str = "elasticsearch";

        let url = http_url(required(self.url, SECTION, "url")?, SECTION)?;
        let index = required(self.index, SECTION, "index")?;

        let credentials = match (self.api_key, self.username, self.password) {
            (Some(key), _, _) => Credentials::ApiKey(required(Some(key), SECTION, "api_key")?),
            (None, Some(username), password) => Credentials::Basic {
                username: required(Some(username), SECTION, "username")?,
                password: required(password, SECTION, "password")?,
            },
            (None, None, _) => return Err(ConfigError::missing(SECTION, "username")),
        };

        if self.bulk_chunk_size == 0 {
            return Err(ConfigError::invalid(SECTION, "bulk_chunk_size", "must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(SECTION, "max_attempts", "must be at least 1"));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                SECTION,
                "initial_backoff",
                "must not exceed max_backoff",
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid(SECTION, "timeout", "must be positive"));
        }

        Ok(ElasticsearchConfig::new(url, index)
            .with_credentials(credentials)
            .with_timeout(self.timeout)
            .with_chunk_size(self.bulk_chunk_size)
            .with_retry(RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: self.initial_backoff,
                max_backoff: self.max_backoff,
            }))
    }
}

impl RawScheduler {
    fn validate(self) -> Result<SchedulerConfig> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("scheduler", "interval", "must be positive"));
        }
        if let Some(max) = self.max_interval {
            if max < self.interval {
                return Err(ConfigError::invalid(
                    "scheduler",
                    "max_interval",
                    "must not be shorter than interval",
                ));
            }
        }

        Ok(SchedulerConfig {
            interval: self.interval,
            max_interval: self.max_interval,
            delivery_mode: self.delivery_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
[feed]
url = "https://api.example.test/vehicle-positions.pb"
api_key = "feed-key"

[elasticsearch]
url = "http://localhost:9200"
index = "vehicle-positions"
username = "elastic"
password = "changeme"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();

        assert_eq!(config.feed.api_key_header, "api_key");
        assert_eq!(config.feed.timeout, Duration::from_secs(30));
        assert_eq!(config.elasticsearch.index, "vehicle-positions");
        assert_eq!(config.elasticsearch.chunk_size, 500);
        assert_eq!(config.elasticsearch.retry, RetryPolicy::default());
        assert!(matches!(
            config.elasticsearch.credentials,
            Credentials::Basic { ref username, .. } if username == "elastic"
        ));
        assert_eq!(config.scheduler.interval, Duration::from_secs(10));
        assert_eq!(config.scheduler.max_interval, None);
        assert_eq!(config.scheduler.delivery_mode, DeliveryMode::AtMostOnce);
        assert!(config.dedup.ttl.is_none());
        assert!(config.dedup.journal_path.is_none());
    }

    #[test]
    fn test_full_config() {
        let toml = format!(
            r#"{MINIMAL}
[scheduler]
interval = "15s"
max_interval = "5m"
delivery_mode = "at_least_once"

[dedup]
ttl = "6h"
journal_path = "data/seen.journal"
"#
        );
        let config = Config::parse(&toml).unwrap();

        assert_eq!(config.scheduler.interval, Duration::from_secs(15));
        assert_eq!(config.scheduler.max_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.scheduler.delivery_mode, DeliveryMode::AtLeastOnce);
        assert_eq!(config.dedup.ttl, Some(Duration::from_secs(6 * 3600)));
        assert_eq!(
            config.dedup.journal_path.as_deref(),
            Some(Path::new("data/seen.journal"))
        );
    }

    #[test]
    fn test_missing_api_key() {
        let toml = MINIMAL.replace("api_key = \"feed-key\"", "");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::MissingField {
                section: "feed",
                field: "api_key"
            })
        ));
    }

    #[test]
    fn test_missing_credentials() {
        let toml = MINIMAL
            .replace("username = \"elastic\"", "")
            .replace("password = \"changeme\"", "");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::MissingField {
                section: "elasticsearch",
                ..
            })
        ));

        let toml = MINIMAL.replace("password = \"changeme\"", "");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::MissingField {
                field: "password",
                ..
            })
        ));
    }

    #[test]
    fn test_api_key_credentials() {
        let toml = MINIMAL
            .replace("username = \"elastic\"", "api_key = \"ZWxhc3RpYw==\"")
            .replace("password = \"changeme\"", "");
        let config = Config::parse(&toml).unwrap();
        assert!(matches!(
            config.elasticsearch.credentials,
            Credentials::ApiKey(ref key) if key == "ZWxhc3RpYw=="
        ));
    }

    #[test]
    fn test_invalid_values() {
        let toml = MINIMAL.replace("http://localhost:9200", "localhost:9200");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::InvalidValue { field: "url", .. })
        ));

        let toml = format!("{MINIMAL}\n[scheduler]\ninterval = \"0s\"\n");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::InvalidValue {
                field: "interval",
                ..
            })
        ));

        let toml = format!("{MINIMAL}\n[scheduler]\ninterval = \"1m\"\nmax_interval = \"30s\"\n");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::InvalidValue {
                field: "max_interval",
                ..
            })
        ));

        let toml = format!("{MINIMAL}\n[scheduler]\ndelivery_mode = \"exactly_once\"\n");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_secrets_merge_over_settings() {
        let dir = tempdir().unwrap();
        let settings = dir.path().join("settings.toml");
        let secrets = dir.path().join("secrets.toml");

        fs::write(
            &settings,
            r#"
[feed]
url = "https://api.example.test/vehicle-positions.pb"
timeout = "10s"

[elasticsearch]
url = "http://placeholder:9200"
index = "vehicle-positions"
bulk_chunk_size = 100
"#,
        )
        .unwrap();
        fs::write(
            &secrets,
            r#"
[feed]
api_key = "secret-key"

[elasticsearch]
url = "https://es.internal:9200"
username = "ingest"
password = "hunter2"
"#,
        )
        .unwrap();

        let config = Config::from_files(&settings, &secrets).unwrap();
        assert_eq!(config.feed.api_key, "secret-key");
        assert_eq!(config.feed.timeout, Duration::from_secs(10));
        assert_eq!(config.elasticsearch.url, "https://es.internal:9200");
        assert_eq!(config.elasticsearch.chunk_size, 100);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = Config::from_files(&missing, &missing).unwrap_err();
        assert!(matches!(err, ConfigError::IoError { .. }));
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn test_dedup_open_with_journal() {
        let dir = tempdir().unwrap();
        let config = DedupConfig {
            ttl: Some(Duration::from_secs(3600)),
            journal_path: Some(dir.path().join("seen.journal")),
        };
        let dedup = config.open().unwrap();
        assert_eq!(dedup.ttl(), Some(Duration::from_secs(3600)));
        assert!(dir.path().join("seen.journal").exists());
    }
}
