//! Pipeline configuration
//!
//! Everything a run needs is read once into [`PipelineConfig`] and handed to
//! the components at construction; nothing below the binary reads the
//! environment.

use pokedex_common::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::SinkSchema;

// ============================================================================
// Defaults
// ============================================================================

/// Default catalog endpoint.
pub const DEFAULT_SOURCE_BASE_URL: &str = "https://pokeapi.co/api/v2/pokemon";

/// Default number of catalog entries to ingest (the first-generation 151).
pub const DEFAULT_CATALOG_LIMIT: u32 = 151;

/// Default staging directory.
pub const DEFAULT_STAGING_PATH: &str = "./data/raw";

/// Default number of concurrent detail requests.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;

/// Default pause between two fetches of the same worker, in milliseconds.
pub const DEFAULT_FETCH_THROTTLE_MS: u64 = 200;

/// Default number of retries after the first attempt.
pub const DEFAULT_FETCH_MAX_RETRIES: u32 = 3;

/// Default base backoff before the first retry, in milliseconds.
pub const DEFAULT_FETCH_RETRY_BACKOFF_MS: u64 = 500;

/// Default per-request timeout in seconds.
pub const DEFAULT_FETCH_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_SINK_HOST: &str = "localhost";
pub const DEFAULT_SINK_PORT: u16 = 5432;
pub const DEFAULT_SINK_DATABASE: &str = "pokedex_db";
pub const DEFAULT_SINK_TABLE: &str = "pokemon_pokedex";
pub const DEFAULT_SINK_USER: &str = "postgres";
pub const DEFAULT_SINK_MAINTENANCE_DATABASE: &str = "postgres";

/// Default sink connect timeout in seconds.
pub const DEFAULT_SINK_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Complete configuration of one pipeline run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub fetch: FetchConfig,
    pub staging: StagingConfig,
    pub sink: SinkConfig,
}

/// Catalog source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    /// Upper bound on the number of catalog entries
    pub catalog_limit: u32,
}

/// Detail fan-out tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum detail requests in flight at once
    pub concurrency: usize,
    /// Pause a worker takes after each staged document
    pub throttle_interval: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Backoff before the first retry; doubled on each further retry
    pub retry_backoff: Duration,
    /// Timeout for each individual request; also the cancellation grace period
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub path: PathBuf,
}

/// Postgres sink
#[derive(Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Database connected to while checking whether `database` exists
    pub maintenance_database: String,
    pub table: String,
    pub connect_timeout: Duration,
}

impl fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"********")
            .field("maintenance_database", &self.maintenance_database)
            .field("table", &self.table)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SOURCE_BASE_URL.to_string(),
            catalog_limit: DEFAULT_CATALOG_LIMIT,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_FETCH_CONCURRENCY,
            throttle_interval: Duration::from_millis(DEFAULT_FETCH_THROTTLE_MS),
            max_retries: DEFAULT_FETCH_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_FETCH_RETRY_BACKOFF_MS),
            request_timeout: Duration::from_secs(DEFAULT_FETCH_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STAGING_PATH),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SINK_HOST.to_string(),
            port: DEFAULT_SINK_PORT,
            database: DEFAULT_SINK_DATABASE.to_string(),
            user: DEFAULT_SINK_USER.to_string(),
            password: String::new(),
            maintenance_database: DEFAULT_SINK_MAINTENANCE_DATABASE.to_string(),
            table: DEFAULT_SINK_TABLE.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_SINK_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl PipelineConfig {
    /// Load `.env` (if present), read the environment and validate
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from environment variables, falling back to
    /// defaults for unset ones. Set but unparseable values are errors.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            source: SourceConfig {
                base_url: env_string("SOURCE_BASE_URL", defaults.source.base_url),
                catalog_limit: env_parse("CATALOG_LIMIT", defaults.source.catalog_limit)?,
            },
            fetch: FetchConfig {
                concurrency: env_parse("FETCH_CONCURRENCY", defaults.fetch.concurrency)?,
                throttle_interval: env_millis(
                    "FETCH_THROTTLE_INTERVAL",
                    defaults.fetch.throttle_interval,
                )?,
                max_retries: env_parse("FETCH_MAX_RETRIES", defaults.fetch.max_retries)?,
                retry_backoff: env_millis("FETCH_RETRY_BACKOFF", defaults.fetch.retry_backoff)?,
                request_timeout: env_secs(
                    "FETCH_REQUEST_TIMEOUT",
                    defaults.fetch.request_timeout,
                )?,
            },
            staging: StagingConfig {
                path: std::env::var("STAGING_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.staging.path),
            },
            sink: SinkConfig {
                host: env_string("SINK_HOST", defaults.sink.host),
                port: env_parse("SINK_PORT", defaults.sink.port)?,
                database: env_string("SINK_DATABASE", defaults.sink.database),
                user: env_string("SINK_USER", defaults.sink.user),
                password: env_string("SINK_PASSWORD", defaults.sink.password),
                maintenance_database: env_string(
                    "SINK_MAINTENANCE_DATABASE",
                    defaults.sink.maintenance_database,
                ),
                table: env_string("SINK_TABLE", defaults.sink.table),
                connect_timeout: env_secs("SINK_CONNECT_TIMEOUT", defaults.sink.connect_timeout)?,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.source.base_url.trim().is_empty() {
            return Err(EtlError::Config("SOURCE_BASE_URL cannot be empty".to_string()));
        }

        if self.source.catalog_limit == 0 {
            return Err(EtlError::Config("CATALOG_LIMIT must be greater than 0".to_string()));
        }

        if self.fetch.concurrency == 0 {
            return Err(EtlError::Config("FETCH_CONCURRENCY must be greater than 0".to_string()));
        }

        if self.fetch.request_timeout.is_zero() {
            return Err(EtlError::Config(
                "FETCH_REQUEST_TIMEOUT must be greater than 0".to_string(),
            ));
        }

        if self.staging.path.as_os_str().is_empty() {
            return Err(EtlError::Config("STAGING_PATH cannot be empty".to_string()));
        }

        if self.sink.port == 0 {
            return Err(EtlError::Config("SINK_PORT must be greater than 0".to_string()));
        }

        self.schema()?;

        if self.sink.password.is_empty() {
            tracing::warn!("SINK_PASSWORD is empty - relying on trust or peer authentication");
        }

        Ok(())
    }

    /// Sink schema named by this configuration
    pub fn schema(&self) -> Result<SinkSchema> {
        SinkSchema::new(&self.sink.database, &self.sink.table)
            .map_err(|e| EtlError::Config(e.to_string()))
    }

    /// Copy safe to print: the sink password is masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.sink.password.is_empty() {
            copy.sink.password = "********".to_string();
        }
        copy
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EtlError::invalid_setting(key, raw.as_str(), e)),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
