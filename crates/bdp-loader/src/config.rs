//! Loader configuration
//!
//! Settings come from the environment (a `.env` file is honoured) and are
//! validated once before a run starts.

use bdp_common::env;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

// ============================================================================
// Loader Configuration Constants
// ============================================================================

/// Default number of load workers; also the store pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Default dispatch queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Default records per stream per batch.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Default per-job timeout in seconds (1 hour).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;

/// Records per stream when running against the reduced test fixture.
pub const TEST_DATA_BATCH_SIZE: usize = 10;

/// Default graph store host.
pub const DEFAULT_GRAPH_HOST: &str = "localhost";

/// Default graph store port.
pub const DEFAULT_GRAPH_PORT: u16 = 5432;

/// Default graph store user.
pub const DEFAULT_GRAPH_USER: &str = "postgres";

/// Default graph store database.
pub const DEFAULT_GRAPH_DATABASE: &str = "bdp";

/// Graph store connection settings
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env::string_or("GRAPH_HOST", DEFAULT_GRAPH_HOST),
            port: env::parse_or("GRAPH_PORT", DEFAULT_GRAPH_PORT)?,
            user: env::string_or("GRAPH_USER", DEFAULT_GRAPH_USER),
            password: env::string_or("GRAPH_PASSWORD", ""),
            database: env::string_or("GRAPH_DATABASE", DEFAULT_GRAPH_DATABASE),
        })
    }

    /// Connection URI without credentials, safe to log
    pub fn uri(&self) -> String {
        format!("postgres://{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_GRAPH_HOST.to_string(),
            port: DEFAULT_GRAPH_PORT,
            user: DEFAULT_GRAPH_USER.to_string(),
            password: String::new(),
            database: DEFAULT_GRAPH_DATABASE.to_string(),
        }
    }
}

/// Settings for one loader run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Number of load workers
    pub workers: usize,
    /// Dispatch queue capacity
    pub queue_capacity: usize,
    /// Scratch directory for staged files
    pub staging_dir: PathBuf,
    /// Records per stream per batch
    pub batch_size: usize,
    pub job_timeout_secs: u64,
    /// Give up on an enqueue that stays blocked this long; unset waits forever
    pub enqueue_timeout_secs: Option<u64>,
    /// Abort a whole producer on its first extraction or schema error
    pub strict: bool,
    /// Reduced fixture: one batch per producer, [`TEST_DATA_BATCH_SIZE`] records per stream
    pub test_data: bool,
    pub store: StoreConfig,
}

impl LoaderConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Self {
            workers: env::parse_or("LOADER_WORKERS", DEFAULT_WORKERS)?,
            queue_capacity: env::parse_or("LOADER_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            staging_dir: env::optional_string("LOADER_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_staging_dir),
            batch_size: env::parse_or("LOADER_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            job_timeout_secs: env::parse_or("LOADER_JOB_TIMEOUT_SECS", DEFAULT_JOB_TIMEOUT_SECS)?,
            enqueue_timeout_secs: env::parse_optional("LOADER_ENQUEUE_TIMEOUT_SECS")?,
            strict: env::flag_or("LOADER_STRICT", false)?,
            test_data: env::flag_or("LOADER_TEST_DATA", false)?,
            store: StoreConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NotPositive("LOADER_WORKERS"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NotPositive("LOADER_QUEUE_CAPACITY"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NotPositive("LOADER_BATCH_SIZE"));
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::NotPositive("LOADER_JOB_TIMEOUT_SECS"));
        }
        if self.enqueue_timeout_secs == Some(0) {
            return Err(ConfigError::NotPositive("LOADER_ENQUEUE_TIMEOUT_SECS"));
        }
        self.pool_size()?;
        if self.queue_capacity < self.workers {
            tracing::warn!(
                workers = self.workers,
                queue_capacity = self.queue_capacity,
                "Queue capacity is below the worker count; some workers will idle"
            );
        }
        Ok(())
    }

    /// Store connection pool size, one connection per worker
    pub fn pool_size(&self) -> Result<u32, ConfigError> {
        u32::try_from(self.workers).map_err(|_| ConfigError::TooLarge("LOADER_WORKERS"))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn enqueue_timeout(&self) -> Option<Duration> {
        self.enqueue_timeout_secs.map(Duration::from_secs)
    }

    /// Records per stream per batch, reduced when running on test data
    pub fn effective_batch_size(&self) -> usize {
        if self.test_data {
            TEST_DATA_BATCH_SIZE.min(self.batch_size)
        } else {
            self.batch_size
        }
    }

    /// Batches each producer may emit; `None` means unbounded
    pub fn max_batches(&self) -> Option<usize> {
        self.test_data.then_some(1)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            staging_dir: default_staging_dir(),
            batch_size: DEFAULT_BATCH_SIZE,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            enqueue_timeout_secs: None,
            strict: false,
            test_data: false,
            store: StoreConfig::default(),
        }
    }
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("bdp-loader-staging")
}
