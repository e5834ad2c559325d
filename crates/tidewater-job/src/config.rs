//! Job definitions and process tuning.
//!
//! [`JobConfig`] describes *what* to migrate and is loaded from JSON.
//! [`ProcessConfig`] describes *how* (batching, throttling, buffering)
//! and is read from flat [`Properties`]:
//!
//! | Key | Default |
//! |---|---|
//! | `read.batch.size` | 1000 |
//! | `read.fetch.size` | batch size |
//! | `read.shard.size` | 1000000 |
//! | `read.rate.limiter.type` | unset (`QPS` or `TPS`) |
//! | `read.rate.limiter.qps` / `.tps` | algorithm default |
//! | `stream.channel.capacity` | 2000 |
//! | `progress.persist.interval.ms` | 1000 |
//! | `incremental.poll.max.records` | 500 |
//! | `incremental.idle.interval.ms` | 100 |

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tidewater_connectors::incremental::{DEFAULT_IDLE_INTERVAL, DEFAULT_POLL_MAX_RECORDS};
use tidewater_connectors::inventory::DEFAULT_BATCH_SIZE;
use tidewater_core::config::{ConfigKeySpec, Properties};
use tidewater_core::error::ConfigError;
use tidewater_core::rate_limit::{RateLimiter, RateLimiterConfig};

use crate::error::JobError;

/// Batch size key.
pub const READ_BATCH_SIZE: &str = "read.batch.size";
/// Fetch size hint key.
pub const READ_FETCH_SIZE: &str = "read.fetch.size";
/// Rows per job item key.
pub const READ_SHARD_SIZE: &str = "read.shard.size";
/// Rate limiter type key.
pub const READ_RATE_LIMITER_TYPE: &str = "read.rate.limiter.type";
/// Prefix of rate limiter algorithm properties.
pub const READ_RATE_LIMITER_PREFIX: &str = "read.rate.limiter.";
/// Channel capacity key.
pub const STREAM_CHANNEL_CAPACITY: &str = "stream.channel.capacity";
/// Progress flush interval key.
pub const PROGRESS_PERSIST_INTERVAL_MS: &str = "progress.persist.interval.ms";
/// Incremental poll size key.
pub const INCREMENTAL_POLL_MAX_RECORDS: &str = "incremental.poll.max.records";
/// Incremental idle sleep key.
pub const INCREMENTAL_IDLE_INTERVAL_MS: &str = "incremental.idle.interval.ms";

const DEFAULT_SHARD_SIZE: u64 = 1_000_000;
const DEFAULT_CHANNEL_CAPACITY: usize = 2000;
const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_millis(1000);

/// Tuning shared by every job item of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    /// Rows per inventory page.
    pub batch_size: usize,
    /// Driver fetch-size hint; `None` uses `batch_size`.
    pub fetch_size: Option<usize>,
    /// Rows per job item when splitting integer-keyed tables.
    pub shard_size: u64,
    /// Optional read throttle.
    pub rate_limiter: Option<RateLimiterConfig>,
    /// Records buffered between dumper and importer.
    pub channel_capacity: usize,
    /// How often dirty progress is flushed.
    pub persist_interval: Duration,
    /// Maximum change events per poll.
    pub poll_max_records: usize,
    /// Sleep while the change log is idle.
    pub idle_interval: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            fetch_size: None,
            shard_size: DEFAULT_SHARD_SIZE,
            rate_limiter: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
            poll_max_records: DEFAULT_POLL_MAX_RECORDS,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

impl ProcessConfig {
    /// Reads a process configuration, falling back to defaults for
    /// absent keys.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for unparsable or zero sizes.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let batch_size = positive(props, READ_BATCH_SIZE)?.unwrap_or(defaults.batch_size);
        let fetch_size = positive(props, READ_FETCH_SIZE)?;
        let shard_size = props
            .get_parsed::<u64>(READ_SHARD_SIZE)?
            .unwrap_or(defaults.shard_size);
        let rate_limiter = props.get(READ_RATE_LIMITER_TYPE).map(|kind| {
            let algorithm_props = Properties::from_pairs(props.iter().filter_map(|(k, v)| {
                k.strip_prefix(READ_RATE_LIMITER_PREFIX)
                    .filter(|suffix| *suffix != "type")
                    .map(|suffix| (suffix.to_string(), v.to_string()))
            }));
            RateLimiterConfig {
                kind: kind.to_string(),
                props: algorithm_props,
            }
        });
        let channel_capacity =
            positive(props, STREAM_CHANNEL_CAPACITY)?.unwrap_or(defaults.channel_capacity);
        let persist_interval = props
            .get_parsed::<u64>(PROGRESS_PERSIST_INTERVAL_MS)?
            .map_or(defaults.persist_interval, Duration::from_millis);
        let poll_max_records =
            positive(props, INCREMENTAL_POLL_MAX_RECORDS)?.unwrap_or(defaults.poll_max_records);
        let idle_interval = props
            .get_parsed::<u64>(INCREMENTAL_IDLE_INTERVAL_MS)?
            .map_or(defaults.idle_interval, Duration::from_millis);

        let config = Self {
            batch_size,
            fetch_size,
            shard_size,
            rate_limiter,
            channel_capacity,
            persist_interval,
            poll_max_records,
            idle_interval,
        };
        // Fail on an unknown limiter type at load time, not at job start.
        config.build_rate_limiter()?;
        Ok(config)
    }

    /// Builds the configured read throttle, if any.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an unknown type or malformed rate.
    pub fn build_rate_limiter(&self) -> Result<Option<Arc<dyn RateLimiter>>, ConfigError> {
        self.rate_limiter
            .as_ref()
            .map(RateLimiterConfig::build)
            .transpose()
    }

    /// Keys understood by [`from_properties`](Self::from_properties).
    #[must_use]
    pub fn config_keys() -> Vec<ConfigKeySpec> {
        vec![
            ConfigKeySpec::optional(READ_BATCH_SIZE, "Rows per inventory page", "1000"),
            ConfigKeySpec::optional(READ_FETCH_SIZE, "Driver fetch-size hint", "read.batch.size"),
            ConfigKeySpec::optional(READ_SHARD_SIZE, "Rows per job item", "1000000"),
            ConfigKeySpec::optional(READ_RATE_LIMITER_TYPE, "Read throttle: QPS or TPS", "none"),
            ConfigKeySpec::optional("read.rate.limiter.qps", "Queries per second for QPS", "30"),
            ConfigKeySpec::optional("read.rate.limiter.tps", "Writes per second for TPS", "2000"),
            ConfigKeySpec::optional(STREAM_CHANNEL_CAPACITY, "Records buffered per job item", "2000"),
            ConfigKeySpec::optional(PROGRESS_PERSIST_INTERVAL_MS, "Progress flush interval", "1000"),
            ConfigKeySpec::optional(INCREMENTAL_POLL_MAX_RECORDS, "Change events per poll", "500"),
            ConfigKeySpec::optional(INCREMENTAL_IDLE_INTERVAL_MS, "Idle sleep between polls", "100"),
        ]
    }
}

fn positive(props: &Properties, key: &str) -> Result<Option<usize>, ConfigError> {
    match props.get_parsed::<usize>(key)? {
        Some(0) => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: "0".to_string(),
            message: "must be positive".to_string(),
        }),
        other => Ok(other),
    }
}

/// A table to migrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema, if the source has schemas.
    #[serde(default)]
    pub schema: Option<String>,
    /// Physical table name.
    pub name: String,
    /// Name written into records; defaults to `name`.
    #[serde(default)]
    pub logic_name: Option<String>,
}

impl TableRef {
    /// A table without schema or logical alias.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            logic_name: None,
        }
    }

    /// Name written into records.
    #[must_use]
    pub fn logic_name(&self) -> &str {
        self.logic_name.as_deref().unwrap_or(&self.name)
    }
}

/// A migration job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job id.
    pub job_id: String,
    /// Source data source name.
    pub data_source: String,
    /// Source dialect identifier (see `DialectRegistry`).
    pub dialect: String,
    /// Tables to migrate.
    pub tables: Vec<TableRef>,
    /// Worker node the job is assigned to, if any.
    #[serde(default)]
    pub sharding_node: Option<String>,
    /// Process tuning, see [`ProcessConfig`].
    #[serde(default)]
    pub props: Properties,
}

impl JobConfig {
    /// Parses a JSON job definition.
    ///
    /// # Errors
    ///
    /// Returns `JobError::InvalidDefinition` for malformed JSON, an empty
    /// table list, or an empty job id.
    pub fn from_json(json: &str) -> Result<Self, JobError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| JobError::InvalidDefinition(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the definition is usable.
    ///
    /// # Errors
    ///
    /// Returns `JobError::InvalidDefinition` for an empty or non-path-safe
    /// id, or an empty table list.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.job_id.is_empty() {
            return Err(JobError::InvalidDefinition("job id is empty".into()));
        }
        // Job ids become store keys.
        if !self
            .job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(JobError::InvalidDefinition(format!(
                "job id '{}' may only contain ASCII letters, digits, '_' and '-'",
                self.job_id
            )));
        }
        if self.tables.is_empty() {
            return Err(JobError::InvalidDefinition(format!(
                "job {} has no tables",
                self.job_id
            )));
        }
        Ok(())
    }

    /// Comma-separated logical table names.
    #[must_use]
    pub fn table_names(&self) -> String {
        self.tables
            .iter()
            .map(TableRef::logic_name)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Process tuning parsed from `props`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for malformed properties.
    pub fn process_config(&self) -> Result<ProcessConfig, ConfigError> {
        ProcessConfig::from_properties(&self.props)
    }
}
