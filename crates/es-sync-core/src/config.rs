//! Configuration types for the incremental sync
//!
//! Uses the `config` crate for layered configuration from files and environment.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::channel::BootstrapMethod;
use crate::descriptor::{DescriptorRegistry, TypeDescriptor};
use crate::error::{Result, SyncError};

/// Root configuration for a sync run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Cluster connection
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,

    /// Ingest channel buffering and document stamping
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Transport retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Orchestrator behaviour
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Primary target
    #[serde(default)]
    pub primary: TypeConfig,

    /// Secondary target
    #[serde(default)]
    pub secondary: TypeConfig,
}

// ============================================================================
// Elasticsearch Configuration
// ============================================================================

/// Elasticsearch connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Elasticsearch hosts
    #[serde(default = "default_es_hosts")]
    pub hosts: Vec<String>,

    /// Optional username for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Optional API key for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_es_hosts() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            hosts: default_es_hosts(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

// ============================================================================
// Channel Configuration
// ============================================================================

/// Ingest channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Documents buffered before writers have to wait
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Maximum documents per bulk request
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Flush a partial batch after this long
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,

    /// Field holding the per-document content hash
    #[serde(default = "default_content_hash_field")]
    pub content_hash_field: String,

    /// Field stamped with the batch timestamp on every write
    #[serde(default = "default_batch_index_date_field")]
    pub batch_index_date_field: String,

    /// Field stamped with the batch timestamp when content changes
    #[serde(default = "default_last_updated_field")]
    pub last_updated_field: String,
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_bulk_size() -> usize {
    1000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_content_hash_field() -> String {
    "content_hash".to_string()
}

fn default_batch_index_date_field() -> String {
    "batch_index_date".to_string()
}

fn default_last_updated_field() -> String {
    "last_updated".to_string()
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            bulk_size: default_bulk_size(),
            flush_interval: default_flush_interval(),
            content_hash_field: default_content_hash_field(),
            batch_index_date_field: default_batch_index_date_field(),
            last_updated_field: default_last_updated_field(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Maximum backoff delay
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

// ============================================================================
// Orchestrator Configuration
// ============================================================================

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay between task-status polls
    #[serde(with = "humantime_serde", default = "default_task_poll_interval")]
    pub task_poll_interval: Duration,

    /// Upper bound on each drain during completion
    #[serde(with = "humantime_serde", default)]
    pub max_drain_wait: Option<Duration>,

    /// Schema registration mode passed to `start`
    #[serde(default)]
    pub bootstrap_method: BootstrapMethod,
}

fn default_task_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_poll_interval: default_task_poll_interval(),
            max_drain_wait: None,
            bootstrap_method: BootstrapMethod::default(),
        }
    }
}

/// Per-target type configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_alias: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<Value>,
}

impl TypeConfig {
    /// Registry key; falls back to the write target
    pub fn type_name(&self) -> String {
        if self.name.is_empty() {
            self.write_target.clone().unwrap_or_default()
        } else {
            self.name.clone()
        }
    }

    /// Build the descriptor; the write target is required
    pub fn to_descriptor(&self) -> Result<TypeDescriptor> {
        let mut descriptor = TypeDescriptor::new(self.type_name());
        descriptor.write_target = self.write_target.clone();
        descriptor.read_alias = self.read_alias.clone();
        descriptor.date_pattern = self.date_pattern.clone();
        if let Some(ref settings) = self.settings {
            descriptor.settings = settings.clone();
        }
        if let Some(ref mappings) = self.mappings {
            descriptor.mappings = mappings.clone();
        }

        descriptor.target()?;
        Ok(descriptor)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl SyncConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add config file if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Add environment variables with prefix ES_SYNC_
        builder = builder.add_source(
            config::Environment::with_prefix("ES_SYNC")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject configurations that cannot produce a working run
    pub fn validate(&self) -> Result<()> {
        if self.elasticsearch.hosts.is_empty() {
            return Err(SyncError::config("elasticsearch.hosts must not be empty"));
        }
        for host in &self.elasticsearch.hosts {
            Url::parse(host)
                .map_err(|e| SyncError::config(format!("invalid host `{}`: {}", host, e)))?;
        }
        if self.channel.buffer_capacity == 0 || self.channel.bulk_size == 0 {
            return Err(SyncError::config(
                "channel.buffer_capacity and channel.bulk_size must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::config("retry.max_attempts must be positive"));
        }
        self.descriptor_registry()?;
        Ok(())
    }

    /// Register both target descriptors; their type names must differ
    pub fn descriptor_registry(&self) -> Result<DescriptorRegistry> {
        Ok(DescriptorRegistry::builder()
            .register(self.primary.to_descriptor()?)?
            .register(self.secondary.to_descriptor()?)?
            .build())
    }
}
