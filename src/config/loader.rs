use super::{Config, PaginationMode};
use crate::error::{Result, TransferError};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use std::env;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from `CONFIG_PATH` or the default file names, then apply env overrides
    pub fn load() -> Result<Config> {
        let path = match env::var("CONFIG_PATH") {
            Ok(path) => Some(path),
            Err(_) => ["estransfer.yaml", "estransfer.yml", "config.yaml", "config.yml"]
                .iter()
                .find(|f| Path::new(f).exists())
                .map(|f| f.to_string()),
        };
        Self::build(path.as_deref(), None)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &str) -> Result<Config> {
        Self::build(Some(path), None)
    }

    /// Parse an inline YAML document (env overrides still apply)
    pub fn load_from_str(yaml: &str) -> Result<Config> {
        Self::build(None, Some(yaml))
    }

    fn build(path: Option<&str>, inline: Option<&str>) -> Result<Config> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        if let Some(yaml) = inline {
            builder = builder.add_source(File::from_str(yaml, FileFormat::Yaml));
        }

        // ESTRANSFER__TRANSFER__BATCH_SIZE=500 becomes transfer.batch_size
        builder = builder.add_source(
            Environment::with_prefix("ESTRANSFER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TransferError::Config(format!("Failed to build config: {}", e)))?;

        let config: Config = config.try_deserialize().map_err(|e| {
            TransferError::Config(format!("Failed to deserialize config: {}", e))
        })?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Reject configurations that must never reach a transfer
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        if config.source.url.is_empty() {
            errors.push("source url cannot be empty".to_string());
        }
        if config.target.url.is_empty() {
            errors.push("target url cannot be empty".to_string());
        }

        let transfer = &config.transfer;
        if transfer.source_index.trim().is_empty() {
            errors.push("source_index cannot be empty".to_string());
        }
        if transfer.target_index.trim().is_empty() {
            errors.push("target_index cannot be empty".to_string());
        }
        if !(1..=10_000).contains(&transfer.batch_size) {
            errors.push(format!(
                "batch_size must be between 1 and 10000, got {}",
                transfer.batch_size
            ));
        }
        if !(1..=60).contains(&transfer.scroll_timeout) {
            errors.push(format!(
                "scroll_timeout must be between 1 and 60 minutes, got {}",
                transfer.scroll_timeout
            ));
        }
        if !(1..=10).contains(&transfer.thread_count) {
            errors.push(format!(
                "thread_count must be between 1 and 10, got {}",
                transfer.thread_count
            ));
        }
        if transfer.incremental && transfer.timestamp_field.is_empty() {
            errors.push("incremental mode requires timestamp_field".to_string());
        }
        for field in &transfer.include_fields {
            if transfer.exclude_fields.contains(field) {
                errors.push(format!("field '{}' is both included and excluded", field));
            }
        }

        let throttle = &config.throttle;
        let bands = [
            throttle.green_threshold,
            throttle.yellow_threshold,
            throttle.red_threshold,
            throttle.critical_threshold,
        ];
        if bands.windows(2).any(|w| w[0] >= w[1]) || bands.iter().any(|b| !(0.0..=1.0).contains(b)) {
            errors.push("throttle thresholds must be strictly increasing within 0..1".to_string());
        }
        if throttle.min_batch_size == 0 || throttle.min_batch_size > throttle.max_batch_size {
            errors.push("throttle min_batch_size must be > 0 and <= max_batch_size".to_string());
        }
        if throttle.initial_concurrency == 0 {
            errors.push("throttle initial_concurrency must be > 0".to_string());
        }

        if config.circuit_breaker.minimum_requests == 0 {
            errors.push("circuit_breaker minimum_requests must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&config.circuit_breaker.failure_rate_threshold) {
            errors.push("circuit_breaker failure_rate_threshold must be within 0..1".to_string());
        }

        if config.streaming.queue_capacity == 0 || config.streaming.max_concurrent_batches == 0 {
            errors.push("streaming queue_capacity and max_concurrent_batches must be > 0".to_string());
        }
        if config.pagination.mode == PaginationMode::TimeBased
            && config.pagination.time_field.is_empty()
        {
            errors.push("time-based pagination requires time_field".to_string());
        }

        if config.checkpoint.max_per_task == 0 {
            errors.push("checkpoint max_per_task must be > 0".to_string());
        }
        if !(1..=crate::recovery::MAX_RECOVERY_BATCH).contains(&config.checkpoint.recovery_batch_size) {
            errors.push(format!(
                "checkpoint recovery_batch_size must be between 1 and {}",
                crate::recovery::MAX_RECOVERY_BATCH
            ));
        }

        if !errors.is_empty() {
            return Err(TransferError::Validation(errors.join(", ")));
        }

        Ok(())
    }

    /// Create a sample configuration file
    pub fn generate_sample() -> &'static str {
        r#"# es-transfer configuration
# Every section except source/target/transfer is optional.

source:
  url: http://localhost:9200
  # username: elastic
  # password: ${SOURCE_PASSWORD}
  timeout: 60

target:
  url: http://localhost:9201
  timeout: 60

transfer:
  source_index: logs-2024
  target_index: logs-2024-v2
  batch_size: 1000        # 1..10000
  scroll_timeout: 5       # minutes, 1..60
  thread_count: 1         # 1..10
  field_mapping:
    user_name: username
  new_fields:
    migrated: true
  case_insensitive_fields:
    - email
  exclude_fields:
    - internal_notes
  incremental: false
  timestamp_field: updateTime
  # strategy: scroll     # scroll | pagination | streaming | hybrid

throttle:
  green_threshold: 0.7
  yellow_threshold: 0.8
  red_threshold: 0.9
  critical_threshold: 0.95
  initial_concurrency: 10
  initial_batch_size: 1000

# memory:
#   budget_mb: 2048

circuit_breaker:
  failure_threshold: 50
  failure_rate_threshold: 0.5
  minimum_requests: 20
  timeout_ms: 60000

pagination:
  mode: hybrid            # time_based | id_based | hybrid
  page_size: 2000
  time_field: "@timestamp"
  window_minutes: 10

streaming:
  queue_capacity: 10000
  max_concurrent_batches: 5

checkpoint:
  directory: ./checkpoints
  expiry_hours: 24
  max_per_task: 1000

logging:
  level: info
  format: text            # text, json or pretty
"#
    }
}
