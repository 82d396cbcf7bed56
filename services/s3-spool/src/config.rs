use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::store::Acl;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Region of that name not found: {0}")]
    UnknownRegion(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Regions the output accepts. Anything else is rejected at startup.
pub const KNOWN_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "us-gov-west-1",
    "ca-central-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-central-1",
    "eu-north-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-south-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "sa-east-1",
    "cn-north-1",
];

/// Main configuration for the spool service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Input configuration
    #[serde(default)]
    pub input: InputConfig,
    /// S3 output configuration
    pub output: OutputConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Metrics port, 0 disables the exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// How inbound records are encoded before buffering
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InputConfig {
    #[serde(default)]
    pub format: InputFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// Each record is written verbatim followed by a newline
    #[default]
    Lines,
    /// Each record must be a JSON document, re-emitted compact
    JsonLines,
}

/// S3 output and local buffer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// AWS secret access key (empty = default credential chain)
    #[serde(default)]
    pub secret_key: String,
    /// AWS access key id (empty = default credential chain)
    #[serde(default)]
    pub access_key: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Destination bucket
    pub bucket: String,
    /// Slash-delimited key prefix, also used to name the local buffer file
    #[serde(default)]
    pub prefix: String,
    /// Periodic upload interval in seconds
    #[serde(default = "default_ticker_interval_secs")]
    pub ticker_interval_secs: u64,
    /// Gzip the buffer file before upload
    #[serde(default = "default_true")]
    pub compression: bool,
    /// External program used for compression
    #[serde(default = "default_compression_program")]
    pub compression_program: String,
    /// Directory holding the buffer file
    #[serde(default = "default_buffer_path")]
    pub buffer_path: PathBuf,
    /// In-memory bytes accumulated before spilling to disk
    #[serde(default = "default_buffer_chunk_limit")]
    pub buffer_chunk_limit: usize,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Canned ACL applied to uploaded objects
    #[serde(default)]
    pub acl: Acl,
    /// Upload whatever is pending when the input closes
    #[serde(default)]
    pub flush_on_shutdown: bool,
}

// Default value functions
fn default_service_name() -> String {
    "s3-spool".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_ticker_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_compression_program() -> String {
    "gzip".to_string()
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("/var/lib/s3-spool")
}

fn default_buffer_chunk_limit() -> usize {
    1_000_000
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("service.name", "s3-spool")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/s3-spool").required(false))
            .add_source(config::File::with_name("/etc/s3-spool/s3-spool").required(false))
            // S3SPOOL__OUTPUT__BUCKET -> output.bucket
            .add_source(
                config::Environment::with_prefix("S3SPOOL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.output.validate()?;
        Ok(config)
    }
}

impl OutputConfig {
    /// Minimal configuration with defaults for everything but the bucket
    pub fn new(bucket: impl Into<String>, buffer_path: impl Into<PathBuf>) -> Self {
        Self {
            secret_key: String::new(),
            access_key: String::new(),
            region: default_region(),
            bucket: bucket.into(),
            prefix: String::new(),
            ticker_interval_secs: default_ticker_interval_secs(),
            compression: true,
            compression_program: default_compression_program(),
            buffer_path: buffer_path.into(),
            buffer_chunk_limit: default_buffer_chunk_limit(),
            endpoint_url: None,
            force_path_style: false,
            acl: Acl::default(),
            flush_on_shutdown: false,
        }
    }

    /// Validate the output configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.is_empty() {
            return Err(ConfigError::MissingRequired("output.bucket".to_string()));
        }

        // Both empty means the default credential chain
        if self.access_key.is_empty() != self.secret_key.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "output.access_key".to_string(),
                message: "access_key and secret_key must be set together".to_string(),
            });
        }

        if !KNOWN_REGIONS.contains(&self.region.as_str()) {
            return Err(ConfigError::UnknownRegion(self.region.clone()));
        }

        if self.ticker_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "output.ticker_interval_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.buffer_chunk_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "output.buffer_chunk_limit".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.buffer_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired("output.buffer_path".to_string()));
        }

        if self.compression && self.compression_program.is_empty() {
            return Err(ConfigError::MissingRequired(
                "output.compression_program".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the periodic upload interval as Duration
    pub fn ticker_interval(&self) -> Duration {
        Duration::from_secs(self.ticker_interval_secs)
    }

    /// Location of the single buffer file for this bucket and prefix
    pub fn buffer_file_path(&self) -> PathBuf {
        let flattened = self.prefix.split('/').collect::<Vec<_>>().join("_");
        self.buffer_path.join(format!("{}{}", self.bucket, flattened))
    }

    /// Whether explicit credentials were configured
    pub fn has_static_credentials(&self) -> bool {
        !self.access_key.is_empty()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: default_metrics_port(),
        }
    }
}
