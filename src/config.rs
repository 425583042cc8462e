use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tables::schema::integer_transform;
use crate::tables::{Field, Limits, Schema, SchemaBuilder};

/// Top-level configuration for the advanced metrics pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Unix socket path NGINX writes metrics to.
    #[serde(default = "default_address")]
    pub address: PathBuf,

    /// How often the staging table is folded into the priority table. Default: 10s.
    #[serde(default = "default_aggregation_period", with = "humantime_serde")]
    pub aggregation_period: Duration,

    /// How often a batch of metric sets is published. Default: 30s.
    #[serde(default = "default_publishing_period", with = "humantime_serde")]
    pub publishing_period: Duration,

    /// Upper bound on waiting for room in the output queue. Default: 5s.
    #[serde(default = "default_publish_timeout", with = "humantime_serde")]
    pub publish_timeout: Duration,

    /// Capacity of the output queue in batches. Default: 1.
    #[serde(default = "default_output_queue_size")]
    pub output_queue_size: usize,

    /// Size limits driving dimension collapsing.
    #[serde(default)]
    pub table_sizes_limits: TableSizesLimits,

    /// Socket reader configuration.
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Ingester worker pool configuration.
    #[serde(default)]
    pub ingester: IngesterConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Ordered message fields. Default: NGINX HTTP request schema.
    #[serde(default = "default_schema")]
    pub schema: Vec<FieldConfig>,
}

/// Soft limits and collapsing thresholds for both tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TableSizesLimits {
    /// Soft limit of samples in the staging table. Default: 1000.
    #[serde(default = "default_table_limit")]
    pub staging_table_max_size: usize,

    /// Staging table size at which dimensions start collapsing. Default: 1000.
    #[serde(default = "default_table_limit")]
    pub staging_table_threshold: usize,

    /// Soft limit of samples in the priority table. Default: 1000.
    #[serde(default = "default_table_limit")]
    pub priority_table_max_size: usize,

    /// Number of samples the priority table keeps precise. Default: 1000.
    #[serde(default = "default_table_limit")]
    pub priority_table_threshold: usize,
}

/// Socket reader configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    /// Largest unterminated message a connection may buffer, in bytes. Default: 64KiB.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Frames buffered between connection workers and the ingester. Default: 64.
    #[serde(default = "default_frame_queue_size")]
    pub frame_queue_size: usize,
}

/// Ingester configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngesterConfig {
    /// Number of ingestion workers. Default: 2.
    #[serde(default = "default_ingester_workers")]
    pub workers: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// One schema entry, in message order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldConfig {
    /// String dimension resolved through a lookup table.
    Dimension(DimensionConfig),
    /// Dimension carrying a hex integer, published in decimal.
    IntegerDimension(DimensionConfig),
    /// Numeric metric.
    Metric { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DimensionConfig {
    pub name: String,

    /// Expected number of distinct values.
    pub max_size: u32,

    /// Collapsing level above which this dimension turns into AGGR.
    #[serde(default)]
    pub collapsing_level: Option<u32>,

    /// Key width override in bits.
    #[serde(default)]
    pub key_bit_size: Option<u32>,
}

impl FieldConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Dimension(d) | Self::IntegerDimension(d) => &d.name,
            Self::Metric { name } => name,
        }
    }

    fn to_field(&self) -> Field {
        let (dim, integer) = match self {
            Self::Metric { name } => return Field::metric(name.as_str()),
            Self::Dimension(d) => (d, false),
            Self::IntegerDimension(d) => (d, true),
        };

        let mut field = Field::dimension(dim.name.as_str(), dim.max_size);
        if integer {
            field = field.with_transform(integer_transform());
        }
        if let Some(level) = dim.collapsing_level {
            field = field.with_collapsing_level(level);
        }
        if let Some(bits) = dim.key_bit_size {
            field = field.with_key_bit_size(bits);
        }
        field
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_address() -> PathBuf {
    PathBuf::from("/var/run/nginx-agent/advanced-metrics.sock")
}

fn default_aggregation_period() -> Duration {
    Duration::from_secs(10)
}

fn default_publishing_period() -> Duration {
    Duration::from_secs(30)
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_output_queue_size() -> usize {
    1
}

fn default_table_limit() -> usize {
    1000
}

fn default_max_buffer_size() -> usize {
    64 * 1024
}

fn default_frame_queue_size() -> usize {
    64
}

fn default_ingester_workers() -> usize {
    2
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn dimension(name: &str, max_size: u32) -> FieldConfig {
    FieldConfig::Dimension(DimensionConfig {
        name: name.to_string(),
        max_size,
        collapsing_level: None,
        key_bit_size: None,
    })
}

fn integer_dimension(name: &str, max_size: u32) -> FieldConfig {
    FieldConfig::IntegerDimension(DimensionConfig {
        name: name.to_string(),
        max_size,
        collapsing_level: None,
        key_bit_size: None,
    })
}

fn metric(name: &str) -> FieldConfig {
    FieldConfig::Metric {
        name: name.to_string(),
    }
}

/// Field layout NGINX's advanced metrics module writes for HTTP and stream traffic.
pub fn default_schema() -> Vec<FieldConfig> {
    vec![
        dimension("http.uri", 16000),
        integer_dimension("http.response_code", 600),
        dimension("http.request_method", 16),
        metric("hitcount"),
        metric("http.request.bytes_rcvd"),
        metric("http.request.bytes_sent"),
        dimension("environment", 32),
        dimension("app", 32),
        dimension("component", 256),
        dimension("acm_infra_workspaces_name", 256),
        dimension("acm_service_workspaces_name", 256),
        dimension("acm_environments_name", 256),
        dimension("acm_environments_type", 256),
        dimension("acm_api_proxy_name", 256),
        dimension("acm_api_proxy_hostname", 256),
        dimension("acm_api_proxy_version", 256),
        dimension("country_code", 256),
        dimension("http.version_schema", 16),
        dimension("http.upstream_addr", 1024),
        integer_dimension("upstream_response_code", 600),
        dimension("http.hostname", 16000),
        metric("client.network.latency"),
        metric("client.ttfb.latency"),
        metric("client.request.latency"),
        metric("client.response.latency"),
        metric("upstream.network.latency"),
        metric("upstream.header.latency"),
        metric("upstream.response.latency"),
        dimension("published_api", 256),
        dimension("request_outcome", 8),
        dimension("request_outcome_reason", 32),
        dimension("gateway", 32),
        dimension("waf.signature_ids", 16000),
        dimension("waf.attack_types", 8),
        dimension("waf.violation_rating", 8),
        dimension("waf.violations", 128),
        dimension("waf.violation_subviolations", 16),
        metric("client.latency"),
        metric("upstream.latency"),
        metric("connection_duration"),
        dimension("family", 4),
        dimension("proxied_protocol", 4),
        metric("bytes_rcvd"),
        metric("bytes_sent"),
    ]
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            address: default_address(),
            aggregation_period: default_aggregation_period(),
            publishing_period: default_publishing_period(),
            publish_timeout: default_publish_timeout(),
            output_queue_size: default_output_queue_size(),
            table_sizes_limits: TableSizesLimits::default(),
            reader: ReaderConfig::default(),
            ingester: IngesterConfig::default(),
            health: HealthConfig::default(),
            schema: default_schema(),
        }
    }
}

impl Default for TableSizesLimits {
    fn default() -> Self {
        Self {
            staging_table_max_size: default_table_limit(),
            staging_table_threshold: default_table_limit(),
            priority_table_max_size: default_table_limit(),
            priority_table_threshold: default_table_limit(),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            frame_queue_size: default_frame_queue_size(),
        }
    }
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            workers: default_ingester_workers(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.address.as_os_str().is_empty() {
            bail!("address is required");
        }

        if self.aggregation_period.is_zero() {
            bail!("aggregation_period must be positive");
        }
        if self.publishing_period.is_zero() {
            bail!("publishing_period must be positive");
        }
        if self.publishing_period < self.aggregation_period {
            bail!(
                "publishing_period {:?} must not be shorter than aggregation_period {:?}",
                self.publishing_period,
                self.aggregation_period
            );
        }
        if self.publish_timeout.is_zero() {
            bail!("publish_timeout must be positive");
        }

        if self.output_queue_size == 0 {
            bail!("output_queue_size must be positive");
        }
        if self.reader.frame_queue_size == 0 {
            bail!("reader.frame_queue_size must be positive");
        }
        if self.reader.max_buffer_size < 2 {
            bail!("reader.max_buffer_size must be at least 2 bytes");
        }
        if self.ingester.workers == 0 {
            bail!("ingester.workers must be positive");
        }

        self.table_sizes_limits.staging_limits()?;
        self.table_sizes_limits.priority_limits()?;

        if self.schema.is_empty() {
            bail!("schema must declare at least one field");
        }
        let mut names = HashSet::new();
        for field in &self.schema {
            if !names.insert(field.name()) {
                bail!("schema field appears more than once: {}", field.name());
            }
        }
        self.build_schema()?;

        Ok(())
    }

    /// Builds the ingestion schema from the configured field list.
    pub fn build_schema(&self) -> Result<Schema> {
        self.schema
            .iter()
            .fold(SchemaBuilder::new(), |builder, field| {
                builder.field(field.to_field())
            })
            .build()
            .context("building schema")
    }
}

impl TableSizesLimits {
    pub fn staging_limits(&self) -> Result<Limits> {
        Limits::new(self.staging_table_max_size, self.staging_table_threshold)
            .context("invalid staging table limits")
    }

    pub fn priority_limits(&self) -> Result<Limits> {
        Limits::new(self.priority_table_max_size, self.priority_table_threshold)
            .context("invalid priority table limits")
    }
}
