use super::groups::{ExportRequest, ListenerGroup, PortSelection, parse_ports};
use super::{BufferTier, ConfigError, LogLevel, MemoryOverflow};
use crate::buffer::{
    CloudQueueClient, DEFAULT_QUEUE_NAME_TEMPLATE, ExternalQueueConfig, JournalConfig,
    QueueNameTemplate, StorageConfig,
};
use crate::domain::{EntityType, HandlerKey, QueueInfo};
use crate::properties::entity::DEFAULT_MEMORY_BUFFER_FACTOR;
use crate::properties::{PropertiesRegistry, QueueingLevel};
use crate::reliability::Backoff;
use crate::sender::ClientConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Inline TOML configuration, used when no `--config-file` is given.
pub const CONFIG_ENV: &str = "PROXY_CONFIG";

const MIN_FLUSH_THREADS: usize = 4;
const MAX_FLUSH_THREADS: usize = 16;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Backend endpoint receiving delivered batches
    #[arg(long, env = "PROXY_SERVER", default_value = "http://localhost:2878/")]
    pub server: String,

    /// Comma-separated ports carrying points, delta counters, histograms, source tags and events
    #[arg(long, env = "PROXY_PUSH_LISTENER_PORTS", default_value = "2878")]
    pub push_listener_ports: String,

    /// Comma-separated ports carrying spans and span logs
    #[arg(long, env = "PROXY_TRACE_LISTENER_PORTS")]
    pub trace_listener_ports: Option<String>,

    /// Comma-separated ports carrying logs
    #[arg(long, env = "PROXY_LOG_LISTENER_PORTS")]
    pub log_listener_ports: Option<String>,

    /// Sender tasks (shards) per pipeline; defaults to the CPU count clamped to 4..=16
    #[arg(long, env = "PROXY_FLUSH_THREADS")]
    pub flush_threads: Option<usize>,

    /// Route batches round-robin instead of by ordering key
    #[arg(long, env = "PROXY_DISABLE_SHARDING")]
    pub disable_sharding: bool,

    /// Storage tier for the retry buffer
    #[arg(long, env = "PROXY_BUFFER_TIER", value_enum, default_value = "disk")]
    pub buffer_tier: BufferTier,

    /// Directory of the on-disk retry buffer
    #[arg(long, env = "PROXY_BUFFER", default_value = "/var/spool/telemetry-proxy/buffer")]
    pub buffer: PathBuf,

    /// Size of one buffer partition file in MB
    #[arg(long, env = "PROXY_BUFFER_PARTITION_SIZE_MB", default_value = "128")]
    pub buffer_partition_size_mb: u64,

    /// Store journal payloads uncompressed
    #[arg(long, env = "PROXY_DISABLE_BUFFER_COMPRESSION")]
    pub disable_buffer_compression: bool,

    /// Tasks held per shard by the memory tier
    #[arg(long, env = "PROXY_MEMORY_QUEUE_CAPACITY", default_value = "10000")]
    pub memory_queue_capacity: usize,

    /// What a full memory tier does with a new task: block, drop_oldest or drop_newest
    #[arg(long, env = "PROXY_MEMORY_OVERFLOW_POLICY", value_enum, default_value = "block")]
    pub memory_overflow_policy: MemoryOverflow,

    /// Drop every buffered task on start-up
    #[arg(long, env = "PROXY_PURGE_BUFFER")]
    pub purge_buffer: bool,

    /// When to persist instead of dropping: memory, pushback or any_error
    #[arg(long, env = "PROXY_QUEUEING_LEVEL", default_value = "any_error")]
    pub queueing_level: QueueingLevel,

    /// Milliseconds between batches
    #[arg(long, env = "PROXY_PUSH_FLUSH_INTERVAL_MS", default_value = "1000")]
    pub push_flush_interval_ms: u64,

    /// Maximum points (and delta counters) per batch
    #[arg(long, env = "PROXY_PUSH_FLUSH_MAX_POINTS")]
    pub push_flush_max_points: Option<usize>,

    /// Maximum histograms per batch
    #[arg(long, env = "PROXY_PUSH_FLUSH_MAX_HISTOGRAMS")]
    pub push_flush_max_histograms: Option<usize>,

    /// Maximum spans per batch
    #[arg(long, env = "PROXY_PUSH_FLUSH_MAX_SPANS")]
    pub push_flush_max_spans: Option<usize>,

    /// Maximum span logs per batch
    #[arg(long, env = "PROXY_PUSH_FLUSH_MAX_SPAN_LOGS")]
    pub push_flush_max_span_logs: Option<usize>,

    /// Maximum logs per batch
    #[arg(long, env = "PROXY_PUSH_FLUSH_MAX_LOGS")]
    pub push_flush_max_logs: Option<usize>,

    /// Items kept in memory per shard before the queueing level applies; at least one batch
    #[arg(long, env = "PROXY_PUSH_MEMORY_BUFFER_LIMIT")]
    pub push_memory_buffer_limit: Option<usize>,

    /// Outbound points per second (0 = unlimited)
    #[arg(long, env = "PROXY_PUSH_RATE_LIMIT")]
    pub push_rate_limit: Option<f64>,

    #[arg(long, env = "PROXY_PUSH_RATE_LIMIT_HISTOGRAMS")]
    pub push_rate_limit_histograms: Option<f64>,

    #[arg(long, env = "PROXY_PUSH_RATE_LIMIT_SOURCE_TAGS")]
    pub push_rate_limit_source_tags: Option<f64>,

    #[arg(long, env = "PROXY_PUSH_RATE_LIMIT_SPANS")]
    pub push_rate_limit_spans: Option<f64>,

    #[arg(long, env = "PROXY_PUSH_RATE_LIMIT_SPAN_LOGS")]
    pub push_rate_limit_span_logs: Option<f64>,

    #[arg(long, env = "PROXY_PUSH_RATE_LIMIT_EVENTS")]
    pub push_rate_limit_events: Option<f64>,

    #[arg(long, env = "PROXY_PUSH_RATE_LIMIT_LOGS")]
    pub push_rate_limit_logs: Option<f64>,

    /// Seconds of unused rate limit that may be spent at once
    #[arg(long, env = "PROXY_PUSH_RATE_LIMIT_MAX_BURST_SECONDS", default_value = "10")]
    pub push_rate_limit_max_burst_seconds: u64,

    /// Base of the exponential retry backoff, in seconds
    #[arg(long, env = "PROXY_RETRY_BACKOFF_BASE_SECONDS", default_value = "2.0")]
    pub retry_backoff_base_seconds: f64,

    /// Cap on a single retry delay, in seconds
    #[arg(long, env = "PROXY_MAX_RETRY_DELAY_SECS", default_value = "300")]
    pub max_retry_delay_secs: u64,

    /// Split batches in half when the backend rate-limits them
    #[arg(long, env = "PROXY_SPLIT_PUSH_WHEN_RATE_LIMITED")]
    pub split_push_when_rate_limited: bool,

    /// Blocked items logged per minute and entity type
    #[arg(long, env = "PROXY_PUSH_BLOCKED_SAMPLES", default_value = "5")]
    pub push_blocked_samples: u64,

    /// Derive rate limits from the observed receive rate
    #[arg(long, env = "PROXY_TRAFFIC_SHAPING")]
    pub traffic_shaping: bool,

    #[arg(long, env = "PROXY_TRAFFIC_SHAPING_WINDOW_SECONDS", default_value = "300")]
    pub traffic_shaping_window_seconds: u64,

    #[arg(long, env = "PROXY_TRAFFIC_SHAPING_HEADROOM", default_value = "1.15")]
    pub traffic_shaping_headroom: f64,

    /// Export buffered items of these ports ("all" for every port) and exit
    #[arg(long, env = "PROXY_EXPORT_QUEUE_PORTS")]
    pub export_queue_ports: Option<String>,

    /// File receiving exported items, one per line
    #[arg(long, env = "PROXY_EXPORT_QUEUE_OUTPUT_FILE")]
    pub export_queue_output_file: Option<PathBuf>,

    /// Keep exported tasks in the buffer
    #[arg(
        long,
        env = "PROXY_EXPORT_QUEUE_RETAIN_DATA",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub export_queue_retain_data: bool,

    /// Identifier substituted for {{id}} in external queue names; defaults to the host name
    #[arg(long, env = "PROXY_QUEUE_IDENTIFIER")]
    pub queue_identifier: Option<String>,

    /// External queue name template
    #[arg(long, env = "PROXY_QUEUE_NAME_TEMPLATE", default_value = DEFAULT_QUEUE_NAME_TEMPLATE)]
    pub queue_name_template: String,

    /// Seconds to wait for sender tasks on shutdown
    #[arg(long, env = "PROXY_SHUTDOWN_TIMEOUT_SECS", default_value = "10")]
    pub shutdown_timeout_secs: u64,

    #[arg(long, env = "PROXY_CONNECTION_TIMEOUT_SECS", default_value = "10")]
    pub connection_timeout_secs: u64,

    #[arg(long, env = "PROXY_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    #[arg(long, env = "PROXY_MAX_CONNECTIONS", default_value = "20")]
    pub max_connections: usize,

    /// Send request bodies uncompressed
    #[arg(long, env = "PROXY_DISABLE_COMPRESSION")]
    pub disable_compression: bool,

    #[arg(long, env = "PROXY_LOG_LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Extra tracing directives such as `RawBlockedPoints=warn`
    #[arg(long = "log-directive", env = "PROXY_LOG_DIRECTIVES", value_delimiter = ',')]
    pub log_directives: Vec<String>,

    /// TOML file replacing command-line settings
    #[arg(long, env = "PROXY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[serde(skip)]
    #[arg(skip)]
    pub flush_interval: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub max_retry_delay: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub traffic_shaping_window: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub shutdown_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub connection_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "http://localhost:2878/".to_string(),
            push_listener_ports: "2878".to_string(),
            trace_listener_ports: None,
            log_listener_ports: None,
            flush_threads: None,
            disable_sharding: false,
            buffer_tier: BufferTier::Disk,
            buffer: PathBuf::from("/var/spool/telemetry-proxy/buffer"),
            buffer_partition_size_mb: 128,
            disable_buffer_compression: false,
            memory_queue_capacity: 10_000,
            memory_overflow_policy: MemoryOverflow::Block,
            purge_buffer: false,
            queueing_level: QueueingLevel::AnyError,
            push_flush_interval_ms: 1000,
            push_flush_max_points: None,
            push_flush_max_histograms: None,
            push_flush_max_spans: None,
            push_flush_max_span_logs: None,
            push_flush_max_logs: None,
            push_memory_buffer_limit: None,
            push_rate_limit: None,
            push_rate_limit_histograms: None,
            push_rate_limit_source_tags: None,
            push_rate_limit_spans: None,
            push_rate_limit_span_logs: None,
            push_rate_limit_events: None,
            push_rate_limit_logs: None,
            push_rate_limit_max_burst_seconds: 10,
            retry_backoff_base_seconds: 2.0,
            max_retry_delay_secs: 300,
            split_push_when_rate_limited: false,
            push_blocked_samples: 5,
            traffic_shaping: false,
            traffic_shaping_window_seconds: 300,
            traffic_shaping_headroom: 1.15,
            export_queue_ports: None,
            export_queue_output_file: None,
            export_queue_retain_data: true,
            queue_identifier: None,
            queue_name_template: DEFAULT_QUEUE_NAME_TEMPLATE.to_string(),
            shutdown_timeout_secs: 10,
            connection_timeout_secs: 10,
            request_timeout_secs: 30,
            max_connections: 20,
            disable_compression: false,
            log_level: LogLevel::Info,
            log_directives: Vec::new(),
            config_file: None,
            flush_interval: Duration::from_millis(1000),
            max_retry_delay: Duration::from_secs(300),
            traffic_shaping_window: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Parses command-line arguments (with environment fallbacks). A
    /// `--config-file`, or else inline TOML in `PROXY_CONFIG`, replaces them.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let parsed = Config::try_parse_from(args)?;

        let mut config = if let Some(path) = &parsed.config_file {
            let mut from_file = Self::load_file(path)?;
            from_file.config_file = Some(path.clone());
            from_file
        } else if let Ok(inline) = std::env::var(CONFIG_ENV) {
            toml::from_str(&inline)?
        } else {
            parsed
        };

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path.as_ref())?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.flush_interval = Duration::from_millis(self.push_flush_interval_ms);
        self.max_retry_delay = Duration::from_secs(self.max_retry_delay_secs);
        self.traffic_shaping_window = Duration::from_secs(self.traffic_shaping_window_seconds);
        self.shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);
        self.connection_timeout = Duration::from_secs(self.connection_timeout_secs);
        self.request_timeout = Duration::from_secs(self.request_timeout_secs);
        Ok(())
    }

    pub fn default_flush_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_FLUSH_THREADS)
            .clamp(MIN_FLUSH_THREADS, MAX_FLUSH_THREADS)
    }

    pub fn shards(&self) -> usize {
        self.flush_threads.unwrap_or_else(Self::default_flush_threads)
    }

    pub(super) fn listener_ports(&self, group: ListenerGroup) -> Result<Vec<String>, ConfigError> {
        let list = match group {
            ListenerGroup::Push => Some(&self.push_listener_ports),
            ListenerGroup::Trace => self.trace_listener_ports.as_ref(),
            ListenerGroup::Log => self.log_listener_ports.as_ref(),
        };
        match list {
            Some(list) => parse_ports(list),
            None => Ok(Vec::new()),
        }
    }

    /// One queue descriptor per (entity type, port) pair of every listener group.
    pub fn pipelines(&self) -> Result<Vec<QueueInfo>, ConfigError> {
        let mut pipelines = Vec::new();
        for group in ListenerGroup::ALL {
            for port in self.listener_ports(group)? {
                for entity in group.entity_types() {
                    let info = QueueInfo::new(
                        HandlerKey::new(*entity, port.clone()),
                        self.shards(),
                        !self.disable_sharding,
                        self.buffer_tier.into(),
                    )
                    .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
                    pipelines.push(info);
                }
            }
        }
        Ok(pipelines)
    }

    pub(super) fn batch_size_override(&self, entity: EntityType) -> Option<usize> {
        match entity {
            EntityType::Points | EntityType::DeltaCounters => self.push_flush_max_points,
            EntityType::Histograms => self.push_flush_max_histograms,
            EntityType::Spans => self.push_flush_max_spans,
            EntityType::SpanLogs => self.push_flush_max_span_logs,
            EntityType::Logs => self.push_flush_max_logs,
            EntityType::SourceTags | EntityType::Events => None,
        }
    }

    pub(super) fn rate_limit_override(&self, entity: EntityType) -> Option<f64> {
        match entity {
            EntityType::Points | EntityType::DeltaCounters => self.push_rate_limit,
            EntityType::Histograms => self.push_rate_limit_histograms,
            EntityType::SourceTags => self.push_rate_limit_source_tags,
            EntityType::Spans => self.push_rate_limit_spans,
            EntityType::SpanLogs => self.push_rate_limit_span_logs,
            EntityType::Events => self.push_rate_limit_events,
            EntityType::Logs => self.push_rate_limit_logs,
        }
    }

    /// Runtime properties of every entity type, seeded from this config.
    pub fn properties(&self) -> PropertiesRegistry {
        let registry = PropertiesRegistry::new();
        for props in registry.iter() {
            let entity = props.entity_type();
            if let Some(batch_size) = self.batch_size_override(entity) {
                props.set_batch_size(batch_size);
                props.set_memory_buffer_limit(batch_size.saturating_mul(DEFAULT_MEMORY_BUFFER_FACTOR));
            }
            if let Some(limit) = self.push_memory_buffer_limit {
                props.set_memory_buffer_limit(limit.max(props.batch_size()));
            }
            if let Some(rate) = self.rate_limit_override(entity) {
                props.set_rate_limit(rate);
            }
            props.set_flush_interval(self.flush_interval);
            props.set_burst_seconds(self.push_rate_limit_max_burst_seconds);
            props.set_queueing_level(self.queueing_level);
            props.set_retry_backoff_base(self.retry_backoff_base_seconds);
            props.set_max_retry_delay(self.max_retry_delay);
            props.set_split_on_rate_limit(self.split_push_when_rate_limited);
            props.set_blocked_samples_per_minute(self.push_blocked_samples);
            props.set_traffic_shaping(self.traffic_shaping);
            props.set_traffic_shaping_window(self.traffic_shaping_window);
            props.set_traffic_shaping_headroom(self.traffic_shaping_headroom);
        }
        registry
    }

    /// `--queue-identifier`, or the host name.
    pub fn queue_identity(&self) -> String {
        self.queue_identifier.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "telemetry-proxy".to_string())
        })
    }

    /// Storage settings for the configured tier. The external tier needs a
    /// queue service client.
    pub fn storage_config(
        &self,
        cloud_queue: Option<Arc<dyn CloudQueueClient>>,
    ) -> Result<StorageConfig, ConfigError> {
        let external = match (self.buffer_tier, cloud_queue) {
            (_, Some(client)) => {
                let mut external = ExternalQueueConfig::new(client, self.queue_identity());
                external.template = QueueNameTemplate::new(self.queue_name_template.clone());
                external.backoff = Backoff {
                    base: self.retry_backoff_base_seconds,
                    max_delay: self.max_retry_delay,
                    jitter: false,
                };
                Some(external)
            }
            (BufferTier::External, None) => {
                return Err(ConfigError::InvalidConfig(
                    "buffer_tier = external requires a queue service client".to_string(),
                ));
            }
            (_, None) => None,
        };

        Ok(StorageConfig {
            memory_capacity: self.memory_queue_capacity,
            overflow_policy: self.memory_overflow_policy.into(),
            journal: JournalConfig {
                directory: self.buffer.clone(),
                partition_size: self.buffer_partition_size_mb.saturating_mul(1024 * 1024),
                compression: !self.disable_buffer_compression,
            },
            external,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.server.clone(),
            timeout: self.request_timeout,
            connection_timeout: self.connection_timeout,
            max_connections: self.max_connections,
            enable_compression: !self.disable_compression,
            ..ClientConfig::default()
        }
    }

    /// Present when the operator asked for an export instead of a normal run.
    pub fn export_request(&self) -> Result<Option<ExportRequest>, ConfigError> {
        let Some(ports) = &self.export_queue_ports else {
            return Ok(None);
        };
        let output = self.export_queue_output_file.clone().ok_or_else(|| {
            ConfigError::InvalidConfig(
                "export_queue_ports requires export_queue_output_file".to_string(),
            )
        })?;

        Ok(Some(ExportRequest {
            ports: PortSelection::parse(ports)?,
            output,
            retain: self.export_queue_retain_data,
        }))
    }
}
