use crate::domain::EntityType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// How aggressively failed or overflowing batches are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueingLevel {
    /// Never persist; drop on failure after logging.
    Memory,
    /// Block producers when the memory tier is full, persist on backend failures.
    Pushback,
    /// Persist on every failure, including local rate limiting and overflow.
    AnyError,
}

impl QueueingLevel {
    fn to_u8(self) -> u8 {
        match self {
            QueueingLevel::Memory => 0,
            QueueingLevel::Pushback => 1,
            QueueingLevel::AnyError => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueingLevel::Memory,
            1 => QueueingLevel::Pushback,
            _ => QueueingLevel::AnyError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueingLevel::Memory => "MEMORY",
            QueueingLevel::Pushback => "PUSHBACK",
            QueueingLevel::AnyError => "ANY_ERROR",
        }
    }
}

impl fmt::Display for QueueingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueingLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "MEMORY" => Ok(QueueingLevel::Memory),
            "PUSHBACK" => Ok(QueueingLevel::Pushback),
            "ANY_ERROR" => Ok(QueueingLevel::AnyError),
            other => Err(format!("unknown queueing level: {other}")),
        }
    }
}

/// f64 stored as raw bits so it can be swapped atomically.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MEMORY_BUFFER_FACTOR: usize = 16;
pub const DEFAULT_BURST_SECONDS: u64 = 10;
pub const DEFAULT_RETRY_BACKOFF_BASE: f64 = 2.0;
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(300);
pub const DEFAULT_BLOCKED_SAMPLES_PER_MINUTE: u64 = 5;
pub const DEFAULT_SHAPING_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_SHAPING_HEADROOM: f64 = 1.15;

/// Runtime properties of one entity type.
///
/// Every field is its own atomic: sender workers read without locking while
/// a refresh path swaps single fields. A reader never observes a torn value,
/// and concurrent writers to the same field resolve last-writer-wins.
#[derive(Debug)]
pub struct EntityProperties {
    entity_type: EntityType,
    batch_size: AtomicUsize,
    memory_buffer_limit: AtomicUsize,
    flush_interval_ms: AtomicU64,
    rate_limit: AtomicF64,
    burst_seconds: AtomicU64,
    queueing_level: AtomicU8,
    retry_backoff_base: AtomicF64,
    max_retry_delay_ms: AtomicU64,
    split_on_rate_limit: AtomicBool,
    traffic_shaping: AtomicBool,
    traffic_shaping_window_secs: AtomicU64,
    traffic_shaping_headroom: AtomicF64,
    blocked_samples_per_minute: AtomicU64,
}

impl EntityProperties {
    pub fn new(entity_type: EntityType) -> Self {
        let batch_size = entity_type.default_batch_size();
        Self {
            entity_type,
            batch_size: AtomicUsize::new(batch_size),
            memory_buffer_limit: AtomicUsize::new(batch_size * DEFAULT_MEMORY_BUFFER_FACTOR),
            flush_interval_ms: AtomicU64::new(DEFAULT_FLUSH_INTERVAL.as_millis() as u64),
            rate_limit: AtomicF64::new(entity_type.default_rate_limit()),
            burst_seconds: AtomicU64::new(DEFAULT_BURST_SECONDS),
            queueing_level: AtomicU8::new(QueueingLevel::AnyError.to_u8()),
            retry_backoff_base: AtomicF64::new(DEFAULT_RETRY_BACKOFF_BASE),
            max_retry_delay_ms: AtomicU64::new(DEFAULT_MAX_RETRY_DELAY.as_millis() as u64),
            split_on_rate_limit: AtomicBool::new(false),
            traffic_shaping: AtomicBool::new(false),
            traffic_shaping_window_secs: AtomicU64::new(DEFAULT_SHAPING_WINDOW.as_secs()),
            traffic_shaping_headroom: AtomicF64::new(DEFAULT_SHAPING_HEADROOM),
            blocked_samples_per_minute: AtomicU64::new(DEFAULT_BLOCKED_SAMPLES_PER_MINUTE),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Never stored as zero; a zero batch size would stall the sender.
    pub fn set_batch_size(&self, value: usize) {
        self.batch_size.store(value.max(1), Ordering::Relaxed);
    }

    pub fn memory_buffer_limit(&self) -> usize {
        self.memory_buffer_limit.load(Ordering::Relaxed)
    }

    pub fn set_memory_buffer_limit(&self, value: usize) {
        self.memory_buffer_limit.store(value.max(1), Ordering::Relaxed);
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_flush_interval(&self, value: Duration) {
        let millis = (value.as_millis() as u64).max(1);
        self.flush_interval_ms.store(millis, Ordering::Relaxed);
    }

    /// Items per second; 0.0 means unlimited.
    pub fn rate_limit(&self) -> f64 {
        self.rate_limit.load()
    }

    pub fn set_rate_limit(&self, value: f64) {
        let value = if value.is_finite() && value > 0.0 { value } else { 0.0 };
        self.rate_limit.store(value);
    }

    pub fn burst_seconds(&self) -> u64 {
        self.burst_seconds.load(Ordering::Relaxed)
    }

    pub fn set_burst_seconds(&self, value: u64) {
        self.burst_seconds.store(value.max(1), Ordering::Relaxed);
    }

    pub fn queueing_level(&self) -> QueueingLevel {
        QueueingLevel::from_u8(self.queueing_level.load(Ordering::Relaxed))
    }

    pub fn set_queueing_level(&self, value: QueueingLevel) {
        self.queueing_level.store(value.to_u8(), Ordering::Relaxed);
    }

    pub fn retry_backoff_base(&self) -> f64 {
        self.retry_backoff_base.load()
    }

    pub fn set_retry_backoff_base(&self, value: f64) {
        let value = if value.is_finite() && value >= 1.0 { value } else { 1.0 };
        self.retry_backoff_base.store(value);
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_max_retry_delay(&self, value: Duration) {
        self.max_retry_delay_ms
            .store(value.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn split_on_rate_limit(&self) -> bool {
        self.split_on_rate_limit.load(Ordering::Relaxed)
    }

    pub fn set_split_on_rate_limit(&self, value: bool) {
        self.split_on_rate_limit.store(value, Ordering::Relaxed);
    }

    pub fn traffic_shaping(&self) -> bool {
        self.traffic_shaping.load(Ordering::Relaxed)
    }

    pub fn set_traffic_shaping(&self, value: bool) {
        self.traffic_shaping.store(value, Ordering::Relaxed);
    }

    pub fn traffic_shaping_window(&self) -> Duration {
        Duration::from_secs(self.traffic_shaping_window_secs.load(Ordering::Relaxed))
    }

    pub fn set_traffic_shaping_window(&self, value: Duration) {
        self.traffic_shaping_window_secs
            .store(value.as_secs().max(1), Ordering::Relaxed);
    }

    pub fn traffic_shaping_headroom(&self) -> f64 {
        self.traffic_shaping_headroom.load()
    }

    pub fn set_traffic_shaping_headroom(&self, value: f64) {
        let value = if value.is_finite() && value > 0.0 {
            value
        } else {
            DEFAULT_SHAPING_HEADROOM
        };
        self.traffic_shaping_headroom.store(value);
    }

    pub fn blocked_samples_per_minute(&self) -> u64 {
        self.blocked_samples_per_minute.load(Ordering::Relaxed)
    }

    pub fn set_blocked_samples_per_minute(&self, value: u64) {
        self.blocked_samples_per_minute.store(value, Ordering::Relaxed);
    }

    /// Consistent-enough copy of all fields for logging and export.
    pub fn snapshot(&self) -> PropertiesSnapshot {
        PropertiesSnapshot {
            entity_type: self.entity_type,
            batch_size: self.batch_size(),
            memory_buffer_limit: self.memory_buffer_limit(),
            flush_interval_ms: self.flush_interval().as_millis() as u64,
            rate_limit: self.rate_limit(),
            burst_seconds: self.burst_seconds(),
            queueing_level: self.queueing_level(),
            retry_backoff_base: self.retry_backoff_base(),
            max_retry_delay_ms: self.max_retry_delay().as_millis() as u64,
            split_on_rate_limit: self.split_on_rate_limit(),
            traffic_shaping: self.traffic_shaping(),
            traffic_shaping_window_secs: self.traffic_shaping_window().as_secs(),
            traffic_shaping_headroom: self.traffic_shaping_headroom(),
            blocked_samples_per_minute: self.blocked_samples_per_minute(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertiesSnapshot {
    pub entity_type: EntityType,
    pub batch_size: usize,
    pub memory_buffer_limit: usize,
    pub flush_interval_ms: u64,
    pub rate_limit: f64,
    pub burst_seconds: u64,
    pub queueing_level: QueueingLevel,
    pub retry_backoff_base: f64,
    pub max_retry_delay_ms: u64,
    pub split_on_rate_limit: bool,
    pub traffic_shaping: bool,
    pub traffic_shaping_window_secs: u64,
    pub traffic_shaping_headroom: f64,
    pub blocked_samples_per_minute: u64,
}
