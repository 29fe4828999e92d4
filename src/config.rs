use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::evaluator::EvaluationError;

/// Engine-wide configuration. Every field has a default so an empty
/// JSON object is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub source: SourceConfig,

    /// Capacity of the broadcast channel that fans an evaluation's
    /// outcome out to coalesced concurrent readers.
    #[serde(default = "default_reply_buffer_size")]
    pub reply_buffer_size: usize,
}

/// Sandbox limits applied to every handler call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Fuel budget per handler call; exhaustion traps and is reported as
    /// a step error.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    /// Wall-clock deadline per handler call.
    #[serde(default = "default_call_deadline", with = "duration_ms")]
    pub call_deadline: Duration,

    /// Linear memory cap per instantiation.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,

    /// Granularity of the deadline clock. The deadline is rounded up to
    /// a whole number of ticks.
    #[serde(default = "default_epoch_tick", with = "duration_ms")]
    pub epoch_tick: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            gas_limit: default_gas_limit(),
            call_deadline: default_call_deadline(),
            max_memory_bytes: default_max_memory_bytes(),
            epoch_tick: default_epoch_tick(),
        }
    }
}

/// Bounded exponential backoff for transient I/O (interaction pages,
/// cache writes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay", with = "duration_ms")]
    pub initial_delay: Duration,

    #[serde(default = "default_max_delay", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based): doubles each
    /// attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Number of interactions requested from the scheduler per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            retry: RetryConfig::default(),
            source: SourceConfig::default(),
            reply_buffer_size: default_reply_buffer_size(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EvaluationError> {
        let file = File::open(path.as_ref()).map_err(|e| {
            EvaluationError::Configuration(format!("failed to open config file: {}", e))
        })?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| {
            EvaluationError::Configuration(format!("failed to parse config file: {}", e))
        })
    }

    pub fn from_str(s: &str) -> Result<Self, EvaluationError> {
        serde_json::from_str(s)
            .map_err(|e| EvaluationError::Configuration(format!("failed to parse config: {}", e)))
    }
}

fn default_gas_limit() -> u64 {
    1_000_000_000
}
fn default_call_deadline() -> Duration {
    Duration::from_secs(5)
}
fn default_max_memory_bytes() -> usize {
    256 * 1024 * 1024
}
fn default_epoch_tick() -> Duration {
    Duration::from_millis(10)
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_page_size() -> usize {
    50
}
fn default_reply_buffer_size() -> usize {
    16
}

// Duration (de)serialization helper, milliseconds on the wire.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
