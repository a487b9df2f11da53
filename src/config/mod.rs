/// Configuration management for the Flowline runtime
///
/// Handles worker wiring, queue consumer tuning and engine limits. Every value
/// can be overridden with a `FLOWLINE_*` environment variable.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub worker: WorkerConfig,
    pub consumer: ConsumerConfig,
    pub engine: EngineConfig,
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Directory of `*.json` workflow definitions loaded at startup
    pub workflows_dir: String,
    /// Name of the execution queue
    pub queue_name: String,
    /// Receives after which the transport moves a message to the dead-letter list
    pub dead_letter_after: u32,
    /// Finished execution records kept in the ledger before the oldest are evicted
    pub ledger_capacity: usize,
}

/// Queue consumer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Messages requested per receive call (1..=10)
    pub max_messages_per_poll: usize,
    /// Long-poll wait per receive call (0..=20 s)
    pub wait_time: Duration,
    /// How long a received message stays hidden from other receivers
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is discarded unprocessed
    pub max_retries: u32,
    /// Upper bound on a single handler invocation
    pub process_timeout: Duration,
    /// Pause after an empty or failed receive
    pub poll_interval: Duration,
    pub concurrent_workers: usize,
    pub delete_after_process: bool,
}

/// Graph interpreter limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_subworkflow_depth: u32,
    /// Default concurrency for parallel nodes without `max_concurrency`
    pub max_parallel_branches: usize,
    /// Default ceiling for loop nodes without `max_iterations`
    pub max_loop_iterations: usize,
    pub http_timeout: Duration,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            consumer: ConsumerConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workflows_dir: std::env::var("FLOWLINE_WORKFLOWS_DIR").unwrap_or_else(|_| "workflows".to_string()),
            queue_name: std::env::var("FLOWLINE_QUEUE_NAME").unwrap_or_else(|_| "workflow-executions".to_string()),
            dead_letter_after: env_or("FLOWLINE_DEAD_LETTER_AFTER", 5),
            ledger_capacity: env_or("FLOWLINE_LEDGER_CAPACITY", 10_000),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_messages_per_poll: env_or("FLOWLINE_MAX_MESSAGES_PER_POLL", 10),
            wait_time: env_secs("FLOWLINE_WAIT_TIME_SECS", 20),
            visibility_timeout: env_secs("FLOWLINE_VISIBILITY_TIMEOUT_SECS", 30),
            max_retries: env_or("FLOWLINE_MAX_RETRIES", 3),
            process_timeout: env_secs("FLOWLINE_PROCESS_TIMEOUT_SECS", 300),
            poll_interval: Duration::from_millis(env_or("FLOWLINE_POLL_INTERVAL_MS", 1000)),
            concurrent_workers: env_or("FLOWLINE_CONCURRENT_WORKERS", 4),
            delete_after_process: env_or("FLOWLINE_DELETE_AFTER_PROCESS", true),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_subworkflow_depth: env_or("FLOWLINE_MAX_SUBWORKFLOW_DEPTH", 10),
            max_parallel_branches: env_or("FLOWLINE_MAX_PARALLEL_BRANCHES", 8),
            max_loop_iterations: env_or("FLOWLINE_MAX_LOOP_ITERATIONS", 1000),
            http_timeout: env_secs("FLOWLINE_HTTP_TIMEOUT_SECS", 30),
        }
    }
}
