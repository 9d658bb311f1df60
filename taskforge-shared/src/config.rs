/// Configuration management shared by the scheduler and the session layer.
///
/// Configuration is loaded in layers, lowest priority first: built-in
/// defaults, an optional `taskforge.toml` in the working directory, then
/// `TASKFORGE_*`-prefixed environment variables (double underscore as the
/// nesting separator, e.g. `TASKFORGE_POOL__MAX_THREADS=16`). `.env` files
/// are picked up via `dotenvy` before the environment layer is read, for
/// development convenience.
use config::{Config as ConfigSource, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backpressure policy applied when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    Block,
    Overwrite,
    Exception,
    Drop,
}

/// Which concrete queue shape a pool is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    Fifo,
    Priority,
    Delay,
}

/// Scheduling tactic advertised by the scheduler. The current design uses
/// a single shared queue regardless of tactic; this enum is retained as a
/// configuration surface for future per-tactic sharding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingTactic {
    RoundRobin,
    LeastLoaded,
    Adaptive,
    PriorityBased,
}

/// Pool and autoscaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub core_threads: usize,
    pub initial_threads: usize,
    pub queue_strategy: QueueStrategy,
    pub scheduling_tactic: SchedulingTactic,
    pub max_queue_size: usize,
    pub default_backpressure: BackpressureMode,
    #[serde(with = "duration_secs")]
    pub task_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    pub monitoring_enabled: bool,
    pub profiling_enabled: bool,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(with = "duration_secs")]
    pub scale_up_delay: Duration,
    #[serde(with = "duration_secs")]
    pub scale_down_delay: Duration,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_threads: 2,
            max_threads: 8,
            core_threads: 2,
            initial_threads: 2,
            queue_strategy: QueueStrategy::Fifo,
            scheduling_tactic: SchedulingTactic::RoundRobin,
            max_queue_size: 0,
            default_backpressure: BackpressureMode::Block,
            task_timeout: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(30),
            monitoring_enabled: true,
            profiling_enabled: false,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.4,
            scale_up_delay: Duration::from_secs(1),
            scale_down_delay: Duration::from_secs(5),
            scale_up_step: 1,
            scale_down_step: 1,
        }
    }
}

/// Session configuration (read/write/connect timeouts, heartbeat, TLS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    pub enable_heartbeat: bool,
    pub enable_ssl: bool,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,
    pub ssl_ca_file: Option<String>,
    pub tls_server_name: Option<String>,
    pub ssl_insecure_skip_verify: bool,
    pub max_buffer_size: usize,
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(600),
            enable_heartbeat: true,
            enable_ssl: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            ssl_ca_file: None,
            tls_server_name: None,
            ssl_insecure_skip_verify: false,
            max_buffer_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Per-endpoint connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    #[serde(with = "duration_secs")]
    pub borrow_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        ConnectionPoolConfig {
            min_connections: 0,
            max_connections: 8,
            borrow_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// One configured upstream entry for the forwarder: `{domain, ip, port,
/// https}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEntry {
    pub domain: String,
    #[serde(default)]
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub https: bool,
}

/// Forwarder configuration: the upstream map plus dispatch limits.
///
/// `ssl_ca_file`/`ssl_cert_file`/`ssl_key_file`/`ssl_insecure_skip_verify`
/// carry the forwarder-wide TLS material applied to every HTTPS upstream
/// endpoint it registers with the connection pool, separate from any
/// per-endpoint override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub upstreams: Vec<UpstreamEntry>,
    pub denied_hosts: Vec<String>,
    pub max_in_flight: usize,
    #[serde(with = "duration_secs")]
    pub upstream_wait: Duration,
    pub ssl_ca_file: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,
    pub ssl_insecure_skip_verify: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            upstreams: Vec::new(),
            denied_hosts: Vec::new(),
            max_in_flight: 1024,
            upstream_wait: Duration::from_secs(15),
            ssl_ca_file: None,
            ssl_cert_file: None,
            ssl_key_file: None,
            ssl_insecure_skip_verify: false,
        }
    }
}

/// Top-level runtime configuration, loaded once at process start.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub connection_pool: ConnectionPoolConfig,
    pub forwarder: ForwarderConfig,
}

impl RuntimeConfig {
    /// Loads configuration from defaults, an optional `taskforge.toml`,
    /// and `TASKFORGE_*` environment variables, in that priority order.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable or config file value
    /// cannot be deserialized into the expected shape.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let source = ConfigSource::builder()
            .add_source(ConfigSource::try_from(&RuntimeConfig::default())?)
            .add_source(File::with_name("taskforge").required(false))
            .add_source(Environment::with_prefix("TASKFORGE").separator("__"))
            .build()?;

        Ok(source.try_deserialize()?)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults_are_sane() {
        let config = PoolConfig::default();
        assert_eq!(config.min_threads, 2);
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.scale_up_threshold, 0.8);
        assert_eq!(config.scale_down_threshold, 0.4);
        assert_eq!(config.scale_up_delay, Duration::from_secs(1));
        assert_eq!(config.scale_down_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_session_config_defaults_are_sane() {
        let config = SessionConfig::default();
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(600));
        assert_eq!(config.max_buffer_size, 64 * 1024);
    }

    #[test]
    fn test_connection_pool_config_defaults_are_sane() {
        let config = ConnectionPoolConfig::default();
        assert_eq!(config.borrow_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_forwarder_config_defaults_are_sane() {
        let config = ForwarderConfig::default();
        assert_eq!(config.max_in_flight, 1024);
        assert_eq!(config.upstream_wait, Duration::from_secs(15));
    }

    #[test]
    fn test_runtime_config_load_without_file_uses_defaults() {
        let config = RuntimeConfig::load().expect("default load should succeed");
        assert_eq!(config.pool.min_threads, 2);
    }
}
