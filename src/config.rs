use std::time::Duration;

use envconfig::Envconfig;

/// Gateway service configuration, loaded from the environment.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Comma-separated bootstrap broker addresses.
    #[envconfig(from = "KAFKA_BROKERS", default = "127.0.0.1:9092")]
    pub brokers: String,

    /// Address to serve the API on. Contains a colon for TCP, otherwise it
    /// is treated as a UNIX domain socket path.
    #[envconfig(from = "LISTEN_ADDR", default = "127.0.0.1:19092")]
    pub listen_addr: String,

    /// Client id reported to brokers in request headers.
    #[envconfig(from = "CLIENT_ID", default = "kafkagate")]
    pub client_id: String,

    #[envconfig(from = "FETCH_DEFAULT_BYTES", default = "1048576")]
    pub fetch_default_bytes: i32,

    /// Upper bound for the adaptive fetch size. Zero means unbounded.
    #[envconfig(from = "FETCH_MAX_BYTES", default = "0")]
    pub fetch_max_bytes: i32,

    #[envconfig(from = "FETCH_MIN_BYTES", default = "1")]
    pub fetch_min_bytes: i32,

    /// How long a broker may hold a fetch waiting for min_bytes.
    #[envconfig(from = "FETCH_MAX_WAIT_MS", default = "250")]
    pub fetch_max_wait_ms: u64,

    /// Backoff applied to broker reconnects, reassignment retries and the
    /// fetch circuit breaker.
    #[envconfig(from = "RETRY_BACKOFF_MS", default = "500")]
    pub retry_backoff_ms: u64,

    /// Capacity of the per-partition messages and errors channels.
    #[envconfig(from = "CHANNEL_BUFFER_SIZE", default = "256")]
    pub channel_buffer_size: usize,

    /// When false, consume errors are only logged and never delivered on
    /// the errors channel.
    #[envconfig(from = "RETURN_ERRORS", default = "true")]
    pub return_errors: bool,

    /// How long a consume API request waits for a message before 408.
    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "3000")]
    pub request_timeout_ms: u64,

    /// Maximum concurrent consume requests waiting on one partition
    /// before the API answers 429.
    #[envconfig(from = "MAX_PENDING_REQUESTS", default = "64")]
    pub max_pending_requests: usize,
}

impl Config {
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            fetch_default_bytes: self.fetch_default_bytes,
            fetch_max_bytes: self.fetch_max_bytes,
            fetch_min_bytes: self.fetch_min_bytes,
            fetch_max_wait: Duration::from_millis(self.fetch_max_wait_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            channel_buffer_size: self.channel_buffer_size,
            return_errors: self.return_errors,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Tuning knobs consumed by the consumer subsystem. Kept separate from
/// `Config` so the core never reads the environment.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub fetch_default_bytes: i32,
    pub fetch_max_bytes: i32,
    pub fetch_min_bytes: i32,
    pub fetch_max_wait: Duration,
    pub retry_backoff: Duration,
    pub channel_buffer_size: usize,
    pub return_errors: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            fetch_default_bytes: 1024 * 1024,
            fetch_max_bytes: 0,
            fetch_min_bytes: 1,
            fetch_max_wait: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(500),
            channel_buffer_size: 256,
            return_errors: true,
        }
    }
}
