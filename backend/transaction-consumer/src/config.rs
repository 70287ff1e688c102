use idempotent_consumer::ConsumerConfig;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Deserialize)]
pub struct Config {
    pub rabbitmq_url: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Unacknowledged deliveries allowed per worker channel
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Period of the counter summary log line
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_queue_name() -> String {
    "transactions_queue".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_prefetch() -> u16 {
    100
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_http_port() -> u16 {
    8081
}

fn default_stats_interval_secs() -> u64 {
    5
}

fn default_connect_attempts() -> u32 {
    5
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("rabbitmq_url", &"<redacted>")
            .field("queue_name", &self.queue_name)
            .field("workers", &self.workers)
            .field("prefetch", &self.prefetch)
            .field("batch_size", &self.batch_size)
            .field("flush_interval_ms", &self.flush_interval_ms)
            .field("http_port", &self.http_port)
            .field("stats_interval_secs", &self.stats_interval_secs)
            .field("connect_attempts", &self.connect_attempts)
            .finish()
    }
}

fn at_least_one(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

impl Config {
    /// Load from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::from_iter(vars)?;

        if config.rabbitmq_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "RABBITMQ_URL",
                reason: "must not be empty".to_string(),
            });
        }
        at_least_one("WORKERS", config.workers as u64)?;
        at_least_one("PREFETCH", config.prefetch as u64)?;
        at_least_one("BATCH_SIZE", config.batch_size as u64)?;
        at_least_one("FLUSH_INTERVAL_MS", config.flush_interval_ms)?;
        at_least_one("STATS_INTERVAL_SECS", config.stats_interval_secs)?;

        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.queue_name.clone(),
            workers: self.workers,
            prefetch: self.prefetch,
            batch_size: self.batch_size,
            flush_interval: self.flush_interval(),
        }
    }
}
