use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use job_common::queue::{JobOptions, QueueConfig};
use job_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "1000")]
    pub redis_timeout_ms: EnvMsDuration,

    #[envconfig(default = "requests")]
    pub queue_name: NonEmptyString,

    #[envconfig(default = "jobs")]
    pub queue_prefix: NonEmptyString,

    #[envconfig(default = "10")]
    pub concurrency: usize,

    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "86400")]
    pub dedup_ttl_seconds: u64,

    #[envconfig(default = "1000")]
    pub max_query_length: usize,

    #[envconfig(default = "http://localhost:8000/process")]
    pub processing_url: String,

    #[envconfig(default = "30000")]
    pub processing_timeout: EnvMsDuration,

    #[envconfig(default = "true")]
    pub remove_on_complete: bool,

    #[envconfig(default = "false")]
    pub remove_on_fail: bool,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dedup_ttl(&self) -> time::Duration {
        time::Duration::from_secs(self.dedup_ttl_seconds)
    }

    /// The queue registration handed to the runtime.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            name: self.queue_name.as_str().to_owned(),
            prefix: self.queue_prefix.as_str().to_owned(),
            concurrency: Some(self.concurrency),
            remove_on_complete: Some(self.remove_on_complete),
            remove_on_fail: Some(self.remove_on_fail),
            default_job_options: Some(JobOptions {
                attempts: Some(self.retry_policy.max_attempts),
                backoff: Some(RetryPolicy::new(
                    self.retry_policy.backoff_coefficient,
                    self.retry_policy.initial_interval.0,
                    Some(self.retry_policy.maximum_interval.0),
                )),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "3")]
    pub max_attempts: u32,

    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
