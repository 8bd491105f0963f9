//! A minimal redis list queue to drive the consumer pipeline.
//!
//! Jobs wait in `{prefix}:{name}:wait`, are moved atomically into `{prefix}:{name}:active` when a
//! worker picks them up, and leave `active` once the worker settles them. Retries wait in the
//! `{prefix}:{name}:delayed` sorted set, scored by the epoch millisecond they become due.
use std::sync::Arc;
use std::time;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::job::Job;
use crate::redis::{Client, StoreError};
use crate::retry::RetryPolicy;

/// Enumeration of errors for operations with RedisQueue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue store command failed: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to parse job envelope: {error}")]
    ParseError { error: serde_json::Error },
}

/// Options applied to every job of a queue unless the job says otherwise.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Total number of deliveries a job gets before it is failed for good.
    pub attempts: Option<u32>,
    pub backoff: Option<RetryPolicy>,
}

/// How a queue is registered with the runtime.
/// The consumer pipeline only cares about `concurrency`; the rest shapes the runtime's behaviour.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub name: String,
    pub prefix: String,
    pub concurrency: Option<usize>,
    pub remove_on_complete: Option<bool>,
    pub remove_on_fail: Option<bool>,
    pub default_job_options: Option<JobOptions>,
}

impl QueueConfig {
    pub fn new(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_owned(),
            prefix: prefix.to_owned(),
            concurrency: None,
            remove_on_complete: None,
            remove_on_fail: None,
            default_job_options: None,
        }
    }

    /// The redis key for one of this queue's structures.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.name, suffix)
    }

    /// Maximum number of jobs handled at once. At least one.
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(1).max(1)
    }

    pub fn max_attempts(&self) -> u32 {
        self.default_job_options
            .as_ref()
            .and_then(|options| options.attempts)
            .unwrap_or(1)
            .max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.default_job_options
            .as_ref()
            .and_then(|options| options.backoff)
            .unwrap_or_default()
    }
}

/// A job taken off the queue. Holding the raw envelope lets us remove exactly this delivery from
/// the active list.
#[derive(Debug)]
pub struct ReservedJob {
    pub job: Job,
    envelope: String,
}

/// A queue implemented on top of redis lists.
pub struct RedisQueue {
    client: Arc<dyn Client>,
    config: QueueConfig,
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

impl RedisQueue {
    pub fn new(client: Arc<dyn Client>, config: QueueConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a Job into this RedisQueue.
    pub async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let envelope =
            serde_json::to_string(job).map_err(|error| QueueError::ParseError { error })?;

        self.client.lpush(self.config.key("wait"), envelope).await?;

        Ok(())
    }

    /// Move the oldest waiting job into the active list and return it, if there is one.
    pub async fn dequeue(&self) -> QueueResult<Option<ReservedJob>> {
        let envelope = match self
            .client
            .rpoplpush(self.config.key("wait"), self.config.key("active"))
            .await?
        {
            Some(envelope) => envelope,
            None => return Ok(None),
        };

        match serde_json::from_str::<Job>(&envelope) {
            Ok(job) => Ok(Some(ReservedJob { job, envelope })),
            Err(error) => {
                // An envelope we can't read would otherwise sit in the active list forever.
                warn!(queue = %self.config.name, "moving unreadable envelope to failed list");
                self.client
                    .rpush(self.config.key("failed"), envelope.clone())
                    .await?;
                self.release(&envelope).await?;

                Err(QueueError::ParseError { error })
            }
        }
    }

    /// Acknowledge a job that needs no further deliveries.
    pub async fn complete(&self, reserved: ReservedJob) -> QueueResult<()> {
        if !self.config.remove_on_complete.unwrap_or(true) {
            self.client
                .rpush(self.config.key("completed"), reserved.envelope.clone())
                .await?;
        }

        self.release(&reserved.envelope).await
    }

    /// Give up on a job for good.
    pub async fn fail(&self, reserved: ReservedJob) -> QueueResult<()> {
        if !self.config.remove_on_fail.unwrap_or(false) {
            self.client
                .rpush(self.config.key("failed"), reserved.envelope.clone())
                .await?;
        }

        self.release(&reserved.envelope).await
    }

    /// Schedule the next delivery of a job `delay` from now.
    /// The job is scheduled before it is released, so a crash in between duplicates rather than
    /// loses it; the dedup gate absorbs the duplicate.
    pub async fn retry(&self, reserved: ReservedJob, delay: time::Duration) -> QueueResult<()> {
        let next = serde_json::to_string(&reserved.job.next_attempt())
            .map_err(|error| QueueError::ParseError { error })?;
        let due_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        self.client
            .zadd(self.config.key("delayed"), next, due_at)
            .await?;

        self.release(&reserved.envelope).await
    }

    /// Move every delayed job that is due back into the wait list. Returns how many were moved.
    pub async fn promote_due(&self) -> QueueResult<usize> {
        let now = Utc::now().timestamp_millis();
        let due = self
            .client
            .zrangebyscore(
                self.config.key("delayed"),
                "-inf".to_owned(),
                now.to_string(),
            )
            .await?;

        let mut promoted = 0;
        for envelope in due {
            // Only the worker whose ZREM succeeds promotes the job.
            if self
                .client
                .zrem(self.config.key("delayed"), envelope.clone())
                .await?
            {
                self.client.lpush(self.config.key("wait"), envelope).await?;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    async fn release(&self, envelope: &str) -> QueueResult<()> {
        self.client
            .lrem(self.config.key("active"), 1, envelope.to_owned())
            .await?;

        Ok(())
    }
}
