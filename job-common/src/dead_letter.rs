use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::Job;
use crate::queue::QueueConfig;
use crate::redis::{Client, StoreError};

/// A failure kept for inspection or replay. Entries are only ever appended: a job that fails
/// several times leaves several entries.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub queue_name: String,
    pub job_id: String,
    pub reason: String,
    pub original_payload: Value,
    pub attempt: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(queue_name: &str, job: &Job, reason: &str) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            job_id: job.id.clone(),
            reason: reason.to_owned(),
            original_payload: job.data.clone(),
            attempt: job.attempt,
            failed_at: Utc::now(),
        }
    }
}

/// Durably records failed jobs.
#[async_trait]
pub trait DeadLetterRouter: Send + Sync {
    async fn record(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;
}

/// Dead-letter entries appended as JSON to the `{prefix}:{queue}:dead-letter` list.
pub struct RedisDeadLetterStore {
    client: Arc<dyn Client>,
    key: String,
}

impl RedisDeadLetterStore {
    pub fn new(client: Arc<dyn Client>, queue: &QueueConfig) -> Self {
        Self {
            client,
            key: queue.key("dead-letter"),
        }
    }

    /// Read back the entries between `start` and `stop` (inclusive, negative counts from the end),
    /// oldest first. Entries that no longer parse are skipped.
    pub async fn entries(
        &self,
        start: isize,
        stop: isize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let raw = self.client.lrange(self.key.clone(), start, stop).await?;

        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.client.llen(self.key.clone()).await
    }
}

#[async_trait]
impl DeadLetterRouter for RedisDeadLetterStore {
    async fn record(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(entry)?;

        self.client.rpush(self.key.clone(), serialized).await
    }
}
