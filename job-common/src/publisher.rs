use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::redis::{Client, StoreError};
use crate::validation::ValidationError;

/// What a client waiting on a job is told when its request is rejected.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: String,
    /// Absent when the payload was too malformed to name its client.
    pub client_id: Option<String>,
    pub error: ValidationError,
}

/// Delivers a job's outcome to whoever is awaiting it.
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
    async fn publish(&self, response: &JobResponse) -> Result<(), StoreError>;
}

/// Publishes responses as JSON on a redis pub/sub channel.
pub struct RedisResponsePublisher {
    client: Arc<dyn Client>,
    channel: String,
}

impl RedisResponsePublisher {
    pub fn new(client: Arc<dyn Client>, channel: &str) -> Self {
        Self {
            client,
            channel: channel.to_owned(),
        }
    }
}

#[async_trait]
impl ResponsePublisher for RedisResponsePublisher {
    async fn publish(&self, response: &JobResponse) -> Result<(), StoreError> {
        let message = serde_json::to_string(response)?;

        self.client.publish(self.channel.clone(), message).await
    }
}
