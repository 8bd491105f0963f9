use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A Job as delivered by the queue runtime.
/// `data` is the payload exactly as the producer enqueued it; it is only trusted after validation.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Job {
    /// The job identifier. Redeliveries of the same job carry the same id.
    pub id: String,
    /// 1-based count of deliveries of this job, including the current one.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub data: Value,
}

fn first_attempt() -> u32 {
    1
}

impl Job {
    pub fn new(id: &str, data: Value) -> Self {
        Self {
            id: id.to_owned(),
            attempt: first_attempt(),
            data,
        }
    }

    /// The same job, as it will look on its next delivery.
    pub fn next_attempt(&self) -> Self {
        Self {
            id: self.id.clone(),
            attempt: self.attempt + 1,
            data: self.data.clone(),
        }
    }

    /// The `clientId` of the payload, if it carries one, regardless of whether the payload is
    /// otherwise valid.
    pub fn client_id(&self) -> Option<&str> {
        self.data.get("clientId").and_then(Value::as_str)
    }
}

/// A validated, normalized request ready to be handed to a `ProcessingDelegate`.
/// This is also the wire shape producers enqueue: `{ jobId, query, clientId }`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub job_id: String,
    pub query: String,
    pub client_id: String,
}
