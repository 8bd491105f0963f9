use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::job::{Job, JobRequest};

pub const DEFAULT_MAX_QUERY_LENGTH: usize = 1000;

/// Why a payload was rejected. `error` is meant for humans: it is logged, dead-lettered as the
/// failure reason and sent back to the client.
#[derive(Error, Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[error("{error}")]
pub struct ValidationError {
    pub error: String,
    /// The payload field the error refers to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(error: &str) -> Self {
        Self {
            error: error.to_owned(),
            field: None,
        }
    }

    pub fn for_field(field: &str, error: &str) -> Self {
        Self {
            error: error.to_owned(),
            field: Some(field.to_owned()),
        }
    }
}

pub type ValidationResult = Result<JobRequest, ValidationError>;

/// A rule-set deciding whether a raw payload is a well-formed request.
/// Implementations must not touch shared state: the same input always yields the same result.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, job_id: &str, payload: &Value) -> ValidationResult;
}

/// The default rule-set for `{ jobId, query, clientId }` payloads.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    max_query_length: usize,
}

impl RequestValidator {
    pub fn new(max_query_length: usize) -> Self {
        Self { max_query_length }
    }
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUERY_LENGTH)
    }
}

#[async_trait]
impl Validator for RequestValidator {
    async fn validate(&self, job_id: &str, payload: &Value) -> ValidationResult {
        let fields = payload
            .as_object()
            .ok_or_else(|| ValidationError::new("payload must be an object"))?;

        let query = match fields.get("query") {
            Some(Value::String(query)) => query.trim(),
            _ => return Err(ValidationError::for_field("query", "query must be a string")),
        };
        if query.is_empty() {
            return Err(ValidationError::for_field("query", "query must not be empty"));
        }
        if query.chars().count() > self.max_query_length {
            return Err(ValidationError::for_field(
                "query",
                &format!("query must be at most {} characters", self.max_query_length),
            ));
        }

        let client_id = match fields.get("clientId") {
            Some(Value::String(client_id)) if !client_id.trim().is_empty() => client_id.trim(),
            _ => {
                return Err(ValidationError::for_field(
                    "clientId",
                    "clientId must be a non-empty string",
                ))
            }
        };

        match fields.get("jobId") {
            None => {}
            Some(Value::String(id)) if id == job_id => {}
            Some(_) => {
                return Err(ValidationError::for_field(
                    "jobId",
                    "jobId does not match the delivered job",
                ))
            }
        }

        Ok(JobRequest {
            job_id: job_id.to_owned(),
            query: query.to_owned(),
            client_id: client_id.to_owned(),
        })
    }
}

/// Turns a delivered `Job` into a `JobRequest`, or explains why it can't.
pub struct ValidationGate {
    validator: Arc<dyn Validator>,
}

impl ValidationGate {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }

    pub async fn validate(&self, job: &Job) -> ValidationResult {
        let result = self.validator.validate(&job.id, &job.data).await;

        if let Err(error) = &result {
            debug!(field = ?error.field, "payload rejected: {}", error);
        }

        result
    }
}
