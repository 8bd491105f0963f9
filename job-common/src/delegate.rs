use async_trait::async_trait;
use thiserror::Error;

use crate::job::JobRequest;

/// A failure reported by the service doing the actual work. The pipeline treats every one of these
/// as possibly transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessingError {
    message: String,
}

impl ProcessingError {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Performs the domain work for a validated request.
#[async_trait]
pub trait ProcessingDelegate: Send + Sync {
    async fn process(&self, request: &JobRequest) -> Result<(), ProcessingError>;
}
