use std::time;

use async_trait::async_trait;
use job_common::delegate::{ProcessingDelegate, ProcessingError};
use job_common::job::JobRequest;
use reqwest::header;

use crate::error::WorkerError;

/// Hands validated requests to the processing service over HTTP.
pub struct HttpProcessingDelegate {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpProcessingDelegate {
    pub fn new(url: &str, request_timeout: time::Duration) -> Result<Self, WorkerError> {
        let url: reqwest::Url = url.parse().map_err(WorkerError::ParseUrlError)?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("job-worker")
            .timeout(request_timeout)
            .build()
            .map_err(WorkerError::HttpClientError)?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl ProcessingDelegate for HttpProcessingDelegate {
    async fn process(&self, request: &JobRequest) -> Result<(), ProcessingError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(request)
            .send()
            .await
            .map_err(|error| processing_error(&error))?;

        match response.error_for_status() {
            Ok(_) => Ok(()),
            Err(error) => Err(processing_error(&error)),
        }
    }
}

/// Describe a failed request the way it ends up in the dead-letter store.
fn processing_error(error: &reqwest::Error) -> ProcessingError {
    if error.is_timeout() {
        ProcessingError::new("upstream timeout")
    } else if let Some(status) = error.status() {
        ProcessingError::new(&format!(
            "upstream responded with status {}",
            status.as_u16()
        ))
    } else {
        ProcessingError::new(&error.to_string())
    }
}
