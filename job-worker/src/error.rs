use job_common::queue::QueueError;
use job_common::redis::StoreError;
use thiserror::Error;

/// Enumeration of errors related to initialization and consumption of jobs.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to connect to the store: {0}")]
    StoreConnectionError(#[from] StoreError),
    #[error("an error occurred in the underlying queue: {0}")]
    QueueError(#[from] QueueError),
    #[error("error parsing processing url: {0}")]
    ParseUrlError(url::ParseError),
    #[error("failed to build http client: {0}")]
    HttpClientError(reqwest::Error),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
}
