use std::sync::Arc;
use std::time;

use job_common::health::HealthHandle;
use job_common::pipeline::{ConsumerPipeline, Outcome};
use job_common::queue::{QueueError, RedisQueue, ReservedJob};
use tokio::sync;
use tracing::{error, warn};

use crate::error::WorkerError;

/// A worker to poll a `RedisQueue` and spawn tasks to run jobs through the `ConsumerPipeline`.
pub struct JobWorker {
    /// An identifier for this worker, used in logs.
    name: String,
    /// The queue we will be dequeuing jobs from.
    queue: Arc<RedisQueue>,
    /// The pipeline every job goes through.
    pipeline: Arc<ConsumerPipeline>,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl JobWorker {
    pub fn new(
        name: &str,
        queue: Arc<RedisQueue>,
        pipeline: Arc<ConsumerPipeline>,
        poll_interval: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            pipeline,
            poll_interval,
            liveness,
        }
    }

    /// Wait until a job becomes available in our queue.
    /// Delayed retries that are due are moved back into the queue on every poll.
    async fn wait_for_job(&self) -> Result<ReservedJob, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            self.queue.promote_due().await?;

            match self.queue.dequeue().await {
                Ok(Some(reserved)) => return Ok(reserved),
                Ok(None) => continue,
                Err(QueueError::ParseError { error }) => {
                    warn!(worker = %self.name, "skipping unreadable job: {}", error);
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let max_concurrent_jobs = self.queue.config().concurrency();
        let semaphore = Arc::new(sync::Semaphore::new(max_concurrent_jobs));
        let labels = [("queue", self.queue.config().name.clone())];
        let report_semaphore_utilization = || {
            metrics::gauge!("worker_saturation_percent", &labels)
                .set(1f64 - semaphore.available_permits() as f64 / max_concurrent_jobs as f64);
        };

        loop {
            report_semaphore_utilization();
            let reserved = self.wait_for_job().await?;
            spawn_job_processing_task(
                self.queue.clone(),
                self.pipeline.clone(),
                semaphore.clone(),
                reserved,
            )
            .await;
        }
    }
}

/// Spawn a Tokio task to process a job once we successfully acquire a permit.
///
/// # Arguments
///
/// * `queue`: The queue the job was taken from, used to settle it once handled.
/// * `pipeline`: The pipeline to run the job through.
/// * `semaphore`: Bounds the number of jobs in flight. This function will panic if this semaphore is closed.
/// * `reserved`: The job as dequeued from `job_common::queue::RedisQueue`.
async fn spawn_job_processing_task(
    queue: Arc<RedisQueue>,
    pipeline: Arc<ConsumerPipeline>,
    semaphore: Arc<sync::Semaphore>,
    reserved: ReservedJob,
) -> tokio::task::JoinHandle<Result<(), WorkerError>> {
    let permit = semaphore
        .acquire_owned()
        .await
        .expect("semaphore has been closed");

    tokio::spawn(async move {
        let outcome = pipeline.handle(&reserved.job).await;
        let result = settle_job(&queue, reserved, outcome).await;
        drop(permit);
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                error!("failed to settle job: {}", error);
                Err(error)
            }
        }
    })
}

/// Tell the queue what to do with a job the pipeline has handled.
///
/// Skipped and successful jobs are completed. A retryable failure is scheduled for redelivery with
/// the queue's backoff as long as the job has attempts left; every other failure fails the job.
async fn settle_job(
    queue: &RedisQueue,
    reserved: ReservedJob,
    outcome: Outcome,
) -> Result<(), WorkerError> {
    let config = queue.config();
    let labels = [("queue", config.name.clone())];

    match outcome {
        Outcome::Skipped | Outcome::Success => queue.complete(reserved).await?,
        Outcome::Failure {
            retryable: true, ..
        } if reserved.job.attempt < config.max_attempts() => {
            let delay = config.retry_policy().retry_interval(reserved.job.attempt);
            queue.retry(reserved, delay).await?;

            metrics::counter!("worker_jobs_retried", &labels).increment(1);
        }
        Outcome::Failure { error, retryable } => {
            if retryable {
                warn!(
                    job_id = %reserved.job.id,
                    attempt = reserved.job.attempt,
                    "job ran out of attempts: {}",
                    error
                );
                metrics::counter!("worker_jobs_exhausted", &labels).increment(1);
            }
            queue.fail(reserved).await?;
        }
    }

    Ok(())
}
