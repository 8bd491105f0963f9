//! The consumer side of the job queue.
//!
//! Every delivered job goes through the same gates, one after the other:
//!
//! 1. The dedup gate. A job id that was already admitted within the dedup window is skipped.
//! 2. The validation gate. An invalid payload is reported back to its client, dead-lettered and
//!    failed without retry: its redeliveries are absorbed by the dedup gate anyway.
//! 3. The processing delegate. A failure here is dead-lettered and failed as retryable, so the
//!    queue runtime redelivers the job according to its own backoff.
//!
//! The pipeline never retries anything itself and keeps no state of its own.
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::dead_letter::{DeadLetterEntry, DeadLetterRouter};
use crate::dedup::DedupGate;
use crate::delegate::{ProcessingDelegate, ProcessingError};
use crate::job::Job;
use crate::publisher::{JobResponse, ResponsePublisher};
use crate::redis::StoreError;
use crate::validation::{ValidationError, ValidationGate};

/// Enumeration of the ways handling a job can fail.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("job payload is invalid: {0}")]
    Validation(#[from] ValidationError),
    #[error("job processing failed: {0}")]
    Processing(#[from] ProcessingError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl PipelineError {
    /// Whether another delivery of the same job could succeed.
    /// An unreachable dedup store fails closed: the job is retried rather than dropped.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Validation(_) => false,
            PipelineError::Processing(_) => true,
            PipelineError::StoreUnavailable(_) => true,
        }
    }
}

/// What the queue runtime should do with a job after the pipeline has handled it.
#[derive(Debug)]
pub enum Outcome {
    /// The job was already admitted within the dedup window. Not a failure.
    Skipped,
    Success,
    /// The job failed. `retryable` tells the runtime whether a redelivery could help.
    Failure {
        error: PipelineError,
        retryable: bool,
    },
}

impl Outcome {
    fn failure(error: PipelineError) -> Self {
        let retryable = error.is_retryable();
        Outcome::Failure { error, retryable }
    }
}

/// Drives each delivered job through dedup, validation and processing.
pub struct ConsumerPipeline {
    queue_name: String,
    dedup: DedupGate,
    validation: ValidationGate,
    processor: Arc<dyn ProcessingDelegate>,
    dead_letter: Arc<dyn DeadLetterRouter>,
    publisher: Arc<dyn ResponsePublisher>,
}

impl ConsumerPipeline {
    pub fn new(
        queue_name: &str,
        dedup: DedupGate,
        validation: ValidationGate,
        processor: Arc<dyn ProcessingDelegate>,
        dead_letter: Arc<dyn DeadLetterRouter>,
        publisher: Arc<dyn ResponsePublisher>,
    ) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            dedup,
            validation,
            processor,
            dead_letter,
            publisher,
        }
    }

    /// Handle one delivery of `job`. Each step is awaited before the next one starts, and every
    /// log line emitted while handling it carries the job id.
    pub async fn handle(&self, job: &Job) -> Outcome {
        let span = info_span!(
            "handle_job",
            queue = %self.queue_name,
            job_id = %job.id,
            attempt = job.attempt
        );

        self.run_gates(job).instrument(span).await
    }

    async fn run_gates(&self, job: &Job) -> Outcome {
        let labels = [("queue", self.queue_name.clone())];
        metrics::counter!("consumer_jobs_total", &labels).increment(1);

        match self.dedup.admit(&job.id).await {
            Ok(true) => {}
            Ok(false) => {
                info!("job was already admitted, skipping");
                metrics::counter!("consumer_jobs_skipped", &labels).increment(1);
                return Outcome::Skipped;
            }
            Err(store_error) => {
                error!("dedup store unavailable: {}", store_error);
                metrics::counter!("consumer_jobs_failed", &labels).increment(1);
                return Outcome::failure(PipelineError::StoreUnavailable(store_error));
            }
        }

        let request = match self.validation.validate(job).await {
            Ok(request) => request,
            Err(validation_error) => {
                warn!("rejecting invalid job: {}", validation_error);
                self.publish_rejection(job, &validation_error).await;
                self.route_to_dead_letter(job, &validation_error.error).await;
                metrics::counter!("consumer_jobs_rejected", &labels).increment(1);
                return Outcome::failure(PipelineError::Validation(validation_error));
            }
        };

        let now = Instant::now();
        let result = self.processor.process(&request).await;
        let elapsed = now.elapsed().as_secs_f64();
        metrics::histogram!("consumer_jobs_processing_duration_seconds", &labels).record(elapsed);

        match result {
            Ok(()) => {
                info!(elapsed, "job processed");
                metrics::counter!("consumer_jobs_completed", &labels).increment(1);
                Outcome::Success
            }
            Err(processing_error) => {
                error!("job processing failed: {}", processing_error);
                self.route_to_dead_letter(job, processing_error.message()).await;
                metrics::counter!("consumer_jobs_failed", &labels).increment(1);
                Outcome::failure(PipelineError::Processing(processing_error))
            }
        }
    }

    /// Record a failure for later inspection. A failure to record is logged and counted but never
    /// replaces the failure being recorded.
    async fn route_to_dead_letter(&self, job: &Job, reason: &str) {
        let entry = DeadLetterEntry::new(&self.queue_name, job, reason);

        if let Err(store_error) = self.dead_letter.record(&entry).await {
            error!(reason, "failed to record dead-letter entry: {}", store_error);
            metrics::counter!(
                "consumer_dead_letter_errors",
                &[("queue", self.queue_name.clone())]
            )
            .increment(1);
        }
    }

    async fn publish_rejection(&self, job: &Job, validation_error: &ValidationError) {
        let response = JobResponse {
            job_id: job.id.clone(),
            client_id: job.client_id().map(str::to_owned),
            error: validation_error.clone(),
        };

        if let Err(store_error) = self.publisher.publish(&response).await {
            warn!("failed to publish validation error: {}", store_error);
            metrics::counter!(
                "consumer_response_publish_errors",
                &[("queue", self.queue_name.clone())]
            )
            .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::dead_letter::RedisDeadLetterStore;
    use crate::job::JobRequest;
    use crate::mock::MockRedisClient;
    use crate::publisher::RedisResponsePublisher;
    use crate::queue::QueueConfig;
    use crate::validation::{RequestValidator, ValidationResult, Validator};

    const DEDUP_TTL: Duration = Duration::from_secs(60);

    /// Records every request and fails the ones whose query is listed in `failures`.
    #[derive(Default)]
    struct RecordingProcessor {
        requests: Mutex<Vec<JobRequest>>,
        failures: Vec<(String, String)>,
    }

    impl RecordingProcessor {
        fn failing(query: &str, message: &str) -> Self {
            Self {
                requests: Mutex::default(),
                failures: vec![(query.to_owned(), message.to_owned())],
            }
        }

        fn requests(&self) -> Vec<JobRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessingDelegate for RecordingProcessor {
        async fn process(&self, request: &JobRequest) -> Result<(), ProcessingError> {
            self.requests.lock().unwrap().push(request.clone());

            match self.failures.iter().find(|(query, _)| *query == request.query) {
                Some((_, message)) => Err(ProcessingError::new(message)),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        responses: Mutex<Vec<JobResponse>>,
    }

    #[async_trait]
    impl ResponsePublisher for RecordingPublisher {
        async fn publish(&self, response: &JobResponse) -> Result<(), StoreError> {
            self.responses.lock().unwrap().push(response.clone());
            Ok(())
        }
    }

    /// Counts validations to check which jobs reach the validation gate.
    #[derive(Default)]
    struct CountingValidator {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Validator for CountingValidator {
        async fn validate(&self, job_id: &str, payload: &serde_json::Value) -> ValidationResult {
            *self.calls.lock().unwrap() += 1;
            RequestValidator::default().validate(job_id, payload).await
        }
    }

    struct Harness {
        redis: MockRedisClient,
        processor: Arc<RecordingProcessor>,
        publisher: Arc<RecordingPublisher>,
        validator: Arc<CountingValidator>,
        dead_letter: Arc<RedisDeadLetterStore>,
        pipeline: ConsumerPipeline,
    }

    impl Harness {
        fn new(redis: MockRedisClient, processor: RecordingProcessor) -> Self {
            Self::with_dead_letter_client(redis.clone(), redis, processor)
        }

        /// The dead-letter store gets its own client so tests can break it independently.
        fn with_dead_letter_client(
            redis: MockRedisClient,
            dead_letter_redis: MockRedisClient,
            processor: RecordingProcessor,
        ) -> Self {
            let processor = Arc::new(processor);
            let publisher = Arc::new(RecordingPublisher::default());
            let validator = Arc::new(CountingValidator::default());
            let dead_letter = Arc::new(RedisDeadLetterStore::new(
                Arc::new(dead_letter_redis),
                &QueueConfig::new("requests", "jobs"),
            ));

            let pipeline = ConsumerPipeline::new(
                "requests",
                DedupGate::new(Arc::new(redis.clone()), DEDUP_TTL),
                ValidationGate::new(validator.clone()),
                processor.clone(),
                dead_letter.clone(),
                publisher.clone(),
            );

            Self {
                redis,
                processor,
                publisher,
                validator,
                dead_letter,
                pipeline,
            }
        }

        async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
            self.dead_letter.entries(0, -1).await.unwrap()
        }

        fn validations(&self) -> usize {
            *self.validator.calls.lock().unwrap()
        }
    }

    fn job(id: &str, query: &str, client_id: &str) -> Job {
        Job::new(id, json!({"jobId": id, "query": query, "clientId": client_id}))
    }

    #[tokio::test]
    async fn test_valid_job_is_processed() {
        let harness = Harness::new(MockRedisClient::new(), RecordingProcessor::default());

        let outcome = harness.pipeline.handle(&job("j1", "cat", "c1")).await;

        assert!(matches!(outcome, Outcome::Success));
        assert_eq!(
            harness.processor.requests(),
            vec![JobRequest {
                job_id: "j1".to_owned(),
                query: "cat".to_owned(),
                client_id: "c1".to_owned(),
            }]
        );
        assert!(harness.dead_letters().await.is_empty());
        assert!(harness.publisher.responses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_is_skipped() {
        let harness = Harness::new(MockRedisClient::new(), RecordingProcessor::default());
        let job = job("j1", "cat", "c1");

        assert!(matches!(harness.pipeline.handle(&job).await, Outcome::Success));
        for _ in 0..3 {
            assert!(matches!(harness.pipeline.handle(&job).await, Outcome::Skipped));
        }

        assert_eq!(harness.processor.requests().len(), 1);
        assert_eq!(harness.validations(), 1);
        assert!(harness.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_are_processed_once() {
        let harness = Arc::new(Harness::new(
            MockRedisClient::new(),
            RecordingProcessor::default(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let harness = harness.clone();
                tokio::spawn(async move { harness.pipeline.handle(&job("j1", "cat", "c1")).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Outcome::Success => successes += 1,
                Outcome::Skipped => {}
                Outcome::Failure { error, .. } => panic!("unexpected failure: {}", error),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(harness.processor.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_job_is_rejected() {
        let harness = Harness::new(MockRedisClient::new(), RecordingProcessor::default());
        let job = job("j2", "", "c2");

        let outcome = harness.pipeline.handle(&job).await;

        match outcome {
            Outcome::Failure {
                error: PipelineError::Validation(validation_error),
                retryable,
            } => {
                assert_eq!(validation_error.error, "query must not be empty");
                assert!(!retryable);
            }
            other => panic!("expected a validation failure, got {:?}", other),
        }
        assert!(harness.processor.requests().is_empty());

        let dead_letters = harness.dead_letters().await;
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].job_id, "j2");
        assert_eq!(dead_letters[0].queue_name, "requests");
        assert_eq!(dead_letters[0].reason, "query must not be empty");
        assert_eq!(dead_letters[0].original_payload, job.data);

        let responses = harness.publisher.responses.lock().unwrap().clone();
        assert_eq!(
            responses,
            vec![JobResponse {
                job_id: "j2".to_owned(),
                client_id: Some("c2".to_owned()),
                error: ValidationError::for_field("query", "query must not be empty"),
            }]
        );
    }

    #[tokio::test]
    async fn test_rejected_job_redelivery_is_skipped() {
        let harness = Harness::new(MockRedisClient::new(), RecordingProcessor::default());
        let job = job("j2", "", "c2");

        assert!(matches!(
            harness.pipeline.handle(&job).await,
            Outcome::Failure { .. }
        ));
        assert!(matches!(harness.pipeline.handle(&job).await, Outcome::Skipped));

        assert_eq!(harness.dead_letters().await.len(), 1);
        assert_eq!(harness.publisher.responses.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processing_failure_is_dead_lettered_and_retryable() {
        let harness = Harness::new(
            MockRedisClient::new(),
            RecordingProcessor::failing("dog", "upstream timeout"),
        );
        let job = job("j3", "dog", "c3");

        let outcome = harness.pipeline.handle(&job).await;

        match outcome {
            Outcome::Failure {
                error: PipelineError::Processing(processing_error),
                retryable,
            } => {
                assert_eq!(processing_error.message(), "upstream timeout");
                assert!(retryable);
            }
            other => panic!("expected a processing failure, got {:?}", other),
        }

        let dead_letters = harness.dead_letters().await;
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].job_id, "j3");
        assert_eq!(dead_letters[0].reason, "upstream timeout");
        assert!(harness.publisher.responses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_failure_keeps_original_error() {
        let dead_letter_redis = MockRedisClient::new().fail_command("RPUSH");
        let harness = Harness::with_dead_letter_client(
            MockRedisClient::new(),
            dead_letter_redis.clone(),
            RecordingProcessor::failing("dog", "upstream timeout"),
        );

        let outcome = harness.pipeline.handle(&job("j3", "dog", "c3")).await;

        match outcome {
            Outcome::Failure {
                error: PipelineError::Processing(processing_error),
                retryable: true,
            } => assert_eq!(processing_error.message(), "upstream timeout"),
            other => panic!("expected the processing failure, got {:?}", other),
        }
        assert_eq!(dead_letter_redis.calls_for("RPUSH"), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_failure_keeps_validation_error() {
        let harness = Harness::with_dead_letter_client(
            MockRedisClient::new(),
            MockRedisClient::new().fail_command("RPUSH"),
            RecordingProcessor::default(),
        );

        let outcome = harness.pipeline.handle(&job("j2", "", "c2")).await;

        assert!(matches!(
            outcome,
            Outcome::Failure {
                error: PipelineError::Validation(_),
                retryable: false,
            }
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_validation_error() {
        let redis = MockRedisClient::new().fail_command("PUBLISH");
        let client = Arc::new(redis.clone());
        let dead_letter = Arc::new(RedisDeadLetterStore::new(
            client.clone(),
            &QueueConfig::new("requests", "jobs"),
        ));
        let pipeline = ConsumerPipeline::new(
            "requests",
            DedupGate::new(client.clone(), DEDUP_TTL),
            ValidationGate::new(Arc::new(RequestValidator::default())),
            Arc::new(RecordingProcessor::default()),
            dead_letter.clone(),
            Arc::new(RedisResponsePublisher::new(client, "jobs:responses")),
        );

        let outcome = pipeline.handle(&job("j2", "", "c2")).await;

        match outcome {
            Outcome::Failure {
                error: PipelineError::Validation(validation_error),
                retryable: false,
            } => assert_eq!(validation_error.error, "query must not be empty"),
            other => panic!("expected the validation failure, got {:?}", other),
        }
        assert_eq!(redis.calls_for("PUBLISH"), 1);
        assert!(redis.published().is_empty());

        let dead_letters = dead_letter.entries(0, -1).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].reason, "query must not be empty");
    }

    #[tokio::test]
    async fn test_dedup_store_unavailable_fails_closed() {
        let redis = MockRedisClient::new().fail_command("SET");
        let harness = Harness::new(redis, RecordingProcessor::default());

        let outcome = harness.pipeline.handle(&job("j1", "cat", "c1")).await;

        assert!(matches!(
            outcome,
            Outcome::Failure {
                error: PipelineError::StoreUnavailable(_),
                retryable: true,
            }
        ));
        assert_eq!(harness.validations(), 0);
        assert!(harness.processor.requests().is_empty());
        assert_eq!(harness.redis.calls_for("RPUSH"), 0);
    }

    #[tokio::test]
    async fn test_dedup_runs_before_anything_else() {
        let harness = Harness::new(MockRedisClient::new(), RecordingProcessor::default());

        harness.pipeline.handle(&job("j2", "", "c2")).await;

        let ops: Vec<String> = harness
            .redis
            .get_calls()
            .into_iter()
            .map(|call| call.op)
            .collect();
        assert_eq!(ops.first().map(String::as_str), Some("SET"));
        assert!(ops.contains(&"RPUSH".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_is_readmitted_after_dedup_window() {
        let harness = Harness::new(MockRedisClient::new(), RecordingProcessor::default());
        let job = job("j1", "cat", "c1");

        assert!(matches!(harness.pipeline.handle(&job).await, Outcome::Success));
        tokio::time::advance(DEDUP_TTL - Duration::from_secs(1)).await;
        assert!(matches!(harness.pipeline.handle(&job).await, Outcome::Skipped));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(harness.pipeline.handle(&job).await, Outcome::Success));

        assert_eq!(harness.processor.requests().len(), 2);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!PipelineError::Validation(ValidationError::new("bad")).is_retryable());
        assert!(PipelineError::Processing(ProcessingError::new("boom")).is_retryable());
        assert!(PipelineError::StoreUnavailable(StoreError::Timeout).is_retryable());
    }
}
