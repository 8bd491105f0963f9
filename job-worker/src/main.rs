//! Consume `RedisQueue` jobs through the deduplicating consumer pipeline.
use std::sync::Arc;

use envconfig::Envconfig;
use futures::future::{select, Either};
use tracing_subscriber::EnvFilter;

use job_common::dead_letter::RedisDeadLetterStore;
use job_common::dedup::DedupGate;
use job_common::health::HealthRegistry;
use job_common::metrics::{serve, setup_metrics_recorder};
use job_common::pipeline::ConsumerPipeline;
use job_common::publisher::RedisResponsePublisher;
use job_common::queue::RedisQueue;
use job_common::redis::{Client, RedisClient};
use job_common::validation::{RequestValidator, ValidationGate};
use job_worker::config::Config;
use job_worker::error::WorkerError;
use job_worker::handlers::app;
use job_worker::processor::HttpProcessingDelegate;
use job_worker::worker::JobWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let queue_config = config.queue_config();

    let client: Arc<dyn Client> =
        Arc::new(RedisClient::new(config.redis_url.clone(), config.redis_timeout_ms.0).await?);

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let dead_letters = Arc::new(RedisDeadLetterStore::new(client.clone(), &queue_config));
    let pipeline = ConsumerPipeline::new(
        &queue_config.name,
        DedupGate::new(client.clone(), config.dedup_ttl()),
        ValidationGate::new(Arc::new(RequestValidator::new(config.max_query_length))),
        Arc::new(HttpProcessingDelegate::new(
            &config.processing_url,
            config.processing_timeout.0,
        )?),
        dead_letters.clone(),
        Arc::new(RedisResponsePublisher::new(
            client.clone(),
            &format!("{}:responses", queue_config.prefix),
        )),
    );

    let worker = JobWorker::new(
        &format!("{}-worker", queue_config.name),
        Arc::new(RedisQueue::new(client, queue_config)),
        Arc::new(pipeline),
        config.poll_interval.0,
        worker_liveness,
    );

    let recorder_handle = setup_metrics_recorder()?;
    let router = app(liveness, dead_letters, Some(recorder_handle));
    let bind = config.bind();
    let http_server = Box::pin(serve(router, &bind));
    let worker_loop = Box::pin(worker.run());

    match select(http_server, worker_loop).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                tracing::error!("failed to start job-worker http server, {}", e);
            }
        }
        Either::Right((worker_result, _)) => {
            tracing::error!("job-worker consumer loop exited");
            worker_result?;
        }
    };

    Ok(())
}
