use std::sync::Arc;

use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use job_common::dead_letter::RedisDeadLetterStore;
use job_common::health::HealthRegistry;
use job_common::metrics;

use super::dead_letter;

pub fn app(
    liveness: HealthRegistry,
    dead_letters: Arc<RedisDeadLetterStore>,
    metrics: Option<PrometheusHandle>,
) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route(
            "/dead-letter",
            routing::get(dead_letter::list).with_state(dead_letters),
        )
        .layer(axum::middleware::from_fn(metrics::track_metrics))
}

pub async fn index() -> &'static str {
    "job worker"
}
