use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use job_common::dead_letter::{DeadLetterEntry, RedisDeadLetterStore};
use job_common::redis::StoreError;

const DEFAULT_PAGE_SIZE: isize = 100;

#[derive(Deserialize, Debug)]
pub struct DeadLetterQuery {
    start: Option<isize>,
    stop: Option<isize>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DeadLetterPage {
    /// Number of entries in the store, not just on this page.
    count: u64,
    entries: Vec<DeadLetterEntry>,
}

/// List recorded dead-letter entries, oldest first.
pub async fn list(
    State(store): State<Arc<RedisDeadLetterStore>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLetterPage>, (StatusCode, String)> {
    let start = query.start.unwrap_or(0);
    let stop = query
        .stop
        .unwrap_or_else(|| start.saturating_add(DEFAULT_PAGE_SIZE - 1));

    let page = async {
        Ok::<_, StoreError>(DeadLetterPage {
            count: store.count().await?,
            entries: store.entries(start, stop).await?,
        })
    };

    match page.await {
        Ok(page) => Ok(Json(page)),
        Err(e) => {
            error!("failed to read dead-letter entries: {}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "failed to read dead-letter entries".to_owned(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{body::Body, http::Request, routing, Router};
    use http_body_util::BodyExt; // for `collect`
    use job_common::dead_letter::DeadLetterRouter;
    use job_common::job::Job;
    use job_common::mock::MockRedisClient;
    use job_common::queue::QueueConfig;
    use serde_json::json;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    fn router(client: &MockRedisClient) -> (Router, Arc<RedisDeadLetterStore>) {
        let store = Arc::new(RedisDeadLetterStore::new(
            Arc::new(client.clone()),
            &QueueConfig::new("requests", "jobs"),
        ));
        let router = Router::new()
            .route("/dead-letter", routing::get(list))
            .with_state(store.clone());

        (router, store)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();

        (status, body.to_vec())
    }

    #[tokio::test]
    async fn lists_entries_oldest_first() {
        let client = MockRedisClient::new();
        let (router, store) = router(&client);
        for (id, reason) in [("j2", "query must not be empty"), ("j3", "upstream timeout")] {
            let job = Job::new(id, json!({"jobId": id}));
            store
                .record(&DeadLetterEntry::new("requests", &job, reason))
                .await
                .unwrap();
        }

        let (status, body) = get(router, "/dead-letter").await;

        assert_eq!(status, StatusCode::OK);
        let page: DeadLetterPage = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.count, 2);
        let reasons: Vec<&str> = page.entries.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["query must not be empty", "upstream timeout"]);
    }

    #[tokio::test]
    async fn pages_through_entries() {
        let client = MockRedisClient::new();
        let (router, store) = router(&client);
        for id in ["j1", "j2", "j3"] {
            let job = Job::new(id, json!({}));
            store
                .record(&DeadLetterEntry::new("requests", &job, "boom"))
                .await
                .unwrap();
        }

        let (_, body) = get(router, "/dead-letter?start=1&stop=1").await;

        let page: DeadLetterPage = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.count, 3);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].job_id, "j2");
    }

    #[tokio::test]
    async fn start_past_the_end_is_an_empty_page() {
        let client = MockRedisClient::new();
        let (router, store) = router(&client);
        let job = Job::new("j1", json!({}));
        store
            .record(&DeadLetterEntry::new("requests", &job, "boom"))
            .await
            .unwrap();

        let (status, body) = get(router, &format!("/dead-letter?start={}", isize::MAX)).await;

        assert_eq!(status, StatusCode::OK);
        let page: DeadLetterPage = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.count, 1);
        assert!(page.entries.is_empty());
    }

    #[tokio::test]
    async fn store_unavailable() {
        let client = MockRedisClient::new().fail_command("LRANGE");
        let (router, _) = router(&client);

        let (status, _) = get(router, "/dead-letter").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
