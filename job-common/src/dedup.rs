use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::redis::{Client, StoreError};

/// Prefix of every dedup record key. The rest of the key is the job id.
pub const DEDUP_KEY_PREFIX: &str = "processed:";

const ADMITTED_SENTINEL: &str = "1";

/// Remembers which job ids were admitted for processing during the last `ttl`.
///
/// Admission is a single `SET NX EX`, so concurrent deliveries of the same id, from this process or
/// any other, agree on exactly one winner. Once the record expires the id is admitted again.
pub struct DedupGate {
    client: Arc<dyn Client>,
    ttl: Duration,
}

impl DedupGate {
    pub fn new(client: Arc<dyn Client>, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    pub fn key(job_id: &str) -> String {
        format!("{}{}", DEDUP_KEY_PREFIX, job_id)
    }

    /// Claim `job_id`. Returns `true` if the caller must process the job and `false` if the job was
    /// already admitted within the retention window.
    pub async fn admit(&self, job_id: &str) -> Result<bool, StoreError> {
        // Redis rejects an expiry of zero.
        let seconds = self.ttl.as_secs().max(1);

        let admitted = self
            .client
            .set_nx_ex(Self::key(job_id), ADMITTED_SENTINEL.to_owned(), seconds)
            .await?;

        debug!(job_id, admitted, "dedup admission checked");
        Ok(admitted)
    }
}
