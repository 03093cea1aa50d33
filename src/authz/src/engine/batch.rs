//! Batch authorization
//!
//! Evaluates many requests concurrently with bounded parallelism. Items
//! are isolated from each other: a failing or panicking evaluation becomes
//! an ERROR decision in its slot and the rest of the batch proceeds.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{AuthzError, Result};
use crate::types::{AuthorizationRequest, BatchDecision, Decision};

use super::AuthzEngine;

impl AuthzEngine {
    /// Authorize a batch of requests.
    ///
    /// Decisions come back in request order. Concurrency is bounded by
    /// `EngineConfig::batch_concurrency`. Returns `Err` only when the batch
    /// itself is empty; per-item failures become ERROR decisions.
    pub async fn authorize_batch(
        self: &Arc<Self>,
        requests: Vec<AuthorizationRequest>,
    ) -> Result<BatchDecision> {
        if requests.is_empty() {
            return Err(AuthzError::InvalidRequest(
                "batch contains no requests".to_string(),
            ));
        }

        let start = Instant::now();
        let size = requests.len();
        let semaphore = Arc::new(Semaphore::new(self.config.batch_concurrency.max(1)));
        debug!(size, "batch authorization started");

        let mut handles = Vec::with_capacity(size);
        for request in requests {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                engine.authorize(&request).await
            }));
        }

        let mut decisions = Vec::with_capacity(size);
        for handle in handles {
            let decision = match handle.await {
                Ok(Ok(decision)) => decision,
                Ok(Err(e)) => {
                    warn!(error = %e, "batch item rejected");
                    Decision::error(e.to_string())
                }
                Err(e) => {
                    warn!(error = %e, "batch item task failed");
                    Decision::error("Evaluation task failed")
                }
            };
            decisions.push(decision);
        }

        let total_evaluation_time_ms = start.elapsed().as_millis() as u64;
        debug!(size, total_evaluation_time_ms, "batch authorization finished");

        Ok(BatchDecision {
            decisions,
            total_evaluation_time_ms,
        })
    }
}
