use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::dedup::DuplicateDetector;
use crate::error::HandlerError;
use crate::queue::{JobContext, JobHandler};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeHashesPayload {
    batch_limit: Option<usize>,
}

/// Runs one duplicate-hashing batch per job.
pub struct ComputeHashesHandler {
    detector: Arc<DuplicateDetector>,
    batch_limit: usize,
}

impl ComputeHashesHandler {
    pub fn new(detector: Arc<DuplicateDetector>, batch_limit: usize) -> Self {
        Self {
            detector,
            batch_limit: batch_limit.max(1),
        }
    }
}

#[async_trait]
impl JobHandler for ComputeHashesHandler {
    async fn handle(&self, payload: Value, _ctx: JobContext) -> Result<Value, HandlerError> {
        let payload: ComputeHashesPayload = if payload.is_null() {
            ComputeHashesPayload::default()
        } else {
            serde_json::from_value(payload)?
        };
        let limit = payload.batch_limit.unwrap_or(self.batch_limit).max(1);

        let report = self.detector.compute_hashes(limit).await?;
        Ok(serde_json::to_value(report)?)
    }
}
