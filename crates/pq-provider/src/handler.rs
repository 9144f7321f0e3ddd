//! Queue handler that runs generation jobs through the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use pq_common::{GenerationRequest, Job, JobProgress};
use pq_jobs::{JobContext, JobHandler, UnrecoverableError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GenerationError;
use crate::orchestrator::GenerationOrchestrator;
use crate::provider::ProviderId;
use crate::selector::{SelectionOptions, SelectionStrategy};

pub const GENERATION_JOB_TYPE: &str = "image-generation";

/// Job payload: the request plus optional routing hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJobPayload {
    #[serde(flatten)]
    pub request: GenerationRequest,
    /// Pin the job to one provider, no failover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl GenerationJobPayload {
    pub fn new(request: GenerationRequest) -> Self {
        Self {
            request,
            provider: None,
            strategy: None,
            exclude: Vec::new(),
        }
    }

    fn selection_options(&self) -> Result<SelectionOptions, GenerationError> {
        let mut options = SelectionOptions::new();
        if let Some(strategy) = &self.strategy {
            options = options.strategy(strategy.parse::<SelectionStrategy>()?);
        }
        for id in &self.exclude {
            options = options.exclude(ProviderId::new(id.clone())?);
        }
        Ok(options)
    }
}

pub struct GenerationJobHandler {
    orchestrator: Arc<GenerationOrchestrator>,
}

impl GenerationJobHandler {
    pub fn new(orchestrator: Arc<GenerationOrchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn run(&self, payload: &GenerationJobPayload) -> Result<serde_json::Value, GenerationError> {
        let result = match &payload.provider {
            Some(id) => {
                let id = ProviderId::new(id.clone())?;
                self.orchestrator.generate_with_provider(&id, &payload.request).await?
            }
            None => {
                let options = payload.selection_options()?;
                self.orchestrator.generate(&payload.request, &options).await?
            }
        };
        serde_json::to_value(&result).map_err(|e| GenerationError::Validation(format!("unserializable result: {}", e)))
    }
}

#[async_trait]
impl JobHandler for GenerationJobHandler {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let payload: GenerationJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| UnrecoverableError::new(format!("invalid generation payload: {}", e)))?;

        if let Err(e) = ctx.update_progress(JobProgress::percent(10.0)).await {
            warn!(error = %e, "Failed to report job progress");
        }

        match self.run(&payload).await {
            Ok(value) => {
                if let Err(e) = ctx.update_progress(JobProgress::percent(100.0)).await {
                    warn!(error = %e, "Failed to report job progress");
                }
                info!(provider = %value["provider"].as_str().unwrap_or_default(), "Generation job finished");
                Ok(value)
            }
            Err(e) if !e.is_retryable() => Err(UnrecoverableError::new(e.to_string()).into()),
            Err(e) => Err(e.into()),
        }
    }
}
