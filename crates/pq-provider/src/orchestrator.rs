//! GenerationOrchestrator - moderation, retries, failover and cost tracking
//!
//! A request flows through:
//! 1. Moderation gate (flagged prompts never reach a provider)
//! 2. Failover order from the selector
//! 3. Per provider: rate-limit check, then up to `max_retries` attempts with
//!    a linearly growing delay between them
//! 4. On exhaustion, a pause of `failover_delay` before the next provider
//!
//! Every provider that was actually called leaves one `CostRecord`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use pq_common::{CostRecord, GenerationRequest, GenerationResult};
use pq_config::OrchestratorConfig;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::circuit::CircuitSnapshot;
use crate::error::{GenerationError, ProviderError, ProviderFailure};
use crate::moderation::ModerationGate;
use crate::provider::ProviderId;
use crate::rate_limit::{RateLimitTracker, RateLimits};
use crate::selector::{ProviderSelector, RegisteredProvider, SelectionOptions};
use crate::{telemetry, Result};

const RATE_LIMIT_REASON: &str = "rate limit exceeded";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Attempts per provider, at least one
    pub max_retries: u32,
    /// Base delay; the wait after attempt `n` is `retry_delay * n`
    pub retry_delay: Duration,
    pub failover_delay: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            failover_delay: Duration::from_millis(1000),
        }
    }
}

impl From<&OrchestratorConfig> for OrchestratorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            failover_delay: Duration::from_millis(config.failover_delay_ms),
        }
    }
}

/// Append-only record of provider spend, owned by one orchestrator.
#[derive(Default)]
pub struct CostLedger {
    records: Mutex<Vec<CostRecord>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: CostRecord) {
        self.records.lock().push(record);
    }

    pub fn records(&self) -> Vec<CostRecord> {
        self.records.lock().clone()
    }

    /// Records without a cost count as zero.
    pub fn total(&self) -> f64 {
        self.records.lock().iter().map(|r| r.cost.unwrap_or(0.0)).sum()
    }

    pub fn by_provider(&self) -> HashMap<String, f64> {
        let mut totals = HashMap::new();
        for record in self.records.lock().iter() {
            *totals.entry(record.provider.clone()).or_insert(0.0) += record.cost.unwrap_or(0.0);
        }
        totals
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub provider: String,
    pub available: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitSnapshot>,
}

pub struct GenerationOrchestrator {
    selector: ProviderSelector,
    moderation: Arc<dyn ModerationGate>,
    rate_limits: Option<Arc<RateLimitTracker>>,
    settings: OrchestratorSettings,
    ledger: CostLedger,
}

impl GenerationOrchestrator {
    pub fn new(selector: ProviderSelector, moderation: Arc<dyn ModerationGate>, settings: OrchestratorSettings) -> Self {
        Self {
            selector,
            moderation,
            rate_limits: None,
            settings,
            ledger: CostLedger::new(),
        }
    }

    /// Track usage per provider and skip providers that reached a limit.
    /// Limits are taken from the registered descriptors.
    pub fn with_rate_limits(mut self, tracker: Arc<RateLimitTracker>) -> Self {
        for provider in self.selector.providers() {
            tracker.set_limits(
                provider.id().as_str(),
                RateLimits {
                    daily: provider.descriptor.daily_limit,
                    per_minute: provider.descriptor.minute_limit,
                },
            );
        }
        self.rate_limits = Some(tracker);
        self
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn cost_ledger(&self) -> &CostLedger {
        &self.ledger
    }

    /// Generate with failover: the strategy's pick first, then every other
    /// eligible provider by weight.
    pub async fn generate(&self, request: &GenerationRequest, options: &SelectionOptions) -> Result<GenerationResult> {
        validate_request(request)?;
        self.moderate(&request.prompt).await?;

        let mut options = options.clone();
        if options.model.is_none() {
            options.model = request.model.clone();
        }

        let order = self.selector.get_dispatch_order(&options)?;
        if order.is_empty() {
            warn!(model = ?options.model, "No eligible providers for request");
            return Err(GenerationError::NoProvidersAvailable);
        }

        let mut failures = Vec::with_capacity(order.len());
        // Set after a failed call; the pause happens only before the next real call
        let mut failed_over = false;

        for provider in order {
            let id = provider.id().to_string();

            if let Some(reason) = self.limit_reason(&id).await {
                warn!(provider = %id, "Skipping provider at its rate limit");
                telemetry::record_provider_exhausted(&id, "rate_limited");
                failures.push(ProviderFailure { provider: id, error: reason });
                continue;
            }

            if failed_over {
                info!(provider = %id, delay_ms = self.settings.failover_delay.as_millis() as u64, "Failing over to next provider");
                tokio::time::sleep(self.settings.failover_delay).await;
            }

            let span = info_span!("provider", provider = %id);
            match self.run_with_retries(provider, request).instrument(span).await {
                Ok(result) => return Ok(result),
                Err((err, attempts)) => {
                    self.ledger
                        .record(CostRecord::failure(&id, request.model.clone(), &err.to_string(), attempts));
                    failures.push(ProviderFailure { provider: id, error: err.to_string() });
                    failed_over = true;
                }
            }
        }

        error!(providers = failures.len(), "All providers failed");
        Err(GenerationError::AllProvidersExhausted { failures })
    }

    /// Generate on one named provider, with retries but no failover.
    pub async fn generate_with_provider(
        &self,
        provider_id: &ProviderId,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        validate_request(request)?;
        self.moderate(&request.prompt).await?;

        let provider = self.selector.get(provider_id)?;
        let id = provider_id.to_string();

        if !provider.descriptor.enabled {
            return Err(GenerationError::ProviderUnavailable {
                provider: id,
                reason: "provider is disabled".to_string(),
            });
        }
        if let Some(model) = request.model.as_deref() {
            if !provider.descriptor.supports_model(model) {
                return Err(GenerationError::Validation(format!(
                    "provider {} does not support model {}",
                    id, model
                )));
            }
        }
        if let Some(reason) = self.limit_reason(&id).await {
            return Err(GenerationError::ProviderUnavailable { provider: id, reason });
        }
        match provider.client.is_available().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(GenerationError::ProviderUnavailable {
                    provider: id,
                    reason: "health check failed".to_string(),
                })
            }
            Err(err) => {
                return Err(GenerationError::ProviderUnavailable {
                    provider: id,
                    reason: err.to_string(),
                })
            }
        }

        let span = info_span!("provider", provider = %id);
        match self.run_with_retries(provider, request).instrument(span).await {
            Ok(result) => Ok(result),
            Err((err, attempts)) => {
                self.ledger
                    .record(CostRecord::failure(&id, request.model.clone(), &err.to_string(), attempts));
                Err(GenerationError::ProviderFailed {
                    provider: id,
                    attempts,
                    source: err,
                })
            }
        }
    }

    /// Probe every eligible provider concurrently.
    pub async fn get_provider_health(&self) -> Vec<ProviderHealth> {
        let order = self.selector.get_failover_order(&SelectionOptions::default());
        let probes = order.into_iter().map(|provider| async move {
            let started = Instant::now();
            let outcome = provider.client.is_available().await;
            let latency_ms = started.elapsed().as_millis() as u64;
            let circuit = provider.client.circuit();
            match outcome {
                Ok(available) => ProviderHealth {
                    provider: provider.id().to_string(),
                    available,
                    latency_ms,
                    error: None,
                    circuit,
                },
                Err(err) => ProviderHealth {
                    provider: provider.id().to_string(),
                    available: false,
                    latency_ms,
                    error: Some(err.to_string()),
                    circuit,
                },
            }
        });
        join_all(probes).await
    }

    pub fn get_cost_records(&self) -> Vec<CostRecord> {
        self.ledger.records()
    }

    pub fn get_total_cost(&self) -> f64 {
        self.ledger.total()
    }

    pub fn get_cost_by_provider(&self) -> HashMap<String, f64> {
        self.ledger.by_provider()
    }

    pub fn clear_cost_tracking(&self) {
        self.ledger.clear();
    }

    async fn moderate(&self, prompt: &str) -> Result<()> {
        let verdict = self.moderation.check(prompt).await;
        if verdict.flagged {
            warn!(terms = ?verdict.terms, "Prompt rejected by moderation");
            telemetry::record_moderation_rejection();
            return Err(GenerationError::ModerationRejected { terms: verdict.terms });
        }
        Ok(())
    }

    /// Reason to skip a provider, if the tracker reports it at a limit.
    /// Tracker errors never block dispatch.
    async fn limit_reason(&self, provider: &str) -> Option<String> {
        let tracker = self.rate_limits.as_ref()?;
        match tracker.check_limit(provider).await {
            Ok(status) if status.is_at_limit => Some(RATE_LIMIT_REASON.to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(provider, error = %e, "Rate limit check failed");
                None
            }
        }
    }

    async fn count_call(&self, provider: &str) {
        if let Some(tracker) = &self.rate_limits {
            if let Err(e) = tracker.increment(provider).await {
                warn!(provider, error = %e, "Failed to record provider usage");
            }
        }
    }

    /// Attempt one provider until success, a non-retryable error, the attempt
    /// budget runs out, or the provider reaches its usage limit between
    /// attempts. Errors carry the number of calls made.
    async fn run_with_retries(
        &self,
        provider: &RegisteredProvider,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResult, (ProviderError, u32)> {
        let id = provider.id().as_str();
        let max_attempts = self.settings.max_retries.max(1);
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                if let Some(reason) = self.limit_reason(id).await {
                    warn!(attempt, "Provider reached its rate limit, not retrying");
                    telemetry::record_provider_exhausted(id, "rate_limited");
                    return Err((ProviderError::RateLimited(reason), attempt));
                }
            }
            attempt += 1;
            self.count_call(id).await;
            let started = Instant::now();

            match provider.client.generate(request).await {
                Ok(mut result) => {
                    let elapsed = started.elapsed();
                    result.provider = id.to_string();
                    if result.model.is_none() {
                        result.model = request.model.clone();
                    }

                    telemetry::record_provider_attempt(id, "success");
                    telemetry::record_generation_duration(id, elapsed);
                    telemetry::record_generation_cost(id, result.cost);
                    self.ledger.record(CostRecord::success(
                        id,
                        result.model.clone(),
                        result.cost,
                        serde_json::json!({
                            "attempts": attempt,
                            "durationMs": result.duration_ms,
                            "images": result.images.len(),
                            "providerJobId": result.provider_job_id,
                        }),
                    ));
                    info!(attempt, cost = result.cost, duration_ms = elapsed.as_millis() as u64, "Generation succeeded");
                    return Ok(result);
                }
                Err(err) => {
                    telemetry::record_provider_attempt(id, "failure");
                    let retryable = err.is_retryable();
                    if !retryable || attempt >= max_attempts {
                        warn!(attempt, retryable, error = %err, "Provider attempts exhausted");
                        telemetry::record_provider_exhausted(id, "failed");
                        return Err((err, attempt));
                    }

                    let delay = self.settings.retry_delay * attempt;
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Provider attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn validate_request(request: &GenerationRequest) -> Result<()> {
    if request.prompt.trim().is_empty() {
        return Err(GenerationError::Validation("prompt must not be empty".to_string()));
    }
    if request.width == 0 || request.height == 0 {
        return Err(GenerationError::Validation("image dimensions must be positive".to_string()));
    }
    if request.num_images == 0 {
        return Err(GenerationError::Validation("at least one image must be requested".to_string()));
    }
    debug!(model = ?request.model, width = request.width, height = request.height, "Request validated");
    Ok(())
}
