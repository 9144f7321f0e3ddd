//! HttpProvider - REST generation provider
//!
//! Protocol:
//! - `POST {base}/v1/generations` submits a request and returns `{id, status, ...}`
//! - `GET {base}/v1/generations/{id}` reports the current status
//! - `GET {base}/health` answers 2xx while the provider accepts work
//!
//! Response classification:
//! - 2xx: success
//! - 429: throttled, retryable, counts as an answer for the circuit
//! - 501 and other 4xx: rejected, not retryable, counts as an answer
//! - 5xx and transport errors: retryable, count as outages

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use pq_common::{GeneratedImage, GenerationRequest, GenerationResult};
use pq_config::ProviderConfig;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitSettings, CircuitSnapshot, CircuitState, ProviderCircuit};
use crate::error::{GenerationError, ProviderError};
use crate::provider::{GenerationProvider, ProviderDescriptor, ProviderJobStatus, WILDCARD_MODEL};

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub circuit: CircuitSettings,
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 60,
            circuit: CircuitSettings::default(),
        }
    }
}

impl From<&ProviderConfig> for HttpProviderConfig {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_poll_attempts: config.max_poll_attempts,
            circuit: CircuitSettings::from(config),
            ..Self::new(config.base_url.clone())
        }
    }
}

/// Body of submit and status responses
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerationResponse {
    id: String,
    status: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    images: Vec<GeneratedImage>,
    #[serde(default)]
    cost: Option<f64>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

impl GenerationResponse {
    fn job_status(self) -> Result<ProviderJobStatus, ProviderError> {
        match self.status.to_ascii_lowercase().as_str() {
            "queued" | "pending" | "starting" => Ok(ProviderJobStatus::Queued),
            "running" | "processing" => Ok(ProviderJobStatus::Running { progress: self.progress }),
            "succeeded" | "completed" => Ok(ProviderJobStatus::Succeeded {
                images: self.images,
                cost: self.cost,
            }),
            "failed" | "canceled" | "cancelled" => Ok(ProviderJobStatus::Failed {
                error: self.error.unwrap_or_else(|| self.status.clone()),
            }),
            other => Err(ProviderError::InvalidResponse(format!("unknown generation status {:?}", other))),
        }
    }
}

pub struct HttpProvider {
    descriptor: ProviderDescriptor,
    config: HttpProviderConfig,
    client: Client,
    circuit: ProviderCircuit,
}

impl HttpProvider {
    pub fn new(descriptor: ProviderDescriptor, config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ProviderError::Connection(format!("failed to build HTTP client: {}", e)))?;

        let circuit = ProviderCircuit::new(descriptor.id.clone(), config.circuit.clone());

        info!(
            provider = %descriptor.id,
            base_url = %config.base_url,
            timeout_ms = config.timeout.as_millis() as u64,
            circuit_failure_threshold = circuit.settings().failure_threshold,
            "HttpProvider initialized"
        );

        Ok(Self {
            descriptor,
            config,
            client,
            circuit,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, GenerationError> {
        let descriptor = ProviderDescriptor::from_config(config)?;
        Self::new(descriptor, HttpProviderConfig::from(config)).map_err(|e| GenerationError::ProviderUnavailable {
            provider: config.id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Map a response or transport error to the provider error taxonomy and
    /// feed the circuit.
    async fn classify(&self, outcome: Result<Response, reqwest::Error>) -> Result<Response, ProviderError> {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.circuit.on_outage();
                warn!(provider = %self.descriptor.id, error = %e, "Provider request failed");
                return Err(e.into());
            }
        };

        let status = response.status();
        let code = status.as_u16();
        if status.is_success() {
            self.circuit.on_answer();
            return Ok(response);
        }

        if code == 429 {
            // Throttling is not an outage
            self.circuit.on_answer();
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            warn!(provider = %self.descriptor.id, retry_after = ?retry_after, "Provider throttled request (429)");
            let message = error_body(response).await;
            return Err(ProviderError::Http { status: code, message });
        }

        if code == 501 || status.is_client_error() {
            self.circuit.on_answer();
            let message = error_body(response).await;
            warn!(provider = %self.descriptor.id, status_code = code, error = %message, "Provider rejected request");
            return Err(ProviderError::Rejected { status: code, message });
        }

        if status.is_server_error() {
            self.circuit.on_outage();
        }
        let message = error_body(response).await;
        warn!(provider = %self.descriptor.id, status_code = code, error = %message, "Provider error response");
        Err(ProviderError::Http { status: code, message })
    }

    async fn fetch_status(&self, job_id: &str) -> Result<(Option<String>, ProviderJobStatus), ProviderError> {
        let url = format!("{}/v1/generations/{}", self.config.base_url, job_id);
        let outcome = self.authorized(self.client.get(&url)).send().await;
        let response = self.classify(outcome).await?;
        let body: GenerationResponse = response.json().await?;
        let model = body.model.clone();
        Ok((model, body.job_status()?))
    }
}

async fn error_body(response: Response) -> String {
    let reason = response.status().canonical_reason().unwrap_or("error").to_string();
    match response.text().await {
        Ok(body) if !body.trim().is_empty() => body.chars().take(MAX_ERROR_BODY).collect(),
        _ => reason,
    }
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    async fn is_available(&self) -> Result<bool, ProviderError> {
        if self.circuit.state() == CircuitState::Open {
            debug!(provider = %self.descriptor.id, "Circuit open, reporting unavailable");
            return Ok(false);
        }
        let url = format!("{}/health", self.config.base_url);
        let response = self.authorized(self.client.get(&url)).send().await?;
        Ok(response.status().is_success())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError> {
        self.circuit.admit()?;

        let started_at = Utc::now();
        let started = Instant::now();
        let url = format!("{}/v1/generations", self.config.base_url);

        let outcome = self.authorized(self.client.post(&url)).json(request).send().await;
        let response = self.classify(outcome).await?;
        let body: GenerationResponse = response.json().await?;

        let job_id = body.id.clone();
        let mut model = body.model.clone();
        let mut status = body.job_status()?;
        debug!(provider = %self.descriptor.id, job_id = %job_id, "Generation submitted");

        let mut polls = 0;
        while !status.is_terminal() {
            if polls >= self.config.max_poll_attempts {
                warn!(provider = %self.descriptor.id, job_id = %job_id, polls, "Generation did not finish in time");
                return Err(ProviderError::PollTimeout(job_id));
            }
            polls += 1;
            tokio::time::sleep(self.config.poll_interval).await;
            let (polled_model, polled) = self.fetch_status(&job_id).await?;
            model = polled_model.or(model);
            status = polled;
        }

        match status {
            ProviderJobStatus::Succeeded { images, cost } => {
                let model = model.or_else(|| request.model.clone());
                let cost = cost.unwrap_or_else(|| {
                    self.estimate_cost(
                        model.as_deref().unwrap_or(WILDCARD_MODEL),
                        request.width,
                        request.height,
                        request.num_images,
                    )
                });
                Ok(GenerationResult {
                    provider: self.descriptor.id.to_string(),
                    model,
                    images,
                    cost,
                    provider_job_id: Some(job_id),
                    started_at,
                    finished_at: Utc::now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
            ProviderJobStatus::Failed { error } => Err(ProviderError::JobFailed { job_id, message: error }),
            other => Err(ProviderError::InvalidResponse(format!("unexpected terminal status {:?}", other))),
        }
    }

    async fn poll_job(&self, job_id: &str) -> Result<ProviderJobStatus, ProviderError> {
        let (_, status) = self.fetch_status(job_id).await?;
        Ok(status)
    }

    fn estimate_cost(&self, model: &str, width: u32, height: u32, count: u32) -> f64 {
        self.descriptor.estimate_cost(model, width, height, count)
    }

    fn circuit(&self) -> Option<CircuitSnapshot> {
        Some(self.circuit.snapshot())
    }
}
