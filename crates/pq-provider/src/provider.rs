//! Provider capability trait and registry descriptors.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use pq_common::{GeneratedImage, GenerationRequest, GenerationResult};
use pq_config::ProviderConfig;
use serde::{Deserialize, Serialize};

use crate::circuit::CircuitSnapshot;
use crate::error::{GenerationError, ProviderError};
use crate::Result;

/// Model entry that matches every model.
pub const WILDCARD_MODEL: &str = "*";

/// Cost tables are priced for one 1024x1024 image.
const REFERENCE_PIXELS: f64 = 1024.0 * 1024.0;

const MAX_ID_LEN: usize = 64;

/// Validated provider identifier: 1-64 ASCII alphanumerics, `-` or `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(GenerationError::Validation(format!(
                "provider id must be 1-{} characters, got {:?}",
                MAX_ID_LEN, id
            )));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(GenerationError::Validation(format!("invalid provider id {:?}", id)));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProviderId {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProviderId {
    type Error = GenerationError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ProviderId> for String {
    fn from(id: ProviderId) -> Self {
        id.0
    }
}

impl AsRef<str> for ProviderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Registry metadata for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub enabled: bool,
    /// Higher weight is preferred.
    pub priority_weight: u32,
    supported_models: Vec<String>,
    /// Per-image cost at 1024x1024, keyed by model or `*`.
    pub costs: HashMap<String, f64>,
    pub daily_limit: Option<u64>,
    pub minute_limit: Option<u64>,
}

impl ProviderDescriptor {
    /// Fails when `models` is empty.
    pub fn new<I, S>(id: ProviderId, priority_weight: u32, models: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let supported_models: Vec<String> = models.into_iter().map(Into::into).collect();
        if supported_models.is_empty() {
            return Err(GenerationError::Validation(format!(
                "provider {} must support at least one model",
                id
            )));
        }
        Ok(Self {
            id,
            enabled: true,
            priority_weight,
            supported_models,
            costs: HashMap::new(),
            daily_limit: None,
            minute_limit: None,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let mut descriptor = Self::new(
            ProviderId::new(config.id.clone())?,
            config.priority_weight,
            config.models.iter().cloned(),
        )?;
        descriptor.enabled = config.enabled;
        descriptor.costs = config.costs.clone();
        descriptor.daily_limit = config.daily_limit;
        descriptor.minute_limit = config.minute_limit;
        Ok(descriptor)
    }

    pub fn with_cost(mut self, model: impl Into<String>, cost: f64) -> Self {
        self.costs.insert(model.into(), cost);
        self
    }

    pub fn with_limits(mut self, daily: Option<u64>, per_minute: Option<u64>) -> Self {
        self.daily_limit = daily;
        self.minute_limit = per_minute;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn supported_models(&self) -> &[String] {
        &self.supported_models
    }

    /// Exact match, or the provider lists `*`.
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models
            .iter()
            .any(|m| m == model || m == WILDCARD_MODEL)
    }

    /// Table price for one reference-size image, exact model before `*`.
    pub fn cost_per_image(&self, model: &str) -> Option<f64> {
        self.costs
            .get(model)
            .or_else(|| self.costs.get(WILDCARD_MODEL))
            .copied()
    }

    /// Scale the table price by pixel area and image count. Unknown models cost 0.
    pub fn estimate_cost(&self, model: &str, width: u32, height: u32, count: u32) -> f64 {
        let Some(per_image) = self.cost_per_image(model) else {
            return 0.0;
        };
        let area = (width as f64 * height as f64) / REFERENCE_PIXELS;
        per_image * area * count as f64
    }
}

/// Status of a submitted generation as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProviderJobStatus {
    Queued,
    Running {
        #[serde(default)]
        progress: Option<f64>,
    },
    Succeeded {
        images: Vec<GeneratedImage>,
        #[serde(default)]
        cost: Option<f64>,
    },
    Failed {
        error: String,
    },
}

impl ProviderJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderJobStatus::Succeeded { .. } | ProviderJobStatus::Failed { .. })
    }
}

/// An image-generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Health probe. An `Err` means the probe itself could not complete.
    async fn is_available(&self) -> std::result::Result<bool, ProviderError>;

    /// Run one generation to completion.
    async fn generate(&self, request: &GenerationRequest) -> std::result::Result<GenerationResult, ProviderError>;

    async fn poll_job(&self, job_id: &str) -> std::result::Result<ProviderJobStatus, ProviderError>;

    fn estimate_cost(&self, model: &str, width: u32, height: u32, count: u32) -> f64;

    /// Circuit view, for providers that guard their calls with one.
    fn circuit(&self) -> Option<CircuitSnapshot> {
        None
    }
}
