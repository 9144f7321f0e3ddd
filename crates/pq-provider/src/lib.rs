//! PixelQ Generation Providers
//!
//! - `GenerationProvider`: capability trait for image-generation backends
//! - `ProviderSelector`: registry plus selection strategies and failover order
//! - `ModerationGate`: prompt screening before any provider is called
//! - `RateLimitTracker`: daily and per-minute usage counters per provider
//! - `GenerationOrchestrator`: moderation, retries, failover and cost ledger
//! - `HttpProvider`: REST provider client guarded by a per-provider circuit
//! - `GenerationJobHandler`: queue handler that runs the orchestrator

pub mod circuit;
pub mod error;
pub mod handler;
pub mod http;
pub mod moderation;
pub mod orchestrator;
pub mod provider;
pub mod rate_limit;
pub mod selector;
pub mod telemetry;

pub use circuit::{CircuitSettings, CircuitSnapshot, CircuitState, ProviderCircuit};
pub use error::{GenerationError, ProviderError, ProviderFailure};
pub use handler::{GenerationJobHandler, GenerationJobPayload, GENERATION_JOB_TYPE};
pub use http::{HttpProvider, HttpProviderConfig};
pub use moderation::{KeywordModerationGate, ModerationGate, ModerationResult, NoopModerationGate};
pub use orchestrator::{CostLedger, GenerationOrchestrator, OrchestratorSettings, ProviderHealth};
pub use provider::{GenerationProvider, ProviderDescriptor, ProviderId, ProviderJobStatus, WILDCARD_MODEL};
pub use rate_limit::{RateLimitStatus, RateLimitTracker, RateLimits};
pub use selector::{ProviderSelector, RegisteredProvider, SelectionOptions, SelectionStrategy};

pub type Result<T> = std::result::Result<T, GenerationError>;
