use std::fmt;

use pq_queue::QueueError;
use thiserror::Error;

/// Failure reported by a single provider call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Server-side or throttling response; worth another attempt.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Client error from the provider (bad request, auth, not found).
    #[error("Rejected by provider (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Circuit open")]
    CircuitOpen,

    /// Usage limit reached between attempts; the provider is not called again.
    #[error("Rate limit reached: {0}")]
    RateLimited(String),

    #[error("Generation {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Generation {0} did not finish within the polling budget")]
    PollTimeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderError::Rejected { .. } | ProviderError::InvalidResponse(_) | ProviderError::RateLimited(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Connection(err.to_string())
        }
    }
}

/// Final error of one provider inside an exhausted failover run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("Provider {provider} failed after {attempts} attempts: {source}")]
    ProviderFailed {
        provider: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Prompt rejected by moderation: {}", terms.join(", "))]
    ModerationRejected { terms: Vec<String> },

    #[error("No providers available")]
    NoProvidersAvailable,

    #[error("All providers failed: {}", format_failures(failures))]
    AllProvidersExhausted { failures: Vec<ProviderFailure> },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl GenerationError {
    /// Whether a queue may deliver the job again.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Validation(_)
            | GenerationError::ProviderNotFound(_)
            | GenerationError::ModerationRejected { .. }
            | GenerationError::NoProvidersAvailable => false,
            GenerationError::ProviderFailed { source, .. } => source.is_retryable(),
            GenerationError::ProviderUnavailable { .. }
            | GenerationError::AllProvidersExhausted { .. }
            | GenerationError::Queue(_) => true,
        }
    }
}

fn format_failures(failures: &[ProviderFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_lists_providers_in_order() {
        let err = GenerationError::AllProvidersExhausted {
            failures: vec![
                ProviderFailure { provider: "a".into(), error: "HTTP 503: busy".into() },
                ProviderFailure { provider: "b".into(), error: "Request timed out".into() },
            ],
        };
        assert_eq!(err.to_string(), "All providers failed: a: HTTP 503: busy; b: Request timed out");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!GenerationError::ModerationRejected { terms: vec!["x".into()] }.is_retryable());
        assert!(!GenerationError::NoProvidersAvailable.is_retryable());
        assert!(GenerationError::AllProvidersExhausted { failures: vec![] }.is_retryable());
        assert!(ProviderError::Timeout.is_retryable());
        assert!(!ProviderError::Rejected { status: 401, message: "Unauthorized".into() }.is_retryable());
        assert!(!ProviderError::RateLimited("rate limit exceeded".into()).is_retryable());
    }
}
