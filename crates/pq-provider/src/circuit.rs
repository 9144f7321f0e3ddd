//! Per-provider circuit.
//!
//! Consecutive outages (5xx, timeouts, dropped connections) trip the circuit.
//! While tripped, calls fail fast with `ProviderError::CircuitOpen` until the
//! cool-down passes; the next calls are trial calls, and enough successful
//! trials close the circuit again. Throttling and rejected requests count as
//! answers, not outages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pq_config::ProviderConfig;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ProviderError;
use crate::provider::ProviderId;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSettings {
    /// Consecutive outages that trip the circuit
    pub failure_threshold: u32,
    /// Successful trial calls needed to close it again
    pub success_threshold: u32,
    pub cool_down: Duration,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down: Duration::from_secs(30),
        }
    }
}

impl From<&ProviderConfig> for CircuitSettings {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            failure_threshold: config.circuit_failure_threshold,
            success_threshold: config.circuit_success_threshold,
            cool_down: Duration::from_millis(config.circuit_cool_down_ms),
        }
    }
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Calls refused while tripped, since startup
    pub rejected_calls: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

pub struct ProviderCircuit {
    provider: ProviderId,
    settings: CircuitSettings,
    phase: Mutex<Phase>,
    rejected: AtomicU64,
}

impl ProviderCircuit {
    pub fn new(provider: ProviderId, settings: CircuitSettings) -> Self {
        let settings = CircuitSettings {
            failure_threshold: settings.failure_threshold.max(1),
            success_threshold: settings.success_threshold.max(1),
            ..settings
        };
        Self {
            provider,
            settings,
            phase: Mutex::new(Phase::Closed { failures: 0 }),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn settings(&self) -> &CircuitSettings {
        &self.settings
    }

    /// Admit one call. A tripped circuit past its cool-down moves to trial
    /// calls; otherwise the call is refused.
    pub fn admit(&self) -> Result<(), ProviderError> {
        let mut phase = self.phase.lock();
        if let Phase::Open { since } = *phase {
            if since.elapsed() < self.settings.cool_down {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(ProviderError::CircuitOpen);
            }
            *phase = Phase::HalfOpen { successes: 0 };
            self.transitioned(CircuitState::HalfOpen);
        }
        Ok(())
    }

    /// The provider answered, whatever the answer was.
    pub fn on_answer(&self) {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Closed { .. } => *phase = Phase::Closed { failures: 0 },
            Phase::HalfOpen { successes } if successes + 1 >= self.settings.success_threshold => {
                *phase = Phase::Closed { failures: 0 };
                self.transitioned(CircuitState::Closed);
            }
            Phase::HalfOpen { successes } => *phase = Phase::HalfOpen { successes: successes + 1 },
            Phase::Open { .. } => {}
        }
    }

    /// The provider could not be reached or failed server-side.
    pub fn on_outage(&self) {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Closed { failures } if failures + 1 < self.settings.failure_threshold => {
                *phase = Phase::Closed { failures: failures + 1 };
            }
            Phase::Closed { .. } | Phase::HalfOpen { .. } => {
                *phase = Phase::Open { since: Instant::now() };
                self.transitioned(CircuitState::Open);
            }
            Phase::Open { .. } => {}
        }
    }

    /// Reports `HalfOpen` once the cool-down has passed, before any trial call.
    pub fn state(&self) -> CircuitState {
        let phase = *self.phase.lock();
        self.state_of(phase)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let phase = *self.phase.lock();
        let consecutive_failures = match phase {
            Phase::Closed { failures } => failures,
            _ => self.settings.failure_threshold,
        };
        CircuitSnapshot {
            provider: self.provider.to_string(),
            state: self.state_of(phase),
            consecutive_failures,
            rejected_calls: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn state_of(&self, phase: Phase) -> CircuitState {
        match phase {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { since } if since.elapsed() < self.settings.cool_down => CircuitState::Open,
            Phase::Open { .. } | Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn transitioned(&self, state: CircuitState) {
        telemetry::set_circuit_state(self.provider.as_str(), state);
        match state {
            CircuitState::Open => warn!(
                provider = %self.provider,
                cool_down_ms = self.settings.cool_down.as_millis() as u64,
                "Provider circuit tripped"
            ),
            _ => info!(provider = %self.provider, state = state.as_str(), "Provider circuit changed state"),
        }
    }
}
