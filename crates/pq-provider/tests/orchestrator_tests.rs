//! GenerationOrchestrator Tests
//!
//! Tests for:
//! - Failover order and aggregated errors
//! - Selection strategy deciding the first provider tried
//! - Moderation short-circuit
//! - Intra-provider retries and their delays
//! - Cost ledger accounting
//! - Single-provider generation
//! - Rate-limited providers being skipped, before and between attempts
//! - Health probes

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use pq_common::{GeneratedImage, GenerationRequest, GenerationResult};
use pq_provider::{
    GenerationError, GenerationOrchestrator, GenerationProvider, KeywordModerationGate, ModerationGate,
    NoopModerationGate, OrchestratorSettings, ProviderDescriptor, ProviderError, ProviderId, ProviderJobStatus,
    ProviderSelector, RateLimitTracker, SelectionOptions, SelectionStrategy,
};
use pq_queue::MemoryKeyValueStore;

#[derive(Clone, Copy)]
enum Health {
    Up,
    Down,
    Broken,
}

/// Mock provider that fails a fixed number of times before succeeding
struct MockProvider {
    cost: f64,
    failures_before_success: u32,
    error: ProviderError,
    health: Health,
    calls: AtomicU32,
}

impl MockProvider {
    fn succeeding(cost: f64) -> Arc<Self> {
        Arc::new(Self {
            cost,
            failures_before_success: 0,
            error: ProviderError::Timeout,
            health: Health::Up,
            calls: AtomicU32::new(0),
        })
    }

    fn failing(error: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            cost: 0.0,
            failures_before_success: u32::MAX,
            error,
            health: Health::Up,
            calls: AtomicU32::new(0),
        })
    }

    fn flaky(failures: u32, cost: f64) -> Arc<Self> {
        Arc::new(Self {
            cost,
            failures_before_success: failures,
            error: ProviderError::Http {
                status: 503,
                message: "busy".into(),
            },
            health: Health::Up,
            calls: AtomicU32::new(0),
        })
    }

    fn with_health(health: Health) -> Arc<Self> {
        Arc::new(Self {
            cost: 0.0,
            failures_before_success: 0,
            error: ProviderError::Timeout,
            health,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for MockProvider {
    async fn is_available(&self) -> Result<bool, ProviderError> {
        match self.health {
            Health::Up => Ok(true),
            Health::Down => Ok(false),
            Health::Broken => Err(ProviderError::Connection("connection refused".into())),
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            return Err(self.error.clone());
        }
        let now = Utc::now();
        Ok(GenerationResult {
            provider: "set-by-orchestrator".into(),
            model: None,
            images: vec![GeneratedImage {
                url: format!("https://cdn.example/{}.png", call),
                width: request.width,
                height: request.height,
                content_type: Some("image/png".into()),
            }],
            cost: self.cost,
            provider_job_id: Some(format!("job-{}", call)),
            started_at: now,
            finished_at: now,
            duration_ms: 5,
        })
    }

    async fn poll_job(&self, _job_id: &str) -> Result<ProviderJobStatus, ProviderError> {
        Ok(ProviderJobStatus::Queued)
    }

    fn estimate_cost(&self, _model: &str, _width: u32, _height: u32, count: u32) -> f64 {
        self.cost * count as f64
    }
}

fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_retries: 3,
        retry_delay: Duration::from_millis(1),
        failover_delay: Duration::from_millis(1),
    }
}

fn descriptor(id: &str, weight: u32) -> ProviderDescriptor {
    ProviderDescriptor::new(ProviderId::new(id).unwrap(), weight, ["*"]).unwrap()
}

fn build(
    entries: Vec<(ProviderDescriptor, Arc<MockProvider>)>,
    gate: Arc<dyn ModerationGate>,
    settings: OrchestratorSettings,
) -> GenerationOrchestrator {
    let mut selector = ProviderSelector::new();
    for (descriptor, provider) in entries {
        selector.register(descriptor, provider).unwrap();
    }
    GenerationOrchestrator::new(selector, gate, settings)
}

fn id(s: &str) -> ProviderId {
    ProviderId::new(s).unwrap()
}

#[tokio::test]
async fn test_exhaustion_reports_every_provider_in_failover_order() {
    let a = MockProvider::failing(ProviderError::Timeout);
    let b = MockProvider::failing(ProviderError::Http { status: 500, message: "boom".into() });
    let c = MockProvider::failing(ProviderError::Connection("reset".into()));
    let orchestrator = build(
        vec![
            (descriptor("a", 1), a.clone()),
            (descriptor("b", 2), b.clone()),
            (descriptor("c", 3), c.clone()),
        ],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );

    let selected = orchestrator.selector().select_provider(&SelectionOptions::new()).unwrap();
    assert_eq!(selected.id().as_str(), "c");

    let err = orchestrator
        .generate(&GenerationRequest::new("a castle at dusk"), &SelectionOptions::new())
        .await
        .unwrap_err();

    match err {
        GenerationError::AllProvidersExhausted { failures } => {
            assert_eq!(failures.len(), 3);
            let order: Vec<&str> = failures.iter().map(|f| f.provider.as_str()).collect();
            assert_eq!(order, vec!["c", "b", "a"]);
            assert_eq!(failures[0].error, "Connection error: reset");
            assert_eq!(failures[1].error, "HTTP 500: boom");
            assert_eq!(failures[2].error, "Request timed out");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(a.calls(), 3);
    assert_eq!(b.calls(), 3);
    assert_eq!(c.calls(), 3);

    let records = orchestrator.get_cost_records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| !r.successful && r.cost == Some(0.0)));
    assert_eq!(records[0].metadata["attempts"], 3);
}

#[tokio::test]
async fn test_failover_to_next_provider() {
    let primary = MockProvider::failing(ProviderError::Timeout);
    let secondary = MockProvider::succeeding(0.04);
    let orchestrator = build(
        vec![(descriptor("primary", 10), primary.clone()), (descriptor("secondary", 5), secondary.clone())],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );

    let result = orchestrator
        .generate(&GenerationRequest::new("a quiet harbor").with_model("sdxl"), &SelectionOptions::new())
        .await
        .unwrap();

    assert_eq!(result.provider, "secondary");
    assert_eq!(result.model.as_deref(), Some("sdxl"));
    assert_eq!(primary.calls(), 3);
    assert_eq!(secondary.calls(), 1);

    let records = orchestrator.get_cost_records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].provider, "primary");
    assert!(!records[0].successful);
    assert_eq!(records[1].provider, "secondary");
    assert!(records[1].successful);
    assert_eq!(records[1].cost, Some(0.04));
}

#[tokio::test]
async fn test_moderation_rejection_calls_no_provider() {
    let provider = MockProvider::succeeding(1.0);
    let orchestrator = build(
        vec![(descriptor("a", 1), provider.clone())],
        Arc::new(KeywordModerationGate::new(["gore"])),
        fast_settings(),
    );

    let err = orchestrator
        .generate(&GenerationRequest::new("lots of GORE everywhere"), &SelectionOptions::new())
        .await
        .unwrap_err();

    match err {
        GenerationError::ModerationRejected { terms } => assert_eq!(terms, vec!["gore"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!GenerationError::ModerationRejected { terms: vec![] }.is_retryable());
    assert_eq!(provider.calls(), 0);
    assert!(orchestrator.get_cost_records().is_empty());

    let err = orchestrator
        .generate_with_provider(&id("a"), &GenerationRequest::new("gore"))
        .await
        .unwrap_err();
    assert!(matches!(err, GenerationError::ModerationRejected { .. }));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_retries_with_growing_delay_before_success() {
    let provider = MockProvider::flaky(2, 0.5);
    let settings = OrchestratorSettings {
        retry_delay: Duration::from_millis(50),
        ..fast_settings()
    };
    let orchestrator = build(vec![(descriptor("a", 1), provider.clone())], Arc::new(NoopModerationGate), settings);

    let started = Instant::now();
    let result = orchestrator
        .generate(&GenerationRequest::new("a field of poppies"), &SelectionOptions::new())
        .await
        .unwrap();

    // 50ms after the first failure, 100ms after the second
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(provider.calls(), 3);
    assert_eq!(result.provider, "a");

    let records = orchestrator.get_cost_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metadata["attempts"], 3);
}

#[tokio::test]
async fn test_rejected_request_is_not_retried_on_same_provider() {
    let rejecting = MockProvider::failing(ProviderError::Rejected {
        status: 401,
        message: "Unauthorized".into(),
    });
    let fallback = MockProvider::succeeding(0.1);
    let orchestrator = build(
        vec![(descriptor("rejecting", 2), rejecting.clone()), (descriptor("fallback", 1), fallback.clone())],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );

    let result = orchestrator
        .generate(&GenerationRequest::new("a sailboat"), &SelectionOptions::new())
        .await
        .unwrap();

    assert_eq!(result.provider, "fallback");
    assert_eq!(rejecting.calls(), 1);
}

#[tokio::test]
async fn test_cost_totals_and_clear() {
    let cheap = MockProvider::succeeding(2.0);
    let pricey = MockProvider::succeeding(3.0);
    let orchestrator = build(
        vec![(descriptor("cheap", 1), cheap), (descriptor("pricey", 2), pricey)],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );

    let request = GenerationRequest::new("a mountain lake");
    orchestrator.generate_with_provider(&id("cheap"), &request).await.unwrap();
    orchestrator.generate_with_provider(&id("pricey"), &request).await.unwrap();

    assert_eq!(orchestrator.get_total_cost(), 5.0);
    let by_provider = orchestrator.get_cost_by_provider();
    assert_eq!(by_provider["cheap"], 2.0);
    assert_eq!(by_provider["pricey"], 3.0);

    orchestrator.clear_cost_tracking();
    assert!(orchestrator.get_cost_records().is_empty());
    assert_eq!(orchestrator.get_total_cost(), 0.0);
}

#[tokio::test]
async fn test_generate_with_provider_does_not_fail_over() {
    let broken = MockProvider::failing(ProviderError::Timeout);
    let healthy = MockProvider::succeeding(1.0);
    let orchestrator = build(
        vec![(descriptor("broken", 1), broken.clone()), (descriptor("healthy", 2), healthy.clone())],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );

    let err = orchestrator
        .generate_with_provider(&id("broken"), &GenerationRequest::new("a desert road"))
        .await
        .unwrap_err();

    match err {
        GenerationError::ProviderFailed { provider, attempts, source } => {
            assert_eq!(provider, "broken");
            assert_eq!(attempts, 3);
            assert_eq!(source, ProviderError::Timeout);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broken.calls(), 3);
    assert_eq!(healthy.calls(), 0);
}

#[tokio::test]
async fn test_generate_with_provider_checks_registry() {
    let provider = MockProvider::succeeding(1.0);
    let orchestrator = build(
        vec![
            (descriptor("off", 1).disabled(), provider.clone()),
            (
                ProviderDescriptor::new(id("sdxl-only"), 1, ["sdxl"]).unwrap(),
                MockProvider::succeeding(1.0),
            ),
            (descriptor("down", 1), MockProvider::with_health(Health::Down)),
        ],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );
    let request = GenerationRequest::new("a foggy forest");

    let missing = orchestrator.generate_with_provider(&id("missing"), &request).await;
    assert!(matches!(missing, Err(GenerationError::ProviderNotFound(ref p)) if p == "missing"));

    let disabled = orchestrator.generate_with_provider(&id("off"), &request).await;
    assert!(matches!(disabled, Err(GenerationError::ProviderUnavailable { .. })));

    let wrong_model = orchestrator
        .generate_with_provider(&id("sdxl-only"), &request.clone().with_model("flux"))
        .await;
    assert!(matches!(wrong_model, Err(GenerationError::Validation(_))));

    let down = orchestrator.generate_with_provider(&id("down"), &request).await;
    assert!(matches!(down, Err(GenerationError::ProviderUnavailable { .. })));

    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_no_provider_supports_model() {
    let orchestrator = build(
        vec![(
            ProviderDescriptor::new(id("a"), 1, ["sdxl"]).unwrap(),
            MockProvider::succeeding(1.0),
        )],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );

    let err = orchestrator
        .generate(&GenerationRequest::new("x").with_model("dalle-3"), &SelectionOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GenerationError::NoProvidersAvailable));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_provider_at_rate_limit_is_skipped() {
    let limited = MockProvider::succeeding(1.0);
    let backup = MockProvider::succeeding(2.0);
    let tracker = Arc::new(RateLimitTracker::new(Arc::new(MemoryKeyValueStore::new())));
    let orchestrator = build(
        vec![
            (descriptor("limited", 5).with_limits(None, Some(1)), limited.clone()),
            (descriptor("backup", 1), backup.clone()),
        ],
        Arc::new(NoopModerationGate),
        fast_settings(),
    )
    .with_rate_limits(tracker.clone());

    let request = GenerationRequest::new("a lighthouse in a storm");
    let first = orchestrator.generate(&request, &SelectionOptions::new()).await.unwrap();
    assert_eq!(first.provider, "limited");

    let second = orchestrator.generate(&request, &SelectionOptions::new()).await.unwrap();
    assert_eq!(second.provider, "backup");
    assert_eq!(limited.calls(), 1);

    let status = tracker.check_limit("limited").await.unwrap();
    assert_eq!(status.minute_usage, 1);
    assert!(status.is_at_limit);

    // Skipped providers leave no cost record
    let providers: Vec<String> = orchestrator.get_cost_records().into_iter().map(|r| r.provider).collect();
    assert_eq!(providers, vec!["limited", "backup"]);
}

#[tokio::test]
async fn test_health_probe_reports_errors() {
    let orchestrator = build(
        vec![
            (descriptor("up", 3), MockProvider::with_health(Health::Up)),
            (descriptor("down", 2), MockProvider::with_health(Health::Down)),
            (descriptor("broken", 1), MockProvider::with_health(Health::Broken)),
        ],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );

    let health = orchestrator.get_provider_health().await;
    assert_eq!(health.len(), 3);

    assert_eq!(health[0].provider, "up");
    assert!(health[0].available);
    assert!(health[0].error.is_none());

    assert_eq!(health[1].provider, "down");
    assert!(!health[1].available);
    assert!(health[1].error.is_none());

    assert_eq!(health[2].provider, "broken");
    assert!(!health[2].available);
    assert_eq!(health[2].error.as_deref(), Some("Connection error: connection refused"));
    assert!(health.iter().all(|h| h.circuit.is_none()));
}

#[tokio::test]
async fn test_lowest_cost_strategy_picks_first_provider() {
    let expensive = MockProvider::succeeding(5.0);
    let cheap = MockProvider::succeeding(0.01);
    let mut selector = ProviderSelector::new().with_default_strategy(SelectionStrategy::LowestCost);
    selector.register(descriptor("expensive", 9), expensive.clone()).unwrap();
    selector.register(descriptor("cheap", 1), cheap.clone()).unwrap();
    let orchestrator = GenerationOrchestrator::new(selector, Arc::new(NoopModerationGate), fast_settings());

    let request = GenerationRequest::new("a paper lantern").with_model("sdxl");
    let result = orchestrator.generate(&request, &SelectionOptions::new()).await.unwrap();

    assert_eq!(result.provider, "cheap");
    assert_eq!(result.cost, 0.01);
    assert_eq!(expensive.calls(), 0);

    // A per-call strategy overrides the configured default
    let options = SelectionOptions::new().strategy(SelectionStrategy::HighestPriority);
    let result = orchestrator.generate(&request, &options).await.unwrap();
    assert_eq!(result.provider, "expensive");
}

#[tokio::test]
async fn test_strategy_pick_fails_over_by_weight() {
    // failing mocks price at zero, so lowest-cost picks this one first
    let cheap = MockProvider::failing(ProviderError::Timeout);
    let heavy = MockProvider::succeeding(3.0);
    let middle = MockProvider::succeeding(1.0);
    let orchestrator = build(
        vec![
            (descriptor("heavy", 9), heavy.clone()),
            (descriptor("middle", 5), middle.clone()),
            (descriptor("cheap", 1), cheap.clone()),
        ],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );
    let options = SelectionOptions::new().strategy(SelectionStrategy::LowestCost).model("sdxl");
    let result = orchestrator
        .generate(&GenerationRequest::new("a glass greenhouse"), &options)
        .await
        .unwrap();

    assert_eq!(cheap.calls(), 3);
    assert_eq!(result.provider, "heavy");
    assert_eq!(middle.calls(), 0);
}

#[tokio::test]
async fn test_round_robin_strategy_spreads_first_attempts() {
    let providers = [MockProvider::succeeding(1.0), MockProvider::succeeding(1.0), MockProvider::succeeding(1.0)];
    let orchestrator = build(
        vec![
            (descriptor("a", 1), providers[0].clone()),
            (descriptor("b", 2), providers[1].clone()),
            (descriptor("c", 3), providers[2].clone()),
        ],
        Arc::new(NoopModerationGate),
        fast_settings(),
    );

    let options = SelectionOptions::new().strategy(SelectionStrategy::RoundRobin);
    for _ in 0..6 {
        orchestrator
            .generate(&GenerationRequest::new("a tide pool"), &options)
            .await
            .unwrap();
    }
    assert!(providers.iter().all(|p| p.calls() == 2));
}

#[tokio::test]
async fn test_limit_reached_between_attempts_stops_retrying() {
    let limited = MockProvider::flaky(2, 1.0);
    let backup = MockProvider::succeeding(2.0);
    let tracker = Arc::new(RateLimitTracker::new(Arc::new(MemoryKeyValueStore::new())));
    let orchestrator = build(
        vec![
            (descriptor("limited", 5).with_limits(Some(1), None), limited.clone()),
            (descriptor("backup", 1), backup.clone()),
        ],
        Arc::new(NoopModerationGate),
        fast_settings(),
    )
    .with_rate_limits(tracker.clone());

    let result = orchestrator
        .generate(&GenerationRequest::new("a snowy rooftop"), &SelectionOptions::new())
        .await
        .unwrap();

    assert_eq!(result.provider, "backup");
    assert_eq!(limited.calls(), 1);
    assert_eq!(tracker.check_limit("limited").await.unwrap().daily_usage, 1);

    let records = orchestrator.get_cost_records();
    assert_eq!(records[0].provider, "limited");
    assert!(!records[0].successful);
    assert_eq!(records[0].metadata["attempts"], 1);
}

#[tokio::test]
async fn test_failover_delay_only_before_called_providers() {
    let failing = MockProvider::failing(ProviderError::Timeout);
    let tracker = Arc::new(RateLimitTracker::new(Arc::new(MemoryKeyValueStore::new())));
    let settings = OrchestratorSettings {
        failover_delay: Duration::from_millis(300),
        ..fast_settings()
    };
    let orchestrator = build(
        vec![
            (descriptor("failing", 3), failing.clone()),
            (descriptor("spent-1", 2).with_limits(Some(1), None), MockProvider::succeeding(1.0)),
            (descriptor("spent-2", 1).with_limits(Some(1), None), MockProvider::succeeding(1.0)),
        ],
        Arc::new(NoopModerationGate),
        settings,
    )
    .with_rate_limits(tracker.clone());
    tracker.increment("spent-1").await.unwrap();
    tracker.increment("spent-2").await.unwrap();

    let started = Instant::now();
    let err = orchestrator
        .generate(&GenerationRequest::new("a rusty gate"), &SelectionOptions::new())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(300));
    match err {
        GenerationError::AllProvidersExhausted { failures } => {
            let order: Vec<&str> = failures.iter().map(|f| f.provider.as_str()).collect();
            assert_eq!(order, vec!["failing", "spent-1", "spent-2"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(failing.calls(), 3);
}

#[tokio::test]
async fn test_failover_delay_precedes_next_call() {
    let settings = OrchestratorSettings {
        failover_delay: Duration::from_millis(100),
        ..fast_settings()
    };
    let orchestrator = build(
        vec![
            (descriptor("failing", 2), MockProvider::failing(ProviderError::Timeout)),
            (descriptor("backup", 1), MockProvider::succeeding(1.0)),
        ],
        Arc::new(NoopModerationGate),
        settings,
    );

    let started = Instant::now();
    let result = orchestrator
        .generate(&GenerationRequest::new("a rusty gate"), &SelectionOptions::new())
        .await
        .unwrap();
    assert_eq!(result.provider, "backup");
    assert!(started.elapsed() >= Duration::from_millis(100));
}
