//! PixelQ Generation Worker
//!
//! Consumes image-generation jobs from the embedded queue and dispatches
//! them through the provider orchestrator.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PIXELQ_CONFIG` | - | Path to the TOML configuration file |
//! | `PIXELQ_METRICS_ADDR` | - | Serve Prometheus metrics on this address, e.g. `0.0.0.0:9464` |
//! | `PIXELQ_JOBS_FILE` | - | JSON-lines file of generation payloads enqueued at startup |
//! | `PIXELQ_WORKER_CONCURRENCY` | `5` | Concurrent jobs |
//! | `RUST_LOG` | `info` | Log filter |
//! | `LOG_FORMAT` | `text` | `json` for structured output |
//!
//! All `PIXELQ_*` overrides understood by the config loader apply as well.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};

use pq_config::{AppConfig, ConfigLoader};
use pq_jobs::{
    BulkJob, ConsumerConfig, JobConsumer, JobDurationTracker, JobMetricsCollector, JobOptions, JobProducer,
    MetricsHookBus, PriorityMapper, RetryPolicyRegistry,
};
use pq_provider::{
    GenerationJobHandler, GenerationOrchestrator, HttpProvider, KeywordModerationGate, ModerationGate,
    NoopModerationGate, OrchestratorSettings, ProviderSelector, RateLimitTracker, SelectionStrategy,
    GENERATION_JOB_TYPE,
};
use pq_queue::{KeyValueStore, MemoryKeyValueStore, MemoryQueue, QueueNames};

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const COMPLETED_RETENTION: Duration = Duration::from_secs(60 * 60);
const FAILED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    pq_common::logging::init_logging("pq-worker");

    info!("Starting PixelQ generation worker");

    let config = ConfigLoader::new().load().context("failed to load configuration")?;

    if let Ok(addr) = std::env::var("PIXELQ_METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().context("invalid PIXELQ_METRICS_ADDR")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Prometheus metrics exporter listening");
    }

    let names = QueueNames::new(&config.queue.prefix, &config.queue.environment)?;
    let queue_name = names.queue_name(&config.queue.name);

    let orchestrator = Arc::new(build_orchestrator(&config, &names).await?);

    let backend = Arc::new(MemoryQueue::new(queue_name.clone()));
    let hooks = Arc::new(MetricsHookBus::new());
    let registry = Arc::new(RetryPolicyRegistry::with_overrides(&config.jobs));
    let priorities = Arc::new(PriorityMapper::with_tiers(&config.tiers));

    let collector = Arc::new(JobMetricsCollector::new());
    let tracker = JobDurationTracker::new(collector.clone());
    tracker.install(&hooks);

    let producer = JobProducer::new(backend.clone(), registry.clone(), priorities, hooks.clone());
    let consumer = Arc::new(JobConsumer::new(
        backend,
        Arc::new(GenerationJobHandler::new(orchestrator.clone())),
        hooks,
        registry,
        ConsumerConfig::from(&config.queue).with_env_overrides(),
    ));

    if let Ok(path) = std::env::var("PIXELQ_JOBS_FILE") {
        let count = enqueue_from_file(&producer, &path).await?;
        info!(count, path = %path, "Seeded jobs from file");
    }

    print_startup_info(&config, &queue_name, &orchestrator, consumer.config());

    let consumer_task = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };

    // Reports depth and drops terminal jobs past retention
    let reporter = {
        let collector = collector.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_REPORT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = producer.clean_completed(COMPLETED_RETENTION).await {
                    warn!(error = %e, "Failed to clean completed jobs");
                }
                if let Err(e) = producer.clean_failed(FAILED_RETENTION).await {
                    warn!(error = %e, "Failed to clean failed jobs");
                }
                match producer.get_metrics().await {
                    Ok(counts) => info!(
                        waiting = counts.waiting,
                        active = counts.active,
                        delayed = counts.delayed,
                        completed = counts.completed,
                        failed = counts.failed,
                        "Queue depth"
                    ),
                    Err(e) => warn!(error = %e, "Failed to read queue counts"),
                }
                let snapshot = collector.get_metrics();
                info!(
                    completed = snapshot.total_completed,
                    failed = snapshot.total_failed,
                    success_rate = snapshot.success_rate,
                    p95_ms = snapshot.processing_time.p95_ms,
                    "Job metrics"
                );
            }
        })
    };

    shutdown_signal().await;
    info!("Shutdown signal received, draining in-flight jobs");

    reporter.abort();
    consumer.shutdown().await;
    if let Err(e) = consumer_task.await {
        warn!(error = %e, "Consumer task ended abnormally");
    }

    info!(
        total_cost = orchestrator.get_total_cost(),
        generations = orchestrator.get_cost_records().len(),
        "PixelQ worker stopped"
    );
    Ok(())
}

async fn build_orchestrator(config: &AppConfig, names: &QueueNames) -> anyhow::Result<GenerationOrchestrator> {
    let strategy: SelectionStrategy = config.orchestrator.strategy.parse()?;
    let mut selector = ProviderSelector::new().with_default_strategy(strategy);
    if let Some(model) = &config.orchestrator.default_model {
        selector = selector.with_default_model(model.clone());
    }

    for provider_config in &config.providers {
        let provider = HttpProvider::from_config(provider_config)?;
        let descriptor = provider.descriptor().clone();
        selector.register(descriptor, Arc::new(provider))?;
    }
    if selector.is_empty() {
        warn!("No providers configured; every generation job will fail");
    }

    let moderation: Arc<dyn ModerationGate> = if config.moderation.enabled {
        Arc::new(KeywordModerationGate::new(&config.moderation.blocked_terms))
    } else {
        Arc::new(NoopModerationGate)
    };

    let store = rate_counter_store(config).await?;
    let tracker = Arc::new(RateLimitTracker::new(store).with_prefix(names.prefix()));

    Ok(GenerationOrchestrator::new(selector, moderation, OrchestratorSettings::from(&config.orchestrator))
        .with_rate_limits(tracker))
}

#[cfg(feature = "redis")]
async fn rate_counter_store(config: &AppConfig) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    if config.redis.enabled {
        let store = pq_queue::RedisKeyValueStore::connect(&config.redis.url).await?;
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(MemoryKeyValueStore::new()))
}

#[cfg(not(feature = "redis"))]
async fn rate_counter_store(config: &AppConfig) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    if config.redis.enabled {
        warn!("Redis requested but pq-worker was built without the redis feature; using in-memory counters");
    }
    Ok(Arc::new(MemoryKeyValueStore::new()))
}

/// Enqueue one generation job per non-empty line.
async fn enqueue_from_file(producer: &JobProducer, path: &str) -> anyhow::Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read jobs file {}", path))?;

    let jobs = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            let payload: serde_json::Value =
                serde_json::from_str(line).with_context(|| format!("invalid job on line {}", i + 1))?;
            let tier = payload.get("tier").and_then(|t| t.as_str()).map(str::to_string);
            let options = match tier {
                Some(tier) => JobOptions::new().tier(tier),
                None => JobOptions::new(),
            };
            Ok(BulkJob::new(GENERATION_JOB_TYPE, payload, options))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let created = producer.add_bulk(jobs).await?;
    Ok(created.len())
}

fn print_startup_info(config: &AppConfig, queue_name: &str, orchestrator: &GenerationOrchestrator, consumer: &ConsumerConfig) {
    info!("==========================================");
    info!("PixelQ Worker Configuration");
    info!("==========================================");
    info!("  Queue: {}", queue_name);
    info!("  Concurrency: {}", consumer.concurrency);
    info!("  Lock duration: {}ms", consumer.lock_duration.as_millis());
    info!("  Strategy: {}", config.orchestrator.strategy);
    info!("  Max retries per provider: {}", orchestrator.settings().max_retries);
    info!("  Moderation: {}", if config.moderation.enabled { "Enabled" } else { "Disabled" });
    info!("  Rate counters: {}", if config.redis.enabled { "Redis" } else { "In-memory" });
    for provider in orchestrator.selector().providers() {
        info!(
            "  Provider: {} (weight {}, {})",
            provider.id(),
            provider.descriptor.priority_weight,
            if provider.descriptor.enabled { "enabled" } else { "disabled" }
        );
    }
    info!("==========================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
