//! HttpProvider Tests
//!
//! Tests for:
//! - Submit, poll and result mapping against a mock REST provider
//! - Status classification into retryable and rejected errors
//! - Provider circuit tripping on repeated server errors
//! - Health probe

use std::time::Duration;

use pq_common::GenerationRequest;
use pq_provider::{
    CircuitSettings, CircuitState, GenerationProvider, HttpProvider, HttpProviderConfig, ProviderDescriptor, ProviderError, ProviderId,
    ProviderJobStatus,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> HttpProvider {
    let descriptor = ProviderDescriptor::new(ProviderId::new("mock-http").unwrap(), 1, ["*"])
        .unwrap()
        .with_cost("sdxl", 0.02);
    let config = HttpProviderConfig {
        api_key: Some("secret-key".into()),
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        max_poll_attempts: 3,
        circuit: CircuitSettings {
            failure_threshold: 2,
            success_threshold: 1,
            cool_down: Duration::from_secs(60),
        },
        ..HttpProviderConfig::new(server.uri())
    };
    HttpProvider::new(descriptor, config).unwrap()
}

fn image() -> serde_json::Value {
    json!({ "url": "https://cdn.example/out.png", "width": 1024, "height": 1024, "contentType": "image/png" })
}

#[tokio::test]
async fn test_immediate_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generations"))
        .and(header("authorization", "Bearer secret-key"))
        .and(body_partial_json(json!({ "prompt": "a koi pond", "model": "sdxl" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-1",
            "status": "succeeded",
            "images": [image()],
            "cost": 0.05
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = provider(&server)
        .generate(&GenerationRequest::new("a koi pond").with_model("sdxl"))
        .await
        .unwrap();

    assert_eq!(result.provider, "mock-http");
    assert_eq!(result.provider_job_id.as_deref(), Some("gen-1"));
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.images[0].content_type.as_deref(), Some("image/png"));
    assert_eq!(result.cost, 0.05);
}

#[tokio::test]
async fn test_polls_until_finished_and_estimates_missing_cost() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generations"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "id": "gen-2", "status": "queued" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/generations/gen-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-2",
            "status": "succeeded",
            "images": [image(), image()]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = GenerationRequest::new("two owls").with_model("sdxl").with_num_images(2);
    let result = provider(&server).generate(&request).await.unwrap();

    assert_eq!(result.images.len(), 2);
    assert!((result.cost - 0.04).abs() < 1e-9);
}

#[tokio::test]
async fn test_poll_budget_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generations"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "id": "gen-3", "status": "queued" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/generations/gen-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "gen-3", "status": "running", "progress": 40.0 })))
        .expect(3)
        .mount(&server)
        .await;

    let err = provider(&server).generate(&GenerationRequest::new("slow")).await.unwrap_err();
    assert_eq!(err, ProviderError::PollTimeout("gen-3".into()));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_failed_generation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-4",
            "status": "failed",
            "error": "NSFW content detected"
        })))
        .mount(&server)
        .await;

    let err = provider(&server).generate(&GenerationRequest::new("x")).await.unwrap_err();
    assert_eq!(
        err,
        ProviderError::JobFailed {
            job_id: "gen-4".into(),
            message: "NSFW content detected".into()
        }
    );
}

#[tokio::test]
async fn test_client_errors_are_rejections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generations"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let p = provider(&server);
    let err = p.generate(&GenerationRequest::new("x")).await.unwrap_err();
    assert_eq!(
        err,
        ProviderError::Rejected {
            status: 401,
            message: "invalid api key".into()
        }
    );
    assert!(!err.is_retryable());

    // Configuration errors do not trip the circuit
    p.generate(&GenerationRequest::new("x")).await.unwrap_err();
    assert_eq!(p.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_throttling_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generations"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;

    let p = provider(&server);
    let err = p.generate(&GenerationRequest::new("x")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Http { status: 429, .. }));
    assert!(err.is_retryable());
    p.generate(&GenerationRequest::new("x")).await.unwrap_err();
    assert_eq!(p.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_server_errors_open_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generations"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let p = provider(&server);
    for _ in 0..2 {
        let err = p.generate(&GenerationRequest::new("x")).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Http {
                status: 503,
                message: "overloaded".into()
            }
        );
    }
    assert_eq!(p.circuit_state(), CircuitState::Open);

    let err = p.generate(&GenerationRequest::new("x")).await.unwrap_err();
    assert_eq!(err, ProviderError::CircuitOpen);
    assert!(!p.is_available().await.unwrap());

    let snapshot = p.circuit().unwrap();
    assert_eq!(snapshot.provider, "mock-http");
    assert_eq!(snapshot.state, CircuitState::Open);
    assert_eq!(snapshot.rejected_calls, 1);
}

#[tokio::test]
async fn test_circuit_settings_come_from_provider_config() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generations"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let config = pq_config::ProviderConfig {
        id: "single-strike".into(),
        base_url: server.uri(),
        circuit_failure_threshold: 1,
        circuit_cool_down_ms: 60_000,
        ..Default::default()
    };
    let p = HttpProvider::from_config(&config).unwrap();
    assert_eq!(p.circuit().unwrap().state, CircuitState::Closed);

    p.generate(&GenerationRequest::new("x")).await.unwrap_err();
    assert_eq!(p.circuit_state(), CircuitState::Open);
    assert_eq!(p.generate(&GenerationRequest::new("x")).await.unwrap_err(), ProviderError::CircuitOpen);
}

#[tokio::test]
async fn test_health_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    assert!(provider(&server).is_available().await.unwrap());

    let down = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&down)
        .await;
    assert!(!provider(&down).is_available().await.unwrap());
}

#[tokio::test]
async fn test_poll_job_maps_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/generations/gen-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "gen-9", "status": "processing", "progress": 75.0 })))
        .mount(&server)
        .await;

    let status = provider(&server).poll_job("gen-9").await.unwrap();
    assert_eq!(status, ProviderJobStatus::Running { progress: Some(75.0) });
}

#[tokio::test]
async fn test_unreachable_provider() {
    let server = MockServer::start().await;
    let p = provider(&server);
    drop(server);

    let err = p.generate(&GenerationRequest::new("x")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Connection(_) | ProviderError::Timeout));
    assert!(p.is_available().await.is_err());
}
