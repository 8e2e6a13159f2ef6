//! Orchestrator behavior with in-registry fake providers: the preflight
//! gate, failure wrapping in the parallel launch, metadata preservation,
//! and destroy semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use tuna::error::{Result, TunaError};
use tuna::models::{DeployRequest, DeploymentResult, PreflightCheck, PreflightResult, ProviderPlan};
use tuna::orchestrator::{destroy_hybrid, launch_hybrid, launch_serverless_only};
use tuna::providers::{registry, InferenceProvider};
use tuna::state::DeploymentRecord;

#[derive(Default)]
struct Calls {
    plan: u32,
    deploy: u32,
    destroy: u32,
    preflight: u32,
}

struct FakeProvider {
    name: &'static str,
    preflight_ok: bool,
    plan_fails: bool,
    deploy_error: Option<String>,
    /// Metadata attached to the fake's error result (may be empty to prove
    /// the orchestrator restores the plan's).
    deploy_error_metadata: HashMap<String, String>,
    calls: Arc<Mutex<Calls>>,
}

impl FakeProvider {
    fn new(name: &'static str) -> (Self, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        (
            Self {
                name,
                preflight_ok: true,
                plan_fails: false,
                deploy_error: None,
                deploy_error_metadata: HashMap::new(),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl InferenceProvider for FakeProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn auth_token(&self) -> String {
        "fake-token".to_string()
    }

    async fn preflight(&self, _request: &DeployRequest) -> PreflightResult {
        self.calls.lock().preflight += 1;
        let mut result = PreflightResult::new(self.name);
        if self.preflight_ok {
            result.push(PreflightCheck::pass("api_key", "set"));
        } else {
            result.push(
                PreflightCheck::fail("api_key", "API key environment variable is not set")
                    .with_fix("export FAKE_API_KEY=..."),
            );
        }
        result
    }

    fn plan(&self, request: &DeployRequest, _vllm_cmd: &str) -> Result<ProviderPlan> {
        self.calls.lock().plan += 1;
        if self.plan_fails {
            return Err(TunaError::PlanInvalid(format!(
                "unknown GPU type: {:?}",
                request.gpu
            )));
        }
        Ok(ProviderPlan {
            provider: self.name.to_string(),
            rendered_script: String::new(),
            env: HashMap::new(),
            metadata: HashMap::from([
                (
                    "endpoint_name".to_string(),
                    format!("{}-serverless", request.service_name),
                ),
                ("fake_id".to_string(), "id-123".to_string()),
            ]),
        })
    }

    async fn deploy(&self, plan: &ProviderPlan) -> DeploymentResult {
        self.calls.lock().deploy += 1;
        match &self.deploy_error {
            Some(error) => DeploymentResult::failed(
                self.name,
                error.clone(),
                self.deploy_error_metadata.clone(),
            ),
            None => DeploymentResult::ok(
                self.name,
                "https://fake.example.com",
                "https://fake.example.com/health",
                plan.metadata.clone(),
            ),
        }
    }

    async fn destroy(&self, _result: &DeploymentResult) {
        self.calls.lock().destroy += 1;
    }

    async fn status(&self, _service_name: &str) -> Value {
        json!({ "provider": self.name, "status": "running" })
    }
}

#[tokio::test]
async fn test_preflight_gate_blocks_everything() {
    let (mut provider, calls) = FakeProvider::new("gate-fail");
    provider.preflight_ok = false;
    registry::register("gate-fail", Arc::new(provider));

    let mut request = DeployRequest::new("m", "L4");
    request.serverless_provider = "gate-fail".to_string();
    let service_name = request.service_name.clone();

    let result = launch_hybrid(&mut request, false).await.unwrap();

    let serverless = result.serverless.expect("error-carrying serverless result");
    let error = serverless.error.expect("preflight error");
    assert!(error.contains("Preflight failed"), "got {error}");
    assert!(error.contains("API key environment variable is not set"));
    assert_eq!(
        serverless.metadata.get("service_name").map(String::as_str),
        Some(format!("{service_name}-serverless").as_str())
    );
    assert!(result.spot.is_none());
    assert!(result.router.is_none());
    assert!(result.router_url.is_none());

    // The gate fired before any resource-touching call.
    let calls = calls.lock();
    assert_eq!(calls.preflight, 1);
    assert_eq!(calls.plan, 0);
    assert_eq!(calls.deploy, 0);
}

#[tokio::test]
async fn test_serverless_only_restores_plan_metadata_on_deploy_error() {
    let (mut provider, calls) = FakeProvider::new("meta-preserve");
    provider.deploy_error = Some("upstream API error".to_string());
    // The fake loses its metadata on the error path on purpose.
    provider.deploy_error_metadata = HashMap::new();
    registry::register("meta-preserve", Arc::new(provider));

    let mut request = DeployRequest::new("m", "L4");
    request.serverless_provider = "meta-preserve".to_string();
    request.serverless_only = true;

    let result = launch_serverless_only(&mut request).await.unwrap();
    let serverless = result.serverless.unwrap();
    assert_eq!(serverless.error.as_deref(), Some("upstream API error"));
    // The orchestrator merged the captured plan metadata back in, so
    // destroy can still find the resources.
    assert_eq!(serverless.metadata.get("fake_id").map(String::as_str), Some("id-123"));
    assert!(serverless.metadata.contains_key("endpoint_name"));
    assert_eq!(calls.lock().deploy, 1);
}

#[tokio::test]
async fn test_parallel_launch_isolates_component_failures() {
    let (mut serverless_provider, _) = FakeProvider::new("plan-blows-up");
    serverless_provider.plan_fails = true;
    registry::register("plan-blows-up", Arc::new(serverless_provider));

    let (spot_provider, spot_calls) = FakeProvider::new("skyserve");
    registry::register("skyserve", Arc::new(spot_provider));

    let mut request = DeployRequest::new("m", "ZZZ9000");
    request.serverless_provider = "plan-blows-up".to_string();

    let result = launch_hybrid(&mut request, false).await.unwrap();

    // Serverless failed at plan time; the error was wrapped, not raised.
    let serverless = result.serverless.unwrap();
    assert!(serverless.error.as_deref().unwrap().contains("unknown GPU type"));

    // Spot still launched despite the serverless failure.
    let spot = result.spot.unwrap();
    assert!(spot.error.is_none(), "spot failed: {:?}", spot.error);
    assert_eq!(spot.endpoint_url.as_deref(), Some("https://fake.example.com"));
    assert_eq!(spot_calls.lock().deploy, 1);

    // No workload scheduler on this machine: the router VM fallback fails,
    // but as an error-carrying result, never a crash.
    let router = result.router.unwrap();
    assert!(router.error.is_some());
}

fn record_for(service: &str, serverless: &'static str, spot: Option<&'static str>) -> DeploymentRecord {
    DeploymentRecord {
        service_name: service.to_string(),
        serverless_provider_name: Some(serverless.to_string()),
        spot_provider_name: spot.map(str::to_string),
        serverless_metadata: HashMap::from([("fake_id".to_string(), "id-123".to_string())]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let (serverless_provider, serverless_calls) = FakeProvider::new("destroy-serverless");
    registry::register("destroy-serverless", Arc::new(serverless_provider));
    let (spot_provider, spot_calls) = FakeProvider::new("destroy-spot");
    registry::register("destroy-spot", Arc::new(spot_provider));

    let record = record_for("tuna-idempotent", "destroy-serverless", Some("destroy-spot"));

    destroy_hybrid("tuna-idempotent", Some(&record), true).await.unwrap();
    destroy_hybrid("tuna-idempotent", Some(&record), true).await.unwrap();

    // Both passes called both providers; neither raised.
    assert_eq!(serverless_calls.lock().destroy, 2);
    assert_eq!(spot_calls.lock().destroy, 2);
}

#[tokio::test]
async fn test_destroy_unknown_provider_errors_but_other_records_proceed() {
    let (good_provider, good_calls) = FakeProvider::new("destroy-good");
    registry::register("destroy-good", Arc::new(good_provider));

    let bad = record_for("tuna-bad", "no-such-provider-xyz", None);
    let good = record_for("tuna-good", "destroy-good", None);

    // Batch-style loop: one failure is collected, the rest continue.
    let mut failures = Vec::new();
    for record in [&bad, &good] {
        if let Err(e) = destroy_hybrid(&record.service_name, Some(record), true).await {
            failures.push((record.service_name.clone(), e));
        }
    }

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "tuna-bad");
    assert!(failures[0].1.to_string().contains("no-such-provider-xyz"));
    assert_eq!(good_calls.lock().destroy, 1);
}

#[tokio::test]
async fn test_destroy_serverless_only_record_skips_spot_and_router() {
    let (serverless_provider, calls) = FakeProvider::new("destroy-solo");
    registry::register("destroy-solo", Arc::new(serverless_provider));

    let record = record_for("tuna-solo", "destroy-solo", None);
    destroy_hybrid("tuna-solo", Some(&record), true).await.unwrap();

    assert_eq!(calls.lock().destroy, 1);
}
