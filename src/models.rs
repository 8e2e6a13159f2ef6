//! Core data model: deploy requests, plans, and deployment results.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog;
use crate::scaling::ScalingPolicy;

/// How aggressively the backends should optimize for cold-start latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStartMode {
    FastBoot,
    NoFastBoot,
}

impl ColdStartMode {
    pub fn is_fast_boot(self) -> bool {
        matches!(self, ColdStartMode::FastBoot)
    }
}

/// What the user asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub model_name: String,
    /// Canonical short GPU name ("L4", "H100", ...).
    pub gpu: String,
    pub gpu_count: u32,
    pub tp_size: u32,
    pub max_model_len: u32,
    pub serverless_provider: String,
    pub spot_cloud: String,
    pub region: Option<String>,
    pub cold_start_mode: ColdStartMode,
    pub scaling: ScalingPolicy,
    /// Identity of the deployment; auto-generated when absent.
    pub service_name: String,
    /// Grant anonymous invoke on the backends.
    pub public: bool,
    /// Skip spot and router entirely.
    pub serverless_only: bool,
    /// Resolved at launch time from the chosen serverless provider.
    pub vllm_version: String,
}

impl DeployRequest {
    /// Build a request with defaults, normalizing the GPU name and
    /// generating a `tuna-<8 hex>` service name when none is given.
    pub fn new(model_name: impl Into<String>, gpu: impl Into<String>) -> Self {
        let gpu = gpu.into();
        // Unknown GPUs pass through; provider-level validation rejects them.
        let gpu = catalog::normalize_gpu_name(&gpu).unwrap_or(gpu);
        Self {
            model_name: model_name.into(),
            gpu,
            gpu_count: 1,
            tp_size: 1,
            max_model_len: 4096,
            serverless_provider: "modal".to_string(),
            spot_cloud: "aws".to_string(),
            region: None,
            cold_start_mode: ColdStartMode::FastBoot,
            scaling: ScalingPolicy::default(),
            service_name: generate_service_name(),
            public: false,
            serverless_only: false,
            vllm_version: "0.15.1".to_string(),
        }
    }

    pub fn with_service_name(mut self, name: Option<String>) -> Self {
        if let Some(name) = name {
            self.service_name = name;
        }
        self
    }
}

/// Generate a fresh `tuna-<8 hex>` service name.
pub fn generate_service_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("tuna-{}", &id[..8])
}

/// A rendered, not-yet-executed deployment artifact.
///
/// Pure output of `plan()`: rendering it must not touch any control plane.
/// `metadata` carries every identifier a later `deploy`/`destroy`/`status`
/// will need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPlan {
    pub provider: String,
    pub rendered_script: String,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// Outcome of a single backend deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub provider: String,
    pub endpoint_url: Option<String>,
    pub health_url: Option<String>,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl DeploymentResult {
    pub fn ok(
        provider: impl Into<String>,
        endpoint_url: impl Into<String>,
        health_url: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint_url: Some(endpoint_url.into()),
            health_url: Some(health_url.into()),
            error: None,
            metadata,
        }
    }

    /// An error-carrying result. `metadata` must hold whatever the plan
    /// captured so destroy can still find the resources.
    pub fn failed(
        provider: impl Into<String>,
        error: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint_url: None,
            health_url: None,
            error: Some(error.into()),
            metadata,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.endpoint_url.is_some()
    }
}

/// Combined result of one deploy invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HybridDeployment {
    pub serverless: Option<DeploymentResult>,
    pub spot: Option<DeploymentResult>,
    pub router: Option<DeploymentResult>,
    /// The URL clients should talk to.
    pub router_url: Option<String>,
}

impl HybridDeployment {
    /// True when no component launched successfully.
    pub fn total_failure(&self) -> bool {
        ![&self.serverless, &self.spot, &self.router]
            .iter()
            .any(|c| c.as_ref().map(|r| r.error.is_none()).unwrap_or(false))
    }

    /// True when at least one component reported an error.
    pub fn has_error(&self) -> bool {
        [&self.serverless, &self.spot, &self.router]
            .iter()
            .any(|c| c.as_ref().map(|r| r.error.is_some()).unwrap_or(false))
    }
}

/// Result of a single preflight validation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
    /// Exact shell command that fixes the failure, when one exists.
    pub fix_command: Option<String>,
    /// True when the check failed but we repaired it automatically.
    pub auto_fixed: bool,
}

impl PreflightCheck {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            fix_command: None,
            auto_fixed: false,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            fix_command: None,
            auto_fixed: false,
        }
    }

    pub fn with_fix(mut self, fix_command: impl Into<String>) -> Self {
        self.fix_command = Some(fix_command.into());
        self
    }

    pub fn auto_fixed(mut self) -> Self {
        self.auto_fixed = true;
        self
    }
}

/// Aggregated result of all preflight checks for a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreflightResult {
    pub provider: String,
    pub checks: Vec<PreflightCheck>,
}

impl PreflightResult {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            checks: Vec::new(),
        }
    }

    pub fn push(&mut self, check: PreflightCheck) {
        self.checks.push(check);
    }

    pub fn ok(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed(&self) -> Vec<&PreflightCheck> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    /// Joined failure messages, for error reporting.
    pub fn failure_summary(&self) -> String {
        self.failed()
            .iter()
            .map(|c| c.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_service_name_shape() {
        let request = DeployRequest::new("meta-llama/Llama-3.1-8B", "L4");
        let name = &request.service_name;
        assert!(name.starts_with("tuna-"), "got {name}");
        let suffix = &name["tuna-".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_service_names_unique() {
        let names: HashSet<String> = (0..10_000).map(|_| generate_service_name()).collect();
        assert_eq!(names.len(), 10_000);
    }

    #[test]
    fn test_gpu_alias_normalized() {
        let request = DeployRequest::new("m", "A100");
        assert_eq!(request.gpu, "A100_80GB");
    }

    #[test]
    fn test_unknown_gpu_passes_through() {
        let request = DeployRequest::new("m", "TPU9000");
        assert_eq!(request.gpu, "TPU9000");
    }

    #[test]
    fn test_explicit_service_name_kept() {
        let request =
            DeployRequest::new("m", "L4").with_service_name(Some("my-deploy".to_string()));
        assert_eq!(request.service_name, "my-deploy");
    }

    #[test]
    fn test_total_failure_detection() {
        let mut deployment = HybridDeployment::default();
        assert!(deployment.total_failure());
        deployment.serverless = Some(DeploymentResult::failed("modal", "boom", HashMap::new()));
        assert!(deployment.total_failure());
        assert!(deployment.has_error());
        deployment.spot = Some(DeploymentResult::ok(
            "skyserve",
            "http://1.2.3.4:30001",
            "http://1.2.3.4:30001/health",
            HashMap::new(),
        ));
        assert!(!deployment.total_failure());
    }

    #[test]
    fn test_preflight_result_ok() {
        let mut result = PreflightResult::new("runpod");
        result.push(PreflightCheck::pass("api_key", "set"));
        assert!(result.ok());
        result.push(
            PreflightCheck::fail("api_key_valid", "401 Unauthorized")
                .with_fix("export RUNPOD_API_KEY=<your-key>"),
        );
        assert!(!result.ok());
        assert_eq!(result.failed().len(), 1);
        assert!(result.failure_summary().contains("401"));
    }

    #[test]
    fn test_request_roundtrips_through_json() {
        let request = DeployRequest::new("meta-llama/Llama-3.1-8B", "H100");
        let json = serde_json::to_string(&request).unwrap();
        let back: DeployRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.service_name, request.service_name);
        assert_eq!(back.gpu, "H100");
        assert_eq!(back.cold_start_mode, ColdStartMode::FastBoot);
    }
}
