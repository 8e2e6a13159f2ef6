//! Backend providers — a uniform lifecycle over heterogeneous control planes.
//!
//! Every backend (serverless platforms and the spot launcher) implements
//! [`InferenceProvider`]: `plan` is pure and records in its metadata every
//! identifier that `deploy`/`destroy`/`status` will need later; `deploy`
//! never propagates an error — failures come back as an error-carrying
//! [`DeploymentResult`] that keeps the plan's metadata so teardown can
//! still find whatever was created.

pub mod registry;

#[cfg(feature = "azure")]
pub mod azure;
#[cfg(feature = "baseten")]
pub mod baseten;
#[cfg(feature = "cerebrium")]
pub mod cerebrium;
#[cfg(feature = "cloudrun")]
pub mod cloudrun;
#[cfg(feature = "modal")]
pub mod modal;
#[cfg(feature = "runpod")]
pub mod runpod;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::Result;
use crate::models::{DeployRequest, DeploymentResult, PreflightResult, ProviderPlan};

/// Shared HTTP client for provider control-plane calls.
pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
        reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client")
    });
    &CLIENT
}

/// Lifecycle contract every backend implements.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Stable identifier: "modal", "runpod", "skyserve", ...
    fn name(&self) -> &'static str;

    /// The vLLM version this backend will actually run. The orchestrator
    /// pins rendered artifacts to it so both backends serve the same build.
    async fn vllm_version(&self) -> String {
        "0.15.1".to_string()
    }

    /// Bearer token the router must inject when proxying to this backend.
    /// Empty when the backend accepts anonymous invokes.
    fn auth_token(&self) -> String {
        String::new()
    }

    /// Pure validation of credentials and configuration. Must not create
    /// any resource.
    async fn preflight(&self, _request: &DeployRequest) -> PreflightResult {
        PreflightResult::new(self.name())
    }

    /// Render the deployment artifact. Pure; may reject invariants it
    /// knows up front (unknown GPU, unsupported parallelism).
    fn plan(&self, request: &DeployRequest, vllm_cmd: &str) -> Result<ProviderPlan>;

    /// Execute the plan. On any failure the returned result carries the
    /// plan's metadata.
    async fn deploy(&self, plan: &ProviderPlan) -> DeploymentResult;

    /// Tear down. Idempotent, best-effort; never fails on missing or
    /// already-gone resources.
    async fn destroy(&self, result: &DeploymentResult);

    /// Read-only status lookup by service name.
    async fn status(&self, service_name: &str) -> Value;
}

/// Run a CLI tool with a wall-clock bound, capturing output.
pub(crate) async fn run_with_timeout(
    command: &mut tokio::process::Command,
    timeout: std::time::Duration,
) -> Result<std::process::Output> {
    let label = format!("{:?}", command.as_std().get_program());
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(crate::error::TunaError::Timeout(format!(
            "{label} did not finish within {}s",
            timeout.as_secs()
        ))),
    }
}

/// Providers that expose exactly one GPU per container instance reject
/// multi-GPU requests at plan time.
pub(crate) fn reject_multi_gpu(provider: &str, request: &DeployRequest) -> Result<()> {
    if request.tp_size > 1 || request.gpu_count > 1 {
        return Err(crate::error::TunaError::PlanInvalid(format!(
            "{provider} exposes one GPU per instance; tp_size and gpu_count must be 1 \
             (got tp_size={}, gpu_count={})",
            request.tp_size, request.gpu_count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_multi_gpu() {
        let mut request = DeployRequest::new("m", "L4");
        assert!(reject_multi_gpu("cloudrun", &request).is_ok());
        request.tp_size = 2;
        assert!(reject_multi_gpu("cloudrun", &request).is_err());
        request.tp_size = 1;
        request.gpu_count = 4;
        assert!(reject_multi_gpu("cloudrun", &request).is_err());
    }
}
