//! RunPod serverless provider — vLLM workers on RunPod's REST API.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::catalog;
use crate::error::{Result, TunaError};
use crate::models::{
    DeployRequest, DeploymentResult, PreflightCheck, PreflightResult, ProviderPlan,
};
use crate::providers::{http_client, InferenceProvider};

const DEFAULT_API_BASE: &str = "https://rest.runpod.io/v1";
const WORKER_IMAGE: &str = "runpod/worker-v1-vllm:v2.11.3";
const VLLM_FALLBACK: &str = "0.11.0";
const DOCKERFILE_URL: &str =
    "https://raw.githubusercontent.com/runpod-workers/worker-vllm/main/Dockerfile";
const KEY_HINT: &str =
    "export RUNPOD_API_KEY=<your-key>  # https://www.runpod.io/console/user/settings";

fn api_key() -> Option<String> {
    std::env::var("RUNPOD_API_KEY").ok().filter(|k| !k.is_empty())
}

/// Deploy a vLLM server on RunPod Serverless GPUs.
pub struct RunPodProvider {
    api_base: String,
}

impl Default for RunPodProvider {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl RunPodProvider {
    /// Point the provider at an alternate API base (tests).
    pub fn with_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }

    fn bearer(&self) -> Result<String> {
        api_key()
            .map(|k| format!("Bearer {k}"))
            .ok_or_else(|| {
                TunaError::MissingCredentials(
                    "RUNPOD_API_KEY environment variable is not set. \
                     Get your API key from https://www.runpod.io/console/user/settings"
                        .to_string(),
                )
            })
    }

    async fn delete(&self, bearer: &str, path: &str) -> Result<()> {
        http_client()
            .delete(format!("{}/{path}", self.api_base))
            .header("Authorization", bearer)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl InferenceProvider for RunPodProvider {
    fn name(&self) -> &'static str {
        "runpod"
    }

    /// Read the vLLM version RunPod's worker image pins, falling back to a
    /// known-good version when GitHub is unreachable.
    async fn vllm_version(&self) -> String {
        let fetched = async {
            let body = http_client()
                .get(DOCKERFILE_URL)
                .timeout(std::time::Duration::from_secs(5))
                .send()
                .await
                .ok()?
                .error_for_status()
                .ok()?
                .text()
                .await
                .ok()?;
            body.lines().find_map(|line| {
                let (_, rest) = line.split_once("vllm==")?;
                let version = rest.split_whitespace().next()?;
                Some(version.trim_matches(['"', '\'']).to_string())
            })
        }
        .await;
        fetched.unwrap_or_else(|| {
            debug!("could not fetch RunPod vLLM version from GitHub, using fallback");
            VLLM_FALLBACK.to_string()
        })
    }

    fn auth_token(&self) -> String {
        api_key().unwrap_or_default()
    }

    async fn preflight(&self, _request: &DeployRequest) -> PreflightResult {
        let mut result = PreflightResult::new(self.name());

        let Some(key) = api_key() else {
            result.push(
                PreflightCheck::fail("api_key", "RUNPOD_API_KEY environment variable is not set")
                    .with_fix(KEY_HINT),
            );
            return result;
        };
        result.push(PreflightCheck::pass("api_key", "RUNPOD_API_KEY is set"));

        let response = http_client()
            .get(format!("{}/endpoints", self.api_base))
            .header("Authorization", format!("Bearer {key}"))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await;
        match response {
            Ok(r) if r.status().as_u16() == 401 => result.push(
                PreflightCheck::fail("api_key_valid", "RUNPOD_API_KEY is invalid (401 Unauthorized)")
                    .with_fix(KEY_HINT),
            ),
            Ok(r) => match r.error_for_status() {
                Ok(_) => result.push(PreflightCheck::pass("api_key_valid", "RUNPOD_API_KEY is valid")),
                Err(e) => result.push(PreflightCheck::fail(
                    "api_key_valid",
                    format!("RunPod API check failed: {e}"),
                )),
            },
            Err(e) if e.is_connect() => result.push(PreflightCheck::fail(
                "api_key_valid",
                "Could not reach RunPod API (connection error)",
            )),
            Err(e) => result.push(PreflightCheck::fail(
                "api_key_valid",
                format!("RunPod API check failed: {e}"),
            )),
        }

        result
    }

    fn plan(&self, request: &DeployRequest, _vllm_cmd: &str) -> Result<ProviderPlan> {
        let endpoint_name = format!("{}-serverless", request.service_name);

        let gpu_type_id = catalog::provider_gpu_id(&request.gpu, self.name()).ok_or_else(|| {
            let mut supported: Vec<&str> =
                catalog::provider_gpu_map(self.name()).into_keys().collect();
            supported.sort_unstable();
            TunaError::PlanInvalid(format!(
                "unknown GPU type for RunPod: {:?}. Supported: {supported:?}",
                request.gpu
            ))
        })?;

        let serverless = &request.scaling.serverless;
        let fast_boot = request.cold_start_mode.is_fast_boot();

        let mut env = HashMap::from([
            ("MODEL_NAME".to_string(), request.model_name.clone()),
            ("MAX_MODEL_LEN".to_string(), request.max_model_len.to_string()),
            ("TENSOR_PARALLEL_SIZE".to_string(), request.tp_size.to_string()),
            ("GPU_MEMORY_UTILIZATION".to_string(), "0.95".to_string()),
            ("MAX_CONCURRENCY".to_string(), serverless.concurrency.to_string()),
            ("DISABLE_LOG_REQUESTS".to_string(), "true".to_string()),
        ]);
        if fast_boot {
            env.insert("ENFORCE_EAGER".to_string(), "true".to_string());
        }
        if let Ok(hf_token) = std::env::var("HF_TOKEN") {
            if !hf_token.is_empty() {
                env.insert("HF_TOKEN".to_string(), hf_token);
            }
        }

        let metadata = HashMap::from([
            ("endpoint_name".to_string(), endpoint_name),
            ("image_name".to_string(), WORKER_IMAGE.to_string()),
            ("gpu_type_id".to_string(), gpu_type_id.to_string()),
            ("gpu_count".to_string(), request.gpu_count.to_string()),
            ("workers_min".to_string(), serverless.workers_min.to_string()),
            ("workers_max".to_string(), serverless.workers_max.to_string()),
            ("idle_timeout".to_string(), serverless.scaledown_window.to_string()),
            (
                "execution_timeout_ms".to_string(),
                (serverless.timeout * 1000).to_string(),
            ),
            ("flashboot".to_string(), fast_boot.to_string()),
            ("scaler_value".to_string(), serverless.scaler_value.to_string()),
        ]);

        Ok(ProviderPlan {
            provider: self.name().to_string(),
            rendered_script: String::new(),
            env,
            metadata,
        })
    }

    async fn deploy(&self, plan: &ProviderPlan) -> DeploymentResult {
        let endpoint_name = plan.metadata["endpoint_name"].clone();
        let base_meta =
            HashMap::from([("endpoint_name".to_string(), endpoint_name.clone())]);

        let bearer = match self.bearer() {
            Ok(b) => b,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), base_meta),
        };

        // Step 1: create the worker template.
        let template_payload = json!({
            "name": endpoint_name,
            "imageName": plan.metadata["image_name"],
            "containerDiskInGb": 50,
            "env": plan.env,
            "isServerless": true,
        });
        info!("creating RunPod template: {endpoint_name}");
        let template_id = match self
            .post_json(&bearer, "templates", &template_payload)
            .await
            .and_then(|v| {
                v.get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| TunaError::DeployFailed("template response missing id".into()))
            }) {
            Ok(id) => id,
            Err(e) => {
                warn!("RunPod template creation failed: {e}");
                return DeploymentResult::failed(
                    self.name(),
                    format!("Template creation failed: {e}"),
                    base_meta,
                );
            }
        };

        // Step 2: create the serverless endpoint against that template.
        let endpoint_payload = json!({
            "name": endpoint_name,
            "templateId": template_id,
            "gpuTypeIds": [plan.metadata["gpu_type_id"]],
            "gpuCount": plan.metadata["gpu_count"].parse::<u32>().unwrap_or(1),
            "workersMin": plan.metadata["workers_min"].parse::<u32>().unwrap_or(0),
            "workersMax": plan.metadata["workers_max"].parse::<u32>().unwrap_or(3),
            "idleTimeout": plan.metadata["idle_timeout"].parse::<u32>().unwrap_or(60),
            "executionTimeoutMs": plan.metadata["execution_timeout_ms"].parse::<u64>().unwrap_or(600_000),
            "flashboot": plan.metadata["flashboot"] == "true",
            "scalerType": "QUEUE_DELAY",
            "scalerValue": plan.metadata["scaler_value"].parse::<u32>().unwrap_or(4),
        });
        info!("creating RunPod endpoint: {endpoint_name}");
        let endpoint_id = match self
            .post_json(&bearer, "endpoints", &endpoint_payload)
            .await
            .and_then(|v| {
                v.get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| TunaError::DeployFailed("endpoint response missing id".into()))
            }) {
            Ok(id) => id,
            Err(e) => {
                warn!("RunPod endpoint creation failed: {e}");
                // The template is orphaned now — try to remove it, but keep
                // its id in metadata either way so destroy can finish the job.
                info!("cleaning up template {template_id} after endpoint failure");
                if self.delete(&bearer, &format!("templates/{template_id}")).await.is_err() {
                    warn!("failed to clean up template {template_id}");
                }
                let mut metadata = base_meta;
                metadata.insert("template_id".to_string(), template_id);
                return DeploymentResult::failed(
                    self.name(),
                    format!("Endpoint creation failed: {e}"),
                    metadata,
                );
            }
        };

        let endpoint_url = format!("https://api.runpod.ai/v2/{endpoint_id}/openai/v1");
        let health_url = format!("https://api.runpod.ai/v2/{endpoint_id}/health");
        info!("RunPod endpoint {endpoint_name} deployed at {endpoint_url}");
        DeploymentResult::ok(
            self.name(),
            endpoint_url,
            health_url,
            HashMap::from([
                ("endpoint_id".to_string(), endpoint_id),
                ("template_id".to_string(), template_id),
                ("endpoint_name".to_string(), endpoint_name),
            ]),
        )
    }

    async fn destroy(&self, result: &DeploymentResult) {
        let bearer = match self.bearer() {
            Ok(b) => b,
            Err(e) => {
                warn!("cannot destroy RunPod resources: {e}");
                return;
            }
        };

        match result.metadata.get("endpoint_id") {
            Some(endpoint_id) => {
                info!("deleting RunPod endpoint {endpoint_id}");
                if let Err(e) = self.delete(&bearer, &format!("endpoints/{endpoint_id}")).await {
                    warn!("failed to delete endpoint {endpoint_id}: {e}");
                }
            }
            None => warn!("no endpoint_id in metadata, skipping endpoint deletion"),
        }

        match result.metadata.get("template_id") {
            Some(template_id) => {
                info!("deleting RunPod template {template_id}");
                if let Err(e) = self.delete(&bearer, &format!("templates/{template_id}")).await {
                    warn!("failed to delete template {template_id}: {e}");
                }
            }
            None => warn!("no template_id in metadata, skipping template deletion"),
        }
    }

    async fn status(&self, service_name: &str) -> Value {
        let endpoint_name = format!("{service_name}-serverless");

        let bearer = match self.bearer() {
            Ok(b) => b,
            Err(_) => {
                return json!({
                    "provider": self.name(),
                    "status": "unknown",
                    "error": "RUNPOD_API_KEY not set",
                })
            }
        };

        let endpoints: Vec<Value> = match self.get_json(&bearer, "endpoints").await {
            Ok(Value::Array(list)) => list,
            Ok(_) => Vec::new(),
            Err(e) => {
                return json!({ "provider": self.name(), "status": "unknown", "error": e.to_string() })
            }
        };

        // RunPod may append " -fb" to flashboot endpoint names.
        let flashboot_name = format!("{endpoint_name} -fb");
        let endpoint_id = endpoints.iter().find_map(|ep| {
            let name = ep.get("name").and_then(Value::as_str)?;
            (name == endpoint_name || name == flashboot_name)
                .then(|| ep.get("id").and_then(Value::as_str))
                .flatten()
                .map(str::to_string)
        });

        let Some(endpoint_id) = endpoint_id else {
            return json!({
                "provider": self.name(),
                "endpoint_name": endpoint_name,
                "status": "not found",
            });
        };

        match self
            .get_json(&bearer, &format!("endpoints/{endpoint_id}?includeWorkers=true"))
            .await
        {
            Ok(data) => {
                let mut out = json!({
                    "provider": self.name(),
                    "endpoint_name": endpoint_name,
                    "endpoint_id": endpoint_id,
                    "status": "running",
                    "workers": data.get("workers").cloned().unwrap_or(json!({})),
                });
                if let Some(template_id) = data.get("templateId").and_then(Value::as_str) {
                    out["template_id"] = json!(template_id);
                }
                out
            }
            Err(e) => json!({
                "provider": self.name(),
                "endpoint_name": endpoint_name,
                "endpoint_id": endpoint_id,
                "status": "unknown",
                "error": e.to_string(),
            }),
        }
    }
}

impl RunPodProvider {
    async fn post_json(&self, bearer: &str, path: &str, payload: &Value) -> Result<Value> {
        let response = http_client()
            .post(format!("{}/{path}", self.api_base))
            .header("Authorization", bearer)
            .timeout(std::time::Duration::from_secs(30))
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get_json(&self, bearer: &str, path: &str) -> Result<Value> {
        let response = http_client()
            .get(format!("{}/{path}", self.api_base))
            .header("Authorization", bearer)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColdStartMode;

    fn request() -> DeployRequest {
        let mut r = DeployRequest::new("meta-llama/Llama-3.1-8B", "A100_80GB");
        r.serverless_provider = "runpod".to_string();
        r
    }

    #[test]
    fn test_plan_metadata_carries_everything_destroy_needs() {
        let provider = RunPodProvider::default();
        let plan = provider.plan(&request(), "").unwrap();
        assert_eq!(
            plan.metadata["endpoint_name"],
            format!("{}-serverless", request_service(&plan))
        );
        assert_eq!(plan.metadata["gpu_type_id"], "NVIDIA A100-SXM4-80GB");
        assert_eq!(plan.metadata["flashboot"], "true");
        assert_eq!(plan.metadata["idle_timeout"], "60");
        assert_eq!(plan.metadata["execution_timeout_ms"], "600000");
        assert_eq!(plan.env["MODEL_NAME"], "meta-llama/Llama-3.1-8B");
        assert_eq!(plan.env["ENFORCE_EAGER"], "true");
    }

    fn request_service(plan: &ProviderPlan) -> String {
        plan.metadata["endpoint_name"]
            .strip_suffix("-serverless")
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_plan_rejects_unknown_gpu() {
        let provider = RunPodProvider::default();
        let mut r = request();
        r.gpu = "RTX_PRO_6000".to_string(); // not a RunPod offering
        let err = provider.plan(&r, "").unwrap_err();
        assert!(matches!(err, TunaError::PlanInvalid(_)));
        assert!(err.to_string().contains("RTX_PRO_6000"));
    }

    #[test]
    fn test_plan_no_fast_boot_disables_flashboot() {
        let provider = RunPodProvider::default();
        let mut r = request();
        r.cold_start_mode = ColdStartMode::NoFastBoot;
        let plan = provider.plan(&r, "").unwrap();
        assert_eq!(plan.metadata["flashboot"], "false");
        assert!(!plan.env.contains_key("ENFORCE_EAGER"));
    }
}
