//! Google Cloud Run GPU provider — vLLM on Cloud Run with GPU node selectors.
//!
//! Credential resolution and preflight go through the `gcloud` CLI; the
//! deploy/destroy/status calls hit the Cloud Run Admin API directly with an
//! access token minted by `gcloud auth application-default`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use crate::catalog::{provider_gpu_id, provider_gpu_map, provider_regions};
use crate::error::{Result, TunaError};
use crate::models::{DeployRequest, DeploymentResult, PreflightCheck, PreflightResult, ProviderPlan};
use crate::providers::{http_client, reject_multi_gpu, run_with_timeout, InferenceProvider};

const DEFAULT_REGION: &str = "us-central1";
const DEFAULT_IMAGE: &str = "vllm/vllm-openai:v0.15.1";
const VLLM_PORT: u16 = 8000;
const API_BASE: &str = "https://run.googleapis.com/v2";

const REQUIRED_APIS: &[&str] = &["run.googleapis.com", "iam.googleapis.com"];

async fn gcloud(args: &[&str], timeout: Duration) -> Result<std::process::Output> {
    run_with_timeout(Command::new("gcloud").args(args), timeout).await
}

/// Project ID from `GOOGLE_CLOUD_PROJECT` or the gcloud config.
pub async fn resolve_project_id() -> Option<String> {
    if let Ok(project) = std::env::var("GOOGLE_CLOUD_PROJECT") {
        if !project.is_empty() {
            return Some(project);
        }
    }
    let output = gcloud(&["config", "get-value", "project"], Duration::from_secs(10))
        .await
        .ok()?;
    let project = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!project.is_empty() && project != "(unset)").then_some(project)
}

async fn project_id() -> Result<String> {
    resolve_project_id().await.ok_or_else(|| {
        TunaError::Config(
            "Cannot determine Google Cloud project. \
             Set GOOGLE_CLOUD_PROJECT env var or run 'gcloud config set project <id>'."
                .to_string(),
        )
    })
}

fn default_region() -> String {
    std::env::var("GOOGLE_CLOUD_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string())
}

async fn access_token() -> Result<String> {
    let output = gcloud(
        &["auth", "application-default", "print-access-token"],
        Duration::from_secs(15),
    )
    .await?;
    if !output.status.success() {
        return Err(TunaError::MissingCredentials(
            "gcloud could not mint an access token; run 'gcloud auth application-default login'"
                .to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Deploy a vLLM server on Google Cloud Run with GPU support.
#[derive(Default)]
pub struct CloudRunProvider;

#[async_trait]
impl InferenceProvider for CloudRunProvider {
    fn name(&self) -> &'static str {
        "cloudrun"
    }

    async fn vllm_version(&self) -> String {
        // Pinned by the serving image tag.
        DEFAULT_IMAGE.rsplit(":v").next().unwrap_or("0.15.1").to_string()
    }

    fn auth_token(&self) -> String {
        // Cloud Run invocations use IAM identity tokens, not static keys;
        // public deployments need none.
        String::new()
    }

    async fn preflight(&self, request: &DeployRequest) -> PreflightResult {
        let mut result = PreflightResult::new(self.name());

        match gcloud(&["--version"], Duration::from_secs(10)).await {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let version_line = stdout.lines().next().unwrap_or("").to_string();
                result.push(PreflightCheck::pass(
                    "gcloud_installed",
                    format!("gcloud CLI found: {version_line}"),
                ));
            }
            _ => {
                result.push(
                    PreflightCheck::fail("gcloud_installed", "gcloud CLI not found")
                        .with_fix("https://cloud.google.com/sdk/docs/install"),
                );
                // Nothing else can run without gcloud.
                return result;
            }
        }

        let Some(project) = resolve_project_id().await else {
            result.push(
                PreflightCheck::fail("project", "No Google Cloud project configured")
                    .with_fix("gcloud config set project <PROJECT_ID>"),
            );
            return result;
        };
        result.push(PreflightCheck::pass("project", format!("Project: {project}")));

        result.push(self.check_adc().await);
        result.push(self.check_billing(&project).await);
        result.push(self.check_and_enable_apis(&project).await);

        let region = request.region.clone().unwrap_or_else(default_region);
        let accelerator = provider_gpu_id(&request.gpu, self.name()).unwrap_or("");
        result.push(check_gpu_region(
            accelerator,
            &region,
            provider_regions(&request.gpu, self.name()),
        ));

        result
    }

    fn plan(&self, request: &DeployRequest, _vllm_cmd: &str) -> Result<ProviderPlan> {
        let gpu_accelerator = provider_gpu_id(&request.gpu, self.name()).ok_or_else(|| {
            let mut supported: Vec<&str> = provider_gpu_map(self.name()).into_keys().collect();
            supported.sort_unstable();
            TunaError::PlanInvalid(format!(
                "unknown GPU type for Cloud Run: {:?}. Supported: {supported:?}",
                request.gpu
            ))
        })?;
        reject_multi_gpu("Cloud Run", request)?;

        // plan() stays pure: the project is read from env here and resolved
        // via gcloud only when missing at deploy time.
        let project = std::env::var("GOOGLE_CLOUD_PROJECT").unwrap_or_default();
        let region = request.region.clone().unwrap_or_else(default_region);
        let service_name = format!("{}-serverless", request.service_name);
        let serverless = &request.scaling.serverless;
        let fast_boot = request.cold_start_mode.is_fast_boot();

        let mut env = HashMap::from([
            ("MODEL_NAME".to_string(), request.model_name.clone()),
            ("MAX_MODEL_LEN".to_string(), request.max_model_len.to_string()),
            ("GPU_MEMORY_UTILIZATION".to_string(), "0.95".to_string()),
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

        let mut container_args = vec![
            "--model".to_string(), request.model_name.clone(),
            "--host".to_string(), "0.0.0.0".to_string(),
            "--port".to_string(), VLLM_PORT.to_string(),
            "--max-model-len".to_string(), request.max_model_len.to_string(),
            "--tensor-parallel-size".to_string(), "1".to_string(),
            "--gpu-memory-utilization".to_string(), "0.95".to_string(),
            "--disable-log-requests".to_string(),
        ];
        if fast_boot {
            container_args.push("--enforce-eager".to_string());
        }

        let metadata = HashMap::from([
            ("service_name".to_string(), service_name),
            ("project_id".to_string(), project),
            ("region".to_string(), region),
            ("image".to_string(), DEFAULT_IMAGE.to_string()),
            ("gpu_accelerator".to_string(), gpu_accelerator.to_string()),
            ("container_port".to_string(), VLLM_PORT.to_string()),
            ("container_args".to_string(), serde_json::to_string(&container_args)?),
            ("min_instance_count".to_string(), serverless.workers_min.to_string()),
            ("max_instance_count".to_string(), serverless.workers_max.to_string()),
            ("max_concurrency".to_string(), serverless.concurrency.to_string()),
            ("timeout_seconds".to_string(), serverless.timeout.to_string()),
            ("cpu".to_string(), "8".to_string()),
            ("memory".to_string(), "32Gi".to_string()),
            ("public_access".to_string(), request.public.to_string()),
        ]);

        Ok(ProviderPlan {
            provider: self.name().to_string(),
            rendered_script: String::new(),
            env,
            metadata,
        })
    }

    async fn deploy(&self, plan: &ProviderPlan) -> DeploymentResult {
        let mut metadata = plan.metadata.clone();
        if metadata.get("project_id").map(String::is_empty).unwrap_or(true) {
            match project_id().await {
                Ok(project) => {
                    metadata.insert("project_id".to_string(), project);
                }
                Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), metadata),
            }
        }

        let token = match access_token().await {
            Ok(t) => t,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), metadata),
        };

        let service_name = metadata["service_name"].clone();
        let project = metadata["project_id"].clone();
        let region = metadata["region"].clone();
        let parent = format!("projects/{project}/locations/{region}");

        let container_args: Vec<String> =
            serde_json::from_str(&metadata["container_args"]).unwrap_or_default();
        let port: u16 = metadata["container_port"].parse().unwrap_or(VLLM_PORT);

        let env_vars: Vec<Value> = plan
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        let service_body = json!({
            "template": {
                "containers": [{
                    "image": metadata["image"],
                    "args": container_args,
                    "ports": [{ "containerPort": port }],
                    "resources": {
                        "limits": {
                            "cpu": metadata["cpu"],
                            "memory": metadata["memory"],
                            "nvidia.com/gpu": "1",
                        },
                    },
                    "env": env_vars,
                    "startupProbe": {
                        "tcpSocket": { "port": port },
                        "initialDelaySeconds": 30,
                        "periodSeconds": 10,
                        "failureThreshold": 30,
                        "timeoutSeconds": 5,
                    },
                }],
                "scaling": {
                    "minInstanceCount": metadata["min_instance_count"].parse::<u32>().unwrap_or(0),
                    "maxInstanceCount": metadata["max_instance_count"].parse::<u32>().unwrap_or(3),
                },
                "maxInstanceRequestConcurrency": metadata["max_concurrency"].parse::<u32>().unwrap_or(32),
                "timeout": format!("{}s", metadata["timeout_seconds"]),
                "nodeSelector": { "accelerator": metadata["gpu_accelerator"] },
                // GPU zonal redundancy needs explicit quota approval.
                "gpuZonalRedundancyDisabled": true,
            },
        });

        info!("creating Cloud Run service: {service_name} in {region}");
        let create = http_client()
            .post(format!("{API_BASE}/{parent}/services"))
            .query(&[("serviceId", service_name.as_str())])
            .bearer_auth(&token)
            .json(&service_body)
            .send()
            .await;

        let operation = match create {
            Ok(response) if response.status().as_u16() == 409 => {
                info!("service {service_name} already exists, updating");
                let full_name = format!("{parent}/services/{service_name}");
                match http_client()
                    .patch(format!("{API_BASE}/{full_name}"))
                    .bearer_auth(&token)
                    .json(&service_body)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                {
                    Ok(response) => response.json::<Value>().await.ok(),
                    Err(e) => {
                        warn!("Cloud Run service update failed: {e}");
                        return DeploymentResult::failed(
                            self.name(),
                            format!("Service update failed: {e}"),
                            metadata,
                        );
                    }
                }
            }
            Ok(response) => match response.error_for_status() {
                Ok(response) => response.json::<Value>().await.ok(),
                Err(e) => {
                    warn!("Cloud Run service creation failed: {e}");
                    return DeploymentResult::failed(
                        self.name(),
                        format!("Service creation failed: {e}"),
                        metadata,
                    );
                }
            },
            Err(e) => {
                return DeploymentResult::failed(
                    self.name(),
                    format!("Service creation failed: {e}"),
                    metadata,
                )
            }
        };

        if let Some(op) = operation {
            if let Some(op_name) = op.get("name").and_then(Value::as_str) {
                if let Err(e) = self.wait_operation(&token, op_name).await {
                    warn!("Cloud Run operation did not settle: {e}");
                }
            }
        }

        let full_name = format!("{parent}/services/{service_name}");
        let service = match self.get_service(&token, &full_name).await {
            Ok(s) => s,
            Err(e) => {
                return DeploymentResult::failed(
                    self.name(),
                    format!("Deployed but could not read service: {e}"),
                    metadata,
                )
            }
        };
        let Some(uri) = service.get("uri").and_then(Value::as_str).map(str::to_string) else {
            return DeploymentResult::failed(
                self.name(),
                "Deployed but service has no URI yet",
                metadata,
            );
        };

        if metadata.get("public_access").map(String::as_str) == Some("true") {
            self.grant_public_invoker(&token, &full_name).await;
        }

        info!("Cloud Run service {service_name} deployed at {uri}");
        DeploymentResult::ok(self.name(), uri.clone(), format!("{uri}/health"), metadata)
    }

    async fn destroy(&self, result: &DeploymentResult) {
        let service_name = result.metadata.get("service_name");
        let project = result.metadata.get("project_id");
        let region = result.metadata.get("region");
        let (Some(service_name), Some(project), Some(region)) = (service_name, project, region)
        else {
            warn!("missing metadata for Cloud Run destroy: {:?}", result.metadata);
            return;
        };

        let token = match access_token().await {
            Ok(t) => t,
            Err(e) => {
                warn!("cannot destroy Cloud Run service: {e}");
                return;
            }
        };

        let name = format!("projects/{project}/locations/{region}/services/{service_name}");
        info!("deleting Cloud Run service: {name}");
        let deleted = http_client()
            .delete(format!("{API_BASE}/{name}"))
            .bearer_auth(&token)
            .send()
            .await;
        match deleted {
            Ok(response) if response.status().is_success() || response.status().as_u16() == 404 => {}
            Ok(response) => warn!("failed to delete Cloud Run service {name}: {}", response.status()),
            Err(e) => warn!("failed to delete Cloud Run service {name}: {e}"),
        }
    }

    async fn status(&self, service_name: &str) -> Value {
        let project = match project_id().await {
            Ok(p) => p,
            Err(e) => {
                return json!({ "provider": self.name(), "status": "unknown", "error": e.to_string() })
            }
        };
        let token = match access_token().await {
            Ok(t) => t,
            Err(e) => {
                return json!({ "provider": self.name(), "status": "unknown", "error": e.to_string() })
            }
        };

        let region = default_region();
        let full_name =
            format!("projects/{project}/locations/{region}/services/{service_name}-serverless");

        match self.get_service_response(&token, &full_name).await {
            Ok(response) if response.status().as_u16() == 404 => json!({
                "provider": self.name(),
                "service_name": service_name,
                "status": "not found",
            }),
            Ok(response) => match response.error_for_status() {
                Ok(response) => {
                    let service: Value = response.json().await.unwrap_or(json!({}));
                    json!({
                        "provider": self.name(),
                        "service_name": service_name,
                        "status": "running",
                        "uri": service.get("uri").cloned().unwrap_or(Value::Null),
                        "conditions": service.get("conditions").cloned().unwrap_or(json!([])),
                        "project_id": project,
                        "region": region,
                    })
                }
                Err(e) => json!({
                    "provider": self.name(),
                    "service_name": service_name,
                    "status": "unknown",
                    "error": e.to_string(),
                }),
            },
            Err(e) => json!({
                "provider": self.name(),
                "service_name": service_name,
                "status": "unknown",
                "error": e.to_string(),
            }),
        }
    }
}

impl CloudRunProvider {
    async fn check_adc(&self) -> PreflightCheck {
        let token = gcloud(
            &["auth", "application-default", "print-access-token"],
            Duration::from_secs(15),
        )
        .await;
        match token {
            Ok(output) if output.status.success() => {
                PreflightCheck::pass("adc", "Application default credentials present")
            }
            _ => PreflightCheck::fail("adc", "Application default credentials missing")
                .with_fix("gcloud auth application-default login"),
        }
    }

    async fn check_billing(&self, project: &str) -> PreflightCheck {
        let output = gcloud(
            &["billing", "projects", "describe", project, "--format=json"],
            Duration::from_secs(15),
        )
        .await;
        match output {
            Ok(output) if output.status.success() => {
                let enabled = serde_json::from_slice::<Value>(&output.stdout)
                    .ok()
                    .and_then(|v| v.get("billingEnabled").and_then(Value::as_bool))
                    .unwrap_or(false);
                if enabled {
                    PreflightCheck::pass("billing", "Billing is enabled")
                } else {
                    PreflightCheck::fail("billing", format!("Billing is not enabled on {project}"))
                        .with_fix("https://console.cloud.google.com/billing")
                }
            }
            _ => PreflightCheck::fail("billing", "Failed to check billing (gcloud error)")
                .with_fix(format!("gcloud billing projects describe {project}")),
        }
    }

    /// Check the required service APIs, enabling the missing ones.
    async fn check_and_enable_apis(&self, project: &str) -> PreflightCheck {
        let listing = gcloud(
            &[
                "services", "list", "--enabled",
                "--format=value(config.name)",
                "--project", project,
            ],
            Duration::from_secs(30),
        )
        .await;
        let Ok(output) = listing else {
            return PreflightCheck::fail("apis", "Failed to check APIs (gcloud error)");
        };
        let enabled = String::from_utf8_lossy(&output.stdout).to_string();
        let missing: Vec<&str> = REQUIRED_APIS
            .iter()
            .copied()
            .filter(|api| !enabled.contains(api))
            .collect();
        if missing.is_empty() {
            return PreflightCheck::pass(
                "apis",
                format!("All required APIs enabled: {}", REQUIRED_APIS.join(", ")),
            );
        }

        let mut failed: Vec<&str> = Vec::new();
        for api in &missing {
            let enable = gcloud(
                &["services", "enable", api, "--project", project],
                Duration::from_secs(60),
            )
            .await;
            let ok = matches!(enable, Ok(ref output) if output.status.success());
            if !ok {
                failed.push(api);
            }
        }
        if failed.is_empty() {
            PreflightCheck::pass("apis", format!("Enabled missing APIs: {}", missing.join(", ")))
                .auto_fixed()
        } else {
            PreflightCheck::fail("apis", format!("APIs not enabled: {}", failed.join(", ")))
                .with_fix(format!(
                    "gcloud services enable {} --project {project}",
                    failed.join(" ")
                ))
        }
    }

    async fn wait_operation(&self, token: &str, op_name: &str) -> Result<()> {
        // Service rollout can take a few minutes while the first revision pulls
        // the image.
        for _ in 0..60 {
            let op: Value = http_client()
                .get(format!("{API_BASE}/{op_name}"))
                .bearer_auth(token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if op.get("done").and_then(Value::as_bool).unwrap_or(false) {
                if let Some(error) = op.get("error") {
                    return Err(TunaError::DeployFailed(error.to_string()));
                }
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        Err(TunaError::Timeout("Cloud Run operation still running".to_string()))
    }

    async fn get_service_response(&self, token: &str, full_name: &str) -> Result<reqwest::Response> {
        Ok(http_client()
            .get(format!("{API_BASE}/{full_name}"))
            .bearer_auth(token)
            .send()
            .await?)
    }

    async fn get_service(&self, token: &str, full_name: &str) -> Result<Value> {
        let response = self.get_service_response(token, full_name).await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Grant allUsers the run.invoker role. Non-fatal on failure.
    async fn grant_public_invoker(&self, token: &str, resource_name: &str) {
        let result: Result<()> = async {
            let policy: Value = http_client()
                .post(format!("{API_BASE}/{resource_name}:getIamPolicy"))
                .bearer_auth(token)
                .json(&json!({}))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let mut bindings = policy
                .get("bindings")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let already = bindings.iter().any(|b| {
                b.get("role").and_then(Value::as_str) == Some("roles/run.invoker")
                    && b.get("members")
                        .and_then(Value::as_array)
                        .map(|m| m.iter().any(|v| v.as_str() == Some("allUsers")))
                        .unwrap_or(false)
            });
            if already {
                return Ok(());
            }
            bindings.push(json!({ "role": "roles/run.invoker", "members": ["allUsers"] }));

            http_client()
                .post(format!("{API_BASE}/{resource_name}:setIamPolicy"))
                .bearer_auth(token)
                .json(&json!({ "policy": { "bindings": bindings } }))
                .send()
                .await?
                .error_for_status()?;
            info!("public access granted to {resource_name}");
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!("could not set public access on {resource_name}: {e} (service works but requires auth)");
        }
    }
}

fn check_gpu_region(accelerator: &str, region: &str, valid_regions: &[&str]) -> PreflightCheck {
    if valid_regions.is_empty() {
        // Unknown GPU or no region constraints — skip rather than block.
        return PreflightCheck::pass(
            "gpu_region",
            format!("GPU region check skipped for unknown accelerator: {accelerator}"),
        );
    }
    if valid_regions.contains(&region) {
        PreflightCheck::pass("gpu_region", format!("{accelerator} available in {region}"))
    } else {
        PreflightCheck::fail(
            "gpu_region",
            format!(
                "{accelerator} is not available in {region}. Available regions: {}",
                valid_regions.join(", ")
            ),
        )
        .with_fix(format!("Use --region with one of: {}", valid_regions.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeployRequest {
        let mut r = DeployRequest::new("google/gemma-2-2b", "L4");
        r.serverless_provider = "cloudrun".to_string();
        r
    }

    #[test]
    fn test_plan_validates_gpu_and_parallelism() {
        let provider = CloudRunProvider;
        let mut r = request();
        r.gpu = "H100".to_string(); // not a Cloud Run offering
        assert!(matches!(provider.plan(&r, ""), Err(TunaError::PlanInvalid(_))));

        let mut r = request();
        r.tp_size = 2;
        assert!(provider.plan(&r, "").is_err());
    }

    #[test]
    fn test_plan_metadata_and_args() {
        let provider = CloudRunProvider;
        let plan = provider.plan(&request(), "").unwrap();
        assert_eq!(plan.metadata["gpu_accelerator"], "nvidia-l4");
        assert_eq!(plan.metadata["image"], DEFAULT_IMAGE);
        assert_eq!(plan.metadata["container_port"], "8000");
        let args: Vec<String> = serde_json::from_str(&plan.metadata["container_args"]).unwrap();
        assert!(args.contains(&"--enforce-eager".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--tensor-parallel-size" && w[1] == "1"));
        assert_eq!(plan.env["MODEL_NAME"], "google/gemma-2-2b");
    }

    #[test]
    fn test_gpu_region_check() {
        let ok = check_gpu_region("nvidia-l4", "us-central1", &["us-central1", "us-east1"]);
        assert!(ok.passed);
        let bad = check_gpu_region("nvidia-l4", "mars-north1", &["us-central1"]);
        assert!(!bad.passed);
        assert!(bad.fix_command.as_deref().unwrap().contains("us-central1"));
        let skipped = check_gpu_region("whatever", "anywhere", &[]);
        assert!(skipped.passed);
    }
}
