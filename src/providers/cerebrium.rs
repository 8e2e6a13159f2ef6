//! Cerebrium serverless provider — vLLM as a custom-runtime Cerebrium app.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use crate::catalog::{provider_gpu_id, provider_gpu_map};
use crate::error::{Result, TunaError};
use crate::models::{DeployRequest, DeploymentResult, PreflightCheck, PreflightResult, ProviderPlan};
use crate::providers::{http_client, run_with_timeout, InferenceProvider};
use crate::template;

const API_BASE: &str = "https://rest.cerebrium.ai/v2";
const DEFAULT_REGION: &str = "us-east-1";
const CONFIG_TEMPLATE: &str = include_str!("../templates/cerebrium.toml.tpl");

/// Recommended CPU/memory per GPU type (Cerebrium bundles compute).
const GPU_RESOURCES: &[(&str, u32, u32)] = &[
    ("TURING_T4", 4, 16),
    ("ADA_L4", 4, 16),
    ("AMPERE_A10", 8, 32),
    ("ADA_L40", 8, 32),
    ("AMPERE_A100_40GB", 8, 64),
    ("AMPERE_A100_80GB", 12, 64),
    ("HOPPER_H100", 12, 64),
];

static ENDPOINT_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://api\.aws\.[^/]+\.cerebrium\.ai/v4/[^\s/]+/[^\s/]+").expect("valid regex")
});

fn api_key() -> Option<String> {
    std::env::var("CEREBRIUM_API_KEY").ok().filter(|k| !k.is_empty())
}

fn config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cerebrium")
        .join("config.yaml")
}

/// Project ID from the CLI config (`~/.cerebrium/config.yaml`).
fn project_id_from_config() -> Option<String> {
    let raw = std::fs::read_to_string(config_path()).ok()?;
    if let Ok(data) = serde_yaml::from_str::<Value>(&raw) {
        for key in ["project", "project_id", "projectId"] {
            if let Some(project) = data.get(key).and_then(Value::as_str) {
                return Some(project.to_string());
            }
        }
    }
    // Fallback: simple line parsing.
    for line in raw.lines() {
        for key in ["project:", "project_id:", "projectId:"] {
            if let Some(rest) = line.trim().strip_prefix(key) {
                let value = rest.trim().trim_matches(['\'', '"']).to_string();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Deploy a vLLM server on Cerebrium's serverless GPUs.
#[derive(Default)]
pub struct CerebriumProvider;

#[async_trait]
impl InferenceProvider for CerebriumProvider {
    fn name(&self) -> &'static str {
        "cerebrium"
    }

    async fn vllm_version(&self) -> String {
        "0.15.1".to_string()
    }

    fn auth_token(&self) -> String {
        api_key().unwrap_or_default()
    }

    async fn preflight(&self, request: &DeployRequest) -> PreflightResult {
        let mut result = PreflightResult::new(self.name());

        if api_key().is_none() {
            result.push(
                PreflightCheck::fail("api_key", "CEREBRIUM_API_KEY environment variable not set")
                    .with_fix("export CEREBRIUM_API_KEY=<your-service-account-token>"),
            );
            return result;
        }
        result.push(PreflightCheck::pass("api_key", "CEREBRIUM_API_KEY is set"));

        let status = run_with_timeout(
            Command::new("cerebrium").arg("--version"),
            Duration::from_secs(10),
        )
        .await;
        match status {
            Ok(output) if output.status.success() => {
                result.push(PreflightCheck::pass("cli_installed", "cerebrium CLI found"));
            }
            _ => {
                result.push(
                    PreflightCheck::fail("cli_installed", "cerebrium CLI not found on PATH")
                        .with_fix("pip install cerebrium"),
                );
                return result;
            }
        }

        let auth = run_with_timeout(
            Command::new("cerebrium").arg("status"),
            Duration::from_secs(15),
        )
        .await;
        match auth {
            Ok(output) if output.status.success() => {
                result.push(PreflightCheck::pass("cli_authenticated", "cerebrium CLI authenticated"));
            }
            _ => {
                result.push(
                    PreflightCheck::fail("cli_authenticated", "cerebrium CLI not authenticated")
                        .with_fix("cerebrium login"),
                );
                return result;
            }
        }

        match provider_gpu_id(&request.gpu, self.name()) {
            Some(_) => result.push(PreflightCheck::pass(
                "gpu_supported",
                format!("GPU {} is supported on Cerebrium", request.gpu),
            )),
            None => {
                let mut supported: Vec<&str> =
                    provider_gpu_map(self.name()).into_keys().collect();
                supported.sort_unstable();
                result.push(PreflightCheck::fail(
                    "gpu_supported",
                    format!(
                        "GPU {:?} not supported on Cerebrium. Supported: {supported:?}",
                        request.gpu
                    ),
                ));
            }
        }

        result
    }

    fn plan(&self, request: &DeployRequest, _vllm_cmd: &str) -> Result<ProviderPlan> {
        let gpu_compute = provider_gpu_id(&request.gpu, self.name()).ok_or_else(|| {
            let mut supported: Vec<&str> = provider_gpu_map(self.name()).into_keys().collect();
            supported.sort_unstable();
            TunaError::PlanInvalid(format!(
                "unknown GPU type for Cerebrium: {:?}. Supported: {supported:?}",
                request.gpu
            ))
        })?;

        let service_name = format!("{}-serverless", request.service_name);
        let region = request.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string());
        let serverless = &request.scaling.serverless;

        let (cpu, memory) = GPU_RESOURCES
            .iter()
            .find(|(compute, _, _)| *compute == gpu_compute)
            .map(|(_, cpu, memory)| (*cpu, *memory))
            .unwrap_or((4, 16));

        // Rendered into the entrypoint array, so the flag carries its own
        // list separator.
        let eager_flag = if request.cold_start_mode.is_fast_boot() {
            r#", "--enforce-eager""#
        } else {
            ""
        };

        let replacements = template::replacements([
            ("service_name", service_name.clone()),
            ("region", region.clone()),
            ("gpu_compute", gpu_compute.to_string()),
            ("gpu_count", request.gpu_count.to_string()),
            ("cpu", cpu.to_string()),
            ("memory", memory.to_string()),
            ("min_replicas", serverless.workers_min.to_string()),
            ("max_replicas", serverless.workers_max.to_string()),
            ("cooldown", serverless.scaledown_window.to_string()),
            ("vllm_version", request.vllm_version.clone()),
            ("model", request.model_name.clone()),
            ("max_model_len", request.max_model_len.to_string()),
            ("tp_size", request.tp_size.to_string()),
            ("eager_flag", eager_flag.to_string()),
        ]);

        Ok(ProviderPlan {
            provider: self.name().to_string(),
            rendered_script: template::render(CONFIG_TEMPLATE, &replacements),
            env: HashMap::new(),
            metadata: HashMap::from([
                ("service_name".to_string(), service_name),
                ("region".to_string(), region),
                ("project_id".to_string(), project_id_from_config().unwrap_or_default()),
                ("gpu_compute".to_string(), gpu_compute.to_string()),
            ]),
        })
    }

    async fn deploy(&self, plan: &ProviderPlan) -> DeploymentResult {
        if api_key().is_none() {
            return DeploymentResult::failed(
                self.name(),
                "CEREBRIUM_API_KEY environment variable not set",
                plan.metadata.clone(),
            );
        }

        let service_name = plan.metadata["service_name"].clone();
        let region = plan.metadata["region"].clone();

        let tmpdir = match tempfile::Builder::new().prefix("tuna_cerebrium_").tempdir() {
            Ok(d) => d,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), plan.metadata.clone()),
        };
        let write = std::fs::write(tmpdir.path().join("cerebrium.toml"), &plan.rendered_script)
            .and_then(|_| {
                // Cerebrium expects a main.py even for custom runtimes.
                std::fs::write(
                    tmpdir.path().join("main.py"),
                    "# Placeholder: vLLM runs via the custom runtime entrypoint\n",
                )
            });
        if let Err(e) = write {
            return DeploymentResult::failed(self.name(), e.to_string(), plan.metadata.clone());
        }

        info!("deploying Cerebrium app {service_name} from {}", tmpdir.path().display());
        let output = match run_with_timeout(
            Command::new("cerebrium")
                .args(["deploy", "-y", "--no-color"])
                .current_dir(tmpdir.path()),
            Duration::from_secs(600),
        )
        .await
        {
            Ok(output) => output,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), plan.metadata.clone()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() { stdout.as_str() } else { stderr.as_ref() };
            let detail: String = detail.chars().take(500).collect();
            warn!("cerebrium deploy failed: {detail}");
            return DeploymentResult::failed(
                self.name(),
                format!("cerebrium deploy failed: {detail}"),
                plan.metadata.clone(),
            );
        }

        // project_id may only exist after the first deploy wrote the config.
        let project_id = Some(plan.metadata["project_id"].clone())
            .filter(|p| !p.is_empty())
            .or_else(project_id_from_config)
            .unwrap_or_default();

        let endpoint_url = match ENDPOINT_URL.find(&stdout) {
            Some(m) => {
                let base = m.as_str().trim_end_matches('/');
                base.strip_suffix("/{function_name}").unwrap_or(base).to_string()
            }
            None if !project_id.is_empty() => {
                format!("https://api.aws.{region}.cerebrium.ai/v4/{project_id}/{service_name}")
            }
            None => String::new(),
        };

        let mut metadata = plan.metadata.clone();
        metadata.insert("project_id".to_string(), project_id);

        if endpoint_url.is_empty() {
            warn!(
                "could not determine Cerebrium project_id, endpoint URL unknown. \
                 Check ~/.cerebrium/config.yaml or the Cerebrium dashboard."
            );
            return DeploymentResult {
                provider: self.name().to_string(),
                endpoint_url: None,
                health_url: None,
                error: Some("Deployed but endpoint URL unknown (no project id)".to_string()),
                metadata,
            };
        }

        info!("Cerebrium app {service_name} deployed at {endpoint_url}");
        DeploymentResult::ok(
            self.name(),
            endpoint_url.clone(),
            format!("{endpoint_url}/health"),
            metadata,
        )
    }

    async fn destroy(&self, result: &DeploymentResult) {
        let Some(service_name) = result.metadata.get("service_name") else {
            warn!("no service_name in metadata, cannot destroy");
            return;
        };
        let project_id = result.metadata.get("project_id").cloned().unwrap_or_default();

        // Cerebrium app IDs are {project_id}-{service_name}.
        let app_id = if project_id.is_empty() {
            service_name.clone()
        } else {
            format!("{project_id}-{service_name}")
        };

        info!("deleting Cerebrium app: {app_id}");
        let cli = run_with_timeout(
            Command::new("cerebrium").args(["apps", "delete", &app_id, "--no-color"]),
            Duration::from_secs(60),
        )
        .await;
        match cli {
            Ok(output) if output.status.success() => {
                info!("Cerebrium app {app_id} deleted via CLI");
                return;
            }
            Ok(output) => {
                let stderr: String = String::from_utf8_lossy(&output.stderr).chars().take(200).collect();
                warn!("CLI delete returned {:?}: {stderr}", output.status.code());
            }
            Err(e) => warn!("CLI delete failed: {e}"),
        }

        // Fallback to the REST API.
        let (Some(key), false) = (api_key(), project_id.is_empty()) else {
            return;
        };
        let response = http_client()
            .delete(format!("{API_BASE}/projects/{project_id}/apps/{app_id}"))
            .bearer_auth(key)
            .timeout(Duration::from_secs(30))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => info!("Cerebrium app {app_id} deleted via REST API"),
            Ok(r) => warn!("REST API delete returned {}", r.status()),
            Err(e) => warn!("REST API delete failed: {e}"),
        }
    }

    async fn status(&self, service_name: &str) -> Value {
        let app_name = format!("{service_name}-serverless");
        let key = api_key();
        let project_id = project_id_from_config().unwrap_or_default();

        let (Some(key), false) = (key, project_id.is_empty()) else {
            return json!({
                "provider": self.name(),
                "service_name": service_name,
                "status": "unknown",
                "error": "CEREBRIUM_API_KEY or project_id not available",
            });
        };

        let response = http_client()
            .get(format!("{API_BASE}/projects/{project_id}/apps/{app_name}"))
            .bearer_auth(key)
            .timeout(Duration::from_secs(15))
            .send()
            .await;
        match response {
            Ok(r) if r.status().as_u16() == 404 => json!({
                "provider": self.name(),
                "service_name": service_name,
                "status": "not found",
            }),
            Ok(r) if r.status().is_success() => {
                let data: Value = r.json().await.unwrap_or(json!({}));
                json!({
                    "provider": self.name(),
                    "service_name": service_name,
                    "status": data.get("status").cloned().unwrap_or(json!("running")),
                })
            }
            Ok(r) => json!({
                "provider": self.name(),
                "service_name": service_name,
                "status": "unknown",
                "error": format!("API returned {}", r.status()),
            }),
            Err(e) => json!({
                "provider": self.name(),
                "service_name": service_name,
                "status": "unknown",
                "error": e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeployRequest {
        let mut r = DeployRequest::new("Qwen/Qwen3-4B", "L4");
        r.serverless_provider = "cerebrium".to_string();
        r
    }

    #[test]
    fn test_plan_renders_toml() {
        let provider = CerebriumProvider;
        let plan = provider.plan(&request(), "").unwrap();
        assert!(plan.rendered_script.contains(r#"compute = "ADA_L4""#));
        assert!(plan.rendered_script.contains("cooldown = 60"));
        assert!(plan.rendered_script.contains(r#", "--enforce-eager"]"#));
        assert!(plan.rendered_script.contains(r#"region = "us-east-1""#));
        assert_eq!(plan.metadata["gpu_compute"], "ADA_L4");
    }

    #[test]
    fn test_plan_no_fast_boot() {
        let provider = CerebriumProvider;
        let mut r = request();
        r.cold_start_mode = crate::models::ColdStartMode::NoFastBoot;
        let plan = provider.plan(&r, "").unwrap();
        assert!(!plan.rendered_script.contains("--enforce-eager"));
        assert!(plan.rendered_script.contains(r#""--tensor-parallel-size", "1"]"#));
    }

    #[test]
    fn test_plan_unknown_gpu() {
        let provider = CerebriumProvider;
        let mut r = request();
        r.gpu = "B200".to_string();
        assert!(matches!(provider.plan(&r, ""), Err(TunaError::PlanInvalid(_))));
    }

    #[test]
    fn test_endpoint_url_regex() {
        let log = "Deployed! Call it at https://api.aws.us-east-1.cerebrium.ai/v4/p-abc123/tuna-x-serverless/{function_name}";
        let m = ENDPOINT_URL.find(log).unwrap().as_str();
        assert!(m.starts_with("https://api.aws.us-east-1.cerebrium.ai/v4/p-abc123/"));
    }
}
