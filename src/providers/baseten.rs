//! Baseten serverless provider — vLLM models pushed through the truss CLI.

use std::collections::HashMap;
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

const DEFAULT_API_BASE: &str = "https://api.baseten.co/v1";
const CONFIG_TEMPLATE: &str = include_str!("../templates/baseten_config.yaml.tpl");

static MODEL_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"app\.baseten\.co/models/([a-zA-Z0-9]+)",
        r"model-([a-zA-Z0-9]+)\.api\.baseten\.co",
        r"(?i)model[\s_]*id\s*:\s*([a-zA-Z0-9]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

fn api_key() -> Option<String> {
    std::env::var("BASETEN_API_KEY").ok().filter(|k| !k.is_empty())
}

/// Deploy a vLLM server on Baseten's serverless GPUs.
pub struct BasetenProvider {
    api_base: String,
}

impl Default for BasetenProvider {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl BasetenProvider {
    pub fn with_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl InferenceProvider for BasetenProvider {
    fn name(&self) -> &'static str {
        "baseten"
    }

    async fn vllm_version(&self) -> String {
        "0.15.1".to_string()
    }

    fn auth_token(&self) -> String {
        api_key().unwrap_or_default()
    }

    async fn preflight(&self, request: &DeployRequest) -> PreflightResult {
        let mut result = PreflightResult::new(self.name());

        let Some(key) = api_key() else {
            result.push(
                PreflightCheck::fail("api_key", "BASETEN_API_KEY environment variable not set")
                    .with_fix("export BASETEN_API_KEY=<your-api-key>"),
            );
            return result;
        };
        result.push(PreflightCheck::pass("api_key", "BASETEN_API_KEY is set"));

        let check = self.check_api_key(&key).await;
        let passed = check.passed;
        result.push(check);
        if !passed {
            return result;
        }

        let check = check_truss_installed().await;
        let passed = check.passed;
        result.push(check);
        if !passed {
            return result;
        }

        match provider_gpu_id(&request.gpu, self.name()) {
            Some(_) => result.push(PreflightCheck::pass(
                "gpu_supported",
                format!("GPU {} is supported on Baseten", request.gpu),
            )),
            None => {
                let mut supported: Vec<&str> =
                    provider_gpu_map(self.name()).into_keys().collect();
                supported.sort_unstable();
                result.push(PreflightCheck::fail(
                    "gpu_supported",
                    format!(
                        "GPU {:?} is not available on Baseten. Supported: {supported:?}",
                        request.gpu
                    ),
                ));
            }
        }

        result
    }

    fn plan(&self, request: &DeployRequest, _vllm_cmd: &str) -> Result<ProviderPlan> {
        let service_name = format!("{}-serverless", request.service_name);

        let gpu_accelerator = provider_gpu_id(&request.gpu, self.name()).ok_or_else(|| {
            let mut supported: Vec<&str> = provider_gpu_map(self.name()).into_keys().collect();
            supported.sort_unstable();
            TunaError::PlanInvalid(format!(
                "unknown GPU type for Baseten: {:?}. Supported: {supported:?}",
                request.gpu
            ))
        })?;

        let eager_flag = if request.cold_start_mode.is_fast_boot() {
            "--enforce-eager"
        } else {
            ""
        };
        let serverless = &request.scaling.serverless;

        let replacements = template::replacements([
            ("service_name", service_name.clone()),
            ("model", request.model_name.clone()),
            ("max_model_len", request.max_model_len.to_string()),
            ("tp_size", request.tp_size.to_string()),
            ("gpu", gpu_accelerator.to_string()),
            ("concurrency", serverless.concurrency.to_string()),
            ("eager_flag", eager_flag.to_string()),
            ("vllm_version", request.vllm_version.clone()),
        ]);

        Ok(ProviderPlan {
            provider: self.name().to_string(),
            rendered_script: template::render(CONFIG_TEMPLATE, &replacements),
            env: HashMap::new(),
            metadata: HashMap::from([
                ("service_name".to_string(), service_name),
                ("model_name".to_string(), request.model_name.clone()),
                ("concurrency_target".to_string(), serverless.concurrency.to_string()),
                ("scale_down_delay".to_string(), serverless.scaledown_window.to_string()),
            ]),
        })
    }

    async fn deploy(&self, plan: &ProviderPlan) -> DeploymentResult {
        if api_key().is_none() {
            return DeploymentResult::failed(
                self.name(),
                "BASETEN_API_KEY not set",
                plan.metadata.clone(),
            );
        }

        let tmpdir = match tempfile::Builder::new().prefix("tuna_baseten_").tempdir() {
            Ok(d) => d,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), plan.metadata.clone()),
        };
        let config_path = tmpdir.path().join("config.yaml");
        if let Err(e) = std::fs::write(&config_path, &plan.rendered_script) {
            return DeploymentResult::failed(self.name(), e.to_string(), plan.metadata.clone());
        }

        info!("pushing Baseten model from {}", tmpdir.path().display());
        let output = match run_with_timeout(
            Command::new("truss").arg("push").arg(tmpdir.path()).arg("--publish"),
            Duration::from_secs(600),
        )
        .await
        {
            Ok(output) => output,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), plan.metadata.clone()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            // truss reports errors on stdout, not stderr.
            let error_output = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
            warn!("truss push failed:\nstdout: {stdout}\nstderr: {stderr}");
            return DeploymentResult::failed(
                self.name(),
                format!("truss push failed: {error_output}"),
                plan.metadata.clone(),
            );
        }

        let Some(model_id) = parse_model_id(&stdout) else {
            return DeploymentResult::failed(
                self.name(),
                format!("Could not parse model_id from truss push output: {stdout}"),
                plan.metadata.clone(),
            );
        };

        // /production/sync passes all paths through to the container so the
        // router can reach /v1/chat/completions and /health.
        let endpoint_url = format!("https://model-{model_id}.api.baseten.co/production/sync");
        let mut metadata = plan.metadata.clone();
        metadata.insert("model_id".to_string(), model_id.clone());

        self.configure_autoscaling(
            &model_id,
            plan.metadata
                .get("concurrency_target")
                .and_then(|v| v.parse().ok())
                .unwrap_or(32),
            plan.metadata
                .get("scale_down_delay")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        )
        .await;

        info!("Baseten model deployed: {endpoint_url}");
        DeploymentResult::ok(
            self.name(),
            endpoint_url.clone(),
            format!("{endpoint_url}/health"),
            metadata,
        )
    }

    async fn destroy(&self, result: &DeploymentResult) {
        let Some(model_id) = result.metadata.get("model_id") else {
            warn!("no model_id in metadata, cannot destroy Baseten model");
            return;
        };
        let Some(key) = api_key() else {
            warn!("BASETEN_API_KEY not set, cannot destroy model");
            return;
        };

        info!("deleting Baseten model {model_id}");
        let response = http_client()
            .delete(format!("{}/models/{model_id}", self.api_base))
            .header("Authorization", format!("Api-Key {key}"))
            .timeout(Duration::from_secs(30))
            .send()
            .await;
        match response {
            Ok(r) if matches!(r.status().as_u16(), 200 | 204 | 404) => {}
            Ok(r) => warn!("Baseten delete returned {}", r.status()),
            Err(e) => warn!("failed to delete Baseten model {model_id}: {e}"),
        }
    }

    async fn status(&self, service_name: &str) -> Value {
        let Some(key) = api_key() else {
            return json!({
                "provider": self.name(),
                "status": "unknown",
                "error": "BASETEN_API_KEY not set",
            });
        };

        let response = http_client()
            .get(format!("{}/models", self.api_base))
            .header("Authorization", format!("Api-Key {key}"))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        let body: Value = match response.and_then(|r| r.error_for_status()) {
            Ok(r) => match r.json().await {
                Ok(v) => v,
                Err(e) => {
                    return json!({ "provider": self.name(), "status": "unknown", "error": e.to_string() })
                }
            },
            Err(e) => {
                return json!({ "provider": self.name(), "status": "unknown", "error": e.to_string() })
            }
        };

        let wanted = format!("{service_name}-serverless");
        let models = body.get("models").and_then(Value::as_array).cloned().unwrap_or_default();
        for model in models {
            if model.get("name").and_then(Value::as_str) == Some(wanted.as_str()) {
                return json!({
                    "provider": self.name(),
                    "service_name": service_name,
                    "status": model.get("status").cloned().unwrap_or(json!("unknown")),
                    "model_id": model.get("id").cloned().unwrap_or(json!("")),
                });
            }
        }
        json!({ "provider": self.name(), "service_name": service_name, "status": "not found" })
    }
}

impl BasetenProvider {
    async fn check_api_key(&self, key: &str) -> PreflightCheck {
        let response = http_client()
            .get(format!("{}/models", self.api_base))
            .header("Authorization", format!("Api-Key {key}"))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match response {
            Ok(r) if r.status().as_u16() == 401 || r.status().as_u16() == 403 => {
                PreflightCheck::fail("api_key_valid", "BASETEN_API_KEY is invalid").with_fix(
                    "Check your BASETEN_API_KEY at https://app.baseten.co/settings/api_keys",
                )
            }
            Ok(r) => match r.error_for_status() {
                Ok(_) => PreflightCheck::pass("api_key_valid", "BASETEN_API_KEY is valid"),
                Err(e) => {
                    PreflightCheck::fail("api_key_valid", format!("Baseten API check failed: {e}"))
                }
            },
            Err(e) => PreflightCheck::fail("api_key_valid", format!("Could not reach Baseten API: {e}")),
        }
    }

    /// Set autoscaling on the production environment. Non-fatal.
    async fn configure_autoscaling(
        &self,
        model_id: &str,
        concurrency_target: u32,
        scale_down_delay: u32,
    ) {
        let Some(key) = api_key() else { return };
        let settings = json!({
            "autoscaling_settings": {
                "concurrency_target": concurrency_target,
                "scale_down_delay": scale_down_delay,
            }
        });
        let response = http_client()
            .patch(format!(
                "{}/models/{model_id}/environments/production",
                self.api_base
            ))
            .header("Authorization", format!("Api-Key {key}"))
            .timeout(Duration::from_secs(15))
            .json(&settings)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => {
                info!("Baseten autoscaling configured: {settings}")
            }
            Ok(r) => warn!("failed to configure autoscaling: {}", r.status()),
            Err(e) => warn!("could not configure autoscaling: {e}"),
        }
    }
}

async fn check_truss_installed() -> PreflightCheck {
    let output = run_with_timeout(
        Command::new("truss").arg("--version"),
        Duration::from_secs(10),
    )
    .await;
    match output {
        Ok(output) if output.status.success() => {
            PreflightCheck::pass("truss_installed", "truss CLI found")
        }
        _ => PreflightCheck::fail("truss_installed", "truss CLI not found")
            .with_fix("pip install truss"),
    }
}

/// Extract the model id from truss push output.
///
/// Known formats: the dashboard URL, the endpoint URL, and an explicit
/// `model_id:` line.
fn parse_model_id(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        for pattern in MODEL_ID_PATTERNS.iter() {
            if let Some(captures) = pattern.captures(line.trim()) {
                return Some(captures[1].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeployRequest {
        let mut r = DeployRequest::new("meta-llama/Llama-3.1-8B", "H100");
        r.serverless_provider = "baseten".to_string();
        r
    }

    #[test]
    fn test_plan_renders_truss_config() {
        let provider = BasetenProvider::default();
        let plan = provider.plan(&request(), "").unwrap();
        assert!(plan.rendered_script.contains("accelerator: H100"));
        assert!(plan.rendered_script.contains("--enforce-eager"));
        assert!(plan.rendered_script.contains("vllm/vllm-openai:v0.15.1"));
        assert_eq!(plan.metadata["concurrency_target"], "32");
        assert_eq!(plan.metadata["scale_down_delay"], "60");
    }

    #[test]
    fn test_plan_maps_gpu_accelerator() {
        let provider = BasetenProvider::default();
        let mut r = request();
        r.gpu = "A100_80GB".to_string();
        let plan = provider.plan(&r, "").unwrap();
        assert!(plan.rendered_script.contains("accelerator: A100"));
    }

    #[test]
    fn test_parse_model_id_formats() {
        assert_eq!(
            parse_model_id("View at https://app.baseten.co/models/31d5m413/logs/31dgo51"),
            Some("31d5m413".to_string())
        );
        assert_eq!(
            parse_model_id("endpoint: https://model-abc123.api.baseten.co/production/sync"),
            Some("abc123".to_string())
        );
        assert_eq!(parse_model_id("model_id: qwerty1"), Some("qwerty1".to_string()));
        assert_eq!(parse_model_id("no ids here"), None);
    }

    #[test]
    fn test_plan_unknown_gpu() {
        let provider = BasetenProvider::default();
        let mut r = request();
        r.gpu = "A6000".to_string();
        assert!(matches!(provider.plan(&r, ""), Err(TunaError::PlanInvalid(_))));
    }
}
