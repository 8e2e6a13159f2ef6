//! Modal serverless provider — vLLM behind a `modal.web_server` function.
//!
//! Deployment goes through the `modal` CLI: the plan renders a complete
//! app script, deploy writes it to a scratch file and runs `modal deploy`.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, TunaError};
use crate::models::{DeployRequest, DeploymentResult, PreflightCheck, PreflightResult, ProviderPlan};
use crate::providers::{run_with_timeout, InferenceProvider};
use crate::template;

const APP_TEMPLATE: &str = include_str!("../templates/modal_vllm_server.py.tpl");
const MODAL_VLLM_VERSION: &str = "0.15.1";

static WEB_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://[\w.-]+\.modal\.run").expect("valid regex"));

/// Deploy a vLLM server on Modal's serverless GPUs.
#[derive(Default)]
pub struct ModalProvider;

#[async_trait]
impl InferenceProvider for ModalProvider {
    fn name(&self) -> &'static str {
        "modal"
    }

    async fn vllm_version(&self) -> String {
        MODAL_VLLM_VERSION.to_string()
    }

    async fn preflight(&self, _request: &DeployRequest) -> PreflightResult {
        let mut result = PreflightResult::new(self.name());

        let version = run_with_timeout(
            Command::new("modal").arg("--version"),
            Duration::from_secs(10),
        )
        .await;
        match version {
            Ok(output) if output.status.success() => {
                result.push(PreflightCheck::pass("modal_installed", "modal CLI found"));
            }
            _ => {
                result.push(
                    PreflightCheck::fail("modal_installed", "modal CLI not found")
                        .with_fix("pip install modal"),
                );
                return result;
            }
        }

        // `modal token` state lives in ~/.modal.toml; profile listing fails
        // without one.
        let profile = run_with_timeout(
            Command::new("modal").args(["profile", "current"]),
            Duration::from_secs(10),
        )
        .await;
        match profile {
            Ok(output) if output.status.success() => {
                result.push(PreflightCheck::pass("modal_authenticated", "modal token configured"));
            }
            _ => result.push(
                PreflightCheck::fail("modal_authenticated", "modal is not authenticated")
                    .with_fix("modal token new"),
            ),
        }

        result
    }

    fn plan(&self, request: &DeployRequest, vllm_cmd: &str) -> Result<ProviderPlan> {
        let app_name = format!("{}-serverless", request.service_name);
        let fast_boot = request.cold_start_mode.is_fast_boot();
        let serverless = &request.scaling.serverless;

        // Modal serves on port 8000 internally.
        let modal_vllm_cmd = vllm_cmd.replace("--port 8001", "--port 8000");

        let replacements = template::replacements([
            ("app_name", app_name.clone()),
            ("gpu", request.gpu.clone()),
            ("port", "8000".to_string()),
            ("vllm_cmd", modal_vllm_cmd),
            ("vllm_version", request.vllm_version.clone()),
            ("max_concurrency", serverless.concurrency.to_string()),
            ("timeout_s", serverless.timeout.to_string()),
            ("scaledown_window_s", serverless.scaledown_window.to_string()),
            ("startup_timeout_s", "600".to_string()),
            (
                "enable_memory_snapshot",
                if fast_boot { "True" } else { "False" }.to_string(),
            ),
            (
                "experimental_options_line",
                if fast_boot {
                    r#"experimental_options={"enable_gpu_snapshot": True},"#
                } else {
                    ""
                }
                .to_string(),
            ),
        ]);

        Ok(ProviderPlan {
            provider: self.name().to_string(),
            rendered_script: template::render(APP_TEMPLATE, &replacements),
            env: HashMap::from([("MODEL_ID".to_string(), request.model_name.clone())]),
            metadata: HashMap::from([
                ("app_name".to_string(), app_name),
                ("function_name".to_string(), "serve".to_string()),
            ]),
        })
    }

    async fn deploy(&self, plan: &ProviderPlan) -> DeploymentResult {
        let app_name = plan.metadata["app_name"].clone();
        let base_meta = HashMap::from([("app_name".to_string(), app_name.clone())]);

        let script = match write_script(&plan.rendered_script) {
            Ok(file) => file,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), base_meta),
        };

        info!("deploying Modal app {app_name} from {}", script.path().display());
        let mut command = Command::new("modal");
        command.arg("deploy").arg(script.path());
        for (k, v) in &plan.env {
            command.env(k, v);
        }

        let output = match run_with_timeout(&mut command, Duration::from_secs(600)).await {
            Ok(output) => output,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), base_meta),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("modal deploy failed: {stderr}");
            return DeploymentResult::failed(
                self.name(),
                format!("modal deploy failed: {stderr}"),
                base_meta,
            );
        }

        // The deploy log prints the web endpoint for the served function.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let combined = format!("{stdout}\n{}", String::from_utf8_lossy(&output.stderr));
        let Some(url) = WEB_URL.find(&combined).map(|m| m.as_str().to_string()) else {
            return DeploymentResult::failed(
                self.name(),
                "Deployed but could not resolve web URL",
                base_meta,
            );
        };

        info!("Modal app {app_name} deployed at {url}");
        DeploymentResult::ok(
            self.name(),
            url.clone(),
            format!("{url}/health"),
            HashMap::from([
                ("app_name".to_string(), app_name),
                ("function_name".to_string(), plan.metadata["function_name"].clone()),
            ]),
        )
    }

    async fn destroy(&self, result: &DeploymentResult) {
        let Some(app_name) = result.metadata.get("app_name") else {
            warn!("no app_name in metadata, cannot destroy");
            return;
        };
        info!("stopping Modal app {app_name}");
        let stop = run_with_timeout(
            Command::new("modal").args(["app", "stop", app_name]),
            Duration::from_secs(60),
        )
        .await;
        if let Err(e) = stop {
            warn!("modal app stop failed (non-fatal): {e}");
        }
    }

    async fn status(&self, service_name: &str) -> Value {
        let app_name = format!("{service_name}-serverless");
        let listing = run_with_timeout(
            Command::new("modal").args(["app", "list"]),
            Duration::from_secs(30),
        )
        .await;
        match listing {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let status = if stdout.contains(&app_name) { "running" } else { "not found" };
                json!({ "provider": self.name(), "app_name": app_name, "status": status })
            }
            Err(e) => json!({ "provider": self.name(), "app_name": app_name, "error": e.to_string() }),
        }
    }
}

fn write_script(rendered: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("tuna_modal_")
        .suffix(".py")
        .tempfile()
        .map_err(TunaError::Io)?;
    file.write_all(rendered.as_bytes()).map_err(TunaError::Io)?;
    file.flush().map_err(TunaError::Io)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColdStartMode;
    use crate::orchestrator::build_vllm_cmd;

    fn request() -> DeployRequest {
        DeployRequest::new("Qwen/Qwen3-0.6B", "L40S")
    }

    #[test]
    fn test_plan_renders_fast_boot_script() {
        let provider = ModalProvider;
        let r = request();
        let cmd = build_vllm_cmd(&r, "8001");
        let plan = provider.plan(&r, &cmd).unwrap();

        assert_eq!(plan.metadata["function_name"], "serve");
        assert!(plan.rendered_script.contains(&plan.metadata["app_name"]));
        assert!(plan.rendered_script.contains("--port 8000"));
        assert!(!plan.rendered_script.contains("--port 8001"));
        assert!(plan.rendered_script.contains("enable_memory_snapshot=True"));
        assert!(plan.rendered_script.contains("enable_gpu_snapshot"));
        // Dict literals survive the brace escaping.
        assert!(plan.rendered_script.contains("\"HF_HUB_CACHE\": HF_CACHE_PATH"));
        assert_eq!(plan.env["MODEL_ID"], "Qwen/Qwen3-0.6B");
    }

    #[test]
    fn test_plan_no_fast_boot_omits_snapshots() {
        let provider = ModalProvider;
        let mut r = request();
        r.cold_start_mode = ColdStartMode::NoFastBoot;
        let plan = provider.plan(&r, "vllm serve x --port 8001").unwrap();
        assert!(plan.rendered_script.contains("enable_memory_snapshot=False"));
        assert!(!plan.rendered_script.contains("enable_gpu_snapshot"));
    }

    #[test]
    fn test_web_url_regex() {
        let log = "Created objects.\n├── serve => https://user--tuna-1234-serverless-serve.modal.run\nDone.";
        assert_eq!(
            WEB_URL.find(log).unwrap().as_str(),
            "https://user--tuna-1234-serverless-serve.modal.run"
        );
    }
}
