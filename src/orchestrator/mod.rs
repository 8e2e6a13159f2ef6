//! Orchestrator — wires router, serverless, and spot deployments together.
//!
//! Launch runs the serverless and spot backends truly in parallel. Each
//! task wraps any failure into an error-carrying [`DeploymentResult`] that
//! preserves whatever plan metadata was captured, so a later destroy can
//! always find the resources. The early serverless preflight is the deploy
//! gate: when it fails nothing is launched at all.

pub mod remote;

mod destroy;
mod status;

pub use destroy::{cleanup_serve_controller, destroy_hybrid};
pub use status::status_hybrid;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{DeployRequest, DeploymentResult, HybridDeployment};
use crate::providers::{http_client, registry};
use crate::spot::sky::SkyCli;
use crate::template;

const VLLM_CMD_TEMPLATE: &str = include_str!("../templates/vllm_serve_cmd.txt");

const SERVERLESS_TIMEOUT: Duration = Duration::from_secs(600);
// Creating the spot controller can be slow.
const SPOT_TIMEOUT: Duration = Duration::from_secs(900);

/// Render the shared vLLM serve command.
pub fn build_vllm_cmd(request: &DeployRequest, port: &str) -> String {
    let eager_flag = if request.cold_start_mode.is_fast_boot() {
        "--enforce-eager"
    } else {
        ""
    };
    let replacements = template::replacements([
        ("model", request.model_name.clone()),
        ("host", "0.0.0.0".to_string()),
        ("port", port.to_string()),
        ("max_model_len", request.max_model_len.to_string()),
        ("tp_size", request.tp_size.to_string()),
        ("eager_flag", eager_flag.to_string()),
    ]);
    template::render(VLLM_CMD_TEMPLATE, &replacements)
        .trim()
        .to_string()
}

/// POST updated backend URLs to a running router. Retries with backoff;
/// failure is non-fatal because the router probes on its own.
pub async fn push_url_to_router(
    router_url: &str,
    serverless_url: Option<&str>,
    serverless_auth_token: Option<&str>,
    spot_url: Option<&str>,
) -> bool {
    const RETRIES: u32 = 5;
    const DELAY: Duration = Duration::from_secs(3);

    let mut payload = serde_json::Map::new();
    if let Some(url) = serverless_url.filter(|u| !u.is_empty()) {
        payload.insert("serverless_url".to_string(), json!(url));
    }
    if let Some(token) = serverless_auth_token.filter(|t| !t.is_empty()) {
        payload.insert("serverless_auth_token".to_string(), json!(token));
    }
    if let Some(url) = spot_url.filter(|u| !u.is_empty()) {
        payload.insert("spot_url".to_string(), json!(url));
    }
    if payload.is_empty() {
        return true;
    }

    for attempt in 1..=RETRIES {
        let response = http_client()
            .post(format!("{router_url}/router/config"))
            .timeout(Duration::from_secs(10))
            .json(&payload)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => return true,
            Ok(r) => warn!(
                "push to router returned {} (attempt {attempt}/{RETRIES})",
                r.status()
            ),
            Err(e) => warn!("push to router failed (attempt {attempt}/{RETRIES}): {e}"),
        }
        if attempt < RETRIES {
            tokio::time::sleep(DELAY).await;
        }
    }
    warn!("failed to push URLs to router after {RETRIES} attempts");
    false
}

type SharedMeta = Arc<Mutex<HashMap<String, String>>>;

/// Plan + deploy one serverless backend, wrapping every failure.
async fn launch_serverless_task(
    request: DeployRequest,
    vllm_cmd: String,
    captured_meta: SharedMeta,
) -> DeploymentResult {
    let provider_name = request.serverless_provider.clone();
    let provider = match registry::get_provider(&provider_name) {
        Ok(p) => p,
        Err(e) => {
            return DeploymentResult::failed(provider_name, e.to_string(), HashMap::new())
        }
    };
    let plan = match provider.plan(&request, &vllm_cmd) {
        Ok(plan) => plan,
        Err(e) => {
            warn!("serverless launch failed: {e}");
            let metadata = captured_meta.lock().clone();
            return DeploymentResult::failed(provider_name, e.to_string(), metadata);
        }
    };
    captured_meta.lock().extend(plan.metadata.clone());
    provider.deploy(&plan).await
}

/// Preflight + plan + deploy the spot backend, wrapping every failure.
async fn launch_spot_task(
    request: DeployRequest,
    vllm_cmd: String,
    captured_meta: SharedMeta,
) -> DeploymentResult {
    let provider = match registry::get_provider("skyserve") {
        Ok(p) => p,
        Err(e) => return DeploymentResult::failed("skyserve", e.to_string(), HashMap::new()),
    };

    let preflight = provider.preflight(&request).await;
    if !preflight.ok() {
        return DeploymentResult::failed(
            "skyserve",
            format!("Preflight failed: {}", preflight.failure_summary()),
            HashMap::from([(
                "service_name".to_string(),
                format!("{}-spot", request.service_name),
            )]),
        );
    }

    let plan = match provider.plan(&request, &vllm_cmd) {
        Ok(plan) => plan,
        Err(e) => {
            warn!("spot launch failed: {e}");
            let metadata = captured_meta.lock().clone();
            return DeploymentResult::failed("skyserve", e.to_string(), metadata);
        }
    };
    captured_meta.lock().extend(plan.metadata.clone());
    provider.deploy(&plan).await
}

/// Await a spawned launch task, converting timeouts and panics into
/// error-carrying results with the captured plan metadata.
async fn settle(
    handle: tokio::task::JoinHandle<DeploymentResult>,
    timeout: Duration,
    provider: &str,
    captured_meta: &SharedMeta,
) -> DeploymentResult {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            warn!("{provider} launch task failed: {join_err}");
            DeploymentResult::failed(provider, join_err.to_string(), captured_meta.lock().clone())
        }
        Err(_) => DeploymentResult::failed(
            provider,
            format!("{provider} launch timed out after {}s", timeout.as_secs()),
            captured_meta.lock().clone(),
        ),
    }
}

/// Deploy the full hybrid stack.
///
/// With `separate_router_vm` the router gets its own CPU VM and all three
/// components launch in parallel; by default the router colocates on the
/// spot controller once it exists, saving one VM.
pub async fn launch_hybrid(
    request: &mut DeployRequest,
    separate_router_vm: bool,
) -> Result<HybridDeployment> {
    let sky = SkyCli;
    let vllm_cmd = build_vllm_cmd(request, "8001");

    // Pin the vLLM version to whatever the serverless provider runs, so
    // both backends serve the same build.
    let serverless_prov = registry::get_provider(&request.serverless_provider)?;
    request.vllm_version = serverless_prov.vllm_version().await;
    info!(
        "vLLM version: {} (from {})",
        request.vllm_version, request.serverless_provider
    );

    // Auth token the router injects when proxying to this backend.
    let backend_auth_token = serverless_prov.auth_token();

    // Early preflight — fail fast before creating any cloud resource.
    let preflight = serverless_prov.preflight(request).await;
    if !preflight.ok() {
        return Ok(HybridDeployment {
            serverless: Some(DeploymentResult::failed(
                request.serverless_provider.clone(),
                format!("Preflight failed: {}", preflight.failure_summary()),
                HashMap::from([(
                    "service_name".to_string(),
                    format!("{}-serverless", request.service_name),
                )]),
            )),
            ..Default::default()
        });
    }

    let serverless_meta: SharedMeta = Arc::new(Mutex::new(HashMap::new()));
    let spot_meta: SharedMeta = Arc::new(Mutex::new(HashMap::new()));

    let serverless_handle = tokio::spawn(launch_serverless_task(
        request.clone(),
        vllm_cmd.clone(),
        serverless_meta.clone(),
    ));
    let spot_handle = tokio::spawn(launch_spot_task(
        request.clone(),
        vllm_cmd,
        spot_meta.clone(),
    ));

    if separate_router_vm {
        info!("launching router + serverless + spot in parallel (separate router VM)");
        let router_request = request.clone();
        let router_handle =
            tokio::spawn(async move { remote::launch_router_vm(&SkyCli, &router_request).await });

        let router_result = match tokio::time::timeout(SPOT_TIMEOUT, router_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => DeploymentResult::failed("router", e.to_string(), HashMap::new()),
            Err(_) => DeploymentResult::failed("router", "router launch timed out", HashMap::new()),
        };
        if let Some(error) = &router_result.error {
            // Keep collecting serverless/spot results so cleanup has them.
            warn!("router launch failed: {error}");
        }
        let router_url = router_result.endpoint_url.clone();

        let serverless_result = settle(
            serverless_handle,
            SERVERLESS_TIMEOUT,
            &request.serverless_provider,
            &serverless_meta,
        )
        .await;
        if let (Some(router_url), Some(endpoint)) =
            (router_url.as_deref(), serverless_result.endpoint_url.as_deref())
        {
            info!("pushing serverless URL to router: {endpoint}");
            push_url_to_router(router_url, Some(endpoint), Some(backend_auth_token.as_str()), None).await;
        }

        let spot_result = settle(spot_handle, SPOT_TIMEOUT, "skyserve", &spot_meta).await;
        if let (Some(router_url), Some(endpoint)) =
            (router_url.as_deref(), spot_result.endpoint_url.as_deref())
        {
            info!("pushing spot URL to router: {endpoint}");
            push_url_to_router(router_url, None, None, Some(endpoint)).await;
        } else if let Some(error) = &spot_result.error {
            warn!("spot deployment issue: {error}");
        }

        return Ok(HybridDeployment {
            serverless: Some(serverless_result),
            spot: Some(spot_result),
            router: Some(router_result),
            router_url,
        });
    }

    // Default path: colocate the router on the controller once spot
    // created it.
    info!("launching serverless + spot in parallel, router will colocate on controller");
    let spot_result = settle(spot_handle, SPOT_TIMEOUT, "skyserve", &spot_meta).await;

    // Bake the serverless URL into the router env if it is already known.
    let mut serverless_handle = Some(serverless_handle);
    let mut serverless_result: Option<DeploymentResult> = None;
    let mut baked_serverless_url = String::new();
    if serverless_handle.as_ref().map(|h| h.is_finished()).unwrap_or(false) {
        let handle = serverless_handle.take().expect("handle present");
        let settled = settle(
            handle,
            Duration::from_secs(1),
            &request.serverless_provider,
            &serverless_meta,
        )
        .await;
        if let Some(endpoint) = &settled.endpoint_url {
            baked_serverless_url = endpoint.clone();
        }
        serverless_result = Some(settled);
    }

    let controller_cluster = remote::find_controller_cluster(&sky).await;
    let mut router_result = match &controller_cluster {
        Some(controller) => {
            info!("controller found: {controller}, colocating router");
            remote::launch_router_on_controller(
                &sky,
                controller,
                &baked_serverless_url,
                &backend_auth_token,
                remote::ROUTER_PORT,
            )
            .await
        }
        None => {
            warn!("controller cluster not found, falling back to separate router VM");
            remote::launch_router_vm(&sky, request).await
        }
    };

    if router_result.error.is_some() {
        warn!("router launch failed: {:?}", router_result.error);
        let was_colocated_attempt = controller_cluster.is_some()
            && router_result.metadata.get("colocated").map(String::as_str) == Some("true");
        if controller_cluster.is_some() && !was_colocated_attempt {
            // Already a fallback result; nothing further to try.
        } else if controller_cluster.is_some() {
            warn!("colocated router failed, falling back to separate router VM");
            router_result = remote::launch_router_vm(&sky, request).await;
        }
    }
    let router_url = router_result.endpoint_url.clone();

    let serverless_result = match (serverless_result, serverless_handle.take()) {
        (Some(result), _) => result,
        (None, Some(handle)) => {
            settle(
                handle,
                SERVERLESS_TIMEOUT,
                &request.serverless_provider,
                &serverless_meta,
            )
            .await
        }
        (None, None) => DeploymentResult::failed(
            request.serverless_provider.clone(),
            "serverless launch task vanished",
            serverless_meta.lock().clone(),
        ),
    };

    // Push the serverless URL unless it was already baked in at launch.
    if let (Some(router_url), Some(endpoint)) =
        (router_url.as_deref(), serverless_result.endpoint_url.as_deref())
    {
        if endpoint != baked_serverless_url {
            info!("pushing serverless URL to router: {endpoint}");
            push_url_to_router(router_url, Some(endpoint), Some(backend_auth_token.as_str()), None).await;
        }
    }

    // A colocated router reads spot on localhost; only a dedicated router
    // VM needs the spot URL pushed.
    let colocated = router_result.metadata.get("colocated").map(String::as_str) == Some("true");
    if let (Some(router_url), Some(endpoint), false) =
        (router_url.as_deref(), spot_result.endpoint_url.as_deref(), colocated)
    {
        info!("pushing spot URL to router: {endpoint}");
        push_url_to_router(router_url, None, None, Some(endpoint)).await;
    }

    Ok(HybridDeployment {
        serverless: Some(serverless_result),
        spot: Some(spot_result),
        router: Some(router_result),
        router_url,
    })
}

/// Poll a health endpoint until it answers 200. Advisory: a timeout is
/// reported, not fatal.
async fn warmup_serverless(health_url: &str, timeout: Duration, interval: Duration) -> bool {
    info!("warming up serverless container: {health_url}");
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let response = http_client()
            .get(health_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        if matches!(response, Ok(ref r) if r.status().as_u16() == 200) {
            info!("serverless container is healthy");
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    warn!("warmup timed out for {health_url} (container may still be starting)");
    false
}

/// Deploy only the serverless backend; clients talk to it directly.
pub async fn launch_serverless_only(request: &mut DeployRequest) -> Result<HybridDeployment> {
    let provider = registry::get_provider(&request.serverless_provider)?;
    info!("deploying serverless-only via {}", request.serverless_provider);

    let preflight = provider.preflight(request).await;
    if !preflight.ok() {
        return Ok(HybridDeployment {
            serverless: Some(DeploymentResult::failed(
                request.serverless_provider.clone(),
                format!("Preflight failed: {}", preflight.failure_summary()),
                HashMap::from([(
                    "service_name".to_string(),
                    format!("{}-serverless", request.service_name),
                )]),
            )),
            ..Default::default()
        });
    }

    request.vllm_version = provider.vllm_version().await;
    info!(
        "vLLM version: {} (from {})",
        request.vllm_version, request.serverless_provider
    );
    let vllm_cmd = build_vllm_cmd(request, "8001");

    let plan = match provider.plan(request, &vllm_cmd) {
        Ok(plan) => plan,
        Err(e) => {
            warn!("serverless deploy failed: {e}");
            return Ok(HybridDeployment {
                serverless: Some(DeploymentResult::failed(
                    request.serverless_provider.clone(),
                    e.to_string(),
                    HashMap::new(),
                )),
                ..Default::default()
            });
        }
    };
    let captured_meta = plan.metadata.clone();
    let serverless_result = provider.deploy(&plan).await;
    if serverless_result.error.is_some() {
        let mut result = serverless_result;
        for (key, value) in captured_meta {
            result.metadata.entry(key).or_insert(value);
        }
        return Ok(HybridDeployment {
            serverless: Some(result),
            ..Default::default()
        });
    }

    info!("serverless endpoint: {:?}", serverless_result.endpoint_url);

    // Trigger the cold start now so the endpoint is ready when the user
    // sends the first real request.
    let health_url = serverless_result.health_url.clone().unwrap_or_else(|| {
        format!(
            "{}/health",
            serverless_result.endpoint_url.clone().unwrap_or_default()
        )
    });
    warmup_serverless(&health_url, Duration::from_secs(300), Duration::from_secs(5)).await;

    let router_url = serverless_result.endpoint_url.clone();
    Ok(HybridDeployment {
        serverless: Some(serverless_result),
        router_url,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColdStartMode;

    #[test]
    fn test_build_vllm_cmd_fast_boot() {
        let request = DeployRequest::new("meta-llama/Llama-3.1-8B", "L4");
        let cmd = build_vllm_cmd(&request, "8001");
        assert!(cmd.starts_with("vllm serve meta-llama/Llama-3.1-8B"));
        assert!(cmd.contains("--port 8001"));
        assert!(cmd.contains("--max-model-len 4096"));
        assert!(cmd.contains("--tensor-parallel-size 1"));
        assert!(cmd.ends_with("--enforce-eager"));
    }

    #[test]
    fn test_build_vllm_cmd_no_fast_boot() {
        let mut request = DeployRequest::new("m", "L4");
        request.cold_start_mode = ColdStartMode::NoFastBoot;
        request.max_model_len = 2048;
        request.tp_size = 2;
        let cmd = build_vllm_cmd(&request, "8000");
        assert!(!cmd.contains("--enforce-eager"));
        assert!(cmd.contains("--port 8000"));
        assert!(cmd.contains("--tensor-parallel-size 2"));
        // No trailing whitespace left by the empty eager flag.
        assert_eq!(cmd, cmd.trim());
    }
}
