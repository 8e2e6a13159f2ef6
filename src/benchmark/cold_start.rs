//! Cold-start benchmark orchestration.
//!
//! Two scenarios: fresh-cold deploys a serverless endpoint with a short
//! scaledown window and measures the first boot; warm-cold waits for an
//! existing endpoint to scale to zero without touching it (health probes
//! reset the provider's scaledown timer), then times the next request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::benchmark::log_watchers::{create_log_watcher, LogWatcher};
use crate::benchmark::providers::{
    auth_headers, is_cold, supports_log_phases, trigger_cold_start, validate_provider,
};
use crate::error::Result;
use crate::models::{ColdStartMode, DeployRequest};
use crate::orchestrator::{destroy_hybrid, launch_serverless_only};
use crate::providers::{http_client, registry};
use crate::scaling::ScalingPolicy;
use crate::state::{status, StateStore};

/// Result of a single cold-start measurement.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RunResult {
    pub scenario: String,
    pub provider: String,
    pub gpu: String,
    pub total_s: f64,
    pub health_ready_s: Option<f64>,
    pub first_inference_s: Option<f64>,
    pub ttft_s: Option<f64>,
    pub container_boot_s: Option<f64>,
    pub model_load_s: Option<f64>,
    pub deploy_time_s: Option<f64>,
    pub error: Option<String>,
}

/// Wait for the endpoint to scale to zero.
///
/// Sits quiet for `cooldown` seconds, then does a single check; if still
/// warm, goes quiet again. Repeats until confirmed cold or `timeout`.
pub async fn wait_for_cold(
    provider: &str,
    health_url: &str,
    headers: &[(String, String)],
    timeout: Duration,
    cooldown: Duration,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        info!("quiet period ({}s)...", cooldown.as_secs());
        let quiet_end = Instant::now() + cooldown;
        while Instant::now() < quiet_end && start.elapsed() < timeout {
            let remaining = quiet_end.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(Duration::from_secs(15))).await;
        }
        if start.elapsed() >= timeout {
            break;
        }

        if is_cold(provider, health_url, headers).await {
            info!("scale-to-zero confirmed after {:.0}s", start.elapsed().as_secs_f64());
            return true;
        }
        info!(
            "still warm after {:.0}s, restarting quiet period...",
            start.elapsed().as_secs_f64()
        );
    }
    warn!(
        "scale-to-zero not confirmed after {:.0}s",
        timeout.as_secs_f64()
    );
    false
}

/// Poll until the health endpoint answers 200. Returns the wait duration.
pub async fn wait_for_health(
    health_url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> Option<f64> {
    let start = Instant::now();
    let mut last_progress = start;
    while start.elapsed() < timeout {
        let mut request = http_client().get(health_url).timeout(Duration::from_secs(10));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if matches!(request.send().await, Ok(ref r) if r.status().as_u16() == 200) {
            return Some(start.elapsed().as_secs_f64());
        }
        if last_progress.elapsed() >= Duration::from_secs(15) {
            info!("waiting for health... {:.0}s elapsed", start.elapsed().as_secs_f64());
            last_progress = Instant::now();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    None
}

/// Send one streamed inference request; returns `(ttft, total)` seconds.
pub async fn measure_ttft(
    endpoint_url: &str,
    model: &str,
    headers: &[(String, String)],
) -> (Option<f64>, Option<f64>) {
    let mut url = endpoint_url.trim_end_matches('/').to_string();
    if !url.ends_with("/v1/chat/completions") {
        url = format!("{url}/v1/chat/completions");
    }

    let body = serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": "hi" }],
        "max_tokens": 8,
        "stream": true,
    });

    let start = Instant::now();
    let mut request = http_client()
        .post(&url)
        .timeout(Duration::from_secs(600))
        .json(&body);
    for (name, value) in headers {
        request = request.header(name, value);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            warn!("inference request failed: {e}");
            return (None, None);
        }
    };
    if response.status().as_u16() != 200 {
        warn!("inference returned {}", response.status());
        return (None, None);
    }

    let mut ttft = None;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if ttft.is_none() && !bytes.is_empty() {
                    ttft = Some(start.elapsed().as_secs_f64());
                }
            }
            Err(e) => {
                warn!("inference stream error: {e}");
                break;
            }
        }
    }
    (ttft, Some(start.elapsed().as_secs_f64()))
}

struct PhaseBreakdown {
    container_boot_s: Option<f64>,
    model_load_s: Option<f64>,
}

async fn stop_watcher(watcher: Option<LogWatcher>) -> PhaseBreakdown {
    match watcher {
        Some(mut watcher) => {
            let phases = watcher.stop().await;
            PhaseBreakdown {
                container_boot_s: phases.container_boot_seconds(),
                model_load_s: phases.model_load_seconds(),
            }
        }
        None => PhaseBreakdown {
            container_boot_s: None,
            model_load_s: None,
        },
    }
}

/// One measured cold start against an existing endpoint.
async fn single_run(
    provider: &str,
    endpoint_url: &str,
    health_url: &str,
    model: &str,
    gpu: &str,
    headers: &[(String, String)],
    metadata: &HashMap<String, String>,
    scenario: &str,
) -> RunResult {
    let watcher = supports_log_phases(provider)
        .then(|| create_log_watcher(provider, metadata))
        .flatten();

    let t0 = Instant::now();
    let trigger = {
        let provider = provider.to_string();
        let endpoint_url = endpoint_url.to_string();
        let health_url = health_url.to_string();
        let model = model.to_string();
        let headers = headers.to_vec();
        tokio::spawn(async move {
            trigger_cold_start(&provider, &endpoint_url, &health_url, &model, &headers).await;
        })
    };

    let health_ready_s = wait_for_health(health_url, headers, Duration::from_secs(600)).await;
    let (ttft_s, inference_s) = measure_ttft(endpoint_url, model, headers).await;
    let total_s = t0.elapsed().as_secs_f64();
    trigger.abort();

    let phases = stop_watcher(watcher).await;

    RunResult {
        scenario: scenario.to_string(),
        provider: provider.to_string(),
        gpu: gpu.to_string(),
        total_s,
        health_ready_s,
        first_inference_s: inference_s,
        ttft_s,
        container_boot_s: phases.container_boot_s,
        model_load_s: phases.model_load_s,
        deploy_time_s: None,
        error: None,
    }
}

fn average(values: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    (!present.is_empty()).then(|| present.iter().sum::<f64>() / present.len() as f64)
}

/// Mean over multiple runs, ignoring per-run `None`s.
pub fn mean_run(runs: &[RunResult]) -> Option<RunResult> {
    let first = runs.first()?;
    if runs.len() == 1 {
        return Some(first.clone());
    }
    Some(RunResult {
        scenario: first.scenario.clone(),
        provider: first.provider.clone(),
        gpu: first.gpu.clone(),
        total_s: runs.iter().map(|r| r.total_s).sum::<f64>() / runs.len() as f64,
        health_ready_s: average(&runs.iter().map(|r| r.health_ready_s).collect::<Vec<_>>()),
        first_inference_s: average(&runs.iter().map(|r| r.first_inference_s).collect::<Vec<_>>()),
        ttft_s: average(&runs.iter().map(|r| r.ttft_s).collect::<Vec<_>>()),
        container_boot_s: average(&runs.iter().map(|r| r.container_boot_s).collect::<Vec<_>>()),
        model_load_s: average(&runs.iter().map(|r| r.model_load_s).collect::<Vec<_>>()),
        deploy_time_s: average(&runs.iter().map(|r| r.deploy_time_s).collect::<Vec<_>>()),
        error: None,
    })
}

async fn teardown(store: &StateStore, service_name: &str) {
    info!("tearing down benchmark deployment...");
    let record = match store.load(service_name).await {
        Ok(record) => record,
        Err(e) => {
            warn!("teardown failed: {e}");
            return;
        }
    };
    if let Some(record) = &record {
        if let Err(e) = registry::ensure_providers_for_record(record) {
            warn!("teardown failed: {e}");
            return;
        }
    }
    if let Err(e) = destroy_hybrid(service_name, record.as_ref(), false).await {
        warn!("teardown failed: {e}");
        return;
    }
    if let Err(e) = store.update_status(service_name, status::DESTROYED).await {
        warn!("teardown status update failed: {e}");
    }
}

/// Deploy fresh, measure the first cold start, optionally tear down.
pub async fn run_fresh_cold_start(
    store: &StateStore,
    provider: &str,
    gpu: &str,
    model: &str,
    max_model_len: u32,
    no_teardown: bool,
) -> Result<Vec<RunResult>> {
    validate_provider(provider)?;
    registry::ensure_registered(provider)?;

    let mut scaling = ScalingPolicy::default();
    scaling.serverless.scaledown_window = 30;

    let mut request = DeployRequest::new(model, gpu);
    request.serverless_provider = provider.to_string();
    request.max_model_len = max_model_len;
    request.cold_start_mode = ColdStartMode::FastBoot;
    request.public = true;
    request.serverless_only = true;
    request.scaling = scaling;

    // Start the log watcher before deploy where the pre-known name is
    // enough; providers that assign IDs at deploy time get a second chance
    // below.
    let pre_metadata = HashMap::from([(
        "service_name".to_string(),
        format!("{}-serverless", request.service_name),
    )]);
    let mut watcher = supports_log_phases(provider)
        .then(|| create_log_watcher(provider, &pre_metadata))
        .flatten();

    info!("deploying {model} on {provider} ({gpu})...");
    let t_deploy = Instant::now();
    let result = launch_serverless_only(&mut request).await?;
    let deploy_time = t_deploy.elapsed().as_secs_f64();
    info!("deploy completed in {deploy_time:.1}s");

    // Persist so destroy can find the resources even on failure.
    store.save(&request, &result).await?;

    let Some(serverless) = result
        .serverless
        .as_ref()
        .filter(|s| s.endpoint_url.is_some())
    else {
        if let Some(w) = watcher.as_mut() {
            w.stop().await;
        }
        let error = result
            .serverless
            .as_ref()
            .and_then(|s| s.error.clone())
            .unwrap_or_else(|| "Deployment failed: no endpoint returned".to_string());
        warn!("{error}");
        return Ok(vec![RunResult {
            scenario: "fresh_cold_start".to_string(),
            provider: provider.to_string(),
            gpu: gpu.to_string(),
            total_s: deploy_time,
            deploy_time_s: Some(deploy_time),
            error: Some(error),
            ..Default::default()
        }]);
    };

    let endpoint_url = serverless.endpoint_url.clone().unwrap_or_default();
    let health_url = serverless
        .health_url
        .clone()
        .unwrap_or_else(|| format!("{endpoint_url}/health"));
    let metadata = serverless.metadata.clone();
    let headers = auth_headers(provider)?;

    if watcher.is_none() && supports_log_phases(provider) {
        // Real metadata is available now; the container is still booting.
        watcher = create_log_watcher(provider, &metadata);
    }

    // The deploy CLI returns fast but the container is still booting —
    // waiting for health is the real cold start.
    let t0 = Instant::now();
    info!("waiting for container to be ready...");
    let health_ready_s = wait_for_health(&health_url, &headers, Duration::from_secs(600)).await;
    let phases = stop_watcher(watcher).await;

    let Some(health_ready_s) = health_ready_s else {
        let run = RunResult {
            scenario: "fresh_cold_start".to_string(),
            provider: provider.to_string(),
            gpu: gpu.to_string(),
            total_s: t0.elapsed().as_secs_f64() + deploy_time,
            deploy_time_s: Some(deploy_time),
            container_boot_s: phases.container_boot_s,
            model_load_s: phases.model_load_s,
            error: Some("Health endpoint never became ready (timeout 600s)".to_string()),
            ..Default::default()
        };
        if !no_teardown {
            teardown(store, &request.service_name).await;
        }
        return Ok(vec![run]);
    };

    info!("measuring first inference...");
    let (ttft_s, inference_s) = measure_ttft(&endpoint_url, model, &headers).await;
    let total_s = t0.elapsed().as_secs_f64() + deploy_time;

    let run = RunResult {
        scenario: "fresh_cold_start".to_string(),
        provider: provider.to_string(),
        gpu: gpu.to_string(),
        total_s,
        deploy_time_s: Some(deploy_time),
        health_ready_s: Some(health_ready_s + deploy_time),
        first_inference_s: inference_s,
        ttft_s,
        container_boot_s: phases.container_boot_s,
        model_load_s: phases.model_load_s,
        error: None,
    };

    if !no_teardown {
        teardown(store, &request.service_name).await;
    }
    Ok(vec![run])
}

/// Measure cold starts against an existing (warm) deployment.
#[allow(clippy::too_many_arguments)]
pub async fn run_warm_cold_start(
    provider: &str,
    gpu: &str,
    model: &str,
    endpoint_url: &str,
    health_url: &str,
    metadata: &HashMap<String, String>,
    repeat: u32,
    idle_wait: Duration,
) -> Result<Vec<RunResult>> {
    validate_provider(provider)?;
    let headers = auth_headers(provider)?;
    let mut results = Vec::new();

    for i in 1..=repeat {
        info!("--- warm cold start run {i}/{repeat} ---");
        info!("waiting for scale-to-zero...");
        let cold = wait_for_cold(
            provider,
            health_url,
            &headers,
            idle_wait,
            Duration::from_secs(120),
        )
        .await;
        if !cold {
            warn!("skipping run {i}: endpoint did not scale to zero");
            continue;
        }

        info!("triggering cold start...");
        let run = single_run(
            provider,
            endpoint_url,
            health_url,
            model,
            gpu,
            &headers,
            metadata,
            "warm_cold_start",
        )
        .await;
        info!("total: {:.1}s", run.total_s);
        results.push(run);
    }
    Ok(results)
}

/// Most recent active deployment matching provider + model, for warm runs.
pub async fn find_existing_deployment(
    store: &StateStore,
    provider: &str,
    model: &str,
) -> Result<Option<crate::state::DeploymentRecord>> {
    let records = store.list(Some(status::ACTIVE)).await?;
    Ok(records.into_iter().find(|r| {
        r.serverless_provider_name.as_deref() == Some(provider) && r.model_name == model
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(total: f64, ttft: Option<f64>) -> RunResult {
        RunResult {
            scenario: "warm_cold_start".to_string(),
            provider: "modal".to_string(),
            gpu: "L4".to_string(),
            total_s: total,
            ttft_s: ttft,
            ..Default::default()
        }
    }

    #[test]
    fn test_mean_run_averages_and_skips_none() {
        let runs = vec![run(10.0, Some(2.0)), run(20.0, None), run(30.0, Some(4.0))];
        let mean = mean_run(&runs).unwrap();
        assert!((mean.total_s - 20.0).abs() < 1e-9);
        assert_eq!(mean.ttft_s, Some(3.0));
        assert!(mean.health_ready_s.is_none());
        assert_eq!(mean.scenario, "warm_cold_start");
    }

    #[test]
    fn test_mean_run_single_passthrough() {
        let runs = vec![run(10.0, Some(2.0))];
        let mean = mean_run(&runs).unwrap();
        assert_eq!(mean.total_s, 10.0);
    }

    #[test]
    fn test_mean_run_empty() {
        assert!(mean_run(&[]).is_none());
    }

    #[tokio::test]
    async fn test_measure_ttft_against_stream() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("data: {\"choices\":[]}\n\ndata: [DONE]\n\n"),
            )
            .mount(&server)
            .await;

        let (ttft, total) = measure_ttft(&server.uri(), "llm", &[]).await;
        assert!(ttft.is_some());
        assert!(total.unwrap() >= ttft.unwrap());
    }

    #[tokio::test]
    async fn test_single_run_measures_full_cold_start() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        // A backend whose health endpoint boots workers: health answers 200
        // and inference streams.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data: hi\n\n"))
            .mount(&server)
            .await;

        let run = single_run(
            "modal",
            &server.uri(),
            &format!("{}/health", server.uri()),
            "llm",
            "L4",
            &[],
            &HashMap::new(),
            "warm_cold_start",
        )
        .await;

        assert!(run.total_s > 0.0);
        assert!(run.health_ready_s.is_some());
        assert!(run.ttft_s.is_some());
        assert!(run.first_inference_s.is_some());
        assert!(run.error.is_none());
        assert_eq!(run.scenario, "warm_cold_start");
    }

    #[tokio::test]
    async fn test_measure_ttft_non_200() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (ttft, total) = measure_ttft(&server.uri(), "llm", &[]).await;
        assert!(ttft.is_none());
        assert!(total.is_none());
    }
}
