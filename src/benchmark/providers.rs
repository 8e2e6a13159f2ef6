//! Provider-specific helpers for cold-start benchmarking.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::error::{Result, TunaError};
use crate::providers::http_client;

/// Providers with a verified log-tailing path.
pub const LOG_CAPABLE_PROVIDERS: &[&str] = &["modal", "cloudrun", "cerebrium", "baseten"];

/// Reject providers unsuitable for cold-start benchmarking.
pub fn validate_provider(provider: &str) -> Result<()> {
    if provider == "azure" {
        return Err(TunaError::Config(
            "Azure Container Apps ManagedEnvironment takes 30+ min to create/delete, \
             making cold start benchmarking impractical."
                .to_string(),
        ));
    }
    Ok(())
}

pub fn supports_log_phases(provider: &str) -> bool {
    LOG_CAPABLE_PROVIDERS.contains(&provider)
}

/// Auth headers a provider's endpoints require.
pub fn auth_headers(provider: &str) -> Result<Vec<(String, String)>> {
    match provider {
        "runpod" => {
            let key = std::env::var("RUNPOD_API_KEY").unwrap_or_default();
            if key.is_empty() {
                return Err(TunaError::MissingCredentials(
                    "RUNPOD_API_KEY required for RunPod benchmarking".to_string(),
                ));
            }
            Ok(vec![("Authorization".to_string(), format!("Bearer {key}"))])
        }
        "baseten" => {
            let key = std::env::var("BASETEN_API_KEY").unwrap_or_default();
            if key.is_empty() {
                return Err(TunaError::MissingCredentials(
                    "BASETEN_API_KEY required for Baseten benchmarking".to_string(),
                ));
            }
            Ok(vec![("Authorization".to_string(), format!("Api-Key {key}"))])
        }
        _ => Ok(Vec::new()),
    }
}

fn with_headers(
    request: reqwest::RequestBuilder,
    headers: &[(String, String)],
) -> reqwest::RequestBuilder {
    headers
        .iter()
        .fold(request, |req, (name, value)| req.header(name, value))
}

/// Whether an endpoint is currently scaled to zero.
pub async fn is_cold(provider: &str, health_url: &str, headers: &[(String, String)]) -> bool {
    if provider == "runpod" {
        return is_cold_runpod(health_url, headers).await;
    }
    is_cold_http(health_url, headers).await
}

/// RunPod's health endpoint answers 200 with worker counts even when cold.
async fn is_cold_runpod(health_url: &str, headers: &[(String, String)]) -> bool {
    let response = with_headers(http_client().get(health_url), headers)
        .timeout(Duration::from_secs(10))
        .send()
        .await;
    let Ok(response) = response else { return true };
    if response.status().as_u16() != 200 {
        return true;
    }
    let Ok(body) = response.json::<serde_json::Value>().await else {
        return true;
    };
    let workers = body.get("workers").cloned().unwrap_or(json!({}));
    let count = |key: &str| workers.get(key).and_then(serde_json::Value::as_u64).unwrap_or(0);
    count("ready") == 0 && count("running") == 0 && count("initializing") == 0
}

/// Generic cold check: non-200 or a connection error means cold.
async fn is_cold_http(health_url: &str, headers: &[(String, String)]) -> bool {
    let response = with_headers(http_client().get(health_url), headers)
        .timeout(Duration::from_secs(5))
        .send()
        .await;
    match response {
        Ok(r) => r.status().as_u16() != 200,
        Err(_) => true,
    }
}

/// Send whatever request boots this provider from cold.
///
/// RunPod's health endpoint does not boot workers, so it needs a real
/// inference POST; everyone else wakes on a health GET.
pub async fn trigger_cold_start(
    provider: &str,
    endpoint_url: &str,
    health_url: &str,
    model: &str,
    headers: &[(String, String)],
) {
    if provider == "runpod" {
        let mut url = endpoint_url.trim_end_matches('/').to_string();
        if !url.ends_with("/v1/chat/completions") {
            url = format!("{url}/v1/chat/completions");
        }
        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": "hi" }],
            "max_tokens": 1,
            "stream": false,
        });
        let result = with_headers(http_client().post(&url), headers)
            .timeout(Duration::from_secs(600))
            .json(&body)
            .send()
            .await;
        if let Err(e) = result {
            debug!("cold start trigger failed (expected while booting): {e}");
        }
    } else {
        let result = with_headers(http_client().get(health_url), headers)
            .timeout(Duration::from_secs(600))
            .send()
            .await;
        if let Err(e) = result {
            debug!("cold start trigger failed (expected while booting): {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_validate_provider() {
        assert!(validate_provider("modal").is_ok());
        assert!(validate_provider("azure").is_err());
    }

    #[test]
    fn test_supports_log_phases() {
        assert!(supports_log_phases("modal"));
        assert!(supports_log_phases("baseten"));
        assert!(!supports_log_phases("runpod"));
    }

    #[tokio::test]
    async fn test_is_cold_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert!(is_cold("modal", &format!("{}/health", server.uri()), &[]).await);

        let warm = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&warm)
            .await;
        assert!(!is_cold("modal", &format!("{}/health", warm.uri()), &[]).await);
    }

    #[tokio::test]
    async fn test_is_cold_runpod_reads_worker_counts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "workers": { "ready": 0, "running": 0, "initializing": 0 }
            })))
            .mount(&server)
            .await;
        assert!(is_cold("runpod", &format!("{}/health", server.uri()), &[]).await);

        let warm = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "workers": { "ready": 1, "running": 0, "initializing": 0 }
            })))
            .mount(&warm)
            .await;
        assert!(!is_cold("runpod", &format!("{}/health", warm.uri()), &[]).await);
    }
}
