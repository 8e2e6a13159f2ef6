//! Status aggregation across router, serverless, and spot.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::Result;
use crate::orchestrator::remote;
use crate::providers::{http_client, registry};
use crate::spot::sky::{SkyApi, SkyCli};
use crate::state::DeploymentRecord;

/// Check status of every component of a deployment.
pub async fn status_hybrid(service_name: &str, record: &DeploymentRecord) -> Result<Value> {
    // Serverless-only deployments have no router or spot to ask.
    if record.is_serverless_only() {
        let serverless_name = record
            .serverless_provider_name
            .as_deref()
            .unwrap_or("modal");
        let provider = registry::get_provider(serverless_name)?;
        return Ok(json!({
            "service_name": service_name,
            "mode": "serverless-only",
            "router": Value::Null,
            "serverless": provider.status(service_name).await,
            "spot": Value::Null,
        }));
    }

    let sky = SkyCli;

    // Router: resolve the IP from the recorded placement.
    let router_meta = &record.router_metadata;
    let (ip, router_port) = if router_meta.get("colocated").map(String::as_str) == Some("true") {
        let port = router_meta
            .get("router_port")
            .cloned()
            .unwrap_or_else(|| "8080".to_string());
        let ip = match router_meta.get("cluster_name") {
            Some(cluster) => remote::get_cluster_ip(&sky, cluster).await,
            None => None,
        };
        (ip, port)
    } else {
        let ip = remote::get_cluster_ip(&sky, &format!("{service_name}-router")).await;
        (ip, "8080".to_string())
    };

    let router_status = match ip {
        Some(ip) => {
            let router_url = format!("http://{ip}:{router_port}");
            let response = http_client()
                .get(format!("{router_url}/router/health"))
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match response {
                Ok(r) if r.status().as_u16() == 200 => {
                    let mut health: Value = r.json().await.unwrap_or(json!({}));
                    health["url"] = json!(router_url);
                    health
                }
                _ => json!({ "url": router_url, "status": "unreachable" }),
            }
        }
        None => json!({ "status": "no cluster found" }),
    };

    let spot_name = record.spot_provider_name.as_deref().unwrap_or("skyserve");
    let serverless_name = record
        .serverless_provider_name
        .as_deref()
        .unwrap_or("modal");

    let spot_provider = registry::get_provider(spot_name)?;
    let serverless_provider = registry::get_provider(serverless_name)?;

    Ok(json!({
        "service_name": service_name,
        "router": router_status,
        "serverless": serverless_provider.status(service_name).await,
        "spot": spot_provider.status(service_name).await,
    }))
}
