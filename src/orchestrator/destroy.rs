//! Teardown of hybrid deployments.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::DeploymentResult;
use crate::orchestrator::remote;
use crate::providers::registry;
use crate::spot::sky::{service_status, SkyApi, SkyCli};
use crate::state::DeploymentRecord;

/// Tear down the spot controller VM once no services remain.
///
/// Polls the service list for up to ~90 s so in-progress teardowns can
/// finish; any still-active service leaves the controller alone.
pub async fn cleanup_serve_controller(sky: &dyn SkyApi) {
    for _ in 0..18 {
        let services = match sky.serve_status(None).await {
            Ok(services) => services,
            Err(e) => {
                debug!("controller cleanup check failed (non-fatal): {e}");
                return;
            }
        };
        if services.is_empty() {
            break;
        }
        if services.iter().all(|s| service_status::is_terminal(&s.status)) {
            debug!("all remaining services in terminal state, waiting for removal...");
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }
        // A service is still active — leave the controller alone.
        return;
    }

    if let Some(controller) = remote::find_controller_cluster(sky).await {
        info!("no remaining services, tearing down controller: {controller}");
        if let Err(e) = sky.cluster_down(&controller).await {
            debug!("controller teardown failed (non-fatal): {e}");
        }
    }
}

/// Copy identifiers destroy needs but the stored metadata lacks, using the
/// provider's status lookup. Only a few providers assign IDs at deploy
/// time; the rest identify resources by the conventional names.
async fn recover_missing_ids(
    provider_name: &str,
    service_name: &str,
    metadata: &mut HashMap<String, String>,
) {
    let lookup = |status: &Value, key: &str| -> Option<String> {
        status.get(key).and_then(Value::as_str).map(str::to_string)
    };

    match provider_name {
        "baseten" if !metadata.contains_key("model_id") => {
            if let Ok(provider) = registry::get_provider(provider_name) {
                let status = provider.status(service_name).await;
                if let Some(model_id) = lookup(&status, "model_id") {
                    metadata.insert("model_id".to_string(), model_id);
                }
            }
        }
        "runpod" if !metadata.contains_key("endpoint_id") => {
            if let Ok(provider) = registry::get_provider(provider_name) {
                let status = provider.status(service_name).await;
                if let Some(endpoint_id) = lookup(&status, "endpoint_id") {
                    metadata.insert("endpoint_id".to_string(), endpoint_id);
                }
                if let Some(template_id) = lookup(&status, "template_id") {
                    metadata.insert("template_id".to_string(), template_id);
                }
            }
        }
        "cloudrun" => {
            #[cfg(feature = "cloudrun")]
            if !metadata.contains_key("project_id") {
                if let Some(project) = crate::providers::cloudrun::resolve_project_id().await {
                    metadata.insert("project_id".to_string(), project);
                }
            }
            if !metadata.contains_key("region") {
                let region = std::env::var("GOOGLE_CLOUD_REGION")
                    .unwrap_or_else(|_| "us-central1".to_string());
                metadata.insert("region".to_string(), region);
            }
        }
        _ => {}
    }
}

/// Tear down all components of a deployment.
///
/// `skip_controller_cleanup` lets batch callers run the (shared)
/// controller cleanup once at the end instead of after every record.
pub async fn destroy_hybrid(
    service_name: &str,
    record: Option<&DeploymentRecord>,
    skip_controller_cleanup: bool,
) -> Result<()> {
    let sky = SkyCli;
    let fallback_record;
    let record = match record {
        Some(record) => record,
        None => {
            warn!("no deployment record for {service_name}, falling back to defaults");
            fallback_record = DeploymentRecord {
                service_name: service_name.to_string(),
                ..Default::default()
            };
            &fallback_record
        }
    };

    info!("destroying hybrid deployment: {service_name}");

    // Router first — colocated routers die with the controller anyway.
    let router_meta = &record.router_metadata;
    if router_meta.is_empty()
        && record.router_endpoint.is_none()
        && record.spot_provider_name.is_none()
    {
        info!("no router to tear down (serverless-only deployment)");
    } else if router_meta.get("colocated").map(String::as_str) == Some("true") {
        if let Some(controller) = router_meta.get("cluster_name") {
            remote::kill_colocated_router(&sky, controller).await;
        }
    } else {
        let router_cluster = format!("{service_name}-router");
        info!("tearing down router: {router_cluster}");
        if let Err(e) = sky.cluster_down(&router_cluster).await {
            debug!("router teardown failed (non-fatal): {e}");
        }
    }

    // Spot next, via the provider interface.
    if let Some(spot_name) = &record.spot_provider_name {
        let mut spot_meta = record.spot_metadata.clone();
        spot_meta
            .entry("service_name".to_string())
            .or_insert_with(|| format!("{service_name}-spot"));
        let spot_provider = registry::get_provider(spot_name)?;
        info!("tearing down spot service via provider: {}", spot_provider.name());
        spot_provider
            .destroy(&DeploymentResult {
                provider: spot_provider.name().to_string(),
                metadata: spot_meta,
                ..Default::default()
            })
            .await;
    } else {
        info!("no spot deployment to tear down");
    }

    // Serverless last.
    if let Some(serverless_name) = &record.serverless_provider_name {
        let mut serverless_meta = record.serverless_metadata.clone();
        let conventional = format!("{service_name}-serverless");
        serverless_meta
            .entry("app_name".to_string())
            .or_insert_with(|| conventional.clone());
        serverless_meta
            .entry("service_name".to_string())
            .or_insert_with(|| conventional.clone());

        recover_missing_ids(serverless_name, service_name, &mut serverless_meta).await;

        let serverless_provider = registry::get_provider(serverless_name)?;
        info!(
            "tearing down serverless via provider: {}",
            serverless_provider.name()
        );
        serverless_provider
            .destroy(&DeploymentResult {
                provider: serverless_provider.name().to_string(),
                metadata: serverless_meta,
                ..Default::default()
            })
            .await;
    } else {
        info!("no serverless deployment to tear down");
    }

    if !skip_controller_cleanup {
        cleanup_serve_controller(&sky).await;
    }

    info!("destroy complete for {service_name}");
    Ok(())
}
