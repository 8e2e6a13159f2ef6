//! Azure Container Apps GPU provider.
//!
//! ManagedEnvironments are created once and reused across deploys; only
//! ContainerApps are created and deleted per deploy/destroy cycle, because
//! environment creation and deletion take tens of minutes. Preflight and
//! token minting go through the `az` CLI; resource operations hit the ARM
//! REST API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::catalog::{provider_gpu_id, provider_gpu_map, provider_regions};
use crate::error::{Result, TunaError};
use crate::models::{DeployRequest, DeploymentResult, PreflightCheck, PreflightResult, ProviderPlan};
use crate::providers::{http_client, reject_multi_gpu, run_with_timeout, InferenceProvider};

const DEFAULT_REGION: &str = "eastus";
const DEFAULT_IMAGE: &str = "vllm/vllm-openai:v0.15.1";
const VLLM_PORT: u16 = 8000;
const ARM_BASE: &str = "https://management.azure.com";
const API_VERSION: &str = "2024-03-01";

/// Resources allocated per GPU workload profile.
const GPU_PROFILE_RESOURCES: &[(&str, &str, &str)] = &[
    ("Consumption-GPU-NC8as-T4", "8", "56Gi"),
    ("Consumption-GPU-NC24-A100", "24", "220Gi"),
];

async fn az(args: &[&str], timeout: Duration) -> Result<std::process::Output> {
    run_with_timeout(Command::new("az").args(args), timeout).await
}

async fn resolve_subscription_id() -> Option<String> {
    if let Ok(sub) = std::env::var("AZURE_SUBSCRIPTION_ID") {
        if !sub.is_empty() {
            return Some(sub);
        }
    }
    let output = az(
        &["account", "show", "--query", "id", "-o", "tsv"],
        Duration::from_secs(10),
    )
    .await
    .ok()?;
    let sub = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (output.status.success() && !sub.is_empty()).then_some(sub)
}

async fn resolve_resource_group() -> Option<String> {
    if let Ok(rg) = std::env::var("AZURE_RESOURCE_GROUP") {
        if !rg.is_empty() {
            return Some(rg);
        }
    }
    let output = az(
        &["config", "get", "defaults.group", "--query", "value", "-o", "tsv"],
        Duration::from_secs(10),
    )
    .await
    .ok()?;
    let rg = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (output.status.success() && !rg.is_empty()).then_some(rg)
}

async fn access_token() -> Result<String> {
    let output = az(
        &["account", "get-access-token", "--query", "accessToken", "-o", "tsv"],
        Duration::from_secs(15),
    )
    .await?;
    if !output.status.success() {
        return Err(TunaError::MissingCredentials(
            "az could not mint an access token; run 'az login'".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn gpu_workload_profile_name(gpu_profile: &str) -> String {
    let suffix = gpu_profile.rsplit('-').next().unwrap_or("gpu").to_lowercase();
    format!("gpu-{suffix}")
}

fn default_region() -> String {
    std::env::var("AZURE_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string())
}

/// Deploy a vLLM server on Azure Container Apps with GPU workload profiles.
#[derive(Default)]
pub struct AzureProvider;

#[async_trait]
impl InferenceProvider for AzureProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn vllm_version(&self) -> String {
        DEFAULT_IMAGE.rsplit(":v").next().unwrap_or("0.15.1").to_string()
    }

    fn auth_token(&self) -> String {
        // Container Apps with external ingress are publicly reachable.
        String::new()
    }

    async fn preflight(&self, request: &DeployRequest) -> PreflightResult {
        let mut result = PreflightResult::new(self.name());

        match az(&["version", "-o", "json"], Duration::from_secs(10)).await {
            Ok(output) if output.status.success() => {
                result.push(PreflightCheck::pass("az_installed", "az CLI found"));
            }
            _ => {
                result.push(
                    PreflightCheck::fail("az_installed", "az CLI not found").with_fix(
                        "https://learn.microsoft.com/en-us/cli/azure/install-azure-cli",
                    ),
                );
                return result;
            }
        }

        match resolve_subscription_id().await {
            Some(sub) => result.push(PreflightCheck::pass(
                "subscription",
                format!("Subscription: {sub}"),
            )),
            None => {
                result.push(
                    PreflightCheck::fail("subscription", "No Azure subscription configured")
                        .with_fix("az account set --subscription <SUBSCRIPTION_ID>"),
                );
                return result;
            }
        }

        match resolve_resource_group().await {
            Some(rg) => result.push(PreflightCheck::pass(
                "resource_group",
                format!("Resource group: {rg}"),
            )),
            None => result.push(
                PreflightCheck::fail("resource_group", "No Azure resource group configured")
                    .with_fix("az config set defaults.group=<RESOURCE_GROUP>"),
            ),
        }

        result.push(self.check_resource_provider("Microsoft.App").await);

        let region = default_region();
        let profile = provider_gpu_id(&request.gpu, self.name()).unwrap_or("");
        let valid_regions = provider_regions(&request.gpu, self.name());
        if valid_regions.is_empty() {
            result.push(PreflightCheck::pass(
                "gpu_region",
                format!("GPU region check skipped for unknown profile: {profile}"),
            ));
        } else if valid_regions.contains(&region.as_str()) {
            result.push(PreflightCheck::pass(
                "gpu_region",
                format!("{profile} available in {region}"),
            ));
        } else {
            result.push(
                PreflightCheck::fail(
                    "gpu_region",
                    format!("{profile} is not available in {region}"),
                )
                .with_fix(format!("export AZURE_REGION=<one of: {}>", valid_regions.join(", "))),
            );
        }

        result
    }

    fn plan(&self, request: &DeployRequest, _vllm_cmd: &str) -> Result<ProviderPlan> {
        let gpu_profile = provider_gpu_id(&request.gpu, self.name()).ok_or_else(|| {
            let mut supported: Vec<&str> = provider_gpu_map(self.name()).into_keys().collect();
            supported.sort_unstable();
            TunaError::PlanInvalid(format!(
                "unknown GPU type for Azure: {:?}. Supported: {supported:?}",
                request.gpu
            ))
        })?;
        reject_multi_gpu("Azure Container Apps", request)?;

        let subscription_id = std::env::var("AZURE_SUBSCRIPTION_ID").unwrap_or_default();
        let resource_group = std::env::var("AZURE_RESOURCE_GROUP").unwrap_or_default();
        let region = default_region();
        let service_name = format!("{}-serverless", request.service_name);
        let env_name = format!("{}-env", request.service_name);
        let serverless = &request.scaling.serverless;
        let fast_boot = request.cold_start_mode.is_fast_boot();

        let mut env = HashMap::from([
            ("MODEL_NAME".to_string(), request.model_name.clone()),
            ("MAX_MODEL_LEN".to_string(), request.max_model_len.to_string()),
            ("GPU_MEMORY_UTILIZATION".to_string(), "0.95".to_string()),
            ("DISABLE_LOG_REQUESTS".to_string(), "true".to_string()),
            ("HF_HUB_ENABLE_HF_TRANSFER".to_string(), "1".to_string()),
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

        let (cpu, memory) = GPU_PROFILE_RESOURCES
            .iter()
            .find(|(profile, _, _)| *profile == gpu_profile)
            .map(|(_, cpu, memory)| (*cpu, *memory))
            .unwrap_or(("8", "56Gi"));

        let metadata = HashMap::from([
            ("service_name".to_string(), service_name),
            ("env_name".to_string(), env_name),
            ("subscription_id".to_string(), subscription_id),
            ("resource_group".to_string(), resource_group),
            ("region".to_string(), region),
            ("image".to_string(), DEFAULT_IMAGE.to_string()),
            ("gpu_profile".to_string(), gpu_profile.to_string()),
            ("container_port".to_string(), VLLM_PORT.to_string()),
            ("container_args".to_string(), serde_json::to_string(&container_args)?),
            ("min_replicas".to_string(), serverless.workers_min.to_string()),
            ("max_replicas".to_string(), serverless.workers_max.to_string()),
            ("concurrency".to_string(), serverless.concurrency.to_string()),
            ("timeout".to_string(), serverless.timeout.to_string()),
            ("cpu".to_string(), cpu.to_string()),
            ("memory".to_string(), memory.to_string()),
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

        if metadata.get("subscription_id").map(String::is_empty).unwrap_or(true) {
            match resolve_subscription_id().await {
                Some(sub) => {
                    metadata.insert("subscription_id".to_string(), sub);
                }
                None => {
                    return DeploymentResult::failed(
                        self.name(),
                        "Cannot determine Azure subscription. Set AZURE_SUBSCRIPTION_ID \
                         env var or run 'az account set --subscription <id>'.",
                        metadata,
                    )
                }
            }
        }
        if metadata.get("resource_group").map(String::is_empty).unwrap_or(true) {
            match resolve_resource_group().await {
                Some(rg) => {
                    metadata.insert("resource_group".to_string(), rg);
                }
                None => {
                    return DeploymentResult::failed(
                        self.name(),
                        "Cannot determine Azure resource group. Set AZURE_RESOURCE_GROUP \
                         env var or run 'az config set defaults.group=<name>'.",
                        metadata,
                    )
                }
            }
        }

        let token = match access_token().await {
            Ok(t) => t,
            Err(e) => return DeploymentResult::failed(self.name(), e.to_string(), metadata),
        };

        let subscription = metadata["subscription_id"].clone();
        let resource_group = metadata["resource_group"].clone();
        let region = metadata["region"].clone();
        let service_name = metadata["service_name"].clone();
        let gpu_profile = metadata["gpu_profile"].clone();

        // 1. Reuse an environment with the right GPU profile, else create one.
        let env_name = match self
            .find_existing_environment(&token, &subscription, &resource_group, &gpu_profile, &region)
            .await
        {
            Some(existing) => {
                info!("reusing environment: {existing}");
                existing
            }
            None => {
                let env_name = metadata["env_name"].clone();
                info!(
                    "creating Container Apps environment: {env_name} in {region} \
                     (this takes 30+ minutes)"
                );
                // All GPU profiles go in up front; Azure cannot add profiles to
                // an existing environment.
                let mut profiles = vec![json!({
                    "workloadProfileType": "Consumption",
                    "name": "Consumption",
                })];
                for (profile, _, _) in GPU_PROFILE_RESOURCES {
                    profiles.push(json!({
                        "workloadProfileType": profile,
                        "name": gpu_workload_profile_name(profile),
                    }));
                }
                let body = json!({
                    "location": region,
                    "properties": { "workloadProfiles": profiles },
                });
                let url = self.env_url(&subscription, &resource_group, &env_name);
                let created = self.put_and_wait(&token, &url, &body, 200).await;
                if let Err(e) = created {
                    warn!("failed to create managed environment: {e}");
                    return DeploymentResult::failed(
                        self.name(),
                        format!("Environment creation failed: {e}"),
                        metadata,
                    );
                }
                env_name
            }
        };
        metadata.insert("env_name".to_string(), env_name.clone());

        // 2. Create the Container App inside it.
        info!("creating Container App: {service_name}");
        let container_args: Vec<String> =
            serde_json::from_str(&metadata["container_args"]).unwrap_or_default();
        let port: u16 = metadata["container_port"].parse().unwrap_or(VLLM_PORT);
        let env_vars: Vec<Value> = plan
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        let app_body = json!({
            "location": region,
            "properties": {
                "managedEnvironmentId": format!(
                    "/subscriptions/{subscription}/resourceGroups/{resource_group}\
                     /providers/Microsoft.App/managedEnvironments/{env_name}"
                ),
                "workloadProfileName": gpu_workload_profile_name(&gpu_profile),
                "configuration": {
                    "ingress": {
                        "external": true,
                        "targetPort": port,
                        "transport": "http",
                    },
                    "activeRevisionsMode": "Single",
                },
                "template": {
                    "containers": [{
                        "name": "vllm",
                        "image": metadata["image"],
                        "args": container_args,
                        "env": env_vars,
                        "resources": {
                            "cpu": metadata["cpu"].parse::<f64>().unwrap_or(8.0),
                            "memory": metadata["memory"],
                        },
                        "probes": [{
                            "type": "Startup",
                            "tcpSocket": { "port": port },
                            "initialDelaySeconds": 30,
                            "periodSeconds": 10,
                            "failureThreshold": 30,
                            "timeoutSeconds": 5,
                        }],
                    }],
                    "scale": {
                        "minReplicas": metadata["min_replicas"].parse::<u32>().unwrap_or(0),
                        "maxReplicas": metadata["max_replicas"].parse::<u32>().unwrap_or(3),
                        "rules": [{
                            "name": "http-concurrency",
                            "http": {
                                "metadata": { "concurrentRequests": metadata["concurrency"] },
                            },
                        }],
                    },
                },
            },
        });

        let app_url = self.app_url(&subscription, &resource_group, &service_name);
        let app = match self.put_and_wait(&token, &app_url, &app_body, 120).await {
            Ok(app) => app,
            Err(e) => {
                warn!("failed to create container app: {e}");
                return DeploymentResult::failed(
                    self.name(),
                    format!("Container app creation failed: {e}"),
                    metadata,
                );
            }
        };

        let fqdn = app
            .pointer("/properties/configuration/ingress/fqdn")
            .and_then(Value::as_str);
        let Some(fqdn) = fqdn else {
            return DeploymentResult::failed(
                self.name(),
                "Container app created but has no ingress FQDN",
                metadata,
            );
        };
        let endpoint_url = format!("https://{fqdn}");

        if metadata.get("public_access").map(String::as_str) != Some("true") {
            warn!(
                "Azure Container Apps endpoints are publicly accessible by default. \
                 Use Azure VNet integration for private access."
            );
        }

        info!("Container App {service_name} deployed at {endpoint_url}");
        DeploymentResult::ok(
            self.name(),
            endpoint_url.clone(),
            format!("{endpoint_url}/health"),
            metadata,
        )
    }

    async fn destroy(&self, result: &DeploymentResult) {
        let service_name = result.metadata.get("service_name").cloned();
        let resource_group = result
            .metadata
            .get("resource_group")
            .cloned()
            .or_else(|| std::env::var("AZURE_RESOURCE_GROUP").ok());
        let subscription = result
            .metadata
            .get("subscription_id")
            .cloned()
            .or_else(|| std::env::var("AZURE_SUBSCRIPTION_ID").ok());
        let (Some(service_name), Some(resource_group), Some(subscription)) =
            (service_name, resource_group, subscription)
        else {
            warn!("missing metadata for Azure destroy: {:?}", result.metadata);
            return;
        };

        let token = match access_token().await {
            Ok(t) => t,
            Err(e) => {
                warn!("cannot destroy Azure container app: {e}");
                return;
            }
        };

        info!("deleting Container App {service_name}");
        let url = self.app_url(&subscription, &resource_group, &service_name);
        let deleted = http_client()
            .delete(&url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&token)
            .send()
            .await;
        match deleted {
            Ok(response) if response.status().is_success() || response.status().as_u16() == 404 => {}
            Ok(response) => warn!("failed to delete container app {service_name}: {}", response.status()),
            Err(e) => warn!("failed to delete container app {service_name}: {e}"),
        }
    }

    async fn status(&self, service_name: &str) -> Value {
        let app_name = format!("{service_name}-serverless");
        let Some(subscription) = resolve_subscription_id().await else {
            return json!({ "provider": self.name(), "status": "unknown", "error": "no subscription" });
        };
        let Some(resource_group) = resolve_resource_group().await else {
            return json!({ "provider": self.name(), "status": "unknown", "error": "no resource group" });
        };
        let token = match access_token().await {
            Ok(t) => t,
            Err(e) => {
                return json!({ "provider": self.name(), "status": "unknown", "error": e.to_string() })
            }
        };

        let url = self.app_url(&subscription, &resource_group, &app_name);
        let response = http_client()
            .get(&url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&token)
            .send()
            .await;
        match response {
            Ok(r) if r.status().as_u16() == 404 => json!({
                "provider": self.name(),
                "service_name": app_name,
                "status": "not found",
            }),
            Ok(r) => match r.error_for_status() {
                Ok(r) => {
                    let app: Value = r.json().await.unwrap_or(json!({}));
                    let fqdn = app
                        .pointer("/properties/configuration/ingress/fqdn")
                        .and_then(Value::as_str);
                    json!({
                        "provider": self.name(),
                        "service_name": app_name,
                        "status": "running",
                        "provisioning_state": app
                            .pointer("/properties/provisioningState")
                            .cloned()
                            .unwrap_or(Value::Null),
                        "uri": fqdn.map(|f| format!("https://{f}")),
                    })
                }
                Err(e) => json!({
                    "provider": self.name(),
                    "service_name": app_name,
                    "status": "unknown",
                    "error": e.to_string(),
                }),
            },
            Err(e) => json!({
                "provider": self.name(),
                "service_name": app_name,
                "status": "unknown",
                "error": e.to_string(),
            }),
        }
    }
}

impl AzureProvider {
    fn env_url(&self, subscription: &str, resource_group: &str, env_name: &str) -> String {
        format!(
            "{ARM_BASE}/subscriptions/{subscription}/resourceGroups/{resource_group}\
             /providers/Microsoft.App/managedEnvironments/{env_name}"
        )
    }

    fn app_url(&self, subscription: &str, resource_group: &str, app_name: &str) -> String {
        format!(
            "{ARM_BASE}/subscriptions/{subscription}/resourceGroups/{resource_group}\
             /providers/Microsoft.App/containerApps/{app_name}"
        )
    }

    async fn check_resource_provider(&self, namespace: &str) -> PreflightCheck {
        let output = az(
            &["provider", "show", "--namespace", namespace, "--query", "registrationState", "-o", "tsv"],
            Duration::from_secs(15),
        )
        .await;
        match output {
            Ok(output) if output.status.success() => {
                let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if state == "Registered" {
                    PreflightCheck::pass("resource_provider", format!("{namespace} is registered"))
                } else {
                    PreflightCheck::fail(
                        "resource_provider",
                        format!("{namespace} registration state: {state}"),
                    )
                    .with_fix(format!("az provider register --namespace {namespace}"))
                }
            }
            _ => PreflightCheck::fail(
                "resource_provider",
                format!("could not check {namespace} registration"),
            )
            .with_fix(format!("az provider register --namespace {namespace}")),
        }
    }

    /// Find an existing ManagedEnvironment carrying the GPU workload profile.
    ///
    /// `AZURE_ENVIRONMENT` overrides discovery; otherwise environments in the
    /// resource group are listed and filtered by region and profile.
    async fn find_existing_environment(
        &self,
        token: &str,
        subscription: &str,
        resource_group: &str,
        gpu_profile: &str,
        region: &str,
    ) -> Option<String> {
        if let Ok(explicit) = std::env::var("AZURE_ENVIRONMENT") {
            if !explicit.is_empty() {
                info!("using explicit environment from AZURE_ENVIRONMENT: {explicit}");
                return Some(explicit);
            }
        }

        let url = format!(
            "{ARM_BASE}/subscriptions/{subscription}/resourceGroups/{resource_group}\
             /providers/Microsoft.App/managedEnvironments"
        );
        let listing: Value = http_client()
            .get(&url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(token)
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()?;

        for env in listing.get("value")?.as_array()? {
            let location = env
                .get("location")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .replace(' ', "")
                .to_lowercase();
            if !location.is_empty() && location != region.to_lowercase() {
                continue;
            }
            let profiles = env
                .pointer("/properties/workloadProfiles")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let matches = profiles.iter().any(|wp| {
                wp.get("workloadProfileType").and_then(Value::as_str) == Some(gpu_profile)
            });
            if matches {
                let name = env.get("name").and_then(Value::as_str)?.to_string();
                info!("found existing environment with {gpu_profile} profile: {name}");
                return Some(name);
            }
        }
        None
    }

    /// PUT an ARM resource and poll until provisioning settles.
    async fn put_and_wait(
        &self,
        token: &str,
        url: &str,
        body: &Value,
        max_polls: u32,
    ) -> Result<Value> {
        http_client()
            .put(url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(token)
            .json(body)
            .send()
            .await?
            .error_for_status()?;

        for _ in 0..max_polls {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let resource: Value = http_client()
                .get(url)
                .query(&[("api-version", API_VERSION)])
                .bearer_auth(token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            match resource
                .pointer("/properties/provisioningState")
                .and_then(Value::as_str)
            {
                Some("Succeeded") => return Ok(resource),
                Some("Failed") | Some("Canceled") => {
                    return Err(TunaError::DeployFailed(format!(
                        "provisioning ended in {:?}",
                        resource.pointer("/properties/provisioningState")
                    )))
                }
                other => debug!("provisioning state: {other:?}"),
            }
        }
        Err(TunaError::Timeout("ARM resource did not finish provisioning".to_string()))
    }
}

/// Delete the ManagedEnvironment recorded for a deployment. Separate from
/// the regular destroy because it takes 20+ minutes and environments are
/// shared across deploys.
pub async fn destroy_environment(metadata: &HashMap<String, String>) {
    let env_name = metadata.get("env_name").cloned();
    let resource_group = metadata
        .get("resource_group")
        .cloned()
        .or_else(|| std::env::var("AZURE_RESOURCE_GROUP").ok());
    let subscription = metadata
        .get("subscription_id")
        .cloned()
        .or_else(|| std::env::var("AZURE_SUBSCRIPTION_ID").ok());
    let (Some(env_name), Some(resource_group), Some(subscription)) =
        (env_name, resource_group, subscription)
    else {
        warn!("missing metadata for Azure environment destroy");
        return;
    };
    let token = match access_token().await {
        Ok(t) => t,
        Err(e) => {
            warn!("cannot destroy Azure environment: {e}");
            return;
        }
    };
    info!("deleting Container Apps environment {env_name} (this takes 20+ minutes)");
    let url = format!(
        "{ARM_BASE}/subscriptions/{subscription}/resourceGroups/{resource_group}\
         /providers/Microsoft.App/managedEnvironments/{env_name}"
    );
    if let Err(e) = http_client()
        .delete(&url)
        .query(&[("api-version", API_VERSION)])
        .bearer_auth(&token)
        .send()
        .await
    {
        warn!("failed to delete environment {env_name}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeployRequest {
        let mut r = DeployRequest::new("microsoft/phi-4", "T4");
        r.serverless_provider = "azure".to_string();
        r
    }

    #[test]
    fn test_plan_validates_gpu() {
        let provider = AzureProvider;
        let mut r = request();
        r.gpu = "L4".to_string(); // no Azure offering for L4
        assert!(matches!(provider.plan(&r, ""), Err(TunaError::PlanInvalid(_))));
    }

    #[test]
    fn test_plan_rejects_multi_gpu() {
        let provider = AzureProvider;
        let mut r = request();
        r.gpu_count = 2;
        assert!(provider.plan(&r, "").is_err());
    }

    #[test]
    fn test_plan_resources_match_profile() {
        std::env::remove_var("AZURE_REGION");
        let provider = AzureProvider;
        let plan = provider.plan(&request(), "").unwrap();
        assert_eq!(plan.metadata["gpu_profile"], "Consumption-GPU-NC8as-T4");
        assert_eq!(plan.metadata["cpu"], "8");
        assert_eq!(plan.metadata["memory"], "56Gi");
        assert_eq!(plan.metadata["env_name"], format!("{}-env", plan.metadata["service_name"].trim_end_matches("-serverless")));
        assert_eq!(plan.env["HF_HUB_ENABLE_HF_TRANSFER"], "1");
    }

    #[test]
    fn test_workload_profile_name() {
        assert_eq!(gpu_workload_profile_name("Consumption-GPU-NC8as-T4"), "gpu-t4");
        assert_eq!(gpu_workload_profile_name("Consumption-GPU-NC24-A100"), "gpu-a100");
    }
}
