//! The spot launcher — deploys vLLM on spot GPUs as a managed service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::catalog::to_skypilot_gpu_name;
use crate::error::Result;
use crate::models::{DeployRequest, DeploymentResult, ProviderPlan};
use crate::providers::InferenceProvider;
use crate::spot::sky::{cluster_status, service_status, SkyApi, SkyCli};
use crate::spot::CONTROLLER_PREFIX;
use crate::template;

const TASK_TEMPLATE: &str = include_str!("../templates/skyserve_vllm.yaml.tpl");

/// Deploy a vLLM server on spot GPUs via the managed-service scheduler.
pub struct SkyLauncher {
    sky: Arc<dyn SkyApi>,
    destroy_attempts: u32,
    destroy_wait: Duration,
}

impl Default for SkyLauncher {
    fn default() -> Self {
        Self::new(Arc::new(SkyCli))
    }
}

impl SkyLauncher {
    pub fn new(sky: Arc<dyn SkyApi>) -> Self {
        Self {
            sky,
            // 12 × 15s ≈ 3 minutes of teardown confirmation.
            destroy_attempts: 12,
            destroy_wait: Duration::from_secs(15),
        }
    }

    /// Shrink the teardown poll loop (tests).
    pub fn with_destroy_poll(mut self, attempts: u32, wait: Duration) -> Self {
        self.destroy_attempts = attempts;
        self.destroy_wait = wait;
        self
    }

    /// Whether the service is fully removed from the control plane.
    ///
    /// Three transient states look like deletion but are not: the
    /// controller still in INIT, the service in SHUTTING_DOWN, and the
    /// scheduler reporting no live services while the controller boots.
    async fn service_is_gone(&self, service_name: &str) -> bool {
        match self.sky.serve_status(Some(service_name)).await {
            Ok(services) => {
                let Some(service) = services.first() else {
                    // Empty means gone — unless the controller is still booting.
                    if self.controller_is_init().await {
                        info!(
                            "controller still INIT, cannot confirm {service_name} is gone, will retry"
                        );
                        return false;
                    }
                    return true;
                };
                if service.status == service_status::SHUTTING_DOWN {
                    info!("service {service_name} still shutting down, waiting...");
                }
                false
            }
            Err(e) => {
                // "No live services" means the controller has no record of the
                // service; equivalent to an empty listing.
                if e.to_string().to_lowercase().contains("no live services") {
                    return !self.controller_is_init().await;
                }
                // Any other error — the controller is probably still starting.
                false
            }
        }
    }

    async fn controller_is_init(&self) -> bool {
        match self.sky.cluster_status(None).await {
            Ok(clusters) => clusters.iter().any(|c| {
                c.name.contains(CONTROLLER_PREFIX) && c.status == cluster_status::INIT
            }),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl InferenceProvider for SkyLauncher {
    fn name(&self) -> &'static str {
        "skyserve"
    }

    fn plan(&self, request: &DeployRequest, vllm_cmd: &str) -> Result<ProviderPlan> {
        let service_name = format!("{}-spot", request.service_name);
        let spot = &request.scaling.spot;

        // Always pin the cloud; pin the region too when the user chose one.
        let cloud = request.spot_cloud.to_lowercase();
        let region_block = match &request.region {
            Some(region) => format!("  any_of:\n    - infra: {cloud}/{region}"),
            None => format!("  cloud: {cloud}"),
        };

        let replacements = template::replacements([
            ("gpu", to_skypilot_gpu_name(&request.gpu)),
            ("gpu_count", request.gpu_count.to_string()),
            ("port", "8001".to_string()),
            ("vllm_cmd", vllm_cmd.to_string()),
            ("vllm_version", request.vllm_version.clone()),
            ("min_replicas", spot.min_replicas.to_string()),
            ("max_replicas", spot.max_replicas.to_string()),
            ("target_qps", spot.target_qps.to_string()),
            ("upscale_delay", spot.upscale_delay.to_string()),
            ("downscale_delay", spot.downscale_delay.to_string()),
            ("region_block", region_block),
        ]);

        Ok(ProviderPlan {
            provider: self.name().to_string(),
            rendered_script: template::render(TASK_TEMPLATE, &replacements),
            env: HashMap::new(),
            metadata: HashMap::from([("service_name".to_string(), service_name)]),
        })
    }

    async fn deploy(&self, plan: &ProviderPlan) -> DeploymentResult {
        let service_name = plan.metadata["service_name"].clone();
        let metadata = HashMap::from([("service_name".to_string(), service_name.clone())]);

        info!("launching managed spot service {service_name}");
        match self.sky.serve_up(&plan.rendered_script, &service_name).await {
            Ok(Some(endpoint)) => {
                info!("spot service {service_name} endpoint: {endpoint}");
                DeploymentResult::ok(
                    self.name(),
                    endpoint.clone(),
                    format!("{}/health", endpoint.trim_end_matches('/')),
                    metadata,
                )
            }
            Ok(None) => {
                warn!(
                    "serve up succeeded but endpoint not yet available for {service_name}. \
                     The router will discover it via health checks."
                );
                DeploymentResult::failed(
                    self.name(),
                    "Endpoint not yet available (still provisioning)",
                    metadata,
                )
            }
            Err(e) => {
                warn!("serve up failed: {e}");
                DeploymentResult::failed(self.name(), format!("serve up failed: {e}"), metadata)
            }
        }
    }

    /// Tear down and keep confirming until the control plane really has no
    /// trace of the service.
    async fn destroy(&self, result: &DeploymentResult) {
        let Some(service_name) = result.metadata.get("service_name") else {
            warn!("no service_name in metadata, cannot destroy");
            return;
        };

        info!("tearing down spot service {service_name}");
        for attempt in 1..=self.destroy_attempts {
            if let Err(e) = self.sky.serve_down(service_name).await {
                warn!("serve down failed: {e}");
            }

            if self.service_is_gone(service_name).await {
                return;
            }

            warn!(
                "service {service_name} still exists after serve down \
                 (attempt {attempt}/{}, controller may still be starting), retrying...",
                self.destroy_attempts
            );
            tokio::time::sleep(self.destroy_wait).await;
        }
        warn!("could not confirm deletion of {service_name} after retries");
    }

    async fn status(&self, service_name: &str) -> Value {
        let spot_service = format!("{service_name}-spot");
        match self.sky.serve_status(Some(&spot_service)).await {
            Ok(services) => match services.first() {
                Some(service) => json!({
                    "provider": self.name(),
                    "service_name": spot_service,
                    "status": service.status,
                    "endpoint": service.endpoint,
                }),
                None => json!({
                    "provider": self.name(),
                    "service_name": spot_service,
                    "status": "NOT_FOUND",
                }),
            },
            Err(e) => json!({
                "provider": self.name(),
                "service_name": spot_service,
                "error": e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunaError;
    use crate::spot::sky::{ClusterInfo, ServeService};
    use parking_lot::Mutex;

    /// Scripted fake: pops one serve_status response per call and records
    /// every serve_down.
    #[derive(Default)]
    struct FakeSky {
        statuses: Mutex<Vec<Result<Vec<ServeService>>>>,
        clusters: Mutex<Vec<ClusterInfo>>,
        downs: Mutex<u32>,
    }

    #[async_trait]
    impl SkyApi for FakeSky {
        async fn serve_up(&self, _yaml: &str, name: &str) -> Result<Option<String>> {
            assert!(name.ends_with("-spot"));
            Ok(Some("http://1.2.3.4:30001".to_string()))
        }

        async fn serve_down(&self, _name: &str) -> Result<()> {
            *self.downs.lock() += 1;
            Ok(())
        }

        async fn serve_status(&self, _name: Option<&str>) -> Result<Vec<ServeService>> {
            let mut statuses = self.statuses.lock();
            if statuses.is_empty() {
                Ok(Vec::new())
            } else {
                statuses.remove(0)
            }
        }

        async fn cluster_launch(&self, _yaml: &str, _name: &str, _down: bool) -> Result<()> {
            Ok(())
        }

        async fn cluster_status(&self, _names: Option<&[String]>) -> Result<Vec<ClusterInfo>> {
            Ok(self.clusters.lock().clone())
        }

        async fn cluster_down(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn launcher(fake: Arc<FakeSky>) -> SkyLauncher {
        SkyLauncher::new(fake).with_destroy_poll(3, Duration::from_millis(1))
    }

    fn ready(name: &str) -> ServeService {
        ServeService {
            name: name.to_string(),
            status: service_status::READY.to_string(),
            endpoint: Some("http://1.2.3.4:30001".to_string()),
        }
    }

    fn result_with(service_name: &str) -> DeploymentResult {
        DeploymentResult {
            metadata: HashMap::from([("service_name".to_string(), service_name.to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_renders_policy_and_region() {
        let sky_launcher = SkyLauncher::default();
        let mut request = DeployRequest::new("m", "A100_80GB");
        request.region = Some("us-east-1".to_string());
        let plan = sky_launcher.plan(&request, "vllm serve m --port 8001").unwrap();

        assert!(plan.rendered_script.contains("accelerators: A100-80GB:1"));
        assert!(plan.rendered_script.contains("infra: aws/us-east-1"));
        assert!(plan.rendered_script.contains("max_replicas: 5"));
        assert!(plan.rendered_script.contains("use_spot: true"));
        assert_eq!(
            plan.metadata["service_name"],
            format!("{}-spot", request.service_name)
        );

        request.region = None;
        let plan = sky_launcher.plan(&request, "cmd").unwrap();
        assert!(plan.rendered_script.contains("cloud: aws"));
    }

    #[tokio::test]
    async fn test_destroy_stops_once_gone() {
        let fake = Arc::new(FakeSky::default());
        // First check still SHUTTING_DOWN, then empty (gone).
        *fake.statuses.lock() = vec![
            Ok(vec![ServeService {
                status: service_status::SHUTTING_DOWN.to_string(),
                ..ready("svc-spot")
            }]),
            Ok(Vec::new()),
        ];
        let sky_launcher = launcher(fake.clone());
        sky_launcher.destroy(&result_with("svc-spot")).await;
        assert_eq!(*fake.downs.lock(), 2);
    }

    #[tokio::test]
    async fn test_destroy_waits_for_init_controller() {
        let fake = Arc::new(FakeSky::default());
        // Status is always empty but the controller is INIT, so emptiness
        // cannot be trusted; the loop must exhaust all attempts.
        *fake.clusters.lock() = vec![ClusterInfo {
            name: format!("{CONTROLLER_PREFIX}-abcd"),
            status: cluster_status::INIT.to_string(),
            head_ip: None,
        }];
        let sky_launcher = launcher(fake.clone());
        sky_launcher.destroy(&result_with("svc-spot")).await;
        assert_eq!(*fake.downs.lock(), 3);
    }

    #[tokio::test]
    async fn test_destroy_treats_no_live_services_as_gone() {
        let fake = Arc::new(FakeSky::default());
        *fake.statuses.lock() = vec![Err(TunaError::Command(
            "sky serve failed: No live services to show".to_string(),
        ))];
        let sky_launcher = launcher(fake.clone());
        sky_launcher.destroy(&result_with("svc-spot")).await;
        assert_eq!(*fake.downs.lock(), 1);
    }

    #[tokio::test]
    async fn test_destroy_without_metadata_is_noop() {
        let fake = Arc::new(FakeSky::default());
        let sky_launcher = launcher(fake.clone());
        sky_launcher.destroy(&DeploymentResult::default()).await;
        assert_eq!(*fake.downs.lock(), 0);
    }

    #[tokio::test]
    async fn test_status_maps_states() {
        let fake = Arc::new(FakeSky::default());
        *fake.statuses.lock() = vec![Ok(vec![ready("svc-spot")])];
        let sky_launcher = launcher(fake.clone());

        let status = sky_launcher.status("svc").await;
        assert_eq!(status["status"], "READY");
        assert_eq!(status["service_name"], "svc-spot");

        let status = sky_launcher.status("svc").await;
        assert_eq!(status["status"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_deploy_failure_keeps_metadata() {
        struct FailingSky;
        #[async_trait]
        impl SkyApi for FailingSky {
            async fn serve_up(&self, _y: &str, _n: &str) -> Result<Option<String>> {
                Err(TunaError::Command("sky serve up failed: quota".to_string()))
            }
            async fn serve_down(&self, _n: &str) -> Result<()> {
                Ok(())
            }
            async fn serve_status(&self, _n: Option<&str>) -> Result<Vec<ServeService>> {
                Ok(Vec::new())
            }
            async fn cluster_launch(&self, _y: &str, _n: &str, _d: bool) -> Result<()> {
                Ok(())
            }
            async fn cluster_status(&self, _n: Option<&[String]>) -> Result<Vec<ClusterInfo>> {
                Ok(Vec::new())
            }
            async fn cluster_down(&self, _n: &str) -> Result<()> {
                Ok(())
            }
        }

        let sky_launcher = SkyLauncher::new(Arc::new(FailingSky));
        let request = DeployRequest::new("m", "L4");
        let plan = sky_launcher.plan(&request, "cmd").unwrap();
        let result = sky_launcher.deploy(&plan).await;
        assert!(result.error.as_deref().unwrap().contains("quota"));
        assert_eq!(result.metadata["service_name"], plan.metadata["service_name"]);
    }
}
