//! Controller discovery and remote router launch.
//!
//! The meta load balancer normally colocates on the scheduler's controller
//! VM: the locally built `tuna-router` binary is copied up with `scp` and
//! started under `setsid` so it outlives the SSH session. After a
//! successful launch a TCP listener is reachable on the controller's
//! public IP at the recorded port until the controller is torn down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::models::{DeployRequest, DeploymentResult};
use crate::providers::run_with_timeout;
use crate::spot::sky::SkyApi;
use crate::spot::{CONTROLLER_PREFIX, LOCAL_SPOT_PORT};
use crate::template;

const ROUTER_VM_TEMPLATE: &str = include_str!("../templates/router_vm.yaml.tpl");
pub const ROUTER_PORT: u16 = 8080;

const ROUTER_PROVIDER: &str = "router";

/// Find the controller cluster name from the scheduler's cluster list.
pub async fn find_controller_cluster(sky: &dyn SkyApi) -> Option<String> {
    match sky.cluster_status(None).await {
        Ok(clusters) => clusters
            .into_iter()
            .find(|c| c.name.contains(CONTROLLER_PREFIX))
            .map(|c| c.name),
        Err(e) => {
            debug!("failed to find controller cluster: {e}");
            None
        }
    }
}

/// Head-node IP of a cluster.
pub async fn get_cluster_ip(sky: &dyn SkyApi, cluster_name: &str) -> Option<String> {
    match sky.cluster_status(Some(&[cluster_name.to_string()])).await {
        Ok(clusters) => clusters.into_iter().find_map(|c| c.head_ip),
        Err(e) => {
            debug!("failed to get IP for {cluster_name}: {e}");
            None
        }
    }
}

fn ssh_key_path() -> PathBuf {
    if let Ok(key) = std::env::var("TUNA_SSH_KEY") {
        if !key.is_empty() {
            return PathBuf::from(key);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sky")
        .join("ssh")
        .join("sky-key")
}

fn ssh_user() -> String {
    std::env::var("TUNA_SSH_USER").unwrap_or_else(|_| "ubuntu".to_string())
}

/// Where the router binary lives locally: `TUNA_ROUTER_BIN`, else the
/// `tuna-router` sibling of the running executable.
fn router_binary_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TUNA_ROUTER_BIN") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let exe = std::env::current_exe().ok()?;
    let sibling = exe.parent()?.join("tuna-router");
    sibling.exists().then_some(sibling)
}

fn ssh_opts(key: &std::path::Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        key.display().to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
    ]
}

async fn ssh_exec(target: &str, command: &str, timeout: Duration) -> crate::error::Result<std::process::Output> {
    let key = ssh_key_path();
    let mut args = ssh_opts(&key);
    args.push(target.to_string());
    args.push(command.to_string());
    run_with_timeout(Command::new("ssh").args(&args), timeout).await
}

/// Best-effort host-firewall opening; the scheduler's security groups keep
/// the serve port range open on controllers already.
async fn open_port_on_controller(ssh_target: &str, port: u16) {
    let command = format!("sudo iptables -I INPUT -p tcp --dport {port} -j ACCEPT || true");
    if let Err(e) = ssh_exec(ssh_target, &command, Duration::from_secs(20)).await {
        warn!("failed to open port {port}: {e}");
    }
}

/// Launch the router on the controller VM via scp + ssh + setsid.
pub async fn launch_router_on_controller(
    sky: &dyn SkyApi,
    controller_cluster: &str,
    serverless_url: &str,
    serverless_auth_token: &str,
    router_port: u16,
) -> DeploymentResult {
    let Some(ip) = get_cluster_ip(sky, controller_cluster).await else {
        return DeploymentResult::failed(
            ROUTER_PROVIDER,
            format!("Could not resolve IP for controller {controller_cluster}"),
            HashMap::new(),
        );
    };

    let Some(router_bin) = router_binary_path() else {
        return DeploymentResult::failed(
            ROUTER_PROVIDER,
            "tuna-router binary not found (set TUNA_ROUTER_BIN)",
            HashMap::from([("cluster_name".to_string(), controller_cluster.to_string())]),
        );
    };

    let key = ssh_key_path();
    let ssh_target = format!("{}@{ip}", ssh_user());

    info!("opening port {router_port} on {controller_cluster}");
    open_port_on_controller(&ssh_target, router_port).await;

    info!("copying router binary to controller");
    let mut scp_args = ssh_opts(&key);
    scp_args.push(router_bin.display().to_string());
    scp_args.push(format!("{ssh_target}:/tmp/tuna-router"));
    let scp = run_with_timeout(Command::new("scp").args(&scp_args), Duration::from_secs(60)).await;
    match scp {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            return DeploymentResult::failed(
                ROUTER_PROVIDER,
                format!("SCP failed: {}", String::from_utf8_lossy(&output.stderr)),
                HashMap::from([("cluster_name".to_string(), controller_cluster.to_string())]),
            )
        }
        Err(e) => {
            return DeploymentResult::failed(
                ROUTER_PROVIDER,
                format!("SCP failed: {e}"),
                HashMap::from([("cluster_name".to_string(), controller_cluster.to_string())]),
            )
        }
    }

    // setsid detaches the router into its own session so it survives the
    // SSH connection closing.
    let start_cmd = format!(
        "chmod +x /tmp/tuna-router && \
         SERVERLESS_BASE_URL='{serverless_url}' \
         SERVERLESS_AUTH_TOKEN='{serverless_auth_token}' \
         SKYSERVE_BASE_URL='http://127.0.0.1:{LOCAL_SPOT_PORT}' \
         PORT={router_port} \
         setsid /tmp/tuna-router > /tmp/tuna-router.log 2>&1 < /dev/null &"
    );
    info!("starting router on controller via SSH");
    if let Err(e) = ssh_exec(&ssh_target, &start_cmd, Duration::from_secs(30)).await {
        warn!("SSH start command timed out, router may still be starting: {e}");
    }

    let endpoint = format!("http://{ip}:{router_port}");
    info!("router colocated on controller at {endpoint}");
    DeploymentResult::ok(
        ROUTER_PROVIDER,
        endpoint.clone(),
        format!("{endpoint}/router/health"),
        HashMap::from([
            ("cluster_name".to_string(), controller_cluster.to_string()),
            ("colocated".to_string(), "true".to_string()),
            ("router_port".to_string(), router_port.to_string()),
        ]),
    )
}

/// Kill a colocated router process. The process also dies with the
/// controller VM, so failures here are non-fatal.
pub async fn kill_colocated_router(sky: &dyn SkyApi, controller_cluster: &str) {
    let Some(ip) = get_cluster_ip(sky, controller_cluster).await else {
        return;
    };
    let ssh_target = format!("{}@{ip}", ssh_user());
    info!("killing colocated router on {controller_cluster}");
    if let Err(e) = ssh_exec(&ssh_target, "pkill -f tuna-router || true", Duration::from_secs(15)).await
    {
        debug!("failed to kill colocated router (non-fatal): {e}");
    }
}

/// Launch the router on a dedicated CPU VM.
pub async fn launch_router_vm(sky: &dyn SkyApi, request: &DeployRequest) -> DeploymentResult {
    let cluster_name = format!("{}-router", request.service_name);

    let region_block = match &request.region {
        Some(region) => format!(
            "  any_of:\n    - infra: {}/{region}",
            request.spot_cloud.to_lowercase()
        ),
        None => format!("  cloud: {}", request.spot_cloud.to_lowercase()),
    };
    let router_bin = router_binary_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "tuna-router".to_string());

    let replacements = template::replacements([
        ("service_name", request.service_name.clone()),
        ("serverless_url", String::new()),
        ("spot_url", String::new()),
        ("router_bin_local_path", router_bin),
        ("router_port", ROUTER_PORT.to_string()),
        ("region_block", region_block),
    ]);
    let rendered = template::render(ROUTER_VM_TEMPLATE, &replacements);

    info!("launching router VM: {cluster_name}");
    if let Err(e) = sky.cluster_launch(&rendered, &cluster_name, true).await {
        warn!("router VM launch failed: {e}");
        return DeploymentResult::failed(
            ROUTER_PROVIDER,
            format!("router VM launch failed: {e}"),
            HashMap::from([("cluster_name".to_string(), cluster_name)]),
        );
    }

    let Some(ip) = get_cluster_ip(sky, &cluster_name).await else {
        return DeploymentResult::failed(
            ROUTER_PROVIDER,
            "Launched but could not resolve IP",
            HashMap::from([("cluster_name".to_string(), cluster_name)]),
        );
    };

    let endpoint = format!("http://{ip}:{ROUTER_PORT}");
    info!("router VM ready at {endpoint}");
    DeploymentResult::ok(
        ROUTER_PROVIDER,
        endpoint.clone(),
        format!("{endpoint}/router/health"),
        HashMap::from([("cluster_name".to_string(), cluster_name)]),
    )
}
