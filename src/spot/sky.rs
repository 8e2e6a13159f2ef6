//! Thin async wrappers around the workload scheduler's CLI.
//!
//! The scheduler is an opaque external control plane; every call here
//! shells out to `sky`, asks for JSON where the CLI offers it, and stays
//! lenient about fields it does not use. [`SkyApi`] is the seam the spot
//! launcher and the orchestrator depend on, so tests can substitute a
//! recording fake.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, TunaError};
use crate::providers::run_with_timeout;

/// Service states the launcher distinguishes. Everything else is opaque.
pub mod service_status {
    pub const READY: &str = "READY";
    pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";
    pub const NO_REPLICA: &str = "NO_REPLICA";
    pub const FAILED: &str = "FAILED";
    pub const FAILED_CLEANUP: &str = "FAILED_CLEANUP";

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, SHUTTING_DOWN | NO_REPLICA | FAILED | FAILED_CLEANUP)
    }
}

/// Cluster states the orchestrator distinguishes.
pub mod cluster_status {
    pub const INIT: &str = "INIT";
}

/// One service row from `sky serve status`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServeService {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// One cluster row from `sky status`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub head_ip: Option<String>,
}

static ENDPOINT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)endpoint:?\s*(?:https?://)?(\d{1,3}(?:\.\d{1,3}){3}:\d+)")
        .expect("valid regex")
});

/// The scheduler operations the rest of the crate needs.
#[async_trait]
pub trait SkyApi: Send + Sync {
    /// Launch (or update) a managed service from a task YAML. Returns the
    /// service endpoint when the CLI reports one.
    async fn serve_up(&self, task_yaml: &str, service_name: &str) -> Result<Option<String>>;

    async fn serve_down(&self, service_name: &str) -> Result<()>;

    /// Status rows, optionally restricted to one service.
    async fn serve_status(&self, service_name: Option<&str>) -> Result<Vec<ServeService>>;

    /// Launch a plain cluster from a task YAML.
    async fn cluster_launch(&self, task_yaml: &str, cluster_name: &str, down: bool) -> Result<()>;

    async fn cluster_status(&self, cluster_names: Option<&[String]>) -> Result<Vec<ClusterInfo>>;

    async fn cluster_down(&self, cluster_name: &str) -> Result<()>;
}

/// Production implementation shelling out to the `sky` CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkyCli;

impl SkyCli {
    fn write_task(task_yaml: &str) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("tuna_sky_")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(task_yaml.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    async fn run(args: Vec<String>, timeout: Duration) -> Result<std::process::Output> {
        let output = run_with_timeout(Command::new("sky").args(&args), timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(TunaError::Command(format!(
                "sky {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                detail.trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl SkyApi for SkyCli {
    async fn serve_up(&self, task_yaml: &str, service_name: &str) -> Result<Option<String>> {
        let task = Self::write_task(task_yaml)?;
        let output = Self::run(
            vec![
                "serve".into(),
                "up".into(),
                "--yes".into(),
                "--service-name".into(),
                service_name.into(),
                task.path().display().to_string(),
            ],
            Duration::from_secs(900),
        )
        .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(captures) = ENDPOINT_LINE.captures(&stdout) {
            return Ok(Some(format!("http://{}", &captures[1])));
        }

        // The CLI sometimes returns before the endpoint exists; ask once.
        let services = self.serve_status(Some(service_name)).await.unwrap_or_default();
        Ok(services.into_iter().find_map(|s| s.endpoint))
    }

    async fn serve_down(&self, service_name: &str) -> Result<()> {
        Self::run(
            vec!["serve".into(), "down".into(), "--yes".into(), service_name.into()],
            Duration::from_secs(300),
        )
        .await?;
        Ok(())
    }

    async fn serve_status(&self, service_name: Option<&str>) -> Result<Vec<ServeService>> {
        let mut args = vec!["serve".into(), "status".into(), "--format".into(), "json".into()];
        if let Some(name) = service_name {
            args.push(name.into());
        }
        let output = Self::run(args, Duration::from_secs(60)).await?;
        let parsed: Vec<ServeService> = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
            debug!("unparseable sky serve status output: {e}");
            Vec::new()
        });
        Ok(parsed)
    }

    async fn cluster_launch(&self, task_yaml: &str, cluster_name: &str, down: bool) -> Result<()> {
        let task = Self::write_task(task_yaml)?;
        let mut args = vec![
            "launch".into(),
            "--yes".into(),
            "--cluster".into(),
            cluster_name.into(),
        ];
        if down {
            args.push("--down".into());
        }
        args.push(task.path().display().to_string());
        Self::run(args, Duration::from_secs(900)).await?;
        Ok(())
    }

    async fn cluster_status(&self, cluster_names: Option<&[String]>) -> Result<Vec<ClusterInfo>> {
        let mut args = vec!["status".into(), "--format".into(), "json".into()];
        if let Some(names) = cluster_names {
            args.extend(names.iter().cloned());
        }
        let output = Self::run(args, Duration::from_secs(60)).await?;
        let parsed: Vec<ClusterInfo> = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
            debug!("unparseable sky status output: {e}");
            Vec::new()
        });
        Ok(parsed)
    }

    async fn cluster_down(&self, cluster_name: &str) -> Result<()> {
        Self::run(
            vec!["down".into(), "--yes".into(), cluster_name.into()],
            Duration::from_secs(300),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_line_parsing() {
        let out = "Service 'x' started.\nEndpoint: 34.1.2.3:30001\n";
        let captures = ENDPOINT_LINE.captures(out).unwrap();
        assert_eq!(&captures[1], "34.1.2.3:30001");

        let with_scheme = "service endpoint http://10.0.0.9:30001";
        assert_eq!(&ENDPOINT_LINE.captures(with_scheme).unwrap()[1], "10.0.0.9:30001");

        assert!(ENDPOINT_LINE.captures("no endpoint here").is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(service_status::is_terminal(service_status::SHUTTING_DOWN));
        assert!(service_status::is_terminal(service_status::FAILED_CLEANUP));
        assert!(!service_status::is_terminal(service_status::READY));
        assert!(!service_status::is_terminal("STARTING"));
    }

    #[test]
    fn test_serve_service_lenient_parse() {
        let raw = r#"[{"name": "svc-spot", "status": "READY", "endpoint": "http://1.2.3.4:30001", "extra": 1}]"#;
        let services: Vec<ServeService> = serde_json::from_str(raw).unwrap();
        assert_eq!(services[0].name, "svc-spot");
        assert_eq!(services[0].endpoint.as_deref(), Some("http://1.2.3.4:30001"));
    }
}
