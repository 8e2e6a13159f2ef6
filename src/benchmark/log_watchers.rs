//! Provider log tailing for cold-start phase extraction.
//!
//! A watcher streams a provider's log CLI in the background and records
//! three wall-clock timestamps: the first line seen (container start), the
//! first model-load line, and the first server-ready line. Only the first
//! match per phase counts.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

static PATTERN_MODEL_LOAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Loading model|Starting to load model|loading model weights").expect("valid regex")
});
static PATTERN_READY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Uvicorn running|Application startup complete|Started server process")
        .expect("valid regex")
});

/// Absolute wall-clock epoch timestamps extracted from provider logs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogPhases {
    pub container_start: Option<f64>,
    pub model_load_start: Option<f64>,
    pub ready: Option<f64>,
}

impl LogPhases {
    pub fn container_boot_seconds(&self) -> Option<f64> {
        Some(self.model_load_start? - self.container_start?)
    }

    pub fn model_load_seconds(&self) -> Option<f64> {
        Some(self.ready? - self.model_load_start?)
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn process_line(phases: &Mutex<LogPhases>, ts: f64, line: &str) {
    let mut phases = phases.lock();
    if phases.container_start.is_none() {
        phases.container_start = Some(ts);
    }
    if phases.model_load_start.is_none() && PATTERN_MODEL_LOAD.is_match(line) {
        phases.model_load_start = Some(ts);
    }
    if phases.ready.is_none() && PATTERN_READY.is_match(line) {
        phases.ready = Some(ts);
    }
}

/// Tails one provider log command in background tasks.
pub struct LogWatcher {
    phases: Arc<Mutex<LogPhases>>,
    child: Option<Child>,
    readers: Vec<tokio::task::JoinHandle<()>>,
}

fn spawn_line_reader<R>(phases: Arc<Mutex<LogPhases>>, stream: R) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            process_line(&phases, now_epoch(), &line);
        }
    })
}

impl LogWatcher {
    fn spawn(mut command: Command) -> Option<Self> {
        command.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("could not start log watcher: {e}");
                return None;
            }
        };

        let phases = Arc::new(Mutex::new(LogPhases::default()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(phases.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(phases.clone(), stderr));
        }

        Some(Self {
            phases,
            child: Some(child),
            readers,
        })
    }

    pub fn phases(&self) -> LogPhases {
        *self.phases.lock()
    }

    /// Kill the tail process and stop reading.
    pub async fn stop(&mut self) -> LogPhases {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        for reader in self.readers.drain(..) {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), reader).await;
        }
        self.phases()
    }
}

/// Build a watcher for providers with a verified log CLI, else `None`.
pub fn create_log_watcher(provider_name: &str, metadata: &HashMap<String, String>) -> Option<LogWatcher> {
    match provider_name {
        "modal" => {
            let app_name = metadata.get("app_name").or_else(|| metadata.get("service_name"))?;
            let mut command = Command::new("modal");
            command.args(["app", "logs", app_name]);
            LogWatcher::spawn(command)
        }
        "cloudrun" => {
            let service = metadata.get("service_name")?;
            let project = metadata.get("project_id")?;
            let region = metadata.get("region")?;
            let filter = format!(
                "resource.type=\"cloud_run_revision\" \
                 resource.labels.service_name=\"{service}\" \
                 resource.labels.location=\"{region}\""
            );
            let mut command = Command::new("gcloud");
            command.args([
                "logging",
                "tail",
                &filter,
                &format!("--project={project}"),
                "--format=value(textPayload)",
            ]);
            LogWatcher::spawn(command)
        }
        "cerebrium" => {
            let service = metadata.get("service_name")?;
            let mut command = Command::new("cerebrium");
            command.args(["logs", service, "--tail"]);
            LogWatcher::spawn(command)
        }
        "baseten" => {
            let model_id = metadata.get("model_id")?;
            let deployment_id = metadata.get("deployment_id")?;
            let mut command = Command::new("truss");
            command.args([
                "model-logs",
                "--model-id",
                model_id,
                "--deployment-id",
                deployment_id,
                "--tail",
            ]);
            LogWatcher::spawn(command)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_extraction_first_match_wins() {
        let phases = Mutex::new(LogPhases::default());
        process_line(&phases, 100.0, "Container booted");
        process_line(&phases, 105.0, "Loading model weights from HF");
        process_line(&phases, 106.0, "Loading model again (should not count)");
        process_line(&phases, 130.0, "INFO: Uvicorn running on http://0.0.0.0:8000");
        process_line(&phases, 131.0, "Application startup complete.");

        let snapshot = *phases.lock();
        assert_eq!(snapshot.container_start, Some(100.0));
        assert_eq!(snapshot.model_load_start, Some(105.0));
        assert_eq!(snapshot.ready, Some(130.0));
        assert_eq!(snapshot.container_boot_seconds(), Some(5.0));
        assert_eq!(snapshot.model_load_seconds(), Some(25.0));
    }

    #[test]
    fn test_phases_incomplete_yield_none() {
        let phases = Mutex::new(LogPhases::default());
        process_line(&phases, 100.0, "some noise");
        let snapshot = *phases.lock();
        assert_eq!(snapshot.container_start, Some(100.0));
        assert!(snapshot.container_boot_seconds().is_none());
        assert!(snapshot.model_load_seconds().is_none());
    }

    #[test]
    fn test_factory_requires_metadata() {
        // Missing project/region — no watcher.
        let metadata = HashMap::from([("service_name".to_string(), "svc".to_string())]);
        assert!(create_log_watcher("cloudrun", &metadata).is_none());
        // Unsupported provider — no watcher.
        assert!(create_log_watcher("runpod", &metadata).is_none());
        // Baseten needs post-deploy IDs.
        assert!(create_log_watcher("baseten", &metadata).is_none());
    }
}
