//! Scaling policy types and the strict YAML loader.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunaError};

/// Autoscaling knobs for the spot (replica) backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpotScaling {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_qps: u32,
    pub upscale_delay: u32,
    pub downscale_delay: u32,
}

impl Default for SpotScaling {
    fn default() -> Self {
        Self {
            min_replicas: 0,
            max_replicas: 5,
            target_qps: 10,
            upscale_delay: 5,
            downscale_delay: 300,
        }
    }
}

/// Autoscaling knobs for the serverless backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerlessScaling {
    pub concurrency: u32,
    /// Seconds of idleness before the provider scales a worker down.
    pub scaledown_window: u32,
    /// Per-request execution timeout in seconds.
    pub timeout: u32,
    pub workers_min: u32,
    pub workers_max: u32,
    /// Queue-delay scaler threshold (providers that scale on queue depth).
    pub scaler_value: u32,
}

impl Default for ServerlessScaling {
    fn default() -> Self {
        Self {
            concurrency: 32,
            scaledown_window: 60,
            timeout: 600,
            workers_min: 0,
            workers_max: 3,
            scaler_value: 4,
        }
    }
}

/// Combined scaling policy carried by every deploy request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScalingPolicy {
    pub spot: SpotScaling,
    pub serverless: ServerlessScaling,
}

/// Load a scaling policy from a YAML file.
///
/// Unknown sections or keys are rejected so typos are caught early
/// instead of silently falling back to defaults.
pub fn load_scaling_policy(path: &Path) -> Result<ScalingPolicy> {
    let raw = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&raw).map_err(|e| {
        TunaError::Config(format!(
            "invalid scaling policy {}: {e}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let policy = ScalingPolicy::default();
        assert_eq!(policy.spot.min_replicas, 0);
        assert_eq!(policy.spot.downscale_delay, 300);
        assert_eq!(policy.serverless.concurrency, 32);
        assert_eq!(policy.serverless.scaledown_window, 60);
    }

    #[test]
    fn test_load_partial_yaml_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "spot:\n  max_replicas: 9\nserverless:\n  concurrency: 4").unwrap();
        let policy = load_scaling_policy(f.path()).unwrap();
        assert_eq!(policy.spot.max_replicas, 9);
        assert_eq!(policy.spot.min_replicas, 0);
        assert_eq!(policy.serverless.concurrency, 4);
        assert_eq!(policy.serverless.timeout, 600);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "spot:\n  max_replica: 9").unwrap();
        let err = load_scaling_policy(f.path()).unwrap_err();
        assert!(matches!(err, TunaError::Config(_)));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "spotty:\n  max_replicas: 9").unwrap();
        assert!(load_scaling_policy(f.path()).is_err());
    }
}
