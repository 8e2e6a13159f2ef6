//! Error handling for the orchestrator
//!
//! A single error type covers every layer: provider control planes,
//! the state store, the router, and the CLI glue.

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, TunaError>;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum TunaError {
    /// Configuration errors (bad scaling policy, missing env, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A preflight check failed before any resource was created
    #[error("Preflight failed: {0}")]
    PreflightFailed(String),

    /// A plan could not be rendered (unknown GPU, unsupported flags)
    #[error("Invalid plan: {0}")]
    PlanInvalid(String),

    /// A backend deploy operation failed
    #[error("Deploy failed: {0}")]
    DeployFailed(String),

    /// Required credentials are missing from the environment
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// A requested record or resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A provider was requested but compiled out
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Database errors from the deployment state store
    #[error("State store error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO errors (temp files, subprocess spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A shelled-out tool exited non-zero
    #[error("Command failed: {0}")]
    Command(String),

    /// Internal errors that should not happen
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TunaError {
    /// Exit code the CLI should use for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            TunaError::Config(_) | TunaError::PlanInvalid(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(TunaError::Config("x".into()).exit_code(), 2);
        assert_eq!(TunaError::NotFound("x".into()).exit_code(), 1);
        assert_eq!(TunaError::DeployFailed("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_display_includes_message() {
        let err = TunaError::PreflightFailed("RUNPOD_API_KEY not set".into());
        assert!(err.to_string().contains("RUNPOD_API_KEY"));
    }
}
