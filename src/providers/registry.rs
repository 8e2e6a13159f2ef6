//! Provider registry — name → implementation lookup.
//!
//! Providers register lazily: `ensure_registered` instantiates the
//! concrete implementation on first use via a static switch over the
//! compiled-in backends. A backend compiled out behind its cargo feature
//! produces a descriptive error instead of a silent fallback.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Result, TunaError};
use crate::providers::InferenceProvider;
use crate::state::DeploymentRecord;

/// Every provider name the crate knows about, compiled in or not.
pub const KNOWN_PROVIDERS: &[&str] = &[
    "modal",
    "runpod",
    "cloudrun",
    "azure",
    "baseten",
    "cerebrium",
    "skyserve",
];

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn InferenceProvider>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a provider instance under a name. Tests use this to install
/// fakes; production code goes through [`ensure_registered`].
pub fn register(name: &str, provider: Arc<dyn InferenceProvider>) {
    REGISTRY.write().insert(name.to_string(), provider);
}

/// Fetch a registered provider by name.
pub fn get_provider(name: &str) -> Result<Arc<dyn InferenceProvider>> {
    REGISTRY.read().get(name).cloned().ok_or_else(|| {
        TunaError::ProviderUnavailable(format!(
            "unknown provider '{name}'; registered: {:?}",
            list_providers()
        ))
    })
}

/// Names of all currently registered providers.
pub fn list_providers() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().keys().cloned().collect();
    names.sort();
    names
}

fn instantiate(name: &str) -> Result<Arc<dyn InferenceProvider>> {
    match name {
        #[cfg(feature = "modal")]
        "modal" => Ok(Arc::new(crate::providers::modal::ModalProvider::default())),
        #[cfg(feature = "runpod")]
        "runpod" => Ok(Arc::new(crate::providers::runpod::RunPodProvider::default())),
        #[cfg(feature = "cloudrun")]
        "cloudrun" => Ok(Arc::new(
            crate::providers::cloudrun::CloudRunProvider::default(),
        )),
        #[cfg(feature = "azure")]
        "azure" => Ok(Arc::new(crate::providers::azure::AzureProvider::default())),
        #[cfg(feature = "baseten")]
        "baseten" => Ok(Arc::new(
            crate::providers::baseten::BasetenProvider::default(),
        )),
        #[cfg(feature = "cerebrium")]
        "cerebrium" => Ok(Arc::new(
            crate::providers::cerebrium::CerebriumProvider::default(),
        )),
        #[cfg(feature = "skyserve")]
        "skyserve" => Ok(Arc::new(crate::spot::SkyLauncher::default())),
        other if KNOWN_PROVIDERS.contains(&other) => Err(TunaError::ProviderUnavailable(format!(
            "provider '{other}' was compiled out; rebuild with `--features {other}`"
        ))),
        other => Err(TunaError::ProviderUnavailable(format!(
            "no such provider '{other}'; known providers: {KNOWN_PROVIDERS:?}"
        ))),
    }
}

/// Idempotently register the named provider, instantiating it on first use.
pub fn ensure_registered(name: &str) -> Result<()> {
    if REGISTRY.read().contains_key(name) {
        return Ok(());
    }
    let provider = instantiate(name)?;
    register(name, provider);
    Ok(())
}

/// Register both providers named in a record before destroy/status touches
/// them.
pub fn ensure_providers_for_record(record: &DeploymentRecord) -> Result<()> {
    if let Some(name) = &record.serverless_provider_name {
        ensure_registered(name)?;
    }
    if let Some(name) = &record.spot_provider_name {
        ensure_registered(name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeployRequest, DeploymentResult, ProviderPlan};
    use async_trait::async_trait;

    struct NullProvider;

    #[async_trait]
    impl InferenceProvider for NullProvider {
        fn name(&self) -> &'static str {
            "null-test"
        }

        fn plan(&self, _request: &DeployRequest, _vllm_cmd: &str) -> crate::error::Result<ProviderPlan> {
            Ok(ProviderPlan::default())
        }

        async fn deploy(&self, _plan: &ProviderPlan) -> DeploymentResult {
            DeploymentResult::default()
        }

        async fn destroy(&self, _result: &DeploymentResult) {}

        async fn status(&self, _service_name: &str) -> serde_json::Value {
            serde_json::json!({})
        }
    }

    #[test]
    fn test_register_and_get() {
        register("null-test", Arc::new(NullProvider));
        let provider = get_provider("null-test").unwrap();
        assert_eq!(provider.name(), "null-test");
        assert!(list_providers().contains(&"null-test".to_string()));
    }

    #[test]
    fn test_unknown_provider_error_names_known_set() {
        let err = get_provider("nope").err().unwrap();
        assert!(err.to_string().contains("nope"));
        let err = ensure_registered("nope").unwrap_err();
        assert!(err.to_string().contains("known providers"));
    }

    #[test]
    fn test_ensure_registered_idempotent() {
        ensure_registered("runpod").unwrap();
        ensure_registered("runpod").unwrap();
        assert!(get_provider("runpod").is_ok());
    }

    #[test]
    fn test_ensure_providers_for_record() {
        let record = DeploymentRecord {
            serverless_provider_name: Some("modal".to_string()),
            spot_provider_name: Some("skyserve".to_string()),
            ..Default::default()
        };
        ensure_providers_for_record(&record).unwrap();
        assert!(get_provider("modal").is_ok());
        assert!(get_provider("skyserve").is_ok());
    }
}
