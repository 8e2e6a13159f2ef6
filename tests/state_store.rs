//! State store behavior across processes-worth of operations: environment
//! override, persistence of partial deploys, and the destroy bookkeeping.

use std::collections::HashMap;

use tuna::models::{DeployRequest, DeploymentResult, HybridDeployment};
use tuna::state::{status, StateStore, SPOT_PROVIDER_NAME};

fn hybrid_with_all_components() -> HybridDeployment {
    HybridDeployment {
        serverless: Some(DeploymentResult::ok(
            "runpod",
            "https://api.runpod.ai/v2/ep1/openai/v1",
            "https://api.runpod.ai/v2/ep1/health",
            HashMap::from([
                ("endpoint_id".to_string(), "ep1".to_string()),
                ("template_id".to_string(), "tpl1".to_string()),
            ]),
        )),
        spot: Some(DeploymentResult::ok(
            "skyserve",
            "http://34.1.2.3:30001",
            "http://34.1.2.3:30001/health",
            HashMap::from([("service_name".to_string(), "svc-spot".to_string())]),
        )),
        router: Some(DeploymentResult::ok(
            "router",
            "http://34.1.2.3:8080",
            "http://34.1.2.3:8080/router/health",
            HashMap::from([
                ("cluster_name".to_string(), "sky-serve-controller-ab12".to_string()),
                ("colocated".to_string(), "true".to_string()),
                ("router_port".to_string(), "8080".to_string()),
            ]),
        )),
        router_url: Some("http://34.1.2.3:8080".to_string()),
    }
}

#[tokio::test]
async fn test_full_round_trip_preserves_all_three_metadata_maps() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::at(dir.path().join("deployments.db"));

    let mut request = DeployRequest::new("meta-llama/Llama-3.1-8B", "A100_80GB");
    request.serverless_provider = "runpod".to_string();
    request.gpu_count = 2;
    request.region = Some("us-east-1".to_string());

    store.save(&request, &hybrid_with_all_components()).await.unwrap();
    let record = store.load(&request.service_name).await.unwrap().unwrap();

    assert_eq!(record.model_name, request.model_name);
    assert_eq!(record.gpu, "A100_80GB");
    assert_eq!(record.gpu_count, 2);
    assert_eq!(record.region.as_deref(), Some("us-east-1"));
    assert_eq!(record.serverless_metadata["endpoint_id"], "ep1");
    assert_eq!(record.serverless_metadata["template_id"], "tpl1");
    assert_eq!(record.spot_metadata["service_name"], "svc-spot");
    assert_eq!(record.router_metadata["colocated"], "true");
    assert_eq!(record.router_url.as_deref(), Some("http://34.1.2.3:8080"));
    assert!(!record.is_serverless_only());

    // The serialized request survives verbatim.
    let parsed: DeployRequest = serde_json::from_str(&record.request_json).unwrap();
    assert_eq!(parsed.service_name, request.service_name);
    assert_eq!(parsed.gpu_count, 2);
}

#[tokio::test]
async fn test_interrupted_deploy_still_destroyable() {
    // A deploy interrupted before any result arrived persists provider
    // names from the request alone.
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::at(dir.path().join("deployments.db"));

    let mut request = DeployRequest::new("m", "L4");
    request.serverless_provider = "cloudrun".to_string();
    store.save(&request, &HybridDeployment::default()).await.unwrap();

    let record = store.load(&request.service_name).await.unwrap().unwrap();
    assert_eq!(record.serverless_provider_name.as_deref(), Some("cloudrun"));
    assert_eq!(record.spot_provider_name.as_deref(), Some(SPOT_PROVIDER_NAME));
    assert_eq!(record.status, status::ACTIVE);
}

#[tokio::test]
async fn test_destroyed_records_are_kept_not_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::at(dir.path().join("deployments.db"));

    let request = DeployRequest::new("m", "L4");
    store.save(&request, &HybridDeployment::default()).await.unwrap();
    store
        .update_status(&request.service_name, status::DESTROYED)
        .await
        .unwrap();

    assert!(store.list(Some(status::ACTIVE)).await.unwrap().is_empty());
    let all = store.list(None).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, status::DESTROYED);
}

#[tokio::test]
async fn test_state_dir_env_override() {
    // With TUNA_STATE_DIR set, from_env() lands in that directory; with it
    // unset, the same service name resolves nowhere.
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("TUNA_STATE_DIR", dir.path());

    let store = StateStore::from_env();
    assert!(store.db_path().starts_with(dir.path()));

    let request = DeployRequest::new("m", "L4");
    store.save(&request, &HybridDeployment::default()).await.unwrap();
    assert!(store.load(&request.service_name).await.unwrap().is_some());

    let other_dir = tempfile::tempdir().unwrap();
    std::env::set_var("TUNA_STATE_DIR", other_dir.path());
    let other_store = StateStore::from_env();
    assert!(other_store.load(&request.service_name).await.unwrap().is_none());

    std::env::remove_var("TUNA_STATE_DIR");
}

#[tokio::test]
async fn test_concurrent_readers_during_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::at(dir.path().join("deployments.db"));

    let request = DeployRequest::new("m", "L4");
    store.save(&request, &HybridDeployment::default()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u32 {
        let store = store.clone();
        let name = request.service_name.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let record = store.load(&name).await.unwrap();
                assert!(record.is_some());
            } else {
                let fresh = DeployRequest::new("m2", "L4");
                store.save(&fresh, &HybridDeployment::default()).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(store.list(None).await.unwrap().len() >= 5);
}
