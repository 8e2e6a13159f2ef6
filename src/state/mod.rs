//! Durable deployment state, backed by a single sqlite file.
//!
//! Every non-deploy command starts here: `destroy`, `status`, and `cost`
//! all resolve their target through the record saved at the end of a
//! deploy — including deploys that were interrupted or partially failed.
//!
//! Each operation opens its own connection, ensures the schema exists,
//! and closes it. Write-ahead logging keeps concurrent readers from
//! blocking on a writer.

mod entity;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Schema,
};

use crate::error::Result;
use crate::models::{DeployRequest, HybridDeployment};

use entity::{ActiveModel, Column, Entity, Model};

pub const SPOT_PROVIDER_NAME: &str = "skyserve";

/// Deployment lifecycle state as persisted.
pub mod status {
    pub const ACTIVE: &str = "active";
    pub const DESTROYED: &str = "destroyed";
    pub const FAILED: &str = "failed";
}

/// Read-side representation of a persisted deployment.
#[derive(Debug, Clone, Default)]
pub struct DeploymentRecord {
    pub service_name: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub model_name: String,
    pub gpu: String,
    pub gpu_count: u32,
    pub serverless_provider: String,
    pub spot_cloud: String,
    pub region: Option<String>,
    pub request_json: String,
    pub router_endpoint: Option<String>,
    pub router_metadata: HashMap<String, String>,
    pub serverless_provider_name: Option<String>,
    pub serverless_endpoint: Option<String>,
    pub serverless_metadata: HashMap<String, String>,
    pub spot_provider_name: Option<String>,
    pub spot_endpoint: Option<String>,
    pub spot_metadata: HashMap<String, String>,
    pub router_url: Option<String>,
}

impl DeploymentRecord {
    /// A record with a serverless provider but no spot and no router was
    /// deployed in serverless-only mode.
    pub fn is_serverless_only(&self) -> bool {
        self.serverless_provider_name.is_some()
            && self.spot_provider_name.is_none()
            && self.router_endpoint.is_none()
    }
}

fn parse_metadata(raw: &Option<String>) -> HashMap<String, String> {
    raw.as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

impl From<Model> for DeploymentRecord {
    fn from(m: Model) -> Self {
        DeploymentRecord {
            router_metadata: parse_metadata(&m.router_metadata),
            serverless_metadata: parse_metadata(&m.serverless_metadata),
            spot_metadata: parse_metadata(&m.spot_metadata),
            service_name: m.service_name,
            status: m.status,
            created_at: m.created_at,
            updated_at: m.updated_at,
            model_name: m.model_name,
            gpu: m.gpu,
            gpu_count: m.gpu_count.max(0) as u32,
            serverless_provider: m.serverless_provider,
            spot_cloud: m.spot_cloud,
            region: m.region,
            request_json: m.request_json,
            router_endpoint: m.router_endpoint,
            serverless_provider_name: m.serverless_provider_name,
            serverless_endpoint: m.serverless_endpoint,
            spot_provider_name: m.spot_provider_name,
            spot_endpoint: m.spot_endpoint,
            router_url: m.router_url,
        }
    }
}

/// Handle on the deployment database. Cheap to construct; every operation
/// opens and closes its own connection.
#[derive(Debug, Clone)]
pub struct StateStore {
    db_path: PathBuf,
}

impl StateStore {
    /// Store at an explicit database file path.
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Store at the configured location: `$TUNA_STATE_DIR/deployments.db`
    /// when the variable is set, else `~/.tuna/deployments.db`.
    pub fn from_env() -> Self {
        Self::at(state_dir().join("deployments.db"))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn connect(&self) -> Result<DatabaseConnection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", self.db_path.display());
        let db = Database::connect(url).await?;
        db.execute_unprepared("PRAGMA journal_mode=WAL").await?;

        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        let mut create = schema.create_table_from_entity(Entity);
        create.if_not_exists();
        db.execute(backend.build(&create)).await?;
        Ok(db)
    }

    /// Upsert the record for one deploy invocation.
    ///
    /// Provider names are always taken from the request, so a deploy that
    /// was interrupted before any result arrived still leaves enough
    /// behind for destroy to work. `spot_provider_name` is null for
    /// serverless-only deploys.
    pub async fn save(&self, request: &DeployRequest, result: &HybridDeployment) -> Result<()> {
        let db = self.connect().await?;
        let now = Utc::now().to_rfc3339();
        let request_json = serde_json::to_string(request)?;

        let (router_endpoint, router_metadata) = match &result.router {
            Some(r) => (
                r.endpoint_url.clone(),
                Some(serde_json::to_string(&r.metadata)?),
            ),
            None => (None, None),
        };

        let mut serverless_provider_name = Some(request.serverless_provider.clone());
        let mut serverless_endpoint = None;
        let mut serverless_metadata = None;
        if let Some(s) = &result.serverless {
            serverless_provider_name = Some(s.provider.clone());
            serverless_endpoint = s.endpoint_url.clone();
            serverless_metadata = Some(serde_json::to_string(&s.metadata)?);
        }

        let mut spot_provider_name = if request.serverless_only {
            None
        } else {
            Some(SPOT_PROVIDER_NAME.to_string())
        };
        let mut spot_endpoint = None;
        let mut spot_metadata = None;
        if let Some(s) = &result.spot {
            spot_provider_name = Some(s.provider.clone());
            spot_endpoint = s.endpoint_url.clone();
            spot_metadata = Some(serde_json::to_string(&s.metadata)?);
        }

        let row = ActiveModel {
            service_name: Set(request.service_name.clone()),
            status: Set(status::ACTIVE.to_string()),
            created_at: Set(now.clone()),
            updated_at: Set(now),
            model_name: Set(request.model_name.clone()),
            gpu: Set(request.gpu.clone()),
            gpu_count: Set(request.gpu_count as i32),
            serverless_provider: Set(request.serverless_provider.clone()),
            spot_cloud: Set(request.spot_cloud.clone()),
            region: Set(request.region.clone()),
            request_json: Set(request_json),
            router_endpoint: Set(router_endpoint),
            router_metadata: Set(router_metadata),
            serverless_provider_name: Set(serverless_provider_name),
            serverless_endpoint: Set(serverless_endpoint),
            serverless_metadata: Set(serverless_metadata),
            spot_provider_name: Set(spot_provider_name),
            spot_endpoint: Set(spot_endpoint),
            spot_metadata: Set(spot_metadata),
            router_url: Set(result.router_url.clone()),
        };

        Entity::insert(row)
            .on_conflict(
                OnConflict::column(Column::ServiceName)
                    .update_columns([
                        Column::Status,
                        Column::UpdatedAt,
                        Column::ModelName,
                        Column::Gpu,
                        Column::GpuCount,
                        Column::ServerlessProvider,
                        Column::SpotCloud,
                        Column::Region,
                        Column::RequestJson,
                        Column::RouterEndpoint,
                        Column::RouterMetadata,
                        Column::ServerlessProviderName,
                        Column::ServerlessEndpoint,
                        Column::ServerlessMetadata,
                        Column::SpotProviderName,
                        Column::SpotEndpoint,
                        Column::SpotMetadata,
                        Column::RouterUrl,
                    ])
                    .to_owned(),
            )
            .exec(&db)
            .await?;
        Ok(())
    }

    /// Load one record by service name.
    pub async fn load(&self, service_name: &str) -> Result<Option<DeploymentRecord>> {
        let db = self.connect().await?;
        let found = Entity::find_by_id(service_name).one(&db).await?;
        Ok(found.map(DeploymentRecord::from))
    }

    /// Update a record's status and bump `updated_at`. Silent no-op when
    /// the record does not exist.
    pub async fn update_status(&self, service_name: &str, new_status: &str) -> Result<()> {
        let db = self.connect().await?;
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(new_status))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().to_rfc3339()))
            .filter(Column::ServiceName.eq(service_name))
            .exec(&db)
            .await?;
        Ok(())
    }

    /// List records, optionally filtered by status, newest first.
    pub async fn list(&self, status_filter: Option<&str>) -> Result<Vec<DeploymentRecord>> {
        let db = self.connect().await?;
        let mut select = Entity::find().order_by_desc(Column::CreatedAt);
        if let Some(s) = status_filter {
            select = select.filter(Column::Status.eq(s));
        }
        let rows = select.all(&db).await?;
        Ok(rows.into_iter().map(DeploymentRecord::from).collect())
    }
}

/// State directory: `$TUNA_STATE_DIR` if set, else `~/.tuna`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TUNA_STATE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tuna")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeploymentResult;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::at(dir.path().join("deployments.db"));
        (dir, store)
    }

    fn sample_result() -> HybridDeployment {
        let mut metadata = HashMap::new();
        metadata.insert("endpoint_id".to_string(), "ep-123".to_string());
        HybridDeployment {
            serverless: Some(DeploymentResult::ok(
                "runpod",
                "https://api.runpod.ai/v2/ep-123/openai/v1",
                "https://api.runpod.ai/v2/ep-123/health",
                metadata,
            )),
            spot: None,
            router: None,
            router_url: Some("http://10.0.0.1:8080".to_string()),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (_dir, store) = store();
        let mut request = DeployRequest::new("meta-llama/Llama-3.1-8B", "L4");
        request.serverless_provider = "runpod".to_string();
        let result = sample_result();

        store.save(&request, &result).await.unwrap();
        let record = store.load(&request.service_name).await.unwrap().unwrap();

        assert_eq!(record.service_name, request.service_name);
        assert_eq!(record.status, status::ACTIVE);
        assert_eq!(record.model_name, "meta-llama/Llama-3.1-8B");
        assert_eq!(record.gpu, "L4");
        assert_eq!(record.serverless_provider_name.as_deref(), Some("runpod"));
        assert_eq!(
            record.serverless_metadata.get("endpoint_id").map(String::as_str),
            Some("ep-123")
        );
        assert_eq!(record.spot_provider_name.as_deref(), Some(SPOT_PROVIDER_NAME));
        assert_eq!(record.router_url.as_deref(), Some("http://10.0.0.1:8080"));
        assert!(!record.created_at.is_empty());
    }

    #[tokio::test]
    async fn test_serverless_only_has_no_spot_provider() {
        let (_dir, store) = store();
        let mut request = DeployRequest::new("m", "L4");
        request.serverless_only = true;
        store.save(&request, &HybridDeployment::default()).await.unwrap();
        let record = store.load(&request.service_name).await.unwrap().unwrap();
        assert!(record.spot_provider_name.is_none());
        // Provider name still recorded from the request even with no result.
        assert_eq!(record.serverless_provider_name.as_deref(), Some("modal"));
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.load("tuna-ffffffff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_bumps_updated_at() {
        let (_dir, store) = store();
        let request = DeployRequest::new("m", "L4");
        store.save(&request, &HybridDeployment::default()).await.unwrap();

        let before = store.load(&request.service_name).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .update_status(&request.service_name, status::DESTROYED)
            .await
            .unwrap();
        let after = store.load(&request.service_name).await.unwrap().unwrap();

        assert_eq!(after.status, status::DESTROYED);
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn test_update_status_missing_is_noop() {
        let (_dir, store) = store();
        store.update_status("nope", status::DESTROYED).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let (_dir, store) = store();
        for _ in 0..3 {
            let request = DeployRequest::new("m", "L4");
            store.save(&request, &HybridDeployment::default()).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].created_at >= all[1].created_at);
        assert!(all[1].created_at >= all[2].created_at);

        store.update_status(&all[0].service_name, status::DESTROYED).await.unwrap();
        let active = store.list(Some(status::ACTIVE)).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let (_dir, store) = store();
        let request = DeployRequest::new("m", "L4");
        store.save(&request, &HybridDeployment::default()).await.unwrap();
        store.save(&request, &sample_result()).await.unwrap();
        let record = store.load(&request.service_name).await.unwrap().unwrap();
        assert!(record.serverless_endpoint.is_some());
        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
