//! sea-orm entity for the `deployments` table.

use sea_orm::entity::prelude::*;

/// One persisted deployment, keyed by service name.
///
/// Metadata columns hold JSON-encoded string maps; the read-side
/// [`DeploymentRecord`](super::DeploymentRecord) parses them.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "deployments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub service_name: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub model_name: String,
    pub gpu: String,
    pub gpu_count: i32,
    pub serverless_provider: String,
    pub spot_cloud: String,
    pub region: Option<String>,
    pub request_json: String,
    pub router_endpoint: Option<String>,
    pub router_metadata: Option<String>,
    pub serverless_provider_name: Option<String>,
    pub serverless_endpoint: Option<String>,
    pub serverless_metadata: Option<String>,
    pub spot_provider_name: Option<String>,
    pub spot_endpoint: Option<String>,
    pub spot_metadata: Option<String>,
    pub router_url: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
