use crate::db::enums::{ServerHealthStatus, ServerStatus};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "servers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub port: i32,
    /// Path prefix the panel is mounted under, e.g. `/secret-panel`.
    pub base_path: String,
    pub panel_username: String,
    /// AES-GCM ciphertext, hex encoded.
    #[serde(skip_serializing)]
    pub panel_password_encrypted: String,
    pub auto_provisioning_enabled: bool,
    pub health_status: ServerHealthStatus,
    pub status: ServerStatus,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::server_inbound::Entity")]
    ServerInbound,
    #[sea_orm(has_many = "super::server_plan::Entity")]
    ServerPlan,
}

impl Related<super::server_inbound::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ServerInbound.def()
    }
}

impl Related<super::server_plan::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ServerPlan.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Root URL of the panel, without a trailing slash.
    pub fn panel_base_url(&self) -> String {
        let path = self.base_path.trim_matches('/');
        if path.is_empty() {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}/{}", self.scheme, self.host, self.port, path)
        }
    }
}
