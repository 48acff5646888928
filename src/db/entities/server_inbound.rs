use crate::db::enums::InboundStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "server_inbounds")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(indexed)]
    pub server_id: i32,
    /// Identifier of this inbound inside the remote panel.
    pub panel_inbound_id: i64,
    pub remark: String,
    pub protocol: String,
    pub port: i32,
    /// Maximum number of clients; `None` means unlimited.
    pub capacity: Option<i32>,
    pub provisioning_enabled: bool,
    pub status: InboundStatus,
    pub is_dedicated: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::server::Entity",
        from = "Column::ServerId",
        to = "super::server::Column::Id",
        on_delete = "Cascade",
        on_update = "Cascade"
    )]
    Server,
    #[sea_orm(has_many = "super::server_client::Entity")]
    ServerClient,
}

impl Related<super::server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Server.def()
    }
}

impl Related<super::server_client::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ServerClient.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
