use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A credential issued by a panel. Exists only after the panel confirmed it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "server_clients")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub record_id: i32,
    #[sea_orm(indexed)]
    pub order_id: i32,
    pub line_item_id: i32,
    #[sea_orm(indexed)]
    pub inbound_id: i32,
    pub server_id: i32,
    pub protocol: String,
    pub client_uuid: Uuid,
    pub email: String,
    #[sea_orm(column_type = "Text")]
    pub access_link: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub subscription_link: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::server_inbound::Entity",
        from = "Column::InboundId",
        to = "super::server_inbound::Column::Id"
    )]
    ServerInbound,
}

impl Related<super::server_inbound::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ServerInbound.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
