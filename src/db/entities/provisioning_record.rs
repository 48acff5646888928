use crate::db::enums::ProvisionStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per provisioning unit. `(order_id, line_item_id, unit_index)` is unique.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "provisioning_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(indexed)]
    pub order_id: i32,
    pub line_item_id: i32,
    pub unit_index: i32,
    #[sea_orm(indexed)]
    pub provision_status: ProvisionStatus,
    pub target_inbound_id: Option<i32>,
    /// Set only when an inbound was created for this unit.
    pub dedicated_inbound_id: Option<i32>,
    pub client_uuid: Option<Uuid>,
    pub client_email: Option<String>,
    pub server_client_id: Option<i32>,
    pub attempts: i32,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub started_at: Option<DateTimeUtc>,
    pub finished_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id",
        on_delete = "Cascade",
        on_update = "Cascade"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
