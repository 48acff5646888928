use crate::db::enums::{OrderStatus, PaymentStatus};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(indexed)]
    pub customer_id: i32,
    pub payment_status: PaymentStatus,
    #[sea_orm(indexed)]
    pub status: OrderStatus,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub provisioned_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line_item::Entity")]
    OrderLineItem,
    #[sea_orm(has_many = "super::provisioning_record::Entity")]
    ProvisioningRecord,
}

impl Related<super::order_line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderLineItem.def()
    }
}

impl Related<super::provisioning_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProvisioningRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
