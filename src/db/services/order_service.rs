use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};

use crate::db::entities::{order, order_line_item};
use crate::db::enums::{OrderStatus, PaymentStatus};

/// Creates an order with its line items. Used by checkout tooling and tests;
/// `items` is a list of `(plan_id, quantity)`.
pub async fn create_order(
    db: &DatabaseConnection,
    customer_id: i32,
    payment_status: PaymentStatus,
    items: &[(i32, i32)],
) -> Result<(order::Model, Vec<order_line_item::Model>), DbErr> {
    let now = Utc::now();
    let txn = db.begin().await?;

    let new_order = order::ActiveModel {
        customer_id: Set(customer_id),
        payment_status: Set(payment_status),
        status: Set(OrderStatus::Pending),
        created_at: Set(now),
        updated_at: Set(now),
        provisioned_at: Set(None),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let mut line_items = Vec::with_capacity(items.len());
    for &(plan_id, quantity) in items {
        let item = order_line_item::ActiveModel {
            order_id: Set(new_order.id),
            plan_id: Set(plan_id),
            quantity: Set(quantity),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        line_items.push(item);
    }

    txn.commit().await?;
    Ok((new_order, line_items))
}

pub async fn get_order<C: ConnectionTrait>(db: &C, order_id: i32) -> Result<Option<order::Model>, DbErr> {
    order::Entity::find_by_id(order_id).one(db).await
}

/// Line items in the order they were purchased.
pub async fn get_line_items<C: ConnectionTrait>(
    db: &C,
    order_id: i32,
) -> Result<Vec<order_line_item::Model>, DbErr> {
    order_line_item::Entity::find()
        .filter(order_line_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_line_item::Column::Id)
        .all(db)
        .await
}

pub async fn update_order_status(
    db: &DatabaseConnection,
    existing: order::Model,
    status: OrderStatus,
) -> Result<order::Model, DbErr> {
    if existing.status == status {
        return Ok(existing);
    }
    let now = Utc::now();
    let mut active: order::ActiveModel = existing.into();
    active.status = Set(status);
    active.updated_at = Set(now);
    if status.is_terminal() {
        active.provisioned_at = Set(Some(now));
    }
    active.update(db).await
}
