//! Provisioning records and the credentials they produce.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, SqlErr, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use crate::db::entities::{provisioning_record, server_client, server_inbound};
use crate::db::enums::ProvisionStatus;
use crate::panel::{ClientSpec, IssuedCredential};

/// Identity of one provisioning unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub order_id: i32,
    pub line_item_id: i32,
    pub unit_index: i32,
}

impl UnitKey {
    fn matches(&self, record: &provisioning_record::Model) -> bool {
        record.order_id == self.order_id
            && record.line_item_id == self.line_item_id
            && record.unit_index == self.unit_index
    }
}

pub async fn get_records_for_order(
    db: &DatabaseConnection,
    order_id: i32,
) -> Result<Vec<provisioning_record::Model>, DbErr> {
    provisioning_record::Entity::find()
        .filter(provisioning_record::Column::OrderId.eq(order_id))
        .order_by_asc(provisioning_record::Column::LineItemId)
        .order_by_asc(provisioning_record::Column::UnitIndex)
        .all(db)
        .await
}

async fn find_record(
    db: &DatabaseConnection,
    key: UnitKey,
) -> Result<Option<provisioning_record::Model>, DbErr> {
    provisioning_record::Entity::find()
        .filter(provisioning_record::Column::OrderId.eq(key.order_id))
        .filter(provisioning_record::Column::LineItemId.eq(key.line_item_id))
        .filter(provisioning_record::Column::UnitIndex.eq(key.unit_index))
        .one(db)
        .await
}

async fn insert_pending(
    db: &DatabaseConnection,
    key: UnitKey,
) -> Result<provisioning_record::Model, DbErr> {
    let now = Utc::now();
    let pending = provisioning_record::ActiveModel {
        order_id: Set(key.order_id),
        line_item_id: Set(key.line_item_id),
        unit_index: Set(key.unit_index),
        provision_status: Set(ProvisionStatus::Pending),
        target_inbound_id: Set(None),
        dedicated_inbound_id: Set(None),
        client_uuid: Set(None),
        client_email: Set(None),
        server_client_id: Set(None),
        attempts: Set(0),
        last_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        started_at: Set(None),
        finished_at: Set(None),
        ..Default::default()
    };

    match pending.insert(db).await {
        Ok(record) => Ok(record),
        // Another worker created the same unit first; the unique index wins.
        Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            debug!(?key, "Provisioning record already created concurrently.");
            find_record(db, key)
                .await?
                .ok_or_else(|| DbErr::RecordNotFound(format!("provisioning record {key:?}")))
        }
        Err(err) => Err(err),
    }
}

/// Returns one record per key, in key order, creating pending records for
/// units seen for the first time.
pub async fn ensure_unit_records(
    db: &DatabaseConnection,
    order_id: i32,
    keys: &[UnitKey],
) -> Result<Vec<provisioning_record::Model>, DbErr> {
    let mut existing = get_records_for_order(db, order_id).await?;
    let mut records = Vec::with_capacity(keys.len());
    for key in keys {
        match existing.iter().position(|r| key.matches(r)) {
            Some(pos) => records.push(existing.swap_remove(pos)),
            None => records.push(insert_pending(db, *key).await?),
        }
    }
    Ok(records)
}

/// Moves a non-terminal record to `in_progress` and pins the client identity
/// used on the panel. Identity survives crashes so retries reuse it.
pub async fn start_attempt(
    db: &DatabaseConnection,
    record: provisioning_record::Model,
    fresh_uuid: Uuid,
    email_for: impl FnOnce(&Uuid) -> String,
) -> Result<provisioning_record::Model, DbErr> {
    let now = Utc::now();
    let needs_identity = record.client_uuid.is_none() || record.client_email.is_none();
    let attempts = record.attempts + 1;
    let started_at = record.started_at.unwrap_or(now);

    let mut active: provisioning_record::ActiveModel = record.into();
    if needs_identity {
        active.client_uuid = Set(Some(fresh_uuid));
        active.client_email = Set(Some(email_for(&fresh_uuid)));
    }
    active.provision_status = Set(ProvisionStatus::InProgress);
    active.attempts = Set(attempts);
    active.started_at = Set(Some(started_at));
    active.updated_at = Set(now);
    active.update(db).await
}

pub async fn set_target_inbound(
    db: &DatabaseConnection,
    record: provisioning_record::Model,
    target_inbound_id: i32,
    dedicated: bool,
) -> Result<provisioning_record::Model, DbErr> {
    let mut active: provisioning_record::ActiveModel = record.into();
    active.target_inbound_id = Set(Some(target_inbound_id));
    if dedicated {
        active.dedicated_inbound_id = Set(Some(target_inbound_id));
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await
}

pub async fn fail_record(
    db: &DatabaseConnection,
    record: provisioning_record::Model,
    error: &str,
) -> Result<provisioning_record::Model, DbErr> {
    let now = Utc::now();
    let mut active: provisioning_record::ActiveModel = record.into();
    active.provision_status = Set(ProvisionStatus::Failed);
    active.last_error = Set(Some(error.to_owned()));
    active.finished_at = Set(Some(now));
    active.updated_at = Set(now);
    active.update(db).await
}

/// Persists the issued credential and completes the record atomically.
pub async fn complete_record(
    db: &DatabaseConnection,
    record: provisioning_record::Model,
    inbound: &server_inbound::Model,
    spec: &ClientSpec,
    credential: &IssuedCredential,
) -> Result<(provisioning_record::Model, server_client::Model), DbErr> {
    let now = Utc::now();
    let txn = db.begin().await?;

    let client = server_client::ActiveModel {
        record_id: Set(record.id),
        order_id: Set(record.order_id),
        line_item_id: Set(record.line_item_id),
        inbound_id: Set(inbound.id),
        server_id: Set(inbound.server_id),
        protocol: Set(credential.protocol.clone()),
        client_uuid: Set(spec.uuid),
        email: Set(spec.email.clone()),
        access_link: Set(credential.access_link.clone()),
        subscription_link: Set(credential.subscription_link.clone()),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let mut active: provisioning_record::ActiveModel = record.into();
    active.provision_status = Set(ProvisionStatus::Completed);
    active.target_inbound_id = Set(Some(inbound.id));
    active.server_client_id = Set(Some(client.id));
    active.last_error = Set(None);
    active.finished_at = Set(Some(now));
    active.updated_at = Set(now);
    let record = active.update(&txn).await?;

    txn.commit().await?;
    Ok((record, client))
}

pub async fn get_clients_for_order(
    db: &DatabaseConnection,
    order_id: i32,
) -> Result<Vec<server_client::Model>, DbErr> {
    server_client::Entity::find()
        .filter(server_client::Column::OrderId.eq(order_id))
        .order_by_asc(server_client::Column::LineItemId)
        .order_by_asc(server_client::Column::Id)
        .all(db)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::PaymentStatus;
    use crate::db::services::order_service;
    use crate::test_support::memory_db;

    fn key(order_id: i32, line_item_id: i32, unit_index: i32) -> UnitKey {
        UnitKey {
            order_id,
            line_item_id,
            unit_index,
        }
    }

    #[tokio::test]
    async fn ensure_unit_records_is_idempotent() {
        let db = memory_db().await;
        let (order, items) = order_service::create_order(&db, 1, PaymentStatus::Paid, &[(1, 2)])
            .await
            .unwrap();
        let keys = [key(order.id, items[0].id, 0), key(order.id, items[0].id, 1)];

        let first = ensure_unit_records(&db, order.id, &keys).await.unwrap();
        let second = ensure_unit_records(&db, order.id, &keys).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(|r| r.id).collect::<Vec<_>>(),
            second.iter().map(|r| r.id).collect::<Vec<_>>()
        );
        assert!(first.iter().all(|r| r.provision_status == ProvisionStatus::Pending));
    }

    #[tokio::test]
    async fn duplicate_unit_insert_hits_unique_index() {
        let db = memory_db().await;
        let (order, items) = order_service::create_order(&db, 1, PaymentStatus::Paid, &[(1, 1)])
            .await
            .unwrap();
        let unit = key(order.id, items[0].id, 0);

        let first = insert_pending(&db, unit).await.unwrap();
        let again = insert_pending(&db, unit).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(get_records_for_order(&db, order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_attempt_keeps_identity_across_retries() {
        let db = memory_db().await;
        let (order, items) = order_service::create_order(&db, 1, PaymentStatus::Paid, &[(1, 1)])
            .await
            .unwrap();
        let record = ensure_unit_records(&db, order.id, &[key(order.id, items[0].id, 0)])
            .await
            .unwrap()
            .remove(0);

        let first_uuid = Uuid::new_v4();
        let started = start_attempt(&db, record, first_uuid, |u| format!("first-{u}"))
            .await
            .unwrap();
        assert_eq!(started.provision_status, ProvisionStatus::InProgress);
        assert_eq!(started.attempts, 1);

        let resumed = start_attempt(&db, started, Uuid::new_v4(), |_| "second".to_string())
            .await
            .unwrap();
        assert_eq!(resumed.attempts, 2);
        assert_eq!(resumed.client_uuid, Some(first_uuid));
        assert_eq!(resumed.client_email, Some(format!("first-{first_uuid}")));
    }

    #[tokio::test]
    async fn fail_record_keeps_error() {
        let db = memory_db().await;
        let (order, items) = order_service::create_order(&db, 1, PaymentStatus::Paid, &[(1, 1)])
            .await
            .unwrap();
        let record = ensure_unit_records(&db, order.id, &[key(order.id, items[0].id, 0)])
            .await
            .unwrap()
            .remove(0);

        let failed = fail_record(&db, record, "No capacity").await.unwrap();
        assert_eq!(failed.provision_status, ProvisionStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("No capacity"));
        assert!(failed.finished_at.is_some());
    }
}
