//! Servers, inbounds and plans as seen by the provisioning engine.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::collections::HashMap;

use crate::crypto::{CredentialCipher, EncryptionError};
use crate::db::entities::{server, server_client, server_inbound, server_plan};
use crate::db::enums::{InboundStatus, PlanMode, ServerHealthStatus, ServerStatus};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub port: i32,
    pub base_path: String,
    pub panel_username: String,
    pub panel_password: String,
}

/// Registers a server; the panel password is stored encrypted.
pub async fn create_server(
    db: &DatabaseConnection,
    cipher: &CredentialCipher,
    input: NewServer,
) -> Result<server::Model, InventoryError> {
    let now = Utc::now();
    let model = server::ActiveModel {
        name: Set(input.name),
        scheme: Set(input.scheme),
        host: Set(input.host),
        port: Set(input.port),
        base_path: Set(input.base_path),
        panel_username: Set(input.panel_username),
        panel_password_encrypted: Set(cipher.encrypt_to_hex(&input.panel_password)?),
        auto_provisioning_enabled: Set(true),
        health_status: Set(ServerHealthStatus::Healthy),
        status: Set(ServerStatus::Up),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    Ok(model.insert(db).await?)
}

pub async fn get_server(db: &DatabaseConnection, server_id: i32) -> Result<Option<server::Model>, DbErr> {
    server::Entity::find_by_id(server_id).one(db).await
}

pub async fn get_plan(db: &DatabaseConnection, plan_id: i32) -> Result<Option<server_plan::Model>, DbErr> {
    server_plan::Entity::find_by_id(plan_id).one(db).await
}

pub async fn create_plan(
    db: &DatabaseConnection,
    server_id: i32,
    name: &str,
    mode: PlanMode,
    preferred_inbound_id: i32,
) -> Result<server_plan::Model, DbErr> {
    server_plan::ActiveModel {
        server_id: Set(server_id),
        name: Set(name.to_owned()),
        mode: Set(mode),
        preferred_inbound_id: Set(preferred_inbound_id),
        traffic_limit_bytes: Set(None),
        duration_days: Set(None),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn get_inbound(
    db: &DatabaseConnection,
    inbound_id: i32,
) -> Result<Option<server_inbound::Model>, DbErr> {
    server_inbound::Entity::find_by_id(inbound_id).one(db).await
}

pub async fn list_inbounds_for_server(
    db: &DatabaseConnection,
    server_id: i32,
) -> Result<Vec<server_inbound::Model>, DbErr> {
    server_inbound::Entity::find()
        .filter(server_inbound::Column::ServerId.eq(server_id))
        .order_by_asc(server_inbound::Column::Id)
        .all(db)
        .await
}

pub async fn find_inbound_by_panel_id(
    db: &DatabaseConnection,
    server_id: i32,
    panel_inbound_id: i64,
) -> Result<Option<server_inbound::Model>, DbErr> {
    server_inbound::Entity::find()
        .filter(server_inbound::Column::ServerId.eq(server_id))
        .filter(server_inbound::Column::PanelInboundId.eq(panel_inbound_id))
        .one(db)
        .await
}

#[derive(Debug, Clone)]
pub struct NewInbound {
    pub server_id: i32,
    pub panel_inbound_id: i64,
    pub remark: String,
    pub protocol: String,
    pub port: i32,
    pub capacity: Option<i32>,
    pub provisioning_enabled: bool,
    pub status: InboundStatus,
    pub is_dedicated: bool,
}

pub async fn create_inbound(
    db: &DatabaseConnection,
    input: NewInbound,
) -> Result<server_inbound::Model, DbErr> {
    let now = Utc::now();
    server_inbound::ActiveModel {
        server_id: Set(input.server_id),
        panel_inbound_id: Set(input.panel_inbound_id),
        remark: Set(input.remark),
        protocol: Set(input.protocol),
        port: Set(input.port),
        capacity: Set(input.capacity),
        provisioning_enabled: Set(input.provisioning_enabled),
        status: Set(input.status),
        is_dedicated: Set(input.is_dedicated),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
}

/// Issued client count per inbound on one server.
pub async fn client_counts_for_server(
    db: &DatabaseConnection,
    server_id: i32,
) -> Result<HashMap<i32, u64>, DbErr> {
    let rows: Vec<(i32, i64)> = server_client::Entity::find()
        .select_only()
        .column(server_client::Column::InboundId)
        .column_as(Expr::col(server_client::Column::Id).count(), "client_count")
        .filter(server_client::Column::ServerId.eq(server_id))
        .group_by(server_client::Column::InboundId)
        .into_tuple()
        .all(db)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(inbound_id, count)| (inbound_id, count.max(0) as u64))
        .collect())
}
