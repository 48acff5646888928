use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::db::enums::OrderStatus;
use crate::provisioning::{ClientConfiguration, ProvisioningReport, load_order_summary};
use crate::web::{AppState, error::AppError};

pub fn order_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/{order_id}/provision", post(provision_order))
        .route("/{order_id}/summary", get(get_order_summary))
}

#[derive(Serialize, Debug)]
pub struct OrderSummaryResponse {
    pub order_id: i32,
    pub status: OrderStatus,
    pub is_fully_provisioned: bool,
    pub has_failed_provisions: bool,
    pub client_configurations: Vec<ClientConfiguration>,
}

/// Manual retry from the admin surface; same path as a queue delivery.
async fn provision_order(
    State(app_state): State<Arc<AppState>>,
    Path(order_id): Path<i32>,
) -> Result<Json<ProvisioningReport>, AppError> {
    info!(order_id, "Provisioning requested through the admin API.");
    let report = app_state.provisioning.provision_order(order_id).await?;
    Ok(Json(report))
}

async fn get_order_summary(
    State(app_state): State<Arc<AppState>>,
    Path(order_id): Path<i32>,
) -> Result<Json<OrderSummaryResponse>, AppError> {
    let summary = load_order_summary(&app_state.db_pool, order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Order {order_id} not found")))?;

    Ok(Json(OrderSummaryResponse {
        order_id,
        status: summary.order.status,
        is_fully_provisioned: summary.is_fully_provisioned(),
        has_failed_provisions: summary.has_failed_provisions(),
        client_configurations: summary.client_configurations(),
    }))
}
