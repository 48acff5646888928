use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use serde::Deserialize;
use std::sync::Arc;

use crate::provisioning::ProvisioningReport;
use crate::web::{AppState, error::AppError};
use crate::worker::DeliveryOutcome;

pub fn delivery_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new().route("/", post(receive_delivery))
}

#[derive(Deserialize, Debug)]
pub struct OrderPaidPayload {
    pub order_id: i32,
}

/// Ingress for the queue transport. A 2xx acknowledges the delivery, a 503
/// asks the transport to redeliver.
async fn receive_delivery(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<OrderPaidPayload>,
) -> Result<(StatusCode, Json<ProvisioningReport>), AppError> {
    match app_state.deliveries.deliver(payload.order_id).await? {
        DeliveryOutcome::Ack(report) => Ok((StatusCode::OK, Json(report))),
        DeliveryOutcome::Reject(reason) => Err(AppError::InvalidInput(reason)),
        DeliveryOutcome::Nack(reason) => Err(AppError::Unavailable(reason)),
    }
}
