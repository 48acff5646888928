use axum::{Router, routing::get};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::provisioning::ProvisioningService;
use crate::web::routes::*;
use crate::worker::DeliveryQueue;

pub mod error;
pub mod routes;

pub use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: DatabaseConnection,
    pub provisioning: Arc<ProvisioningService>,
    pub deliveries: DeliveryQueue,
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_axum_router(
    db_pool: DatabaseConnection,
    provisioning: Arc<ProvisioningService>,
    deliveries: DeliveryQueue,
) -> Router {
    let app_state = Arc::new(AppState {
        db_pool,
        provisioning,
        deliveries,
    });

    Router::new()
        .route("/api/health", get(health_check_handler))
        .nest("/api/orders", order_routes())
        .nest("/api/deliveries", delivery_routes())
        .with_state(app_state)
}
