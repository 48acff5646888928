//! Order fulfillment: allocation, panel calls and durable per-unit state.

use sea_orm::DbErr;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::db::enums::OrderStatus;
use crate::panel::PanelError;

pub mod allocator;
pub mod locks;
pub mod service;
pub mod summary;


pub use allocator::{AllocationDecision, decide};
pub use locks::LockRegistry;
pub use service::{DedicatedPortRange, ProvisioningService};
pub use summary::{ClientConfiguration, OrderSummary, load_order_summary, rollup_status};

/// Errors that abort a whole `provision_order` invocation.
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Storage error: {0}")]
    Storage(#[from] DbErr),
    #[error("Order {0} not found")]
    OrderNotFound(i32),
    #[error("Order {0} is not paid")]
    OrderNotPaid(i32),
}

/// Why a single unit failed. Everything except `Storage` is recorded on the
/// unit and does not affect its siblings.
#[derive(Error, Debug)]
pub(crate) enum UnitFailure {
    #[error("No capacity: {0}")]
    NoCapacity(String),
    #[error(transparent)]
    Panel(#[from] PanelError),
    #[error("Misconfigured: {0}")]
    Misconfigured(String),
    #[error("Storage error: {0}")]
    Storage(#[from] DbErr),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineItemResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningReport {
    pub order_id: i32,
    pub status: OrderStatus,
    /// Keyed by line item id.
    pub items: BTreeMap<i32, LineItemResult>,
}

impl ProvisioningReport {
    pub fn all_succeeded(&self) -> bool {
        self.items.values().all(|item| item.success)
    }
}
