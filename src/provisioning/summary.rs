//! Read-only projections of an order's fulfillment state.

use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;

use crate::db::entities::{order, provisioning_record, server_client};
use crate::db::enums::{OrderStatus, ProvisionStatus};
use crate::db::services::{order_service, record_service};

/// Order status implied by its units. An order with no units is complete.
pub fn rollup_status(statuses: impl IntoIterator<Item = ProvisionStatus>) -> OrderStatus {
    let (mut total, mut completed, mut failed) = (0usize, 0usize, 0usize);
    for status in statuses {
        total += 1;
        match status {
            ProvisionStatus::Completed => completed += 1,
            ProvisionStatus::Failed => failed += 1,
            ProvisionStatus::Pending | ProvisionStatus::InProgress => {}
        }
    }

    if completed == total {
        OrderStatus::Completed
    } else if failed == total {
        OrderStatus::Failed
    } else if completed + failed == total {
        OrderStatus::PartiallyCompleted
    } else {
        OrderStatus::Processing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientConfiguration {
    pub line_item_id: i32,
    pub unit_index: i32,
    pub protocol: String,
    pub email: String,
    pub client_link: String,
    pub subscription_link: Option<String>,
    /// Payloads to render as QR codes, one per importable link.
    pub qr_codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderSummary {
    pub order: order::Model,
    pub records: Vec<provisioning_record::Model>,
    pub clients: Vec<server_client::Model>,
}

impl OrderSummary {
    pub fn is_fully_provisioned(&self) -> bool {
        self.order.status == OrderStatus::Completed
            && self
                .records
                .iter()
                .all(|r| r.provision_status == ProvisionStatus::Completed)
    }

    pub fn has_failed_provisions(&self) -> bool {
        matches!(
            self.order.status,
            OrderStatus::PartiallyCompleted | OrderStatus::Failed
        ) || self
            .records
            .iter()
            .any(|r| r.provision_status == ProvisionStatus::Failed)
    }

    pub fn client_configurations(&self) -> Vec<ClientConfiguration> {
        self.records
            .iter()
            .filter_map(|record| {
                let client_id = record.server_client_id?;
                let client = self.clients.iter().find(|c| c.id == client_id)?;
                let mut qr_codes = vec![client.access_link.clone()];
                qr_codes.extend(client.subscription_link.clone());
                Some(ClientConfiguration {
                    line_item_id: record.line_item_id,
                    unit_index: record.unit_index,
                    protocol: client.protocol.clone(),
                    email: client.email.clone(),
                    client_link: client.access_link.clone(),
                    subscription_link: client.subscription_link.clone(),
                    qr_codes,
                })
            })
            .collect()
    }
}

pub async fn load_order_summary(
    db: &DatabaseConnection,
    order_id: i32,
) -> Result<Option<OrderSummary>, DbErr> {
    let Some(order) = order_service::get_order(db, order_id).await? else {
        return Ok(None);
    };
    let records = record_service::get_records_for_order(db, order_id).await?;
    let clients = record_service::get_clients_for_order(db, order_id).await?;
    Ok(Some(OrderSummary {
        order,
        records,
        clients,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProvisionStatus::*;

    #[test]
    fn rollup_covers_every_mix() {
        assert_eq!(rollup_status(Vec::new()), OrderStatus::Completed);
        assert_eq!(rollup_status([Completed, Completed]), OrderStatus::Completed);
        assert_eq!(rollup_status([Failed, Failed]), OrderStatus::Failed);
        assert_eq!(
            rollup_status([Completed, Failed, Completed]),
            OrderStatus::PartiallyCompleted
        );
        assert_eq!(rollup_status([Completed, InProgress]), OrderStatus::Processing);
        assert_eq!(rollup_status([Pending]), OrderStatus::Processing);
    }
}
