//! Adapts at-least-once "order paid" deliveries to `provision_order` calls.

use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::provisioning::{ProvisioningError, ProvisioningReport, ProvisioningService};

/// What the transport should do with a delivery once it was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed; the delivery can be dropped.
    Ack(ProvisioningReport),
    /// Will never succeed as is; drop the delivery without redelivery.
    Reject(String),
    /// Transient failure; the transport should redeliver.
    Nack(String),
}

#[derive(Debug)]
pub struct OrderPaidDelivery {
    pub order_id: i32,
    pub reply: Option<oneshot::Sender<DeliveryOutcome>>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Provisioning worker is not running")]
    Closed,
    #[error("Provisioning worker dropped the delivery")]
    Dropped,
}

/// Sending side handed to ingress adapters.
#[derive(Clone, Debug)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<OrderPaidDelivery>,
}

impl DeliveryQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OrderPaidDelivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a delivery without waiting for it to be processed.
    pub async fn enqueue(&self, order_id: i32) -> Result<(), WorkerError> {
        self.tx
            .send(OrderPaidDelivery {
                order_id,
                reply: None,
            })
            .await
            .map_err(|_| WorkerError::Closed)
    }

    /// Queues a delivery and waits for its outcome.
    pub async fn deliver(&self, order_id: i32) -> Result<DeliveryOutcome, WorkerError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(OrderPaidDelivery {
                order_id,
                reply: Some(reply),
            })
            .await
            .map_err(|_| WorkerError::Closed)?;
        outcome.await.map_err(|_| WorkerError::Dropped)
    }
}

pub async fn handle_delivery(service: &ProvisioningService, order_id: i32) -> DeliveryOutcome {
    match service.provision_order(order_id).await {
        Ok(report) => DeliveryOutcome::Ack(report),
        Err(ProvisioningError::Storage(e)) => {
            error!(order_id, error = %e, "Provisioning aborted by a storage failure; requesting redelivery.");
            DeliveryOutcome::Nack(e.to_string())
        }
        Err(e) => {
            warn!(order_id, error = %e, "Rejecting order paid delivery.");
            DeliveryOutcome::Reject(e.to_string())
        }
    }
}

/// Consumes deliveries, running up to `concurrency` orders at once.
pub struct ProvisioningWorker {
    service: Arc<ProvisioningService>,
    concurrency: usize,
}

impl ProvisioningWorker {
    pub fn new(service: Arc<ProvisioningService>, concurrency: usize) -> Self {
        Self {
            service,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs until every [`DeliveryQueue`] handle is dropped.
    pub async fn run(self, rx: mpsc::Receiver<OrderPaidDelivery>) {
        info!(concurrency = self.concurrency, "Provisioning worker started.");
        let service = &self.service;
        ReceiverStream::new(rx)
            .for_each_concurrent(self.concurrency, |delivery| async move {
                let outcome = handle_delivery(service, delivery.order_id).await;
                service.locks().prune();
                if let Some(reply) = delivery.reply {
                    // The requester may have given up waiting.
                    let _ = reply.send(outcome);
                }
            })
            .await;
        info!("Provisioning worker stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::ConnectionTrait;

    use crate::db::enums::OrderStatus;
    use crate::test_support::{AcceptingPanel, memory_db, seed_shared_order, service_with};

    async fn setup() -> (Arc<ProvisioningService>, Arc<AcceptingPanel>, i32) {
        let db = memory_db().await;
        let order_id = seed_shared_order(&db, 2).await;
        let panel = Arc::new(AcceptingPanel::default());
        (service_with(db, panel.clone()), panel, order_id)
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_acknowledged_once_provisioned() {
        let (service, panel, order_id) = setup().await;
        let (queue, rx) = DeliveryQueue::channel(8);
        let worker = tokio::spawn(ProvisioningWorker::new(service, 2).run(rx));

        let (first, second) = tokio::join!(queue.deliver(order_id), queue.deliver(order_id));
        for outcome in [first.unwrap(), second.unwrap()] {
            match outcome {
                DeliveryOutcome::Ack(report) => assert_eq!(report.status, OrderStatus::Completed),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(panel.adds(), 2);

        drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn enqueued_deliveries_are_processed() {
        let (service, panel, order_id) = setup().await;
        let (queue, rx) = DeliveryQueue::channel(8);
        let worker = tokio::spawn(ProvisioningWorker::new(service, 1).run(rx));

        queue.enqueue(order_id).await.unwrap();
        drop(queue);
        worker.await.unwrap();

        assert_eq!(panel.adds(), 2);
    }

    #[tokio::test]
    async fn unknown_orders_are_rejected() {
        let (service, _, _) = setup().await;
        assert!(matches!(
            handle_delivery(&service, 999).await,
            DeliveryOutcome::Reject(_)
        ));
    }

    #[tokio::test]
    async fn storage_failures_are_negatively_acknowledged() {
        let (service, panel, order_id) = setup().await;
        service
            .db()
            .execute_unprepared("DROP TABLE provisioning_records")
            .await
            .unwrap();

        assert!(matches!(
            handle_delivery(&service, order_id).await,
            DeliveryOutcome::Nack(_)
        ));
        assert_eq!(panel.adds(), 0);
    }

    #[tokio::test]
    async fn stopped_worker_reports_closed_queue() {
        let (queue, rx) = DeliveryQueue::channel(1);
        drop(rx);
        assert_eq!(queue.enqueue(1).await, Err(WorkerError::Closed));
    }
}
