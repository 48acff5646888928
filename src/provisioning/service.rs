use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::allocator::{self, AllocationDecision, InboundSnapshot, PlanSnapshot, ServerSnapshot};
use super::locks::LockRegistry;
use super::summary::rollup_status;
use super::{LineItemResult, ProvisioningError, ProvisioningReport, UnitFailure};
use crate::db::entities::{order, order_line_item, provisioning_record, server, server_inbound, server_plan};
use crate::db::enums::{InboundStatus, OrderStatus, PaymentStatus, ProvisionStatus};
use crate::db::services::inventory_service::{self, NewInbound};
use crate::db::services::record_service::{self, UnitKey};
use crate::db::services::order_service;
use crate::panel::{ClientSpec, PanelApi, PanelConnector, PanelError, RemoteInbound};

/// How many times a shared allocation is retried when the chosen inbound
/// filled up between the decision and acquiring its lock.
const MAX_ALLOCATION_ROUNDS: usize = 3;
const PORT_PICK_ATTEMPTS: usize = 32;

/// Ports handed to dedicated inbounds, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedicatedPortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for DedicatedPortRange {
    fn default() -> Self {
        Self {
            min: 20000,
            max: 60000,
        }
    }
}

impl DedicatedPortRange {
    fn pick(&self, taken: &HashSet<u16>) -> Option<u16> {
        let (min, max) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        let mut rng = rand::rng();
        (0..PORT_PICK_ATTEMPTS)
            .map(|_| rng.random_range(min..=max))
            .find(|port| !taken.contains(port))
    }
}

/// Email the panel knows the unit's client by. Stable per unit.
pub fn client_email(order_id: i32, line_item_id: i32, unit_index: i32, uuid: &Uuid) -> String {
    let suffix = uuid.simple().to_string();
    format!("o{order_id}-l{line_item_id}-u{unit_index}-{}", &suffix[..8])
}

fn client_spec(record: &provisioning_record::Model, plan: &server_plan::Model) -> Result<ClientSpec, UnitFailure> {
    let (Some(uuid), Some(email)) = (record.client_uuid, record.client_email.clone()) else {
        return Err(UnitFailure::Misconfigured(format!(
            "record {} has no client identity",
            record.id
        )));
    };
    let expiry_time_ms = plan
        .duration_days
        .filter(|days| *days > 0)
        .map(|days| (Utc::now() + ChronoDuration::days(i64::from(days))).timestamp_millis())
        .unwrap_or(0);
    Ok(ClientSpec {
        uuid,
        email,
        sub_id: uuid.simple().to_string()[..16].to_string(),
        total_bytes: plan.traffic_limit_bytes.unwrap_or(0).max(0),
        expiry_time_ms,
    })
}

/// Drives orders from `paid` to a terminal fulfillment state.
pub struct ProvisioningService {
    db: DatabaseConnection,
    connector: Arc<dyn PanelConnector>,
    locks: Arc<LockRegistry>,
    ports: DedicatedPortRange,
}

impl ProvisioningService {
    pub fn new(
        db: DatabaseConnection,
        connector: Arc<dyn PanelConnector>,
        locks: Arc<LockRegistry>,
        ports: DedicatedPortRange,
    ) -> Self {
        Self {
            db,
            connector,
            locks,
            ports,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Provisions every unit of a paid order that is not yet terminal and
    /// recomputes the order status. Safe to call repeatedly.
    pub async fn provision_order(&self, order_id: i32) -> Result<ProvisioningReport, ProvisioningError> {
        let _order_guard = self.locks.lock_order(order_id).await;

        let order = order_service::get_order(&self.db, order_id)
            .await?
            .ok_or(ProvisioningError::OrderNotFound(order_id))?;
        if order.payment_status != PaymentStatus::Paid {
            warn!(order_id, payment_status = %order.payment_status, "Refusing to provision an unpaid order.");
            return Err(ProvisioningError::OrderNotPaid(order_id));
        }

        let line_items = order_service::get_line_items(&self.db, order_id).await?;
        let keys: Vec<UnitKey> = line_items
            .iter()
            .flat_map(|item| {
                (0..item.quantity.max(0)).map(move |unit_index| UnitKey {
                    order_id,
                    line_item_id: item.id,
                    unit_index,
                })
            })
            .collect();
        let records = record_service::ensure_unit_records(&self.db, order_id, &keys).await?;

        let pending = records.iter().filter(|r| !r.provision_status.is_terminal()).count();
        info!(order_id, units = records.len(), pending, "Provisioning order.");

        let order = if pending > 0 && !order.status.is_terminal() {
            order_service::update_order_status(&self.db, order, OrderStatus::Processing).await?
        } else {
            order
        };

        let mut settled = Vec::with_capacity(records.len());
        for record in records {
            if record.provision_status.is_terminal() {
                settled.push(record);
                continue;
            }
            let Some(item) = line_items.iter().find(|i| i.id == record.line_item_id) else {
                // Line items are loaded for this order, so keys always resolve.
                settled.push(record);
                continue;
            };
            let record = self.provision_unit(&order, item, record).await.map_err(|e| {
                error!(order_id, error = %e, "Storage failure while provisioning; aborting.");
                ProvisioningError::Storage(e)
            })?;
            settled.push(record);
        }

        let status = rollup_status(settled.iter().map(|r| r.provision_status));
        let order = order_service::update_order_status(&self.db, order, status).await?;
        info!(order_id, status = %order.status, "Finished provisioning order.");

        Ok(build_report(&order, &line_items, &settled))
    }

    /// Runs one unit to a terminal state. Only storage errors are returned.
    async fn provision_unit(
        &self,
        order: &order::Model,
        item: &order_line_item::Model,
        record: provisioning_record::Model,
    ) -> Result<provisioning_record::Model, DbErr> {
        let resumed = record.provision_status == ProvisionStatus::InProgress;
        let (order_id, line_item_id, unit_index) = (order.id, item.id, record.unit_index);
        let mut record = record_service::start_attempt(&self.db, record, Uuid::new_v4(), |uuid| {
            client_email(order_id, line_item_id, unit_index, uuid)
        })
        .await?;
        if resumed {
            debug!(order_id, line_item_id, unit_index, attempts = record.attempts, "Resuming unit left in progress.");
        }

        match self.run_unit(item, &mut record, resumed).await {
            Ok(completed) => {
                info!(order_id, line_item_id, unit_index, "Unit provisioned.");
                Ok(completed)
            }
            Err(UnitFailure::Storage(e)) => Err(e),
            Err(failure) => {
                warn!(order_id, line_item_id, unit_index, error = %failure, "Unit provisioning failed.");
                record_service::fail_record(&self.db, record, &failure.to_string()).await
            }
        }
    }

    async fn run_unit(
        &self,
        item: &order_line_item::Model,
        record: &mut provisioning_record::Model,
        resumed: bool,
    ) -> Result<provisioning_record::Model, UnitFailure> {
        let plan = inventory_service::get_plan(&self.db, item.plan_id)
            .await?
            .ok_or_else(|| UnitFailure::Misconfigured(format!("plan {} not found", item.plan_id)))?;
        let server = inventory_service::get_server(&self.db, plan.server_id)
            .await?
            .ok_or_else(|| UnitFailure::Misconfigured(format!("server {} not found", plan.server_id)))?;
        let spec = client_spec(record, &plan)?;
        let panel = self.connector.connect(&server)?;

        // A dedicated inbound created by an earlier attempt is owned by this unit.
        if let Some(dedicated_id) = record.dedicated_inbound_id {
            let inbound = self.require_inbound(dedicated_id).await?;
            return self.issue_client(panel.as_ref(), record, &inbound, &spec).await;
        }

        if resumed {
            if let Some(adopted) = self.adopt_previous(panel.as_ref(), record, &spec).await? {
                return Ok(adopted);
            }
        }

        let plan_snapshot = PlanSnapshot::from(&plan);
        let server_snapshot = ServerSnapshot::from(&server);
        for _ in 0..MAX_ALLOCATION_ROUNDS {
            let inbounds = self.inbound_snapshots(server.id).await?;
            match allocator::decide(&plan_snapshot, &server_snapshot, &inbounds) {
                AllocationDecision::NoCapacity(reason) => return Err(UnitFailure::NoCapacity(reason)),
                AllocationDecision::CreateDedicatedInbound(template_id) => {
                    let inbound = self
                        .create_dedicated_inbound(panel.as_ref(), &server, template_id, record)
                        .await?;
                    *record = record_service::set_target_inbound(&self.db, record.clone(), inbound.id, true).await?;
                    return self.issue_client(panel.as_ref(), record, &inbound, &spec).await;
                }
                AllocationDecision::ReuseInbound(inbound_id) => {
                    let _inbound_guard = self.locks.lock_inbound(inbound_id).await;
                    let fresh = self.inbound_snapshots(server.id).await?;
                    let still_accepts = fresh
                        .iter()
                        .find(|i| i.id == inbound_id)
                        .is_some_and(InboundSnapshot::accepts_new_client);
                    if !still_accepts {
                        debug!(inbound_id, "Inbound filled up before its lock was acquired; reallocating.");
                        continue;
                    }
                    let inbound = self.require_inbound(inbound_id).await?;
                    *record = record_service::set_target_inbound(&self.db, record.clone(), inbound_id, false).await?;
                    return self.issue_client(panel.as_ref(), record, &inbound, &spec).await;
                }
            }
        }
        Err(UnitFailure::NoCapacity(format!(
            "server {} ran out of capacity while allocating",
            server.id
        )))
    }

    /// Adopts a client an interrupted attempt already created on its target.
    async fn adopt_previous(
        &self,
        panel: &dyn PanelApi,
        record: &mut provisioning_record::Model,
        spec: &ClientSpec,
    ) -> Result<Option<provisioning_record::Model>, UnitFailure> {
        let Some(target_id) = record.target_inbound_id else {
            return Ok(None);
        };
        let Some(inbound) = inventory_service::get_inbound(&self.db, target_id).await? else {
            return Ok(None);
        };
        let _inbound_guard = self.locks.lock_inbound(inbound.id).await;
        let Some(credential) = panel.find_client(inbound.panel_inbound_id, spec).await? else {
            return Ok(None);
        };
        info!(record_id = record.id, inbound_id = inbound.id, "Adopting client created by an earlier attempt.");
        let (completed, _) =
            record_service::complete_record(&self.db, record.clone(), &inbound, spec, &credential).await?;
        Ok(Some(completed))
    }

    async fn issue_client(
        &self,
        panel: &dyn PanelApi,
        record: &provisioning_record::Model,
        inbound: &server_inbound::Model,
        spec: &ClientSpec,
    ) -> Result<provisioning_record::Model, UnitFailure> {
        // The panel refuses a client it already holds, e.g. one committed by a
        // request whose reply was lost. The unit's email identifies it.
        let credential = match panel.add_client(inbound.panel_inbound_id, spec).await {
            Ok(credential) => credential,
            Err(PanelError::Application(message)) => {
                match panel.find_client(inbound.panel_inbound_id, spec).await? {
                    Some(existing) => {
                        info!(record_id = record.id, inbound_id = inbound.id, "Panel already has this client; adopting it.");
                        existing
                    }
                    None => return Err(PanelError::Application(message).into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        let (completed, _) =
            record_service::complete_record(&self.db, record.clone(), inbound, spec, &credential).await?;
        Ok(completed)
    }

    async fn create_dedicated_inbound(
        &self,
        panel: &dyn PanelApi,
        server: &server::Model,
        template_id: i32,
        record: &provisioning_record::Model,
    ) -> Result<server_inbound::Model, UnitFailure> {
        let template = self.require_inbound(template_id).await?;
        if template.server_id != server.id {
            return Err(UnitFailure::Misconfigured(format!(
                "template inbound {template_id} does not belong to server {}",
                server.id
            )));
        }

        let remark = format!(
            "{}-o{}-l{}-u{}",
            template.remark, record.order_id, record.line_item_id, record.unit_index
        );
        let remote = panel.list_inbounds().await?;
        if let Some(existing) = remote.iter().find(|i| i.config.remark == remark) {
            return self.adopt_dedicated_inbound(server, &template, existing).await;
        }

        let template_remote = remote
            .iter()
            .find(|i| i.id == template.panel_inbound_id)
            .ok_or_else(|| {
                PanelError::Application(format!(
                    "template inbound {} is missing on the panel",
                    template.panel_inbound_id
                ))
            })?;
        let taken: HashSet<u16> = remote.iter().map(|i| i.config.port).collect();
        let port = self.ports.pick(&taken).ok_or_else(|| {
            UnitFailure::NoCapacity(format!("no free port for a dedicated inbound on server {}", server.id))
        })?;

        let mut config = template_remote.config.clone();
        config.remark = remark;
        config.port = port;
        config.enable = true;
        match config.settings.as_object_mut() {
            Some(settings) => {
                settings.insert("clients".to_string(), json!([]));
            }
            None => config.settings = json!({ "clients": Value::Array(Vec::new()) }),
        }

        let panel_inbound_id = panel.create_inbound(&config).await?;
        let inbound = inventory_service::create_inbound(
            &self.db,
            NewInbound {
                server_id: server.id,
                panel_inbound_id,
                remark: config.remark,
                protocol: config.protocol,
                port: i32::from(port),
                capacity: template.capacity,
                provisioning_enabled: true,
                status: InboundStatus::Active,
                is_dedicated: true,
            },
        )
        .await?;
        info!(
            server_id = server.id,
            template_id,
            inbound_id = inbound.id,
            port,
            "Created dedicated inbound."
        );
        Ok(inbound)
    }

    /// Registers a dedicated inbound an earlier attempt created on the panel.
    async fn adopt_dedicated_inbound(
        &self,
        server: &server::Model,
        template: &server_inbound::Model,
        remote: &RemoteInbound,
    ) -> Result<server_inbound::Model, UnitFailure> {
        if let Some(known) = inventory_service::find_inbound_by_panel_id(&self.db, server.id, remote.id).await? {
            return Ok(known);
        }
        info!(server_id = server.id, panel_inbound_id = remote.id, "Adopting dedicated inbound created by an earlier attempt.");
        let inbound = inventory_service::create_inbound(
            &self.db,
            NewInbound {
                server_id: server.id,
                panel_inbound_id: remote.id,
                remark: remote.config.remark.clone(),
                protocol: remote.config.protocol.clone(),
                port: i32::from(remote.config.port),
                capacity: template.capacity,
                provisioning_enabled: true,
                status: InboundStatus::Active,
                is_dedicated: true,
            },
        )
        .await?;
        Ok(inbound)
    }

    async fn require_inbound(&self, inbound_id: i32) -> Result<server_inbound::Model, UnitFailure> {
        inventory_service::get_inbound(&self.db, inbound_id)
            .await?
            .ok_or_else(|| UnitFailure::Misconfigured(format!("inbound {inbound_id} not found")))
    }

    async fn inbound_snapshots(&self, server_id: i32) -> Result<Vec<InboundSnapshot>, DbErr> {
        let inbounds = inventory_service::list_inbounds_for_server(&self.db, server_id).await?;
        let counts = inventory_service::client_counts_for_server(&self.db, server_id).await?;
        Ok(inbounds
            .iter()
            .map(|i| InboundSnapshot::from_model(i, counts.get(&i.id).copied().unwrap_or(0)))
            .collect())
    }
}

fn build_report(
    order: &order::Model,
    line_items: &[order_line_item::Model],
    records: &[provisioning_record::Model],
) -> ProvisioningReport {
    let items: BTreeMap<i32, LineItemResult> = line_items
        .iter()
        .map(|item| {
            let units: Vec<&provisioning_record::Model> =
                records.iter().filter(|r| r.line_item_id == item.id).collect();
            let success = units
                .iter()
                .all(|r| r.provision_status == ProvisionStatus::Completed);
            let error = if success {
                None
            } else {
                units
                    .iter()
                    .find(|r| r.provision_status != ProvisionStatus::Completed)
                    .map(|r| {
                        r.last_error
                            .clone()
                            .unwrap_or_else(|| format!("unit {} is {}", r.unit_index, r.provision_status))
                    })
            };
            (item.id, LineItemResult { success, error })
        })
        .collect();

    ProvisioningReport {
        order_id: order.id,
        status: order.status,
        items,
    }
}
