//! Shared fixtures for in-crate tests.

use async_trait::async_trait;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::crypto::CredentialCipher;
use crate::db::entities::server;
use crate::db::enums::{InboundStatus, PaymentStatus, PlanMode};
use crate::db::services::inventory_service::{self, NewInbound, NewServer};
use crate::db::services::order_service;
use crate::db::sync_schema;
use crate::panel::{
    ClientSpec, ClientUsage, InboundConfig, IssuedCredential, PanelApi, PanelConnector,
    PanelError, RemoteInbound,
};
use crate::provisioning::{DedicatedPortRange, LockRegistry, ProvisioningService};

/// Fresh in-memory SQLite database with the schema applied.
///
/// A single pooled connection keeps every query on the same in-memory
/// database.
pub async fn memory_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(options)
        .await
        .expect("in-memory sqlite should open");
    sync_schema(&db).await.expect("schema should apply");
    db
}

/// Panel that accepts every client and counts `add_client` calls.
#[derive(Default)]
pub struct AcceptingPanel {
    adds: AtomicUsize,
}

impl AcceptingPanel {
    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PanelApi for AcceptingPanel {
    async fn authenticate(&self) -> Result<(), PanelError> {
        Ok(())
    }

    async fn list_inbounds(&self) -> Result<Vec<RemoteInbound>, PanelError> {
        Ok(Vec::new())
    }

    async fn create_inbound(&self, _config: &InboundConfig) -> Result<i64, PanelError> {
        Err(PanelError::Application("inbound creation is disabled".into()))
    }

    async fn add_client(&self, _inbound_id: i64, spec: &ClientSpec) -> Result<IssuedCredential, PanelError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCredential {
            protocol: "vless".into(),
            client_id: spec.uuid.to_string(),
            access_link: format!("vless://{}@panel.test:443", spec.uuid),
            subscription_link: None,
        })
    }

    async fn find_client(
        &self,
        _inbound_id: i64,
        _spec: &ClientSpec,
    ) -> Result<Option<IssuedCredential>, PanelError> {
        Ok(None)
    }

    async fn client_usage(&self, _email: &str) -> Result<Option<ClientUsage>, PanelError> {
        Ok(None)
    }
}

/// Hands out the same panel for every server.
pub struct FixedConnector(pub Arc<dyn PanelApi>);

impl PanelConnector for FixedConnector {
    fn connect(&self, _server: &server::Model) -> Result<Arc<dyn PanelApi>, PanelError> {
        Ok(self.0.clone())
    }
}

/// One server with an unlimited shared inbound and a paid order of
/// `quantity` units on it. Returns the order id.
pub async fn seed_shared_order(db: &DatabaseConnection, quantity: i32) -> i32 {
    let cipher = CredentialCipher::new(&[1u8; 32]).unwrap();
    let server = inventory_service::create_server(
        db,
        &cipher,
        NewServer {
            name: "s".into(),
            scheme: "https".into(),
            host: "panel.test".into(),
            port: 2053,
            base_path: String::new(),
            panel_username: "admin".into(),
            panel_password: "pw".into(),
        },
    )
    .await
    .unwrap();
    let inbound = inventory_service::create_inbound(
        db,
        NewInbound {
            server_id: server.id,
            panel_inbound_id: 1,
            remark: "shared".into(),
            protocol: "vless".into(),
            port: 443,
            capacity: None,
            provisioning_enabled: true,
            status: InboundStatus::Active,
            is_dedicated: false,
        },
    )
    .await
    .unwrap();
    let plan = inventory_service::create_plan(db, server.id, "p", PlanMode::Shared, inbound.id)
        .await
        .unwrap();
    let (order, _) = order_service::create_order(db, 1, PaymentStatus::Paid, &[(plan.id, quantity)])
        .await
        .unwrap();
    order.id
}

pub fn service_with(db: DatabaseConnection, panel: Arc<dyn PanelApi>) -> Arc<ProvisioningService> {
    Arc::new(ProvisioningService::new(
        db,
        Arc::new(FixedConnector(panel)),
        Arc::new(LockRegistry::new()),
        DedicatedPortRange::default(),
    ))
}
