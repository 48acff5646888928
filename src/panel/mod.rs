//! Remote panel access.
//!
//! Everything that knows about a panel's wire format lives under this module.
//! The rest of the crate talks to panels through [`PanelApi`] and obtains
//! per-server clients from a [`PanelConnector`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::db::entities::server;

pub mod links;
pub mod retry;
pub mod xui;

/// Which step of the session handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The login request itself was refused.
    LoginRejected,
    /// An established session was refused mid-request.
    SessionRejected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PanelError {
    /// Network failure or timeout. Retryable.
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Authentication error: {message}")]
    Auth { kind: AuthFailure, message: String },
    /// The panel understood and refused the request. Never retried.
    #[error("Panel rejected the request: {0}")]
    Application(String),
}

impl PanelError {
    pub fn login_rejected(message: impl Into<String>) -> Self {
        PanelError::Auth {
            kind: AuthFailure::LoginRejected,
            message: message.into(),
        }
    }

    pub fn session_rejected(message: impl Into<String>) -> Self {
        PanelError::Auth {
            kind: AuthFailure::SessionRejected,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for PanelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PanelError::Application(format!("Malformed panel response: {err}"))
        } else {
            PanelError::Connection(err.to_string())
        }
    }
}

/// Protocol and transport configuration of an inbound, as the panel stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    pub remark: String,
    pub protocol: String,
    pub listen: String,
    pub port: u16,
    pub enable: bool,
    pub settings: serde_json::Value,
    pub stream_settings: serde_json::Value,
    pub sniffing: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInbound {
    pub id: i64,
    pub config: InboundConfig,
}

impl RemoteInbound {
    /// Emails of clients already configured on this inbound.
    pub fn client_emails(&self) -> Vec<String> {
        self.config
            .settings
            .get("clients")
            .and_then(|clients| clients.as_array())
            .map(|clients| {
                clients
                    .iter()
                    .filter_map(|c| c.get("email").and_then(|e| e.as_str()))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// What to create on the panel for one provisioning unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSpec {
    pub uuid: Uuid,
    pub email: String,
    pub sub_id: String,
    /// Traffic quota in bytes; 0 is unlimited.
    pub total_bytes: i64,
    /// Expiry as unix milliseconds; 0 never expires.
    pub expiry_time_ms: i64,
}

/// Credential descriptor returned after the panel accepted a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub protocol: String,
    pub client_id: String,
    pub access_link: String,
    pub subscription_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUsage {
    pub email: String,
    pub up_bytes: i64,
    pub down_bytes: i64,
    pub total_bytes: i64,
    pub expiry_time_ms: i64,
    pub enable: bool,
}

/// Operations the provisioning engine needs from one server's panel.
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// Establishes a fresh session with the panel.
    async fn authenticate(&self) -> Result<(), PanelError>;

    async fn list_inbounds(&self) -> Result<Vec<RemoteInbound>, PanelError>;

    /// Creates an inbound and returns its remote id.
    async fn create_inbound(&self, config: &InboundConfig) -> Result<i64, PanelError>;

    async fn add_client(
        &self,
        inbound_id: i64,
        spec: &ClientSpec,
    ) -> Result<IssuedCredential, PanelError>;

    /// Looks up a client previously added to `inbound_id`.
    async fn find_client(
        &self,
        inbound_id: i64,
        spec: &ClientSpec,
    ) -> Result<Option<IssuedCredential>, PanelError>;

    async fn client_usage(&self, email: &str) -> Result<Option<ClientUsage>, PanelError>;
}

/// Hands out a panel client for a server.
pub trait PanelConnector: Send + Sync {
    fn connect(&self, server: &server::Model) -> Result<Arc<dyn PanelApi>, PanelError>;
}
