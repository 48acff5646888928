//! Client for 3x-ui style panels.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::links;
use super::retry::RetryPolicy;
use super::{
    ClientSpec, ClientUsage, InboundConfig, IssuedCredential, PanelApi, PanelConnector,
    PanelError, RemoteInbound,
};
use crate::crypto::CredentialCipher;
use crate::db::entities::server;

/// Response envelope every panel endpoint uses.
#[derive(Deserialize, Debug)]
struct Envelope {
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: Value,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireInbound {
    id: i64,
    #[serde(default)]
    remark: String,
    #[serde(default)]
    enable: bool,
    #[serde(default)]
    listen: String,
    port: u16,
    protocol: String,
    #[serde(default)]
    settings: String,
    #[serde(default)]
    stream_settings: String,
    #[serde(default)]
    sniffing: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireClientTraffic {
    email: String,
    #[serde(default)]
    up: i64,
    #[serde(default)]
    down: i64,
    #[serde(default)]
    total: i64,
    #[serde(default)]
    expiry_time: i64,
    #[serde(default)]
    enable: bool,
}

/// Settings are stored by the panel as JSON encoded strings.
fn parse_embedded(raw: &str) -> Result<Value, PanelError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
        .map_err(|e| PanelError::Application(format!("Malformed inbound settings: {e}")))
}

impl TryFrom<WireInbound> for RemoteInbound {
    type Error = PanelError;

    fn try_from(wire: WireInbound) -> Result<Self, Self::Error> {
        Ok(RemoteInbound {
            id: wire.id,
            config: InboundConfig {
                remark: wire.remark,
                protocol: wire.protocol,
                listen: wire.listen,
                port: wire.port,
                enable: wire.enable,
                settings: parse_embedded(&wire.settings)?,
                stream_settings: parse_embedded(&wire.stream_settings)?,
                sniffing: parse_embedded(&wire.sniffing)?,
            },
        })
    }
}

fn decode_obj<T: DeserializeOwned>(obj: Value) -> Result<T, PanelError> {
    serde_json::from_value(obj)
        .map_err(|e| PanelError::Application(format!("Unexpected panel payload: {e}")))
}

/// Client object in the shape the panel expects for `protocol`.
fn client_payload(protocol: &str, spec: &ClientSpec) -> Value {
    let mut client = json!({
        "email": spec.email,
        "limitIp": 0,
        "totalGB": spec.total_bytes,
        "expiryTime": spec.expiry_time_ms,
        "enable": true,
        "tgId": "",
        "subId": spec.sub_id,
        "reset": 0,
    });
    match protocol {
        "trojan" | "shadowsocks" => client["password"] = json!(spec.uuid.to_string()),
        _ => client["id"] = json!(spec.uuid.to_string()),
    }
    client
}

/// Link settings shared by every server's client.
#[derive(Debug, Clone, Default)]
pub struct LinkSettings {
    pub subscription_url_template: Option<String>,
}

pub struct XuiPanelClient {
    http: Client,
    base_url: String,
    scheme: String,
    host: String,
    username: String,
    password: String,
    session: RwLock<Option<String>>,
    retry: RetryPolicy,
    links: LinkSettings,
}

impl XuiPanelClient {
    pub fn new(
        http: Client,
        server: &server::Model,
        password: String,
        retry: RetryPolicy,
        links: LinkSettings,
    ) -> Self {
        Self {
            http,
            base_url: server.panel_base_url(),
            scheme: server.scheme.clone(),
            host: server.host.clone(),
            username: server.panel_username.clone(),
            password,
            session: RwLock::new(None),
            retry,
            links,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self) -> Result<String, PanelError> {
        let response = self
            .http
            .post(self.url("/login"))
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PanelError::Connection(format!("Login returned {status}")));
        }
        if !status.is_success() {
            return Err(PanelError::login_rejected(format!("Login returned {status}")));
        }

        let cookie = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join("; ");

        let envelope: Envelope = response.json().await?;
        if !envelope.success {
            return Err(PanelError::login_rejected(envelope.msg));
        }
        if cookie.is_empty() {
            return Err(PanelError::login_rejected("Panel did not issue a session cookie"));
        }
        Ok(cookie)
    }

    async fn session_cookie(&self) -> Result<String, PanelError> {
        if let Some(cookie) = self.session.read().await.as_ref() {
            return Ok(cookie.clone());
        }
        let mut guard = self.session.write().await;
        if let Some(cookie) = guard.as_ref() {
            return Ok(cookie.clone());
        }
        let cookie = self.login().await?;
        debug!(panel = %self.base_url, "Established panel session.");
        *guard = Some(cookie.clone());
        Ok(cookie)
    }

    /// One authenticated round-trip; unwraps the envelope into `obj`.
    async fn request_once(&self, build: impl Fn(&Client) -> RequestBuilder) -> Result<Value, PanelError> {
        let cookie = self.session_cookie().await?;
        let response = build(&self.http)
            .header(header::COOKIE, cookie)
            .send()
            .await?;

        let status = response.status();
        if status.is_redirection()
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            *self.session.write().await = None;
            return Err(PanelError::session_rejected(format!("Panel returned {status}")));
        }
        if status.is_server_error() {
            return Err(PanelError::Connection(format!("Panel returned {status}")));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(PanelError::Application(format!("Panel returned {status}: {body}")));
        }

        let envelope: Envelope = response.json().await?;
        if !envelope.success {
            return Err(PanelError::Application(envelope.msg));
        }
        Ok(envelope.obj)
    }

    async fn call(
        &self,
        operation: &str,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Value, PanelError> {
        let build = &build;
        self.retry
            .run(operation, || async move { self.request_once(build).await })
            .await
    }

    async fn get_inbound(&self, inbound_id: i64) -> Result<RemoteInbound, PanelError> {
        let url = self.url(&format!("/panel/api/inbounds/get/{inbound_id}"));
        let obj = self.call("get_inbound", |http| http.get(&url)).await?;
        decode_obj::<WireInbound>(obj)?.try_into()
    }

    /// Single attempt at reading an inbound, for use inside a retry loop.
    async fn get_inbound_once(&self, inbound_id: i64) -> Result<RemoteInbound, PanelError> {
        let url = self.url(&format!("/panel/api/inbounds/get/{inbound_id}"));
        let obj = self.request_once(|http| http.get(&url)).await?;
        decode_obj::<WireInbound>(obj)?.try_into()
    }

    async fn list_inbounds_once(&self) -> Result<Vec<RemoteInbound>, PanelError> {
        let url = self.url("/panel/api/inbounds/list");
        let obj = self.request_once(|http| http.get(&url)).await?;
        let wire: Vec<WireInbound> = if obj.is_null() { Vec::new() } else { decode_obj(obj)? };
        wire.into_iter().map(RemoteInbound::try_from).collect()
    }

    fn credential_for(
        &self,
        inbound: &RemoteInbound,
        spec: &ClientSpec,
    ) -> Result<IssuedCredential, PanelError> {
        let access_link = links::access_link(&inbound.config, spec, &self.host)?;
        let subscription_link = links::subscription_link(
            self.links.subscription_url_template.as_deref(),
            &self.scheme,
            &self.host,
            spec,
        )?;
        Ok(IssuedCredential {
            protocol: inbound.config.protocol.clone(),
            client_id: spec.uuid.to_string(),
            access_link,
            subscription_link,
        })
    }
}

#[async_trait]
impl PanelApi for XuiPanelClient {
    async fn authenticate(&self) -> Result<(), PanelError> {
        self.retry
            .run("authenticate", || async move {
                let cookie = self.login().await?;
                *self.session.write().await = Some(cookie);
                Ok(())
            })
            .await
    }

    async fn list_inbounds(&self) -> Result<Vec<RemoteInbound>, PanelError> {
        self.retry
            .run("list_inbounds", || self.list_inbounds_once())
            .await
    }

    async fn create_inbound(&self, config: &InboundConfig) -> Result<i64, PanelError> {
        let url = self.url("/panel/api/inbounds/add");
        let body = json!({
            "up": 0,
            "down": 0,
            "total": 0,
            "remark": config.remark,
            "enable": config.enable,
            "expiryTime": 0,
            "listen": config.listen,
            "port": config.port,
            "protocol": config.protocol,
            "settings": config.settings.to_string(),
            "streamSettings": config.stream_settings.to_string(),
            "sniffing": config.sniffing.to_string(),
        });
        // A POST that timed out may still have been applied; look for it by
        // remark and port before sending it again.
        let posted = AtomicBool::new(false);
        let (posted, url, body) = (&posted, &url, &body);
        let id = self
            .retry
            .run("create_inbound", || async move {
                if posted.load(Ordering::SeqCst) {
                    let existing = self.list_inbounds_once().await?.into_iter().find(|i| {
                        i.config.remark == config.remark && i.config.port == config.port
                    });
                    if let Some(existing) = existing {
                        info!(panel = %self.base_url, inbound_id = existing.id, "Inbound from an unanswered request exists; using it.");
                        return Ok(existing.id);
                    }
                }
                posted.store(true, Ordering::SeqCst);
                let obj = self.request_once(|http| http.post(url).json(body)).await?;
                obj.get("id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| PanelError::Application("Panel did not return an inbound id".to_string()))
            })
            .await?;
        info!(panel = %self.base_url, inbound_id = id, port = config.port, "Created inbound on panel.");
        Ok(id)
    }

    async fn add_client(
        &self,
        inbound_id: i64,
        spec: &ClientSpec,
    ) -> Result<IssuedCredential, PanelError> {
        let inbound = self.get_inbound(inbound_id).await?;
        let url = self.url("/panel/api/inbounds/addClient");
        let settings = json!({ "clients": [client_payload(&inbound.config.protocol, spec)] });
        let body = json!({ "id": inbound_id, "settings": settings.to_string() });
        // Same as create_inbound: never re-POST a client the panel already has.
        let posted = AtomicBool::new(false);
        let (posted, url, body) = (&posted, &url, &body);
        self.retry
            .run("add_client", || async move {
                if posted.load(Ordering::SeqCst) {
                    let current = self.get_inbound_once(inbound_id).await?;
                    if current.client_emails().iter().any(|e| e == &spec.email) {
                        info!(panel = %self.base_url, inbound_id, email = %spec.email, "Client from an unanswered request exists; using it.");
                        return Ok(());
                    }
                }
                posted.store(true, Ordering::SeqCst);
                self.request_once(|http| http.post(url).json(body)).await.map(|_| ())
            })
            .await?;
        self.credential_for(&inbound, spec)
    }

    async fn find_client(
        &self,
        inbound_id: i64,
        spec: &ClientSpec,
    ) -> Result<Option<IssuedCredential>, PanelError> {
        let inbound = self.get_inbound(inbound_id).await?;
        if !inbound.client_emails().iter().any(|e| e == &spec.email) {
            return Ok(None);
        }
        self.credential_for(&inbound, spec).map(Some)
    }

    async fn client_usage(&self, email: &str) -> Result<Option<ClientUsage>, PanelError> {
        let url = self.url(&format!(
            "/panel/api/inbounds/getClientTraffics/{}",
            urlencoding::encode(email)
        ));
        let obj = self.call("client_usage", |http| http.get(&url)).await?;
        if obj.is_null() {
            return Ok(None);
        }
        let traffic: WireClientTraffic = decode_obj(obj)?;
        Ok(Some(ClientUsage {
            email: traffic.email,
            up_bytes: traffic.up,
            down_bytes: traffic.down,
            total_bytes: traffic.total,
            expiry_time_ms: traffic.expiry_time,
            enable: traffic.enable,
        }))
    }
}

struct CachedClient {
    fingerprint: String,
    client: Arc<XuiPanelClient>,
}

/// Builds and caches one [`XuiPanelClient`] per server so sessions are reused
/// across orders. A changed server row invalidates its cached client.
pub struct XuiConnector {
    http: Client,
    cipher: Arc<CredentialCipher>,
    retry: RetryPolicy,
    links: LinkSettings,
    clients: DashMap<i32, CachedClient>,
}

impl XuiConnector {
    pub fn new(
        cipher: Arc<CredentialCipher>,
        request_timeout: Duration,
        retry: RetryPolicy,
        links: LinkSettings,
    ) -> Result<Self, PanelError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            cipher,
            retry,
            links,
            clients: DashMap::new(),
        })
    }

    fn fingerprint(server: &server::Model) -> String {
        format!(
            "{}|{}|{}",
            server.panel_base_url(),
            server.panel_username,
            server.panel_password_encrypted
        )
    }
}

impl PanelConnector for XuiConnector {
    fn connect(&self, server: &server::Model) -> Result<Arc<dyn PanelApi>, PanelError> {
        let fingerprint = Self::fingerprint(server);
        if let Some(cached) = self.clients.get(&server.id) {
            if cached.fingerprint == fingerprint {
                return Ok(cached.client.clone());
            }
        }

        let password = self
            .cipher
            .decrypt_hex(&server.panel_password_encrypted)
            .map_err(|e| PanelError::login_rejected(format!("Cannot decrypt panel credentials: {e}")))?;
        let client = Arc::new(XuiPanelClient::new(
            self.http.clone(),
            server,
            password,
            self.retry,
            self.links.clone(),
        ));
        self.clients.insert(
            server.id,
            CachedClient {
                fingerprint,
                client: client.clone(),
            },
        );
        Ok(client)
    }
}
