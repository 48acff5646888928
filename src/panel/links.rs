//! Client share links in the formats common proxy clients import.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tera::{Context, Tera};

use super::{ClientSpec, InboundConfig, PanelError};

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Transport parameters shared by vless and trojan links.
fn transport_params(stream: &Value) -> BTreeMap<&'static str, String> {
    let mut params = BTreeMap::new();
    let network = str_at(stream, "/network").unwrap_or("tcp");
    let security = str_at(stream, "/security").unwrap_or("none");
    params.insert("type", network.to_string());
    params.insert("security", security.to_string());

    match network {
        "ws" => {
            if let Some(path) = str_at(stream, "/wsSettings/path") {
                params.insert("path", path.to_string());
            }
            if let Some(host) = str_at(stream, "/wsSettings/headers/Host") {
                params.insert("host", host.to_string());
            }
        }
        "grpc" => {
            if let Some(service) = str_at(stream, "/grpcSettings/serviceName") {
                params.insert("serviceName", service.to_string());
            }
        }
        _ => {}
    }

    match security {
        "tls" => {
            if let Some(sni) = str_at(stream, "/tlsSettings/serverName") {
                params.insert("sni", sni.to_string());
            }
        }
        "reality" => {
            if let Some(pbk) = str_at(stream, "/realitySettings/settings/publicKey") {
                params.insert("pbk", pbk.to_string());
            }
            if let Some(sni) = stream
                .pointer("/realitySettings/serverNames/0")
                .and_then(Value::as_str)
            {
                params.insert("sni", sni.to_string());
            }
            if let Some(sid) = stream
                .pointer("/realitySettings/shortIds/0")
                .and_then(Value::as_str)
            {
                params.insert("sid", sid.to_string());
            }
            if let Some(fp) = str_at(stream, "/realitySettings/settings/fingerprint") {
                params.insert("fp", fp.to_string());
            }
        }
        _ => {}
    }
    params
}

fn query(params: &BTreeMap<&'static str, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn fragment(inbound: &InboundConfig, spec: &ClientSpec) -> String {
    urlencoding::encode(&format!("{}-{}", inbound.remark, spec.email)).into_owned()
}

/// Builds the share link for `spec` on an inbound reachable at `host`.
pub fn access_link(
    inbound: &InboundConfig,
    spec: &ClientSpec,
    host: &str,
) -> Result<String, PanelError> {
    let stream = &inbound.stream_settings;
    let port = inbound.port;
    match inbound.protocol.as_str() {
        "vless" => {
            let mut params = transport_params(stream);
            params.insert("encryption", "none".to_string());
            if let Some(flow) = inbound
                .settings
                .pointer("/clients/0/flow")
                .and_then(Value::as_str)
                .filter(|f| !f.is_empty())
            {
                params.insert("flow", flow.to_string());
            }
            Ok(format!(
                "vless://{}@{host}:{port}?{}#{}",
                spec.uuid,
                query(&params),
                fragment(inbound, spec)
            ))
        }
        "trojan" => {
            let params = transport_params(stream);
            Ok(format!(
                "trojan://{}@{host}:{port}?{}#{}",
                spec.uuid,
                query(&params),
                fragment(inbound, spec)
            ))
        }
        "vmess" => {
            let network = str_at(stream, "/network").unwrap_or("tcp");
            let body = json!({
                "v": "2",
                "ps": format!("{}-{}", inbound.remark, spec.email),
                "add": host,
                "port": port,
                "id": spec.uuid.to_string(),
                "aid": "0",
                "scy": "auto",
                "net": network,
                "type": "none",
                "host": str_at(stream, "/wsSettings/headers/Host").unwrap_or(""),
                "path": str_at(stream, "/wsSettings/path").unwrap_or(""),
                "tls": str_at(stream, "/security").filter(|s| *s != "none").unwrap_or(""),
                "sni": str_at(stream, "/tlsSettings/serverName").unwrap_or(""),
            });
            Ok(format!("vmess://{}", STANDARD.encode(body.to_string())))
        }
        "shadowsocks" => {
            let method = str_at(&inbound.settings, "/method").ok_or_else(|| {
                PanelError::Application("shadowsocks inbound has no method".to_string())
            })?;
            let user_info = URL_SAFE_NO_PAD.encode(format!("{method}:{}", spec.uuid));
            Ok(format!(
                "ss://{user_info}@{host}:{port}#{}",
                fragment(inbound, spec)
            ))
        }
        other => Err(PanelError::Application(format!(
            "Unsupported inbound protocol: {other}"
        ))),
    }
}

/// Renders the subscription URL, or `None` when no template is configured.
pub fn subscription_link(
    template: Option<&str>,
    scheme: &str,
    host: &str,
    spec: &ClientSpec,
) -> Result<Option<String>, PanelError> {
    let Some(template) = template else {
        return Ok(None);
    };
    let mut context = Context::new();
    context.insert("scheme", scheme);
    context.insert("host", host);
    context.insert("sub_id", &spec.sub_id);
    context.insert("email", &spec.email);
    Tera::one_off(template, &context, false)
        .map(Some)
        .map_err(|e| PanelError::Application(format!("Invalid subscription template: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn spec() -> ClientSpec {
        ClientSpec {
            uuid: Uuid::parse_str("6b9f0e3c-8a0a-4a9c-9d59-0ad4b0b1a0c1").unwrap(),
            email: "o1-l2-u0-ab12".to_string(),
            sub_id: "sub123".to_string(),
            total_bytes: 0,
            expiry_time_ms: 0,
        }
    }

    fn inbound(protocol: &str, settings: Value, stream: Value) -> InboundConfig {
        InboundConfig {
            remark: "de-1".to_string(),
            protocol: protocol.to_string(),
            listen: String::new(),
            port: 443,
            enable: true,
            settings,
            stream_settings: stream,
            sniffing: json!({}),
        }
    }

    #[test]
    fn vless_ws_tls_link() {
        let config = inbound(
            "vless",
            json!({"clients": [], "decryption": "none"}),
            json!({
                "network": "ws",
                "security": "tls",
                "wsSettings": {"path": "/ray", "headers": {"Host": "cdn.example.com"}},
                "tlsSettings": {"serverName": "vpn.example.com"}
            }),
        );
        let link = access_link(&config, &spec(), "vpn.example.com").unwrap();
        assert_eq!(
            link,
            "vless://6b9f0e3c-8a0a-4a9c-9d59-0ad4b0b1a0c1@vpn.example.com:443?\
             encryption=none&host=cdn.example.com&path=%2Fray&security=tls&sni=vpn.example.com&type=ws\
             #de-1-o1-l2-u0-ab12"
        );
    }

    #[test]
    fn vmess_link_is_base64_json() {
        let config = inbound("vmess", json!({"clients": []}), json!({"network": "tcp", "security": "none"}));
        let link = access_link(&config, &spec(), "1.2.3.4").unwrap();
        let encoded = link.strip_prefix("vmess://").unwrap();
        let decoded: Value = serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded["add"], "1.2.3.4");
        assert_eq!(decoded["port"], 443);
        assert_eq!(decoded["id"], "6b9f0e3c-8a0a-4a9c-9d59-0ad4b0b1a0c1");
        assert_eq!(decoded["tls"], "");
    }

    #[test]
    fn shadowsocks_requires_method() {
        let config = inbound("shadowsocks", json!({}), json!({}));
        assert!(matches!(
            access_link(&config, &spec(), "h"),
            Err(PanelError::Application(_))
        ));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let config = inbound("wireguard", json!({}), json!({}));
        assert!(access_link(&config, &spec(), "h").is_err());
    }

    #[test]
    fn subscription_link_renders_template() {
        let link = subscription_link(
            Some("{{ scheme }}://{{ host }}:2096/sub/{{ sub_id }}"),
            "https",
            "vpn.example.com",
            &spec(),
        )
        .unwrap();
        assert_eq!(link.as_deref(), Some("https://vpn.example.com:2096/sub/sub123"));
        assert_eq!(subscription_link(None, "https", "h", &spec()).unwrap(), None);
    }
}
