//! Sidecar discovery: finding the gateway address through an HTTP lookup.
//!
//! A sidecar agent holds a discovery secret (DSN) instead of a gateway
//! address. It polls the API with its connection name until the API hands
//! back the address to dial.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use outpost_core::{TunnelError, TunnelResult};

/// Path of the discovery endpoint, relative to the DSN's origin.
pub const DISCOVERY_PATH: &str = "/api/connectionapps";

/// Environment variable holding the discovery secret.
pub const DSN_ENV: &str = "HOOP_DSN";

/// Environment variable holding the connection name (or an `env.` indirection).
pub const CONNECTION_ENV: &str = "HOOP_CONNECTION";

const INDIRECT_PREFIX: &str = "env.";

/// Discovery endpoint for a DSN: `{scheme}://{host[:port]}/api/connectionapps`.
pub fn discovery_url(dsn: &str) -> TunnelResult<String> {
    if dsn.is_empty() {
        return Err(TunnelError::Config("dsn is empty".into()));
    }
    let url =
        Url::parse(dsn).map_err(|e| TunnelError::Config(format!("dsn with wrong format: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| TunnelError::Config("dsn has no host".into()))?;
    if url.scheme() != "https" {
        warn!(
            scheme = url.scheme(),
            "the agent is connecting using an insecure scheme, contact the administrator"
        );
    }
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(format!("{}://{authority}{DISCOVERY_PATH}", url.scheme()))
}

/// Resolve the connection name from [`CONNECTION_ENV`].
///
/// A value of `env.<NAME>` is followed once: the connection name is then the
/// value of `<NAME>`. `lookup` is the environment (`std::env::var(..).ok()`
/// in production).
pub fn resolve_connection_name(lookup: impl Fn(&str) -> Option<String>) -> TunnelResult<String> {
    let value = lookup(CONNECTION_ENV)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| TunnelError::Config(format!("missing {CONNECTION_ENV} env")))?;
    match value.strip_prefix(INDIRECT_PREFIX) {
        Some(name) => lookup(name).filter(|v| !v.is_empty()).ok_or_else(|| {
            TunnelError::Config(format!("environment variable {name:?} doesn't exist"))
        }),
        None => Ok(value),
    }
}

/// Raw answer from one discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub status: u16,
    pub body: String,
}

pub type DiscoveryFuture<'a> =
    Pin<Box<dyn Future<Output = TunnelResult<DiscoveryResponse>> + Send + 'a>>;

/// One discovery request. Failures are network or timeout errors; any HTTP
/// status is a successful response.
pub trait Discovery: Send + Sync {
    fn poll(&self) -> DiscoveryFuture<'_>;
}

/// Discovery over HTTP, authenticated with the DSN as a bearer token.
pub struct HttpDiscovery {
    client: reqwest::Client,
    url: String,
    dsn: String,
    connection: String,
}

impl HttpDiscovery {
    /// `timeout` bounds each request on its own.
    pub fn new(
        url: impl Into<String>,
        dsn: impl Into<String>,
        connection: impl Into<String>,
        timeout: Duration,
    ) -> TunnelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TunnelError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            dsn: dsn.into(),
            connection: connection.into(),
        })
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }
}

impl Discovery for HttpDiscovery {
    fn poll(&self) -> DiscoveryFuture<'_> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .bearer_auth(&self.dsn)
                .json(&json!({ "connection": self.connection }))
                .send()
                .await
                .map_err(|e| TunnelError::Dial(format!("discovery request failed: {e}")))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| TunnelError::Dial(format!("discovery response: {e}")))?;
            Ok(DiscoveryResponse { status, body })
        })
    }
}

/// Gateway address handed out by the discovery endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTarget {
    /// The `grpc_url` value as received.
    pub url: String,
    /// `host:port` to dial.
    pub address: String,
    /// `http://` targets are dialed without TLS.
    pub plaintext: bool,
}

impl DiscoveredTarget {
    pub fn parse(grpc_url: &str) -> TunnelResult<Self> {
        let grpc_url = grpc_url.trim();
        if grpc_url.is_empty() {
            return Err(TunnelError::Config("empty gateway url".into()));
        }
        let plaintext = grpc_url.starts_with("http://");
        if !grpc_url.contains("://") {
            return Ok(Self {
                url: grpc_url.to_string(),
                address: grpc_url.to_string(),
                plaintext,
            });
        }
        let url = Url::parse(grpc_url)
            .map_err(|e| TunnelError::Config(format!("invalid gateway url {grpc_url}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| TunnelError::Config(format!("gateway url {grpc_url} has no host")))?;
        let address = match url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self {
            url: grpc_url.to_string(),
            address,
            plaintext,
        })
    }
}

/// What a discovery response means for the polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// `200` with a usable `grpc_url`.
    Ready(DiscoveredTarget),
    /// `204`: no connection request yet.
    NotReady,
    /// `401`: the DSN is invalid or disabled.
    Unauthorized,
    /// Any other status.
    Unexpected { status: u16, body: String },
    /// `200` whose body could not be used.
    Invalid(String),
}

#[derive(Deserialize)]
struct DiscoveryBody {
    grpc_url: Option<serde_json::Value>,
}

pub fn classify_poll(response: &DiscoveryResponse) -> PollResult {
    match StatusCode::from_u16(response.status) {
        Ok(StatusCode::OK) => {
            let body: DiscoveryBody = match serde_json::from_str(&response.body) {
                Ok(body) => body,
                Err(e) => return PollResult::Invalid(format!("failed decoding response: {e}")),
            };
            let grpc_url = match body.grpc_url {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => return PollResult::Invalid("response has no grpc_url".into()),
            };
            match DiscoveredTarget::parse(&grpc_url) {
                Ok(target) => PollResult::Ready(target),
                Err(e) => PollResult::Invalid(e.to_string()),
            }
        }
        Ok(StatusCode::NO_CONTENT) => PollResult::NotReady,
        Ok(StatusCode::UNAUTHORIZED) => PollResult::Unauthorized,
        _ => PollResult::Unexpected {
            status: response.status,
            body: response.body.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn response(status: u16, body: &str) -> DiscoveryResponse {
        DiscoveryResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn url_from_dsn() {
        assert_eq!(
            discovery_url("https://secret@api.example.com/some/path").unwrap(),
            "https://api.example.com/api/connectionapps"
        );
        assert_eq!(
            discovery_url("http://localhost:8009/x").unwrap(),
            "http://localhost:8009/api/connectionapps"
        );
    }

    #[test]
    fn bad_dsn_is_config_error() {
        assert!(matches!(discovery_url(""), Err(TunnelError::Config(_))));
        assert!(matches!(discovery_url("not a url"), Err(TunnelError::Config(_))));
    }

    #[test]
    fn connection_name_direct_and_indirect() {
        assert_eq!(
            resolve_connection_name(env(&[("HOOP_CONNECTION", "pg-prod")])).unwrap(),
            "pg-prod"
        );
        assert_eq!(
            resolve_connection_name(env(&[
                ("HOOP_CONNECTION", "env.APP_NAME"),
                ("APP_NAME", "billing-db"),
            ]))
            .unwrap(),
            "billing-db"
        );
    }

    #[test]
    fn connection_name_errors() {
        assert!(resolve_connection_name(env(&[])).is_err());
        assert!(resolve_connection_name(env(&[("HOOP_CONNECTION", "")])).is_err());
        let err = resolve_connection_name(env(&[("HOOP_CONNECTION", "env.MISSING")])).unwrap_err();
        assert!(err.to_string().contains("MISSING"));
    }

    #[test]
    fn target_scheme_selects_tls() {
        let plain = DiscoveredTarget::parse("http://h:1").unwrap();
        assert_eq!(plain.address, "h:1");
        assert!(plain.plaintext);

        let tls = DiscoveredTarget::parse("https://gw.example.com").unwrap();
        assert_eq!(tls.address, "gw.example.com:443");
        assert!(!tls.plaintext);

        let grpcs = DiscoveredTarget::parse("grpcs://gw.example.com:8443/").unwrap();
        assert_eq!(grpcs.address, "gw.example.com:8443");
        assert!(!grpcs.plaintext);

        let bare = DiscoveredTarget::parse("gw.example.com:8443").unwrap();
        assert_eq!(bare.address, "gw.example.com:8443");
        assert!(!bare.plaintext);
    }

    #[test]
    fn poll_classification() {
        assert_eq!(
            classify_poll(&response(200, r#"{"grpc_url":"http://h:1"}"#)),
            PollResult::Ready(DiscoveredTarget {
                url: "http://h:1".into(),
                address: "h:1".into(),
                plaintext: true,
            })
        );
        assert_eq!(classify_poll(&response(204, "")), PollResult::NotReady);
        assert_eq!(classify_poll(&response(401, "")), PollResult::Unauthorized);
        assert_eq!(
            classify_poll(&response(500, "boom")),
            PollResult::Unexpected {
                status: 500,
                body: "boom".into()
            }
        );
        assert!(matches!(classify_poll(&response(200, "{}")), PollResult::Invalid(_)));
        assert!(matches!(classify_poll(&response(200, "<html>")), PollResult::Invalid(_)));
    }

    #[tokio::test]
    async fn http_discovery_posts_connection_with_bearer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Read until the JSON body has arrived.
            while !String::from_utf8_lossy(&request).contains("}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let body = r#"{"grpc_url":"http://h:1"}"#;
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        let url = format!("http://{addr}{DISCOVERY_PATH}");
        let discovery = HttpDiscovery::new(url, "dsn-key", "pg-prod", Duration::from_secs(5)).unwrap();
        let response = discovery.poll().await.unwrap();
        assert_eq!(response.status, 200);
        assert!(matches!(classify_poll(&response), PollResult::Ready(_)));

        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /api/connectionapps"));
        assert!(lower.contains("authorization: bearer dsn-key"));
        assert!(request.contains(r#"{"connection":"pg-prod"}"#));
    }
}
