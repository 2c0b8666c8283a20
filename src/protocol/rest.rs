//! REST client (RouterOS 7+, `https://host/rest/...`).

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::DeviceConfig;
use crate::protocol::{ProtocolError, RouterClient, Row};

/// Endpoint used to validate credentials on connect.
const PROBE_PATH: &str = "/system/identity";

/// Render a JSON value the way the binary API would report it.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn rows_from_json(body: Value) -> Vec<Row> {
    let to_row = |obj: serde_json::Map<String, Value>| -> Row {
        obj.iter().map(|(k, v)| (k.clone(), stringify(v))).collect()
    };
    match body {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(obj) => Some(to_row(obj)),
                _ => None,
            })
            .collect(),
        Value::Object(obj) => vec![to_row(obj)],
        _ => Vec::new(),
    }
}

/// Build the JSON body for a POST. Empty values are flags (`once=`).
fn request_body(params: &[(&str, &str)]) -> Value {
    let map = params
        .iter()
        .map(|(k, v)| {
            let value = if v.is_empty() {
                Value::Bool(true)
            } else {
                Value::String((*v).to_string())
            };
            ((*k).to_string(), value)
        })
        .collect();
    Value::Object(map)
}

/// RouterOS REST client.
pub struct RestClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    connect_timeout: Duration,
    connected: bool,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    pub fn new(device: &DeviceConfig, connect_timeout: Duration) -> Result<Self, ProtocolError> {
        let scheme = if device.use_ssl || device.port.is_none() {
            "https"
        } else {
            "http"
        };
        Self::with_base_url(
            device,
            format!("{scheme}://{}:{}/rest", device.host, device.effective_port()),
            connect_timeout,
        )
    }

    /// Client against an explicit base URL such as `http://127.0.0.1:8080/rest`.
    pub fn with_base_url(
        device: &DeviceConfig,
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let base_url = base_url.into();
        url::Url::parse(&base_url)
            .map_err(|e| ProtocolError::Decode(format!("invalid REST url '{base_url}': {e}")))?;

        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .danger_accept_invalid_certs(!device.tls_verify)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: device.username.clone(),
            password: device.password.clone(),
            connect_timeout,
            connected: false,
        })
    }

    async fn request(
        &self,
        path: &str,
        params: &[(&str, &str)],
        deadline: Duration,
    ) -> Result<Vec<Row>, ProtocolError> {
        let request = match path.strip_suffix("/print") {
            Some(resource) if params.is_empty() => {
                self.http.get(format!("{}{}", self.base_url, resource))
            }
            _ => self
                .http
                .post(format!("{}{}", self.base_url, path))
                .json(&request_body(params)),
        };

        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProtocolError::Timeout(deadline)
                } else {
                    ProtocolError::Http(e)
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ProtocolError::Auth("router rejected credentials".to_string()));
        }
        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body
                .get("detail")
                .or_else(|| body.get("message"))
                .map(stringify)
                .unwrap_or_else(|| status.to_string());
            return Err(ProtocolError::Trap {
                category: None,
                message,
            });
        }

        let body: Value = response
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(rows_from_json(body))
    }
}

#[async_trait::async_trait]
impl RouterClient for RestClient {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.connected = false;
        self.request(&format!("{PROBE_PATH}/print"), &[], self.connect_timeout)
            .await?;
        tracing::debug!(base_url = %self.base_url, "REST session validated");
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn run_command(
        &mut self,
        path: &str,
        params: &[(&str, &str)],
        deadline: Duration,
    ) -> Result<Vec<Row>, ProtocolError> {
        if !self.connected {
            return Err(ProtocolError::NotConnected);
        }
        let result = self.request(path, params, deadline).await;
        if let Err(e) = &result
            && e.is_transport()
        {
            self.connected = false;
        }
        result
    }

    fn supports_rest(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    fn authorized(headers: &HeaderMap) -> bool {
        // admin:secret
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Basic YWRtaW46c2VjcmV0")
    }

    async fn fake_router() -> String {
        let app = Router::new()
            .route(
                "/rest/system/identity",
                get(|headers: HeaderMap| async move {
                    if authorized(&headers) {
                        (StatusCode::OK, Json(json!({"name": "core-1"})))
                    } else {
                        (StatusCode::UNAUTHORIZED, Json(json!({"error": 401})))
                    }
                }),
            )
            .route(
                "/rest/interface",
                get(|| async {
                    Json(json!([
                        {".id": "*1", "name": "ether1", "running": true, "mtu": 1500},
                        {".id": "*2", "name": "ether2", "running": false, "comment": null}
                    ]))
                }),
            )
            .route(
                "/rest/ping",
                post(|Json(body): Json<Value>| async move {
                    Json(json!([{"host": body["address"], "time": "4ms", "count": body["count"]}]))
                }),
            )
            .route(
                "/rest/{*rest}",
                get(|Path(_rest): Path<String>| async {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": 400, "message": "Bad Request", "detail": "no such command"})),
                    )
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/rest")
    }

    fn device(password: &str) -> DeviceConfig {
        DeviceConfig::new("r1", "127.0.0.1").with_credentials("admin", password)
    }

    #[tokio::test]
    async fn test_get_and_post_commands() {
        let base = fake_router().await;
        let mut client =
            RestClient::with_base_url(&device("secret"), &base, Duration::from_secs(2)).unwrap();
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert!(client.supports_rest());

        let rows = client
            .run_command("/interface/print", &[], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["running"], "true");
        assert_eq!(rows[0]["mtu"], "1500");
        assert_eq!(rows[1]["comment"], "");

        let rows = client
            .run_command("/ping", &[("address", "8.8.8.8"), ("count", "1")], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(rows[0]["host"], "8.8.8.8");
        assert_eq!(rows[0]["count"], "1");
    }

    #[tokio::test]
    async fn test_bad_request_is_trap_and_keeps_session() {
        let base = fake_router().await;
        let mut client =
            RestClient::with_base_url(&device("secret"), &base, Duration::from_secs(2)).unwrap();
        client.connect().await.unwrap();

        let err = client
            .run_command("/routing/bgp/session/print", &[], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Trap { ref message, .. } if message == "no such command"));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_wrong_password_is_auth_error() {
        let base = fake_router().await;
        let mut client =
            RestClient::with_base_url(&device("nope"), &base, Duration::from_secs(2)).unwrap();
        assert!(matches!(client.connect().await, Err(ProtocolError::Auth(_))));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_request_body_flags() {
        let body = request_body(&[("interface", "ether1,ether2"), ("once", "")]);
        assert_eq!(body, json!({"interface": "ether1,ether2", "once": true}));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(RestClient::with_base_url(&device("x"), "not a url", Duration::from_secs(1)).is_err());
    }
}
