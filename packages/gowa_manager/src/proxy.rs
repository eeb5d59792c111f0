//! Transparent HTTP/WebSocket reverse proxy, mounted under the configured
//! proxy prefix (§4.3).

use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{OriginalUri, Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{Instance, InstanceStatus};

#[derive(Clone)]
pub struct ProxyState {
    db: Database,
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build proxy http client"),
        }
    }
}

#[derive(Serialize)]
struct ProxyTarget {
    #[serde(rename = "instanceKey")]
    instance_key: String,
    #[serde(rename = "instanceName")]
    instance_name: String,
    status: InstanceStatus,
    port: Option<u16>,
    #[serde(rename = "targetPort")]
    target_port: Option<u16>,
    #[serde(rename = "proxyPath")]
    proxy_path: String,
}

impl ProxyTarget {
    fn from_instance(instance: &Instance, prefix: &str) -> Self {
        Self {
            instance_key: instance.key.clone(),
            instance_name: instance.name.clone(),
            status: instance.status,
            port: instance.port,
            target_port: instance.port,
            proxy_path: format!("/{prefix}/{}", instance.key),
        }
    }
}

/// Router mounted at `/<prefix>` in `main.rs`. `prefix` is baked into the
/// generated `proxyPath` fields; the mount point itself is the caller's
/// responsibility.
pub fn router(state: ProxyState, prefix: String) -> Router {
    Router::new()
        .route("/", get(list_targets))
        .route("/{key}/status", get(target_status))
        .route("/{key}/health", get(target_health))
        .route("/{key}/ws", any(ws_proxy))
        .route("/{key}", any(forward_http))
        .route("/{key}/{*rest}", any(forward_http))
        .with_state((state, prefix))
}

async fn list_targets(
    State((state, prefix)): State<(ProxyState, String)>,
) -> Result<Json<Vec<ProxyTarget>>, Response> {
    let instances = state.db.list_instances().await.map_err(internal_error)?;
    Ok(Json(
        instances.iter().map(|i| ProxyTarget::from_instance(i, &prefix)).collect(),
    ))
}

async fn target_status(
    State((state, prefix)): State<(ProxyState, String)>,
    Path(key): Path<String>,
) -> Result<Json<ProxyTarget>, Response> {
    let instance = lookup(&state, &key).await?;
    Ok(Json(ProxyTarget::from_instance(&instance, &prefix)))
}

#[derive(Serialize)]
struct HealthReport {
    #[serde(rename = "instanceKey")]
    instance_key: String,
    healthy: bool,
    status: InstanceStatus,
}

async fn target_health(
    State((state, _prefix)): State<(ProxyState, String)>,
    Path(key): Path<String>,
) -> Result<Json<HealthReport>, Response> {
    let instance = lookup(&state, &key).await?;
    let healthy = match instance.port {
        Some(port) if instance.status == InstanceStatus::Running => state
            .client
            .get(format!("http://127.0.0.1:{port}/"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok(),
        _ => false,
    };
    Ok(Json(HealthReport {
        instance_key: instance.key,
        healthy,
        status: instance.status,
    }))
}

async fn lookup(state: &ProxyState, key: &str) -> Result<Instance, Response> {
    state
        .db
        .get_instance_by_key(key)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found_response("Instance not found"))
}

fn internal_error(e: anyhow::Error) -> Response {
    warn!("proxy: persistence error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

fn not_found_response(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn not_running_response(key: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "Instance is not running", "instanceKey": key })),
    )
        .into_response()
}

/// Resolves an instance by key and checks it is running with an allocated
/// port, producing the §4.3 404/503 responses on failure.
async fn resolve_target(state: &ProxyState, key: &str) -> Result<u16, Response> {
    let instance = lookup(state, key).await?;
    match (instance.status, instance.port) {
        (InstanceStatus::Running, Some(port)) => Ok(port),
        _ => Err(not_running_response(key)),
    }
}

async fn forward_http(
    State((state, _prefix)): State<(ProxyState, String)>,
    Path(key): Path<String>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let port = match resolve_target(&state, &key).await {
        Ok(port) => port,
        Err(response) => return response,
    };

    // `OriginalUri` keeps the `/<prefix>` segment `nest_service` strips from
    // a plain `Uri` extractor, so the upstream sees the same path a client
    // not proxied through this prefix would send (§4.3).
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path());
    let upstream_url = format!("http://127.0.0.1:{port}{path_and_query}");

    let mut request = state.client.request(method.clone(), &upstream_url);
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        request = request.header(name, value);
    }
    if !matches!(method, Method::GET | Method::HEAD) {
        request = request.body(body.to_vec());
    }

    match request.send().await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response_headers = HeaderMap::new();
            for (name, value) in upstream.headers().iter() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_str().as_bytes()),
                    HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    response_headers.append(name, value);
                }
            }
            let bytes = upstream.bytes().await.unwrap_or_default();
            let mut response = (status, bytes).into_response();
            *response.headers_mut() = response_headers;
            response
        }
        Err(e) => {
            warn!("proxy: upstream request to {upstream_url} failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn ws_proxy(
    State((state, prefix)): State<(ProxyState, String)>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let port = match resolve_target(&state, &key).await {
        Ok(port) => port,
        Err(response) => return response,
    };

    let query_suffix = query.map(|q| format!("?{q}")).unwrap_or_default();
    let upstream_url = format!("ws://127.0.0.1:{port}/{prefix}/{key}/ws{query_suffix}");
    let forwarded_headers = headers.clone();

    ws.on_upgrade(move |socket| async move {
        pipe_websocket(socket, upstream_url, forwarded_headers).await;
    })
}

/// Dials the upstream WebSocket and pipes frames bidirectionally until
/// either side closes or errors. Forwards the client's original handshake
/// headers (subprotocols, cookies, auth) to the upstream dial.
async fn pipe_websocket(client_socket: WebSocket, upstream_url: String, headers: HeaderMap) {
    use tungstenite::client::IntoClientRequest;

    let mut request = match upstream_url.as_str().into_client_request() {
        Ok(req) => req,
        Err(e) => {
            warn!("proxy ws: failed to build upstream request: {e}");
            return;
        }
    };
    for (name, value) in headers.iter() {
        if matches!(
            name.as_str(),
            "host" | "connection" | "upgrade" | "sec-websocket-key" | "sec-websocket-version"
        ) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            tungstenite::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            tungstenite::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            request.headers_mut().insert(name, value);
        }
    }

    let (upstream_stream, _response) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("proxy ws: failed to connect upstream {upstream_url}: {e}");
            return;
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream_stream.split();
    let (mut client_tx, mut client_rx) = client_socket.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                Message::Text(text) => tungstenite::Message::Text(text.to_string().into()),
                Message::Binary(data) => tungstenite::Message::Binary(data),
                Message::Ping(data) => tungstenite::Message::Ping(data),
                Message::Pong(data) => tungstenite::Message::Pong(data),
                Message::Close(_) => break,
            };
            if upstream_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let forwarded = match msg {
                tungstenite::Message::Text(text) => Message::Text(text.to_string().into()),
                tungstenite::Message::Binary(data) => Message::Binary(data),
                tungstenite::Message::Ping(data) => Message::Ping(data),
                tungstenite::Message::Pong(data) => Message::Pong(data),
                tungstenite::Message::Close(_) | tungstenite::Message::Frame(_) => break,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => debug!("proxy ws: client side closed"),
        _ = upstream_to_client => debug!("proxy ws: upstream side closed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_target_derives_proxy_path_from_prefix_and_key() {
        let instance = Instance {
            id: 1,
            key: "ABCD1234".to_string(),
            name: "x".to_string(),
            port: Some(8005),
            status: InstanceStatus::Running,
            config: crate::models::InstanceConfig::default(),
            gowa_version: "latest".to_string(),
            error_message: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let target = ProxyTarget::from_instance(&instance, "app");
        assert_eq!(target.proxy_path, "/app/ABCD1234");
        assert_eq!(target.target_port, Some(8005));
    }
}
