//! Reverse proxy: forward end-user traffic for `/<prefix>/<port>/<rest>` to
//! `127.0.0.1:<port><rest>`, preserving method, headers, body, and the
//! WebSocket upgrade handshake. Resolution is port -> instance -> liveness
//! through the store's read path.

use std::net::SocketAddr;

use axum::Json;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::api::AppState;
use crate::assets;

const FAVICON_SUFFIX: &str = "/_static/src/browser/media/favicon.ico";
const FAVICON_DARK_SUFFIX: &str = "/_static/src/browser/media/favicon-dark-support.svg";

pub async fn proxy_root(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(port): Path<String>,
    req: Request<Body>,
) -> Response {
    handle(state, addr, port, String::new(), req).await
}

pub async fn proxy_subpath(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((port, path)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    handle(state, addr, port, path, req).await
}

async fn handle(
    state: AppState,
    addr: SocketAddr,
    port: String,
    path: String,
    req: Request<Body>,
) -> Response {
    let rest = if path.is_empty() {
        "/".to_string()
    } else {
        format!("/{path}")
    };

    // Editor-internal branding URLs are answered locally; everything else
    // proxies through unchanged.
    if rest.ends_with(FAVICON_SUFFIX) {
        return assets::logo_png();
    }
    if rest.ends_with(FAVICON_DARK_SUFFIX) {
        return assets::logo_svg();
    }

    let Ok(port) = port.parse::<u16>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Invalid port" })),
        )
            .into_response();
    };

    let running = state
        .store
        .get_by_port(port)
        .map(|inst| inst.is_running())
        .unwrap_or(false);
    if !running {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("No running server found on port {port}")
            })),
        )
            .into_response();
    }

    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();

    if is_websocket_request(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        forward_websocket(&mut parts, port, rest, query).await
    } else {
        forward_http(state, addr, port, rest, query, req).await
    }
}

/// Case-insensitive `Upgrade: websocket` + `Connection: upgrade` match.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    let header_is = |name: header::HeaderName, want: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case(want))
    };
    header_is(header::CONNECTION, "upgrade") && header_is(header::UPGRADE, "websocket")
}

/// The inbound connection is plain HTTP; treat it as originally-https only
/// when an upstream proxy says so.
fn forwarded_proto(headers: &HeaderMap) -> &'static str {
    let says = |name: &str, want: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case(want))
    };
    if says("x-forwarded-proto", "https") || says("x-forwarded-ssl", "on") {
        "https"
    } else {
        "http"
    }
}

fn append_forwarded_for(existing: Option<&str>, client_ip: &str) -> String {
    match existing {
        Some(prev) if !prev.is_empty() => format!("{prev}, {client_ip}"),
        _ => client_ip.to_string(),
    }
}

/// Inject the nginx-style forwarding headers onto the outbound request and
/// pin `Host` to the backend authority. An inbound `Upgrade` is preserved
/// with `Connection: upgrade` forced alongside it.
fn apply_proxy_headers(headers: &mut HeaderMap, client_ip: &str, port: u16) {
    let original_host = headers.get(header::HOST).cloned();
    let proto = forwarded_proto(headers);

    let xff = append_forwarded_for(
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok()),
        client_ip,
    );
    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert("x-forwarded-for", value);
    }
    if let Some(host) = original_host {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));
    if let Ok(value) = HeaderValue::from_str(&format!("127.0.0.1:{port}")) {
        headers.insert(header::HOST, value);
    }

    if headers.contains_key(header::UPGRADE) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    }
}

async fn forward_http(
    state: AppState,
    addr: SocketAddr,
    port: u16,
    rest: String,
    query: String,
    req: Request<Body>,
) -> Response {
    let target = format!("http://127.0.0.1:{port}{rest}{query}");
    let uri: Uri = match target.parse() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(url = %target, error = %e, "proxy target uri failed to parse");
            return crate::error::Error::Internal(anyhow::anyhow!("invalid proxy target"))
                .into_response();
        }
    };

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    apply_proxy_headers(&mut headers, &addr.ip().to_string(), port);

    let mut forwarded = match Request::builder().method(parts.method).uri(uri).body(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to build proxied request");
            return crate::error::Error::Internal(anyhow::anyhow!("failed to build proxy request"))
                .into_response();
        }
    };
    *forwarded.headers_mut() = headers;

    match state.proxy_client.request(forwarded).await {
        Ok(resp) => {
            let (parts, body) = resp.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            tracing::warn!(port, error = %e, "backend request failed");
            crate::error::Error::BackendUnavailable(format!(
                "backend on port {port} is unreachable"
            ))
            .into_response()
        }
    }
}

async fn forward_websocket(parts: &mut Parts, port: u16, rest: String, query: String) -> Response {
    let upgrade = match WebSocketUpgrade::from_request_parts(parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let protocols: Vec<String> = parts
        .headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default();
    let cookie = parts
        .headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let target = format!("ws://127.0.0.1:{port}{rest}{query}");

    upgrade
        .protocols(protocols)
        .on_upgrade(move |socket| async move {
            if let Err(e) = relay_websocket(socket, target, port, cookie, user_agent).await {
                tracing::debug!(error = %e, "websocket relay ended");
            }
        })
}

/// Dial the backend and run two copy loops until either side closes. The
/// first error on either side tears down both connections.
async fn relay_websocket(
    client: WebSocket,
    target: String,
    port: u16,
    cookie: Option<String>,
    user_agent: Option<String>,
) -> anyhow::Result<()> {
    let mut request = target.as_str().into_client_request()?;
    // The backend performs CORS-style origin checks; a localhost origin is
    // the one it accepts. Never copy the client's Origin verbatim.
    request
        .headers_mut()
        .insert("Origin", format!("http://localhost:{port}").parse()?);
    if let Some(cookie) = cookie {
        request.headers_mut().insert("Cookie", cookie.parse()?);
    }
    if let Some(user_agent) = user_agent {
        request
            .headers_mut()
            .insert("User-Agent", user_agent.parse()?);
    }

    let mut client = client;
    let backend = match connect_async(request).await {
        Ok((backend, _resp)) => backend,
        Err(e) => {
            tracing::warn!(url = %target, error = %e, "failed to connect to backend websocket");
            let _ = client
                .send(ClientMessage::Close(Some(CloseFrame {
                    code: 1011,
                    reason: "failed to connect to backend".into(),
                })))
                .await;
            return Err(e.into());
        }
    };

    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let client_to_backend = async {
        while let Some(msg) = client_rx.next().await {
            let msg = msg?;
            let forward = match msg {
                ClientMessage::Text(text) => BackendMessage::Text(text.to_string().into()),
                ClientMessage::Binary(data) => BackendMessage::Binary(data),
                ClientMessage::Ping(data) => BackendMessage::Ping(data),
                ClientMessage::Pong(data) => BackendMessage::Pong(data),
                ClientMessage::Close(frame) => {
                    log_close("client", frame.as_ref().map(|f| f.code));
                    BackendMessage::Close(frame.map(|f| {
                        tokio_tungstenite::tungstenite::protocol::CloseFrame {
                            code: CloseCode::from(f.code),
                            reason: f.reason.to_string().into(),
                        }
                    }))
                }
            };
            backend_tx.send(forward).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let backend_to_client = async {
        while let Some(msg) = backend_rx.next().await {
            let msg = msg?;
            let forward = match msg {
                BackendMessage::Text(text) => ClientMessage::Text(text.to_string().into()),
                BackendMessage::Binary(data) => ClientMessage::Binary(data),
                BackendMessage::Ping(data) => ClientMessage::Ping(data),
                BackendMessage::Pong(data) => ClientMessage::Pong(data),
                BackendMessage::Close(frame) => {
                    log_close("backend", frame.as_ref().map(|f| u16::from(f.code)));
                    ClientMessage::Close(frame.map(|f| CloseFrame {
                        code: u16::from(f.code),
                        reason: f.reason.to_string().into(),
                    }))
                }
                BackendMessage::Frame(_) => continue,
            };
            client_tx.send(forward).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = client_to_backend => result?,
        result = backend_to_client => result?,
    }

    Ok(())
}

/// GoingAway (1001) and AbnormalClosure (1006) are routine for editor tabs
/// being closed; anything else is worth a warning.
fn log_close(side: &str, code: Option<u16>) {
    match code {
        Some(1001) | Some(1006) => tracing::debug!(side, code, "websocket close frame"),
        _ => tracing::warn!(side, ?code, "websocket close frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn websocket_detection_is_case_insensitive() {
        assert!(is_websocket_request(&headers(&[
            ("connection", "Upgrade"),
            ("upgrade", "WebSocket"),
        ])));
        assert!(!is_websocket_request(&headers(&[("upgrade", "websocket")])));
        assert!(!is_websocket_request(&headers(&[(
            "connection",
            "keep-alive"
        )])));
    }

    #[test]
    fn forwarded_proto_honors_upstream_hints() {
        assert_eq!(forwarded_proto(&headers(&[])), "http");
        assert_eq!(
            forwarded_proto(&headers(&[("x-forwarded-proto", "https")])),
            "https"
        );
        assert_eq!(
            forwarded_proto(&headers(&[("x-forwarded-ssl", "on")])),
            "https"
        );
        assert_eq!(
            forwarded_proto(&headers(&[("x-forwarded-proto", "http")])),
            "http"
        );
    }

    #[test]
    fn forwarded_for_appends_the_client_ip() {
        assert_eq!(append_forwarded_for(None, "10.0.0.9"), "10.0.0.9");
        assert_eq!(
            append_forwarded_for(Some("203.0.113.7"), "10.0.0.9"),
            "203.0.113.7, 10.0.0.9"
        );
    }

    #[test]
    fn proxy_headers_pin_host_and_record_the_original() {
        let mut map = headers(&[("host", "workbench.example.com")]);
        apply_proxy_headers(&mut map, "10.0.0.9", 8500);

        assert_eq!(map["host"], "127.0.0.1:8500");
        assert_eq!(map["x-forwarded-host"], "workbench.example.com");
        assert_eq!(map["x-forwarded-proto"], "http");
        assert_eq!(map["x-forwarded-for"], "10.0.0.9");
        assert!(!map.contains_key(header::CONNECTION));
    }

    #[test]
    fn upgrade_requests_keep_upgrade_and_force_connection_upgrade() {
        let mut map = headers(&[
            ("host", "workbench.example.com"),
            ("upgrade", "websocket"),
            ("connection", "keep-alive, Upgrade"),
        ]);
        apply_proxy_headers(&mut map, "10.0.0.9", 8500);

        assert_eq!(map["upgrade"], "websocket");
        assert_eq!(map["connection"], "upgrade");
    }

    #[test]
    fn going_away_and_abnormal_closure_are_routine() {
        // Exercises the level-selection match arms directly.
        for code in [Some(1001), Some(1006), Some(1000), Some(1011), None] {
            log_close("client", code);
        }
    }
}
