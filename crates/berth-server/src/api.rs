//! Control-plane HTTP/WebSocket API: a thin request layer that validates
//! input and calls into the supervisor and store.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::Router;
use berth_instance::Instance;
use futures_util::{SinkExt, StreamExt};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::assets;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::logbus::LogBus;
use crate::proxy;
use crate::store::InstanceStore;
use crate::supervisor::Supervisor;
use crate::workspace::WorkspaceSeed;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub supervisor: Supervisor,
    pub store: Arc<InstanceStore>,
    pub bus: Arc<LogBus>,
    pub proxy_client: Client<HttpConnector, Body>,
}

pub fn router(state: AppState) -> Router {
    // The wildcard does not match an empty remainder, so the bare and
    // trailing-slash forms are routed explicitly.
    let proxy_routes = Router::new()
        .route("/{port}", any(proxy::proxy_root))
        .route("/{port}/", any(proxy::proxy_root))
        .route("/{port}/{*path}", any(proxy::proxy_subpath));

    Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/create-with-workspace", post(create_with_workspace))
        .route("/servers/create-metadata", post(create_metadata))
        .route("/servers/refresh-all", post(refresh_all))
        .route("/servers/{id}", delete(delete_server))
        .route("/servers/{id}/install-extensions", post(install_extensions))
        .route("/servers/{id}/clone-workspace", post(clone_workspace))
        .route("/servers/{id}/start", post(start_server))
        .route("/servers/{id}/stop", post(stop_server))
        .route("/servers/{id}/restart", post(restart_server))
        .route("/servers/{id}/health", get(server_health))
        .route("/servers/{id}/logs", get(server_logs))
        .route("/servers/{id}/refresh-status", post(refresh_status))
        .route("/ws/logs", get(ws_logs))
        .route("/ws/logs/{instance_id}", get(ws_logs_for_instance))
        .route("/favicon.ico", get(|| async { assets::logo_png() }))
        .route("/logo.png", get(|| async { assets::logo_png() }))
        .nest(&state.cfg.proxy_prefix, proxy_routes)
        .layer(DefaultBodyLimit::max(state.cfg.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<Instance>> {
    Json(state.store.list())
}

#[derive(Debug, Deserialize)]
struct CreateServerRequest {
    name: String,
    #[serde(default)]
    extensions: Vec<String>,
}

async fn create_server(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateServerRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(req) = payload.map_err(|e| Error::InvalidInput(e.body_text()))?;
    let inst = state
        .supervisor
        .create(&req.name, &req.extensions, None)
        .await?;
    Ok((StatusCode::CREATED, Json(inst)))
}

async fn create_metadata(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateServerRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(req) = payload.map_err(|e| Error::InvalidInput(e.body_text()))?;
    let inst = state.supervisor.create(&req.name, &[], None).await?;
    Ok((StatusCode::CREATED, Json(inst)))
}

/// Parsed multipart fields shared by the create-with-workspace and
/// clone-workspace endpoints. The uploaded archive is spooled to a temp file
/// that the caller removes after use.
#[derive(Default)]
struct WorkspaceForm {
    name: Option<String>,
    extensions: Vec<String>,
    zip_path: Option<PathBuf>,
    github_url: Option<String>,
}

impl WorkspaceForm {
    fn seed(&self) -> Option<WorkspaceSeed> {
        choose_seed(self.zip_path.clone(), self.github_url.clone())
    }

    async fn cleanup(&self) {
        if let Some(path) = &self.zip_path {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

/// An uploaded archive takes precedence over a repository URL.
fn choose_seed(zip_path: Option<PathBuf>, github_url: Option<String>) -> Option<WorkspaceSeed> {
    if let Some(path) = zip_path {
        return Some(WorkspaceSeed::Zip(path));
    }
    github_url
        .filter(|url| !url.trim().is_empty())
        .map(WorkspaceSeed::GitRepo)
}

async fn parse_workspace_form(mut multipart: Multipart) -> Result<WorkspaceForm> {
    let mut form = WorkspaceForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidInput(e.to_string()))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("name") => {
                form.name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| Error::InvalidInput(e.to_string()))?,
                );
            }
            Some("extensions") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidInput(e.to_string()))?;
                if !raw.trim().is_empty() {
                    form.extensions = serde_json::from_str(&raw).map_err(|e| {
                        Error::InvalidInput(format!("invalid extensions format: {e}"))
                    })?;
                }
            }
            Some("github_url") => {
                form.github_url = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| Error::InvalidInput(e.to_string()))?,
                );
            }
            Some("zip_file") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidInput(e.to_string()))?;
                let path = std::env::temp_dir().join(format!(
                    "berth-upload-{}-{}.zip",
                    std::process::id(),
                    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
                ));
                tokio::fs::write(&path, &data)
                    .await
                    .map_err(|e| Error::Internal(anyhow::anyhow!("failed to save upload: {e}")))?;
                form.zip_path = Some(path);
            }
            _ => {}
        }
    }

    Ok(form)
}

async fn create_with_workspace(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse> {
    let form = parse_workspace_form(multipart).await?;
    let name = match form.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            form.cleanup().await;
            return Err(Error::InvalidInput("name is required".to_string()));
        }
    };

    let result = state
        .supervisor
        .create(&name, &form.extensions, form.seed())
        .await;
    form.cleanup().await;

    let inst = result?;
    Ok((StatusCode::CREATED, Json(inst)))
}

async fn clone_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<Instance>> {
    let form = parse_workspace_form(multipart).await?;
    let Some(seed) = form.seed() else {
        form.cleanup().await;
        return Err(Error::InvalidInput(
            "Either github_url or zip_file must be provided".to_string(),
        ));
    };

    let result = state.supervisor.seed_workspace(&id, seed).await;
    form.cleanup().await;
    Ok(Json(result?))
}

#[derive(Debug, Deserialize)]
struct InstallExtensionsRequest {
    extensions: Vec<String>,
}

async fn install_extensions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<InstallExtensionsRequest>, JsonRejection>,
) -> Result<Json<Instance>> {
    let Json(req) = payload.map_err(|e| Error::InvalidInput(e.body_text()))?;
    let inst = state
        .supervisor
        .install_extensions(&id, &req.extensions)
        .await?;
    Ok(Json(inst))
}

async fn start_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Instance>> {
    Ok(Json(state.supervisor.start(&id).await?))
}

async fn stop_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Instance>> {
    Ok(Json(state.supervisor.stop(&id).await?))
}

async fn restart_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Instance>> {
    Ok(Json(state.supervisor.restart(&id).await?))
}

async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.supervisor.delete(&id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn server_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let report = state.supervisor.health(&id).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

const DEFAULT_LOG_LINES: usize = 50;

async fn server_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let logs = state.supervisor.logs(&id, lines)?;
    Ok(Json(serde_json::json!({ "logs": logs })))
}

async fn refresh_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let report = state.supervisor.refresh_status(&id).await?;
    Ok(Json(report).into_response())
}

async fn refresh_all(State(state): State<AppState>) -> Response {
    Json(state.supervisor.refresh_all().await).into_response()
}

async fn ws_logs(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_logs(socket, state.bus, None))
}

async fn ws_logs_for_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_logs(socket, state.bus, Some(instance_id)))
}

/// Deliver the one-shot snapshot, then every subsequent matching record.
/// The subscriber is dropped (not blocked) if this client stops reading.
async fn stream_logs(socket: WebSocket, bus: Arc<LogBus>, filter: Option<String>) {
    let (initial, mut updates) = bus.subscribe(filter);
    let (mut tx, mut rx) = socket.split();

    let snapshot = serde_json::json!({ "type": "initial_logs", "logs": initial });
    if tx
        .send(Message::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            record = updates.recv() => {
                let Some(record) = record else { break };
                let frame = serde_json::json!({ "type": "new_log", "log": record });
                if tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("log stream client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_defaults_to_no_extensions() {
        let req: CreateServerRequest = serde_json::from_str(r#"{"name":"alpha"}"#).unwrap();
        assert_eq!(req.name, "alpha");
        assert!(req.extensions.is_empty());

        let req: CreateServerRequest =
            serde_json::from_str(r#"{"name":"beta","extensions":["ms-python.python"]}"#).unwrap();
        assert_eq!(req.extensions, vec!["ms-python.python"]);
    }

    #[test]
    fn uploaded_archive_wins_over_repository_url() {
        let seed = choose_seed(
            Some(PathBuf::from("/tmp/a.zip")),
            Some("https://github.com/acme/repo".to_string()),
        );
        assert!(matches!(seed, Some(WorkspaceSeed::Zip(_))));

        let seed = choose_seed(None, Some("https://github.com/acme/repo".to_string()));
        assert!(matches!(seed, Some(WorkspaceSeed::GitRepo(_))));

        assert!(choose_seed(None, Some("  ".to_string())).is_none());
        assert!(choose_seed(None, None).is_none());
    }

    #[test]
    fn logs_query_lines_is_optional() {
        let q: LogsQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.lines.unwrap_or(DEFAULT_LOG_LINES), 50);
        let q: LogsQuery = serde_json::from_str(r#"{"lines":200}"#).unwrap();
        assert_eq!(q.lines, Some(200));
    }
}
