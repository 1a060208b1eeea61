// Thin HTTP + WebSocket mapping onto the run-engine operations. Handlers
// validate, call into the engine, and publish the structural events the
// store itself does not emit (node/edge create + delete).

use std::net::SocketAddr;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use vuhlp_core::{NodePatch, RunPatch, SendMessageParams};
use vuhlp_types::{
    Edge, EdgeType, GlobalMode, Node, NodeCapabilities, NodeControl, NodePermissions,
    OrchestrationMode, Run, RunEvent, RunStatus, VuhlpError,
};

use crate::AppState;

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<VuhlpError> for ApiError {
    fn from(err: VuhlpError) -> Self {
        let status = match &err {
            VuhlpError::NotFound(_) => StatusCode::NOT_FOUND,
            VuhlpError::Validation(_) | VuhlpError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "vuhlp daemon listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
    }
    tracing::info!("shutdown signal received");
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/runs", post(create_run).get(list_runs))
        .route(
            "/api/runs/{id}",
            get(get_run).patch(patch_run).delete(delete_run),
        )
        .route("/api/runs/{id}/events", get(run_events))
        .route("/api/runs/{id}/nodes", post(create_node))
        .route(
            "/api/runs/{id}/nodes/{node_id}",
            patch(patch_node).delete(delete_node),
        )
        .route("/api/runs/{id}/nodes/{node_id}/reset", post(reset_node))
        .route("/api/runs/{id}/edges", post(create_edge))
        .route("/api/runs/{id}/edges/{edge_id}", delete(delete_edge))
        .route("/api/runs/{id}/chat", post(post_chat))
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/{id}/resolve", post(resolve_approval))
        .route("/api/runs/{id}/artifacts/{artifact_id}", get(get_artifact))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ----------------------------------------------------------------------------
// Runs
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunBody {
    mode: Option<OrchestrationMode>,
    global_mode: Option<GlobalMode>,
    cwd: Option<String>,
}

async fn create_run(
    State(state): State<AppState>,
    body: Option<Json<CreateRunBody>>,
) -> ApiResult<Json<Run>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let run = state
        .store
        .create_run(
            body.mode.unwrap_or(OrchestrationMode::Auto),
            body.global_mode.unwrap_or(GlobalMode::Implementation),
            body.cwd,
        )
        .await;

    // The root orchestrator exists from the first moment of the run.
    let role = state.roles.get(Some("orchestrator")).await;
    let provider = resolve_provider(&state, "orchestrator", role.provider.as_deref()).await;
    let mut root = Node::new("root", "orchestrator", provider);
    root.capabilities.delegate_only = true;
    let root = state.store.add_node(&run.id, root).await?;
    state.store.set_root_node(&run.id, &root.id).await?;
    state.bus.publish(RunEvent::new(
        &run.id,
        "node.patch",
        json!({ "nodeId": root.id, "node": root }),
    ));

    state.scheduler.start(&run.id).await?;
    Ok(Json(state.store.get_run(&run.id).await?))
}

async fn list_runs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "runs": state.store.list_runs().await }))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Run>> {
    Ok(Json(state.store.get_run(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchRunBody {
    status: Option<RunStatus>,
    mode: Option<OrchestrationMode>,
    global_mode: Option<GlobalMode>,
}

async fn patch_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchRunBody>,
) -> ApiResult<Json<Run>> {
    state.store.get_run(&id).await?;

    if let Some(status) = body.status {
        match status {
            RunStatus::Paused => state.scheduler.pause(&id).await?,
            RunStatus::Running => {
                if state.scheduler.is_running(&id).await {
                    state.scheduler.resume(&id).await?;
                } else {
                    state.scheduler.start(&id).await?;
                }
            }
            RunStatus::Stopped => state.scheduler.stop(&id).await?,
            other => {
                return Err(bad_request(format!(
                    "status `{}` cannot be requested directly",
                    serde_json::to_value(other)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default()
                )));
            }
        }
    }

    if body.mode.is_some() || body.global_mode.is_some() {
        let run = state
            .store
            .patch_run(
                &id,
                RunPatch {
                    status: None,
                    mode: body.mode,
                    global_mode: body.global_mode,
                },
            )
            .await?;
        state.bus.publish(RunEvent::new(
            &id,
            "run.patch",
            json!({ "mode": run.mode, "globalMode": run.global_mode }),
        ));
    }

    Ok(Json(state.store.get_run(&id).await?))
}

async fn delete_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.store.get_run(&id).await?;
    if state.scheduler.is_running(&id).await {
        let _ = state.scheduler.stop(&id).await;
    }
    state.approvals.cancel_for_run(&id).await;
    state.prompts.clear_run(&id).await;
    state.chat.clear_run(&id).await;
    state.sessions.clear_run(&id).await;
    state.store.delete_run(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
    before: Option<u64>,
}

async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Value>> {
    state.store.get_run(&id).await?;
    let page = state
        .bus
        .replay(&id, query.limit.unwrap_or(100), query.before)
        .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({
        "events": page.events,
        "nextCursor": page.next_cursor,
        "hasMore": page.has_more,
    })))
}

// ----------------------------------------------------------------------------
// Nodes & edges
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateNodeBody {
    label: String,
    role: Option<String>,
    provider: Option<String>,
    control: Option<NodeControl>,
    capabilities: Option<NodeCapabilities>,
    permissions: Option<NodePermissions>,
}

async fn create_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateNodeBody>,
) -> ApiResult<Json<Node>> {
    if body.label.trim().is_empty() {
        return Err(bad_request("node label must not be empty"));
    }
    let role_name = body.role.unwrap_or_else(|| "implementer".to_string());
    let role = state.roles.get(Some(&role_name)).await;
    let provider = match body.provider {
        Some(provider) => provider,
        None => resolve_provider(&state, &role_name, role.provider.as_deref()).await,
    };

    let mut node = Node::new(body.label, role_name, provider);
    if let Some(control) = body.control {
        node.control = control;
    }
    if let Some(capabilities) = body.capabilities {
        node.capabilities = capabilities;
    }
    if let Some(permissions) = body.permissions {
        node.permissions = permissions;
    }

    let node = state.store.add_node(&id, node).await?;
    state.bus.publish(RunEvent::new(
        &id,
        "node.patch",
        json!({ "nodeId": node.id, "node": node }),
    ));
    Ok(Json(node))
}

async fn patch_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
    Json(body): Json<NodePatch>,
) -> ApiResult<Json<Node>> {
    let node = state.store.patch_node(&id, &node_id, body).await?;
    state.bus.publish(RunEvent::new(
        &id,
        "node.patch",
        json!({ "nodeId": node.id, "node": node }),
    ));
    Ok(Json(node))
}

async fn delete_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.approvals.cancel_for_node(&node_id).await;
    state.sessions.reset(&id, &node_id).await;
    state.store.remove_node(&id, &node_id).await?;
    state.bus.publish(RunEvent::new(
        &id,
        "node.deleted",
        json!({ "nodeId": node_id }),
    ));
    Ok(Json(json!({ "deleted": node_id })))
}

async fn reset_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.store.get_node(&id, &node_id).await?;
    let reset = state.sessions.reset(&id, &node_id).await;
    state.store.set_session_id(&id, &node_id, None).await?;
    state.bus.publish(RunEvent::new(
        &id,
        "node.patch",
        json!({ "nodeId": node_id, "sessionId": Value::Null }),
    ));
    Ok(Json(json!({ "reset": reset })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEdgeBody {
    from_node_id: String,
    to_node_id: String,
    #[serde(rename = "type")]
    edge_type: Option<EdgeType>,
    bidirectional: Option<bool>,
    label: Option<String>,
}

async fn create_edge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateEdgeBody>,
) -> ApiResult<Json<Edge>> {
    let mut edge = Edge::new(
        body.from_node_id,
        body.to_node_id,
        body.edge_type.unwrap_or(EdgeType::Handoff),
    );
    edge.bidirectional = body.bidirectional.unwrap_or(false);
    edge.label = body.label.unwrap_or_default();

    let edge = state.store.add_edge(&id, edge).await?;
    state.bus.publish(RunEvent::new(
        &id,
        "edge.created",
        json!({ "edgeId": edge.id, "edge": edge }),
    ));
    Ok(Json(edge))
}

async fn delete_edge(
    State(state): State<AppState>,
    Path((id, edge_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.store.remove_edge(&id, &edge_id).await?;
    state.bus.publish(RunEvent::new(
        &id,
        "edge.deleted",
        json!({ "edgeId": edge_id }),
    ));
    Ok(Json(json!({ "deleted": edge_id })))
}

// ----------------------------------------------------------------------------
// Chat, approvals, artifacts
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    node_id: Option<String>,
    content: String,
    interrupt: Option<bool>,
}

async fn post_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Json<Value>> {
    state.store.get_run(&id).await?;
    if body.content.trim().is_empty() {
        return Err(bad_request("chat content must not be empty"));
    }
    if let Some(node_id) = &body.node_id {
        state.store.get_node(&id, node_id).await?;
    }
    let message = state
        .chat
        .send_message(SendMessageParams {
            run_id: id,
            node_id: body.node_id,
            content: body.content,
            interrupt: body.interrupt.unwrap_or(true),
        })
        .await;
    Ok(Json(json!({ "message": message })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalsQuery {
    run_id: Option<String>,
    pending: Option<bool>,
}

async fn list_approvals(
    State(state): State<AppState>,
    Query(query): Query<ApprovalsQuery>,
) -> Json<Value> {
    let approvals = match (&query.run_id, query.pending.unwrap_or(false)) {
        (Some(run_id), true) => state.approvals.get_pending_for_run(run_id).await,
        (Some(run_id), false) => state
            .approvals
            .get_all()
            .await
            .into_iter()
            .filter(|a| &a.run_id == run_id)
            .collect(),
        (None, true) => state.approvals.get_pending().await,
        (None, false) => state.approvals.get_all().await,
    };
    Json(json!({ "approvals": approvals }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    status: String,
    feedback: Option<String>,
    modified_args: Option<Value>,
}

async fn resolve_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Json<Value>> {
    if state.approvals.get(&id).await.is_none() {
        return Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("approval {id} not found"),
        ));
    }

    let resolved = match body.status.as_str() {
        "approved" | "approve" => state.approvals.approve(&id, body.feedback).await,
        "denied" | "deny" => state.approvals.deny(&id, body.feedback).await,
        "modified" | "modify" => {
            let Some(args) = body.modified_args else {
                return Err(bad_request("modifiedArgs is required for status `modified`"));
            };
            state.approvals.modify(&id, args, body.feedback).await
        }
        other => return Err(bad_request(format!("unknown resolution status `{other}`"))),
    };

    if !resolved {
        return Err(bad_request("approval is already resolved"));
    }
    Ok(Json(json!({ "resolved": id })))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path((id, artifact_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let (artifact, content) = state.store.get_artifact(&id, &artifact_id).await?;
    Ok(Json(json!({ "artifact": artifact, "content": content })))
}

// ----------------------------------------------------------------------------
// WebSocket
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    run_id: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| ws_stream(socket, state, query.run_id))
}

/// Each published event matching the filter becomes one JSON text frame.
async fn ws_stream(mut socket: WebSocket, state: AppState, run_id: Option<String>) {
    let mut sub = state.bus.subscribe(run_id);
    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn resolve_provider(state: &AppState, role: &str, role_provider: Option<&str>) -> String {
    if let Some(provider) = role_provider {
        return provider.to_string();
    }
    if let Some(provider) = state.config.provider_for_role(role) {
        return provider.to_string();
    }
    state
        .providers
        .list()
        .await
        .first()
        .cloned()
        .unwrap_or_else(|| "mock".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tower::ServiceExt;
    use vuhlp_core::VuhlpConfig;
    use vuhlp_providers::{MockProvider, ProviderRegistry};

    async fn test_state(dir: &tempfile::TempDir) -> AppState {
        let mut config = VuhlpConfig::default();
        config.data_dir = dir.path().to_string_lossy().to_string();
        let providers = ProviderRegistry::new();
        providers.register(Arc::new(MockProvider::named("mock"))).await;
        AppState::build(config, providers).await.unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_run_returns_run_with_root_node() {
        let dir = tempdir().unwrap();
        let app = app_router(test_state(&dir).await);

        let response = app
            .oneshot(post_json("/api/runs", json!({ "mode": "AUTO" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let run = body_json(response).await;
        assert_eq!(run["status"], "running");
        let root_id = run["rootNodeId"].as_str().expect("root node id");
        assert!(run["nodes"][root_id]["role"] == "orchestrator");
    }

    #[tokio::test]
    async fn unknown_run_is_404_with_error_body() {
        let dir = tempdir().unwrap();
        let app = app_router(test_state(&dir).await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/runs/run_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("run_missing"));
    }

    #[tokio::test]
    async fn invalid_edge_is_400() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/api/runs", json!({})))
            .await
            .unwrap();
        let run = body_json(response).await;
        let run_id = run["id"].as_str().unwrap();

        let response = app
            .oneshot(post_json(
                &format!("/api/runs/{run_id}/edges"),
                json!({ "fromNodeId": "nope", "toNodeId": "also_nope" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn chat_to_unknown_node_is_404() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/api/runs", json!({})))
            .await
            .unwrap();
        let run = body_json(response).await;
        let run_id = run["id"].as_str().unwrap();

        let response = app
            .oneshot(post_json(
                &format!("/api/runs/{run_id}/chat"),
                json!({ "nodeId": "node_missing", "content": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn resolving_unknown_approval_is_404() {
        let dir = tempdir().unwrap();
        let app = app_router(test_state(&dir).await);

        let response = app
            .oneshot(post_json(
                "/api/approvals/apr_missing/resolve",
                json!({ "status": "approved" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
