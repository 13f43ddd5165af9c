use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use agent_chat_error::ChatError;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::checkpoints::Checkpoint;
use crate::config::{AgentModel, ChatSettings};
use crate::conversations::{ConversationIndexEntry, ConversationRecord};
use crate::events::SequencedEvent;
use crate::orchestrator::{ChatSession, ChatSnapshot, TurnRequest};
use crate::permissions::{PermissionRequest, ToolRule};
use crate::session_state::SessionSnapshot;

const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub fn build_router(session: ChatSession) -> Router {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/events", get(get_events_sse))
        .route("/session", get(get_session))
        .route("/session/new", post(new_session))
        .route("/turns", post(post_turn))
        .route("/stop", post(stop_turn))
        .route("/model", put(put_model))
        .route("/settings", get(get_settings).put(put_settings))
        .route(
            "/permissions/rules",
            get(list_rules).post(add_rule).delete(remove_rule),
        )
        .route("/permissions/:request_id/reply", post(reply_permission))
        .route("/checkpoints", get(list_checkpoints))
        .route(
            "/checkpoints/:checkpoint_id/restore",
            post(restore_checkpoint),
        )
        .route("/conversations", get(list_conversations))
        .route("/conversations/:filename/load", post(load_conversation))
        .route("/tool-servers", get(list_tool_servers))
        .route(
            "/tool-servers/:name",
            put(save_tool_server).delete(delete_tool_server),
        )
        .with_state(session);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::debug!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .nest("/v1", v1_router)
        .fallback(not_found)
        .layer(trace_layer)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = match &self {
            ApiError::Chat(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    /// Same meaning as the `Last-Event-ID` header; the header wins.
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReplyRequest {
    pub approved: bool,
    #[serde(default)]
    pub always_allow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: AgentModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRequest {
    pub tool_name: String,
    #[serde(default)]
    pub command: Option<String>,
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_events_sse(
    State(session): State<ChatSession>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .or(query.offset);
    let (replay, receiver) = session.subscribe(last_event_id).await;

    let initial_stream = stream::iter(
        replay
            .into_iter()
            .map(|event| Ok::<Event, Infallible>(to_sse_event(&event))),
    );
    let live_stream = BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(event) => Some(Ok::<Event, Infallible>(to_sse_event(&event))),
            Err(err) => {
                tracing::warn!(error = %err, "event subscriber lagged; events dropped");
                None
            }
        }
    });

    Sse::new(initial_stream.chain(live_stream))
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

async fn get_session(State(session): State<ChatSession>) -> Json<ChatSnapshot> {
    Json(session.snapshot().await)
}

async fn new_session(State(session): State<ChatSession>) -> Result<StatusCode, ApiError> {
    session.new_session().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_turn(
    State(session): State<ChatSession>,
    Json(request): Json<TurnRequest>,
) -> Result<StatusCode, ApiError> {
    session.send_turn(request).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_turn(State(session): State<ChatSession>) -> Result<StatusCode, ApiError> {
    session.stop().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_model(
    State(session): State<ChatSession>,
    Json(request): Json<ModelRequest>,
) -> Json<SessionSnapshot> {
    Json(session.select_model(request.model).await)
}

async fn get_settings(State(session): State<ChatSession>) -> Json<ChatSettings> {
    Json(session.settings().await)
}

async fn put_settings(
    State(session): State<ChatSession>,
    Json(settings): Json<ChatSettings>,
) -> Json<ChatSettings> {
    Json(session.update_settings(settings).await)
}

async fn reply_permission(
    State(session): State<ChatSession>,
    Path(request_id): Path<String>,
    Json(request): Json<PermissionReplyRequest>,
) -> Result<Json<PermissionRequest>, ApiError> {
    let resolved = session
        .reply_permission(&request_id, request.approved, request.always_allow)
        .await?;
    Ok(Json(resolved))
}

async fn list_rules(State(session): State<ChatSession>) -> Json<BTreeMap<String, ToolRule>> {
    Json(session.list_rules().await)
}

async fn add_rule(
    State(session): State<ChatSession>,
    Json(request): Json<RuleRequest>,
) -> Result<Json<BTreeMap<String, ToolRule>>, ApiError> {
    let rules = session
        .add_rule(&request.tool_name, request.command.as_deref())
        .await?;
    Ok(Json(rules))
}

async fn remove_rule(
    State(session): State<ChatSession>,
    Json(request): Json<RuleRequest>,
) -> Result<Json<BTreeMap<String, ToolRule>>, ApiError> {
    let rules = session
        .remove_rule(&request.tool_name, request.command.as_deref())
        .await?;
    Ok(Json(rules))
}

async fn list_checkpoints(State(session): State<ChatSession>) -> Json<Vec<Checkpoint>> {
    Json(session.list_checkpoints().await)
}

async fn restore_checkpoint(
    State(session): State<ChatSession>,
    Path(checkpoint_id): Path<String>,
) -> Result<Json<Checkpoint>, ApiError> {
    Ok(Json(session.restore_checkpoint(&checkpoint_id).await?))
}

async fn list_conversations(
    State(session): State<ChatSession>,
) -> Json<Vec<ConversationIndexEntry>> {
    Json(session.list_conversations().await)
}

async fn load_conversation(
    State(session): State<ChatSession>,
    Path(filename): Path<String>,
) -> Result<Json<ConversationRecord>, ApiError> {
    Ok(Json(session.load_conversation(&filename).await?))
}

async fn list_tool_servers(
    State(session): State<ChatSession>,
) -> Result<Json<Map<String, Value>>, ApiError> {
    Ok(Json(session.list_tool_servers().await?))
}

async fn save_tool_server(
    State(session): State<ChatSession>,
    Path(name): Path<String>,
    Json(config): Json<Value>,
) -> Result<StatusCode, ApiError> {
    session.save_tool_server(&name, config).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_tool_server(
    State(session): State<ChatSession>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    session.delete_tool_server(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn to_sse_event(event: &SequencedEvent) -> Event {
    Event::default()
        .id(event.sequence.to_string())
        .json_data(&event.event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}
