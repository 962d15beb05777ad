use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use application::EventBus;
use domain::{
    Conversation, ConversationId, ConversationSummary, DomainEvent, MessageId, MessagePage, Timestamp,
    UserId,
};

use crate::{auth::bearer_token, error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenConversationPayload {
    peer_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    before: Option<Uuid>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    online_users: usize,
    connections: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadResponse {
    read_at: Option<Timestamp>,
}

/// 内部事件接口校验的请求头
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .route("/internal/v1/events", post(publish_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 带跨域配置的路由。`*` 表示放开所有来源。
pub fn router_with_cors(state: AppState, origins: &[String]) -> Router {
    let cors = if origins.iter().any(|origin| origin == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let allowed = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect::<Vec<axum::http::HeaderValue>>();
        CorsLayer::new().allow_origin(allowed)
    };
    router(state).layer(cors.allow_methods(Any).allow_headers(Any))
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(list_conversations).post(open_conversation))
        .route("/conversations/{conversation_id}", delete(delete_conversation))
        .route("/conversations/{conversation_id}/messages", get(list_messages))
        .route("/conversations/{conversation_id}/read", post(mark_read))
        .route("/ws", get(websocket_upgrade))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let presence = state.gateway.presence();
    Json(HealthResponse {
        status: "ok",
        online_users: presence.online_users().len(),
        connections: presence.connection_count(),
    })
}

fn current_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    state.jwt_service.extract_user_from_headers(headers)
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let user_id = current_user(&state, &headers)?;
    Ok(Json(state.engine.list_conversations(user_id).await?))
}

async fn open_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<OpenConversationPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let user_id = current_user(&state, &headers)?;
    let (conversation, created) = state
        .engine
        .open_conversation(user_id, UserId::from(payload.peer_id))
        .await?;
    let status = if created {
        state
            .events
            .publish(DomainEvent::conversation_created(conversation.clone(), user_id))
            .await;
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}

async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let user_id = current_user(&state, &headers)?;
    state
        .engine
        .delete_conversation(user_id, ConversationId::from(conversation_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let user_id = current_user(&state, &headers)?;
    let page = state
        .engine
        .list_messages(
            user_id,
            ConversationId::from(conversation_id),
            query.before.map(MessageId::from),
            query.limit,
        )
        .await?;
    Ok(Json(page))
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ReadResponse>, ApiError> {
    let user_id = current_user(&state, &headers)?;
    let read_at = state
        .engine
        .mark_read(ConversationId::from(conversation_id), user_id)
        .await?;
    Ok(Json(ReadResponse { read_at }))
}

/// 好友服务等外部协作方通过共享令牌发布事件。
/// 在线状态只由连接注册表产生，不接受外部发布。
async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<DomainEvent>,
) -> Result<StatusCode, ApiError> {
    let Some(expected) = state.internal_token.as_deref() else {
        return Err(ApiError::forbidden("internal events are disabled"));
    };
    let provided = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided != Some(expected) {
        return Err(ApiError::unauthorized("invalid internal token"));
    }
    if matches!(event, DomainEvent::PresenceChanged { .. }) {
        return Err(ApiError::bad_request("presence events are internal to the gateway"));
    }

    tracing::info!(event = event.name(), "收到外部领域事件");
    state.events.publish(event).await;
    Ok(StatusCode::ACCEPTED)
}

/// 握手阶段先校验身份，失败直接返回 401，不升级连接
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query.token.as_deref().or_else(|| bearer_token(&headers));
    let user_id = state.gateway.authenticate(token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        let session = state.gateway.open_session(user_id).await;
        WebSocketConnection::new(socket, session, state.idle_timeout)
            .run()
            .await;
    }))
}
