//! HTTP and WebSocket surface over the broker.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch};
use axum::{Json, Router};
use chrono::Utc;
use parley_core::sanitize::desensitize;
use parley_core::status::BrokerStatus;
use parley_core::{
    AskSummary, Broker, ConversationHistory, ConversationRecord, SessionHandler,
    SlidingWindowCounter, UserId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ws::WsConnection;

/// Set by the authenticating proxy in front of the server.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    broker: Broker,
    sessions: SessionHandler,
}

impl AppState {
    pub fn new(broker: Broker) -> Self {
        Self {
            sessions: SessionHandler::new(broker.clone()),
            broker,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route(
            "/conv",
            get(list_conversations).delete(delete_all_conversations),
        )
        .route(
            "/conv/{id}",
            get(get_conversation)
                .patch(rename_conversation)
                .delete(delete_conversation),
        )
        .route("/conv/{id}/gen_title", patch(generate_title))
        .route("/conv/{id}/vanish", delete(vanish_conversation))
        .route("/chat", get(chat))
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors and extractors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    Core(parley_core::Error),
}

impl From<parley_core::Error> for ApiError {
    fn from(err: parley_core::Error) -> Self {
        ApiError::Core(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use parley_core::Error;

        let (status, detail) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                format!("missing or invalid {USER_HEADER} header"),
            ),
            ApiError::Core(err) => match err {
                Error::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
                Error::Forbidden(detail) => (StatusCode::FORBIDDEN, detail),
                Error::InvalidRequest(detail) => (StatusCode::BAD_REQUEST, detail),
                Error::Upstream(e) => {
                    tracing::warn!(error = %e, "upstream call failed");
                    (StatusCode::BAD_GATEWAY, desensitize(&e.to_string()))
                }
                other => {
                    tracing::error!(error = %other, "request failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
                }
            },
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

/// The caller, from [`USER_HEADER`].
pub struct AuthUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_from_headers(&parts.headers)
            .map(AuthUser)
            .ok_or(ApiError::Unauthenticated)
    }
}

fn user_from_headers(headers: &HeaderMap) -> Option<UserId> {
    headers.get(USER_HEADER)?.to_str().ok()?.trim().parse().ok()
}

async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state
        .broker
        .stats()
        .record_request(user_from_headers(request.headers()));
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    broker: BrokerStatus,
    /// Asks per counter interval, keyed by the interval's start (unix seconds).
    ask_buckets: BTreeMap<i64, u64>,
    /// HTTP requests per counter interval, keyed the same way.
    request_buckets: BTreeMap<i64, u64>,
    /// Finished asks from the ask log per interval and model.
    ask_models: BTreeMap<i64, BTreeMap<String, AskSummary>>,
}

fn bucket_start(key: i64, interval: Duration) -> i64 {
    key.saturating_mul(interval.as_millis() as i64) / 1000
}

fn buckets(counter: &SlidingWindowCounter) -> BTreeMap<i64, u64> {
    let interval = counter.interval();
    counter
        .snapshot()
        .into_iter()
        .map(|(key, bucket)| (bucket_start(key, interval), bucket.count))
        .collect()
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.broker.stats();
    Json(StatusResponse {
        broker: state.broker.status(),
        ask_buckets: buckets(stats.asks()),
        request_buckets: buckets(stats.requests()),
        ask_models: stats.log().aggregate(stats.asks().interval(), Utc::now()),
    })
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<ConversationRecord>>, ApiError> {
    Ok(Json(state.broker.conversations().list(user).await?))
}

async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationHistory>, ApiError> {
    Ok(Json(state.broker.conversations().get(user, id).await?))
}

#[derive(Deserialize)]
struct RenameQuery {
    title: String,
}

async fn rename_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    Query(query): Query<RenameQuery>,
) -> Result<Json<ConversationRecord>, ApiError> {
    Ok(Json(
        state
            .broker
            .conversations()
            .rename(user, id, &query.title)
            .await?,
    ))
}

#[derive(Deserialize)]
struct GenTitleQuery {
    message_id: Uuid,
}

async fn generate_title(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    Query(query): Query<GenTitleQuery>,
) -> Result<Json<ConversationRecord>, ApiError> {
    Ok(Json(
        state
            .broker
            .conversations()
            .generate_title(user, id, query.message_id)
            .await?,
    ))
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted: usize,
}

async fn delete_all_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<DeletedResponse>, ApiError> {
    let deleted = state.broker.conversations().delete_all(user).await?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn delete_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.broker.conversations().delete(user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn vanish_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.broker.conversations().vanish(user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let mut conn = WsConnection::new(socket);
        match state.sessions.run(user, &mut conn).await {
            Some(outcome) => tracing::debug!(user, ?outcome, "chat session closed"),
            None => tracing::debug!(user, "client left before asking"),
        }
    })
}
