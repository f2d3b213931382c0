use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dataagent_agent::{AgentRuntime, ContextError, RunRequest};
use dataagent_core::domain::turn::{ConversationTurn, ThreadId};
use dataagent_core::errors::InterfaceError;
use dataagent_core::events::StreamEvent;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct QueryState {
    runtime: AgentRuntime,
}

pub fn router(runtime: AgentRuntime) -> Router {
    Router::new()
        .route("/api/query", post(query))
        .route("/api/threads/{thread_id}/history", get(history).delete(clear_history))
        .with_state(QueryState { runtime })
}

/// Error body returned before a stream has been opened.
pub struct ApiError(InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.to_string(),
            "message": self.0.user_message(),
            "correlation_id": self.0.correlation_id(),
        });
        (status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(InterfaceError::BadRequest {
        message: message.into(),
        correlation_id: uuid::Uuid::new_v4().to_string(),
    })
}

fn store_unavailable(error: ContextError) -> ApiError {
    ApiError(InterfaceError::ServiceUnavailable {
        message: error.to_string(),
        correlation_id: uuid::Uuid::new_v4().to_string(),
    })
}

pub async fn query(
    State(state): State<QueryState>,
    Json(request): Json<RunRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.thread_id.is_blank() {
        return Err(bad_request("thread_id must not be blank"));
    }
    if request.human_feedback.is_none() && request.question.trim().is_empty() {
        return Err(bad_request("question must not be blank"));
    }

    let handle = state.runtime.start(request);
    info!(
        event_name = "server.query.accepted",
        correlation_id = handle.correlation_id(),
        "query stream opened"
    );

    let events = handle.into_stream().map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping")))
}

fn sse_event(event: &StreamEvent) -> Event {
    match Event::default().event(event.name()).json_data(event) {
        Ok(encoded) => encoded,
        Err(error) => {
            warn!(event_name = "server.query.encode_failed", error = %error, "dropping unencodable event");
            Event::default().event("error").data(format!("event could not be encoded: {error}"))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub thread_id: ThreadId,
    pub turns: Vec<ConversationTurn>,
}

pub async fn history(
    State(state): State<QueryState>,
    Path(thread_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let thread_id = ThreadId::new(thread_id);
    let turns = state.runtime.context().history(&thread_id).await.map_err(store_unavailable)?;
    Ok(Json(HistoryResponse { thread_id, turns }))
}

pub async fn clear_history(
    State(state): State<QueryState>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let thread_id = ThreadId::new(thread_id);
    let removed =
        state.runtime.context().clear_history(&thread_id).await.map_err(store_unavailable)?;

    info!(event_name = "server.history.cleared", thread_id = %thread_id, removed, "history cleared");
    Ok(Json(json!({ "thread_id": thread_id, "removed": removed })))
}
