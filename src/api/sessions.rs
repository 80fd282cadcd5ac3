use async_stream::stream;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio_stream::Stream;
use tracing::{info, warn};

use crate::error::{CodeboxError, Result};
use crate::server::AppState;
use crate::session::{InputAck, SessionDetails, StartSessionRequest, StartedSession, StopRequest};

#[derive(Debug, Default, Deserialize)]
pub struct TranscriptQuery {
    #[serde(default)]
    pub exp: String,
    #[serde(default)]
    pub sig: String,
}

/// Session routes, mounted under `/api`.
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(start_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/stream", get(stream_session))
        .route("/sessions/{id}/input", post(send_input))
        .route("/sessions/{id}/stop", post(stop_session))
        .route("/sessions/{id}/transcript.ndjson", get(get_transcript))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| CodeboxError::bad_request(format!("invalid json: {}", e)))
}

/// Start a session; an idempotent replay answers 200 instead of 201.
async fn start_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<StartedSession>)> {
    let request: StartSessionRequest = parse_body(&body)?;
    let started = state.sessions.start(request).await?;
    let status = if started.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(started)))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<SessionDetails>> {
    Ok(Json(state.sessions.status(&id)?))
}

/// Server-sent events: `status`, `stdout`, `stderr`, `limit`, `error`, `exit`.
async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let mut subscription = state.sessions.subscribe(&id)?;
    info!(session_id = %id, "📡 Stream subscriber attached");

    let events = stream! {
        while let Some(event) = subscription.recv().await {
            match Event::default().event(event.event_name()).json_data(&event) {
                Ok(sse) => yield Ok::<_, Infallible>(sse),
                Err(e) => warn!("Failed to encode session event: {}", e),
            }
        }
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<InputAck>> {
    let request = parse_body(&body)?;
    Ok(Json(state.sessions.input(&id, request).await?))
}

/// Stop a session. The body is optional.
async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: StopRequest = serde_json::from_slice(&body).unwrap_or_default();
    let summary = state.sessions.stop(&id, request).await?;
    Ok(Json(json!({ "session": summary })))
}

async fn get_transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> Result<Response> {
    let path = state.sessions.transcript_path(&id, &query.exp, &query.sig)?;
    let body = tokio::fs::read(&path)
        .await
        .map_err(|_| CodeboxError::not_found("transcript not found"))?;
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}
