use crate::adapters::{ChatMessage, GenerationParams};
use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::relay::{ClientTransport, SendError, StreamRelay};
use crate::ticket::StagedRequest;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const USER_HEADER: &str = "x-user-id";
const MAX_MESSAGES: usize = 64;
const MAX_CONTENT_BYTES: usize = 128 * 1024;

fn user_id(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| AppError::validation("missing x-user-id header"))
}

#[derive(Debug, Deserialize)]
pub struct PreCheckRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub params: GenerationParams,
}

#[derive(Debug, Serialize)]
pub struct PreCheckResponse {
    pub ticket: String,
}

/// Validates a chat request and stages it behind a single-use ticket. The
/// streaming endpoint only accepts tickets, never raw requests, so every
/// stream starts from an already validated payload.
pub async fn pre_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PreCheckRequest>,
) -> AppResult<Json<PreCheckResponse>> {
    let user_id = user_id(&headers)?;
    if req.messages.is_empty() {
        return Err(AppError::validation("messages must not be empty"));
    }
    if req.messages.iter().all(|m| m.content.trim().is_empty()) {
        return Err(AppError::validation("messages must carry content"));
    }
    if req.messages.len() > MAX_MESSAGES {
        return Err(AppError::validation("too many messages"));
    }
    let total: usize = req.messages.iter().map(|m| m.content.len()).sum();
    if total > MAX_CONTENT_BYTES {
        return Err(AppError::validation("messages too large"));
    }
    if state.catalog.get_enabled(&req.model).await.is_none() {
        return Err(AppError::model_not_found(&req.model));
    }
    let staged = StagedRequest {
        model: req.model,
        messages: req.messages,
        user_id,
        params: req.params,
    };
    let ticket = state
        .tickets
        .put(&staged)
        .await
        .map_err(|err| AppError::internal("ticket_store", err))?;
    Ok(Json(PreCheckResponse { ticket }))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub ticket: String,
}

/// SSE-side half of the relay's [`ClientTransport`]: a bounded event
/// channel whose backpressure and hangup map onto Full and Gone.
struct SseTransport {
    tx: Mutex<Option<mpsc::Sender<Result<Event, Infallible>>>>,
}

impl SseTransport {
    fn new(tx: mpsc::Sender<Result<Event, Infallible>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl ClientTransport for SseTransport {
    fn send(&self, payload: String) -> Result<(), SendError> {
        let guard = self.tx.lock().map_err(|_| SendError::Gone)?;
        let Some(tx) = guard.as_ref() else {
            return Err(SendError::Gone);
        };
        match tx.try_send(Ok(Event::default().data(payload))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Gone),
        }
    }

    fn close(&self) {
        // Dropping the sender ends the SSE stream.
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

/// Raises the session's closed flag when the response stream is dropped,
/// which is how a client disconnect surfaces on this side.
struct DisconnectGuard {
    relay: StreamRelay,
    session_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let relay = self.relay.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            relay.mark_closed(&session_id).await;
        });
    }
}

/// Redeems a ticket and streams the generation as SSE events.
pub async fn chat_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::channel(32);

    let relay = state.relay.clone();
    let session = session_id.clone();
    tokio::spawn(async move {
        let transport = SseTransport::new(tx);
        relay.run(&session, &query.ticket, &transport).await;
    });

    let guard = DisconnectGuard {
        relay: state.relay.clone(),
        session_id,
    };
    let stream = ReceiverStream::new(rx);
    let stream = futures_util::stream::unfold(
        (stream, Some(guard)),
        |(mut stream, guard)| async move {
            use futures_util::StreamExt;
            match stream.next().await {
                Some(event) => Some((event, (stream, guard))),
                None => {
                    drop(guard);
                    None
                }
            }
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Serves re-hosted image assets referenced by generated markdown.
pub async fn get_object(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    let bytes = state
        .objects
        .get_object(&name)
        .await
        .map_err(|err| AppError::internal("object_store", err))?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "object_not_found", "no such object"))?;
    let content_type = match name.rsplit('.').next() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub model: String,
    pub name: String,
    pub provider: &'static str,
    pub supports_vision: bool,
}

/// Lists enabled models, sorted by id. Disabled entries never appear.
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelSummary>> {
    let models = state
        .catalog
        .list_enabled()
        .await
        .into_iter()
        .map(|m| ModelSummary {
            model: m.model,
            name: m.name,
            provider: m.provider.as_str(),
            supports_vision: m.supports_vision,
        })
        .collect();
    Json(models)
}
