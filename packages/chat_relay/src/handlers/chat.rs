use std::convert::Infallible;

use axum::{
    Json,
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use gateway_client::{
    ChatAbortParams, ChatAbortResult, ChatHistory, ChatHistoryParams, ChatInjectParams,
    ChatInjectResult,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::AppState;
use crate::error::ApiError;
use crate::relay::{self, ChatTurn, RelayEvent};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    pub session_key: Option<String>,
    pub attachments: Option<Vec<Value>>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub session_key: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub session_key: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectRequest {
    pub session_key: Option<String>,
    pub message: String,
    pub label: Option<String>,
}

fn to_sse(event: &RelayEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.payload().to_string())
}

/// POST /api/chat - relay one message and stream the reply as SSE
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let turn = ChatTurn {
        session_key: state.relay_config.session_key(req.session_key),
        message: req.message,
        attachments: req.attachments,
        timeout_ms: req.timeout_ms,
    };
    turn.validate()?;
    debug!(session_key = %turn.session_key, "Starting chat turn");

    let (tx, rx) = mpsc::channel(state.relay_config.channel_capacity);

    state.metrics.turn_started();
    let gateway = state.gateway.clone();
    let metrics = state.metrics.clone();
    tokio::spawn(async move {
        let outcome = relay::run_turn(&gateway, turn, tx).await;
        metrics.turn_finished(outcome);
    });

    let metrics = state.metrics.clone();
    let events = stream::unfold(rx, move |mut rx| {
        let metrics = metrics.clone();
        async move {
            let event = rx.recv().await?;
            metrics.event_emitted(&event);
            Some((Ok(to_sse(&event)), rx))
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.relay_config.keep_alive)))
}

/// GET /api/chat/history - proxied `chat.history`
pub async fn chat_history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ChatHistory>, ApiError> {
    let params = ChatHistoryParams {
        session_key: state.relay_config.session_key(query.session_key),
        limit: query.limit,
    };
    state.gateway.ensure_connected().await?;
    Ok(Json(state.gateway.chat_history(&params).await?))
}

/// POST /api/chat/abort - ask the gateway to stop a run, or every run of the session
pub async fn chat_abort_handler(
    State(state): State<AppState>,
    Json(req): Json<AbortRequest>,
) -> Result<Json<ChatAbortResult>, ApiError> {
    let params = ChatAbortParams {
        session_key: state.relay_config.session_key(req.session_key),
        run_id: req.run_id.filter(|id| !id.is_empty()),
    };
    state.gateway.ensure_connected().await?;
    Ok(Json(state.gateway.chat_abort(&params).await?))
}

/// POST /api/chat/inject - append a message to the transcript without starting a run
pub async fn chat_inject_handler(
    State(state): State<AppState>,
    Json(req): Json<InjectRequest>,
) -> Result<Json<ChatInjectResult>, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let params = ChatInjectParams {
        session_key: state.relay_config.session_key(req.session_key),
        message: req.message,
        label: req.label,
    };
    state.gateway.ensure_connected().await?;
    Ok(Json(state.gateway.chat_inject(&params).await?))
}
