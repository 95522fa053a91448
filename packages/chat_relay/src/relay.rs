//! Relay - one browser chat turn, from `chat.send` to the final `done`
//!
//! [`run_turn`] starts a run on the backend, pulls its events, strips inline
//! markers out of the streamed text and writes [`RelayEvent`]s to the outward
//! channel. Whatever happens (backend error, dropped connection, idle run,
//! panic), the channel sees exactly one `done`, and it is the last event.

use std::future::Future;

use gateway_client::{
    ChatEvent, ChatRunStream, ChatSendParams, ChatState, GatewayClient, GatewayError,
};
use inline_markers::{Extraction, Marker, MarkerInterceptor};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shown to the user when the turn could not be started at all.
pub const CONNECTION_FAILED_MESSAGE: &str =
    "Could not reach the assistant. Please try again in a moment.";

const RUN_FAILED_MESSAGE: &str = "The assistant reported an error.";

/// One event on the outward stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Delta { text: String },
    Dashboard { intent: String, data: Option<Value> },
    Render { component: String, props: Value },
    Error { error: String },
    Done { text: String, aborted: bool },
}

impl RelayEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Delta { .. } => "delta",
            RelayEvent::Dashboard { .. } => "dashboard",
            RelayEvent::Render { .. } => "render",
            RelayEvent::Error { .. } => "error",
            RelayEvent::Done { .. } => "done",
        }
    }

    /// JSON body on the wire.
    pub fn payload(&self) -> Value {
        match self {
            RelayEvent::Delta { text } => json!({ "text": text }),
            RelayEvent::Dashboard { intent, data: Some(data) } => {
                json!({ "intent": intent, "data": data })
            }
            RelayEvent::Dashboard { intent, data: None } => json!({ "intent": intent }),
            RelayEvent::Render { component, props } => {
                json!({ "component": component, "props": props })
            }
            RelayEvent::Error { error } => json!({ "error": error }),
            RelayEvent::Done { text, aborted: true } => json!({ "text": text, "aborted": true }),
            RelayEvent::Done { text, aborted: false } => json!({ "text": text }),
        }
    }
}

impl From<Marker> for RelayEvent {
    fn from(marker: Marker) -> Self {
        match marker {
            Marker::Dashboard { intent, data } => RelayEvent::Dashboard { intent, data },
            Marker::Render { component, props } => RelayEvent::Render { component, props },
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("message must not be empty")]
    EmptyMessage,
}

/// A single user message to relay.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub session_key: String,
    pub message: String,
    pub attachments: Option<Vec<Value>>,
    pub timeout_ms: Option<u64>,
}

impl ChatTurn {
    pub fn new(session_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            message: message.into(),
            attachments: None,
            timeout_ms: None,
        }
    }

    pub fn validate(&self) -> Result<(), TurnError> {
        if self.message.trim().is_empty() {
            return Err(TurnError::EmptyMessage);
        }
        Ok(())
    }
}

/// How a turn ended. Every variant except `ClientGone` delivered a `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Aborted,
    /// The run reported an error before its events stopped.
    Errored,
    /// The run's events stopped without a terminal state.
    EndedAbnormally,
    /// Connecting or `chat.send` failed.
    StartFailed,
    /// The outward channel closed before the turn finished.
    ClientGone,
}

/// Source of chat runs.
pub trait ChatBackend: Send + Sync {
    type Run: RunEvents;

    fn start_run(
        &self,
        turn: &ChatTurn,
    ) -> impl Future<Output = Result<Self::Run, GatewayError>> + Send;
}

/// Pull side of one run's events. `None` means no more events will come.
pub trait RunEvents: Send {
    fn next_event(&mut self) -> impl Future<Output = Option<ChatEvent>> + Send;
}

impl ChatBackend for GatewayClient {
    type Run = ChatRunStream;

    fn start_run(
        &self,
        turn: &ChatTurn,
    ) -> impl Future<Output = Result<ChatRunStream, GatewayError>> + Send {
        let params = ChatSendParams {
            session_key: turn.session_key.clone(),
            message: turn.message.clone(),
            idempotency_key: Uuid::new_v4().to_string(),
            timeout_ms: turn.timeout_ms,
            attachments: turn.attachments.clone(),
        };
        async move {
            self.ensure_connected().await?;
            let (ack, run) = self.chat_send(params).await?;
            debug!(run_id = %ack.run_id, "Relaying chat run");
            Ok(run)
        }
    }
}

impl RunEvents for ChatRunStream {
    fn next_event(&mut self) -> impl Future<Output = Option<ChatEvent>> + Send {
        ChatRunStream::next_event(self)
    }
}

/// Text a cumulative delta adds beyond `previous`.
///
/// When `current` does not extend `previous`, everything past their longest
/// common prefix counts as new.
pub fn cumulative_suffix<'a>(previous: &str, current: &'a str) -> &'a str {
    if let Some(rest) = current.strip_prefix(previous) {
        return rest;
    }
    let common = previous
        .char_indices()
        .zip(current.chars())
        .find(|((_, a), b)| a != b)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| previous.len().min(current.len()));
    &current[common..]
}

/// Outward side of a turn.
///
/// Owns the interceptor, the running text record and a channel slot reserved
/// for `done`. Dropping a writer that still holds the slot sends `done`
/// through it, so an abandoned or panicking turn still terminates its stream
/// even when the channel is full.
struct TurnWriter {
    out: mpsc::Sender<RelayEvent>,
    /// Taken when `done` goes out.
    done_permit: Option<mpsc::OwnedPermit<RelayEvent>>,
    interceptor: MarkerInterceptor,
    /// Raw backend text seen so far.
    seen: String,
    /// Clean text sent so far.
    clean: String,
}

#[derive(Debug)]
struct ClientGone;

impl TurnWriter {
    async fn new(out: mpsc::Sender<RelayEvent>) -> Result<Self, ClientGone> {
        let done_permit = out.clone().reserve_owned().await.map_err(|_| ClientGone)?;
        Ok(Self {
            out,
            done_permit: Some(done_permit),
            interceptor: MarkerInterceptor::new(),
            seen: String::new(),
            clean: String::new(),
        })
    }

    async fn emit(&mut self, event: RelayEvent) -> Result<(), ClientGone> {
        self.out.send(event).await.map_err(|_| ClientGone)
    }

    /// Feed the message-so-far; only the part not seen before is relayed.
    async fn feed(&mut self, current: &str) -> Result<(), ClientGone> {
        let suffix = cumulative_suffix(&self.seen, current).to_string();
        self.seen = current.to_string();
        if suffix.is_empty() {
            return Ok(());
        }
        let extraction = self.interceptor.add_chunk(&suffix);
        self.write(extraction).await
    }

    async fn write(&mut self, extraction: Extraction) -> Result<(), ClientGone> {
        // Markers sit after the text that preceded them in the chunk, so prose first.
        if !extraction.text.is_empty() {
            self.clean.push_str(&extraction.text);
            self.emit(RelayEvent::Delta {
                text: extraction.text,
            })
            .await?;
        }
        for marker in extraction.markers {
            self.emit(marker.into()).await?;
        }
        Ok(())
    }

    async fn error(&mut self, message: String) -> Result<(), ClientGone> {
        self.emit(RelayEvent::Error { error: message }).await
    }

    /// Flush withheld text and send the one `done`.
    async fn finish(&mut self, aborted: bool) -> Result<(), ClientGone> {
        let rest = self.interceptor.flush();
        if !rest.is_empty() {
            self.write(rest).await?;
        }
        self.send_done(aborted);
        if self.out.is_closed() {
            return Err(ClientGone);
        }
        Ok(())
    }

    fn send_done(&mut self, aborted: bool) {
        if let Some(permit) = self.done_permit.take() {
            permit.send(RelayEvent::Done {
                text: self.clean.clone(),
                aborted,
            });
        }
    }
}

impl Drop for TurnWriter {
    fn drop(&mut self) {
        if self.done_permit.is_none() {
            return;
        }
        warn!("Chat turn abandoned before done, sending fallback");
        // Withheld text only goes into `done`; markers get whatever room is left.
        let rest = self.interceptor.flush();
        self.clean.push_str(&rest.text);
        for marker in rest.markers {
            if self.out.try_send(marker.into()).is_err() {
                debug!("No room for a flushed marker in the fallback");
            }
        }
        self.send_done(false);
    }
}

/// Relay one chat turn to `out`.
///
/// Backend failures never escape: they become at most one `error` event
/// followed by `done`. If `out` closes, the loop stops; the backend run is
/// left alone. One slot of `out` stays reserved for `done` for the whole
/// turn, so `out` needs a capacity of at least two.
pub async fn run_turn<B: ChatBackend>(
    backend: &B,
    turn: ChatTurn,
    out: mpsc::Sender<RelayEvent>,
) -> TurnOutcome {
    let mut writer = match TurnWriter::new(out).await {
        Ok(writer) => writer,
        Err(ClientGone) => return TurnOutcome::ClientGone,
    };

    let mut run = match backend.start_run(&turn).await {
        Ok(run) => run,
        Err(e) => {
            warn!(session_key = %turn.session_key, error = %e, "Failed to start chat run");
            let _ = writer.error(CONNECTION_FAILED_MESSAGE.to_string()).await;
            return match writer.finish(false).await {
                Ok(()) => TurnOutcome::StartFailed,
                Err(ClientGone) => TurnOutcome::ClientGone,
            };
        }
    };

    match relay_events(&mut writer, &mut run).await {
        Ok(outcome) => {
            info!(session_key = %turn.session_key, ?outcome, "Chat turn finished");
            outcome
        }
        Err(ClientGone) => {
            info!(session_key = %turn.session_key, "Client went away mid-turn");
            TurnOutcome::ClientGone
        }
    }
}

async fn relay_events<R: RunEvents>(
    writer: &mut TurnWriter,
    run: &mut R,
) -> Result<TurnOutcome, ClientGone> {
    let mut errored = false;

    loop {
        let event = tokio::select! {
            event = run.next_event() => event,
            () = writer.out.closed() => return Err(ClientGone),
        };

        let Some(event) = event else {
            // Channel ended without final/aborted: a disconnect, an idle run, or
            // the close after an error state.
            writer.finish(false).await?;
            return Ok(if errored {
                TurnOutcome::Errored
            } else {
                TurnOutcome::EndedAbnormally
            });
        };

        match event.state {
            ChatState::Delta => {
                if let Some(text) = event.text() {
                    writer.feed(&text).await?;
                }
            }
            ChatState::Final => {
                if let Some(text) = event.text() {
                    writer.feed(&text).await?;
                }
                writer.finish(false).await?;
                return Ok(TurnOutcome::Completed);
            }
            ChatState::Aborted => {
                if let Some(text) = event.text() {
                    writer.feed(&text).await?;
                }
                writer.finish(true).await?;
                return Ok(TurnOutcome::Aborted);
            }
            ChatState::Error => {
                errored = true;
                let message = event
                    .error_message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| RUN_FAILED_MESSAGE.to_string());
                debug!(run_id = %event.run_id, error = %message, "Chat run reported an error");
                writer.error(message).await?;
            }
        }
    }
}
