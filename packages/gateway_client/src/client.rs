use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::dispatcher::RunListener;
use crate::error::GatewayError;
use crate::protocol::{
    ChatAbortParams, ChatAbortResult, ChatHistory, ChatHistoryParams, ChatInjectParams,
    ChatInjectResult, ChatSendAck, ChatSendParams, METHOD_CHAT_ABORT, METHOD_CHAT_HISTORY,
    METHOD_CHAT_INJECT, METHOD_CHAT_SEND,
};
use crate::stream::ChatRunStream;
use crate::supervisor::{Command, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

/// Snapshot of the connection, republished after every supervisor turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub conn_id: Option<String>,
    pub protocol: Option<u32>,
    pub tick_interval_ms: Option<u64>,
    pub connected_since: Option<DateTime<Utc>>,
    /// Consecutive failed attempts since the last successful connect.
    pub reconnect_attempts: u32,
    pub pending_requests: usize,
    pub active_runs: usize,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            conn_id: None,
            protocol: None,
            tick_interval_ms: None,
            connected_since: None,
            reconnect_attempts: 0,
            pending_requests: 0,
            active_runs: 0,
        }
    }
}

/// Handle to the gateway connection. Clones share one supervisor task.
///
/// The supervisor stops after [`GatewayClient::destroy`] or once every
/// handle and run stream has been dropped.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    config: Arc<GatewayConfig>,
    next_listener_id: Arc<AtomicU64>,
}

impl GatewayClient {
    /// Start the supervisor. Must be called inside a tokio runtime.
    ///
    /// No connection is attempted until the first `ensure_connected`.
    pub fn spawn(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let supervisor = Supervisor::new(config.clone(), commands_rx, status_tx);
        tokio::spawn(supervisor.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            config,
            next_listener_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Resolve once connected, starting an attempt if none is underway.
    ///
    /// A failed attempt is not retried for this caller; the supervisor keeps
    /// reconnecting in the background.
    pub async fn ensure_connected(&self) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::EnsureConnected { respond_to: tx })?;
        match tokio::time::timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Destroyed),
            Err(_) => Err(GatewayError::ConnectTimeout),
        }
    }

    /// Send one request and wait for its response, at most `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        self.request_with_listener(method, params, timeout, None)
            .await
    }

    /// Typed request using the default request timeout.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, GatewayError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let payload = self
            .request(method, params, self.config.request_timeout)
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Start a chat run and follow its events.
    ///
    /// The listener is attached by the supervisor while it resolves the
    /// `chat.send` response, so the stream sees every event of the run.
    pub async fn chat_send(
        &self,
        params: ChatSendParams,
    ) -> Result<(ChatSendAck, ChatRunStream), GatewayError> {
        let listener_id = self.next_listener_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = RunListener { listener_id, tx };

        let params = serde_json::to_value(&params)?;
        let payload = self
            .request_with_listener(
                METHOD_CHAT_SEND,
                params,
                self.config.request_timeout,
                Some(listener),
            )
            .await?;
        let ack: ChatSendAck = serde_json::from_value(payload)?;
        debug!(run_id = %ack.run_id, status = ?ack.status, "Chat run started");

        let stream = ChatRunStream::new(
            ack.run_id.clone(),
            listener_id,
            rx,
            self.config.run_idle_timeout,
            self.commands.clone(),
        );
        Ok((ack, stream))
    }

    /// Attach another independent listener to a run already in progress.
    pub fn subscribe_run(&self, run_id: &str) -> Result<ChatRunStream, GatewayError> {
        let listener_id = self.next_listener_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Command::Listen {
            run_id: run_id.to_string(),
            listener: RunListener { listener_id, tx },
        })?;
        Ok(ChatRunStream::new(
            run_id.to_string(),
            listener_id,
            rx,
            self.config.run_idle_timeout,
            self.commands.clone(),
        ))
    }

    pub async fn chat_history(&self, params: &ChatHistoryParams) -> Result<ChatHistory, GatewayError> {
        self.call(METHOD_CHAT_HISTORY, params).await
    }

    /// Ask the gateway to stop a run (or every run of the session).
    pub async fn chat_abort(&self, params: &ChatAbortParams) -> Result<ChatAbortResult, GatewayError> {
        self.call(METHOD_CHAT_ABORT, params).await
    }

    pub async fn chat_inject(
        &self,
        params: &ChatInjectParams,
    ) -> Result<ChatInjectResult, GatewayError> {
        self.call(METHOD_CHAT_INJECT, params).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == ConnectionState::Connected
    }

    /// Shut the connection down for good. Later calls fail with `Destroyed`.
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Destroy { respond_to: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn request_with_listener(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        run_listener: Option<RunListener>,
    ) -> Result<Value, GatewayError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.send(Command::Request {
            id: id.clone(),
            method: method.to_string(),
            params,
            respond_to: tx,
            run_listener,
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Destroyed),
            Err(_) => {
                debug!(request_id = %id, method, "Request timed out");
                let _ = self.commands.send(Command::CancelRequest { id });
                Err(GatewayError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .map_err(|_| GatewayError::Destroyed)
    }

    fn next_listener_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }
}
