//! The connection supervisor: one task that owns the socket, the pending
//! request table and the run listeners.
//!
//! Handles and socket tasks only ever talk to it through channels, so every
//! state transition happens inside a single `select!` turn. Leaving
//! `Connected` rejects pending requests and drops listeners before the
//! reconnect timer is armed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::client::{ConnectionState, ConnectionStatus};
use crate::config::GatewayConfig;
use crate::correlator::{PendingRequest, PendingRequests, Responder};
use crate::dispatcher::{InboundEvent, RunListener, RunListeners, classify_event};
use crate::error::GatewayError;
use crate::link::{Link, LinkEvent, spawn_dial};
use crate::protocol::{ErrorShape, Frame, HelloOk, METHOD_CONNECT};

/// Heartbeat interval assumed when the server does not announce one.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(12);
/// The watchdog fires after this many silent heartbeat intervals.
const WATCHDOG_FACTOR: f64 = 2.5;

/// Messages from handles and run streams to the supervisor.
#[derive(Debug)]
pub(crate) enum Command {
    EnsureConnected {
        respond_to: oneshot::Sender<Result<(), GatewayError>>,
    },
    Request {
        id: String,
        method: String,
        params: Value,
        respond_to: Responder,
        run_listener: Option<RunListener>,
    },
    /// The caller timed out; forget the entry so a late response is dropped.
    CancelRequest { id: String },
    Listen {
        run_id: String,
        listener: RunListener,
    },
    Unlisten { run_id: String, listener_id: u64 },
    Destroy { respond_to: oneshot::Sender<()> },
}

#[derive(Debug)]
enum Phase {
    Disconnected,
    Connecting(Handshake),
    Connected,
}

#[derive(Debug)]
enum Handshake {
    Dialing,
    AwaitingChallenge,
    AwaitingHello { request_id: String },
}

pub(crate) struct Supervisor {
    config: Arc<GatewayConfig>,
    commands: mpsc::UnboundedReceiver<Command>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    status: watch::Sender<ConnectionStatus>,

    phase: Phase,
    /// Bumped on every attempt and every disconnect; older socket events are stale.
    epoch: u64,
    link: Option<Link>,
    hello: Option<HelloOk>,
    connected_since: Option<chrono::DateTime<Utc>>,
    destroyed: bool,

    pending: PendingRequests,
    listeners: RunListeners,
    waiters: Vec<oneshot::Sender<Result<(), GatewayError>>>,

    backoff: Backoff,
    tick_interval: Duration,
    connect_deadline: Option<Instant>,
    watchdog_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        config: Arc<GatewayConfig>,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            config,
            commands,
            link_tx,
            link_rx,
            status,
            phase: Phase::Disconnected,
            epoch: 0,
            link: None,
            hello: None,
            connected_since: None,
            destroyed: false,
            pending: PendingRequests::new(),
            listeners: RunListeners::new(),
            waiters: Vec::new(),
            backoff,
            tick_interval: DEFAULT_TICK_INTERVAL,
            connect_deadline: None,
            watchdog_deadline: None,
            reconnect_at: None,
        }
    }

    pub async fn run(mut self) {
        debug!(url = %self.config.url, "Gateway supervisor started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        debug!("All gateway handles dropped");
                        self.destroy();
                        break;
                    }
                },
                Some(event) = self.link_rx.recv() => self.handle_link_event(event),
                () = tokio::time::sleep_until(or_never(self.connect_deadline)), if self.connect_deadline.is_some() => {
                    self.on_connect_timeout();
                }
                () = tokio::time::sleep_until(or_never(self.watchdog_deadline)), if self.watchdog_deadline.is_some() => {
                    self.on_watchdog();
                }
                () = tokio::time::sleep_until(or_never(self.reconnect_at)), if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.start_connecting();
                }
            }
            self.publish_status();
        }

        self.publish_status();
        debug!("Gateway supervisor stopped");
    }

    /// Returns false once the supervisor should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::EnsureConnected { respond_to } => match self.phase {
                Phase::Connected => {
                    let _ = respond_to.send(Ok(()));
                }
                Phase::Connecting(_) => self.waiters.push(respond_to),
                Phase::Disconnected => {
                    self.waiters.push(respond_to);
                    self.reconnect_at = None;
                    self.start_connecting();
                }
            },
            Command::Request {
                id,
                method,
                params,
                respond_to,
                run_listener,
            } => self.send_request(id, method, params, respond_to, run_listener),
            Command::CancelRequest { id } => {
                if self.pending.cancel(&id) {
                    debug!(request_id = %id, "Request abandoned by caller");
                }
            }
            Command::Listen { run_id, listener } => {
                trace!(run_id = %run_id, listener_id = listener.listener_id, "Run listener added");
                self.listeners.add(&run_id, listener);
            }
            Command::Unlisten {
                run_id,
                listener_id,
            } => {
                if self.listeners.remove(&run_id, listener_id) {
                    trace!(run_id = %run_id, listener_id, "Run listener removed");
                }
            }
            Command::Destroy { respond_to } => {
                self.destroy();
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn send_request(
        &mut self,
        id: String,
        method: String,
        params: Value,
        respond_to: Responder,
        run_listener: Option<RunListener>,
    ) {
        let link = match (&self.phase, &self.link) {
            (Phase::Connected, Some(link)) => link,
            _ => {
                let _ = respond_to.send(Err(GatewayError::NotConnected));
                return;
            }
        };

        let frame = Frame::request(id.clone(), method.clone(), params);
        if let Err(e) = link.send_frame(&frame) {
            let _ = respond_to.send(Err(e));
            return;
        }

        trace!(request_id = %id, method = %method, "Request sent");
        self.pending.insert(
            id,
            PendingRequest {
                method,
                respond_to,
                run_listener,
            },
        );
    }

    fn start_connecting(&mut self) {
        if self.destroyed {
            return;
        }
        self.epoch += 1;
        self.phase = Phase::Connecting(Handshake::Dialing);
        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
        info!(
            epoch = self.epoch,
            url = %self.config.url,
            attempt = self.backoff.attempts() + 1,
            "Connecting to gateway"
        );
        spawn_dial(self.config.url.clone(), self.epoch, self.link_tx.clone());
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        if event.epoch() != self.epoch {
            trace!(epoch = event.epoch(), current = self.epoch, "Ignoring stale socket event");
            if let LinkEvent::Opened { link, .. } = event {
                link.close();
            }
            return;
        }

        match event {
            LinkEvent::Opened { link, .. } => {
                self.link = Some(link);
                if let Phase::Connecting(handshake) = &mut self.phase {
                    *handshake = Handshake::AwaitingChallenge;
                }
                debug!(epoch = self.epoch, "Awaiting connect challenge");
            }
            LinkEvent::DialFailed { error, .. } => {
                warn!(epoch = self.epoch, error = %error, "Gateway dial failed");
                self.disconnect(&error, GatewayError::Transport(error.clone()));
            }
            LinkEvent::Text { text, .. } => self.handle_text(&text),
            LinkEvent::Closed { reason, .. } => match self.phase {
                Phase::Connecting(_) => {
                    let reason = format!("closed during handshake: {reason}");
                    self.disconnect(&reason, GatewayError::Transport(reason.clone()));
                }
                Phase::Connected => self.disconnect(&reason, GatewayError::ConnectionLost),
                Phase::Disconnected => {}
            },
        }
    }

    fn handle_text(&mut self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Unparseable frame from gateway");
                return;
            }
        };

        match frame {
            Frame::Event { name, payload, .. } => self.handle_event(&name, payload),
            Frame::Response {
                id,
                ok,
                payload,
                error,
            } => self.handle_response(id, ok, payload, error),
            Frame::Request { method, .. } => {
                debug!(method = %method, "Ignoring gateway-initiated request");
            }
        }
    }

    fn handle_event(&mut self, name: &str, payload: Option<Value>) {
        match classify_event(name, payload) {
            InboundEvent::Challenge => match self.phase {
                Phase::Connecting(Handshake::AwaitingChallenge) => self.send_connect(),
                _ => debug!("Unexpected connect challenge"),
            },
            InboundEvent::Heartbeat => {
                if matches!(self.phase, Phase::Connected) {
                    self.arm_watchdog();
                }
            }
            InboundEvent::Chat(event) => {
                let run_id = event.run_id.clone();
                let state = event.state;
                let delivered = self.listeners.dispatch(event);
                trace!(run_id = %run_id, ?state, delivered, "Chat event dispatched");
            }
            InboundEvent::Malformed { name, error } => {
                warn!(event = %name, error = %error, "Malformed event payload");
            }
            InboundEvent::Other(name) => trace!(event = %name, "Ignoring event"),
        }
    }

    fn send_connect(&mut self) {
        let Some(link) = &self.link else {
            return;
        };
        let request_id = Uuid::new_v4().to_string();
        let sent = serde_json::to_value(self.config.connect_params())
            .map_err(GatewayError::from)
            .and_then(|params| link.send_frame(&Frame::request(&request_id, METHOD_CONNECT, params)));

        match sent {
            Ok(()) => {
                debug!(epoch = self.epoch, "Connect request sent");
                self.phase = Phase::Connecting(Handshake::AwaitingHello { request_id });
            }
            Err(e) => {
                let reason = format!("failed to send connect: {e}");
                self.disconnect(&reason, GatewayError::Transport(reason.clone()));
            }
        }
    }

    fn handle_response(
        &mut self,
        id: String,
        ok: bool,
        payload: Option<Value>,
        error: Option<ErrorShape>,
    ) {
        match &self.phase {
            Phase::Connecting(Handshake::AwaitingHello { request_id }) if *request_id == id => {
                self.finish_handshake(ok, payload, error);
                return;
            }
            Phase::Connecting(_) => {
                let reason = format!("unexpected response {id} during handshake");
                warn!(epoch = self.epoch, reason = %reason, "Gateway handshake failed");
                self.disconnect(&reason, GatewayError::ConnectRejected(reason.clone()));
                return;
            }
            Phase::Disconnected => return,
            Phase::Connected => {}
        }

        if !ok {
            let err = error.map(GatewayError::from).unwrap_or(GatewayError::Remote {
                code: "UNKNOWN".to_string(),
                message: "request failed".to_string(),
                retryable: false,
            });
            if !self.pending.resolve(&id, Err(err)) {
                debug!(request_id = %id, "Discarding error response with no pending request");
            }
            return;
        }

        let Some(pending) = self.pending.take(&id) else {
            debug!(request_id = %id, "Discarding response with no pending request");
            return;
        };
        let PendingRequest {
            method,
            respond_to,
            run_listener,
        } = pending;
        let payload = payload.unwrap_or(Value::Null);

        if let Some(listener) = run_listener {
            match payload.get("runId").and_then(Value::as_str) {
                // The caller timed out before its cancel reached us.
                Some(run_id) if respond_to.is_closed() => {
                    debug!(run_id = %run_id, method = %method, "Caller gone, run listener dropped");
                }
                Some(run_id) => {
                    if self.listeners.add(run_id, listener) {
                        debug!(run_id = %run_id, method = %method, "Run listener registered");
                    } else {
                        debug!(run_id = %run_id, method = %method, "Run listener already closed");
                    }
                }
                None => warn!(method = %method, "Response carried no runId, listener dropped"),
            }
        }
        let _ = respond_to.send(Ok(payload));
    }

    fn finish_handshake(&mut self, ok: bool, payload: Option<Value>, error: Option<ErrorShape>) {
        let hello = if ok {
            payload.as_ref().and_then(HelloOk::from_payload)
        } else {
            None
        };

        let Some(hello) = hello else {
            let reason = match error {
                Some(e) => format!("{}: {}", e.code, e.message),
                None => "handshake answered without hello-ok".to_string(),
            };
            warn!(epoch = self.epoch, reason = %reason, "Gateway rejected connect");
            self.disconnect(&reason, GatewayError::ConnectRejected(reason.clone()));
            return;
        };

        self.tick_interval = hello
            .policy
            .tick_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TICK_INTERVAL);
        self.phase = Phase::Connected;
        self.connect_deadline = None;
        self.connected_since = Some(Utc::now());
        self.backoff.reset();
        self.arm_watchdog();

        info!(
            epoch = self.epoch,
            conn_id = %hello.server.conn_id,
            protocol = hello.protocol,
            tick_ms = self.tick_interval.as_millis() as u64,
            "Connected to gateway"
        );
        self.hello = Some(hello);

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn arm_watchdog(&mut self) {
        self.watchdog_deadline = Some(Instant::now() + self.tick_interval.mul_f64(WATCHDOG_FACTOR));
    }

    fn on_connect_timeout(&mut self) {
        self.connect_deadline = None;
        if matches!(self.phase, Phase::Connecting(_)) {
            warn!(
                epoch = self.epoch,
                timeout_ms = self.config.connect_timeout.as_millis() as u64,
                "Gateway handshake timed out"
            );
            self.disconnect("connect timeout", GatewayError::ConnectTimeout);
        }
    }

    fn on_watchdog(&mut self) {
        self.watchdog_deadline = None;
        if matches!(self.phase, Phase::Connected) {
            warn!(
                epoch = self.epoch,
                tick_ms = self.tick_interval.as_millis() as u64,
                "No heartbeat from gateway, forcing reconnect"
            );
            self.disconnect("heartbeat timeout", GatewayError::ConnectionLost);
        }
    }

    /// Leave the current attempt or connection.
    ///
    /// `waiter_error` goes to callers parked in `ensure_connected`; pending
    /// requests always fail with `ConnectionLost`.
    fn disconnect(&mut self, reason: &str, waiter_error: GatewayError) {
        let was_connected = matches!(self.phase, Phase::Connected);
        self.phase = Phase::Disconnected;
        self.epoch += 1;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.hello = None;
        self.connected_since = None;
        self.connect_deadline = None;
        self.watchdog_deadline = None;

        let rejected = self.pending.reject_all(&GatewayError::ConnectionLost);
        let dropped_runs = self.listeners.clear();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(waiter_error.clone()));
        }

        if self.destroyed {
            return;
        }

        let delay = self.backoff.next_delay();
        self.reconnect_at = Some(Instant::now() + delay);
        if was_connected {
            warn!(
                reason = %reason,
                rejected,
                dropped_runs,
                delay_ms = delay.as_millis() as u64,
                "Gateway connection lost, reconnect scheduled"
            );
        } else {
            info!(
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "Gateway connect attempt failed, reconnect scheduled"
            );
        }
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.reconnect_at = None;
        self.disconnect("destroyed", GatewayError::Destroyed);
        info!("Gateway client destroyed");
    }

    fn publish_status(&self) {
        let state = if self.destroyed {
            ConnectionState::Destroyed
        } else {
            match self.phase {
                Phase::Disconnected => ConnectionState::Disconnected,
                Phase::Connecting(_) => ConnectionState::Connecting,
                Phase::Connected => ConnectionState::Connected,
            }
        };
        let status = ConnectionStatus {
            state,
            conn_id: self.hello.as_ref().map(|h| h.server.conn_id.clone()),
            protocol: self.hello.as_ref().map(|h| h.protocol),
            tick_interval_ms: self
                .hello
                .as_ref()
                .map(|_| self.tick_interval.as_millis() as u64),
            connected_since: self.connected_since,
            reconnect_attempts: self.backoff.attempts(),
            pending_requests: self.pending.len(),
            active_runs: self.listeners.run_count(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

fn or_never(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}
