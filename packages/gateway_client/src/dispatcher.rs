//! Routing of out-of-band events: heartbeats, chat run events, the rest.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{ChatEvent, EVENT_CHAT, EVENT_CONNECT_CHALLENGE, EVENT_TICK};

/// One consumer of a run's events.
#[derive(Debug)]
pub(crate) struct RunListener {
    pub listener_id: u64,
    pub tx: mpsc::UnboundedSender<ChatEvent>,
}

/// What an inbound event means to the supervisor.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    Challenge,
    Heartbeat,
    Chat(ChatEvent),
    Malformed { name: String, error: String },
    Other(String),
}

pub(crate) fn classify_event(name: &str, payload: Option<Value>) -> InboundEvent {
    match name {
        EVENT_CONNECT_CHALLENGE => InboundEvent::Challenge,
        EVENT_TICK => InboundEvent::Heartbeat,
        EVENT_CHAT => match serde_json::from_value(payload.unwrap_or(Value::Null)) {
            Ok(event) => InboundEvent::Chat(event),
            Err(e) => InboundEvent::Malformed {
                name: name.to_string(),
                error: e.to_string(),
            },
        },
        other => InboundEvent::Other(other.to_string()),
    }
}

/// Run id -> listener id -> sender.
#[derive(Default)]
pub(crate) struct RunListeners {
    runs: HashMap<String, HashMap<u64, mpsc::UnboundedSender<ChatEvent>>>,
}

impl RunListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow `run_id`. A listener whose receiver is already gone is not kept.
    pub fn add(&mut self, run_id: &str, listener: RunListener) -> bool {
        if listener.tx.is_closed() {
            return false;
        }
        self.runs
            .entry(run_id.to_string())
            .or_default()
            .insert(listener.listener_id, listener.tx);
        true
    }

    pub fn remove(&mut self, run_id: &str, listener_id: u64) -> bool {
        let Some(listeners) = self.runs.get_mut(run_id) else {
            return false;
        };
        let removed = listeners.remove(&listener_id).is_some();
        if listeners.is_empty() {
            self.runs.remove(run_id);
        }
        removed
    }

    /// Deliver `event` to every listener of its run. Returns how many got it.
    ///
    /// A terminal event removes the run entry afterwards, which closes each
    /// consumer's channel behind the event.
    pub fn dispatch(&mut self, event: ChatEvent) -> usize {
        let terminal = event.state.is_terminal();
        let Some(listeners) = self.runs.get_mut(&event.run_id) else {
            return 0;
        };

        listeners.retain(|_, tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in listeners.values() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        if terminal || listeners.is_empty() {
            self.runs.remove(&event.run_id);
        }
        delivered
    }

    /// Drop every listener. Returns how many runs were being followed.
    pub fn clear(&mut self) -> usize {
        let count = self.runs.len();
        self.runs.clear();
        count
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn listener_count(&self, run_id: &str) -> usize {
        self.runs.get(run_id).map_or(0, HashMap::len)
    }
}
