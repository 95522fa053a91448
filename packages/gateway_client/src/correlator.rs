//! Pending request table owned by the supervisor.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::dispatcher::RunListener;
use crate::error::GatewayError;

pub(crate) type Responder = oneshot::Sender<Result<Value, GatewayError>>;

pub(crate) struct PendingRequest {
    pub method: String,
    pub respond_to: Responder,
    /// Registered against the run id found in a successful response.
    pub run_listener: Option<RunListener>,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: String, request: PendingRequest) {
        self.entries.insert(id, request);
    }

    /// Remove the entry for `id` so the caller can finish it.
    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    /// Complete the entry for `id`. Returns false when nothing was waiting.
    pub fn resolve(&mut self, id: &str, result: Result<Value, GatewayError>) -> bool {
        match self.entries.remove(id) {
            Some(pending) => {
                let _ = pending.respond_to.send(result);
                true
            }
            None => false,
        }
    }

    /// Forget `id` without answering; its caller already gave up.
    pub fn cancel(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every pending request with `err`. Returns how many were waiting.
    pub fn reject_all(&mut self, err: &GatewayError) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.respond_to.send(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
