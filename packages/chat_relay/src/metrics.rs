//! Relay metrics for observability
//!
//! Counters for chat turns and the events written to browsers.

use gateway_client::ConnectionStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::relay::{RelayEvent, TurnOutcome};

/// Process-wide relay metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Turn metrics
    /// Chat streams currently open
    pub active_streams: AtomicU64,
    pub turns_started: AtomicU64,
    /// Turns that ended with a `final` run
    pub turns_completed: AtomicU64,
    pub turns_aborted: AtomicU64,
    /// Turns whose run reported an error
    pub turns_errored: AtomicU64,
    /// Turns whose run stopped without a terminal state
    pub turns_abnormal: AtomicU64,
    /// Turns that never got a run (connect or `chat.send` failed)
    pub turns_start_failed: AtomicU64,
    /// Turns whose browser left early
    pub turns_client_gone: AtomicU64,

    // Event metrics
    pub deltas_emitted: AtomicU64,
    pub markers_emitted: AtomicU64,
    pub errors_emitted: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn turn_started(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.turns_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_finished(&self, outcome: TurnOutcome) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
        let counter = match outcome {
            TurnOutcome::Completed => &self.turns_completed,
            TurnOutcome::Aborted => &self.turns_aborted,
            TurnOutcome::Errored => &self.turns_errored,
            TurnOutcome::EndedAbnormally => &self.turns_abnormal,
            TurnOutcome::StartFailed => &self.turns_start_failed,
            TurnOutcome::ClientGone => &self.turns_client_gone,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an event on its way to the browser.
    pub fn event_emitted(&self, event: &RelayEvent) {
        let counter = match event {
            RelayEvent::Delta { .. } => &self.deltas_emitted,
            RelayEvent::Dashboard { .. } | RelayEvent::Render { .. } => &self.markers_emitted,
            RelayEvent::Error { .. } => &self.errors_emitted,
            RelayEvent::Done { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            turns: TurnMetrics {
                started: self.turns_started.load(Ordering::Relaxed),
                completed: self.turns_completed.load(Ordering::Relaxed),
                aborted: self.turns_aborted.load(Ordering::Relaxed),
                errored: self.turns_errored.load(Ordering::Relaxed),
                abnormal: self.turns_abnormal.load(Ordering::Relaxed),
                start_failed: self.turns_start_failed.load(Ordering::Relaxed),
                client_gone: self.turns_client_gone.load(Ordering::Relaxed),
            },
            events: EventMetrics {
                deltas: self.deltas_emitted.load(Ordering::Relaxed),
                markers: self.markers_emitted.load(Ordering::Relaxed),
                errors: self.errors_emitted.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub active_streams: u64,
    pub turns: TurnMetrics,
    pub events: EventMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnMetrics {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub errored: u64,
    pub abnormal: u64,
    pub start_failed: u64,
    pub client_gone: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMetrics {
    pub deltas: u64,
    pub markers: u64,
    pub errors: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub gateway: ConnectionStatus,
    pub active_streams: u64,
    pub uptime_secs: u64,
}
