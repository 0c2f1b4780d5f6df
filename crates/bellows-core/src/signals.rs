//! In-process lifecycle signals.
//!
//! Every lifecycle event is dispatched twice: here, to cheap in-process
//! listeners, and out of process through the messaging exchanges (see
//! [`crate::notifications`]). The hub is a broadcast channel; senders never
//! block and a hub with no subscribers drops the signal.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::RepositoryId;

/// Lifecycle events published by the orchestration core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BuildAdded,
    BuildStarted,
    BuildFinished,
    BuildCancelled,
    StepStarted,
    StepFinished,
    StepOutputArrived,
    BuildSetAdded,
    BuildSetStarted,
    BuildSetFinished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BuildAdded => "build-added",
            EventKind::BuildStarted => "build-started",
            EventKind::BuildFinished => "build-finished",
            EventKind::BuildCancelled => "build-cancelled",
            EventKind::StepStarted => "step-started",
            EventKind::StepFinished => "step-finished",
            EventKind::StepOutputArrived => "step-output-arrived",
            EventKind::BuildSetAdded => "buildset-added",
            EventKind::BuildSetStarted => "buildset-started",
            EventKind::BuildSetFinished => "buildset-finished",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A signal sent through the in-process hub.
#[derive(Debug, Clone)]
pub struct Signal {
    pub repository_id: RepositoryId,
    pub event: EventKind,
    pub payload: Value,
}

/// Broadcast hub for in-process signals.
#[derive(Debug, Clone)]
pub struct SignalHub {
    tx: broadcast::Sender<Signal>,
}

impl SignalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Subscribes to all signals. Slow subscribers may miss signals
    /// (broadcast semantics); listeners that must not lose events belong
    /// on the exchanges instead.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    pub fn send(&self, repository_id: RepositoryId, event: EventKind, payload: Value) {
        let _ = self.tx.send(Signal {
            repository_id,
            event,
            payload,
        });
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}
