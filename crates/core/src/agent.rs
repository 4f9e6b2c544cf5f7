//! Run state, run statistics and the per-run execution context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::event::EventSink;
use crate::message::ConversationId;
use crate::provider::TokenUsage;

/// Lifecycle of one agent run. Transitions only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Error)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Timing and token accounting for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Milliseconds from run start to the first model output.
    pub time_to_first_token_ms: Option<u64>,
    /// Cumulative usage across every model call of the run.
    pub usage: TokenUsage,
    pub model_calls: usize,
    pub tool_calls: usize,
}

impl RunStats {
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Record the first output of the run; later calls are no-ops.
    pub fn record_first_token(&mut self) {
        if self.time_to_first_token_ms.is_some() {
            return;
        }
        if let Some(started) = self.started_at {
            let elapsed = Utc::now().signed_duration_since(started).num_milliseconds();
            self.time_to_first_token_ms = Some(elapsed.max(0) as u64);
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.ended_at?);
        Some(end.signed_duration_since(start).num_milliseconds().max(0) as u64)
    }
}

/// Shared flag a caller flips to stop a run.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution context of one run, visible to hooks and tool handlers.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub conversation_id: ConversationId,
    pub sink: EventSink,
    pub stop: StopHandle,
    /// Free-form values the embedding application wants hooks to see.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RunContext {
    pub fn new(conversation_id: ConversationId, sink: EventSink) -> Self {
        Self {
            conversation_id,
            sink,
            stop: StopHandle::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Same conversation and stop flag, but output goes nowhere.
    pub fn detached(&self) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            sink: EventSink::discard(),
            stop: self.stop.clone(),
            metadata: self.metadata.clone(),
        }
    }
}
