//! A model caller that replays a script.
//!
//! Each call pops the next [`ScriptedTurn`]. When streaming, a turn's chunks
//! are sent first, then its final response. Every [`ModelCall`] received is
//! recorded so tests can assert on what the model was shown.
//!
//! Scripts deserialize from JSON, which is how `clawloop replay` reads them:
//!
//! ```json
//! [
//!   { "role": "tool_call", "tool_calls": [{ "id": "c1", "name": "echo", "arguments": { "text": "hi" } }] },
//!   { "chunks": ["Done", "!"] }
//! ]
//! ```

use async_trait::async_trait;
use clawloop_core::error::ProviderError;
use clawloop_core::message::ToolCallRef;
use clawloop_core::provider::{ModelCall, ModelCaller, ModelResponse, ModelStream, TokenUsage};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// One scripted model round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedTurn {
    /// Deltas sent before the final response when streaming.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,

    /// Pause between chunks.
    #[serde(default)]
    pub chunk_delay_ms: u64,

    #[serde(flatten)]
    pub response: ModelResponse,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self::from(ModelResponse::text(text))
    }

    pub fn tool_calls(calls: Vec<ToolCallRef>) -> Self {
        Self::from(ModelResponse::tool_calls(calls))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::from(ModelResponse::error(message))
    }

    /// A turn streamed as the given chunks; the final text is their concatenation.
    pub fn streamed<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks: Vec<String> = chunks.into_iter().map(Into::into).collect();
        Self {
            response: ModelResponse::text(chunks.concat()),
            chunks,
            chunk_delay_ms: 0,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.response.text = text.into();
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.response.usage = Some(usage);
        self
    }

    /// The final response. Text defaults to the chunks when left empty.
    fn final_response(&self) -> ModelResponse {
        let mut response = self.response.clone();
        response.is_chunk = false;
        if response.text.is_empty() && !self.chunks.is_empty() {
            response.text = self.chunks.concat();
        }
        response
    }
}

impl From<ModelResponse> for ScriptedTurn {
    fn from(response: ModelResponse) -> Self {
        Self {
            response,
            ..Self::default()
        }
    }
}

/// Replays scripted turns in order and records every call.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    calls: Mutex<Vec<ModelCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedModel {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Parse a JSON array of turns.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn push(&self, turn: ScriptedTurn) {
        lock(&self.turns).push_back(turn);
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<ModelCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.turns).len()
    }

    fn next_turn(&self, call: ModelCall) -> Result<ScriptedTurn, ProviderError> {
        let round = {
            let mut calls = lock(&self.calls);
            calls.push(call);
            calls.len()
        };
        lock(&self.turns)
            .pop_front()
            .ok_or_else(|| ProviderError::ModelSide(format!("script exhausted at call #{round}")))
    }
}

#[async_trait]
impl ModelCaller for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn call(&self, call: ModelCall) -> Result<ModelResponse, ProviderError> {
        Ok(self.next_turn(call)?.final_response())
    }

    async fn stream(&self, call: ModelCall) -> Result<ModelStream, ProviderError> {
        let turn = self.next_turn(call)?;
        let (tx, rx) = mpsc::channel(turn.chunks.len() + 1);
        tokio::spawn(async move {
            for chunk in &turn.chunks {
                if turn.chunk_delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(turn.chunk_delay_ms)).await;
                }
                if tx.send(Ok(ModelResponse::chunk(chunk))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(turn.final_response())).await;
        });
        Ok(rx)
    }
}
