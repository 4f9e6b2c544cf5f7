//! Model caller contract: the abstraction over LLM backends.
//!
//! A caller receives the current working window and returns either one final
//! response or, when streaming, zero or more chunk responses followed by
//! exactly one final (non-chunk) response. The wire protocol to any concrete
//! backend lives outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::{ContentPart, Message, ToolCallRef};
use crate::tool::ToolSet;

/// A tool definition as disclosed to the model.
///
/// Fields are optional so the same type can carry the full view, the light
/// view (no parameters) and the param-only view (no description).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema describing the tool's parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Token usage for one model round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens not served from a prompt cache.
    #[serde(default)]
    pub input_fresh: u64,
    #[serde(default)]
    pub input_cached: u64,
    #[serde(default)]
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input_fresh: u64, input_cached: u64, output: u64) -> Self {
        Self {
            input_fresh,
            input_cached,
            output,
        }
    }

    pub fn input(&self) -> u64 {
        self.input_fresh + self.input_cached
    }

    pub fn total(&self) -> u64 {
        self.input() + self.output
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_fresh += rhs.input_fresh;
        self.input_cached += rhs.input_cached;
        self.output += rhs.output;
    }
}

/// One assistant tool-call message paired with the tool results it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallsResult {
    pub calls: Message,
    pub results: Vec<Message>,
}

impl ToolCallsResult {
    /// Flatten into transcript order: the assistant message, then its results.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.results.len() + 1);
        out.push(self.calls.clone());
        out.extend(self.results.iter().cloned());
        out
    }
}

/// Everything one agent run starts from.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// The user's prompt for this turn.
    pub prompt: String,

    /// Image references attached to the prompt.
    pub image_urls: Vec<String>,

    /// Parts appended after the main user content (reminders, quoted
    /// context, captions).
    pub extra_parts: Vec<ContentPart>,

    pub system_prompt: String,

    /// Tools visible to the model for this run.
    pub tools: ToolSet,

    /// Prior conversation, oldest first.
    pub history: Vec<Message>,

    /// Tool-call results to fold back in after the user turn.
    pub tool_results: Vec<ToolCallsResult>,

    /// Explicit model override.
    pub model: Option<String>,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Build the user message for this turn: prompt text, then images, then
    /// the extra parts. Returns `None` when there is no user content at all.
    pub fn user_message(&self) -> Option<Message> {
        let mut parts = Vec::new();
        if !self.prompt.is_empty() {
            parts.push(ContentPart::text(&self.prompt));
        }
        parts.extend(
            self.image_urls
                .iter()
                .map(|url| ContentPart::Image { url: url.clone() }),
        );
        parts.extend(self.extra_parts.iter().cloned());
        if parts.is_empty() {
            None
        } else {
            Some(Message::user_parts(parts))
        }
    }
}

/// What a single model invocation receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCall {
    /// The working window: system prompt, history, user turn, tool results.
    pub messages: Vec<Message>,

    /// Tools disclosed for this call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub stream: bool,
}

/// Outcome role of a model response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseRole {
    #[default]
    Assistant,
    ToolCall,
    Error,
}

/// A (partial or final) model response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub role: ResponseRole,

    /// Partial chunk produced while streaming.
    #[serde(default)]
    pub is_chunk: bool,

    /// Completion text (a delta when `is_chunk` is set).
    #[serde(default)]
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Opaque signature accompanying the reasoning text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_signature: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRef>,

    /// Usage for this round only; set on final responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    /// A final plain-text answer.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// A final response requesting tool calls.
    pub fn tool_calls(calls: Vec<ToolCallRef>) -> Self {
        Self {
            role: ResponseRole::ToolCall,
            tool_calls: calls,
            ..Self::default()
        }
    }

    /// A final response reporting a model-side failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            role: ResponseRole::Error,
            text: message.into(),
            ..Self::default()
        }
    }

    /// A streaming delta.
    pub fn chunk(delta: impl Into<String>) -> Self {
        Self {
            is_chunk: true,
            text: delta.into(),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_reasoning(mut self, text: impl Into<String>, signature: Option<String>) -> Self {
        self.reasoning = Some(text.into());
        self.reasoning_signature = signature;
        self
    }

    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Receiver side of a streamed model call.
pub type ModelStream = mpsc::Receiver<std::result::Result<ModelResponse, ProviderError>>;

/// The model-call collaborator.
///
/// The runner calls `call()` or `stream()` without knowing which backend is
/// behind it.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// A human-readable name for this caller (e.g., "openai", "scripted").
    fn name(&self) -> &str;

    /// Send a window and get a single final response.
    async fn call(&self, call: ModelCall) -> std::result::Result<ModelResponse, ProviderError>;

    /// Send a window and get chunk responses followed by one final response.
    ///
    /// Default implementation calls `call()` and yields its result as the
    /// only (final) item.
    async fn stream(&self, call: ModelCall) -> std::result::Result<ModelStream, ProviderError> {
        let response = self.call(call).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(response)).await;
        Ok(rx)
    }
}
