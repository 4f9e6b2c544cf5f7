//! Lossy compression of older turns into one condensed note.

use async_trait::async_trait;
use clawloop_core::error::ProviderError;
use clawloop_core::message::{ContentPart, Message, Role};
use clawloop_core::provider::{ModelCall, ModelCaller, ResponseRole};
use std::sync::Arc;
use tracing::debug;

const SUMMARY_INSTRUCTIONS: &str = "Summarize the conversation below for your own later reference. \
Keep facts, decisions, open questions and tool results that may matter later. \
Be concise and write plain prose.";

/// Turns a run of messages into a summary text.
#[async_trait]
pub trait ContextCompressor: Send + Sync {
    async fn compress(&self, messages: &[Message]) -> Result<String, ProviderError>;
}

/// Summarizes through a designated compression model.
pub struct LlmSummaryCompressor {
    caller: Arc<dyn ModelCaller>,
    model: Option<String>,
    instructions: String,
}

impl LlmSummaryCompressor {
    pub fn new(caller: Arc<dyn ModelCaller>, model: Option<String>) -> Self {
        Self {
            caller,
            model,
            instructions: SUMMARY_INSTRUCTIONS.to_string(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

#[async_trait]
impl ContextCompressor for LlmSummaryCompressor {
    async fn compress(&self, messages: &[Message]) -> Result<String, ProviderError> {
        debug!(messages = messages.len(), model = ?self.model, "Compressing older turns");
        let call = ModelCall {
            messages: vec![
                Message::system(&self.instructions),
                Message::user(render_transcript(messages)),
            ],
            tools: vec![],
            model: self.model.clone(),
            stream: false,
        };
        let response = self.caller.call(call).await?;
        if response.role == ResponseRole::Error {
            return Err(ProviderError::ModelSide(response.text));
        }
        Ok(response.text)
    }
}

/// Render messages as plain text for the summarizer.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let who = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool result",
        };
        for part in &msg.parts {
            match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    out.push_str(&format!("{who}: {text}\n"));
                }
                ContentPart::ToolCall(call) => {
                    out.push_str(&format!("{who} called {}({})\n", call.name, call.arguments));
                }
                ContentPart::Image { url } => out.push_str(&format!("{who}: [image {url}]\n")),
                _ => {}
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawloop_core::message::ToolCallRef;

    #[test]
    fn transcript_rendering_skips_reasoning() {
        let msgs = vec![
            Message::user("what's 2+2"),
            Message::assistant_tool_calls(
                "",
                Some(("hidden".into(), None)),
                vec![ToolCallRef::new("c1", "calc", serde_json::json!({"e": "2+2"}))],
            ),
            Message::tool_result("c1", "4"),
        ];
        let text = render_transcript(&msgs);
        assert!(text.contains("user: what's 2+2"));
        assert!(text.contains(r#"assistant called calc({"e":"2+2"})"#));
        assert!(text.contains("tool result: 4"));
        assert!(!text.contains("hidden"));
    }
}
