//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token, plus a fixed
//! per-message overhead. Good enough to keep a window under budget when no
//! real tokenizer is plugged in.

use clawloop_core::message::{ContentPart, Message};
use clawloop_core::provider::ToolDefinition;

/// Per-message overhead for role markers and delimiters.
const MESSAGE_OVERHEAD: usize = 4;

/// Rough cost of an image reference.
const IMAGE_TOKENS: usize = 85;

/// Counts the tokens a window will cost.
///
/// When one is supplied to the context manager it is authoritative.
pub trait TokenCounter: Send + Sync {
    fn count(&self, messages: &[Message]) -> usize;
}

/// The character heuristic as a [`TokenCounter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, messages: &[Message]) -> usize {
        estimate_messages_tokens(messages)
    }
}

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

fn estimate_part_tokens(part: &ContentPart) -> usize {
    match part {
        ContentPart::Text { text } | ContentPart::Reasoning { text, .. } => estimate_tokens(text),
        ContentPart::Image { .. } => IMAGE_TOKENS,
        ContentPart::ToolCall(call) => {
            estimate_tokens(&call.name) + estimate_tokens(&call.arguments.to_string())
        }
    }
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    MESSAGE_OVERHEAD + message.parts.iter().map(estimate_part_tokens).sum::<usize>()
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate tokens for a slice of tool definitions (serialized as JSON).
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    tools
        .iter()
        .map(|t| estimate_tokens(&serde_json::to_string(t).unwrap_or_default()))
        .sum()
}
