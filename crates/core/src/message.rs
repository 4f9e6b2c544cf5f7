//! Conversation message types.
//!
//! A message is a role plus an ordered list of content parts. The working
//! message list the model sees is a `Vec<Message>`; the runner owns it for
//! the duration of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRef {
    /// Call id assigned by the model; tool-role results echo it back.
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a JSON value
    #[serde(default)]
    pub arguments: serde_json::Value,

    /// Vendor-specific payload that must round-trip unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl ToolCallRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            extra: None,
        }
    }
}

/// One ordered piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Image {
        url: String,
    },
    ToolCall(ToolCallRef),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Ordered content parts
    pub parts: Vec<ContentPart>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Excluded from the transcript handed to persistence.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_persist: bool,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_parts(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
            tool_call_id: None,
            no_persist: false,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_parts(Role::User, vec![ContentPart::text(content)])
    }

    /// Create a user message from explicit parts.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self::with_parts(Role::User, parts)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_parts(Role::Assistant, vec![ContentPart::text(content)])
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_parts(Role::System, vec![ContentPart::text(content)])
    }

    /// Create an assistant message carrying tool-call directives.
    ///
    /// Empty text and reasoning are omitted so the parts list holds only
    /// what the model actually produced.
    pub fn assistant_tool_calls(
        text: &str,
        reasoning: Option<(String, Option<String>)>,
        calls: Vec<ToolCallRef>,
    ) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 2);
        if let Some((text, signature)) = reasoning {
            parts.push(ContentPart::Reasoning { text, signature });
        }
        if !text.is_empty() {
            parts.push(ContentPart::text(text));
        }
        parts.extend(calls.into_iter().map(ContentPart::ToolCall));
        Self::with_parts(Role::Assistant, parts)
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_parts(Role::Tool, vec![ContentPart::text(content)]);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Mark the message as transient (never persisted).
    pub fn transient(mut self) -> Self {
        self.no_persist = true;
        self
    }

    /// Concatenated text parts (reasoning excluded).
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool-call directives carried by this message, in order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRef> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }
}
