//! Output events and the ordered sink they flow into.
//!
//! The sink is a thin wrapper over an unbounded `tokio::sync::mpsc` channel,
//! so events arrive in exactly the order the run produced them.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The kind of an output event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Partial text while the model is still generating.
    StreamingDelta,
    /// A tool is about to be invoked.
    ToolCall,
    /// A tool produced (part of) its result.
    ToolCallResult,
    /// The final model answer of a run.
    LlmResult,
    /// A failure surfaced to the recipient.
    Err,
}

/// Event payload: text or a binary attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventContent {
    Text { text: String },
    Attachment {
        mime_type: String,
        /// Base64 payload.
        data: String,
    },
}

/// One event on the output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    pub content: EventContent,

    /// Intermediate notification emitted before a tool's final result.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl AgentEvent {
    fn text_event(kind: EventKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            call_id: None,
            tool_name: None,
            content: EventContent::Text { text: text.into() },
            partial: false,
        }
    }

    pub fn streaming_delta(text: impl Into<String>) -> Self {
        Self::text_event(EventKind::StreamingDelta, text)
    }

    /// The text payload is the JSON-encoded arguments.
    pub fn tool_call(call_id: &str, tool_name: &str, arguments: &serde_json::Value) -> Self {
        let mut event = Self::text_event(EventKind::ToolCall, arguments.to_string());
        event.call_id = Some(call_id.to_string());
        event.tool_name = Some(tool_name.to_string());
        event
    }

    pub fn tool_call_result(call_id: &str, tool_name: &str, text: impl Into<String>) -> Self {
        let mut event = Self::text_event(EventKind::ToolCallResult, text);
        event.call_id = Some(call_id.to_string());
        event.tool_name = Some(tool_name.to_string());
        event
    }

    pub fn llm_result(text: impl Into<String>) -> Self {
        Self::text_event(EventKind::LlmResult, text)
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self::text_event(EventKind::Err, message)
    }

    pub fn with_content(mut self, content: EventContent) -> Self {
        self.content = content;
        self
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            EventContent::Text { text } => Some(text),
            EventContent::Attachment { .. } => None,
        }
    }

    /// Wire name of this event's kind.
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::StreamingDelta => "streaming_delta",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolCallResult => "tool_call_result",
            EventKind::LlmResult => "llm_result",
            EventKind::Err => "err",
        }
    }
}

/// Ordered output sink. Cloning shares the same underlying channel.
///
/// A discarding sink (the default) drops everything; delegated sub-agents
/// run on one so their intermediate output never reaches the recipient.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that observes it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Emit an event. A closed receiver is not an error for the run.
    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_preserves_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(AgentEvent::streaming_delta("a"));
        sink.emit(AgentEvent::tool_call("c1", "calc", &serde_json::json!({"x": 1})));
        sink.emit(AgentEvent::llm_result("done"));
        drop(sink);

        let mut kinds = vec![];
        while let Some(event) = rx.recv().await {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds, vec!["streaming_delta", "tool_call", "llm_result"]);
    }

    #[test]
    fn discard_sink_doesnt_panic() {
        EventSink::discard().emit(AgentEvent::err("nobody listening"));
    }

    #[test]
    fn closed_receiver_doesnt_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(AgentEvent::llm_result("late"));
    }

    #[test]
    fn event_serialization_tool_call() {
        let event = AgentEvent::tool_call("call_1", "calculator", &serde_json::json!({"expr": "2+2"}));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"tool_call""#));
        assert!(json.contains(r#""tool_name":"calculator""#));
        assert!(!json.contains("partial"));
    }

    #[test]
    fn attachment_has_no_text() {
        let event = AgentEvent::tool_call_result("c", "img", "").with_content(EventContent::Attachment {
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        });
        assert!(event.text().is_none());
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"kind":"err","content":{"type":"text","text":"boom"}}"#;
        let event: AgentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Err);
        assert_eq!(event.text(), Some("boom"));
    }
}
