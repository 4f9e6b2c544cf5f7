//! Tools (capabilities) and the capability set.
//!
//! A tool is a named, schema-described unit of functionality the model may
//! ask to invoke. How it runs is an explicit [`ToolKind`]: a local handler, a
//! remote tool-protocol endpoint, a delegated sub-agent, or a detached
//! background job. The dispatcher matches on the kind exhaustively.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agent::RunContext;
use crate::error::ToolError;
use crate::event::{AgentEvent, EventContent};
use crate::message::Message;
use crate::provider::ToolDefinition;

/// What a handler hands back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolReply {
    /// A value for the model to read next round.
    Text(String),
    /// The handler already delivered its output to the recipient; the run
    /// short-circuits to `Done`.
    SentDirectly,
}

impl ToolReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

/// Per-call view handed to a handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run: RunContext,
    pub call_id: String,
    pub tool_name: String,
}

impl ToolContext {
    /// Emit an intermediate notification before the final result.
    pub fn notify(&self, text: impl Into<String>) {
        self.run.sink.emit(
            AgentEvent::tool_call_result(&self.call_id, &self.tool_name, text).partial(),
        );
    }

    /// Deliver binary content straight to the recipient.
    pub fn send_attachment(&self, mime_type: impl Into<String>, data: impl Into<String>) {
        self.run.sink.emit(
            AgentEvent::tool_call_result(&self.call_id, &self.tool_name, "")
                .with_content(EventContent::Attachment {
                    mime_type: mime_type.into(),
                    data: data.into(),
                })
                .partial(),
        );
    }
}

/// A locally executed tool body (used by LOCAL_HANDLER and BACKGROUND tools).
///
/// Arguments arrive already filtered against the tool's declared schema.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<ToolReply, ToolError>;
}

/// Typed content returned by a remote tool-protocol endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteContent {
    Text {
        text: String,
    },
    Image {
        /// Base64 payload.
        data: String,
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Base64 payload for binary resources.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blob: Option<String>,
    },
}

/// Result of one remote tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteCallResult {
    #[serde(default)]
    pub content: Vec<RemoteContent>,
    #[serde(default)]
    pub is_error: bool,
}

/// A connection to an external tool-protocol endpoint.
#[async_trait]
pub trait RemoteToolClient: Send + Sync {
    /// Name of the endpoint, for logs.
    fn endpoint(&self) -> &str;

    /// Forward a call verbatim.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<RemoteCallResult, ToolError>;
}

/// How a delegated sub-agent is set up.
#[derive(Debug, Clone, Default)]
pub struct DelegateSpec {
    /// System prompt of the sub-agent.
    pub instructions: String,
    /// Tools the sub-agent may use; independent of the parent's set.
    pub tools: ToolSet,
    /// Fixed opening dialog seeded before the delegated input.
    pub opening_dialog: Vec<Message>,
    pub model: Option<String>,
    /// Step budget for the nested run; the dispatcher default applies when unset.
    pub max_steps: Option<usize>,
}

/// Execution kind of a tool.
#[derive(Clone)]
pub enum ToolKind {
    LocalHandler(Arc<dyn ToolHandler>),
    RemoteProtocol {
        client: Arc<dyn RemoteToolClient>,
        /// Name of the tool on the remote side.
        remote_name: String,
    },
    DelegatedAgent(Box<DelegateSpec>),
    Background(Arc<dyn ToolHandler>),
}

impl ToolKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LocalHandler(_) => "local_handler",
            Self::RemoteProtocol { .. } => "remote_protocol",
            Self::DelegatedAgent(_) => "delegated_agent",
            Self::Background(_) => "background",
        }
    }
}

impl std::fmt::Debug for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoteProtocol {
                client,
                remote_name,
            } => f
                .debug_struct("RemoteProtocol")
                .field("endpoint", &client.endpoint())
                .field("remote_name", remote_name)
                .finish(),
            Self::DelegatedAgent(spec) => f.debug_tuple("DelegatedAgent").field(spec).finish(),
            other => f.write_str(other.label()),
        }
    }
}

/// A capability the model may call.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
    pub kind: ToolKind,
    /// Inactive tools stay registered but are neither disclosed nor resolved.
    pub active: bool,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Schema used by delegated agents: a single free-text `input`.
pub fn delegate_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "input": {
                "type": "string",
                "description": "The task or question to hand over"
            }
        },
        "required": ["input"]
    })
}

impl Tool {
    fn build(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        kind: ToolKind,
    ) -> Self {
        let parameters = if parameters.is_null() {
            empty_schema()
        } else {
            parameters
        };
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            kind,
            active: true,
        }
    }

    pub fn local(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self::build(name, description, parameters, ToolKind::LocalHandler(handler))
    }

    pub fn background(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self::build(name, description, parameters, ToolKind::Background(handler))
    }

    /// A remote tool exposed under the same name it has on the endpoint.
    pub fn remote(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        client: Arc<dyn RemoteToolClient>,
    ) -> Self {
        let name = name.into();
        let kind = ToolKind::RemoteProtocol {
            client,
            remote_name: name.clone(),
        };
        Self::build(name, description, parameters, kind)
    }

    pub fn delegate(
        name: impl Into<String>,
        description: impl Into<String>,
        spec: DelegateSpec,
    ) -> Self {
        Self::build(
            name,
            description,
            delegate_schema(),
            ToolKind::DelegatedAgent(Box::new(spec)),
        )
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Full disclosure: name, description and parameters.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            parameters: Some(self.parameters.clone()),
        }
    }

    /// Light view: name and description only.
    pub fn light(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            parameters: None,
        }
    }

    /// Param-only view: name and parameters, no description.
    pub fn param_only(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: None,
            parameters: Some(self.parameters.clone()),
        }
    }
}

/// Ordered, unique-by-name collection of tools visible for one turn.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<Tool>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Add a tool. A tool with the same name is replaced in place.
    pub fn add(&mut self, tool: Tool) {
        match self.tools.iter_mut().find(|t| t.name == tool.name) {
            Some(slot) => *slot = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn with(mut self, tool: Tool) -> Self {
        self.add(tool);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Tool> {
        let idx = self.tools.iter().position(|t| t.name == name)?;
        Some(self.tools.remove(idx))
    }

    /// Look up a tool by name, active or not.
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Resolve a call target: only active tools are callable.
    pub fn resolve(&self, name: &str) -> std::result::Result<&Tool, ToolError> {
        self.get(name)
            .filter(|t| t.active)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Derive a set holding only the named tools, in this set's order.
    pub fn subset<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> ToolSet {
        let wanted: Vec<&str> = names.into_iter().collect();
        self.tools
            .iter()
            .filter(|t| wanted.contains(&t.name.as_str()))
            .cloned()
            .collect()
    }

    /// Merge another set into this one; the other set wins on name clashes.
    pub fn merge(&mut self, other: ToolSet) {
        for tool in other.tools {
            self.add(tool);
        }
    }

    fn active(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter().filter(|t| t.active)
    }

    /// Full definitions of active tools.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.active().map(Tool::definition).collect()
    }

    /// Light definitions (name + description) of active tools.
    pub fn light_definitions(&self) -> Vec<ToolDefinition> {
        self.active().map(Tool::light).collect()
    }

    /// Param-only definitions (name + parameters) of active tools.
    pub fn param_only_definitions(&self) -> Vec<ToolDefinition> {
        self.active().map(Tool::param_only).collect()
    }
}

impl FromIterator<Tool> for ToolSet {
    fn from_iter<I: IntoIterator<Item = Tool>>(iter: I) -> Self {
        let mut set = ToolSet::new();
        for tool in iter {
            set.add(tool);
        }
        set
    }
}

/// Uniform outcome of one dispatched call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "content", rename_all = "snake_case")]
pub enum ToolOutcome {
    Value(String),
    /// Output already reached the recipient through another path.
    SentDirectly,
    Error(String),
}

impl ToolOutcome {
    /// Text recorded in the tool-role message.
    pub fn transcript_text(&self) -> String {
        match self {
            Self::Value(text) => text.clone(),
            Self::SentDirectly => "The result has been sent to the user directly.".into(),
            Self::Error(reason) => format!("error: {reason}"),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<ToolError> for ToolOutcome {
    fn from(err: ToolError) -> Self {
        Self::Error(err.to_string())
    }
}

/// The result of a dispatched tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    pub tool_name: String,

    pub outcome: ToolOutcome,

    /// Set when the call was detached as a background job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_task: Option<String>,
}

impl ToolResult {
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>, outcome: ToolOutcome) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            outcome,
            background_task: None,
        }
    }

    pub fn to_message(&self) -> Message {
        Message::tool_result(&self.call_id, self.outcome.transcript_text())
    }
}
