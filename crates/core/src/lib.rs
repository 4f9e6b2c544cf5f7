//! # clawloop core
//!
//! Domain types and collaborator traits for the clawloop tool-calling agent
//! engine. This crate has no runtime logic of its own: it defines the data
//! model (messages, tools, model responses, events) and the seams every
//! other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here: the model caller, remote
//! tool endpoints, lifecycle hooks and transcript persistence. This enables:
//! - Swapping backends without touching the runner
//! - Easy testing with scripted/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod agent;
pub mod error;
pub mod event;
pub mod hooks;
pub mod message;
pub mod provider;
pub mod tool;
pub mod transcript;

// Re-export key types at crate root for ergonomics
pub use agent::{RunContext, RunState, RunStats, StopHandle};
pub use error::{Error, HookError, ProviderError, Result, ToolError};
pub use event::{AgentEvent, EventContent, EventKind, EventSink};
pub use hooks::{AgentHooks, NoopHooks};
pub use message::{ContentPart, ConversationId, Message, Role, ToolCallRef};
pub use provider::{
    ModelCall, ModelCaller, ModelRequest, ModelResponse, ModelStream, ResponseRole, TokenUsage,
    ToolCallsResult, ToolDefinition,
};
pub use tool::{
    DelegateSpec, RemoteCallResult, RemoteContent, RemoteToolClient, Tool, ToolContext,
    ToolHandler, ToolKind, ToolOutcome, ToolReply, ToolResult, ToolSet,
};
pub use transcript::{InMemoryTranscriptStore, TranscriptStore};
