//! Lifecycle hooks around a run and around each tool call.
//!
//! Every method has a no-op default. A returned error is logged by the
//! runner and otherwise ignored; hooks can never abort a run.

use async_trait::async_trait;

use crate::agent::RunContext;
use crate::error::HookError;
use crate::provider::ModelResponse;
use crate::tool::{Tool, ToolResult};

#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_agent_begin(&self, _ctx: &RunContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_agent_done(
        &self,
        _ctx: &RunContext,
        _response: &ModelResponse,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_tool_start(
        &self,
        _ctx: &RunContext,
        _tool: &Tool,
        _arguments: &serde_json::Value,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// `result` is `None` when the tool delivered its output directly.
    async fn on_tool_end(
        &self,
        _ctx: &RunContext,
        _tool: &Tool,
        _arguments: &serde_json::Value,
        _result: Option<&ToolResult>,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl AgentHooks for NoopHooks {}
