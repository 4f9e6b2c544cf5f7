//! Tool execution dispatcher.
//!
//! Resolves one requested call to a capability and runs it according to
//! its [`ToolKind`]. Every failure (unknown tool, handler error, panic,
//! timeout, remote error) is folded into a [`ToolOutcome::Error`] for that
//! call alone; nothing escapes to the runner.

use clawloop_config::AppConfig;
use clawloop_core::agent::{RunContext, RunState};
use clawloop_core::error::{HookError, ToolError};
use clawloop_core::event::AgentEvent;
use clawloop_core::hooks::AgentHooks;
use clawloop_core::message::{Message, ToolCallRef};
use clawloop_core::provider::{ModelCaller, ModelRequest};
use clawloop_core::tool::{
    DelegateSpec, RemoteToolClient, Tool, ToolContext, ToolHandler, ToolKind, ToolOutcome,
    ToolReply, ToolResult, ToolSet,
};
use clawloop_tools::{call_remote, filter_arguments};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::background::BackgroundCompletion;
use crate::runner::AgentRunner;

/// Default step budget of a delegated sub-agent.
pub const DEFAULT_NESTED_STEPS: usize = 10;

/// Borrowed view of the calling run.
pub struct DispatchScope<'a> {
    pub ctx: &'a RunContext,
    pub hooks: &'a dyn AgentHooks,
    pub tools: &'a ToolSet,
    pub system_prompt: &'a str,
    /// Conversation so far, handed to background follow-ups.
    pub history: &'a [Message],
    pub model: Option<&'a str>,
}

/// Runs tool calls. Cheap to clone; nested runs get a clone.
#[derive(Clone)]
pub struct ToolDispatcher {
    caller: Arc<dyn ModelCaller>,
    timeout: Duration,
    nested_max_steps: usize,
    background: Option<mpsc::UnboundedSender<BackgroundCompletion>>,
}

impl ToolDispatcher {
    pub fn new(caller: Arc<dyn ModelCaller>, timeout: Duration) -> Self {
        Self {
            caller,
            timeout,
            nested_max_steps: DEFAULT_NESTED_STEPS,
            background: None,
        }
    }

    /// Tool timeout and nested step budget from config.
    pub fn from_config(caller: Arc<dyn ModelCaller>, config: &AppConfig) -> Self {
        Self::new(caller, config.agent.tool_call_timeout())
            .with_nested_max_steps(config.delegate.max_steps)
    }

    /// Step budget for delegated agents that don't set their own.
    pub fn with_nested_max_steps(mut self, steps: usize) -> Self {
        self.nested_max_steps = steps;
        self
    }

    /// Route background completions to a worker.
    pub fn with_background(mut self, tx: mpsc::UnboundedSender<BackgroundCompletion>) -> Self {
        self.background = Some(tx);
        self
    }

    pub(crate) fn without_background(
        mut self,
    ) -> (Self, Option<mpsc::UnboundedSender<BackgroundCompletion>>) {
        let tx = self.background.take();
        (self, tx)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one call to completion (or, for background tools, to detachment).
    pub async fn dispatch(&self, scope: &DispatchScope<'_>, call: &ToolCallRef) -> ToolResult {
        scope
            .ctx
            .sink
            .emit(AgentEvent::tool_call(&call.id, &call.name, &call.arguments));

        let tool = match scope.tools.resolve(&call.name) {
            Ok(tool) => tool,
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, "Model requested an unknown tool");
                let result = ToolResult::new(&call.id, &call.name, e.into());
                emit_result(scope.ctx, &result);
                return result;
            }
        };

        log_hook_failure(scope.hooks.on_tool_start(scope.ctx, tool, &call.arguments).await);

        let tool_ctx = ToolContext {
            run: scope.ctx.clone(),
            call_id: call.id.clone(),
            tool_name: tool.name.clone(),
        };
        let started = Instant::now();
        let mut background_task = None;

        let outcome = match &tool.kind {
            ToolKind::LocalHandler(handler) => {
                self.run_local(handler, tool, &tool_ctx, &call.arguments).await
            }
            ToolKind::RemoteProtocol {
                client,
                remote_name,
            } => {
                self.run_remote(client.as_ref(), remote_name, &tool_ctx, &call.arguments)
                    .await
            }
            ToolKind::DelegatedAgent(spec) => {
                self.run_delegate(spec, tool, scope, &call.arguments).await
            }
            ToolKind::Background(handler) => {
                let task_id = self.spawn_background(handler, tool, tool_ctx, scope, &call.arguments);
                let outcome = ToolOutcome::Value(format!("task_id={task_id}"));
                background_task = Some(task_id);
                outcome
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            ToolOutcome::Error(reason) => {
                warn!(tool = %tool.name, call_id = %call.id, elapsed_ms, error = %reason, "Tool call failed")
            }
            _ => debug!(tool = %tool.name, call_id = %call.id, elapsed_ms, kind = tool.kind.label(), "Tool call finished"),
        }

        let result = ToolResult {
            call_id: call.id.clone(),
            tool_name: tool.name.clone(),
            outcome,
            background_task,
        };
        emit_result(scope.ctx, &result);

        let reported = (result.outcome != ToolOutcome::SentDirectly).then_some(&result);
        log_hook_failure(
            scope
                .hooks
                .on_tool_end(scope.ctx, tool, &call.arguments, reported)
                .await,
        );
        result
    }

    fn timed_out(&self, tool: &str) -> ToolOutcome {
        ToolError::Timeout {
            tool_name: tool.to_string(),
            timeout_secs: self.timeout.as_secs(),
        }
        .into()
    }

    async fn run_local(
        &self,
        handler: &Arc<dyn ToolHandler>,
        tool: &Tool,
        ctx: &ToolContext,
        arguments: &serde_json::Value,
    ) -> ToolOutcome {
        let filtered = filter_arguments(&tool.parameters, arguments);
        if !filtered.dropped.is_empty() {
            warn!(tool = %tool.name, dropped = ?filtered.dropped, "Dropping undeclared tool arguments");
        }

        let invocation = AssertUnwindSafe(handler.invoke(ctx, filtered.kept)).catch_unwind();
        match tokio::time::timeout(self.timeout, invocation).await {
            Ok(result) => handler_outcome(&tool.name, result),
            Err(_) => self.timed_out(&tool.name),
        }
    }

    async fn run_remote(
        &self,
        client: &dyn RemoteToolClient,
        remote_name: &str,
        ctx: &ToolContext,
        arguments: &serde_json::Value,
    ) -> ToolOutcome {
        let forwarded =
            AssertUnwindSafe(call_remote(client, remote_name, arguments.clone(), ctx)).catch_unwind();
        match tokio::time::timeout(self.timeout, forwarded).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(e))) => e.into(),
            Ok(Err(_)) => ToolError::Panicked(ctx.tool_name.clone()).into(),
            Err(_) => self.timed_out(&ctx.tool_name),
        }
    }

    async fn run_delegate(
        &self,
        spec: &DelegateSpec,
        tool: &Tool,
        scope: &DispatchScope<'_>,
        arguments: &serde_json::Value,
    ) -> ToolOutcome {
        let filtered = filter_arguments(&tool.parameters, arguments);
        let Some(input) = filtered.kept.get("input").and_then(|v| v.as_str()) else {
            return ToolError::InvalidArguments("missing 'input' argument".into()).into();
        };

        let request = ModelRequest {
            prompt: input.to_string(),
            system_prompt: spec.instructions.clone(),
            tools: spec.tools.clone(),
            history: spec.opening_dialog.clone(),
            model: spec.model.clone().or_else(|| scope.model.map(str::to_string)),
            ..ModelRequest::default()
        };
        // Fresh window and tool set; output stays inside the sub-run.
        let runner = AgentRunner::new(self.caller.clone(), request, scope.ctx.detached())
            .with_dispatcher(self.clone());
        let steps = spec.max_steps.unwrap_or(self.nested_max_steps);
        debug!(tool = %tool.name, steps, "Starting delegated agent");

        match tokio::time::timeout(self.timeout, run_nested(runner, steps)).await {
            Err(_) => self.timed_out(&tool.name),
            Ok(runner) => {
                let answer = runner.final_text().unwrap_or_default().to_string();
                match runner.state() {
                    RunState::Done => ToolOutcome::Value(answer),
                    _ if answer.is_empty() => {
                        ToolOutcome::Error("delegated agent did not produce an answer".into())
                    }
                    _ => ToolOutcome::Error(format!("delegated agent failed: {answer}")),
                }
            }
        }
    }

    fn spawn_background(
        &self,
        handler: &Arc<dyn ToolHandler>,
        tool: &Tool,
        tool_ctx: ToolContext,
        scope: &DispatchScope<'_>,
        arguments: &serde_json::Value,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let filtered = filter_arguments(&tool.parameters, arguments);
        if !filtered.dropped.is_empty() {
            warn!(tool = %tool.name, dropped = ?filtered.dropped, "Dropping undeclared tool arguments");
        }

        let handler = handler.clone();
        let tx = self.background.clone();
        let kept = filtered.kept;
        let mut completion = BackgroundCompletion {
            task_id: task_id.clone(),
            tool_name: tool.name.clone(),
            arguments: serde_json::Value::Object(kept.clone()),
            outcome: ToolOutcome::Value(String::new()),
            ctx: scope.ctx.clone(),
            system_prompt: scope.system_prompt.to_string(),
            history: scope.history.to_vec(),
            tools: scope.tools.clone(),
            model: scope.model.map(str::to_string),
        };

        debug!(tool = %tool.name, task_id = %task_id, "Detaching background job");
        tokio::spawn(async move {
            let result = AssertUnwindSafe(handler.invoke(&tool_ctx, kept))
                .catch_unwind()
                .await;
            completion.outcome = handler_outcome(&tool_ctx.tool_name, result);
            match tx {
                Some(tx) => {
                    if let Err(unsent) = tx.send(completion) {
                        warn!(task_id = %unsent.0.task_id, "Background worker is gone; dropping completion");
                    }
                }
                None => warn!(
                    tool = %tool_ctx.tool_name,
                    task_id = %completion.task_id,
                    "No background worker attached; completion discarded"
                ),
            }
        });

        task_id
    }
}

/// Drive a nested run behind a boxed future so delegation can recurse.
fn run_nested(mut runner: AgentRunner, steps: usize) -> BoxFuture<'static, AgentRunner> {
    Box::pin(async move {
        runner.step_until_done(steps).await;
        runner
    })
}

fn handler_outcome(
    tool_name: &str,
    result: Result<Result<ToolReply, ToolError>, Box<dyn Any + Send>>,
) -> ToolOutcome {
    match result {
        Ok(Ok(ToolReply::Text(text))) => ToolOutcome::Value(text),
        Ok(Ok(ToolReply::SentDirectly)) => ToolOutcome::SentDirectly,
        Ok(Err(e)) => e.into(),
        Err(_) => ToolError::Panicked(tool_name.to_string()).into(),
    }
}

fn emit_result(ctx: &RunContext, result: &ToolResult) {
    ctx.sink.emit(AgentEvent::tool_call_result(
        &result.call_id,
        &result.tool_name,
        result.outcome.transcript_text(),
    ));
}

/// Hooks never abort a run.
pub(crate) fn log_hook_failure(result: Result<(), HookError>) {
    if let Err(e) = result {
        warn!(hook = e.hook, error = %e.reason, "Lifecycle hook failed; continuing");
    }
}
