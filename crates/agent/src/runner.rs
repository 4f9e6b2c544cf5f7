//! The agent runner: a small state machine that alternates between asking
//! the model and carrying out the tool calls it asked for.
//!
//! ```text
//! IDLE ──first step──▶ RUNNING ──no tool calls──▶ DONE
//!                       │  ▲   └──model error───▶ ERROR
//!                       └──┘ tool calls
//! ```
//!
//! Each [`AgentRunner::step`] is one model round. [`AgentRunner::step_until_done`]
//! repeats it up to a budget, then forces one last tool-free round that asks
//! the model to wrap up.

use clawloop_config::{AppConfig, ToolDisclosure};
use clawloop_core::agent::{RunContext, RunState, RunStats};
use clawloop_core::error::{Error, ProviderError};
use clawloop_core::event::AgentEvent;
use clawloop_core::hooks::{AgentHooks, NoopHooks};
use clawloop_core::message::{Message, Role, ToolCallRef};
use clawloop_core::provider::{
    ModelCall, ModelCaller, ModelRequest, ModelResponse, ResponseRole, ToolCallsResult,
    ToolDefinition,
};
use clawloop_core::tool::{ToolOutcome, ToolResult, ToolSet};
use clawloop_core::transcript::TranscriptStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::{ContextManager, UsageBaseline};
use crate::dispatcher::{DispatchScope, ToolDispatcher, log_hook_failure};

/// Directive injected before the forced final round.
pub const WRAP_UP_DIRECTIVE: &str = "You have used all available steps. Do not call any more \
tools. Summarize what you found so far and answer the user directly.";

/// Default step budget for [`AgentRunner::run`].
pub const DEFAULT_MAX_STEPS: usize = 30;

/// What a single [`AgentRunner::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Tools ran; another round is needed.
    ToolsExecuted(usize),
    /// The model answered without tools. The run is `Done`.
    Completed,
    /// Tools ran and the run ended without another model round: a tool
    /// delivered its output directly, or every call went to the background.
    ShortCircuited,
    /// The model call failed. The run is in `Error`.
    Failed(String),
    /// The caller stopped the run.
    Stopped,
    /// The run was already terminal; nothing happened.
    AlreadyFinished,
}

pub struct AgentRunner {
    caller: Arc<dyn ModelCaller>,
    request: ModelRequest,
    ctx: RunContext,
    dispatcher: ToolDispatcher,
    hooks: Arc<dyn AgentHooks>,
    streaming: bool,
    disclosure: ToolDisclosure,
    context: Option<ContextManager>,
    max_steps: usize,

    state: RunState,
    stats: RunStats,
    /// Working window the model sees.
    messages: Vec<Message>,
    /// Messages this run produced, in order, for persistence.
    produced: Vec<Message>,
    pending: Vec<ToolCallsResult>,
    baseline: Option<UsageBaseline>,
    began: bool,
    forced: bool,
    final_response: Option<ModelResponse>,
}

impl AgentRunner {
    /// Create a runner with a default dispatcher (60s tool timeout), no-op
    /// hooks, full tool disclosure and no context policy.
    pub fn new(caller: Arc<dyn ModelCaller>, request: ModelRequest, ctx: RunContext) -> Self {
        let dispatcher = ToolDispatcher::new(caller.clone(), Duration::from_secs(60));
        let mut runner = Self {
            caller,
            request: ModelRequest::default(),
            ctx: RunContext::default(),
            dispatcher,
            hooks: Arc::new(NoopHooks),
            streaming: false,
            disclosure: ToolDisclosure::Full,
            context: None,
            max_steps: DEFAULT_MAX_STEPS,
            state: RunState::Idle,
            stats: RunStats::default(),
            messages: Vec::new(),
            produced: Vec::new(),
            pending: Vec::new(),
            baseline: None,
            began: false,
            forced: false,
            final_response: None,
        };
        runner.reset(request, ctx);
        runner
    }

    /// Apply streaming, disclosure, step budget and default model from config.
    pub fn configured(mut self, config: &AppConfig) -> Self {
        self.streaming = config.agent.streaming;
        self.disclosure = config.agent.tool_disclosure;
        self.max_steps = config.agent.max_steps;
        if self.request.model.is_none() {
            self.request.model = config.default_model.clone();
        }
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: ToolDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_disclosure(mut self, disclosure: ToolDisclosure) -> Self {
        self.disclosure = disclosure;
        self
    }

    pub fn with_context_manager(mut self, manager: ContextManager) -> Self {
        self.context = Some(manager);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Start over with a new request, keeping the collaborators.
    ///
    /// The window is: system prompt, prior history, the new user turn, then
    /// any pending tool-call results carried in the request.
    pub fn reset(&mut self, request: ModelRequest, ctx: RunContext) {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        let mut produced = Vec::new();

        if !request.system_prompt.is_empty() {
            messages.push(Message::system(&request.system_prompt));
        }
        messages.extend(request.history.iter().cloned());
        if let Some(user) = request.user_message() {
            produced.push(user);
        }
        produced.extend(request.tool_results.iter().flat_map(ToolCallsResult::to_messages));
        messages.extend(produced.iter().cloned());

        self.request = request;
        self.ctx = ctx;
        self.messages = messages;
        self.produced = produced;
        self.state = RunState::Idle;
        self.stats = RunStats::default();
        self.pending.clear();
        self.baseline = None;
        self.began = false;
        self.forced = false;
        self.final_response = None;
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// The working window as the model will see it next.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Tool-call pairings produced so far, oldest first.
    pub fn pending_results(&self) -> &[ToolCallsResult] {
        &self.pending
    }

    pub fn take_pending_results(&mut self) -> Vec<ToolCallsResult> {
        std::mem::take(&mut self.pending)
    }

    /// The response that ended the run, if it has ended.
    pub fn final_response(&self) -> Option<&ModelResponse> {
        self.final_response.as_ref()
    }

    pub fn final_text(&self) -> Option<&str> {
        self.final_response.as_ref().map(|r| r.text.as_str())
    }

    /// Messages this run produced, minus the do-not-persist ones.
    pub fn transcript(&self) -> Vec<Message> {
        self.produced
            .iter()
            .filter(|m| !m.no_persist)
            .cloned()
            .collect()
    }

    /// Hand the transcript to a persistence collaborator.
    pub async fn persist(&self, store: &dyn TranscriptStore) -> Result<(), Error> {
        store
            .save(&self.ctx.conversation_id, self.transcript())
            .await
    }

    /// Run with the configured step budget.
    pub async fn run(&mut self) -> RunState {
        self.step_until_done(self.max_steps).await
    }

    /// Step until the run is terminal or `max_steps` rounds have run, then
    /// force one tool-free round if needed.
    pub async fn step_until_done(&mut self, max_steps: usize) -> RunState {
        let mut steps = 0;
        while !self.state.is_terminal() && steps < max_steps {
            self.step().await;
            steps += 1;
        }

        if !self.state.is_terminal() {
            info!(
                conversation_id = %self.ctx.conversation_id,
                max_steps,
                "Step budget exhausted; forcing a final answer"
            );
            self.forced = true;
            self.request.tools = ToolSet::new();
            self.messages.push(Message::user(WRAP_UP_DIRECTIVE).transient());
            self.step().await;
        }
        self.state
    }

    /// Perform one round.
    pub async fn step(&mut self) -> StepOutcome {
        if self.state.is_terminal() {
            debug!(state = %self.state, "Step on a finished run ignored");
            return StepOutcome::AlreadyFinished;
        }

        if !self.began {
            self.began = true;
            self.stats.start();
            log_hook_failure(self.hooks.on_agent_begin(&self.ctx).await);
        }
        if self.state == RunState::Idle {
            self.transition(RunState::Running);
        }
        if self.ctx.stop.is_stopped() {
            return self.finish_stopped().await;
        }

        if let Some(manager) = &self.context {
            let report = manager.process(&mut self.messages, self.baseline).await;
            if report.changed() {
                self.baseline = None;
            }
        }

        let tools = if self.forced {
            Vec::new()
        } else {
            match self.disclosure {
                ToolDisclosure::Full => self.request.tools.definitions(),
                ToolDisclosure::TwoPhase => self.request.tools.light_definitions(),
            }
        };

        let response = match self.call_model(tools, self.streaming).await {
            Ok(response) => response,
            Err(e) => return self.fail(ModelResponse::error(e.to_string())).await,
        };
        if response.role == ResponseRole::Error {
            return self.fail(response).await;
        }
        if self.forced && response.wants_tools() {
            warn!(
                calls = response.tool_calls.len(),
                "Ignoring tool calls in the forced final round"
            );
        }
        if !response.wants_tools() || self.forced {
            return self.complete(response).await;
        }

        let response = if self.disclosure == ToolDisclosure::TwoPhase {
            match self.requery_parameters(response).await {
                Ok(response) => response,
                Err(e) => return self.fail(ModelResponse::error(e.to_string())).await,
            }
        } else {
            response
        };
        if self.ctx.stop.is_stopped() {
            // Pair the requested calls so the transcript stays well formed.
            let calls = response.tool_calls.clone();
            self.record_tool_round(&response, calls, Vec::new());
            return self.finish_stopped().await;
        }
        self.execute_tools(response).await
    }

    fn transition(&mut self, next: RunState) {
        if self.state.can_transition_to(next) {
            if self.state != next {
                debug!(from = %self.state, to = %next, "Run state transition");
            }
            self.state = next;
        } else {
            warn!(from = %self.state, to = %next, "Rejected run state transition");
        }
    }

    fn push(&mut self, message: Message) {
        self.produced.push(message.clone());
        self.messages.push(message);
    }

    async fn call_model(
        &mut self,
        tools: Vec<ToolDefinition>,
        stream: bool,
    ) -> Result<ModelResponse, ProviderError> {
        let call = ModelCall {
            messages: self.messages.clone(),
            tools,
            model: self.request.model.clone(),
            stream,
        };
        self.stats.model_calls += 1;
        debug!(
            round = self.stats.model_calls,
            messages = call.messages.len(),
            tools = call.tools.len(),
            stream,
            "Calling model"
        );

        let response = if stream {
            let mut rx = self.caller.stream(call).await?;
            let mut last = None;
            while let Some(item) = rx.recv().await {
                let item = item?;
                if !item.is_chunk {
                    last = Some(item);
                    break;
                }
                self.stats.record_first_token();
                if !item.text.is_empty() && !self.ctx.stop.is_stopped() {
                    self.ctx.sink.emit(AgentEvent::streaming_delta(&item.text));
                }
            }
            last.ok_or(ProviderError::MissingFinal)?
        } else {
            self.caller.call(call).await?
        };

        self.stats.record_first_token();
        if let Some(usage) = response.usage {
            self.stats.usage += usage;
            self.baseline = Some(UsageBaseline {
                // The reply this usage paid for is appended next.
                covered: self.messages.len() + 1,
                tokens: usage.total() as usize,
            });
        }
        Ok(response)
    }

    /// Two-phase disclosure: show parameter schemas for the committed tools
    /// only and let the model restate its calls.
    async fn requery_parameters(
        &mut self,
        first: ModelResponse,
    ) -> Result<ModelResponse, ProviderError> {
        let committed = self
            .request
            .tools
            .subset(first.tool_calls.iter().map(|c| c.name.as_str()));
        if committed.is_empty() {
            return Ok(first);
        }

        debug!(tools = ?committed.names(), "Re-querying with parameter schemas");
        let mut second = self.call_model(committed.param_only_definitions(), false).await?;
        if second.role == ResponseRole::Error {
            return Err(ProviderError::ModelSide(second.text));
        }
        // Only calls whose parameters the model has just seen may run.
        let before = second.tool_calls.len();
        second.tool_calls.retain(|c| committed.contains(&c.name));
        if second.tool_calls.len() < before {
            warn!(
                dropped = before - second.tool_calls.len(),
                "Re-queried calls named tools outside the committed set"
            );
        }
        if second.wants_tools() {
            Ok(second)
        } else {
            Ok(first)
        }
    }

    async fn execute_tools(&mut self, response: ModelResponse) -> StepOutcome {
        let calls = response.tool_calls.clone();
        let history: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System && !m.no_persist)
            .cloned()
            .collect();

        let mut results = Vec::with_capacity(calls.len());
        let mut sent_directly = false;
        let mut all_background = true;

        for call in &calls {
            if self.ctx.stop.is_stopped() {
                break;
            }
            let scope = DispatchScope {
                ctx: &self.ctx,
                hooks: self.hooks.as_ref(),
                tools: &self.request.tools,
                system_prompt: &self.request.system_prompt,
                history: &history,
                model: self.request.model.as_deref(),
            };
            let result = self.dispatcher.dispatch(&scope, call).await;
            self.stats.tool_calls += 1;

            sent_directly |= result.outcome == ToolOutcome::SentDirectly;
            all_background &= result.background_task.is_some();
            results.push(result);
        }

        let executed = results.len();
        self.record_tool_round(&response, calls, results);

        if self.ctx.stop.is_stopped() {
            return self.finish_stopped().await;
        }
        if sent_directly || all_background {
            debug!(sent_directly, all_background, "Tool round ends the run");
            self.transition(RunState::Done);
            self.stats.finish();
            log_hook_failure(self.hooks.on_agent_done(&self.ctx, &response).await);
            self.final_response = Some(response);
            return StepOutcome::ShortCircuited;
        }
        StepOutcome::ToolsExecuted(executed)
    }

    /// Append the assistant tool-call message and one result per call.
    /// Calls without a result (the run was stopped first) get an error result.
    fn record_tool_round(
        &mut self,
        response: &ModelResponse,
        calls: Vec<ToolCallRef>,
        mut results: Vec<ToolResult>,
    ) {
        for call in calls.iter().skip(results.len()) {
            results.push(ToolResult::new(
                &call.id,
                &call.name,
                ToolOutcome::Error("run stopped".into()),
            ));
        }

        let pairing = ToolCallsResult {
            calls: assistant_message(response, calls),
            results: results.iter().map(ToolResult::to_message).collect(),
        };
        for message in pairing.to_messages() {
            self.push(message);
        }
        self.pending.push(pairing);
    }

    async fn complete(&mut self, response: ModelResponse) -> StepOutcome {
        self.push(assistant_message(&response, Vec::new()));
        self.transition(RunState::Done);
        self.stats.finish();
        if !self.ctx.stop.is_stopped() {
            self.ctx.sink.emit(AgentEvent::llm_result(&response.text));
        }
        info!(
            conversation_id = %self.ctx.conversation_id,
            rounds = self.stats.model_calls,
            tool_calls = self.stats.tool_calls,
            tokens = self.stats.usage.total(),
            "Run completed"
        );
        log_hook_failure(self.hooks.on_agent_done(&self.ctx, &response).await);
        self.final_response = Some(response);
        StepOutcome::Completed
    }

    async fn fail(&mut self, response: ModelResponse) -> StepOutcome {
        warn!(
            conversation_id = %self.ctx.conversation_id,
            error = %response.text,
            "Model call failed; run aborted"
        );
        self.transition(RunState::Error);
        self.stats.finish();
        self.ctx.sink.emit(AgentEvent::err(&response.text));
        log_hook_failure(self.hooks.on_agent_done(&self.ctx, &response).await);
        let message = response.text.clone();
        self.final_response = Some(response);
        StepOutcome::Failed(message)
    }

    async fn finish_stopped(&mut self) -> StepOutcome {
        info!(conversation_id = %self.ctx.conversation_id, "Run stopped by caller");
        self.transition(RunState::Done);
        self.stats.finish();
        let response = self
            .final_response
            .clone()
            .unwrap_or_else(|| ModelResponse::text(""));
        log_hook_failure(self.hooks.on_agent_done(&self.ctx, &response).await);
        self.final_response = Some(response);
        StepOutcome::Stopped
    }
}

/// The assistant message for a response: reasoning, text, then the calls.
fn assistant_message(response: &ModelResponse, calls: Vec<ToolCallRef>) -> Message {
    let reasoning = response
        .reasoning
        .clone()
        .map(|text| (text, response.reasoning_signature.clone()));
    let message = Message::assistant_tool_calls(&response.text, reasoning, calls);
    if message.parts.is_empty() {
        Message::assistant("")
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedModel, ScriptedTurn};
    use async_trait::async_trait;
    use clawloop_config::ContextSettings;
    use clawloop_core::error::HookError;
    use clawloop_core::event::{EventKind, EventSink};
    use clawloop_core::message::{ContentPart, ConversationId};
    use clawloop_core::provider::TokenUsage;
    use clawloop_core::tool::{Tool, ToolReply};
    use clawloop_core::transcript::InMemoryTranscriptStore;
    use clawloop_tools::{builtin_tools, handler_fn};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCallRef {
        ToolCallRef::new(id, name, args)
    }

    fn runner(
        model: Arc<ScriptedModel>,
        request: ModelRequest,
    ) -> (AgentRunner, UnboundedReceiver<AgentEvent>) {
        let (sink, events) = EventSink::channel();
        let ctx = RunContext::new(ConversationId::from("conv"), sink);
        (AgentRunner::new(model, request, ctx), events)
    }

    fn drain(events: &mut UnboundedReceiver<AgentEvent>) -> Vec<EventKind> {
        let mut kinds = vec![];
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    fn looping_model(rounds: usize) -> Arc<ScriptedModel> {
        let mut turns: Vec<ScriptedTurn> = (0..rounds)
            .map(|i| ScriptedTurn::tool_calls(vec![call(&format!("c{i}"), "echo", json!({"text": "again"}))]))
            .collect();
        turns.push(ScriptedTurn::text("Here is my summary."));
        Arc::new(ScriptedModel::new(turns))
    }

    #[tokio::test]
    async fn initial_window_order() {
        let mut request = ModelRequest::new("now")
            .with_system_prompt("sys")
            .with_history(vec![Message::user("before"), Message::assistant("ok")]);
        request.extra_parts.push(ContentPart::text("[reminder]"));
        let (runner, _) = runner(Arc::new(ScriptedModel::new(vec![])), request);

        let roles: Vec<Role> = runner.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(runner.messages()[3].text(), "now[reminder]");
        assert_eq!(runner.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn plain_answer_completes() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::text("Hello!").with_usage(TokenUsage::new(10, 2, 5)),
        ]));
        let (mut runner, mut events) = runner(model.clone(), ModelRequest::new("hi"));

        assert_eq!(runner.step().await, StepOutcome::Completed);
        assert_eq!(runner.state(), RunState::Done);
        assert_eq!(runner.final_text(), Some("Hello!"));
        assert_eq!(runner.stats().usage.total(), 17);
        assert!(runner.stats().time_to_first_token_ms.is_some());
        assert_eq!(drain(&mut events), vec![EventKind::LlmResult]);

        // Terminal: no further model calls.
        assert_eq!(runner.step().await, StepOutcome::AlreadyFinished);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn model_error_is_terminal() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::error("overloaded")]));
        let (mut runner, mut events) = runner(model.clone(), ModelRequest::new("hi"));

        assert_eq!(runner.step_until_done(5).await, RunState::Error);
        assert_eq!(drain(&mut events), vec![EventKind::Err]);
        assert_eq!(runner.step().await, StepOutcome::AlreadyFinished);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_script_is_a_model_failure() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let (mut runner, _) = runner(model, ModelRequest::new("hi"));
        assert!(matches!(runner.step().await, StepOutcome::Failed(_)));
        assert_eq!(runner.state(), RunState::Error);
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::tool_calls(vec![call("c1", "echo", json!({"text": "ping"}))])
                .with_text("Let me check."),
            ScriptedTurn::text("pong"),
        ]));
        let request = ModelRequest::new("ping?").with_tools(builtin_tools());
        let (mut runner, mut events) = runner(model.clone(), request);

        assert_eq!(runner.step().await, StepOutcome::ToolsExecuted(1));
        assert_eq!(runner.state(), RunState::Running);
        assert_eq!(runner.pending_results().len(), 1);
        assert_eq!(runner.step().await, StepOutcome::Completed);

        assert_eq!(
            drain(&mut events),
            vec![EventKind::ToolCall, EventKind::ToolCallResult, EventKind::LlmResult]
        );

        let transcript = runner.transcript();
        let roles: Vec<Role> = transcript.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(transcript[1].text(), "Let me check.");
        assert_eq!(transcript[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(transcript[2].text(), "ping");

        // Second round saw the tool result.
        let second = &model.calls()[1];
        assert_eq!(second.messages.last().unwrap().role, Role::Tool);
    }

    #[tokio::test]
    async fn calls_run_sequentially_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            Tool::local(
                name,
                "records",
                json!(null),
                handler_fn(move |_ctx, _args| {
                    let order = order.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(if name == "a" { 20 } else { 1 })).await;
                        order.lock().unwrap().push(name);
                        Ok::<_, clawloop_core::ToolError>(ToolReply::text(name))
                    }
                }),
            )
        };
        let tools = ToolSet::new()
            .with(record("a", order.clone()))
            .with(record("b", order.clone()));
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::tool_calls(vec![call("1", "a", json!({})), call("2", "b", json!({}))]),
            ScriptedTurn::text("done"),
        ]));
        let (mut runner, _) = runner(model, ModelRequest::new("go").with_tools(tools));
        runner.step_until_done(5).await;

        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        let results: Vec<String> = runner
            .transcript()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.text())
            .collect();
        assert_eq!(results, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn budget_exhaustion_forces_tool_free_round() {
        let model = looping_model(3);
        let request = ModelRequest::new("loop").with_tools(builtin_tools());
        let (mut runner, _) = runner(model.clone(), request);

        assert_eq!(runner.step_until_done(3).await, RunState::Done);
        assert_eq!(model.call_count(), 4);
        let last = model.calls().pop().unwrap();
        assert!(last.tools.is_empty());
        assert_eq!(last.messages.last().unwrap().text(), WRAP_UP_DIRECTIVE);
        assert_eq!(runner.final_text(), Some("Here is my summary."));

        // The directive is never persisted.
        assert!(runner.transcript().iter().all(|m| m.text() != WRAP_UP_DIRECTIVE));
    }

    #[tokio::test]
    async fn forced_round_ignores_tool_calls() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::tool_calls(vec![call("c1", "echo", json!({"text": "x"}))]),
            ScriptedTurn::tool_calls(vec![call("c2", "echo", json!({"text": "y"}))]).with_text("stubborn"),
        ]));
        let (mut runner, _) = runner(model.clone(), ModelRequest::new("go").with_tools(builtin_tools()));
        assert_eq!(runner.step_until_done(1).await, RunState::Done);
        assert_eq!(runner.final_text(), Some("stubborn"));
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn zero_budget_goes_straight_to_forced_round() {
        let model = looping_model(0);
        let (mut runner, _) = runner(model.clone(), ModelRequest::new("hi").with_tools(builtin_tools()));
        assert_eq!(runner.step_until_done(0).await, RunState::Done);
        assert_eq!(model.call_count(), 1);
        assert!(model.calls()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn two_phase_requery_has_only_committed_param_schemas() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::tool_calls(vec![call("c1", "echo", json!({}))]),
            ScriptedTurn::tool_calls(vec![call("c1", "echo", json!({"text": "hi"}))]),
            ScriptedTurn::text("hi"),
        ]));
        let request = ModelRequest::new("say hi").with_tools(builtin_tools());
        let (mut runner, _) = runner(model.clone(), request);
        let mut runner = runner.with_disclosure(ToolDisclosure::TwoPhase);

        assert_eq!(runner.step().await, StepOutcome::ToolsExecuted(1));
        let calls = model.calls();

        // First call: light view of every tool.
        assert_eq!(calls[0].tools.len(), 3);
        assert!(calls[0].tools.iter().all(|t| t.parameters.is_none() && t.description.is_some()));

        // Re-query: param-only view of the committed tool.
        assert_eq!(calls[1].tools.len(), 1);
        assert_eq!(calls[1].tools[0].name, "echo");
        assert!(calls[1].tools[0].description.is_none());
        assert!(calls[1].tools[0].parameters.is_some());

        let tool_msg = runner.messages().last().unwrap();
        assert_eq!(tool_msg.text(), "hi");
    }

    #[tokio::test]
    async fn failing_tool_keeps_run_alive() {
        let tools = ToolSet::new().with(Tool::local(
            "broken",
            "fails",
            json!(null),
            handler_fn(|_ctx, _args| async { Err::<ToolReply, _>(clawloop_core::ToolError::failed("boom")) }),
        ));
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::tool_calls(vec![call("c1", "broken", json!({}))]),
            ScriptedTurn::text("sorry, that failed"),
        ]));
        let (mut runner, _) = runner(model.clone(), ModelRequest::new("try").with_tools(tools));

        assert_eq!(runner.step().await, StepOutcome::ToolsExecuted(1));
        assert_eq!(runner.state(), RunState::Running);
        assert!(runner.messages().last().unwrap().text().contains("error: boom"));
        assert_eq!(runner.step_until_done(5).await, RunState::Done);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn sent_directly_short_circuits() {
        let tools = ToolSet::new().with(Tool::local(
            "show",
            "shows a card",
            json!(null),
            handler_fn(|ctx, _args| async move {
                ctx.send_attachment("image/png", "AAAA");
                Ok::<_, clawloop_core::ToolError>(ToolReply::SentDirectly)
            }),
        ));
        let model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::tool_calls(vec![call(
            "c1",
            "show",
            json!({}),
        )])]));
        let (mut runner, _) = runner(model.clone(), ModelRequest::new("show me").with_tools(tools));

        assert_eq!(runner.step().await, StepOutcome::ShortCircuited);
        assert_eq!(runner.state(), RunState::Done);
        assert_eq!(
            runner.messages().last().unwrap().text(),
            "The result has been sent to the user directly."
        );
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn stop_before_tools_pairs_every_call() {
        let stop_tool = Tool::local(
            "halt",
            "stops the run",
            json!(null),
            handler_fn(|ctx, _args| async move {
                ctx.run.stop.stop();
                Ok::<_, clawloop_core::ToolError>(ToolReply::text("stopping"))
            }),
        );
        let tools = builtin_tools().with(stop_tool);
        let model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::tool_calls(vec![
            call("c1", "halt", json!({})),
            call("c2", "echo", json!({"text": "never"})),
        ])]));
        let (mut runner, _) = runner(model, ModelRequest::new("go").with_tools(tools));

        assert_eq!(runner.step().await, StepOutcome::Stopped);
        assert_eq!(runner.state(), RunState::Done);
        let results: Vec<String> = runner
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.text())
            .collect();
        assert_eq!(results, vec!["stopping", "error: run stopped"]);
    }

    #[tokio::test]
    async fn streaming_forwards_deltas_in_order() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::streamed(["Hel", "lo"])]));
        let (runner, mut events) = runner(model.clone(), ModelRequest::new("hi"));
        let mut runner = runner.with_streaming(true);

        assert_eq!(runner.step().await, StepOutcome::Completed);
        let mut texts = vec![];
        while let Ok(event) = events.try_recv() {
            texts.push((event.kind, event.text().unwrap_or_default().to_string()));
        }
        assert_eq!(
            texts,
            vec![
                (EventKind::StreamingDelta, "Hel".to_string()),
                (EventKind::StreamingDelta, "lo".to_string()),
                (EventKind::LlmResult, "Hello".to_string()),
            ]
        );
        assert!(model.calls()[0].stream);
    }

    #[tokio::test]
    async fn stopped_run_forwards_nothing() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::streamed(["a", "b"])]));
        let (runner, mut events) = runner(model.clone(), ModelRequest::new("hi"));
        let mut runner = runner.with_streaming(true);
        runner.context().stop.stop();

        assert_eq!(runner.step().await, StepOutcome::Stopped);
        assert_eq!(runner.state(), RunState::Done);
        assert!(drain(&mut events).is_empty());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_stream_cuts_remaining_output() {
        let turn = ScriptedTurn {
            chunk_delay_ms: 10,
            ..ScriptedTurn::streamed(["one ", "two ", "three"])
        };
        let model = Arc::new(ScriptedModel::new(vec![turn]));
        let (runner, mut events) = runner(model.clone(), ModelRequest::new("count"));
        let mut runner = runner.with_streaming(true);
        let stop = runner.context().stop.clone();
        let task = tokio::spawn(async move { runner.step_until_done(5).await });

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::StreamingDelta);
        assert_eq!(first.text(), Some("one "));
        stop.stop();

        assert_eq!(task.await.unwrap(), RunState::Done);
        // Later deltas and the final answer are withheld.
        assert!(drain(&mut events).is_empty());
        assert_eq!(model.call_count(), 1);
    }

    fn wrap_up_run(settings: ContextSettings) -> (AgentRunner, Arc<ScriptedModel>) {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::tool_calls(vec![call("c1", "echo", json!({"text": "X is 42"}))]),
            ScriptedTurn::text("X is 42."),
        ]));
        let request = ModelRequest::new("what is X?")
            .with_system_prompt("sys")
            .with_tools(builtin_tools());
        let (runner, _) = runner(model.clone(), request);
        (runner.with_context_manager(ContextManager::new(settings)), model)
    }

    fn assert_wrap_up_kept_question(model: &ScriptedModel) {
        let last = model.calls().pop().unwrap();
        let texts: Vec<String> = last.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts.first().map(String::as_str), Some("sys"));
        assert!(texts.iter().any(|t| t == "what is X?"));
        assert!(last.messages.iter().any(|m| m.role == Role::Tool));
        assert_eq!(texts.last().map(String::as_str), Some(WRAP_UP_DIRECTIVE));
    }

    #[tokio::test]
    async fn wrap_up_round_survives_turn_ceiling() {
        let (mut runner, model) = wrap_up_run(ContextSettings {
            max_turns: 1,
            ..ContextSettings::default()
        });
        assert_eq!(runner.step_until_done(1).await, RunState::Done);
        assert_eq!(model.call_count(), 2);
        assert_wrap_up_kept_question(&model);
    }

    #[tokio::test]
    async fn wrap_up_round_survives_token_truncation() {
        let (mut runner, model) = wrap_up_run(ContextSettings {
            max_context_tokens: 1,
            ..ContextSettings::default()
        });
        assert_eq!(runner.step_until_done(1).await, RunState::Done);
        assert_eq!(model.call_count(), 2);
        assert_wrap_up_kept_question(&model);
    }

    #[tokio::test]
    async fn two_phase_requery_drops_uncommitted_calls() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::tool_calls(vec![call("c1", "echo", json!({}))]),
            ScriptedTurn::tool_calls(vec![
                call("c1", "echo", json!({"text": "hi"})),
                call("c2", "current_time", json!({})),
            ]),
            ScriptedTurn::text("hi"),
        ]));
        let request = ModelRequest::new("say hi").with_tools(builtin_tools());
        let (runner, mut events) = runner(model.clone(), request);
        let mut runner = runner.with_disclosure(ToolDisclosure::TwoPhase);

        assert_eq!(runner.step().await, StepOutcome::ToolsExecuted(1));
        let results: Vec<String> = runner
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.text())
            .collect();
        assert_eq!(results, vec!["hi"]);
        assert_eq!(drain(&mut events), vec![EventKind::ToolCall, EventKind::ToolCallResult]);
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentHooks for Recorder {
        async fn on_agent_begin(&self, _ctx: &RunContext) -> Result<(), HookError> {
            self.seen.lock().unwrap().push("begin".into());
            Err(HookError::new("agent_begin", "ignored"))
        }

        async fn on_agent_done(
            &self,
            _ctx: &RunContext,
            response: &ModelResponse,
        ) -> Result<(), HookError> {
            self.seen.lock().unwrap().push(format!("done:{}", response.text));
            Ok(())
        }

        async fn on_tool_start(
            &self,
            _ctx: &RunContext,
            tool: &Tool,
            _arguments: &serde_json::Value,
        ) -> Result<(), HookError> {
            self.seen.lock().unwrap().push(format!("start:{}", tool.name));
            Ok(())
        }

        async fn on_tool_end(
            &self,
            _ctx: &RunContext,
            tool: &Tool,
            _arguments: &serde_json::Value,
            result: Option<&ToolResult>,
        ) -> Result<(), HookError> {
            let text = result.map(|r| r.outcome.transcript_text()).unwrap_or_default();
            self.seen.lock().unwrap().push(format!("end:{}:{text}", tool.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_bracket_run_and_tools() {
        let hooks = Arc::new(Recorder::default());
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedTurn::tool_calls(vec![call("c1", "echo", json!({"text": "x"}))]),
            ScriptedTurn::text("fin"),
        ]));
        let (runner, _) = runner(model, ModelRequest::new("go").with_tools(builtin_tools()));
        let mut runner = runner.with_hooks(hooks.clone());
        assert_eq!(runner.step_until_done(5).await, RunState::Done);

        assert_eq!(
            *hooks.seen.lock().unwrap(),
            vec!["begin", "start:echo", "end:echo:x", "done:fin"]
        );
    }

    #[tokio::test]
    async fn persist_hands_over_run_messages_only() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::text("answer")]));
        let request = ModelRequest::new("question")
            .with_system_prompt("sys")
            .with_history(vec![Message::user("old"), Message::assistant("older")]);
        let (mut runner, _) = runner(model, request);
        runner.step_until_done(3).await;

        let store = InMemoryTranscriptStore::new();
        runner.persist(&store).await.unwrap();
        let saved = store.load(&ConversationId::from("conv")).await.unwrap();
        let texts: Vec<String> = saved.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["question", "answer"]);
    }

    #[tokio::test]
    async fn context_policy_applies_before_each_call() {
        let history: Vec<Message> = (0..6)
            .flat_map(|i| [Message::user(format!("q{i}")), Message::assistant(format!("a{i}"))])
            .collect();
        let model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::text("ok")]));
        let request = ModelRequest::new("latest").with_system_prompt("sys").with_history(history);
        let (runner, _) = runner(model.clone(), request);
        let mut runner = runner.with_context_manager(ContextManager::new(ContextSettings {
            max_turns: 2,
            ..ContextSettings::default()
        }));
        runner.step().await;

        let sent: Vec<String> = model.calls()[0].messages.iter().map(|m| m.text()).collect();
        assert_eq!(sent, vec!["sys", "q5", "a5", "latest"]);
    }

    #[tokio::test]
    async fn reset_starts_a_fresh_run() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::text("one"), ScriptedTurn::text("two")]));
        let (mut runner, _) = runner(model, ModelRequest::new("first"));
        runner.step_until_done(2).await;
        assert_eq!(runner.state(), RunState::Done);

        runner.reset(ModelRequest::new("second"), RunContext::default());
        assert_eq!(runner.state(), RunState::Idle);
        assert!(runner.final_text().is_none());
        runner.step_until_done(2).await;
        assert_eq!(runner.final_text(), Some("two"));
    }
}
