//! Background jobs and the follow-up runs they trigger.
//!
//! A BACKGROUND tool call returns a task id right away and keeps working in
//! a spawned task. When that task finishes it sends a [`BackgroundCompletion`]
//! over a channel. The [`BackgroundWorker`] on the other end turns each
//! completion into a synthetic follow-up turn and runs it to completion on
//! the original run's sink, so the recipient is notified proactively.

use clawloop_core::agent::{RunContext, RunState};
use clawloop_core::hooks::{AgentHooks, NoopHooks};
use clawloop_core::message::Message;
use clawloop_core::provider::{ModelCaller, ModelRequest};
use clawloop_core::tool::{ToolOutcome, ToolSet};
use clawloop_core::transcript::TranscriptStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::ToolDispatcher;
use crate::runner::AgentRunner;

/// Sent when a detached job finishes.
#[derive(Debug, Clone)]
pub struct BackgroundCompletion {
    pub task_id: String,
    pub tool_name: String,
    /// Arguments the handler actually received.
    pub arguments: serde_json::Value,
    pub outcome: ToolOutcome,
    /// Context of the run that started the job.
    pub ctx: RunContext,
    pub system_prompt: String,
    /// Conversation as it stood when the job was started.
    pub history: Vec<Message>,
    pub tools: ToolSet,
    pub model: Option<String>,
}

impl BackgroundCompletion {
    /// The user-role note that opens the follow-up turn.
    pub fn note(&self) -> String {
        format!(
            "[Background task {} ({}) finished]\nArguments: {}\nResult: {}",
            self.task_id,
            self.tool_name,
            self.arguments,
            self.outcome.transcript_text()
        )
    }

    fn into_request(self) -> (ModelRequest, RunContext) {
        let request = ModelRequest {
            prompt: self.note(),
            system_prompt: self.system_prompt,
            tools: self.tools,
            history: self.history,
            model: self.model,
            ..ModelRequest::default()
        };
        (request, self.ctx)
    }
}

/// Create the completion channel shared by dispatchers and the worker.
pub fn background_channel() -> (
    mpsc::UnboundedSender<BackgroundCompletion>,
    mpsc::UnboundedReceiver<BackgroundCompletion>,
) {
    mpsc::unbounded_channel()
}

/// Consumes completions and re-enters the agent loop for each.
pub struct BackgroundWorker {
    caller: Arc<dyn ModelCaller>,
    rx: mpsc::UnboundedReceiver<BackgroundCompletion>,
    dispatcher: ToolDispatcher,
    /// Weak so that the worker alone never keeps the channel open.
    requeue: Option<mpsc::WeakUnboundedSender<BackgroundCompletion>>,
    hooks: Arc<dyn AgentHooks>,
    store: Option<Arc<dyn TranscriptStore>>,
    max_steps: usize,
}

impl BackgroundWorker {
    /// `dispatcher` is the template for follow-up runs. If it carries a
    /// completion sender, follow-ups may start further background jobs.
    pub fn new(
        caller: Arc<dyn ModelCaller>,
        dispatcher: ToolDispatcher,
        rx: mpsc::UnboundedReceiver<BackgroundCompletion>,
    ) -> Self {
        let (dispatcher, sender) = dispatcher.without_background();
        Self {
            caller,
            rx,
            dispatcher,
            requeue: sender.map(|tx| tx.downgrade()),
            hooks: Arc::new(NoopHooks),
            store: None,
            max_steps: 10,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TranscriptStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Handle the next completion. Returns `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<AgentRunner> {
        let completion = self.rx.recv().await?;
        Some(self.follow_up(completion).await)
    }

    /// Handle completions until the channel closes.
    pub async fn run(mut self) {
        while let Some(runner) = self.next().await {
            debug!(state = %runner.state(), "Background follow-up finished");
        }
        debug!("Background worker stopped");
    }

    async fn follow_up(&self, completion: BackgroundCompletion) -> AgentRunner {
        info!(
            task_id = %completion.task_id,
            tool = %completion.tool_name,
            failed = completion.outcome.is_error(),
            "Background task finished; starting follow-up run"
        );

        let mut dispatcher = self.dispatcher.clone();
        if let Some(tx) = self.requeue.as_ref().and_then(|weak| weak.upgrade()) {
            dispatcher = dispatcher.with_background(tx);
        }

        let (request, ctx) = completion.into_request();
        let mut runner = AgentRunner::new(self.caller.clone(), request, ctx)
            .with_dispatcher(dispatcher)
            .with_hooks(self.hooks.clone());
        let state = runner.step_until_done(self.max_steps).await;

        if state == RunState::Error {
            warn!("Background follow-up run ended in error");
        }
        if let Some(store) = &self.store {
            if let Err(e) = runner.persist(store.as_ref()).await {
                warn!(error = %e, "Failed to persist background follow-up");
            }
        }
        runner
    }
}
