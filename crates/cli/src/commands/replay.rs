//! `clawloop replay`: run the agent against a scripted model.
//!
//! The run uses the built-in tools and the effective configuration. Every
//! output event is printed to stdout as one JSON line, in production order,
//! including those of background follow-up runs.

use anyhow::Context;
use clawloop_agent::{
    AgentRunner, BackgroundWorker, ContextManager, LlmSummaryCompressor, ScriptedModel,
    ToolDispatcher, background_channel,
};
use clawloop_config::{AppConfig, TruncationStrategy};
use clawloop_core::agent::RunContext;
use clawloop_core::event::EventSink;
use clawloop_core::message::ConversationId;
use clawloop_core::provider::ModelRequest;
use clawloop_core::transcript::{InMemoryTranscriptStore, TranscriptStore};
use clawloop_tools::builtin_tools;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ReplayArgs {
    pub script: PathBuf,
    pub message: String,
    pub system: Option<String>,
    pub stream: bool,
    pub max_steps: Option<usize>,
}

pub async fn run(args: ReplayArgs) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("failed to load config")?;
    if let Some(steps) = args.max_steps {
        config.agent.max_steps = steps;
    }
    if args.stream {
        config.agent.streaming = true;
    }

    let raw = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read script {}", args.script.display()))?;
    let model = Arc::new(ScriptedModel::from_json(&raw).context("invalid script")?);
    info!(turns = model.remaining(), "Loaded script");

    let conversation = ConversationId::new();
    let (sink, mut events) = EventSink::channel();
    let ctx = RunContext::new(conversation.clone(), sink);
    let store = Arc::new(InMemoryTranscriptStore::new());

    let (tx, rx) = background_channel();
    let mut dispatcher = ToolDispatcher::from_config(model.clone(), &config);
    if config.background.enabled {
        dispatcher = dispatcher.with_background(tx);
    } else {
        drop(tx);
    }
    let worker = BackgroundWorker::new(model.clone(), dispatcher.clone(), rx)
        .with_store(store.clone())
        .with_max_steps(config.background.max_steps);

    let mut context = ContextManager::new(config.context.clone());
    if config.context.strategy == TruncationStrategy::Compress {
        context = context.with_compressor(Arc::new(LlmSummaryCompressor::new(
            model.clone(),
            config.context.compress_model.clone(),
        )));
    }

    let request = ModelRequest::new(args.message)
        .with_system_prompt(args.system.unwrap_or_default())
        .with_tools(builtin_tools());
    let mut runner = AgentRunner::new(model.clone(), request, ctx)
        .configured(&config)
        .with_dispatcher(dispatcher)
        .with_context_manager(context);

    // The runner and worker own every sink clone; once both finish the
    // event stream closes.
    let run_store = store.clone();
    let run = tokio::spawn(async move {
        let state = runner.run().await;
        if let Err(e) = runner.persist(run_store.as_ref()).await {
            warn!(error = %e, "Failed to persist run");
        }
        (state, runner.stats().clone())
    });
    let background = tokio::spawn(worker.run());

    while let Some(event) = events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
    }

    let (state, stats) = run.await.context("agent run panicked")?;
    background.await.context("background worker panicked")?;

    let persisted = store.load(&conversation).await?.len();
    info!(
        state = %state,
        rounds = stats.model_calls,
        tool_calls = stats.tool_calls,
        tokens = stats.usage.total(),
        ttft_ms = ?stats.time_to_first_token_ms,
        duration_ms = ?stats.duration_ms(),
        persisted,
        "Replay finished"
    );
    Ok(())
}
