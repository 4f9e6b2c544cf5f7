//! The clawloop agent engine.
//!
//! A run alternates between two moves until the model answers:
//!
//! 1. **Ask** the model, with the working window trimmed to budget
//! 2. **Act** on the tool calls it requested, one after another
//! 3. **Observe**: append the calls and their results, then ask again
//!
//! The run ends when the model answers without tools, when the model call
//! fails, or when the step budget forces a final tool-free round.
//!
//! - [`runner`]: the state machine
//! - [`dispatcher`]: resolves and executes single tool calls
//! - [`context`]: keeps the window under the turn and token budget
//! - [`background`]: follow-up runs for detached jobs
//! - [`scripted`]: a replaying model caller for tests and the CLI

pub mod background;
pub mod context;
pub mod dispatcher;
pub mod runner;
pub mod scripted;

pub use background::{BackgroundCompletion, BackgroundWorker, background_channel};
pub use context::{
    ContextCompressor, ContextManager, ContextReport, HeuristicCounter, LlmSummaryCompressor,
    TokenCounter, UsageBaseline,
};
pub use dispatcher::{DispatchScope, ToolDispatcher};
pub use runner::{AgentRunner, StepOutcome, WRAP_UP_DIRECTIVE};
pub use scripted::{ScriptedModel, ScriptedTurn};
