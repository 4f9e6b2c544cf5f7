//! Error types for the clawloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all clawloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model caller errors ---
    #[error("Model error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Lifecycle hook errors ---
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures reported by (or while talking to) the model caller.
///
/// Any of these ends the run in the `Error` state.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Model reported an error: {0}")]
    ModelSide(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Stream closed without a final response")]
    MissingFinal,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("tool `{0}` not found")]
    NotFound(String),

    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// A handler reported failure. Displays only the reason.
    #[error("{0}")]
    Failed(String),

    #[error("tool `{tool_name}` timed out after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("remote tool call failed: {0}")]
    Remote(String),

    #[error("tool `{0}` panicked")]
    Panicked(String),
}

impl ToolError {
    /// Shorthand for a handler-side failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{hook} hook failed: {reason}")]
pub struct HookError {
    pub hook: &'static str,
    pub reason: String,
}

impl HookError {
    pub fn new(hook: &'static str, reason: impl Into<String>) -> Self {
        Self {
            hook,
            reason: reason.into(),
        }
    }
}
