//! Closure-backed tool handlers.
//!
//! Most local tools are a few lines of logic; wrapping them in a struct and
//! an `#[async_trait]` impl each time is noise. [`handler_fn`] turns an async
//! closure into an `Arc<dyn ToolHandler>`.

use async_trait::async_trait;
use clawloop_core::error::ToolError;
use clawloop_core::tool::{ToolContext, ToolHandler, ToolReply};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

/// A [`ToolHandler`] backed by a closure.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolReply, ToolError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolReply, ToolError>> + Send,
{
    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: Map<String, Value>,
    ) -> Result<ToolReply, ToolError> {
        (self.f)(ctx.clone(), arguments).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolReply, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

/// Fetch a required string argument.
pub fn required_str<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing '{key}' argument")))
}
