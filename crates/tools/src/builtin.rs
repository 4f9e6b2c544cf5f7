//! Built-in tools shipped with the engine.
//!
//! Small, dependency-free tools that are useful for smoke-testing a model
//! configuration and for the `replay` CLI command.

use chrono::Utc;
use clawloop_core::error::ToolError;
use clawloop_core::tool::{Tool, ToolReply, ToolSet};
use serde_json::json;
use std::time::Duration;

use crate::function::{handler_fn, required_str};

/// Echo the `text` argument back.
pub fn echo() -> Tool {
    Tool::local(
        "echo",
        "Repeat the given text back verbatim.",
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to repeat" }
            },
            "required": ["text"]
        }),
        handler_fn(|_ctx, args| async move { required_str(&args, "text").map(ToolReply::text) }),
    )
}

/// Current UTC time, RFC 3339 by default or a custom strftime `format`.
pub fn current_time() -> Tool {
    Tool::local(
        "current_time",
        "Get the current date and time in UTC.",
        json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "description": "Optional strftime format, e.g. '%Y-%m-%d'"
                }
            }
        }),
        handler_fn(|_ctx, args| async move {
            let now = Utc::now();
            let text = match args.get("format").and_then(|v| v.as_str()) {
                Some(fmt) => {
                    let mut out = String::new();
                    use std::fmt::Write;
                    write!(out, "{}", now.format(fmt))
                        .map_err(|_| ToolError::InvalidArguments(format!("bad format '{fmt}'")))?;
                    out
                }
                None => now.to_rfc3339(),
            };
            Ok::<_, ToolError>(ToolReply::Text(text))
        }),
    )
}

/// Echo after a delay, detached from the run that asked for it.
pub fn delayed_echo() -> Tool {
    Tool::background(
        "delayed_echo",
        "Repeat text back after a delay. Runs in the background; the result arrives later.",
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "delay_ms": { "type": "integer", "minimum": 0 }
            },
            "required": ["text"]
        }),
        handler_fn(|ctx, args| async move {
            let text = required_str(&args, "text")?.to_string();
            let delay = args.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(0);
            ctx.notify(format!("waiting {delay}ms"));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, ToolError>(ToolReply::Text(text))
        }),
    )
}

/// Every built-in tool.
pub fn builtin_tools() -> ToolSet {
    ToolSet::new()
        .with(echo())
        .with(current_time())
        .with(delayed_echo())
}
