//! Bridge to remote tool-protocol endpoints.
//!
//! Calls are forwarded verbatim; the typed result (text, image, embedded
//! resource) is translated into a uniform [`ToolOutcome`]. Binary content
//! goes straight to the recipient through the run's sink and is described
//! generically in the transcript.

use clawloop_core::error::ToolError;
use clawloop_core::tool::{RemoteCallResult, RemoteContent, RemoteToolClient, ToolContext, ToolOutcome};
use tracing::debug;

/// Forward one call and translate its result.
pub async fn call_remote(
    client: &dyn RemoteToolClient,
    remote_name: &str,
    arguments: serde_json::Value,
    ctx: &ToolContext,
) -> Result<ToolOutcome, ToolError> {
    debug!(endpoint = client.endpoint(), tool = remote_name, "Forwarding remote tool call");
    let result = client.call_tool(remote_name, arguments).await?;
    Ok(translate(result, ctx))
}

/// Translate a remote result into a tool outcome.
pub fn translate(result: RemoteCallResult, ctx: &ToolContext) -> ToolOutcome {
    let mut lines: Vec<String> = Vec::new();

    for item in result.content {
        match item {
            RemoteContent::Text { text } => lines.push(text),
            RemoteContent::Image { data, mime_type } => {
                lines.push(sent_directly(&mime_type));
                ctx.send_attachment(mime_type, data);
            }
            RemoteContent::Resource {
                uri,
                mime_type,
                text,
                blob,
            } => match (text, blob) {
                (Some(text), _) => lines.push(text),
                (None, Some(blob)) => {
                    let mime = mime_type.unwrap_or_else(|| "application/octet-stream".into());
                    lines.push(sent_directly(&mime));
                    ctx.send_attachment(mime, blob);
                }
                (None, None) => lines.push(format!("[empty resource {uri}]")),
            },
        }
    }

    let body = lines.join("\n");
    if result.is_error {
        if body.is_empty() {
            ToolOutcome::Error("remote tool reported an error".into())
        } else {
            ToolOutcome::Error(body)
        }
    } else {
        ToolOutcome::Value(body)
    }
}

fn sent_directly(mime_type: &str) -> String {
    let what = if mime_type.starts_with("image/") {
        "An image"
    } else {
        "A binary file"
    };
    format!("[{what} ({mime_type}) was sent to the user directly]")
}
