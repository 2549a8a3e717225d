//! Built-in `echo` model.
//!
//! Replies with the user's prompt, streamed word by word. A prompt line of
//! the form `/tool <name> [json-args]` requests that tool instead; the next
//! round then echoes the tool outputs. Useful for demos and end-to-end
//! tests without a real backend.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::host::model::{
    fatal_error, BoxFuture, Model, ModelEvent, ModelInput, ModelThread, ThreadSettings,
};
use crate::protocol::events::{TextDelta, ToolCallRequest};
use crate::Result;

/// Identifier of the echo model.
pub const ECHO_MODEL: &str = "echo";

const TOOL_DIRECTIVE: &str = "/tool ";

/// The echo backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoModel;

impl Model for EchoModel {
    fn identifier(&self) -> &str {
        ECHO_MODEL
    }

    fn start_thread(
        &self,
        settings: ThreadSettings,
    ) -> BoxFuture<'_, Result<Arc<dyn ModelThread>>> {
        Box::pin(async move {
            let thread: Arc<dyn ModelThread> = Arc::new(EchoThread {
                id: format!("thread_{}", Uuid::new_v4().simple()),
                settings,
            });
            Ok(thread)
        })
    }
}

/// One echo conversation.
#[derive(Debug)]
pub struct EchoThread {
    id: String,
    settings: ThreadSettings,
}

impl EchoThread {
    /// Agent the thread was opened for.
    #[must_use]
    pub fn agent(&self) -> &str {
        &self.settings.agent
    }
}

impl ModelThread for EchoThread {
    fn thread_id(&self) -> &str {
        &self.id
    }

    fn invoke(
        &self,
        input: ModelInput,
        events: mpsc::Sender<ModelEvent>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let reply = match input {
                ModelInput::UserPrompt { text, attachments } => {
                    let calls = tool_directives(&text);
                    if !calls.is_empty() {
                        for call in calls {
                            send(&events, ModelEvent::ToolCall(call)).await?;
                        }
                        return Ok(());
                    }
                    let mut reply = text;
                    for file in attachments {
                        reply.push_str(&format!("\n[attachment: {} ({})]", file.name, file.mime_type));
                    }
                    reply
                }
                ModelInput::ToolResults(results) => results
                    .iter()
                    .map(|r| r.output.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            stream_text(&events, &reply).await
        })
    }
}

async fn send(events: &mpsc::Sender<ModelEvent>, event: ModelEvent) -> Result<()> {
    events
        .send(event)
        .await
        .map_err(|_| fatal_error("event receiver closed"))
}

/// Emit `text` as word deltas followed by the full text.
async fn stream_text(events: &mpsc::Sender<ModelEvent>, text: &str) -> Result<()> {
    for (seq, piece) in (0_u64..).zip(text.split_inclusive(' ')) {
        let delta = TextDelta {
            delta: piece.to_owned(),
            sequence_number: seq,
        };
        send(events, ModelEvent::OutputTextDelta(delta)).await?;
    }
    send(events, ModelEvent::OutputText(text.to_owned())).await
}

/// Parse `/tool <name> [json-args]` lines.
fn tool_directives(text: &str) -> Vec<ToolCallRequest> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix(TOOL_DIRECTIVE))
        .filter_map(|rest| {
            let rest = rest.trim();
            let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if name.is_empty() {
                return None;
            }
            let arguments = match args.trim() {
                "" => serde_json::Value::Object(serde_json::Map::new()),
                raw => serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.to_owned())),
            };
            Some(ToolCallRequest {
                name: name.to_owned(),
                call_id: format!("call_{}", Uuid::new_v4().simple()),
                arguments,
            })
        })
        .collect()
}
