//! Typed events carried by streaming calls.
//!
//! A streamed record's `type` string selects how its `result` is parsed:
//!
//! | `type`                 | Variant                                   |
//! |------------------------|-------------------------------------------|
//! | `tool_call`            | [`StreamEvent::ToolCall`]                 |
//! | `tool_calls_completed` | [`StreamEvent::ToolCallsCompleted`]       |
//! | `output_text_delta`    | [`StreamEvent::OutputTextDelta`]          |
//! | `output_text`          | [`StreamEvent::OutputText`]               |
//! | `response.requested`   | [`StreamEvent::ResponseRequested`]        |
//! | `status` or absent     | [`StreamEvent::Status`]                   |
//! | *(any other)*          | [`StreamEvent::Unknown`]                  |
//!
//! Unrecognised types are kept rather than coerced. Their payload is still
//! checked for a `{threadId, status}` shape and the match is exposed as
//! [`StreamEvent::Unknown::status`], so a host that reports completion under
//! a type this build does not know still terminates the stream.

use serde::{Deserialize, Serialize};

use crate::protocol::envelope::{Payload, Response};
use crate::{AppError, Result};

/// `type` of a tool-call record.
pub const TOOL_CALL: &str = "tool_call";
/// `type` of a tool-results batch record.
pub const TOOL_CALLS_COMPLETED: &str = "tool_calls_completed";
/// `type` of a partial-text record.
pub const OUTPUT_TEXT_DELTA: &str = "output_text_delta";
/// `type` of a full-text record.
pub const OUTPUT_TEXT: &str = "output_text";
/// `type` of a backend-requested response record.
pub const RESPONSE_REQUESTED: &str = "response.requested";
/// `type` of a status record.
pub const STATUS: &str = "status";
/// `type` of the host's ready announcement.
pub const READY: &str = "ready";

/// Status value that ends an agent invocation.
pub const STATUS_COMPLETED: &str = "completed";
/// Status value that ends a trigger invocation that only schedules work.
pub const STATUS_INVOKED: &str = "invoked";
/// Status announcing the thread id before a run's first round.
pub const STATUS_STARTED: &str = "started";

/// A backend-requested function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Tool name.
    pub name: String,
    /// Host-assigned identifier, unique per invocation.
    #[serde(rename = "callId")]
    pub call_id: String,
    /// Tool arguments (object or raw string).
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Output of one tool call, as fed back to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Identifier of the call this answers.
    pub call_id: String,
    /// Serialised tool output (or error text).
    pub output: String,
    /// Result kind; always `function_call_output` from this host.
    #[serde(rename = "type", default = "default_result_kind")]
    pub kind: String,
}

fn default_result_kind() -> String {
    "function_call_output".to_owned()
}

impl ToolCallResult {
    /// Build a result for `call_id`.
    #[must_use]
    pub fn new(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: output.into(),
            kind: default_result_kind(),
        }
    }
}

/// One partial-text fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    /// Fragment text.
    pub delta: String,
    /// Position of the fragment within its message.
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
}

/// `{threadId, status}` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Conversation the invocation ran on.
    #[serde(rename = "threadId", default)]
    pub thread_id: String,
    /// Lifecycle status (`completed`, `invoked`, …).
    pub status: String,
}

impl StatusUpdate {
    /// Non-terminal `started` status for `thread_id`.
    #[must_use]
    pub fn started(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            status: STATUS_STARTED.to_owned(),
        }
    }

    /// `completed` status for `thread_id`.
    #[must_use]
    pub fn completed(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            status: STATUS_COMPLETED.to_owned(),
        }
    }

    /// Whether this status ends a streaming call.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status == STATUS_COMPLETED || self.status == STATUS_INVOKED
    }
}

// ── Wire shapes ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct ToolCallWire {
    #[serde(rename = "typeName", default)]
    type_name: Option<String>,
    #[serde(rename = "toolCall")]
    tool_call: ToolCallRequest,
}

#[derive(Debug, Serialize, Deserialize)]
struct TextDeltaWire {
    #[serde(rename = "typeName", default)]
    type_name: Option<String>,
    #[serde(rename = "outputTextDelta")]
    output_text_delta: TextDelta,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputTextBody {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputTextWire {
    #[serde(rename = "outputText")]
    output_text: OutputTextBody,
}

// ── Stream events ─────────────────────────────────────────────────────────────

/// Parsed form of one streamed record.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The backend requested a tool call.
    ToolCall(ToolCallRequest),
    /// All tool calls of one round resolved.
    ToolCallsCompleted(Vec<ToolCallResult>),
    /// Partial text.
    OutputTextDelta(TextDelta),
    /// Full text of one message.
    OutputText(String),
    /// The backend asked the caller for a response; payload passed through.
    ResponseRequested(Payload),
    /// Invocation status.
    Status(StatusUpdate),
    /// A type this build does not recognise.
    Unknown {
        /// The unrecognised `type` string.
        event_type: String,
        /// Unparsed result.
        result: Option<Payload>,
        /// The result read as a status, when it has that shape.
        status: Option<StatusUpdate>,
    },
}

impl StreamEvent {
    /// Parse a successful streamed response.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when a recognised type carries a result
    /// of the wrong shape, and [`AppError::Remote`] for failed responses.
    pub fn from_response(resp: &Response) -> Result<Self> {
        if !resp.success {
            return Err(resp.clone().into_result::<serde_json::Value>().err().unwrap_or_else(
                || AppError::Protocol("failed response without error".into()),
            ));
        }

        let event_type = resp.event_type.as_deref().unwrap_or(STATUS);
        let result = resp.result.as_ref();
        let require = |what: &str| {
            result.ok_or_else(|| AppError::Protocol(format!("{what} record without result")))
        };

        let event = match event_type {
            TOOL_CALL => {
                let wire: ToolCallWire = require(TOOL_CALL)?.parse()?;
                Self::ToolCall(wire.tool_call)
            }
            TOOL_CALLS_COMPLETED => Self::ToolCallsCompleted(require(TOOL_CALLS_COMPLETED)?.parse()?),
            OUTPUT_TEXT_DELTA => {
                let wire: TextDeltaWire = require(OUTPUT_TEXT_DELTA)?.parse()?;
                Self::OutputTextDelta(wire.output_text_delta)
            }
            OUTPUT_TEXT => {
                let wire: OutputTextWire = require(OUTPUT_TEXT)?.parse()?;
                Self::OutputText(wire.output_text.text)
            }
            RESPONSE_REQUESTED => Self::ResponseRequested(require(RESPONSE_REQUESTED)?.clone()),
            STATUS => Self::Status(require(STATUS)?.parse()?),
            other => Self::Unknown {
                event_type: other.to_owned(),
                result: result.cloned(),
                status: result.and_then(|r| r.parse::<StatusUpdate>().ok()),
            },
        };
        Ok(event)
    }

    /// Wire `type` string of the event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::ToolCall(_) => TOOL_CALL,
            Self::ToolCallsCompleted(_) => TOOL_CALLS_COMPLETED,
            Self::OutputTextDelta(_) => OUTPUT_TEXT_DELTA,
            Self::OutputText(_) => OUTPUT_TEXT,
            Self::ResponseRequested(_) => RESPONSE_REQUESTED,
            Self::Status(_) => STATUS,
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    /// Status carried by the event, for `Status` and status-shaped `Unknown`.
    #[must_use]
    pub fn status(&self) -> Option<&StatusUpdate> {
        match self {
            Self::Status(status) => Some(status),
            Self::Unknown { status, .. } => status.as_ref(),
            _ => None,
        }
    }

    /// Whether the event's embedded status ends the call.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(StatusUpdate::is_terminal)
    }

    /// Encode as a streamed response tagged with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the payload cannot be serialised.
    pub fn to_response(&self, id: &str) -> Result<Response> {
        let payload = match self {
            Self::ToolCall(call) => Payload::from_serialize(&ToolCallWire {
                type_name: Some(TOOL_CALL.to_owned()),
                tool_call: call.clone(),
            })?,
            Self::ToolCallsCompleted(results) => Payload::from_serialize(results)?,
            Self::OutputTextDelta(delta) => Payload::from_serialize(&TextDeltaWire {
                type_name: Some(OUTPUT_TEXT_DELTA.to_owned()),
                output_text_delta: delta.clone(),
            })?,
            Self::OutputText(text) => Payload::from_serialize(&OutputTextWire {
                output_text: OutputTextBody { text: text.clone() },
            })?,
            Self::ResponseRequested(payload) => payload.clone(),
            Self::Status(status) => Payload::from_serialize(status)?,
            Self::Unknown { result, .. } => match result {
                Some(result) => result.clone(),
                None => Payload::from_json("null")?,
            },
        };
        Ok(Response::event(id, self.event_type(), payload))
    }
}
