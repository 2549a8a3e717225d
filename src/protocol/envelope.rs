//! Envelopes exchanged on the control channel.
//!
//! Every line on the wire is one JSON object. Lines carrying a `method` are
//! requests (caller → host); all other lines are responses or events
//! (host → caller) correlated to a request by `id`.
//!
//! ```json
//! {"id":"listAgents:5f0c…","method":"listAgents"}
//! {"id":"listAgents:5f0c…","success":true,"result":[{"name":"Echo"}]}
//! {"id":"invokeAgent:81aa…","type":"output_text_delta","success":true,"result":{…}}
//! {"id":"invokeAgent:81aa…","success":false,"errorObj":{"code":"NOT_FOUND","message":"…"}}
//! ```
//!
//! `result` and `body` are kept as unparsed JSON text ([`Payload`]) so the
//! framing layer never inspects their shape; consumers parse lazily.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{AppError, Result};

/// Identifier reserved for the host's unsolicited startup announcement.
pub const READY_ID: &str = "ready";

/// Protocol version announced by the host and checked by the caller.
pub const PROTOCOL_VERSION: &str = "1";

// ── Payload ───────────────────────────────────────────────────────────────────

/// Opaque JSON payload, stored as raw text and parsed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// Serialise `value` into a compact payload.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if `value` cannot be serialised.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::value::to_raw_value(value)?))
    }

    /// Wrap already-encoded JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if `json` is not valid JSON.
    pub fn from_json(json: impl Into<String>) -> Result<Self> {
        Ok(Self(RawValue::from_string(json.into())?))
    }

    /// Parse the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the payload does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.0.get())?)
    }

    /// Raw JSON text of the payload.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.get()
    }

    /// Whether the payload is the JSON literal `null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.get().trim() == "null"
    }
}

/// Payloads are equal when they hold the same JSON value, whatever their
/// whitespace or key order.
impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        let (left, right) = (self.0.get(), other.0.get());
        left == right
            || matches!(
                (
                    serde_json::from_str::<serde_json::Value>(left),
                    serde_json::from_str::<serde_json::Value>(right),
                ),
                (Ok(a), Ok(b)) if a == b
            )
    }
}

impl Eq for Payload {}

// ── Error object ──────────────────────────────────────────────────────────────

/// Typed error code carried by failed responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request body failed validation against the method's parameters.
    InvalidParams,
    /// Named agent, tool, trigger or thread does not exist.
    NotFound,
    /// `method` is not one the host implements.
    UnknownMethod,
    /// Unexpected host-side failure.
    InternalError,
    /// A directly invoked tool failed.
    ToolError,
    /// Input failed a semantic check.
    ValidationError,
    /// The line was not valid JSON.
    ParseError,
    /// The JSON object is not a valid request (missing `id` or `method`).
    InvalidRequest,
    /// Code not known to this build.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Wire spelling of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "INVALID_PARAMS",
            Self::NotFound => "NOT_FOUND",
            Self::UnknownMethod => "UNKNOWN_METHOD",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ToolError => "TOOL_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Code for a wire spelling; unrecognised spellings map to `Unknown`.
    #[must_use]
    pub fn from_wire(code: &str) -> Self {
        match code {
            "INVALID_PARAMS" => Self::InvalidParams,
            "NOT_FOUND" => Self::NotFound,
            "UNKNOWN_METHOD" => Self::UnknownMethod,
            "INTERNAL_ERROR" => Self::InternalError,
            "TOOL_ERROR" => Self::ToolError,
            "VALIDATION_ERROR" => Self::ValidationError,
            "PARSE_ERROR" => Self::ParseError,
            "INVALID_REQUEST" => Self::InvalidRequest,
            _ => Self::Unknown,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error details attached to a failed response.
///
/// A code this build does not recognise decodes as [`ErrorCode::Unknown`]
/// and keeps its original spelling for display and re-encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "ErrorObjectWire", into = "ErrorObjectWire")]
pub struct ErrorObject {
    /// Typed error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional extra context.
    pub details: Option<String>,
    unrecognised_code: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ErrorObjectWire {
    code: String,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl From<ErrorObjectWire> for ErrorObject {
    fn from(wire: ErrorObjectWire) -> Self {
        let code = ErrorCode::from_wire(&wire.code);
        Self {
            code,
            message: wire.message,
            details: wire.details,
            unrecognised_code: (code == ErrorCode::Unknown).then_some(wire.code),
        }
    }
}

impl From<ErrorObject> for ErrorObjectWire {
    fn from(obj: ErrorObject) -> Self {
        Self {
            code: obj.code_str().to_owned(),
            message: obj.message,
            details: obj.details,
        }
    }
}

impl ErrorObject {
    /// Build an error object without details.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            unrecognised_code: None,
        }
    }

    /// Code as spelled on the wire.
    #[must_use]
    pub fn code_str(&self) -> &str {
        self.unrecognised_code
            .as_deref()
            .unwrap_or_else(|| self.code.as_str())
    }

    /// Attach details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl Display for ErrorObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, message: {}", self.code_str(), self.message)
    }
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// Caller → host request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Request {
    /// Caller-assigned identifier, unique while the request is outstanding.
    pub id: String,
    /// Host method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Payload>,
}

impl Request {
    /// Build a request, serialising `body` when present.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the body cannot be serialised.
    pub fn new<B: Serialize>(
        id: impl Into<String>,
        method: impl Into<String>,
        body: Option<&B>,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            method: method.into(),
            body: body.map(Payload::from_serialize).transpose()?,
        })
    }

    /// Build a request without a body.
    #[must_use]
    pub fn bare(id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            body: None,
        }
    }

    /// Parse the body, treating an absent body as an error.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when the body is missing or malformed.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.body {
            Some(body) => body.parse(),
            None => Err(AppError::Protocol(format!(
                "method {} requires a body",
                self.method
            ))),
        }
    }
}

/// Host → caller response or streamed event.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Response {
    /// Identifier of the request that produced this record.
    pub id: String,
    /// Event type for streamed records; absent on plain responses.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Whether the request succeeded.
    pub success: bool,
    /// Result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    /// Error details when `success` is false.
    #[serde(rename = "errorObj", skip_serializing_if = "Option::is_none")]
    pub error_obj: Option<ErrorObject>,
}

impl Response {
    /// Successful single-reply response.
    #[must_use]
    pub fn ok(id: impl Into<String>, result: Payload) -> Self {
        Self {
            id: id.into(),
            event_type: None,
            success: true,
            result: Some(result),
            error_obj: None,
        }
    }

    /// Successful streamed event of the given type.
    #[must_use]
    pub fn event(id: impl Into<String>, event_type: impl Into<String>, result: Payload) -> Self {
        Self {
            id: id.into(),
            event_type: Some(event_type.into()),
            success: true,
            result: Some(result),
            error_obj: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn error(id: impl Into<String>, error: ErrorObject) -> Self {
        Self {
            id: id.into(),
            event_type: None,
            success: false,
            result: None,
            error_obj: Some(error),
        }
    }

    /// Convert a failed response into an error, or parse the result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`] for failed responses and
    /// [`AppError::Protocol`] when the result does not match `T`.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if !self.success {
            return Err(AppError::Remote(self.error_obj.unwrap_or_else(|| {
                ErrorObject::new(ErrorCode::InternalError, "request failed without errorObj")
            })));
        }
        match self.result {
            Some(result) => result.parse(),
            None => Ok(serde_json::from_str("null")?),
        }
    }
}

/// Coarse classification of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Caller → host request.
    Request,
    /// Single successful reply.
    Response,
    /// Streamed record carrying a `type`.
    Event,
    /// Failed reply.
    Error,
}

/// One framed record on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Caller → host.
    Request(Request),
    /// Host → caller.
    Response(Response),
}

impl Envelope {
    /// Correlation identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Request(req) => &req.id,
            Self::Response(resp) => &resp.id,
        }
    }

    /// Classify the envelope.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Response(resp) if !resp.success => MessageKind::Error,
            Self::Response(resp) if resp.event_type.is_some() => MessageKind::Event,
            Self::Response(_) => MessageKind::Response,
        }
    }

    /// Borrow the response, if this is one.
    #[must_use]
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(resp) => Some(resp),
            Self::Request(_) => None,
        }
    }
}

impl From<Request> for Envelope {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for Envelope {
    fn from(resp: Response) -> Self {
        Self::Response(resp)
    }
}

// ── Decode errors ─────────────────────────────────────────────────────────────

/// Why a line could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The bytes were not valid UTF-8.
    InvalidUtf8,
    /// The stream ended in the middle of a line.
    Truncated,
    /// The line exceeded the configured length cap.
    TooLong,
    /// The text was not a JSON object.
    MalformedJson,
    /// Valid JSON that is not a valid envelope.
    InvalidEnvelope,
}

/// A line that failed to decode, with the offending text preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Failure classification.
    pub kind: DecodeErrorKind,
    /// Human-readable reason.
    pub message: String,
    /// The raw line (lossily decoded when not UTF-8).
    pub raw: String,
}

impl DecodeError {
    fn new(kind: DecodeErrorKind, message: impl Into<String>, raw: &str) -> Self {
        Self {
            kind,
            message: message.into(),
            raw: raw.to_owned(),
        }
    }

    /// Protocol error code a host reports for this failure.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self.kind {
            DecodeErrorKind::InvalidEnvelope => ErrorCode::InvalidRequest,
            _ => ErrorCode::ParseError,
        }
    }
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        Self::Framing(format!("{}: {}", err.message, err.raw))
    }
}

// ── Encode / decode ───────────────────────────────────────────────────────────

/// Every field either direction may carry; classified after parsing.
#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<Payload>,
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Option<Payload>,
    #[serde(rename = "errorObj", default)]
    error_obj: Option<ErrorObject>,
}

/// Serialise an envelope as one `\n`-terminated line.
///
/// The returned line contains exactly one newline, at the end.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if serialisation fails.
pub fn encode(envelope: &Envelope) -> Result<String> {
    let mut line = match envelope {
        Envelope::Request(req) => serde_json::to_string(req)?,
        Envelope::Response(resp) => serde_json::to_string(resp)?,
    };
    if line.contains('\n') {
        // Raw payloads keep their original whitespace; re-serialising through
        // `Value` compacts them.
        let value: serde_json::Value = serde_json::from_str(&line)?;
        line = serde_json::to_string(&value)?;
    }
    line.push('\n');
    Ok(line)
}

/// Parse one line (without its trailing newline) into an envelope.
///
/// # Errors
///
/// Returns a [`DecodeError`] carrying the raw line when the text is not a
/// JSON object or lacks the fields required for its kind.
pub fn decode(line: &str) -> std::result::Result<Envelope, DecodeError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let wire: WireMessage = serde_json::from_str(trimmed).map_err(|e| {
        let kind = if e.is_data() {
            DecodeErrorKind::InvalidEnvelope
        } else {
            DecodeErrorKind::MalformedJson
        };
        DecodeError::new(kind, format!("malformed json: {e}"), trimmed)
    })?;

    let Some(id) = wire.id else {
        return Err(DecodeError::new(
            DecodeErrorKind::InvalidEnvelope,
            "missing required field: id",
            trimmed,
        ));
    };

    if let Some(method) = wire.method {
        return Ok(Envelope::Request(Request {
            id,
            method,
            body: wire.body,
        }));
    }

    // A response without `success` is judged by whether it carries an error.
    let success = wire.success.unwrap_or(wire.error_obj.is_none());
    Ok(Envelope::Response(Response {
        id,
        event_type: wire.event_type,
        success,
        result: wire.result,
        error_obj: wire.error_obj,
    }))
}

// ── Output records ────────────────────────────────────────────────────────────

/// Stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    /// The host's standard output (the protocol channel).
    Stdout,
    /// The host's standard error (diagnostics).
    Stderr,
}

impl Display for StreamSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// A received line with its source, raw text, parse outcome and arrival time.
///
/// Lines that are not envelopes are kept, with `parsed` holding the error.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    /// Stream the line arrived on.
    pub source: StreamSource,
    /// Raw line text, without the trailing newline.
    pub raw: String,
    /// Decoded envelope, or why decoding failed.
    pub parsed: std::result::Result<Envelope, DecodeError>,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

impl OutputRecord {
    /// Build a record stamped with the current time.
    #[must_use]
    pub fn new(
        source: StreamSource,
        raw: String,
        parsed: std::result::Result<Envelope, DecodeError>,
    ) -> Self {
        Self {
            source,
            raw,
            parsed,
            received_at: Utc::now(),
        }
    }

    /// Decoded envelope, if any.
    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        self.parsed.as_ref().ok()
    }

    /// Decoded response, if any.
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        self.envelope().and_then(Envelope::as_response)
    }

    /// Correlation identifier, if the line decoded.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.envelope().map(Envelope::id)
    }
}
