//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::protocol::envelope::{ErrorCode, ErrorObject};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// A line could not be turned into an envelope.
    Framing(String),
    /// Well-formed JSON that violates the control protocol (missing id, bad body).
    Protocol(String),
    /// Writing to or reading from the host's standard streams failed.
    Transport(String),
    /// An operation required a running host process.
    ProcessNotRunning,
    /// `start` was called on a supervisor that is already running or stopping.
    AlreadyRunning,
    /// The host process could not be launched.
    Spawn(String),
    /// A blocking call did not complete within its deadline.
    Timeout(String),
    /// The caller cancelled a blocking call.
    Cancelled,
    /// The host process exited (or its stdout closed) while the call was in flight.
    ProcessTerminated(String),
    /// A request or stream with the same identifier is already outstanding.
    DuplicateRequestId(String),
    /// The host answered with `success: false`.
    Remote(ErrorObject),
    /// Request body does not match the method's parameters.
    InvalidParams(String),
    /// The host does not implement the requested method.
    UnknownMethod(String),
    /// Input is well-formed but semantically wrong.
    Validation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A tool failed while executing.
    Tool(String),
    /// The model backend failed.
    Model {
        /// Human-readable failure description.
        message: String,
        /// Whether the backend classified the failure as transient.
        retryable: bool,
    },
    /// A stream ended without a terminal record.
    AbnormalCompletion(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Protocol error code reported to the caller when this error ends a request.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Framing(_) => ErrorCode::ParseError,
            Self::Protocol(_) | Self::DuplicateRequestId(_) => ErrorCode::InvalidRequest,
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::UnknownMethod(_) => ErrorCode::UnknownMethod,
            Self::Config(_) | Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Tool(_) => ErrorCode::ToolError,
            Self::Remote(obj) => obj.code,
            _ => ErrorCode::InternalError,
        }
    }

    /// Convert into the wire error object for an error envelope.
    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        if let Self::Remote(obj) = self {
            return obj.clone();
        }
        ErrorObject::new(self.error_code(), self.to_string())
    }

    /// Whether the failure was classified as transient by the model backend.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Model { retryable: true, .. })
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Framing(msg) => write!(f, "framing: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::ProcessNotRunning => write!(f, "transport: process not running"),
            Self::AlreadyRunning => write!(f, "supervisor: process already running"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ProcessTerminated(msg) => write!(f, "process terminated: {msg}"),
            Self::DuplicateRequestId(id) => write!(f, "duplicate request id: {id}"),
            Self::Remote(obj) => write!(f, "remote: {obj}"),
            Self::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
            Self::UnknownMethod(method) => write!(f, "unknown method: {method}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Tool(msg) => write!(f, "tool: {msg}"),
            Self::Model { message, retryable } => {
                if *retryable {
                    write!(f, "model (retryable): {message}")
                } else {
                    write!(f, "model: {message}")
                }
            }
            Self::AbnormalCompletion(msg) => write!(f, "abnormal completion: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid payload: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
