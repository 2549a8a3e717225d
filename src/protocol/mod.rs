//! Control protocol shared by the caller and the host.
//!
//! Framing and envelope handling live here so both halves agree on the wire
//! format; neither side inspects the other's internals.

pub mod codec;
pub mod envelope;
pub mod events;
pub mod types;

pub use envelope::{
    decode, encode, DecodeError, DecodeErrorKind, Envelope, ErrorCode, ErrorObject,
    MessageKind, OutputRecord, Payload, Request, Response, StreamSource, PROTOCOL_VERSION,
    READY_ID,
};
pub use events::{StatusUpdate, StreamEvent, TextDelta, ToolCallRequest, ToolCallResult};
