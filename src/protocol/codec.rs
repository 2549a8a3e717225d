//! NDJSON codec for the control channel.
//!
//! Splits a byte stream into `\n`-delimited [`Frame`]s and writes
//! `\n`-terminated lines. Unlike [`tokio_util::codec::LinesCodec`], decoding
//! never fails on content: invalid UTF-8, over-long lines and a final
//! unterminated line are surfaced as frames so the reader can report them as
//! parse errors and keep going. Only I/O failures end the stream.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_conduit::protocol::codec::WireCodec;
//!
//! let reader = FramedRead::new(child_stdout, WireCodec::new());
//! ```

use std::borrow::Cow;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::envelope::{
    decode, encode, DecodeError, DecodeErrorKind, Envelope, OutputRecord, StreamSource,
};
use crate::{AppError, Result};

/// How a frame ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    /// Terminated by `\n`.
    Newline,
    /// The stream ended before the line's newline arrived.
    Eof,
    /// The line exceeded the configured cap; `bytes` holds its prefix.
    Oversized,
}

/// One line read from the wire, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Line bytes, `\r\n` normalised away.
    pub bytes: Vec<u8>,
    /// How the line ended.
    pub end: FrameEnd,
}

impl Frame {
    /// Lossy text view of the line.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Whether the line is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.end == FrameEnd::Newline && self.bytes.iter().all(u8::is_ascii_whitespace)
    }

    /// Decode the frame into an envelope, preserving the raw text on failure.
    #[must_use]
    pub fn decode(&self) -> (String, std::result::Result<Envelope, DecodeError>) {
        let raw = self.text().into_owned();
        let failure = match self.end {
            FrameEnd::Oversized => Some((DecodeErrorKind::TooLong, "line too long")),
            FrameEnd::Eof => Some((DecodeErrorKind::Truncated, "stream ended before end of line")),
            FrameEnd::Newline if std::str::from_utf8(&self.bytes).is_err() => {
                Some((DecodeErrorKind::InvalidUtf8, "line is not valid utf-8"))
            }
            FrameEnd::Newline => None,
        };

        if let Some((kind, message)) = failure {
            let err = DecodeError {
                kind,
                message: message.into(),
                raw: raw.clone(),
            };
            return (raw, Err(err));
        }

        let parsed = decode(&raw);
        (raw, parsed)
    }

    /// Decode into an [`OutputRecord`] tagged with `source`.
    #[must_use]
    pub fn into_record(self, source: StreamSource) -> OutputRecord {
        let (raw, parsed) = self.decode();
        OutputRecord::new(source, raw, parsed)
    }
}

/// NDJSON codec for both directions of the control channel.
///
/// # Decoder
///
/// Buffers until a `\n` is seen; the buffer grows without bound unless a
/// cap was configured with [`WireCodec::with_max_length`]. Content problems
/// never produce decoder errors (which would pause a `FramedRead`); they are
/// reported through [`FrameEnd`] and [`Frame::decode`].
///
/// # Encoder
///
/// Writes `item` followed by `\n`. Items must not contain a newline; an
/// item that already ends with one is written as-is.
#[derive(Debug, Default)]
pub struct WireCodec {
    /// Offset into the buffer already scanned for a newline.
    next_index: usize,
    /// Optional maximum line length in bytes.
    max_length: Option<usize>,
    /// Set while skipping the remainder of an over-long line.
    discarding: bool,
}

impl WireCodec {
    /// Codec with no line-length cap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that cuts lines longer than `max_length` bytes.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: Some(max_length),
            ..Self::default()
        }
    }

    /// Codec built from an optional cap.
    #[must_use]
    pub fn from_limit(max_length: Option<usize>) -> Self {
        max_length.map_or_else(Self::new, Self::with_max_length)
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (newline, self.discarding) {
                (Some(index), true) => {
                    // End of the over-long line: drop it and resume.
                    src.advance(index + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (Some(index), false) => {
                    let mut line = src.split_to(index + 1);
                    self.next_index = 0;
                    line.truncate(index);
                    if line.last() == Some(&b'\r') {
                        line.truncate(index - 1);
                    }
                    if let Some(max) = self.max_length.filter(|max| line.len() > *max) {
                        line.truncate(max);
                        return Ok(Some(Frame {
                            bytes: line.to_vec(),
                            end: FrameEnd::Oversized,
                        }));
                    }
                    return Ok(Some(Frame {
                        bytes: line.to_vec(),
                        end: FrameEnd::Newline,
                    }));
                }
                (None, true) => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (None, false) => {
                    if let Some(max) = self.max_length.filter(|max| src.len() > *max) {
                        let prefix = src.split_to(max);
                        src.clear();
                        self.discarding = true;
                        self.next_index = 0;
                        return Ok(Some(Frame {
                            bytes: prefix.to_vec(),
                            end: FrameEnd::Oversized,
                        }));
                    }
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        let rest = src.split();
        self.next_index = 0;
        Ok(Some(Frame {
            bytes: rest.to_vec(),
            end: FrameEnd::Eof,
        }))
    }
}

impl Encoder<String> for WireCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        let body = item.strip_suffix('\n').unwrap_or(&item);
        if body.contains('\n') {
            return Err(AppError::Framing(
                "outbound line contains an embedded newline".into(),
            ));
        }
        dst.reserve(body.len() + 1);
        dst.put_slice(body.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Encode `envelope` and write it as one line, then flush.
///
/// Callers serialise concurrent writers themselves; one call writes one
/// complete line.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if the envelope cannot be serialised and
/// [`AppError::Transport`] if the write fails.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let line = encode(envelope)?;
    let mut buf = BytesMut::with_capacity(line.len());
    WireCodec::new().encode(line, &mut buf)?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| AppError::Transport(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AppError::Transport(format!("flush failed: {e}")))
}
