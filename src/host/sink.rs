//! Where the host's replies and streamed events go.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncWrite;
use tracing::debug;

use crate::host::model::BoxFuture;
use crate::protocol::codec::write_envelope;
use crate::protocol::envelope::{Envelope, Response};
use crate::protocol::events::StreamEvent;
use crate::Result;

/// Receiver of the events one invocation produces.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Transport`] when the caller is gone.
    fn emit(&self, event: StreamEvent) -> BoxFuture<'_, Result<()>>;
}

/// Serialized writer over the host's output stream.
///
/// Every record is written whole under one lock so concurrent invocations
/// never interleave partial lines.
pub struct HostWriter {
    output: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl std::fmt::Debug for HostWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostWriter").finish_non_exhaustive()
    }
}

impl HostWriter {
    /// Wrap `output`.
    pub fn new(output: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            output: tokio::sync::Mutex::new(Box::new(output)),
        }
    }

    /// Write one response line.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Transport`] on write failure.
    pub async fn send(&self, response: Response) -> Result<()> {
        let envelope = Envelope::Response(response);
        let mut output = self.output.lock().await;
        write_envelope(&mut *output, &envelope).await
    }
}

/// Sink that writes events as records tagged with the request id.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    request_id: String,
    writer: Arc<HostWriter>,
}

impl ResponseSink {
    /// Sink for `request_id`.
    #[must_use]
    pub fn new(request_id: impl Into<String>, writer: Arc<HostWriter>) -> Self {
        Self {
            request_id: request_id.into(),
            writer,
        }
    }
}

impl EventSink for ResponseSink {
    fn emit(&self, event: StreamEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(request_id = %self.request_id, event_type = event.event_type(), "emit");
            let response = event.to_response(&self.request_id)?;
            self.writer.send(response).await
        })
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl CollectingSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: StreamEvent) -> BoxFuture<'_, Result<()>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Box::pin(async { Ok(()) })
    }
}
