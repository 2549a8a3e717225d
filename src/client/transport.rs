//! Request transport over the host's standard streams.
//!
//! [`Transport`] owns the write half of the control channel behind one
//! exclusive lock (one complete line per acquisition) and the reader tasks
//! that feed the [`Router`]. It is generic over the byte streams so the same
//! code runs against a child process or an in-memory
//! [`tokio::io::duplex`] pair.
//!
//! # Calls
//!
//! - [`Transport::send_await`] registers a waiter, writes the request and
//!   suspends the calling task until the reply, the deadline or cancellation.
//! - [`Transport::send_stream`] registers a stream *before* writing and
//!   returns a [`StreamHandle`] yielding records in arrival order.
//!
//! Registrations are removed when the call ends for any reason, so a record
//! arriving after a timeout or cancellation lands in the unsolicited queue.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::reader::run_reader;
use crate::client::router::{Router, StreamQueue};
use crate::protocol::codec::write_envelope;
use crate::protocol::envelope::{Envelope, Request, Response, StreamSource};
use crate::{AppError, Result};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Tunables for a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Records buffered per open stream before the oldest is dropped.
    pub stream_capacity: usize,
    /// Records buffered in the unsolicited queue.
    pub unsolicited_capacity: usize,
    /// Optional per-line cap; `None` lets the read buffer grow.
    pub max_line_bytes: Option<usize>,
    /// Deadline used by [`Transport::call`].
    pub request_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            stream_capacity: 256,
            unsolicited_capacity: 100,
            max_line_bytes: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Write half plus routing state for one host connection.
pub struct Transport {
    router: Arc<Router>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    options: TransportOptions,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("router", &self.router)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Connect to a host through `input` (its stdin) and `output` (its
    /// stdout) and start the stdout reader.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn connect<W, R>(input: W, output: R, options: TransportOptions) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let router = Arc::new(Router::new(
            options.stream_capacity,
            options.unsolicited_capacity,
        ));
        let cancel = CancellationToken::new();

        let stdout_task = tokio::spawn(run_reader(
            StreamSource::Stdout,
            output,
            Arc::clone(&router),
            options.max_line_bytes,
            cancel.child_token(),
        ));

        Arc::new(Self {
            router,
            writer: tokio::sync::Mutex::new(Some(Box::new(input))),
            readers: Mutex::new(vec![stdout_task]),
            cancel,
            options,
        })
    }

    /// Start a reader for the host's stderr; its lines become unsolicited
    /// records tagged [`StreamSource::Stderr`].
    pub fn attach_stderr<E>(&self, stderr: E)
    where
        E: AsyncRead + Send + Unpin + 'static,
    {
        let task = tokio::spawn(run_reader(
            StreamSource::Stderr,
            stderr,
            Arc::clone(&self.router),
            self.options.max_line_bytes,
            self.cancel.child_token(),
        ));
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Routing table of this connection.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Options the transport was built with.
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Whether the connection can still carry requests.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.router.terminated().is_none()
    }

    // ── Writing ───────────────────────────────────────────────────────────────

    /// Write one request line without registering a waiter.
    ///
    /// # Errors
    ///
    /// - [`AppError::ProcessNotRunning`] if the connection is closed.
    /// - [`AppError::Transport`] if the write fails; the connection is then
    ///   terminated for every outstanding call.
    pub async fn send(&self, request: &Request) -> Result<()> {
        if !self.is_open() {
            return Err(AppError::ProcessNotRunning);
        }
        let envelope = Envelope::Request(request.clone());

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(AppError::ProcessNotRunning);
        };
        if let Err(err) = write_envelope(stream, &envelope).await {
            if matches!(err, AppError::Transport(_)) {
                warn!(request_id = %request.id, error = %err, "transport: write failed");
                writer.take();
                drop(writer);
                self.router
                    .terminate_all(AppError::ProcessTerminated(err.to_string()));
            }
            return Err(err);
        }
        debug!(request_id = %request.id, method = %request.method, "transport: request sent");
        Ok(())
    }

    /// Close the host's input so it reads EOF. Returns whether it was open.
    pub async fn close_input(&self) -> bool {
        let taken = self.writer.lock().await.take();
        match taken {
            Some(mut stream) => {
                if let Err(err) = stream.shutdown().await {
                    debug!(error = %err, "transport: shutdown of host input failed");
                }
                true
            }
            None => false,
        }
    }

    // ── Single reply ──────────────────────────────────────────────────────────

    /// Send `request` and wait for its reply.
    ///
    /// Failed replies (`success: false`) are returned as responses; use
    /// [`Response::into_result`] to turn them into errors.
    ///
    /// # Errors
    ///
    /// - [`AppError::ProcessNotRunning`] if the connection is closed.
    /// - [`AppError::DuplicateRequestId`] if `request.id` is outstanding.
    /// - [`AppError::Timeout`] if no reply arrives within `timeout`.
    /// - [`AppError::Cancelled`] if `cancel` fires first.
    /// - [`AppError::ProcessTerminated`] if the host goes away meanwhile.
    pub async fn send_await(
        &self,
        request: &Request,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        if !self.is_open() {
            return Err(AppError::ProcessNotRunning);
        }
        let rx = self.router.register_pending(&request.id)?;
        let _guard = PendingGuard {
            router: &self.router,
            id: &request.id,
        };

        self.send(request).await?;

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(request_id = %request.id, "transport: call cancelled");
                Err(AppError::Cancelled)
            }

            reply = tokio::time::timeout(timeout, rx) => match reply {
                Err(_elapsed) => Err(AppError::Timeout(format!(
                    "no reply to {} within {timeout:?}",
                    request.id
                ))),
                Ok(Err(_closed)) => Err(self
                    .router
                    .terminated()
                    .unwrap_or_else(|| AppError::ProcessTerminated("reply slot dropped".into()))),
                Ok(Ok(result)) => result,
            },
        }
    }

    /// [`send_await`](Self::send_await) with the configured request timeout
    /// and no external cancellation.
    ///
    /// # Errors
    ///
    /// See [`send_await`](Self::send_await).
    pub async fn call(&self, request: &Request) -> Result<Response> {
        self.send_await(request, self.options.request_timeout, &CancellationToken::new())
            .await
    }

    // ── Streams ───────────────────────────────────────────────────────────────

    /// Register a stream for `request.id`, then send `request`.
    ///
    /// # Errors
    ///
    /// - [`AppError::ProcessNotRunning`] if the connection is closed.
    /// - [`AppError::DuplicateRequestId`] if a stream for the id is open.
    /// - Any error from [`send`](Self::send); the registration is removed.
    pub async fn send_stream(&self, request: &Request) -> Result<StreamHandle> {
        if !self.is_open() {
            return Err(AppError::ProcessNotRunning);
        }
        let queue = self.router.register_stream(&request.id)?;
        let handle = StreamHandle {
            id: request.id.clone(),
            queue,
            router: Arc::clone(&self.router),
        };
        self.send(request).await?;
        Ok(handle)
    }

    // ── Ready / teardown ──────────────────────────────────────────────────────

    /// Wait for the host's ready announcement.
    ///
    /// Returns immediately if it already arrived.
    ///
    /// # Errors
    ///
    /// - [`AppError::Timeout`] if it does not arrive within `timeout`.
    /// - The termination error if the connection closes first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<Response> {
        let mut rx = self.router.subscribe_ready();
        let current = rx.borrow().clone();
        if let Some(ready) = current {
            return Ok(ready);
        }
        let closed = self.router.closed();

        let wait = async move {
            match rx.wait_for(Option::is_some).await {
                Ok(ready) => ready.clone(),
                Err(_) => None,
            }
        };

        tokio::select! {
            () = closed.cancelled() => Err(self
                .router
                .terminated()
                .unwrap_or(AppError::ProcessNotRunning)),
            ready = tokio::time::timeout(timeout, wait) => match ready {
                Ok(Some(ready)) => Ok(ready),
                Ok(None) => Err(AppError::ProcessNotRunning),
                Err(_elapsed) => Err(AppError::Timeout(format!(
                    "host not ready within {timeout:?}"
                ))),
            },
        }
    }

    /// Wait up to `timeout` for the reader tasks to drain and finish.
    pub async fn join_readers(&self, timeout: Duration) {
        let handles: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                debug!("transport: reader did not finish in time");
            }
        }
    }

    /// Stop the reader tasks and fail every outstanding call with `reason`.
    pub async fn shutdown(&self, reason: AppError) {
        self.close_input().await;
        self.cancel.cancel();
        self.router.terminate_all(reason);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Removes a pending registration when the call ends.
struct PendingGuard<'a> {
    router: &'a Router,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.router.remove_pending(self.id);
    }
}

/// Consumer side of one streaming call.
///
/// Dropping the handle closes the stream; records arriving afterwards go to
/// the unsolicited queue.
#[derive(Debug)]
pub struct StreamHandle {
    id: String,
    queue: Arc<StreamQueue>,
    router: Arc<Router>,
}

impl StreamHandle {
    /// Identifier of the call.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next record in arrival order.
    ///
    /// Returns `None` once the stream closed cleanly (after its terminal
    /// record) and `Some(Err(_))` once if it was terminated.
    pub async fn next(&mut self) -> Option<Result<Response>> {
        self.queue.pop().await
    }

    /// [`next`](Self::next), abandoning the stream when `cancel` fires.
    pub async fn next_or_cancel(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<Result<Response>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.close();
                Some(Err(AppError::Cancelled))
            }
            item = self.queue.pop() => item,
        }
    }

    /// Stop receiving records for this call.
    pub fn close(&mut self) {
        self.router.release_stream(&self.id, &self.queue);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}
