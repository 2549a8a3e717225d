//! Correlation and streaming routing of host records.
//!
//! The [`Router`] owns three destinations:
//!
//! - **Streams**: per-identifier [`RecordQueue`]s for calls answered by a
//!   sequence of records. Consulted first.
//! - **Pending**: per-identifier one-shot slots for single-reply calls.
//! - **Unsolicited**: a shared bounded queue for everything else (stderr
//!   lines, undecodable lines, the ready announcement, late replies).
//!
//! Each map has its own lock, held only for the lookup/insert/remove and
//! never across an `.await`. A record is delivered to at most one
//! destination.
//!
//! [`Router::terminate_all`] resolves every pending slot and stream with the
//! same error; registrations attempted afterwards fail immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::queue::RecordQueue;
use crate::protocol::envelope::{Envelope, OutputRecord, Response, StreamSource, READY_ID};
use crate::protocol::events::{
    StatusUpdate, OUTPUT_TEXT, OUTPUT_TEXT_DELTA, RESPONSE_REQUESTED, TOOL_CALL,
    TOOL_CALLS_COMPLETED,
};
use crate::{AppError, Result};

/// Queue backing one streaming call.
pub type StreamQueue = RecordQueue<Response>;

type PendingSlot = oneshot::Sender<Result<Response>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `resp` is the last record of its stream.
///
/// Failed records end the stream. Records of the known non-status types
/// never do. Everything else (plain `status`, untyped, unknown types) ends
/// the stream when its result reads as a `completed` / `invoked` status.
///
/// `output_text` seals one message but not the run: a tool-calling run
/// emits one per round before its final status.
#[must_use]
pub fn ends_stream(resp: &Response) -> bool {
    if !resp.success {
        return true;
    }
    match resp.event_type.as_deref() {
        Some(TOOL_CALL | TOOL_CALLS_COMPLETED | OUTPUT_TEXT_DELTA | OUTPUT_TEXT | RESPONSE_REQUESTED) => {
            false
        }
        _ => resp
            .result
            .as_ref()
            .and_then(|r| r.parse::<StatusUpdate>().ok())
            .is_some_and(|s| s.is_terminal()),
    }
}

/// Routing table shared by the reader tasks and the callers.
#[derive(Debug)]
pub struct Router {
    streams: Mutex<HashMap<String, Arc<StreamQueue>>>,
    pending: Mutex<HashMap<String, PendingSlot>>,
    unsolicited: Arc<RecordQueue<OutputRecord>>,
    ready: watch::Sender<Option<Response>>,
    terminated: Mutex<Option<AppError>>,
    closed: CancellationToken,
    stream_capacity: usize,
}

impl Router {
    /// Create a router with the given per-stream and unsolicited capacities.
    #[must_use]
    pub fn new(stream_capacity: usize, unsolicited_capacity: usize) -> Self {
        let (ready, _) = watch::channel(None);
        Self {
            streams: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            unsolicited: Arc::new(RecordQueue::new("unsolicited", unsolicited_capacity)),
            ready,
            terminated: Mutex::new(None),
            closed: CancellationToken::new(),
            stream_capacity,
        }
    }

    fn check_open(&self) -> Result<()> {
        match &*lock(&self.terminated) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Register a single-reply waiter for `id`.
    ///
    /// # Errors
    ///
    /// - [`AppError::DuplicateRequestId`] if a waiter for `id` exists.
    /// - The termination error if [`terminate_all`](Self::terminate_all) ran.
    pub fn register_pending(&self, id: &str) -> Result<oneshot::Receiver<Result<Response>>> {
        self.check_open()?;
        let mut pending = lock(&self.pending);
        if pending.contains_key(id) {
            return Err(AppError::DuplicateRequestId(id.to_owned()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_owned(), tx);
        Ok(rx)
    }

    /// Remove the waiter for `id`. Returns whether one was registered.
    pub fn remove_pending(&self, id: &str) -> bool {
        lock(&self.pending).remove(id).is_some()
    }

    /// Register a stream for `id`.
    ///
    /// # Errors
    ///
    /// - [`AppError::DuplicateRequestId`] if a stream for `id` is open.
    /// - The termination error if [`terminate_all`](Self::terminate_all) ran.
    pub fn register_stream(&self, id: &str) -> Result<Arc<StreamQueue>> {
        self.check_open()?;
        let mut streams = lock(&self.streams);
        if streams.contains_key(id) {
            return Err(AppError::DuplicateRequestId(id.to_owned()));
        }
        let queue = Arc::new(RecordQueue::new("stream", self.stream_capacity));
        streams.insert(id.to_owned(), Arc::clone(&queue));
        Ok(queue)
    }

    /// Remove and close the stream for `id`. Returns whether one was open.
    pub fn remove_stream(&self, id: &str) -> bool {
        let removed = lock(&self.streams).remove(id);
        match removed {
            Some(queue) => {
                queue.close(None);
                true
            }
            None => false,
        }
    }

    /// Remove the stream for `id` only if it is still `queue`, then close
    /// `queue`.
    pub fn release_stream(&self, id: &str, queue: &Arc<StreamQueue>) {
        {
            let mut streams = lock(&self.streams);
            if streams.get(id).is_some_and(|q| Arc::ptr_eq(q, queue)) {
                streams.remove(id);
            }
        }
        queue.close(None);
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    /// Deliver one record to its destination.
    pub fn route(&self, record: OutputRecord) {
        if record.source == StreamSource::Stderr {
            self.push_unsolicited(record);
            return;
        }

        let resp = match &record.parsed {
            Ok(Envelope::Response(resp)) => resp.clone(),
            Ok(Envelope::Request(req)) => {
                debug!(request_id = %req.id, method = %req.method, "router: host sent a request");
                self.push_unsolicited(record);
                return;
            }
            Err(err) => {
                warn!(kind = ?err.kind, error = %err, raw = %record.raw, "router: undecodable line");
                self.push_unsolicited(record);
                return;
            }
        };

        if resp.id == READY_ID {
            self.ready.send_replace(Some(resp));
            self.push_unsolicited(record);
            return;
        }

        let stream = lock(&self.streams).get(&resp.id).cloned();
        if let Some(queue) = stream {
            let terminal = ends_stream(&resp);
            let id = resp.id.clone();
            if queue.push(resp.clone()) {
                if terminal {
                    debug!(request_id = %id, "router: terminal record, closing stream");
                    self.remove_stream(&id);
                }
                return;
            }
        }

        let slot = lock(&self.pending).remove(&resp.id);
        if let Some(tx) = slot {
            let id = resp.id.clone();
            if tx.send(Ok(resp)).is_err() {
                debug!(request_id = %id, "router: waiter gone before reply arrived");
                self.push_unsolicited(record);
            }
            return;
        }

        debug!(request_id = %resp.id, "router: no waiter, routing to unsolicited");
        self.push_unsolicited(record);
    }

    fn push_unsolicited(&self, record: OutputRecord) {
        self.unsolicited.push(record);
    }

    // ── Termination ───────────────────────────────────────────────────────────

    /// Fail every outstanding waiter and stream with `reason`.
    ///
    /// The first call wins; later calls are no-ops.
    pub fn terminate_all(&self, reason: AppError) {
        {
            let mut terminated = lock(&self.terminated);
            if terminated.is_some() {
                return;
            }
            *terminated = Some(reason.clone());
        }

        let pending: Vec<_> = lock(&self.pending).drain().collect();
        let streams: Vec<_> = lock(&self.streams).drain().collect();
        debug!(
            pending = pending.len(),
            streams = streams.len(),
            reason = %reason,
            "router: terminating all waiters"
        );

        for (_, tx) in pending {
            let _ = tx.send(Err(reason.clone()));
        }
        for (_, queue) in streams {
            queue.close(Some(reason.clone()));
        }
        self.unsolicited.close(Some(reason));
        self.closed.cancel();
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// Termination reason, once [`terminate_all`](Self::terminate_all) ran.
    #[must_use]
    pub fn terminated(&self) -> Option<AppError> {
        lock(&self.terminated).clone()
    }

    /// Token cancelled when the router terminates.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Shared unsolicited queue.
    #[must_use]
    pub fn unsolicited(&self) -> Arc<RecordQueue<OutputRecord>> {
        Arc::clone(&self.unsolicited)
    }

    /// Receiver observing the ready announcement.
    #[must_use]
    pub fn subscribe_ready(&self) -> watch::Receiver<Option<Response>> {
        self.ready.subscribe()
    }

    /// Number of single-reply waiters outstanding.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Number of open streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }
}
