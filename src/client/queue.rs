//! Bounded drop-oldest record queue.
//!
//! The reader side pushes without ever waiting: when the queue is full the
//! oldest entry is discarded. Consumers pop asynchronously and observe the
//! queue's close reason once every queued entry has been delivered.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::warn;

use crate::{AppError, Result};

#[derive(Debug)]
enum Closed {
    Open,
    Clean,
    /// Taken by the first consumer that observes it.
    Failed(Option<AppError>),
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: Closed,
    dropped: u64,
}

/// Bounded queue that never blocks its producer.
#[derive(Debug)]
pub struct RecordQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> RecordQueue<T> {
    /// Create a queue holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: Closed::Open,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item`, discarding the oldest entry when full.
    ///
    /// Returns `false` (and drops `item`) when the queue is already closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.lock();
            if !matches!(state.closed, Closed::Open) {
                return false;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                warn!(
                    queue = self.name,
                    capacity = self.capacity,
                    dropped = state.dropped,
                    "queue full, dropped oldest record"
                );
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Close the queue. `reason` is delivered after the remaining entries;
    /// `None` ends the queue cleanly. Only the first close takes effect.
    pub fn close(&self, reason: Option<AppError>) {
        {
            let mut state = self.lock();
            if !matches!(state.closed, Closed::Open) {
                return;
            }
            state.closed = match reason {
                Some(err) => Closed::Failed(Some(err)),
                None => Closed::Clean,
            };
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Take the next entry without waiting.
    ///
    /// `None` means the queue is currently empty (or finished).
    pub fn try_pop(&self) -> Option<Result<T>> {
        let mut state = self.lock();
        if let Some(item) = state.items.pop_front() {
            return Some(Ok(item));
        }
        match &mut state.closed {
            Closed::Failed(err) => err.take().map(Err),
            Closed::Open | Closed::Clean => None,
        }
    }

    /// Wait for the next entry.
    ///
    /// Returns `Some(Ok(_))` per entry, `Some(Err(reason))` once when the
    /// queue was closed with an error, and `None` after that or after a
    /// clean close.
    pub async fn pop(&self) -> Option<Result<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(Ok(item));
                }
                match &mut state.closed {
                    Closed::Open => {}
                    Closed::Clean => return None,
                    Closed::Failed(err) => return err.take().map(Err),
                }
            }

            notified.await;
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !matches!(self.lock().closed, Closed::Open)
    }

    /// Entries currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether no entries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Entries discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
