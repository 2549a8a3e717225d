//! Caller-side reduction of a streamed agent invocation.
//!
//! [`ChatAggregator`] folds [`StreamEvent`]s into chat messages and tool-call
//! bookkeeping, emitting a [`ChatUpdate`] for every visible change.
//! [`ChatStream`] drives an aggregator from a [`StreamHandle`].
//!
//! Text deltas are kept keyed by sequence number, so arrival order does not
//! matter and a re-delivered fragment replaces the earlier copy. A message
//! is sealed by its `output_text` record, by the next tool call, or by the
//! terminal status; sealed text never changes.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::client::transport::StreamHandle;
use crate::protocol::envelope::Payload;
use crate::protocol::events::{StatusUpdate, StreamEvent, ToolCallRequest, ToolCallResult};
use crate::{AppError, Result};

// ── Messages ──────────────────────────────────────────────────────────────────

/// One assistant message assembled from text fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedMessage {
    deltas: BTreeMap<u64, String>,
    sealed: Option<String>,
}

impl AggregatedMessage {
    /// Record a fragment. Ignored once the message is sealed.
    ///
    /// Returns whether the fragment was applied.
    pub fn apply_delta(&mut self, sequence_number: u64, text: impl Into<String>) -> bool {
        if self.sealed.is_some() {
            return false;
        }
        self.deltas.insert(sequence_number, text.into());
        true
    }

    /// Seal the message with `text`, or with the fragments joined in
    /// sequence order when `text` is `None`. No-op when already sealed.
    pub fn seal(&mut self, text: Option<String>) {
        if self.sealed.is_some() {
            return;
        }
        let text = text.unwrap_or_else(|| self.deltas.values().map(String::as_str).collect());
        self.sealed = Some(text);
        self.deltas.clear();
    }

    /// Whether the message is sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Current text: the sealed text, or the fragments in sequence order.
    #[must_use]
    pub fn text(&self) -> String {
        match &self.sealed {
            Some(text) => text.clone(),
            None => self.deltas.values().map(String::as_str).collect(),
        }
    }
}

// ── Updates ───────────────────────────────────────────────────────────────────

/// Visible change produced while aggregating.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    /// An unsealed message's text changed.
    TextUpdated {
        /// Message position in the transcript.
        index: usize,
        /// Full current text.
        text: String,
    },
    /// A message was sealed.
    MessageSealed {
        /// Message position in the transcript.
        index: usize,
        /// Final text.
        text: String,
    },
    /// The backend requested a tool call.
    ToolCall(ToolCallRequest),
    /// A round of tool calls resolved.
    ToolCallsCompleted(Vec<ToolCallResult>),
    /// The backend asked for a response.
    ResponseRequested(Payload),
    /// Non-terminal status.
    Status(StatusUpdate),
    /// Record of a type this build does not know.
    Unrecognised {
        /// The record's `type`.
        event_type: String,
    },
    /// The invocation finished.
    Completed {
        /// Thread the invocation ran on, when reported.
        thread_id: Option<String>,
    },
}

/// Aggregation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    /// Nothing received yet for the current round.
    AwaitingFirst,
    /// Fragments of an unsealed message are arriving.
    StreamingText,
    /// Tool calls were requested and are not all resolved.
    AwaitingToolResults,
    /// The last message is sealed; more rounds may follow.
    Sealed,
    /// The terminal record arrived.
    Completed,
}

/// Everything a finished invocation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOutcome {
    /// Thread the invocation ran on.
    pub thread_id: Option<String>,
    /// Sealed message texts in order.
    pub messages: Vec<String>,
    /// Tool calls requested across all rounds.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Tool results across all rounds.
    pub tool_results: Vec<ToolCallResult>,
}

impl ChatOutcome {
    /// Text of the last message, or empty.
    #[must_use]
    pub fn final_text(&self) -> &str {
        self.messages.last().map_or("", String::as_str)
    }
}

// ── Aggregator ────────────────────────────────────────────────────────────────

/// Folds one invocation's events into messages and tool bookkeeping.
#[derive(Debug, Clone)]
pub struct ChatAggregator {
    phase: ChatPhase,
    messages: Vec<AggregatedMessage>,
    outstanding: Vec<String>,
    tool_calls: Vec<ToolCallRequest>,
    tool_results: Vec<ToolCallResult>,
    thread_id: Option<String>,
}

impl Default for ChatAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatAggregator {
    /// Empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: ChatPhase::AwaitingFirst,
            messages: Vec::new(),
            outstanding: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            thread_id: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ChatPhase {
        self.phase
    }

    /// Whether the terminal record was applied.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.phase == ChatPhase::Completed
    }

    /// Messages so far.
    #[must_use]
    pub fn messages(&self) -> &[AggregatedMessage] {
        &self.messages
    }

    /// Tool calls requested but not yet answered.
    #[must_use]
    pub fn outstanding_calls(&self) -> &[String] {
        &self.outstanding
    }

    fn open_message(&mut self) -> usize {
        match self.messages.last() {
            Some(last) if !last.is_sealed() => self.messages.len() - 1,
            _ => {
                self.messages.push(AggregatedMessage::default());
                self.messages.len() - 1
            }
        }
    }

    fn seal_open(&mut self, text: Option<String>, updates: &mut Vec<ChatUpdate>) {
        let has_open = self.messages.last().is_some_and(|m| !m.is_sealed());
        let index = if has_open || text.is_some() {
            self.open_message()
        } else {
            return;
        };
        let message = &mut self.messages[index];
        message.seal(text);
        updates.push(ChatUpdate::MessageSealed {
            index,
            text: message.text(),
        });
    }

    fn after_round_phase(&self) -> ChatPhase {
        if self.outstanding.is_empty() {
            ChatPhase::Sealed
        } else {
            ChatPhase::AwaitingToolResults
        }
    }

    /// Apply one event and return the updates it caused.
    ///
    /// Events after completion are ignored.
    pub fn apply(&mut self, event: StreamEvent) -> Vec<ChatUpdate> {
        let mut updates = Vec::new();
        if self.is_completed() {
            debug!(event_type = event.event_type(), "aggregator: event after completion ignored");
            return updates;
        }

        if event.is_terminal() {
            self.complete(event.status().cloned(), &mut updates);
            return updates;
        }

        match event {
            StreamEvent::OutputTextDelta(delta) => {
                let index = self.open_message();
                let message = &mut self.messages[index];
                message.apply_delta(delta.sequence_number, delta.delta);
                updates.push(ChatUpdate::TextUpdated {
                    index,
                    text: message.text(),
                });
                self.phase = ChatPhase::StreamingText;
            }
            StreamEvent::OutputText(text) => {
                self.seal_open(Some(text), &mut updates);
                self.phase = self.after_round_phase();
            }
            StreamEvent::ToolCall(call) => {
                self.seal_open(None, &mut updates);
                if !self.outstanding.contains(&call.call_id) {
                    self.outstanding.push(call.call_id.clone());
                }
                self.tool_calls.push(call.clone());
                updates.push(ChatUpdate::ToolCall(call));
                self.phase = ChatPhase::AwaitingToolResults;
            }
            StreamEvent::ToolCallsCompleted(results) => {
                self.outstanding
                    .retain(|id| !results.iter().any(|r| &r.call_id == id));
                self.tool_results.extend(results.iter().cloned());
                updates.push(ChatUpdate::ToolCallsCompleted(results));
                self.phase = if self.outstanding.is_empty() {
                    ChatPhase::AwaitingFirst
                } else {
                    ChatPhase::AwaitingToolResults
                };
            }
            StreamEvent::ResponseRequested(payload) => {
                updates.push(ChatUpdate::ResponseRequested(payload));
            }
            StreamEvent::Status(status) => {
                if !status.thread_id.is_empty() {
                    self.thread_id = Some(status.thread_id.clone());
                }
                updates.push(ChatUpdate::Status(status));
            }
            StreamEvent::Unknown { event_type, .. } => {
                updates.push(ChatUpdate::Unrecognised { event_type });
            }
        }
        updates
    }

    fn complete(&mut self, status: Option<StatusUpdate>, updates: &mut Vec<ChatUpdate>) {
        self.seal_open(None, updates);
        if let Some(status) = status.filter(|s| !s.thread_id.is_empty()) {
            self.thread_id = Some(status.thread_id);
        }
        self.phase = ChatPhase::Completed;
        updates.push(ChatUpdate::Completed {
            thread_id: self.thread_id.clone(),
        });
    }

    /// Resolve a stream that closed without its terminal record.
    ///
    /// Accepted when the last message was sealed by its final text and no
    /// tool calls are outstanding; anything else is abnormal.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AbnormalCompletion`] describing what was missing.
    pub fn finish(&mut self) -> Result<Vec<ChatUpdate>> {
        let mut updates = Vec::new();
        if self.is_completed() {
            return Ok(updates);
        }
        if !self.outstanding.is_empty() {
            return Err(AppError::AbnormalCompletion(format!(
                "stream closed with {} tool call(s) unanswered",
                self.outstanding.len()
            )));
        }
        match self.messages.last() {
            Some(last) if last.is_sealed() => {
                self.complete(None, &mut updates);
                Ok(updates)
            }
            Some(_) => Err(AppError::AbnormalCompletion(
                "stream closed in the middle of a message".into(),
            )),
            None => Err(AppError::AbnormalCompletion(
                "stream closed before any output".into(),
            )),
        }
    }

    /// Snapshot of what has been aggregated.
    #[must_use]
    pub fn outcome(&self) -> ChatOutcome {
        ChatOutcome {
            thread_id: self.thread_id.clone(),
            messages: self
                .messages
                .iter()
                .filter(|m| m.is_sealed())
                .map(AggregatedMessage::text)
                .collect(),
            tool_calls: self.tool_calls.clone(),
            tool_results: self.tool_results.clone(),
        }
    }
}

// ── Stream driver ─────────────────────────────────────────────────────────────

/// Aggregating view over one `invokeAgent` / `invokeTrigger` stream.
#[derive(Debug)]
pub struct ChatStream {
    handle: StreamHandle,
    aggregator: ChatAggregator,
    buffered: VecDeque<ChatUpdate>,
    done: bool,
}

impl ChatStream {
    /// Wrap an open stream.
    #[must_use]
    pub fn new(handle: StreamHandle) -> Self {
        Self {
            handle,
            aggregator: ChatAggregator::new(),
            buffered: VecDeque::new(),
            done: false,
        }
    }

    /// Identifier of the underlying call.
    #[must_use]
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Aggregation state so far.
    #[must_use]
    pub fn aggregator(&self) -> &ChatAggregator {
        &self.aggregator
    }

    /// Next update; `None` after [`ChatUpdate::Completed`] or an error.
    pub async fn next(&mut self) -> Option<Result<ChatUpdate>> {
        loop {
            if let Some(update) = self.buffered.pop_front() {
                return Some(Ok(update));
            }
            if self.done {
                return None;
            }

            match self.handle.next().await {
                Some(Ok(resp)) => match StreamEvent::from_response(&resp) {
                    Ok(event) => {
                        self.buffered.extend(self.aggregator.apply(event));
                        if self.aggregator.is_completed() {
                            self.done = true;
                            self.handle.close();
                        }
                    }
                    Err(err) if !resp.success => {
                        self.done = true;
                        return Some(Err(err));
                    }
                    Err(err) => {
                        warn!(
                            request_id = %resp.id,
                            event_type = resp.event_type.as_deref().unwrap_or(""),
                            error = %err,
                            "chat stream: skipping malformed record"
                        );
                    }
                },
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    match self.aggregator.finish() {
                        Ok(updates) => self.buffered.extend(updates),
                        Err(err) => return Some(Err(err)),
                    }
                }
            }
        }
    }

    /// Drain the stream and return the outcome.
    ///
    /// # Errors
    ///
    /// Returns the first error the stream produced.
    pub async fn collect(mut self) -> Result<ChatOutcome> {
        while let Some(update) = self.next().await {
            update?;
        }
        Ok(self.aggregator.outcome())
    }
}
