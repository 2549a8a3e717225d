//! Multi-round tool-calling loop behind `invokeAgent` and `invokeTrigger`.
//!
//! A run opens with a non-terminal `started` status carrying the thread id.
//! Each round forwards the backend's events to the sink as they arrive.
//! When the round requested tools, every distinct call is executed once
//! (concurrently), the batch is announced with `tool_calls_completed` and
//! fed back to the backend. A round without tool calls ends the run with a
//! `completed` status.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RetryConfig;
use crate::host::model::{fatal_error, ModelEvent, ModelInput};
use crate::host::session::Session;
use crate::host::sink::EventSink;
use crate::host::tools::{normalize_arguments, ToolRegistry};
use crate::protocol::events::{StatusUpdate, StreamEvent, ToolCallRequest, ToolCallResult};
use crate::Result;

/// Events buffered between the backend and the sink within one round.
const ROUND_CHANNEL_CAPACITY: usize = 64;

/// Exponential backoff for feed-back calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

/// Drives a session's model thread until it stops requesting tools.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    tools: Arc<ToolRegistry>,
    retry: RetryPolicy,
    max_rounds: u32,
}

impl Orchestrator {
    /// Create an orchestrator over `tools`.
    #[must_use]
    pub fn new(tools: Arc<ToolRegistry>, retry: RetryPolicy, max_rounds: u32) -> Self {
        Self {
            tools,
            retry,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Retry policy in effect.
    #[must_use]
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Run one invocation on `session`, emitting every event to `sink`.
    ///
    /// Turns on the same session are serialized.
    ///
    /// # Errors
    ///
    /// Returns the backend's error (after retries for feed-back calls), a
    /// sink write failure, or a non-retryable [`crate::AppError::Model`]
    /// when the run exceeds the round limit.
    pub async fn run(&self, session: &Session, input: ModelInput, sink: &dyn EventSink) -> Result<()> {
        let _turn = session.begin_turn().await;
        let span = info_span!("orchestrate", thread_id = %session.thread_id, agent = %session.agent);
        async {
            sink.emit(StreamEvent::Status(StatusUpdate::started(&session.thread_id)))
                .await?;
            let mut input = input;
            for round in 1..=self.max_rounds {
                let calls = if round == 1 {
                    self.invoke_round(session, input, sink).await?
                } else {
                    self.invoke_with_retry(session, &input, sink).await?
                };
                if calls.is_empty() {
                    info!(rounds = round, "invocation completed");
                    return sink
                        .emit(StreamEvent::Status(StatusUpdate::completed(&session.thread_id)))
                        .await;
                }

                debug!(round, calls = calls.len(), "executing tool calls");
                let results = self.execute_calls(&session.toolkits, calls).await;
                sink.emit(StreamEvent::ToolCallsCompleted(results.clone()))
                    .await?;
                input = ModelInput::ToolResults(results);
            }
            Err(fatal_error(format!(
                "model requested tools for more than {} rounds",
                self.max_rounds
            )))
        }
        .instrument(span)
        .await
    }

    /// One backend call; returns the tool calls it requested.
    async fn invoke_round(
        &self,
        session: &Session,
        input: ModelInput,
        sink: &dyn EventSink,
    ) -> Result<Vec<ToolCallRequest>> {
        let (tx, mut rx) = mpsc::channel(ROUND_CHANNEL_CAPACITY);
        let invoke = session.thread().invoke(input, tx);
        let forward = async {
            let mut calls = Vec::new();
            while let Some(event) = rx.recv().await {
                let event = match event {
                    ModelEvent::OutputTextDelta(delta) => StreamEvent::OutputTextDelta(delta),
                    ModelEvent::OutputText(text) => StreamEvent::OutputText(text),
                    ModelEvent::ToolCall(call) => {
                        calls.push(call.clone());
                        StreamEvent::ToolCall(call)
                    }
                };
                sink.emit(event).await?;
            }
            Ok::<_, crate::AppError>(calls)
        };

        let (invoked, forwarded) = tokio::join!(invoke, forward);
        let calls = forwarded?;
        invoked?;
        Ok(calls)
    }

    /// Feed-back call with bounded exponential backoff on retryable errors.
    async fn invoke_with_retry(
        &self,
        session: &Session,
        input: &ModelInput,
        sink: &dyn EventSink,
    ) -> Result<Vec<ToolCallRequest>> {
        let mut attempt = 0;
        loop {
            match self.invoke_round(session, input.clone(), sink).await {
                Ok(calls) => return Ok(calls),
                Err(error) if error.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(%error, attempt, delay = ?delay, "model call failed; retrying");
                    sleep(delay).await;
                }
                Err(error) => {
                    warn!(%error, attempt, "model call failed");
                    return Err(error);
                }
            }
        }
    }

    /// Execute each distinct call once, keeping request order.
    async fn execute_calls(
        &self,
        toolkits: &[String],
        calls: Vec<ToolCallRequest>,
    ) -> Vec<ToolCallResult> {
        let mut seen = HashSet::new();
        let distinct: Vec<_> = calls
            .into_iter()
            .filter(|call| seen.insert(call.call_id.clone()))
            .collect();
        join_all(distinct.into_iter().map(|call| self.execute_one(toolkits, call))).await
    }

    async fn execute_one(&self, toolkits: &[String], call: ToolCallRequest) -> ToolCallResult {
        let Some(tool) = self.tools.find_in(&call.name, toolkits) else {
            warn!(call_id = %call.call_id, tool = %call.name, "unknown tool requested");
            return ToolCallResult::new(call.call_id, format!("error: unknown tool {}", call.name));
        };

        let output = match tool.execute(normalize_arguments(call.arguments)).await {
            Ok(Value::String(text)) => text,
            Ok(value) => value.to_string(),
            Err(error) => {
                warn!(call_id = %call.call_id, tool = %call.name, %error, "tool failed");
                format!("error: {error}")
            }
        };
        debug!(call_id = %call.call_id, tool = %call.name, "tool executed");
        ToolCallResult::new(call.call_id, output)
    }
}
