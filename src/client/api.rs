//! Typed caller API over a host connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::aggregator::{ChatAggregator, ChatStream};
use crate::client::command::parse_command;
use crate::client::queue::RecordQueue;
use crate::client::supervisor::{ProcessState, StopOutcome, Supervisor, SupervisorOptions};
use crate::client::transport::{Transport, TransportOptions};
use crate::config::ClientConfig;
use crate::protocol::envelope::{OutputRecord, Request, PROTOCOL_VERSION};
use crate::protocol::events::StreamEvent;
use crate::protocol::types::{
    methods, AgentInfo, AppInfo, InvokeAgentBody, InvokeToolBody, InvokeTriggerBody, ModelInfo,
    PromptInfo, ReadyInfo, ShutdownAck, SingleToolInfo, ToolkitInfo, TriggerInfo,
};
use crate::{AppError, Result};

/// Fresh request identifier: `<method>:<uuid>`.
#[must_use]
pub fn new_request_id(method: &str) -> String {
    format!("{method}:{}", Uuid::new_v4())
}

/// Deadlines used by [`HostClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Options for the transport.
    pub transport: TransportOptions,
    /// How long to wait for the ready announcement.
    pub ready_timeout: Duration,
    /// Grace period between closing the host's input and killing it.
    pub stop_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            ready_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            transport: TransportOptions {
                stream_capacity: config.stream_capacity,
                unsolicited_capacity: config.unsolicited_capacity,
                max_line_bytes: config.max_line_bytes,
                request_timeout: Duration::from_secs(config.request_timeout_seconds),
            },
            ready_timeout: Duration::from_secs(config.ready_timeout_seconds),
            stop_grace: Duration::from_secs(config.stop_grace_seconds),
        }
    }
}

/// Collected outcome of `invokeTrigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// Whether the host ran the trigger to completion.
    pub success: bool,
    /// Thread the trigger ran on.
    #[serde(rename = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// `type` of every record received, in order.
    pub events: Vec<String>,
    /// Final message text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Host-reported failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
}

/// Caller-side handle to one agent host.
#[derive(Debug)]
pub struct HostClient {
    supervisor: Option<Supervisor>,
    transport: Arc<Transport>,
    options: ClientOptions,
}

impl HostClient {
    /// Launch `command` and connect to it.
    ///
    /// # Errors
    ///
    /// Propagates [`Supervisor::start`] failures.
    pub fn spawn(command: &[String], options: ClientOptions) -> Result<Self> {
        let supervisor = Supervisor::new(SupervisorOptions {
            transport: options.transport.clone(),
            ..SupervisorOptions::default()
        });
        let transport = supervisor.start(command)?;
        Ok(Self {
            supervisor: Some(supervisor),
            transport,
            options,
        })
    }

    /// Launch the host configured in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] when `host_command` is empty or cannot be
    /// launched.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let command = parse_command(&config.host_command);
        Self::spawn(&command, ClientOptions::from(config))
    }

    /// Use an already-connected transport (no process supervision).
    #[must_use]
    pub fn with_transport(transport: Arc<Transport>, options: ClientOptions) -> Self {
        Self {
            supervisor: None,
            transport,
            options,
        }
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Supervisor, when this client launched the host.
    #[must_use]
    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    /// Lifecycle state; in-process connections report `running` until
    /// the transport closes.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        match &self.supervisor {
            Some(supervisor) => supervisor.state(),
            None if self.transport.is_open() => ProcessState::Running,
            None => ProcessState::Stopped,
        }
    }

    /// Records no caller claimed (stderr, ready, late replies, bad lines).
    #[must_use]
    pub fn unsolicited(&self) -> Arc<RecordQueue<OutputRecord>> {
        self.transport.router().unsolicited()
    }

    // ── Generic calls ─────────────────────────────────────────────────────────

    /// Send `method` with `body` and decode the result.
    ///
    /// # Errors
    ///
    /// Transport errors from [`Transport::send_await`],
    /// [`AppError::Remote`] for failed replies and [`AppError::Protocol`]
    /// when the result does not decode as `T`.
    pub async fn request<B, T>(&self, method: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        self.request_with_cancel(method, body, &CancellationToken::new())
            .await
    }

    /// [`request`](Self::request) with external cancellation.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); [`AppError::Cancelled`] on cancel.
    pub async fn request_with_cancel<B, T>(
        &self,
        method: &str,
        body: Option<&B>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let request = Request::new(new_request_id(method), method, body)?;
        let reply = self
            .transport
            .send_await(&request, self.options.transport.request_timeout, cancel)
            .await?;
        reply.into_result()
    }

    async fn request_bare<T: DeserializeOwned>(&self, method: &str) -> Result<T> {
        self.request::<(), T>(method, None).await
    }

    /// Wait for the host's ready announcement and check its protocol version.
    ///
    /// # Errors
    ///
    /// [`AppError::Timeout`], the termination error, or
    /// [`AppError::Protocol`] on a version mismatch.
    pub async fn wait_ready(&self) -> Result<ReadyInfo> {
        let ready: ReadyInfo = self
            .transport
            .wait_ready(self.options.ready_timeout)
            .await?
            .into_result()?;
        if ready.protocol_version != PROTOCOL_VERSION {
            return Err(AppError::Protocol(format!(
                "host speaks protocol {}, expected {PROTOCOL_VERSION}",
                ready.protocol_version
            )));
        }
        info!(host = %ready.name, "host ready");
        Ok(ready)
    }

    // ── Methods ───────────────────────────────────────────────────────────────

    /// `ping`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn ping(&self) -> Result<String> {
        self.request_bare(methods::PING).await
    }

    /// `getAppInfo`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn app_info(&self) -> Result<AppInfo> {
        self.request_bare(methods::GET_APP_INFO).await
    }

    /// `listAgents`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        self.request_bare(methods::LIST_AGENTS).await
    }

    /// `listToolkits`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_toolkits(&self) -> Result<Vec<ToolkitInfo>> {
        self.request_bare(methods::LIST_TOOLKITS).await
    }

    /// `listTools`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_tools(&self) -> Result<Vec<SingleToolInfo>> {
        self.request_bare(methods::LIST_TOOLS).await
    }

    /// `listTriggers`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_triggers(&self) -> Result<Vec<TriggerInfo>> {
        self.request_bare(methods::LIST_TRIGGERS).await
    }

    /// `listModels`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.request_bare(methods::LIST_MODELS).await
    }

    /// `listPrompts`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>> {
        self.request_bare(methods::LIST_PROMPTS).await
    }

    /// `invokeTool`; returns the tool's output.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); tool failures arrive as
    /// [`AppError::Remote`] with code `TOOL_ERROR`.
    pub async fn invoke_tool(&self, body: &InvokeToolBody) -> Result<serde_json::Value> {
        self.request(methods::INVOKE_TOOL, Some(body)).await
    }

    /// `invokeAgent`; returns the aggregating stream.
    ///
    /// # Errors
    ///
    /// Errors from [`Transport::send_stream`].
    pub async fn invoke_agent(&self, body: &InvokeAgentBody) -> Result<ChatStream> {
        self.open_stream(methods::INVOKE_AGENT, body).await
    }

    /// `invokeTrigger` as an aggregating stream.
    ///
    /// # Errors
    ///
    /// Errors from [`Transport::send_stream`].
    pub async fn invoke_trigger_stream(&self, body: &InvokeTriggerBody) -> Result<ChatStream> {
        self.open_stream(methods::INVOKE_TRIGGER, body).await
    }

    async fn open_stream<B: Serialize>(&self, method: &str, body: &B) -> Result<ChatStream> {
        let request = Request::new(new_request_id(method), method, Some(body))?;
        let handle = self.transport.send_stream(&request).await?;
        debug!(request_id = %request.id, method, "stream opened");
        Ok(ChatStream::new(handle))
    }

    /// `invokeTrigger`, collected until the run completes.
    ///
    /// A failure reported by the host yields `success: false` with `error`
    /// set; transport failures are returned as errors.
    ///
    /// # Errors
    ///
    /// Transport errors, [`AppError::Cancelled`] and
    /// [`AppError::AbnormalCompletion`].
    pub async fn invoke_trigger(
        &self,
        body: &InvokeTriggerBody,
        cancel: &CancellationToken,
    ) -> Result<TriggerResponse> {
        let request = Request::new(
            new_request_id(methods::INVOKE_TRIGGER),
            methods::INVOKE_TRIGGER,
            Some(body),
        )?;
        let mut handle = self.transport.send_stream(&request).await?;
        let mut aggregator = ChatAggregator::new();
        let mut events = Vec::new();

        loop {
            match handle.next_or_cancel(cancel).await {
                Some(Ok(resp)) => match StreamEvent::from_response(&resp) {
                    Ok(event) => {
                        events.push(event.event_type().to_owned());
                        aggregator.apply(event);
                        if aggregator.is_completed() {
                            break;
                        }
                    }
                    Err(AppError::Remote(obj)) => {
                        return Ok(TriggerResponse {
                            success: false,
                            thread_id: aggregator.outcome().thread_id,
                            events,
                            result: None,
                            error: Some(obj.to_string()),
                            timestamp: Utc::now(),
                        });
                    }
                    Err(err) => return Err(err),
                },
                Some(Err(err)) => return Err(err),
                None => {
                    aggregator.finish()?;
                    break;
                }
            }
        }

        let outcome = aggregator.outcome();
        Ok(TriggerResponse {
            success: true,
            thread_id: outcome.thread_id.clone(),
            events,
            result: outcome.messages.last().cloned(),
            error: None,
            timestamp: Utc::now(),
        })
    }

    /// `shutdown`; then waits for the host to exit when supervised.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn shutdown(&self) -> Result<ShutdownAck> {
        let ack: ShutdownAck = self.request_bare(methods::SHUTDOWN).await?;
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop(self.options.stop_grace).await?;
        }
        Ok(ack)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Close the host's input and wait for it to exit, killing it after the
    /// configured grace period.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::stop`].
    pub async fn stop(&self) -> Result<StopOutcome> {
        match &self.supervisor {
            Some(supervisor) => supervisor.stop(self.options.stop_grace).await,
            None => {
                self.transport
                    .shutdown(AppError::ProcessTerminated("client stopped".into()))
                    .await;
                Ok(StopOutcome::Graceful)
            }
        }
    }

    /// Kill the host immediately.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::kill`].
    pub async fn kill(&self) -> Result<()> {
        match &self.supervisor {
            Some(supervisor) => supervisor.kill().await,
            None => {
                self.transport
                    .shutdown(AppError::ProcessTerminated("client killed".into()))
                    .await;
                Ok(())
            }
        }
    }
}
