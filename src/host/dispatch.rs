//! Per-method request handling on the host.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{AgentConfig, HostConfig, TriggerConfig};
use crate::host::catalog::Catalog;
use crate::host::echo::EchoModel;
use crate::host::model::{ModelInput, ModelRegistry};
use crate::host::orchestrator::{Orchestrator, RetryPolicy};
use crate::host::session::{Session, SessionRegistry};
use crate::host::sink::{HostWriter, ResponseSink};
use crate::host::tools::{normalize_arguments, ToolRegistry};
use crate::protocol::envelope::{Payload, Request, Response, PROTOCOL_VERSION, READY_ID};
use crate::protocol::events::READY;
use crate::protocol::types::{
    methods, AppInfo, InvokeAgentBody, InvokeToolBody, InvokeTriggerBody, ReadyInfo,
    SerializedHttpRequest, ShutdownAck,
};
use crate::{AppError, Result};

/// Everything the host serves: catalog, tools, models and live sessions.
#[derive(Debug)]
pub struct Host {
    name: String,
    catalog: Catalog,
    tools: Arc<ToolRegistry>,
    models: ModelRegistry,
    sessions: SessionRegistry,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
}

impl Host {
    /// Host with the built-in toolkits and the echo model.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when an agent references an unknown
    /// toolkit or model.
    pub fn new(config: &HostConfig) -> Result<Self> {
        let mut models = ModelRegistry::new();
        models.register(Arc::new(EchoModel));
        Self::with_parts(config, ToolRegistry::with_builtins(), models)
    }

    /// Host over caller-supplied tools and models.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when an agent references an unknown
    /// toolkit or model.
    pub fn with_parts(config: &HostConfig, tools: ToolRegistry, models: ModelRegistry) -> Result<Self> {
        let catalog = Catalog::new(config, &tools, &models)?;
        let tools = Arc::new(tools);
        let orchestrator = Orchestrator::new(
            Arc::clone(&tools),
            RetryPolicy::from(&config.retry),
            config.max_rounds,
        );
        Ok(Self {
            name: config.name.clone(),
            catalog,
            tools,
            models,
            sessions: SessionRegistry::new(),
            orchestrator,
            shutdown: CancellationToken::new(),
        })
    }

    /// Name announced in the ready record.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live sessions.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Token cancelled once `shutdown` has been acknowledged.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The unsolicited ready announcement.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the payload cannot be serialised.
    pub fn ready_response(&self) -> Result<Response> {
        let info = ReadyInfo {
            name: self.name.clone(),
            protocol_version: PROTOCOL_VERSION.to_owned(),
        };
        Ok(Response::event(READY_ID, READY, Payload::from_serialize(&info)?))
    }

    /// Handle one request, writing its reply or streamed events.
    ///
    /// Failures are reported as an error record with the request's id;
    /// nothing here ends the connection.
    pub async fn handle(&self, request: Request, writer: &Arc<HostWriter>) {
        let span = info_span!("request", request_id = %request.id, method = %request.method);
        async {
            let reply = match self.dispatch(&request, writer).await {
                Ok(Some(payload)) => Response::ok(&request.id, payload),
                Ok(None) => return,
                Err(error) => {
                    warn!(%error, "request failed");
                    Response::error(&request.id, error.to_error_object())
                }
            };
            if let Err(error) = writer.send(reply).await {
                warn!(%error, "failed to write reply");
                return;
            }
            if request.method == methods::SHUTDOWN {
                info!("shutdown acknowledged");
                self.shutdown.cancel();
            }
        }
        .instrument(span)
        .await;
    }

    /// Single-reply methods return their payload; streaming methods write
    /// their events and return `None`.
    async fn dispatch(&self, request: &Request, writer: &Arc<HostWriter>) -> Result<Option<Payload>> {
        let payload = match request.method.as_str() {
            methods::PING => Payload::from_serialize("pong")?,
            methods::GET_APP_INFO => Payload::from_serialize(&AppInfo {
                name: self.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                protocol_version: PROTOCOL_VERSION.to_owned(),
                agents: self.catalog.agent_count(),
                toolkits: self.tools.len(),
            })?,
            methods::LIST_AGENTS => Payload::from_serialize(&self.catalog.agent_infos())?,
            methods::LIST_TOOLKITS => Payload::from_serialize(&self.tools.toolkit_infos())?,
            methods::LIST_TOOLS => Payload::from_serialize(&self.tools.tool_infos())?,
            methods::LIST_TRIGGERS => Payload::from_serialize(&self.catalog.trigger_infos())?,
            methods::LIST_MODELS => Payload::from_serialize(&self.catalog.model_infos())?,
            methods::LIST_PROMPTS => Payload::from_serialize(&self.catalog.prompt_infos())?,
            methods::INVOKE_TOOL => self.invoke_tool(request).await?,
            methods::SHUTDOWN => Payload::from_serialize(&ShutdownAck::shutting_down())?,
            methods::INVOKE_AGENT => {
                self.invoke_agent(request, writer).await?;
                return Ok(None);
            }
            methods::INVOKE_TRIGGER => {
                self.invoke_trigger(request, writer).await?;
                return Ok(None);
            }
            other => return Err(AppError::UnknownMethod(other.to_owned())),
        };
        Ok(Some(payload))
    }

    async fn invoke_tool(&self, request: &Request) -> Result<Payload> {
        let body: InvokeToolBody = params(request)?;
        let (toolkit, tool) = self.tools.find(&body.tool, body.toolkit.as_deref())?;
        info!(tool = %body.tool, %toolkit, "invoking tool");
        let output = tool
            .execute(normalize_arguments(body.args))
            .await
            .map_err(|error| match error {
                AppError::Tool(_) => error,
                other => AppError::Tool(other.to_string()),
            })?;
        Payload::from_serialize(&output)
    }

    async fn invoke_agent(&self, request: &Request, writer: &Arc<HostWriter>) -> Result<()> {
        let body: InvokeAgentBody = params(request)?;
        let agent = self.catalog.agent(&body.agent)?;
        let session = self.open_session(body.thread_id.as_deref(), agent).await?;
        let input = ModelInput::UserPrompt {
            text: body.prompt,
            attachments: body.attachments,
        };
        let sink = ResponseSink::new(&request.id, Arc::clone(writer));
        self.orchestrator.run(&session, input, &sink).await
    }

    async fn invoke_trigger(&self, request: &Request, writer: &Arc<HostWriter>) -> Result<()> {
        let body: InvokeTriggerBody = params(request)?;
        let trigger = self.catalog.trigger(&body.agent_name, &body.trigger_name)?;
        if !body.trigger_type.is_empty() && body.trigger_type != trigger.trigger_type {
            return Err(AppError::Validation(format!(
                "trigger {} has type {}, not {}",
                trigger.name, trigger.trigger_type, body.trigger_type
            )));
        }
        let agent = self.catalog.agent(&body.agent_name)?;
        let session = self.open_session(body.thread_id.as_deref(), agent).await?;
        let input = ModelInput::UserPrompt {
            text: trigger_prompt(trigger, body.http_request.as_ref()),
            attachments: Vec::new(),
        };
        let sink = ResponseSink::new(&request.id, Arc::clone(writer));
        self.orchestrator.run(&session, input, &sink).await
    }

    async fn open_session(&self, thread_id: Option<&str>, agent: &AgentConfig) -> Result<Arc<Session>> {
        let model = self.models.get(&agent.model)?;
        let tools = self.tools.tools_for(&agent.toolkits);
        self.sessions
            .get_or_create(thread_id, agent, model.as_ref(), tools)
            .await
    }
}

/// Parse a request body, reporting failures as `INVALID_PARAMS`.
fn params<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T> {
    request.parse_body().map_err(|error| match error {
        AppError::Protocol(msg) => AppError::InvalidParams(msg),
        other => other,
    })
}

/// Prompt describing a fired trigger and its HTTP payload.
fn trigger_prompt(trigger: &TriggerConfig, http: Option<&SerializedHttpRequest>) -> String {
    let mut prompt = format!("Trigger {} ({}) fired.", trigger.name, trigger.trigger_type);
    if let Some(http) = http {
        prompt.push_str(&format!("\n{} {}", http.method, http.path));
        if let Some(body) = &http.body {
            let body = match body {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            prompt.push('\n');
            prompt.push_str(&body);
        }
    }
    prompt
}
