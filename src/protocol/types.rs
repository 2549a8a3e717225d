//! Method names, request bodies and listing payloads.
//!
//! Field names follow the wire's camelCase spelling via `serde` renames.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Host method names.
pub mod methods {
    /// Liveness check.
    pub const PING: &str = "ping";
    /// Host name, version and counts.
    pub const GET_APP_INFO: &str = "getAppInfo";
    /// Configured agents.
    pub const LIST_AGENTS: &str = "listAgents";
    /// Registered toolkits with their tools.
    pub const LIST_TOOLKITS: &str = "listToolkits";
    /// Flat list of every tool.
    pub const LIST_TOOLS: &str = "listTools";
    /// Configured triggers.
    pub const LIST_TRIGGERS: &str = "listTriggers";
    /// Models referenced by agents.
    pub const LIST_MODELS: &str = "listModels";
    /// System prompt per agent.
    pub const LIST_PROMPTS: &str = "listPrompts";
    /// Run one tool directly.
    pub const INVOKE_TOOL: &str = "invokeTool";
    /// Run an agent (streaming).
    pub const INVOKE_AGENT: &str = "invokeAgent";
    /// Fire a trigger (streaming).
    pub const INVOKE_TRIGGER: &str = "invokeTrigger";
    /// Ask the host to exit.
    pub const SHUTDOWN: &str = "shutdown";

    /// Every method the host implements.
    pub const ALL: &[&str] = &[
        PING,
        GET_APP_INFO,
        LIST_AGENTS,
        LIST_TOOLKITS,
        LIST_TOOLS,
        LIST_TRIGGERS,
        LIST_MODELS,
        LIST_PROMPTS,
        INVOKE_TOOL,
        INVOKE_AGENT,
        INVOKE_TRIGGER,
        SHUTDOWN,
    ];

    /// Whether `method` answers with a stream of records.
    #[must_use]
    pub fn is_streaming(method: &str) -> bool {
        method == INVOKE_AGENT || method == INVOKE_TRIGGER
    }
}

// ── Request bodies ────────────────────────────────────────────────────────────

/// File passed alongside a prompt. Content is already encoded by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    /// File name.
    pub name: String,
    /// MIME type.
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
    /// Encoded content (base64 for binary files).
    pub data: String,
}

/// `invokeAgent` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeAgentBody {
    /// Agent name.
    pub agent: String,
    /// User prompt.
    pub prompt: String,
    /// Thread to continue; absent starts a new one.
    #[serde(rename = "threadId", default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Attached files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<FileAttachment>,
}

/// `invokeTool` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeToolBody {
    /// Tool name.
    pub tool: String,
    /// Toolkit to search; absent searches every toolkit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolkit: Option<String>,
    /// Tool arguments.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// HTTP request that fired a webhook-style trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedHttpRequest {
    /// HTTP method.
    #[serde(default)]
    pub method: String,
    /// Request path.
    #[serde(default)]
    pub path: String,
    /// Header values by name.
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    /// Query values by name.
    #[serde(default)]
    pub query: BTreeMap<String, Vec<String>>,
    /// Decoded body, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Content type.
    #[serde(rename = "contentType", default)]
    pub content_type: String,
    /// Client address.
    #[serde(rename = "remoteAddr", default)]
    pub remote_addr: String,
    /// Receipt time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `invokeTrigger` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeTriggerBody {
    /// Agent owning the trigger.
    #[serde(rename = "agentName")]
    pub agent_name: String,
    /// Trigger name.
    #[serde(rename = "triggerName")]
    pub trigger_name: String,
    /// Trigger kind (`webhook`, `cron`, …).
    #[serde(rename = "triggerType", default)]
    pub trigger_type: String,
    /// Thread to continue; absent starts a new one.
    #[serde(rename = "threadId", default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Originating HTTP request for webhook triggers.
    #[serde(rename = "httpRequest", default, skip_serializing_if = "Option::is_none")]
    pub http_request: Option<SerializedHttpRequest>,
}

// ── Results ───────────────────────────────────────────────────────────────────

/// `getAppInfo` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Host name.
    pub name: String,
    /// Host version.
    pub version: String,
    /// Protocol version spoken.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Number of configured agents.
    pub agents: usize,
    /// Number of registered toolkits.
    pub toolkits: usize,
}

/// Result of the ready announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyInfo {
    /// Host name.
    pub name: String,
    /// Protocol version spoken.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
}

/// Model reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier (e.g. `echo`).
    pub identifier: String,
}

/// `listAgents` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent name.
    pub name: String,
    /// System prompt.
    #[serde(rename = "systemPrompt", default)]
    pub system_prompt: String,
    /// Backing model.
    pub model: ModelInfo,
    /// Toolkit names the agent may call.
    #[serde(default)]
    pub toolkits: Vec<String>,
}

/// Tool description inside a toolkit listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Description shown to the model.
    #[serde(default)]
    pub description: String,
    /// Argument schema.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// `listToolkits` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolkitInfo {
    /// Toolkit name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Tools in the toolkit.
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
}

/// `listTools` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleToolInfo {
    /// Tool name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Argument schema.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Owning toolkit.
    #[serde(rename = "toolkitName")]
    pub toolkit_name: String,
}

/// `listTriggers` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Trigger name.
    pub name: String,
    /// Trigger kind.
    #[serde(rename = "triggerType")]
    pub trigger_type: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Agent the trigger runs.
    #[serde(rename = "agentName")]
    pub agent_name: String,
}

/// `listPrompts` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptInfo {
    /// Agent name.
    #[serde(rename = "agentName")]
    pub agent_name: String,
    /// System prompt.
    #[serde(rename = "systemPrompt")]
    pub system_prompt: String,
}

/// `shutdown` acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownAck {
    /// Always `shutting_down`.
    pub status: String,
}

impl ShutdownAck {
    /// The acknowledgement the host sends.
    #[must_use]
    pub fn shutting_down() -> Self {
        Self {
            status: "shutting_down".to_owned(),
        }
    }
}
