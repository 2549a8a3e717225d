//! Configuration parsing, validation and environment overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::{AppError, Result};

/// Environment variable replacing `client.host_command`.
pub const HOST_COMMAND_ENV: &str = "CONDUIT_HOST_COMMAND";

/// Caller-side settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ClientConfig {
    /// Command line launching the host, split with shell-like quoting.
    pub host_command: String,
    /// Deadline for single-reply calls.
    pub request_timeout_seconds: u64,
    /// Grace period between closing the host's input and killing it.
    pub stop_grace_seconds: u64,
    /// Deadline for the host's ready announcement.
    pub ready_timeout_seconds: u64,
    /// Records buffered per open stream.
    pub stream_capacity: usize,
    /// Records buffered in the unsolicited queue.
    pub unsolicited_capacity: usize,
    /// Optional per-line cap in bytes; absent means unbounded.
    pub max_line_bytes: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_command: "conduit-host".into(),
            request_timeout_seconds: 30,
            stop_grace_seconds: 5,
            ready_timeout_seconds: 10,
            stream_capacity: 256,
            unsolicited_capacity: 100,
            max_line_bytes: None,
        }
    }
}

/// Backoff applied when feeding tool results back to the model fails.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per retry.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

/// One agent the host serves.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent name.
    pub name: String,
    /// System prompt.
    #[serde(default)]
    pub system_prompt: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Toolkits the agent may call.
    #[serde(default)]
    pub toolkits: Vec<String>,
}

fn default_model() -> String {
    "echo".into()
}

/// One trigger the host accepts.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TriggerConfig {
    /// Trigger name.
    pub name: String,
    /// Agent the trigger runs.
    pub agent: String,
    /// Trigger kind.
    #[serde(default = "default_trigger_type")]
    pub trigger_type: String,
    /// Description.
    #[serde(default)]
    pub description: String,
}

fn default_trigger_type() -> String {
    "webhook".into()
}

/// Host-side settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct HostConfig {
    /// Name announced in the ready record and `getAppInfo`.
    pub name: String,
    /// Model rounds allowed per invocation.
    pub max_rounds: u32,
    /// Feed-back retry policy.
    pub retry: RetryConfig,
    /// Served agents.
    pub agents: Vec<AgentConfig>,
    /// Accepted triggers. Empty unless listed once a `[host]` table exists.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "agent-conduit".into(),
            max_rounds: 16,
            retry: RetryConfig::default(),
            agents: vec![AgentConfig {
                name: "Echo".into(),
                system_prompt: "Repeat the user's message back.".into(),
                model: default_model(),
                toolkits: vec!["utility".into()],
            }],
            triggers: vec![TriggerConfig {
                name: "echo-webhook".into(),
                agent: "Echo".into(),
                trigger_type: default_trigger_type(),
                description: "Echo the triggering request".into(),
            }],
        }
    }
}

impl HostConfig {
    /// Check that every agent's toolkits are among `known`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first unknown toolkit.
    pub fn validate_toolkits(&self, known: &[&str]) -> Result<()> {
        for agent in &self.agents {
            if let Some(missing) = agent
                .toolkits
                .iter()
                .find(|t| !known.contains(&t.as_str()))
            {
                return Err(AppError::Config(format!(
                    "agent {} references unknown toolkit {missing}",
                    agent.name
                )));
            }
        }
        Ok(())
    }
}

/// Top-level configuration parsed from `conduit.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// Caller-side settings.
    pub client: ClientConfig,
    /// Host-side settings.
    pub host: HostConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given (defaults otherwise), then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Replace settings from the environment.
    ///
    /// `CONDUIT_HOST_COMMAND` replaces `client.host_command` when set and
    /// non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(command) = env::var(HOST_COMMAND_ENV) {
            if !command.trim().is_empty() {
                info!(env = HOST_COMMAND_ENV, "host command overridden from environment");
                self.client.host_command = command;
            }
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let client = &self.client;
        if client.stream_capacity == 0 || client.unsolicited_capacity == 0 {
            return Err(AppError::Config(
                "stream_capacity and unsolicited_capacity must be greater than zero".into(),
            ));
        }
        if client.max_line_bytes == Some(0) {
            return Err(AppError::Config(
                "max_line_bytes must be greater than zero when set".into(),
            ));
        }
        if client.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "request_timeout_seconds must be greater than zero".into(),
            ));
        }

        let host = &self.host;
        if host.max_rounds == 0 {
            return Err(AppError::Config("max_rounds must be greater than zero".into()));
        }

        let mut names = HashSet::new();
        for agent in &host.agents {
            if agent.name.trim().is_empty() {
                return Err(AppError::Config("agent name must not be empty".into()));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate agent name: {}",
                    agent.name
                )));
            }
        }

        let mut triggers = HashSet::new();
        for trigger in &host.triggers {
            if !names.contains(trigger.agent.as_str()) {
                return Err(AppError::Config(format!(
                    "trigger {} references unknown agent {}",
                    trigger.name, trigger.agent
                )));
            }
            if !triggers.insert((trigger.agent.as_str(), trigger.name.as_str())) {
                return Err(AppError::Config(format!(
                    "duplicate trigger {} for agent {}",
                    trigger.name, trigger.agent
                )));
            }
        }

        Ok(())
    }
}
