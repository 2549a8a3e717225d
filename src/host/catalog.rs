//! Agents and triggers served by the host, and their listings.

use std::collections::BTreeSet;

use crate::config::{AgentConfig, HostConfig, TriggerConfig};
use crate::host::model::ModelRegistry;
use crate::host::tools::ToolRegistry;
use crate::protocol::types::{AgentInfo, ModelInfo, PromptInfo, TriggerInfo};
use crate::{AppError, Result};

/// Validated view of the configured agents and triggers.
#[derive(Debug, Clone)]
pub struct Catalog {
    agents: Vec<AgentConfig>,
    triggers: Vec<TriggerConfig>,
}

impl Catalog {
    /// Build the catalog, checking toolkits and models exist.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] for unknown toolkits or models.
    pub fn new(config: &HostConfig, tools: &ToolRegistry, models: &ModelRegistry) -> Result<Self> {
        config.validate_toolkits(&tools.toolkit_names())?;
        if let Some(agent) = config.agents.iter().find(|a| !models.contains(&a.model)) {
            return Err(AppError::Config(format!(
                "agent {} uses unknown model {}",
                agent.name, agent.model
            )));
        }
        Ok(Self {
            agents: config.agents.clone(),
            triggers: config.triggers.clone(),
        })
    }

    /// Look up an agent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for unknown names.
    pub fn agent(&self, name: &str) -> Result<&AgentConfig> {
        self.agents
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| AppError::NotFound(format!("agent {name}")))
    }

    /// Look up a trigger of `agent`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when the agent or trigger is unknown.
    pub fn trigger(&self, agent: &str, name: &str) -> Result<&TriggerConfig> {
        self.agent(agent)?;
        self.triggers
            .iter()
            .find(|t| t.agent == agent && t.name == name)
            .ok_or_else(|| AppError::NotFound(format!("trigger {name} for agent {agent}")))
    }

    /// Number of agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// `listAgents` payload.
    #[must_use]
    pub fn agent_infos(&self) -> Vec<AgentInfo> {
        self.agents
            .iter()
            .map(|a| AgentInfo {
                name: a.name.clone(),
                system_prompt: a.system_prompt.clone(),
                model: ModelInfo {
                    identifier: a.model.clone(),
                },
                toolkits: a.toolkits.clone(),
            })
            .collect()
    }

    /// `listTriggers` payload.
    #[must_use]
    pub fn trigger_infos(&self) -> Vec<TriggerInfo> {
        self.triggers
            .iter()
            .map(|t| TriggerInfo {
                name: t.name.clone(),
                trigger_type: t.trigger_type.clone(),
                description: t.description.clone(),
                agent_name: t.agent.clone(),
            })
            .collect()
    }

    /// `listModels` payload: distinct models referenced by agents.
    #[must_use]
    pub fn model_infos(&self) -> Vec<ModelInfo> {
        self.agents
            .iter()
            .map(|a| a.model.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|identifier| ModelInfo { identifier })
            .collect()
    }

    /// `listPrompts` payload.
    #[must_use]
    pub fn prompt_infos(&self) -> Vec<PromptInfo> {
        self.agents
            .iter()
            .map(|a| PromptInfo {
                agent_name: a.name.clone(),
                system_prompt: a.system_prompt.clone(),
            })
            .collect()
    }
}
