//! Model backend abstraction.
//!
//! A [`Model`] opens conversation threads; a [`ModelThread`] runs one round
//! per [`ModelThread::invoke`] call, streaming [`ModelEvent`]s into the
//! provided channel and returning once the round's output is complete.
//! Failures are [`AppError::Model`] values whose `retryable` flag drives the
//! orchestrator's backoff.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::events::{TextDelta, ToolCallRequest, ToolCallResult};
use crate::protocol::types::{FileAttachment, ToolInfo};
use crate::{AppError, Result};

/// Boxed `Send` future used by the host's collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Input for one round.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
    /// A user turn.
    UserPrompt {
        /// Prompt text.
        text: String,
        /// Attached files.
        attachments: Vec<FileAttachment>,
    },
    /// Results of the previous round's tool calls.
    ToolResults(Vec<ToolCallResult>),
}

/// Output produced during a round.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Partial text.
    OutputTextDelta(TextDelta),
    /// Full text of a message.
    OutputText(String),
    /// Tool call request.
    ToolCall(ToolCallRequest),
}

/// Settings a thread is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSettings {
    /// Agent the thread belongs to.
    pub agent: String,
    /// System prompt.
    pub system_prompt: String,
    /// Tools the model may call.
    pub tools: Vec<ToolInfo>,
}

/// A model backend.
pub trait Model: Send + Sync {
    /// Identifier listed by `listModels`.
    fn identifier(&self) -> &str;

    /// Open a new conversation thread; the backend assigns its id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Model`] when the backend refuses.
    fn start_thread(
        &self,
        settings: ThreadSettings,
    ) -> BoxFuture<'_, Result<Arc<dyn ModelThread>>>;
}

/// One live conversation on a model backend.
pub trait ModelThread: Send + Sync {
    /// Backend-assigned thread id.
    fn thread_id(&self) -> &str;

    /// Run one round, sending events to `events` as they are produced.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Model`]; `retryable` marks transient failures.
    fn invoke(
        &self,
        input: ModelInput,
        events: mpsc::Sender<ModelEvent>,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Transient backend failure.
#[must_use]
pub fn retryable_error(message: impl Into<String>) -> AppError {
    AppError::Model {
        message: message.into(),
        retryable: true,
    }
}

/// Permanent backend failure.
#[must_use]
pub fn fatal_error(message: impl Into<String>) -> AppError {
    AppError::Model {
        message: message.into(),
        retryable: false,
    }
}

/// Models available to the host, keyed by identifier.
#[derive(Default, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn Model>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.models.keys().collect();
        ids.sort();
        f.debug_struct("ModelRegistry").field("models", &ids).finish()
    }
}

impl ModelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `model` under its identifier, replacing any previous entry.
    pub fn register(&mut self, model: Arc<dyn Model>) {
        self.models.insert(model.identifier().to_owned(), model);
    }

    /// Look up a model.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for unknown identifiers.
    pub fn get(&self, identifier: &str) -> Result<Arc<dyn Model>> {
        self.models
            .get(identifier)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("model {identifier}")))
    }

    /// Whether `identifier` is registered.
    #[must_use]
    pub fn contains(&self, identifier: &str) -> bool {
        self.models.contains_key(identifier)
    }
}
