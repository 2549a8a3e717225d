//! Conversation threads kept alive between invocations.
//!
//! A thread id returned by one `invokeAgent` can be passed to the next to
//! continue the conversation. Turns on the same session are serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::AgentConfig;
use crate::host::model::{Model, ModelThread, ThreadSettings};
use crate::protocol::types::ToolInfo;
use crate::{AppError, Result};

/// One live conversation.
pub struct Session {
    /// Backend-assigned thread id.
    pub thread_id: String,
    /// Agent the thread belongs to.
    pub agent: String,
    /// Toolkits reachable from this thread.
    pub toolkits: Vec<String>,
    /// When the thread was opened.
    pub created_at: DateTime<Utc>,
    thread: Arc<dyn ModelThread>,
    turn: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("thread_id", &self.thread_id)
            .field("agent", &self.agent)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Model thread handle.
    #[must_use]
    pub fn thread(&self) -> &Arc<dyn ModelThread> {
        &self.thread
    }

    /// Acquire the turn lock; one invocation at a time per thread.
    pub async fn begin_turn(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.turn.lock().await
    }
}

/// Live sessions keyed by thread id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume `thread_id`, or open a new thread when none is given.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for unknown thread ids,
    /// [`AppError::InvalidParams`] when the thread belongs to another agent,
    /// and any error the model raises while opening a thread.
    pub async fn get_or_create(
        &self,
        thread_id: Option<&str>,
        agent: &AgentConfig,
        model: &dyn Model,
        tools: Vec<ToolInfo>,
    ) -> Result<Arc<Session>> {
        if let Some(id) = thread_id.filter(|id| !id.is_empty()) {
            let session = self
                .get(id)
                .ok_or_else(|| AppError::NotFound(format!("unknown thread {id}")))?;
            if session.agent != agent.name {
                return Err(AppError::InvalidParams(format!(
                    "thread {id} belongs to agent {}",
                    session.agent
                )));
            }
            return Ok(session);
        }

        let thread = model
            .start_thread(ThreadSettings {
                agent: agent.name.clone(),
                system_prompt: agent.system_prompt.clone(),
                tools,
            })
            .await?;
        let session = Arc::new(Session {
            thread_id: thread.thread_id().to_owned(),
            agent: agent.name.clone(),
            toolkits: agent.toolkits.clone(),
            created_at: Utc::now(),
            thread,
            turn: tokio::sync::Mutex::new(()),
        });
        info!(thread_id = %session.thread_id, agent = %session.agent, "thread opened");
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.thread_id.clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Look up a live session.
    #[must_use]
    pub fn get(&self, thread_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .cloned()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
