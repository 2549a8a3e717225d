//! Unit tests for the tool-calling loop.
//!
//! Covers:
//! - a run announces its thread before the first round
//! - a round without tool calls completes the invocation
//! - each distinct call executes exactly once, results keep request order
//! - feed-back failures are retried with exponential backoff
//! - non-retryable failures and the round limit end the run

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent_conduit::config::AgentConfig;
use agent_conduit::host::model::{
    fatal_error, retryable_error, BoxFuture, ThreadSettings,
};
use agent_conduit::host::{
    CollectingSink, Model, ModelEvent, ModelInput, ModelThread, Orchestrator, RetryPolicy,
    Session, SessionRegistry, Tool, ToolRegistry, Toolkit,
};
use agent_conduit::protocol::events::{
    StatusUpdate, StreamEvent, ToolCallRequest, ToolCallResult,
};
use agent_conduit::{AppError, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;

// ── Scripted backend ─────────────────────────────────────────────────────────

enum Step {
    Events(Vec<ModelEvent>),
    Fail(AppError),
}

/// Thread that plays back a fixed script, then answers `done`.
struct ScriptedThread {
    script: Mutex<VecDeque<Step>>,
    invocations: AtomicUsize,
    inputs: Mutex<Vec<ModelInput>>,
}

impl ScriptedThread {
    fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            invocations: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        })
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn inputs(&self) -> Vec<ModelInput> {
        self.inputs.lock().unwrap().clone()
    }
}

impl ModelThread for ScriptedThread {
    fn thread_id(&self) -> &str {
        "thread_scripted"
    }

    fn invoke(
        &self,
        input: ModelInput,
        events: mpsc::Sender<ModelEvent>,
    ) -> BoxFuture<'_, Result<()>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input);
        let step = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            let batch = match step {
                Some(Step::Fail(err)) => return Err(err),
                Some(Step::Events(batch)) => batch,
                None => vec![ModelEvent::OutputText("done".into())],
            };
            for event in batch {
                events
                    .send(event)
                    .await
                    .map_err(|_| fatal_error("receiver closed"))?;
            }
            Ok(())
        })
    }
}

struct ScriptedModel {
    thread: Arc<ScriptedThread>,
}

impl Model for ScriptedModel {
    fn identifier(&self) -> &str {
        "scripted"
    }

    fn start_thread(
        &self,
        _settings: ThreadSettings,
    ) -> BoxFuture<'_, Result<Arc<dyn ModelThread>>> {
        let thread: Arc<dyn ModelThread> = self.thread.clone();
        Box::pin(async move { Ok(thread) })
    }
}

// ── Test tool ────────────────────────────────────────────────────────────────

/// Sleeps for `delay_ms`, then returns `tag`; counts executions.
struct CountingTool {
    executions: Arc<AtomicUsize>,
}

impl Tool for CountingTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleep, then echo a tag"
    }

    fn args_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let delay = args["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(args["tag"].clone())
        })
    }
}

// ── Fixture ──────────────────────────────────────────────────────────────────

struct Fixture {
    thread: Arc<ScriptedThread>,
    session: Arc<Session>,
    orchestrator: Orchestrator,
    executions: Arc<AtomicUsize>,
}

async fn fixture(script: Vec<Step>, max_rounds: u32) -> Fixture {
    let executions = Arc::new(AtomicUsize::new(0));
    let mut tools = ToolRegistry::new();
    tools.register(Toolkit::new("test", "Test tools").with_tool(Arc::new(CountingTool {
        executions: Arc::clone(&executions),
    })));

    let thread = ScriptedThread::new(script);
    let model = ScriptedModel {
        thread: Arc::clone(&thread),
    };
    let agent = AgentConfig {
        name: "Tester".into(),
        system_prompt: String::new(),
        model: "scripted".into(),
        toolkits: vec!["test".into()],
    };
    let session = SessionRegistry::new()
        .get_or_create(None, &agent, &model, Vec::new())
        .await
        .expect("session opens");

    let retry = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(10),
    };
    Fixture {
        thread,
        session,
        orchestrator: Orchestrator::new(Arc::new(tools), retry, max_rounds),
        executions,
    }
}

fn prompt(text: &str) -> ModelInput {
    ModelInput::UserPrompt {
        text: text.into(),
        attachments: Vec::new(),
    }
}

fn call(id: &str, name: &str, delay_ms: u64, tag: &str) -> ModelEvent {
    ModelEvent::ToolCall(ToolCallRequest {
        name: name.into(),
        call_id: id.into(),
        arguments: json!({"delay_ms": delay_ms, "tag": tag}),
    })
}

fn completed_thread(events: &[StreamEvent]) -> Option<String> {
    match events.last() {
        Some(StreamEvent::Status(status)) if status.is_terminal() => Some(status.thread_id.clone()),
        _ => None,
    }
}

// ── Rounds ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_reply_completes_in_one_round() {
    let fx = fixture(Vec::new(), 4).await;
    let sink = CollectingSink::new();

    fx.orchestrator
        .run(&fx.session, prompt("hi"), &sink)
        .await
        .expect("run succeeds");

    let events = sink.events();
    assert_eq!(events[0], StreamEvent::Status(StatusUpdate::started("thread_scripted")));
    assert!(!events[0].is_terminal());
    assert_eq!(events[1], StreamEvent::OutputText("done".into()));
    assert_eq!(completed_thread(&events).as_deref(), Some("thread_scripted"));
    assert_eq!(fx.thread.invocations(), 1);
}

/// Duplicate call ids run once; results follow request order even when
/// later calls finish first.
#[tokio::test]
async fn each_distinct_call_executes_once_in_order() {
    let script = vec![Step::Events(vec![
        call("c1", "slow", 60, "a"),
        call("c2", "slow", 10, "b"),
        call("c1", "slow", 60, "a"),
        call("c3", "slow", 0, "c"),
    ])];
    let fx = fixture(script, 4).await;
    let sink = CollectingSink::new();

    fx.orchestrator
        .run(&fx.session, prompt("go"), &sink)
        .await
        .expect("run succeeds");

    assert_eq!(fx.executions.load(Ordering::SeqCst), 3);

    let expected = vec![
        ToolCallResult::new("c1", "a"),
        ToolCallResult::new("c2", "b"),
        ToolCallResult::new("c3", "c"),
    ];
    let events = sink.events();
    assert!(events.contains(&StreamEvent::ToolCallsCompleted(expected.clone())));
    assert_eq!(fx.thread.inputs()[1], ModelInput::ToolResults(expected));
    assert!(completed_thread(&events).is_some());
}

/// Calls to tools outside the agent's toolkits are answered with an error
/// result instead of failing the run.
#[tokio::test]
async fn unknown_tool_yields_error_result() {
    let script = vec![Step::Events(vec![call("c1", "missing", 0, "x")])];
    let fx = fixture(script, 4).await;
    let sink = CollectingSink::new();

    fx.orchestrator
        .run(&fx.session, prompt("go"), &sink)
        .await
        .expect("run succeeds");

    assert!(sink.events().contains(&StreamEvent::ToolCallsCompleted(vec![
        ToolCallResult::new("c1", "error: unknown tool missing")
    ])));
}

#[tokio::test]
async fn round_limit_is_enforced() {
    let script = vec![
        Step::Events(vec![call("c1", "slow", 0, "a")]),
        Step::Events(vec![call("c2", "slow", 0, "b")]),
    ];
    let fx = fixture(script, 2).await;
    let sink = CollectingSink::new();

    let err = fx
        .orchestrator
        .run(&fx.session, prompt("loop"), &sink)
        .await
        .expect_err("round limit reached");

    assert!(matches!(&err, AppError::Model { retryable: false, message } if message.contains("2 rounds")));
    assert!(completed_thread(&sink.events()).is_none());
}

// ── Retry ────────────────────────────────────────────────────────────────────

/// Retryable feed-back failures are retried `max_retries` times with
/// doubling delays before the error surfaces.
#[tokio::test]
async fn feedback_retries_exhaust_with_backoff() {
    let script = vec![
        Step::Events(vec![call("c1", "slow", 0, "a")]),
        Step::Fail(retryable_error("503")),
        Step::Fail(retryable_error("503")),
        Step::Fail(retryable_error("503")),
        Step::Fail(retryable_error("503")),
    ];
    let fx = fixture(script, 4).await;
    let sink = CollectingSink::new();
    let started = Instant::now();

    let err = fx
        .orchestrator
        .run(&fx.session, prompt("go"), &sink)
        .await
        .expect_err("retries exhausted");

    assert!(err.is_retryable());
    assert_eq!(fx.thread.invocations(), 5, "one call plus one attempt and three retries");
    assert!(started.elapsed() >= Duration::from_millis(70), "10 + 20 + 40 ms of backoff");
    assert!(completed_thread(&sink.events()).is_none());
}

#[tokio::test]
async fn feedback_recovers_after_transient_failures() {
    let script = vec![
        Step::Events(vec![call("c1", "slow", 0, "a")]),
        Step::Fail(retryable_error("rate limited")),
        Step::Fail(retryable_error("rate limited")),
    ];
    let fx = fixture(script, 4).await;
    let sink = CollectingSink::new();

    fx.orchestrator
        .run(&fx.session, prompt("go"), &sink)
        .await
        .expect("run recovers");

    assert_eq!(fx.thread.invocations(), 4);
    assert_eq!(fx.executions.load(Ordering::SeqCst), 1, "tools are not re-run on retry");
    assert!(completed_thread(&sink.events()).is_some());
}

#[tokio::test]
async fn fatal_feedback_failure_is_not_retried() {
    let script = vec![
        Step::Events(vec![call("c1", "slow", 0, "a")]),
        Step::Fail(fatal_error("bad request")),
    ];
    let fx = fixture(script, 4).await;
    let sink = CollectingSink::new();

    let err = fx
        .orchestrator
        .run(&fx.session, prompt("go"), &sink)
        .await
        .expect_err("fatal error surfaces");

    assert!(!err.is_retryable());
    assert_eq!(fx.thread.invocations(), 2);
}

/// Only feed-back calls are retried; the initial prompt fails immediately.
/// The thread was already announced.
#[tokio::test]
async fn first_round_failure_is_not_retried() {
    let fx = fixture(vec![Step::Fail(retryable_error("503"))], 4).await;
    let sink = CollectingSink::new();

    let result = fx.orchestrator.run(&fx.session, prompt("go"), &sink).await;

    assert!(result.is_err());
    assert_eq!(fx.thread.invocations(), 1);
    assert_eq!(
        sink.events(),
        vec![StreamEvent::Status(StatusUpdate::started("thread_scripted"))]
    );
}
