//! End-to-end calls from the typed client to a host served in-process.

use std::time::Duration;

use agent_conduit::client::ChatUpdate;
use agent_conduit::protocol::envelope::{ErrorCode, PROTOCOL_VERSION};
use agent_conduit::protocol::types::{InvokeAgentBody, InvokeToolBody, InvokeTriggerBody};
use agent_conduit::AppError;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::test_helpers::start_default_host;

fn prompt(agent: &str, text: &str, thread_id: Option<String>) -> InvokeAgentBody {
    InvokeAgentBody {
        agent: agent.into(),
        prompt: text.into(),
        thread_id,
        attachments: Vec::new(),
    }
}

fn remote_code(err: &AppError) -> Option<ErrorCode> {
    match err {
        AppError::Remote(obj) => Some(obj.code),
        _ => None,
    }
}

// ── Single-reply methods ─────────────────────────────────────────────────────

#[tokio::test]
async fn ping_and_app_info() {
    let host = start_default_host().await;

    assert_eq!(host.client.ping().await.expect("ping"), "pong");

    let info = host.client.app_info().await.expect("app info");
    assert_eq!(info.name, "agent-conduit");
    assert_eq!(info.protocol_version, PROTOCOL_VERSION);
    assert_eq!(info.agents, 1);
}

#[tokio::test]
async fn listings_describe_default_host() {
    let host = start_default_host().await;

    let agents = host.client.list_agents().await.expect("agents");
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "Echo");

    let toolkits = host.client.list_toolkits().await.expect("toolkits");
    assert!(toolkits.iter().any(|t| t.name == "utility"));

    let tools = host.client.list_tools().await.expect("tools");
    assert!(tools.iter().any(|t| t.name == "add" && t.toolkit_name == "utility"));

    let triggers = host.client.list_triggers().await.expect("triggers");
    assert_eq!(triggers[0].agent_name, "Echo");

    let models = host.client.list_models().await.expect("models");
    assert_eq!(models[0].identifier, "echo");

    let prompts = host.client.list_prompts().await.expect("prompts");
    assert_eq!(prompts[0].agent_name, "Echo");
}

#[tokio::test]
async fn invoke_tool_directly() {
    let host = start_default_host().await;

    let out = host
        .client
        .invoke_tool(&InvokeToolBody {
            tool: "add".into(),
            toolkit: None,
            args: json!({"a": 2, "b": 40}),
        })
        .await
        .expect("tool runs");
    assert_eq!(out, json!(42));

    let err = host
        .client
        .invoke_tool(&InvokeToolBody {
            tool: "add".into(),
            toolkit: None,
            args: json!({"a": 2}),
        })
        .await
        .expect_err("missing argument");
    assert_eq!(remote_code(&err), Some(ErrorCode::ToolError));
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let host = start_default_host().await;

    let err = host
        .client
        .request::<(), serde_json::Value>("teleport", None)
        .await
        .expect_err("unknown method");
    assert_eq!(remote_code(&err), Some(ErrorCode::UnknownMethod));
}

/// Concurrent calls each receive their own reply.
#[tokio::test]
async fn concurrent_calls_are_correlated() {
    let host = start_default_host().await;

    let (a, b, c) = tokio::join!(
        host.client.ping(),
        host.client.list_agents(),
        host.client.app_info()
    );
    assert_eq!(a.expect("ping"), "pong");
    assert_eq!(b.expect("agents").len(), 1);
    assert_eq!(c.expect("info").agents, 1);
}

// ── Agent streams ────────────────────────────────────────────────────────────

/// The first update names the thread; deltas build the message up; the
/// terminal status reports the same thread.
#[tokio::test]
async fn agent_reply_streams_to_completion() {
    let host = start_default_host().await;

    let mut stream = host
        .client
        .invoke_agent(&prompt("Echo", "hello there friend", None))
        .await
        .expect("stream opens");

    let mut updates = Vec::new();
    while let Some(update) = stream.next().await {
        updates.push(update.expect("update"));
    }

    let Some(ChatUpdate::Status(started)) = updates.first() else {
        panic!("stream must open with a status update: {updates:?}");
    };
    assert_eq!(started.status, "started");
    assert!(matches!(updates.get(1), Some(ChatUpdate::TextUpdated { index: 0, .. })));
    assert!(updates.contains(&ChatUpdate::MessageSealed {
        index: 0,
        text: "hello there friend".into()
    }));
    let Some(ChatUpdate::Completed {
        thread_id: Some(thread_id),
    }) = updates.last()
    else {
        panic!("stream must end with a completed update: {updates:?}");
    };
    assert!(thread_id.starts_with("thread_"));
    assert_eq!(&started.thread_id, thread_id);
}

#[tokio::test]
async fn thread_can_be_resumed() {
    let host = start_default_host().await;

    let first = host
        .client
        .invoke_agent(&prompt("Echo", "one", None))
        .await
        .expect("stream opens")
        .collect()
        .await
        .expect("first turn");
    let thread_id = first.thread_id.clone().expect("thread id");

    let second = host
        .client
        .invoke_agent(&prompt("Echo", "two", Some(thread_id.clone())))
        .await
        .expect("stream opens")
        .collect()
        .await
        .expect("second turn");

    assert_eq!(second.thread_id, Some(thread_id));
    assert_eq!(second.final_text(), "two");
}

#[tokio::test]
async fn unknown_agent_or_thread_fails_stream() {
    let host = start_default_host().await;

    let err = host
        .client
        .invoke_agent(&prompt("Ghost", "hi", None))
        .await
        .expect("stream opens")
        .collect()
        .await
        .expect_err("unknown agent");
    assert_eq!(remote_code(&err), Some(ErrorCode::NotFound));

    let err = host
        .client
        .invoke_agent(&prompt("Echo", "hi", Some("thread_nope".into())))
        .await
        .expect("stream opens")
        .collect()
        .await
        .expect_err("unknown thread");
    assert_eq!(remote_code(&err), Some(ErrorCode::NotFound));
}

/// A tool directive produces one tool round before the final answer.
#[tokio::test]
async fn tool_round_feeds_results_back() {
    let host = start_default_host().await;

    let outcome = host
        .client
        .invoke_agent(&prompt("Echo", r#"/tool add {"a":1,"b":2}"#, None))
        .await
        .expect("stream opens")
        .collect()
        .await
        .expect("run completes");

    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].name, "add");
    assert_eq!(outcome.tool_results.len(), 1);
    assert_eq!(outcome.tool_results[0].output, "3");
    assert_eq!(outcome.final_text(), "3");
}

// ── Triggers ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn trigger_collects_result() {
    let host = start_default_host().await;

    let response = host
        .client
        .invoke_trigger(
            &InvokeTriggerBody {
                agent_name: "Echo".into(),
                trigger_name: "echo-webhook".into(),
                trigger_type: "webhook".into(),
                thread_id: None,
                http_request: None,
            },
            &CancellationToken::new(),
        )
        .await
        .expect("trigger runs");

    assert!(response.success);
    assert!(response.thread_id.is_some());
    assert_eq!(
        response.result.as_deref(),
        Some("Trigger echo-webhook (webhook) fired.")
    );
    assert_eq!(response.events.last().map(String::as_str), Some("status"));
}

#[tokio::test]
async fn trigger_failure_is_reported_not_raised() {
    let host = start_default_host().await;

    let response = host
        .client
        .invoke_trigger(
            &InvokeTriggerBody {
                agent_name: "Echo".into(),
                trigger_name: "missing".into(),
                trigger_type: String::new(),
                thread_id: None,
                http_request: None,
            },
            &CancellationToken::new(),
        )
        .await
        .expect("failure is a response");

    assert!(!response.success);
    assert!(response.error.expect("error text").contains("NOT_FOUND"));
}

// ── Shutdown ─────────────────────────────────────────────────────────────────

/// The acknowledgement arrives before the host stops serving.
#[tokio::test]
async fn shutdown_stops_serving() {
    let host = start_default_host().await;

    let ack = host.client.shutdown().await.expect("shutdown acked");
    assert_eq!(ack.status, "shutting_down");

    let served = tokio::time::timeout(Duration::from_secs(5), host.server)
        .await
        .expect("server exits")
        .expect("server task joins");
    assert!(served.is_ok());

    let err = host.client.ping().await.expect_err("host is gone");
    assert!(matches!(
        err,
        AppError::ProcessTerminated(_) | AppError::ProcessNotRunning | AppError::Transport(_)
    ));
}
