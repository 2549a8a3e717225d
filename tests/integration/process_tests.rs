//! Supervising real host processes: the `conduit-host` binary and small
//! shell stand-ins.

use std::time::Duration;

use agent_conduit::client::{
    HostClient, ProcessState, StopOutcome, Supervisor, SupervisorOptions,
};
use agent_conduit::protocol::envelope::StreamSource;
use agent_conduit::protocol::types::InvokeAgentBody;
use agent_conduit::AppError;

use super::test_helpers::test_options;

fn host_binary() -> Vec<String> {
    vec![env!("CARGO_BIN_EXE_conduit-host").to_owned()]
}

fn shell(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

// ── conduit-host ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn spawned_host_serves_and_stops_gracefully() {
    let client = HostClient::spawn(&host_binary(), test_options()).expect("host spawns");
    assert_eq!(client.state(), ProcessState::Running);

    let ready = client.wait_ready().await.expect("ready");
    assert_eq!(ready.name, "agent-conduit");
    assert_eq!(client.ping().await.expect("ping"), "pong");

    let outcome = client
        .invoke_agent(&InvokeAgentBody {
            agent: "Echo".into(),
            prompt: "over the pipe".into(),
            thread_id: None,
            attachments: Vec::new(),
        })
        .await
        .expect("stream opens")
        .collect()
        .await
        .expect("run completes");
    assert_eq!(outcome.final_text(), "over the pipe");

    assert_eq!(client.stop().await.expect("stop"), StopOutcome::Graceful);
    assert_eq!(client.state(), ProcessState::Stopped);
    assert!(matches!(client.ping().await, Err(AppError::ProcessNotRunning)));
}

#[tokio::test]
async fn shutdown_request_ends_host() {
    let client = HostClient::spawn(&host_binary(), test_options()).expect("host spawns");
    client.wait_ready().await.expect("ready");

    client.shutdown().await.expect("shutdown acked");

    let exit = client
        .supervisor()
        .expect("supervised")
        .wait()
        .await
        .expect("exit info");
    assert_eq!(exit.code, Some(0));
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_command_fails_to_spawn() {
    let supervisor = Supervisor::new(SupervisorOptions::default());
    assert!(matches!(supervisor.start(&[]), Err(AppError::Spawn(_))));
    assert_eq!(supervisor.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn missing_program_fails_to_spawn() {
    let result = HostClient::spawn(
        &["/nonexistent/conduit-host".to_owned()],
        test_options(),
    );
    assert!(matches!(result, Err(AppError::Spawn(_))));
}

/// Waiting on a supervisor whose launch failed returns the failure.
#[tokio::test]
async fn wait_returns_after_failed_launch() {
    let supervisor = Supervisor::new(SupervisorOptions::default());
    let err = supervisor
        .start(&["/definitely/not/a/program".to_owned()])
        .expect_err("launch fails");
    assert!(matches!(err, AppError::Spawn(_)));
    assert_eq!(supervisor.state(), ProcessState::Stopped);

    let exit = tokio::time::timeout(Duration::from_secs(2), supervisor.wait())
        .await
        .expect("wait returns")
        .expect("exit info");
    assert_eq!(exit.code, None);
    assert_eq!(exit.reason, err.to_string());
}

/// A supervisor runs one process; later starts are refused.
#[cfg(unix)]
#[tokio::test]
async fn start_is_refused_while_running_and_after_stop() {
    let supervisor = Supervisor::new(SupervisorOptions::default());
    supervisor.start(&shell("cat > /dev/null")).expect("starts");
    assert!(matches!(
        supervisor.start(&shell("true")),
        Err(AppError::AlreadyRunning)
    ));

    let outcome = supervisor.stop(Duration::from_secs(2)).await.expect("stop");
    assert_eq!(outcome, StopOutcome::Graceful);
    assert_eq!(
        supervisor.stop(Duration::from_secs(2)).await.expect("second stop"),
        StopOutcome::AlreadyStopped
    );
    assert!(matches!(supervisor.start(&shell("true")), Err(AppError::Spawn(_))));
}

/// A child that ignores end of input is killed after the grace period.
#[cfg(unix)]
#[tokio::test]
async fn stubborn_child_is_killed() {
    let supervisor = Supervisor::new(SupervisorOptions::default());
    supervisor
        .start(&shell("trap '' TERM; exec sleep 30"))
        .expect("starts");

    let outcome = supervisor
        .stop(Duration::from_millis(200))
        .await
        .expect("stop");
    assert_eq!(outcome, StopOutcome::Forced);
    assert_eq!(supervisor.state(), ProcessState::Stopped);
}

/// Waiters still pending when the child dies fail with the termination
/// reason instead of hanging.
#[cfg(unix)]
#[tokio::test]
async fn pending_call_fails_when_child_dies() {
    let client = HostClient::spawn(&shell("cat > /dev/null"), test_options()).expect("spawns");

    let (reply, ()) = tokio::join!(client.ping(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.kill().await.expect("kill");
    });

    assert!(matches!(reply, Err(AppError::ProcessTerminated(_))));
    assert_eq!(client.state(), ProcessState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn exit_code_and_stderr_are_captured() {
    let supervisor = Supervisor::new(SupervisorOptions::default());
    let transport = supervisor
        .start(&shell("echo 'host warming up' >&2; sleep 0.2; exit 3"))
        .expect("starts");

    let exit = supervisor.wait().await.expect("exit info");
    assert_eq!(exit.code, Some(3));

    let unsolicited = transport.router().unsolicited();
    let record = tokio::time::timeout(Duration::from_secs(2), unsolicited.pop())
        .await
        .expect("stderr line arrives")
        .expect("queue open")
        .expect("record");
    assert_eq!(record.source, StreamSource::Stderr);
    assert_eq!(record.raw, "host warming up");
}
