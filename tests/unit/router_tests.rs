//! Unit tests for reply correlation and stream routing.
//!
//! Covers:
//! - single replies reach their waiter exactly once
//! - records for one stream never reach another
//! - terminal records close the stream; `output_text` does not
//! - unclaimed, undecodable and stderr lines go to the unsolicited queue
//! - termination fails every waiter and stream with the same reason

use agent_conduit::client::router::{ends_stream, Router};
use agent_conduit::protocol::envelope::{decode, OutputRecord, StreamSource};
use agent_conduit::AppError;

fn stdout(line: &str) -> OutputRecord {
    OutputRecord::new(StreamSource::Stdout, line.to_owned(), decode(line))
}

fn delta(id: &str, seq: u64, text: &str) -> String {
    format!(
        r#"{{"id":"{id}","type":"output_text_delta","success":true,"result":{{"outputTextDelta":{{"delta":"{text}","sequenceNumber":{seq}}}}}}}"#
    )
}

fn completed(id: &str) -> String {
    format!(r#"{{"id":"{id}","type":"status","success":true,"result":{{"threadId":"t1","status":"completed"}}}}"#)
}

// ── Single replies ───────────────────────────────────────────────────────────

#[tokio::test]
async fn reply_reaches_its_waiter() {
    let router = Router::new(8, 8);
    let rx = router.register_pending("ping:1").expect("register");

    router.route(stdout(r#"{"id":"ping:1","success":true,"result":"pong"}"#));

    let resp = rx.await.expect("delivered").expect("ok reply");
    assert_eq!(resp.id, "ping:1");
    assert_eq!(router.pending_count(), 0);
}

/// A second reply for an already-answered id is not delivered twice.
#[tokio::test]
async fn duplicate_reply_goes_unsolicited() {
    let router = Router::new(8, 8);
    let rx = router.register_pending("ping:1").expect("register");
    let line = r#"{"id":"ping:1","success":true,"result":"pong"}"#;

    router.route(stdout(line));
    router.route(stdout(line));

    assert!(rx.await.is_ok());
    assert_eq!(router.unsolicited().len(), 1);
}

#[test]
fn duplicate_registration_is_rejected() {
    let router = Router::new(8, 8);
    let _rx = router.register_pending("a").expect("first");
    assert!(matches!(
        router.register_pending("a"),
        Err(AppError::DuplicateRequestId(id)) if id == "a"
    ));
    let _q = router.register_stream("s").expect("first stream");
    assert!(router.register_stream("s").is_err());
}

// ── Streams ──────────────────────────────────────────────────────────────────

/// Interleaved records for two streams each arrive at their own queue in
/// read order.
#[tokio::test]
async fn streams_are_isolated_and_ordered() {
    let router = Router::new(8, 8);
    let a = router.register_stream("a").expect("stream a");
    let b = router.register_stream("b").expect("stream b");

    router.route(stdout(&delta("a", 0, "a0")));
    router.route(stdout(&delta("b", 0, "b0")));
    router.route(stdout(&delta("a", 1, "a1")));
    router.route(stdout(&completed("b")));

    let first = a.pop().await.unwrap().unwrap();
    let second = a.pop().await.unwrap().unwrap();
    assert!(first.result.unwrap().as_str().contains("a0"));
    assert!(second.result.unwrap().as_str().contains("a1"));
    assert!(a.is_empty());
    assert!(!a.is_closed());

    assert!(b.pop().await.unwrap().unwrap().result.unwrap().as_str().contains("b0"));
    assert!(ends_stream(&b.pop().await.unwrap().unwrap()));
    assert!(b.pop().await.is_none(), "terminal record closes the stream");
    assert_eq!(router.stream_count(), 1);
}

/// Full text and the `started` status stay inside the stream; only a
/// terminal status ends it.
#[tokio::test]
async fn only_terminal_status_closes_stream() {
    let router = Router::new(8, 8);
    let q = router.register_stream("s").expect("stream");

    router.route(stdout(
        r#"{"id":"s","type":"status","success":true,"result":{"threadId":"t1","status":"started"}}"#,
    ));
    router.route(stdout(
        r#"{"id":"s","type":"output_text","success":true,"result":{"outputText":{"text":"round one"}}}"#,
    ));
    router.route(stdout(&delta("s", 0, "round two")));
    router.route(stdout(&completed("s")));

    for _ in 0..3 {
        let resp = q.pop().await.unwrap().unwrap();
        assert!(!ends_stream(&resp), "{:?} must not end the stream", resp.event_type);
    }
    assert!(ends_stream(&q.pop().await.unwrap().unwrap()));
    assert!(q.pop().await.is_none());
}

/// A failed record ends its stream.
#[tokio::test]
async fn error_record_closes_stream() {
    let router = Router::new(8, 8);
    let q = router.register_stream("s").expect("stream");

    router.route(stdout(
        r#"{"id":"s","success":false,"errorObj":{"code":"NOT_FOUND","message":"agent X"}}"#,
    ));

    let resp = q.pop().await.unwrap().unwrap();
    assert!(!resp.success);
    assert!(q.pop().await.is_none());
}

/// Records arriving after a stream was released are kept as unsolicited.
#[test]
fn late_stream_record_goes_unsolicited() {
    let router = Router::new(8, 8);
    let q = router.register_stream("s").expect("stream");
    router.release_stream("s", &q);

    router.route(stdout(&delta("s", 0, "late")));

    assert!(q.is_empty());
    assert_eq!(router.unsolicited().len(), 1);
}

// ── Unsolicited ──────────────────────────────────────────────────────────────

#[test]
fn unclaimed_and_bad_lines_are_kept() {
    let router = Router::new(8, 8);

    router.route(stdout(r#"{"id":"nobody","success":true,"result":1}"#));
    router.route(stdout("not json at all"));
    router.route(OutputRecord::new(
        StreamSource::Stderr,
        "host log line".into(),
        decode("host log line"),
    ));

    let unsolicited = router.unsolicited();
    assert_eq!(unsolicited.len(), 3);
    let bad = unsolicited.try_pop().unwrap().unwrap();
    assert_eq!(bad.id(), Some("nobody"));
    let bad = unsolicited.try_pop().unwrap().unwrap();
    assert!(bad.parsed.is_err());
    assert_eq!(bad.raw, "not json at all");
    let log = unsolicited.try_pop().unwrap().unwrap();
    assert_eq!(log.source, StreamSource::Stderr);
}

/// The ready announcement is published to watchers and kept as unsolicited.
#[test]
fn ready_record_is_published() {
    let router = Router::new(8, 8);
    let rx = router.subscribe_ready();

    router.route(stdout(
        r#"{"id":"ready","type":"ready","success":true,"result":{"name":"h","protocolVersion":"1"}}"#,
    ));

    assert!(rx.borrow().is_some());
    assert_eq!(router.unsolicited().len(), 1);
}

// ── Termination ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn termination_fails_everything_once() {
    let router = Router::new(8, 8);
    let rx = router.register_pending("p").expect("pending");
    let q = router.register_stream("s").expect("stream");

    router.terminate_all(AppError::ProcessTerminated("exit status 1".into()));
    router.terminate_all(AppError::Transport("second reason".into()));

    assert!(matches!(rx.await, Ok(Err(AppError::ProcessTerminated(_)))));
    assert!(matches!(q.pop().await, Some(Err(AppError::ProcessTerminated(_)))));
    assert!(q.pop().await.is_none());
    assert!(matches!(
        router.register_pending("later"),
        Err(AppError::ProcessTerminated(_))
    ));
    assert!(router.closed().is_cancelled());
}
