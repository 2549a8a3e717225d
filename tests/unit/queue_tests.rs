//! Unit tests for the bounded drop-oldest queue.

use std::sync::Arc;
use std::time::Duration;

use agent_conduit::client::queue::RecordQueue;
use agent_conduit::AppError;

/// Pushing past capacity discards the oldest entries and counts them.
#[test]
fn overflow_drops_oldest() {
    let queue = RecordQueue::new("test", 3);
    for n in 0..5 {
        assert!(queue.push(n));
    }
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.dropped(), 2);
    let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop())
        .map(Result::unwrap)
        .collect();
    assert_eq!(drained, vec![2, 3, 4]);
}

/// Entries queued before an error close are delivered first, then the
/// error once, then nothing.
#[tokio::test]
async fn error_close_follows_remaining_items() {
    let queue = RecordQueue::new("test", 4);
    queue.push("a");
    queue.close(Some(AppError::ProcessTerminated("gone".into())));

    assert!(!queue.push("late"), "closed queue must refuse pushes");
    assert_eq!(queue.pop().await.unwrap().unwrap(), "a");
    assert!(matches!(
        queue.pop().await,
        Some(Err(AppError::ProcessTerminated(_)))
    ));
    assert!(queue.pop().await.is_none());
}

/// A waiting consumer wakes when an entry arrives.
#[tokio::test]
async fn pop_waits_for_push() {
    let queue = Arc::new(RecordQueue::new("test", 4));
    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.pop().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.push(7_u32);

    let popped = tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .expect("consumer finishes")
        .expect("task joins");
    assert_eq!(popped.unwrap().unwrap(), 7);
}

/// A clean close ends a waiting consumer with `None`.
#[tokio::test]
async fn clean_close_wakes_waiter() {
    let queue = Arc::new(RecordQueue::<u32>::new("test", 4));
    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.pop().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.close(None);

    let popped = tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .expect("consumer finishes")
        .expect("task joins");
    assert!(popped.is_none());
}
