//! Pull queue behaviour against the in-memory engine

mod common;

use berth::config::DEFAULT_HISTORY_LIMIT;
use berth::error::BerthError;
use berth::image::{PullStatus, QueueSnapshot};
use common::{start_pulls, FakeEngine, PullScript};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Block until the active task has received its first layer
async fn wait_for_download(snapshot: &mut watch::Receiver<QueueSnapshot>) {
    timeout(
        WAIT,
        snapshot.wait_for(|s| {
            s.current
                .as_ref()
                .is_some_and(|t| t.status == PullStatus::PullImage && !t.layers.is_empty())
        }),
    )
    .await
    .expect("download did not start")
    .expect("pull queue closed");
}

#[tokio::test]
async fn test_pull_completes() {
    let engine = Arc::new(FakeEngine::new());
    let pulls = start_pulls(engine.clone(), 10);

    let task = pulls.pull("redis").await.unwrap();
    assert_eq!(task.image_tag, "redis:latest");
    assert_eq!(task.status, PullStatus::Completed);
    assert_eq!(task.local_exists, Some(false));
    assert_eq!(task.remote_exists, Some(true));
    assert_eq!(task.layers, vec!["a1", "b2"]);
    assert_eq!(task.layer_status["a1"].total, 10);
    assert_eq!(engine.count("create_image redis:latest"), 1);
}

#[tokio::test]
async fn test_one_pull_at_a_time() {
    let engine = Arc::new(FakeEngine::with_pull_delay(Duration::from_millis(30)));
    let pulls = start_pulls(engine.clone(), 10);

    let mut tickets = Vec::new();
    for image in ["redis:7", "nginx:1.25", "postgres:16"] {
        tickets.push(pulls.enqueue(image).await.unwrap());
    }
    for ticket in tickets {
        let task = timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
        assert_eq!(task.status, PullStatus::Completed);
    }
    assert_eq!(engine.max_active_pulls(), 1);
    assert_eq!(engine.count("create_image"), 3);

    let history: Vec<String> = pulls
        .snapshot()
        .history
        .into_iter()
        .map(|t| t.image_tag)
        .collect();
    assert_eq!(history, vec!["redis:7", "nginx:1.25", "postgres:16"]);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let engine = Arc::new(FakeEngine::new());
    let pulls = start_pulls(engine.clone(), 2);

    for image in ["a:1", "b:1", "c:1", "d:1"] {
        pulls.pull(image).await.unwrap();
    }
    let snapshot = pulls.snapshot();
    let history: Vec<&str> = snapshot.history.iter().map(|t| t.image_tag.as_str()).collect();
    assert_eq!(history, vec!["c:1", "d:1"]);
    assert!(snapshot.current.is_none());
    assert!(snapshot.queue.is_empty());
}

#[tokio::test]
async fn test_default_history_keeps_last_twenty() {
    let engine = Arc::new(FakeEngine::new());
    let pulls = start_pulls(engine.clone(), DEFAULT_HISTORY_LIMIT);

    for i in 0..25 {
        pulls.pull(&format!("img{}:1", i)).await.unwrap();
    }
    let snapshot = pulls.snapshot();
    assert_eq!(snapshot.history.len(), 20);
    assert_eq!(snapshot.history.first().unwrap().image_tag, "img5:1");
    assert_eq!(snapshot.history.last().unwrap().image_tag, "img24:1");
    assert_eq!(engine.count("create_image"), 25);
}

#[tokio::test]
async fn test_local_image_skips_registry() {
    let engine = Arc::new(FakeEngine::new());
    engine.add_image("alpine:3.19");
    let pulls = start_pulls(engine.clone(), 10);

    let task = pulls.pull("alpine:3.19").await.unwrap();
    assert_eq!(task.status, PullStatus::Completed);
    assert_eq!(task.local_exists, Some(true));
    assert_eq!(task.remote_exists, None);
    assert_eq!(engine.count("distribution_info"), 0);
    assert_eq!(engine.count("create_image"), 0);
}

#[tokio::test]
async fn test_missing_remote_aborts() {
    let engine = Arc::new(FakeEngine::new());
    engine.hide_remote("ghost:1.0");
    let pulls = start_pulls(engine.clone(), 10);

    let err = pulls.pull("ghost:1.0").await.unwrap_err();
    assert!(matches!(err, BerthError::PullAborted { ref image, .. } if image == "ghost:1.0"));
    assert_eq!(engine.count("create_image"), 0);

    let last = pulls.snapshot().history.pop().unwrap();
    assert_eq!(last.status, PullStatus::Aborted);
    assert_eq!(last.remote_exists, Some(false));

    // the queue keeps going after a failure
    pulls.pull("redis:7").await.unwrap();
}

#[tokio::test]
async fn test_stream_error_aborts() {
    let engine = Arc::new(FakeEngine::new());
    engine.script_pull("private/app:1.0", [PullScript::Fail("pull access denied".to_string())]);
    let pulls = start_pulls(engine.clone(), 10);

    match pulls.pull("private/app:1.0").await {
        Err(BerthError::PullAborted { reason, .. }) => assert_eq!(reason, "pull access denied"),
        other => panic!("unexpected outcome: {:?}", other.map(|t| t.status)),
    }
}

#[tokio::test]
async fn test_stop_aborts_active_pull() {
    let engine = Arc::new(FakeEngine::new());
    engine.script_pull("redis:7", [PullScript::Hang]);
    let pulls = start_pulls(engine.clone(), 10);
    let mut snapshot = pulls.watch();

    let ticket = pulls.enqueue("redis:7").await.unwrap();
    let next = pulls.enqueue("nginx:1.25").await.unwrap();
    wait_for_download(&mut snapshot).await;

    pulls.stop().await.unwrap();
    let err = timeout(WAIT, ticket.wait()).await.unwrap().unwrap_err();
    assert!(matches!(err, BerthError::PullAborted { ref reason, .. } if reason == "stopped"));

    // the queued task starts once the stopped one is gone
    let task = timeout(WAIT, next.wait()).await.unwrap().unwrap();
    assert_eq!(task.image_tag, "nginx:1.25");
}

#[tokio::test]
async fn test_refresh_restarts_download() {
    let engine = Arc::new(FakeEngine::new());
    engine.script_pull("redis:7", [PullScript::Hang, PullScript::Complete]);
    let pulls = start_pulls(engine.clone(), 10);
    let mut snapshot = pulls.watch();

    let ticket = pulls.enqueue("redis:7").await.unwrap();
    wait_for_download(&mut snapshot).await;
    assert_eq!(engine.count("create_image redis:7"), 1);

    pulls.refresh().await.unwrap();
    let task = timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert_eq!(task.status, PullStatus::Completed);
    assert_eq!(engine.count("create_image redis:7"), 2);
    assert_eq!(task.layers, vec!["a1", "b2"]);
}

#[tokio::test]
async fn test_control_without_active_pull_is_ignored() {
    let engine = Arc::new(FakeEngine::new());
    let pulls = start_pulls(engine.clone(), 10);

    pulls.stop().await.unwrap();
    pulls.refresh().await.unwrap();
    let task = pulls.pull("redis:7").await.unwrap();
    assert_eq!(task.status, PullStatus::Completed);
}

#[tokio::test]
async fn test_progress_reports_every_stage() {
    let engine = Arc::new(FakeEngine::new());
    let pulls = start_pulls(engine.clone(), 10);
    let mut progress = pulls.subscribe_progress();

    let task = pulls.pull("redis:7").await.unwrap();
    let mut seen = Vec::new();
    while let Ok(update) = progress.try_recv() {
        assert_eq!(update.task_id, task.task_id);
        if seen.last() != Some(&update.status) {
            seen.push(update.status);
        }
    }
    assert_eq!(
        seen,
        vec![
            PullStatus::GenerateToken,
            PullStatus::CheckLocal,
            PullStatus::CheckRemote,
            PullStatus::PullImage,
            PullStatus::Completed,
        ]
    );
}
