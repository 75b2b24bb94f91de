use hermes_core::runs::{RunStatus, RunTracker};
use hermes_core::traits::RunStore;
use hermes_db::RunRepository;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn run_lifecycle_is_persisted() {
    let (pool, _container) = setup_test_db().await;
    let repo = RunRepository::new(pool);
    let tracker = RunTracker::new(repo.clone());

    let mut run = tracker.start("listings").await.unwrap();
    run.record_page(20);
    run.record_failure();
    tracker.update(&run).await.unwrap();
    let finished = tracker.finish(run, RunStatus::Success, None).await.unwrap();

    let stored = repo.get_run(finished.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!((stored.pages, stored.items, stored.failures), (1, 20, 1));
    assert!(stored.ended_at.is_some());
}

#[tokio::test]
async fn list_filters_by_status() {
    let (pool, _container) = setup_test_db().await;
    let tracker = RunTracker::new(RunRepository::new(pool));

    let done = tracker.start("listings").await.unwrap();
    tracker.finish(done, RunStatus::Failed, Some("boom".into())).await.unwrap();
    tracker.start("details").await.unwrap();

    assert_eq!(tracker.list(None).await.unwrap().len(), 2);
    let running = tracker.list(Some(RunStatus::Running)).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].task_type, "details");
    let failed = tracker.list(Some(RunStatus::Failed)).await.unwrap();
    assert_eq!(failed[0].error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn close_crashed_marks_running_as_failed() {
    let (pool, _container) = setup_test_db().await;
    let tracker = RunTracker::new(RunRepository::new(pool));
    tracker.start("listings").await.unwrap();

    let closed = tracker.close_crashed(&["listings"]).await.unwrap();

    assert_eq!(closed.len(), 1);
    assert!(tracker.list(Some(RunStatus::Running)).await.unwrap().is_empty());
}
