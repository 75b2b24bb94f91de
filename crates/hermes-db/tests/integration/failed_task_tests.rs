use chrono::{TimeDelta, Utc};
use hermes_core::AppError;
use hermes_core::failed_queue::{FailedTask, FailedTaskQueue, QueueConfig};
use hermes_core::traits::FailedTaskStore;
use hermes_db::FailedTaskRepository;

use crate::integration::common::setup_test_db;

fn task(target: &str) -> FailedTask {
    FailedTask::new("listings", target, "HTTP 503", 3)
        .with_metadata("page", serde_json::json!(7))
}

#[tokio::test]
async fn upsert_and_get_task() {
    let (pool, _container) = setup_test_db().await;
    let repo = FailedTaskRepository::new(pool);

    let mut original = task("https://example.com/p/7");
    repo.upsert_task(&original).await.unwrap();

    original.retry_count = 2;
    original.error_message = "HTTP 502".into();
    repo.upsert_task(&original).await.unwrap();

    let stored = repo.get_task(&original.task_id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.error_message, "HTTP 502");
    assert_eq!(stored.metadata["page"], 7);
    assert_eq!(repo.list_pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn out_of_range_retry_count_is_rejected() {
    let (pool, _container) = setup_test_db().await;
    let repo = FailedTaskRepository::new(pool);

    let mut huge = task("https://example.com/p/8");
    huge.retry_count = u32::MAX;

    let err = repo.upsert_task(&huge).await.unwrap_err();
    assert!(matches!(err, AppError::DatabaseError(_)));
    assert!(repo.get_task(&huge.task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn pending_tasks_ordered_by_due_time() {
    let (pool, _container) = setup_test_db().await;
    let repo = FailedTaskRepository::new(pool);
    let now = Utc::now();

    let later = task("b").with_next_retry_time(now + TimeDelta::minutes(10));
    let sooner = task("a").with_next_retry_time(now + TimeDelta::minutes(1));
    repo.upsert_task(&later).await.unwrap();
    repo.upsert_task(&sooner).await.unwrap();

    let pending = repo.list_pending().await.unwrap();
    let ids: Vec<_> = pending.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, vec![sooner.task_id.as_str(), later.task_id.as_str()]);
}

#[tokio::test]
async fn remove_reports_whether_row_existed() {
    let (pool, _container) = setup_test_db().await;
    let repo = FailedTaskRepository::new(pool);
    let t = task("https://example.com/p/1");
    repo.upsert_task(&t).await.unwrap();

    assert!(repo.remove_task(&t.task_id).await.unwrap());
    assert!(!repo.remove_task(&t.task_id).await.unwrap());
}

#[tokio::test]
async fn dead_letter_moves_row() {
    let (pool, _container) = setup_test_db().await;
    let repo = FailedTaskRepository::new(pool);

    let mut t = task("https://example.com/p/9");
    t.retry_count = 3;
    repo.upsert_task(&t).await.unwrap();
    repo.dead_letter(&t).await.unwrap();

    assert!(repo.get_task(&t.task_id).await.unwrap().is_none());
    let dead = repo.list_dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, t.task_id);
    assert_eq!(dead[0].retry_count, 3);
}

#[tokio::test]
async fn queue_dead_letters_terminal_tasks() {
    let (pool, _container) = setup_test_db().await;
    let repo = FailedTaskRepository::new(pool);
    let queue = FailedTaskQueue::new(repo.clone(), QueueConfig::default());
    queue.register_handler("listings", |_task: FailedTask| async {
        Err::<(), _>(AppError::HandlerError("still down".into()))
    });

    let mut terminal = task("https://example.com/p/3");
    terminal.retry_count = 3;
    repo.upsert_task(&terminal).await.unwrap();

    let summary = queue.poll_once().await.unwrap();
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.dispatched, 0);
    assert!(queue.pending().await.unwrap().is_empty());
    assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
}
