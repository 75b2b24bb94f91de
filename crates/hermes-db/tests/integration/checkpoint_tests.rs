use hermes_core::checkpoint::{Checkpointer, ResumePoint, ResumeUpdate};
use hermes_core::traits::CheckpointStore;
use hermes_db::CheckpointRepository;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn load_missing_checkpoint_returns_none() {
    let (pool, _container) = setup_test_db().await;
    let repo = CheckpointRepository::new(pool);

    assert!(repo.load_checkpoint("listings").await.unwrap().is_none());
    assert!(repo.list_checkpoints().await.unwrap().is_empty());
}

#[tokio::test]
async fn save_replaces_existing_row() {
    let (pool, _container) = setup_test_db().await;
    let repo = CheckpointRepository::new(pool);

    let mut point = ResumePoint::new("listings");
    point.current_page = 5;
    point.total_processed = 50;
    point.last_cursor = Some("c-5".into());
    point
        .metadata
        .insert("region".into(), serde_json::json!("eu"));
    repo.save_checkpoint(&point).await.unwrap();

    point.current_page = 6;
    point.last_cursor = None;
    repo.save_checkpoint(&point).await.unwrap();

    let loaded = repo.load_checkpoint("listings").await.unwrap().unwrap();
    assert_eq!(loaded.current_page, 6);
    assert_eq!(loaded.total_processed, 50);
    assert_eq!(loaded.last_cursor, None);
    assert_eq!(loaded.metadata["region"], "eu");
    assert_eq!(repo.list_checkpoints().await.unwrap().len(), 1);
}

#[tokio::test]
async fn checkpointer_merges_updates() {
    let (pool, _container) = setup_test_db().await;
    let checkpointer = Checkpointer::new(CheckpointRepository::new(pool));

    checkpointer
        .create_or_update("details", ResumeUpdate::page(3).with_last_item("item-30"))
        .await
        .unwrap();
    let point = checkpointer
        .create_or_update("details", ResumeUpdate::default().with_total_processed(30))
        .await
        .unwrap();

    assert_eq!(point.current_page, 3);
    assert_eq!(point.last_item.as_deref(), Some("item-30"));

    let stored = checkpointer.get("details").await.unwrap().unwrap();
    assert_eq!(stored.total_processed, 30);
    assert_eq!(stored.next_page(), 4);
}
