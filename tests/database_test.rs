//! Store bootstrap tests: schema stamping, durability, reopen.

mod common;

use common::payload;
use gantry::adapters::sqlite::{store, SqliteTaskRepository};
use gantry::domain::models::{DatabaseConfig, Task, TaskStatus};
use gantry::domain::ports::TaskRepository;

fn file_config(path: &std::path::Path) -> DatabaseConfig {
    DatabaseConfig {
        path: path.display().to_string(),
        max_connections: 2,
    }
}

#[tokio::test]
async fn test_schema_applied_once() {
    let dir = tempfile::tempdir().unwrap();
    let pool = store::open(&file_config(&dir.path().join("gantry.db")))
        .await
        .unwrap();

    assert_eq!(store::schema_version(&pool).await.unwrap(), 0);
    assert!(store::ensure_schema(&pool).await.unwrap());
    assert_eq!(store::schema_version(&pool).await.unwrap(), store::SCHEMA_VERSION);

    // Re-running stamps nothing new.
    assert!(!store::ensure_schema(&pool).await.unwrap());
    assert_eq!(store::schema_version(&pool).await.unwrap(), store::SCHEMA_VERSION);
}

#[tokio::test]
async fn test_tasks_survive_pool_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(&dir.path().join("gantry.db"));

    let task = Task::new("e1", payload(r#"{"persisted": true}"#));
    let task_id = task.id;
    {
        let pool = store::open(&config).await.unwrap();
        store::ensure_schema(&pool).await.unwrap();
        let repo = SqliteTaskRepository::new(pool.clone());
        repo.create(&task).await.unwrap();
        pool.close().await;
    }

    // A fresh pool over the same file sees the row and the stamp.
    let pool = store::open(&config).await.unwrap();
    assert!(!store::ensure_schema(&pool).await.unwrap());
    let repo = SqliteTaskRepository::new(pool.clone());
    let stored = repo.get(task_id).await.unwrap().expect("task lost");
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.input.as_str(), r#"{"persisted": true}"#);
    assert_eq!(
        stored.created_at.timestamp_millis(),
        task.created_at.timestamp_millis()
    );
}

#[tokio::test]
async fn test_missing_parent_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(&dir.path().join("nested/deeper/gantry.db"));
    let pool = store::open(&config).await.unwrap();
    assert!(store::ensure_schema(&pool).await.unwrap());
}
