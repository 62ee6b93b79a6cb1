//! PostgreSQL repository tests.
//!
//! Require a migrated database at `DATABASE_URL`; run with
//! `cargo test -p quire-db -- --ignored`.

use uuid::Uuid;

use quire_db::test_fixtures::{
    connect_test_database, note_request, task_block_request, task_request,
};
use quire_db::{
    AccessControl, BlockRepository, EntityType, NoteRepository, OutboxRepository, Role,
    SyncOutcome, TaskRepository, TokenValidator, UpdateTaskRequest,
};

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_pg_mutation_and_event_commit_together() {
    dotenvy::dotenv().ok();
    let db = connect_test_database().await.unwrap();
    let author = Uuid::new_v4();

    let note = db
        .notes
        .create("user:pg", note_request(author, "Outbox"))
        .await
        .unwrap();

    let events = db.outbox.list_for_entity(note.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "note.created");
    assert_eq!(events[0].actor_id, "user:pg");
    assert!(!events[0].dispatched);

    db.notes.delete("user:pg", note.id).await.unwrap();
    assert!(db.notes.get(note.id).await.unwrap().is_none());
    assert_eq!(db.outbox.list_for_entity(note.id).await.unwrap().len(), 2);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_pg_update_missing_entity_records_nothing() {
    dotenvy::dotenv().ok();
    let db = connect_test_database().await.unwrap();
    let missing = Uuid::new_v4();

    let result = db
        .tasks
        .update("user:pg", missing, UpdateTaskRequest::default())
        .await;
    assert!(matches!(result, Err(quire_db::Error::NotFound(_))));
    assert!(db.outbox.list_for_entity(missing).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_pg_apply_sync_is_idempotent() {
    dotenvy::dotenv().ok();
    let db = connect_test_database().await.unwrap();
    let author = Uuid::new_v4();
    let note = db
        .notes
        .create("u", note_request(author, "Sync"))
        .await
        .unwrap();
    let task = db
        .tasks
        .create("u", task_request(author, Some(note.id), "Write tests"))
        .await
        .unwrap();
    let block = db
        .blocks
        .create("u", task_block_request(note.id, task.id, "Write tests"))
        .await
        .unwrap();

    let mut fields = task.sync_fields();
    fields.completed = true;

    let first = db
        .blocks
        .apply_sync("system:sync", block.id, task.id, &fields)
        .await
        .unwrap();
    assert!(first.is_applied());
    let second = db
        .blocks
        .apply_sync("system:sync", block.id, task.id, &fields)
        .await
        .unwrap();
    assert_eq!(second, SyncOutcome::Unchanged);

    let found = db.blocks.find_by_task(task.id).await.unwrap().unwrap();
    assert_eq!(found.id, block.id);
    assert!(found.sync_fields().completed);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_pg_find_by_task_breaks_created_at_ties_by_id() {
    dotenvy::dotenv().ok();
    let db = connect_test_database().await.unwrap();
    let author = Uuid::new_v4();
    let note = db
        .notes
        .create("u", note_request(author, "Ties"))
        .await
        .unwrap();
    let task = db
        .tasks
        .create("u", task_request(author, Some(note.id), "Pick one"))
        .await
        .unwrap();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let block = db
            .blocks
            .create("u", task_block_request(note.id, task.id, "Pick one"))
            .await
            .unwrap();
        ids.push(block.id);
    }
    sqlx::query("UPDATE block SET created_at = '2026-01-01T00:00:00Z' WHERE task_id = $1")
        .bind(task.id)
        .execute(db.pool())
        .await
        .unwrap();

    let found = db.blocks.find_by_task(task.id).await.unwrap().unwrap();
    assert_eq!(found.id, ids.into_iter().min().unwrap());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_pg_access_inherits_from_note() {
    dotenvy::dotenv().ok();
    let db = connect_test_database().await.unwrap();
    let (author, reader, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let note = db
        .notes
        .create("u", note_request(author, "Shared"))
        .await
        .unwrap();
    let task = db
        .tasks
        .create("u", task_request(author, Some(note.id), "Review"))
        .await
        .unwrap();

    db.access
        .grant(reader, EntityType::Note, note.id, Role::Viewer)
        .await
        .unwrap();

    let acl = &db.access;
    assert!(acl
        .has_access(author, task.id, EntityType::Task, Role::Owner)
        .await
        .unwrap());
    assert!(acl
        .has_access(reader, task.id, EntityType::Task, Role::Viewer)
        .await
        .unwrap());
    assert!(!acl
        .has_access(reader, task.id, EntityType::Task, Role::Editor)
        .await
        .unwrap());
    assert!(!acl
        .has_access(stranger, note.id, EntityType::Note, Role::Viewer)
        .await
        .unwrap());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_pg_token_validation() {
    dotenvy::dotenv().ok();
    let db = connect_test_database().await.unwrap();
    let user = Uuid::new_v4();
    let token = format!("tok-{}", Uuid::new_v4());

    db.tokens.issue(&token, user, None).await.unwrap();
    assert_eq!(db.tokens.validate(&token).await.unwrap(), Some(user));
    assert_eq!(db.tokens.validate("bogus").await.unwrap(), None);
    assert_eq!(db.tokens.validate("").await.unwrap(), None);
}
