//! Entity store integration tests on the embedded backend.

mod common;

use std::sync::Arc;

use serde_json::json;

use keelson_core::kernel::migrate::AutoMigrator;
use keelson_core::kernel::storage::{Database, EntityStore};

use common::{notes_registry, test_config};

async fn setup() -> (tempfile::TempDir, EntityStore) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::connect(&config).await.unwrap();
    let registry = Arc::new(notes_registry());

    AutoMigrator::new(&db, &registry, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();

    (dir, EntityStore::new(db, registry))
}

#[tokio::test]
async fn save_then_get_roundtrip() {
    let (_dir, store) = setup().await;

    let saved = store
        .save(
            "notes",
            json!({"text": "hello", "author": "ada", "stars": 4}),
            Some("user-1"),
            None,
        )
        .await
        .unwrap();

    let id = saved["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());
    assert!(saved["created_at"].is_string());
    assert_eq!(saved["created_by"], json!("user-1"));

    let fetched = store.get("notes", &id, false).await.unwrap().unwrap();
    assert_eq!(fetched["text"], json!("hello"));
    assert_eq!(fetched["author"], json!("ada"));
    // Declared integer round-trips as a number.
    assert_eq!(fetched["stars"], json!(4));
}

#[tokio::test]
async fn every_save_appends_exactly_one_history_row() {
    let (_dir, store) = setup().await;

    let saved = store
        .save("notes", json!({"text": "v1"}), None, None)
        .await
        .unwrap();
    let id = saved["id"].as_str().unwrap().to_string();

    for text in ["v2", "v3"] {
        store
            .save("notes", json!({"id": id, "text": text}), None, None)
            .await
            .unwrap();
    }

    let history = store.history("notes", &id).await.unwrap();
    assert_eq!(history.len(), 3);
    for (index, row) in history.iter().enumerate() {
        assert_eq!(row["version"], json!(index as i64 + 1));
    }
    // The newest history row mirrors the live row.
    assert_eq!(history[2]["text"], json!("v3"));
    let live = store.get("notes", &id, false).await.unwrap().unwrap();
    assert_eq!(history[2]["text"], live["text"]);

    let version = store.get_version("notes", &id, 2).await.unwrap().unwrap();
    assert_eq!(version["text"], json!("v2"));
}

#[tokio::test]
async fn get_many_chunks_large_id_lists() {
    let (_dir, store) = setup().await;

    let entities: Vec<_> = (0..150)
        .map(|i| json!({"id": format!("note-{:04}", i), "text": format!("n{}", i)}))
        .collect();
    store.save_many("notes", entities, None, None).await.unwrap();

    // Query with far more ids than one IN clause allows; absent ids are
    // simply not returned.
    let ids: Vec<String> = (0..10_000).map(|i| format!("note-{:04}", i)).collect();
    let found = store.get_many("notes", &ids, false).await.unwrap();
    assert_eq!(found.len(), 150);
}

#[tokio::test]
async fn soft_delete_hides_then_restore_revives() {
    let (_dir, store) = setup().await;

    let saved = store
        .save("notes", json!({"text": "ephemeral"}), None, None)
        .await
        .unwrap();
    let id = saved["id"].as_str().unwrap().to_string();

    assert!(store.delete("notes", &id, Some("user-2"), false).await.unwrap());
    assert!(store.get("notes", &id, false).await.unwrap().is_none());

    let hidden = store.get("notes", &id, true).await.unwrap().unwrap();
    assert!(hidden["deleted_at"].is_string());

    assert!(store.restore("notes", &id, Some("user-2")).await.unwrap());
    let revived = store.get("notes", &id, false).await.unwrap().unwrap();
    assert!(revived["deleted_at"].is_null());

    // save + delete + restore each left a history row
    let history = store.history("notes", &id).await.unwrap();
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn find_supports_filters_ordering_and_paging() {
    let (_dir, store) = setup().await;

    for (text, author) in [("a", "ada"), ("b", "ada"), ("c", "grace")] {
        store
            .save("notes", json!({"text": text, "author": author}), None, None)
            .await
            .unwrap();
    }

    let adas = store
        .find(
            "notes",
            Some("[author] = ?"),
            &[Some("ada".into())],
            Some("[text] DESC"),
            None,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(adas.len(), 2);
    assert_eq!(adas[0]["text"], json!("b"));

    let page = store
        .find("notes", None, &[], Some("[text] ASC"), Some(2), Some(1), false)
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["text"], json!("b"));

    assert_eq!(store.count("notes", None, &[], false).await.unwrap(), 3);
    assert_eq!(
        store
            .count("notes", Some("[author] = ?"), &[Some("grace".into())], false)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn unknown_fields_are_rejected() {
    let (_dir, store) = setup().await;
    let err = store
        .save("notes", json!({"text": "x", "no_such_field": 1}), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn batch_save_versions_every_entity() {
    let (_dir, store) = setup().await;

    let first = store
        .save_many(
            "notes",
            vec![json!({"text": "one"}), json!({"text": "two"})],
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(first.len(), 2);

    // Save the same entities again in a batch; versions advance per id.
    let again: Vec<_> = first
        .iter()
        .map(|e| json!({"id": e["id"], "text": format!("{}!", e["text"].as_str().unwrap())}))
        .collect();
    store.save_many("notes", again, None, None).await.unwrap();

    for entity in &first {
        let id = entity["id"].as_str().unwrap();
        let history = store.history("notes", id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1]["version"], json!(2));
    }
}
