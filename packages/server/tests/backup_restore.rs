//! Backup, rollback and point-in-time revert integration tests.

mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use keelson_core::kernel::backup::restore::{
    find_restore_point, import_csv_backup, list_restore_points, revert_table, rollback_to_point,
    scan_orphans,
};
use keelson_core::kernel::backup::BackupStrategy;
use keelson_core::kernel::migrate::AutoMigrator;
use keelson_core::kernel::storage::{Database, EntityStore};

use common::{notes_registry, test_config};

struct Env {
    _dir: tempfile::TempDir,
    config: keelson_core::Config,
    db: Arc<Database>,
    registry: Arc<keelson_core::kernel::storage::EntityRegistry>,
    store: EntityStore,
}

async fn setup() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::connect(&config).await.unwrap();
    let registry = Arc::new(notes_registry());
    AutoMigrator::new(&db, &registry, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();
    let store = EntityStore::new(db.clone(), registry.clone());
    Env {
        _dir: dir,
        config,
        db,
        registry,
        store,
    }
}

fn strategy<'a>(env: &'a Env) -> BackupStrategy<'a> {
    BackupStrategy::new(
        &env.db,
        &env.registry,
        env.config.backup_dir(),
        &env.config.database_url,
    )
}

#[tokio::test]
async fn csv_backup_contains_every_table_and_metadata() {
    let env = setup().await;
    env.store
        .save("notes", json!({"id": "n1", "text": "kept"}), None, None)
        .await
        .unwrap();
    env.store
        .save("notes", json!({"id": "n2", "text": "gone"}), None, None)
        .await
        .unwrap();
    env.store.delete("notes", "n2", None, false).await.unwrap();

    let report = strategy(&env).backup(true, false).await.unwrap();
    let csv_dir = report.csv_dir.clone().unwrap();
    assert!(csv_dir.join("notes.csv").exists());
    assert!(csv_dir.join("notes_history.csv").exists());

    // Soft-deleted rows are included in the export.
    let contents = std::fs::read_to_string(csv_dir.join("notes.csv")).unwrap();
    assert!(contents.contains("n1"));
    assert!(contents.contains("n2"));

    let metadata: Vec<_> = std::fs::read_dir(&csv_dir)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("metadata_"))
        .collect();
    assert_eq!(metadata.len(), 1);

    // The directory name carries the schema fingerprint.
    let name = csv_dir.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.contains(&env.registry.schema_hash()[..8]));
}

#[tokio::test]
async fn full_rollback_restores_backed_up_state() {
    let env = setup().await;
    env.store
        .save("notes", json!({"id": "n1", "text": "original"}), None, None)
        .await
        .unwrap();

    strategy(&env).backup(true, false).await.unwrap();
    let first_csv = {
        let points =
            list_restore_points(&env.config.backup_dir(), &env.config.migrations_audit_dir())
                .unwrap();
        std::fs::read_to_string(points[0].csv_dir.join("notes.csv")).unwrap()
    };

    // Mutate after the backup.
    env.store
        .save("notes", json!({"id": "n1", "text": "changed"}), None, None)
        .await
        .unwrap();
    env.store
        .save("notes", json!({"id": "n2", "text": "new row"}), None, None)
        .await
        .unwrap();

    let points =
        list_restore_points(&env.config.backup_dir(), &env.config.migrations_audit_dir()).unwrap();
    assert_eq!(points.len(), 1);
    assert!(points[0].migration_file.is_some());

    let report = rollback_to_point(&env.db, &points[0], &env.config.migrations_audit_dir())
        .await
        .unwrap();
    assert!(!report.used_native);
    assert!(report.migrations_replayed >= 1);

    let row = env.store.get("notes", "n1", false).await.unwrap().unwrap();
    assert_eq!(row["text"], json!("original"));
    assert!(env.store.get("notes", "n2", true).await.unwrap().is_none());

    // backup -> rollback -> backup produces an identical table snapshot.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    strategy(&env).backup(true, false).await.unwrap();
    let points =
        list_restore_points(&env.config.backup_dir(), &env.config.migrations_audit_dir()).unwrap();
    assert_eq!(points.len(), 2);
    let second_csv = std::fs::read_to_string(points[0].csv_dir.join("notes.csv")).unwrap();
    assert_eq!(first_csv, second_csv);
}

#[tokio::test]
async fn additive_import_retains_rows_newer_than_backup() {
    let env = setup().await;
    env.store
        .save("notes", json!({"id": "n1", "text": "from backup"}), None, None)
        .await
        .unwrap();
    strategy(&env).backup(true, false).await.unwrap();

    env.store
        .save("notes", json!({"id": "n2", "text": "after backup"}), None, None)
        .await
        .unwrap();
    env.store.delete("notes", "n1", None, true).await.unwrap();

    let points =
        list_restore_points(&env.config.backup_dir(), &env.config.migrations_audit_dir()).unwrap();
    import_csv_backup(&env.db, &points[0].csv_dir, false)
        .await
        .unwrap();

    // Backed-up row is back, newer row retained.
    assert!(env.store.get("notes", "n1", false).await.unwrap().is_some());
    assert!(env.store.get("notes", "n2", false).await.unwrap().is_some());
}

#[tokio::test]
async fn point_in_time_revert_restores_and_audits() {
    let env = setup().await;

    // T0: the note says "a".
    env.store
        .save("notes", json!({"id": "n1", "text": "a"}), None, None)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let t0 = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // T1: updated to "b". T2: deleted.
    env.store
        .save("notes", json!({"id": "n1", "text": "b"}), None, None)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    env.store.delete("notes", "n1", None, false).await.unwrap();
    assert!(env.store.get("notes", "n1", false).await.unwrap().is_none());

    let history_before = env.store.history("notes", "n1").await.unwrap();
    assert_eq!(history_before.len(), 3);

    let report = revert_table(&env.store, "notes", t0, Some("admin-1"))
        .await
        .unwrap();
    assert_eq!(report.restored, 1);

    // The row is back at its T0 state.
    let row = env.store.get("notes", "n1", false).await.unwrap().unwrap();
    assert_eq!(row["text"], json!("a"));
    assert!(row["deleted_at"].is_null());

    // Original history rows untouched, one new version appended as audit.
    let history_after = env.store.history("notes", "n1").await.unwrap();
    assert_eq!(history_after.len(), 4);
    for (before, after) in history_before.iter().zip(history_after.iter()) {
        assert_eq!(before["version"], after["version"]);
        assert_eq!(before["text"], after["text"]);
        assert_eq!(before["history_timestamp"], after["history_timestamp"]);
    }
    assert_eq!(history_after[3]["text"], json!("a"));
}

#[tokio::test]
async fn revert_soft_deletes_rows_that_did_not_exist_yet() {
    let env = setup().await;

    env.store
        .save("notes", json!({"id": "old", "text": "existed"}), None, None)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let t0 = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    env.store
        .save("notes", json!({"id": "young", "text": "late arrival"}), None, None)
        .await
        .unwrap();

    let report = revert_table(&env.store, "notes", t0, None).await.unwrap();
    assert_eq!(report.soft_deleted, 1);

    assert!(env.store.get("notes", "old", false).await.unwrap().is_some());
    assert!(env.store.get("notes", "young", false).await.unwrap().is_none());
    // Soft-deleted, not destroyed.
    assert!(env.store.get("notes", "young", true).await.unwrap().is_some());
}

#[tokio::test]
async fn revert_refuses_unregistered_tables() {
    let env = setup().await;
    let err = revert_table(&env.store, "nonexistent", Utc::now(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn restore_point_selection_is_closest_not_after() {
    let env = setup().await;
    strategy(&env).backup(true, false).await.unwrap();

    let future = Utc::now() + chrono::Duration::hours(1);
    let point = find_restore_point(
        future,
        &env.config.backup_dir(),
        &env.config.migrations_audit_dir(),
    )
    .unwrap();
    assert!(point.is_some());

    let past = Utc::now() - chrono::Duration::hours(1);
    let point = find_restore_point(
        past,
        &env.config.backup_dir(),
        &env.config.migrations_audit_dir(),
    )
    .unwrap();
    assert!(point.is_none());
}

#[tokio::test]
async fn orphan_scan_reports_unregistered_tables_and_columns() {
    let env = setup().await;
    env.db
        .execute("CREATE TABLE [stray] ([id] TEXT PRIMARY KEY)", &[])
        .await
        .unwrap();
    env.db
        .execute("ALTER TABLE [notes] ADD COLUMN [leftover] TEXT", &[])
        .await
        .unwrap();

    let report = scan_orphans(&env.db, &env.registry).await.unwrap();
    assert!(report.tables.contains(&"stray".to_string()));
    assert_eq!(
        report.columns.get("notes"),
        Some(&vec!["leftover".to_string()])
    );
}

#[tokio::test]
async fn native_sqlite_backup_is_produced() {
    let env = setup().await;
    env.store
        .save("notes", json!({"text": "snapshot me"}), None, None)
        .await
        .unwrap();
    let report = strategy(&env).backup(true, true).await.unwrap();
    let native = report.native_file.unwrap();
    assert!(native.exists());
    assert!(native.metadata().unwrap().len() > 0);
}

#[tokio::test]
async fn native_rollback_takes_the_fast_path() {
    let env = setup().await;
    env.store
        .save("notes", json!({"id": "n1", "text": "original"}), None, None)
        .await
        .unwrap();
    strategy(&env).backup(true, true).await.unwrap();

    env.store
        .save("notes", json!({"id": "n1", "text": "changed"}), None, None)
        .await
        .unwrap();

    let points =
        list_restore_points(&env.config.backup_dir(), &env.config.migrations_audit_dir()).unwrap();
    assert!(points[0].native_file.is_some());

    let report = rollback_to_point(&env.db, &points[0], &env.config.migrations_audit_dir())
        .await
        .unwrap();
    assert!(report.used_native);

    let row = env.store.get("notes", "n1", false).await.unwrap().unwrap();
    assert_eq!(row["text"], json!("original"));
}
