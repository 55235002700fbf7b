//! Migration engine integration tests: fingerprint bookkeeping, additive
//! diffs, rename preservation and backfills, audit replay.

mod common;

use std::sync::Arc;

use serde_json::json;

use keelson_core::kernel::migrate::{replay::replay_migration, AutoMigrator};
use keelson_core::kernel::storage::{
    Database, EntityDescriptor, EntityRegistry, EntityStore, FieldDef,
};

use common::{notes_registry, test_config};

#[tokio::test]
async fn fresh_migration_creates_tables_and_records_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::connect(&config).await.unwrap();
    let registry = Arc::new(notes_registry());
    let migrator = AutoMigrator::new(&db, &registry, config.migrations_audit_dir(), false, false);

    let report = migrator.migrate(false).await.unwrap();
    assert!(report.applied);

    let tables = db.list_tables().await.unwrap();
    assert!(tables.contains(&"notes".to_string()));
    assert!(tables.contains(&"notes_history".to_string()));
    assert!(tables.contains(&"notes_meta".to_string()));
    assert!(tables.contains(&"_schema_migrations".to_string()));

    // Applying the same schema again records nothing new.
    let report = migrator.migrate(false).await.unwrap();
    assert!(!report.applied);
    let migrations = AutoMigrator::list_migrations(&db).await.unwrap();
    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].schema_hash, registry.schema_hash());

    // The audit file pair exists.
    let audit_files: Vec<_> = std::fs::read_dir(config.migrations_audit_dir())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(audit_files.iter().any(|f| f.ends_with(".sql")));
    assert!(audit_files.iter().any(|f| f.ends_with(".json")));
}

#[tokio::test]
async fn adding_a_field_alters_main_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::connect(&config).await.unwrap();

    let registry = Arc::new(notes_registry());
    AutoMigrator::new(&db, &registry, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();

    // Same entity with one extra field.
    let mut extended = EntityRegistry::new();
    extended.register(
        EntityDescriptor::new("notes")
            .field(FieldDef::text("text").not_null())
            .field(FieldDef::text("author").indexed())
            .field(FieldDef::integer("stars").default_value("0"))
            .field(FieldDef::boolean("pinned").default_value("0")),
    );
    let extended = Arc::new(extended);
    let report = AutoMigrator::new(&db, &extended, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();
    assert!(report.applied);

    for table in ["notes", "notes_history"] {
        let columns = db.column_names(table).await.unwrap();
        assert!(columns.contains("pinned"), "{} missing pinned", table);
    }
    assert_eq!(AutoMigrator::list_migrations(&db).await.unwrap().len(), 2);
}

fn project_registry_v1() -> EntityRegistry {
    let mut registry = EntityRegistry::new();
    registry.register(
        EntityDescriptor::new("projects")
            .field(FieldDef::text("name").not_null())
            .field(FieldDef::text("docker_user")),
    );
    registry
}

fn project_registry_v2() -> EntityRegistry {
    let mut registry = EntityRegistry::new();
    registry.register(
        EntityDescriptor::new("projects")
            .field(FieldDef::text("name").not_null())
            .field(FieldDef::text("docker_hub_user").renamed_from("docker_user")),
    );
    registry
}

#[tokio::test]
async fn column_rename_copies_data_and_backfills_stragglers() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::connect(&config).await.unwrap();

    // v1 schema with data in the old column.
    let v1 = Arc::new(project_registry_v1());
    AutoMigrator::new(&db, &v1, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();
    let store_v1 = EntityStore::new(db.clone(), v1.clone());
    let saved = store_v1
        .save("projects", json!({"name": "api", "docker_user": "ada"}), None, None)
        .await
        .unwrap();
    let id = saved["id"].as_str().unwrap().to_string();

    // v2 renames the column; migration adds it and copies values.
    let v2 = Arc::new(project_registry_v2());
    let migrator = AutoMigrator::new(&db, &v2, config.migrations_audit_dir(), false, false);
    let report = migrator.migrate(false).await.unwrap();
    assert!(report.applied);
    assert!(report
        .changes
        .iter()
        .any(|c| c.contains("rename column projects.docker_user -> docker_hub_user")));

    let store_v2 = EntityStore::new(db.clone(), v2.clone());
    let row = store_v2.get("projects", &id, false).await.unwrap().unwrap();
    assert_eq!(row["docker_hub_user"], json!("ada"));

    // Old column is kept (renames are never destructive).
    assert!(db.column_names("projects").await.unwrap().contains("docker_user"));

    // Restart with no change: no new migration row, backfill is a no-op.
    let migrations_before = AutoMigrator::list_migrations(&db).await.unwrap().len();
    let report = migrator.migrate(false).await.unwrap();
    assert!(!report.applied);
    assert_eq!(report.backfilled_rows, 0);
    assert_eq!(
        AutoMigrator::list_migrations(&db).await.unwrap().len(),
        migrations_before
    );

    // Blue-green straggler: an old instance writes only the old column.
    db.execute(
        "INSERT INTO [projects] ([id], [name], [docker_user]) VALUES (?, ?, ?)",
        &[
            Some("p-straggler".into()),
            Some("worker".into()),
            Some("grace".into()),
        ],
    )
    .await
    .unwrap();
    let backfilled = migrator.run_rename_backfills().await.unwrap();
    assert!(backfilled >= 1);
    let row = store_v2
        .get("projects", "p-straggler", false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["docker_hub_user"], json!("grace"));
}

#[tokio::test]
async fn table_rename_copies_rows_and_keeps_old_table() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::connect(&config).await.unwrap();

    let mut v1 = EntityRegistry::new();
    v1.register(EntityDescriptor::new("legacy_projects").field(FieldDef::text("name")));
    let v1 = Arc::new(v1);
    AutoMigrator::new(&db, &v1, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();
    let store = EntityStore::new(db.clone(), v1.clone());
    store
        .save("legacy_projects", json!({"name": "old"}), None, None)
        .await
        .unwrap();

    let mut v2 = EntityRegistry::new();
    v2.register(
        EntityDescriptor::new("projects")
            .renamed_from("legacy_projects")
            .field(FieldDef::text("name")),
    );
    let v2 = Arc::new(v2);
    AutoMigrator::new(&db, &v2, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();

    let tables = db.list_tables().await.unwrap();
    assert!(tables.contains(&"projects".to_string()));
    assert!(tables.contains(&"legacy_projects".to_string())); // kept

    let store = EntityStore::new(db.clone(), v2.clone());
    let rows = store.find("projects", None, &[], None, None, None, true).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("old"));
}

#[tokio::test]
async fn audit_replay_reproduces_schema_from_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::connect(&config).await.unwrap();
    let registry = Arc::new(notes_registry());
    AutoMigrator::new(&db, &registry, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();

    // Replay the audit directory into a second, empty database.
    let dir2 = tempfile::tempdir().unwrap();
    let config2 = test_config(dir2.path());
    let db2 = Database::connect(&config2).await.unwrap();

    let mut audit_files: Vec<_> = std::fs::read_dir(config.migrations_audit_dir())
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "sql").unwrap_or(false))
        .collect();
    audit_files.sort();
    for file in &audit_files {
        replay_migration(&db2, file).await.unwrap();
        // Replaying twice must be harmless.
        replay_migration(&db2, file).await.unwrap();
    }

    for table in ["notes", "notes_history", "notes_meta"] {
        assert!(db2.table_exists(table).await.unwrap(), "{} missing", table);
        let original = db.column_names(table).await.unwrap();
        let replayed = db2.column_names(table).await.unwrap();
        assert_eq!(original, replayed, "{} columns differ", table);
    }
}

#[tokio::test]
async fn destructive_operations_require_policy_flags() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::connect(&config).await.unwrap();

    // Create a table that the registry does not know about.
    let registry = Arc::new(notes_registry());
    AutoMigrator::new(&db, &registry, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();
    db.execute("CREATE TABLE [stray] ([id] TEXT PRIMARY KEY)", &[])
        .await
        .unwrap();

    // Without the flag the table survives a migration of a changed schema.
    let mut extended = notes_registry();
    extended.register(EntityDescriptor::new("extra").field(FieldDef::text("x")));
    let extended = Arc::new(extended);
    AutoMigrator::new(&db, &extended, config.migrations_audit_dir(), false, false)
        .migrate(false)
        .await
        .unwrap();
    assert!(db.table_exists("stray").await.unwrap());
}
