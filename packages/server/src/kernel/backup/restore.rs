//! Rollback and point-in-time restore.
//!
//! Restore points are discovered by parsing backup directory names; the
//! schema hash in the name links each backup to the migration audit file
//! that rebuilds its schema. Full rollback is authoritative across schema
//! changes: clear, replay audits chronologically up to the matching hash,
//! import CSVs. Single-table revert reconstructs state-at-T from history
//! rows without touching the history itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::common::{KernelError, KernelResult};
use crate::kernel::migrate::replay::replay_migration;
use crate::kernel::storage::{Backend, Database, EntityRegistry, EntityStore};

/// A restorable snapshot: CSV directory plus optional native file and the
/// migration audit file matching its schema hash.
#[derive(Debug, Clone, Serialize)]
pub struct RestorePoint {
    /// `YYYYMMDD_HHMMSS` from the directory name.
    pub timestamp: String,
    pub schema_hash: String,
    pub csv_dir: PathBuf,
    pub native_file: Option<PathBuf>,
    pub migration_file: Option<PathBuf>,
}

impl RestorePoint {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y%m%d_%H%M%S")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn name(&self) -> String {
        format!("csv_{}_{}", self.timestamp, self.schema_hash)
    }
}

fn backup_name_regex() -> Regex {
    Regex::new(r"^csv_(\d{8}_\d{6})_([0-9a-f]+)$").expect("static regex")
}

/// Scan the backup directory for restore points, newest first. Native files
/// and migration audit files are attached by timestamp/hash match.
pub fn list_restore_points(
    backup_dir: &Path,
    migration_dir: &Path,
) -> KernelResult<Vec<RestorePoint>> {
    let pattern = backup_name_regex();
    let mut points = Vec::new();

    let entries = match std::fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(vec![]),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(captures) = pattern.captures(&name) else {
            continue;
        };
        if !entry.path().is_dir() {
            continue;
        }
        let timestamp = captures[1].to_string();
        let schema_hash = captures[2].to_string();

        let native_file = find_native_file(backup_dir, &timestamp, &schema_hash);
        let migration_file = find_migration_file(migration_dir, &schema_hash);

        points.push(RestorePoint {
            timestamp,
            schema_hash,
            csv_dir: entry.path(),
            native_file,
            migration_file,
        });
    }

    points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(points)
}

fn find_native_file(backup_dir: &Path, timestamp: &str, short_hash: &str) -> Option<PathBuf> {
    let prefix = format!("native_{}_{}", timestamp, short_hash);
    std::fs::read_dir(backup_dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| {
            p.is_file()
                && p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
        })
}

fn find_migration_file(migration_dir: &Path, short_hash: &str) -> Option<PathBuf> {
    let suffix = format!("_{}.sql", short_hash);
    let mut matches: Vec<PathBuf> = std::fs::read_dir(migration_dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().ends_with(&suffix))
                .unwrap_or(false)
        })
        .collect();
    matches.sort();
    matches.pop()
}

/// The restore point closest to but not after the target time.
pub fn find_restore_point(
    target: DateTime<Utc>,
    backup_dir: &Path,
    migration_dir: &Path,
) -> KernelResult<Option<RestorePoint>> {
    let points = list_restore_points(backup_dir, migration_dir)?;
    Ok(points
        .into_iter()
        .filter(|p| p.datetime().map(|dt| dt <= target).unwrap_or(false))
        .max_by_key(|p| p.timestamp.clone()))
}

/// Find a restore point by its directory name.
pub fn restore_point_by_name(
    name: &str,
    backup_dir: &Path,
    migration_dir: &Path,
) -> KernelResult<Option<RestorePoint>> {
    Ok(list_restore_points(backup_dir, migration_dir)?
        .into_iter()
        .find(|p| p.name() == name || p.csv_dir.file_name().map(|n| n == name).unwrap_or(false)))
}

/// Audit files to replay, chronological, up to and including the file whose
/// name carries the target hash prefix.
pub fn migrations_up_to_hash(
    migration_dir: &Path,
    schema_hash: &str,
) -> KernelResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(migration_dir)
        .map_err(|e| {
            KernelError::Validation(format!(
                "migration audit dir {} unreadable: {}",
                migration_dir.display(),
                e
            ))
        })?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "sql").unwrap_or(false))
        .collect();
    files.sort();

    let suffix = format!("_{}", schema_hash);
    let mut selected = Vec::new();
    let mut found = false;
    for file in files {
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        selected.push(file);
        if stem.ends_with(&suffix) {
            found = true;
            break;
        }
    }
    if !found {
        return Err(KernelError::Validation(format!(
            "no migration audit file matches schema hash {}",
            schema_hash
        )));
    }
    Ok(selected)
}

/// Drop every table in the database. Destructive by definition; callers
/// gate on explicit confirmation.
pub async fn clear_database(db: &Database) -> KernelResult<()> {
    let tables = db.list_tables().await?;
    for table in &tables {
        db.execute(&db.dialect().drop_table_sql(table), &[]).await?;
    }
    info!(dropped = tables.len(), "cleared database");
    Ok(())
}

/// Import every CSV file from a backup directory. Entity tables upsert by
/// id; history tables (no primary key) only load when `include_history`,
/// the full-rollback path, where tables start empty.
pub async fn import_csv_backup(
    db: &Database,
    csv_dir: &Path,
    include_history: bool,
) -> KernelResult<BTreeMap<String, u64>> {
    let mut imported = BTreeMap::new();

    let mut files: Vec<PathBuf> = std::fs::read_dir(csv_dir)
        .map_err(|e| {
            KernelError::Validation(format!("backup dir {} unreadable: {}", csv_dir.display(), e))
        })?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .collect();
    files.sort();

    for file in files {
        let table = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let is_history = table.ends_with("_history");
        if is_history && !include_history {
            continue;
        }
        if !db.table_exists(&table).await? {
            warn!(table = %table, "csv import skipped, table not in current schema");
            continue;
        }
        let count = import_table_csv(db, &table, &file, is_history).await?;
        imported.insert(table, count);
    }

    Ok(imported)
}

/// Import one table's CSV. Empty cells become NULL (the inverse of export).
pub async fn import_table_csv(
    db: &Database,
    table: &str,
    csv_file: &Path,
    plain_insert: bool,
) -> KernelResult<u64> {
    let mut reader = csv::Reader::from_path(csv_file).map_err(|e| {
        KernelError::Validation(format!("csv {} unreadable: {}", csv_file.display(), e))
    })?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| KernelError::Validation(format!("csv headers: {}", e)))?
        .iter()
        .map(|h| h.to_string())
        .collect();
    if headers.is_empty() {
        return Ok(0);
    }

    let sql = if plain_insert {
        let cols: Vec<String> = headers.iter().map(|c| format!("[{}]", c)).collect();
        let params = vec!["?"; headers.len()].join(", ");
        format!(
            "INSERT INTO [{}] ({}) VALUES ({})",
            table,
            cols.join(", "),
            params
        )
    } else {
        db.dialect().upsert_sql(table, &headers)
    };

    const BATCH: usize = 100;
    let mut batch: Vec<Vec<Option<String>>> = Vec::with_capacity(BATCH);
    let mut count = 0u64;

    for record in reader.records() {
        let record = record
            .map_err(|e| KernelError::Validation(format!("csv row in {}: {}", table, e)))?;
        let params: Vec<Option<String>> = record
            .iter()
            .map(|cell| {
                if cell.is_empty() {
                    None
                } else {
                    Some(cell.to_string())
                }
            })
            .collect();
        batch.push(params);
        count += 1;
        if batch.len() >= BATCH {
            db.execute_many(&sql, &batch).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        db.execute_many(&sql, &batch).await?;
    }

    info!(table = %table, rows = count, "csv import complete");
    Ok(count)
}

#[derive(Debug, Serialize)]
pub struct RollbackReport {
    pub restore_point: String,
    pub used_native: bool,
    pub migrations_replayed: usize,
    pub tables_imported: BTreeMap<String, u64>,
}

/// Full rollback to a restore point: native fast path when the backup's
/// backend matches, else clear + replay + CSV import.
pub async fn rollback_to_point(
    db: &Database,
    point: &RestorePoint,
    migration_dir: &Path,
) -> KernelResult<RollbackReport> {
    // A native file's extension tells which backend produced it.
    let native_backend = point.native_file.as_deref().and_then(native_file_backend);
    let use_native = native_backend == Some(db.backend()) && db.backend() == Backend::Sqlite;

    if use_native {
        // The sqlite fast path copies the snapshot's tables in one shot.
        // Network backends always go through the portable path.
        let native = point.native_file.as_ref().unwrap();
        clear_database(db).await?;
        db.restore_sqlite_snapshot(native).await?;
        return Ok(RollbackReport {
            restore_point: point.name(),
            used_native: true,
            migrations_replayed: 0,
            tables_imported: BTreeMap::new(),
        });
    }

    clear_database(db).await?;

    let migrations = migrations_up_to_hash(migration_dir, &point.schema_hash)?;
    for file in &migrations {
        replay_migration(db, file).await?;
    }

    let tables_imported = import_csv_backup(db, &point.csv_dir, true).await?;

    Ok(RollbackReport {
        restore_point: point.name(),
        used_native: false,
        migrations_replayed: migrations.len(),
        tables_imported,
    })
}

pub fn native_file_backend(path: &Path) -> Option<Backend> {
    match path.extension()?.to_string_lossy().as_ref() {
        "db" | "sqlite" | "sqlite3" | "backup" => Some(Backend::Sqlite),
        "dump" | "pgdump" => Some(Backend::Postgres),
        "sql" | "mysqldump" => Some(Backend::MySql),
        _ => None,
    }
}

// ----------------------------------------------------------------------
// Single-table point-in-time revert
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RevertReport {
    pub table: String,
    pub target: String,
    pub restored: u64,
    pub soft_deleted: u64,
}

/// Revert one historied table to its state at `target`.
///
/// For each id, the history row with the greatest `history_timestamp <= T`
/// is upserted back; rows that did not exist at T are soft-deleted. History
/// is never modified; the revert itself appends a new version as audit.
pub async fn revert_table(
    store: &EntityStore,
    table: &str,
    target: DateTime<Utc>,
    user_id: Option<&str>,
) -> KernelResult<RevertReport> {
    let registry = store.registry().clone();
    let descriptor = registry
        .get(table)
        .ok_or_else(|| KernelError::Validation(format!("table {} is not registered", table)))?;
    if !descriptor.keep_history {
        return Err(KernelError::Validation(format!(
            "table {} keeps no history",
            table
        )));
    }

    let db = store.db().clone();
    let history_table = descriptor.history_table();
    let target_iso = target.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

    // Ids that existed in history at or before T.
    let id_rows = db
        .fetch_all(
            &format!(
                "SELECT DISTINCT [id] FROM [{}] WHERE [history_timestamp] <= ?",
                history_table
            ),
            &[Some(target_iso.clone())],
        )
        .await?;
    let ids_at_target: Vec<String> = id_rows
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect();

    // A revert that finds no history at T would wipe the table; when the
    // table was renamed since, that is a rename crossing, which this
    // operation refuses rather than guesses through.
    if ids_at_target.is_empty() && descriptor.renamed_from_table.is_some() {
        return Err(KernelError::Validation(format!(
            "revert of {} would cross a table rename; use full rollback",
            table
        )));
    }

    let columns = descriptor.all_columns();
    let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();

    let mut restored = 0u64;
    for id in &ids_at_target {
        let rows = db
            .fetch_all(
                &format!(
                    "SELECT {} FROM [{}] WHERE [id] = ? AND [history_timestamp] <= ? ORDER BY [history_timestamp] DESC, [version] DESC LIMIT 1",
                    cols.join(", "),
                    history_table
                ),
                &[Some(id.clone()), Some(target_iso.clone())],
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            continue;
        };

        let mut entity = serde_json::Map::new();
        for (column, raw) in columns.iter().zip(row) {
            // Timestamps/audit columns are carried through save() which
            // refreshes updated_at; the historical values stay in history.
            let declared = descriptor
                .field_named(column)
                .map(|f| f.declared_type)
                .unwrap_or(crate::kernel::storage::FieldType::Text);
            entity.insert(
                column.clone(),
                crate::kernel::storage::entities::deserialize_value(raw, declared),
            );
        }
        store
            .save(
                table,
                Value::Object(entity),
                user_id,
                Some(&format!("Reverted to {}", target_iso)),
            )
            .await?;
        restored += 1;
    }

    // Rows that exist now but had no history at T did not exist then.
    let current = store
        .find(table, None, &[], None, None, None, false)
        .await?;
    let mut soft_deleted = 0u64;
    for row in current {
        let Some(id) = row.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        if !ids_at_target.iter().any(|existing| existing == id) {
            if store.delete(table, id, user_id, false).await? {
                soft_deleted += 1;
            }
        }
    }

    info!(table = %table, target = %target_iso, restored, soft_deleted, "table revert complete");
    Ok(RevertReport {
        table: table.to_string(),
        target: target_iso,
        restored,
        soft_deleted,
    })
}

// ----------------------------------------------------------------------
// Orphan scan
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct OrphanReport {
    /// Live tables with no registered entity (history/meta/system excluded).
    pub tables: Vec<String>,
    /// Live columns per registered table that no field declares.
    pub columns: BTreeMap<String, Vec<String>>,
}

pub async fn scan_orphans(db: &Database, registry: &EntityRegistry) -> KernelResult<OrphanReport> {
    let mut report = OrphanReport {
        tables: Vec::new(),
        columns: BTreeMap::new(),
    };

    let live_tables: Vec<String> = db
        .list_tables()
        .await?
        .into_iter()
        .filter(|t| !t.starts_with('_') && !t.ends_with("_meta") && !t.ends_with("_history"))
        .collect();

    for table in &live_tables {
        if !registry.contains(table) {
            report.tables.push(table.clone());
            continue;
        }
        let descriptor = registry.get(table).unwrap();
        let declared: Vec<String> = descriptor
            .fields
            .iter()
            .map(|f| f.name.to_lowercase())
            .collect();
        let orphans: Vec<String> = db
            .column_names(table)
            .await?
            .into_iter()
            .filter(|c| {
                !crate::kernel::storage::registry::is_system_column(c) && !declared.contains(c)
            })
            .collect();
        if !orphans.is_empty() {
            report.columns.insert(table.clone(), orphans);
        }
    }

    report.tables.sort();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_names_parse() {
        let pattern = backup_name_regex();
        let captures = pattern.captures("csv_20260130_120000_a1b2c3d4").unwrap();
        assert_eq!(&captures[1], "20260130_120000");
        assert_eq!(&captures[2], "a1b2c3d4");
        assert!(pattern.captures("native_20260130_120000_a1b2c3d4").is_none());
        assert!(pattern.captures("csv_bogus").is_none());
    }

    #[test]
    fn restore_point_datetime_parses() {
        let point = RestorePoint {
            timestamp: "20260130_120000".into(),
            schema_hash: "a1b2c3d4".into(),
            csv_dir: PathBuf::from("/tmp/x"),
            native_file: None,
            migration_file: None,
        };
        let dt = point.datetime().unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2026-01-30 12:00");
    }

    #[test]
    fn native_backend_detected_by_extension() {
        assert_eq!(
            native_file_backend(Path::new("native_x.db")),
            Some(Backend::Sqlite)
        );
        assert_eq!(
            native_file_backend(Path::new("native_x.dump")),
            Some(Backend::Postgres)
        );
        assert_eq!(
            native_file_backend(Path::new("native_x.sql")),
            Some(Backend::MySql)
        );
        assert_eq!(native_file_backend(Path::new("native_x.zip")), None);
    }

    #[test]
    fn migrations_up_to_hash_requires_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20260101_000000_aaaa1111.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("20260102_000000_bbbb2222.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("20260103_000000_cccc3333.sql"), "SELECT 1;").unwrap();

        let files = migrations_up_to_hash(dir.path(), "bbbb2222").unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[1].to_string_lossy().contains("bbbb2222"));

        assert!(migrations_up_to_hash(dir.path(), "ffff0000").is_err());
    }
}
