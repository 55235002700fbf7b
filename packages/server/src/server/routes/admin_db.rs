//! Admin surface for migrations, backups and restores.
//!
//! Everything here is admin-only. The restore endpoints are destructive and
//! require an explicit `confirm` flag in the request body.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::{KernelError, KernelResult};
use crate::kernel::backup::restore::{
    self, import_table_csv, revert_table, rollback_to_point, scan_orphans,
};
use crate::kernel::backup::BackupStrategy;
use crate::kernel::migrate::AutoMigrator;
use crate::kernel::Kernel;
use crate::server::middleware::AdminUser;

fn migrator(kernel: &Kernel) -> AutoMigrator<'_> {
    AutoMigrator::new(
        &kernel.db,
        &kernel.registry,
        kernel.config.migrations_audit_dir(),
        kernel.config.allow_column_deletion,
        kernel.config.allow_table_deletion,
    )
}

// ------------------------------------------------------------------
// Migrations
// ------------------------------------------------------------------

pub async fn list_migrations(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
) -> KernelResult<Json<Value>> {
    let migrations = AutoMigrator::list_migrations(&kernel.db).await?;
    let summaries: Vec<Value> = migrations
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "schema_hash": m.schema_hash,
                "applied_at": m.applied_at,
                "operation_count": m.operations.len(),
            })
        })
        .collect();
    Ok(Json(json!({
        "current_schema_hash": kernel.registry.schema_hash(),
        "migrations": summaries,
    })))
}

pub async fn get_migration(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
    Path(schema_hash): Path<String>,
) -> KernelResult<Json<Value>> {
    let migration = AutoMigrator::get_migration(&kernel.db, &schema_hash)
        .await?
        .ok_or_else(|| KernelError::NotFound("migration".into()))?;
    Ok(Json(json!({ "migration": migration })))
}

// ------------------------------------------------------------------
// Backups
// ------------------------------------------------------------------

pub async fn list_backups(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
) -> KernelResult<Json<Value>> {
    let points = restore::list_restore_points(
        &kernel.config.backup_dir(),
        &kernel.config.migrations_audit_dir(),
    )?;
    Ok(Json(json!({ "restore_points": points })))
}

#[derive(Deserialize)]
pub struct CreateBackupRequest {
    #[serde(default = "default_true")]
    pub csv: bool,
    #[serde(default)]
    pub native: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create_backup(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
    Json(request): Json<CreateBackupRequest>,
) -> KernelResult<Json<Value>> {
    if !request.csv && !request.native {
        return Err(KernelError::Validation(
            "at least one of csv/native must be requested".into(),
        ));
    }
    let strategy = BackupStrategy::new(
        &kernel.db,
        &kernel.registry,
        kernel.config.backup_dir(),
        &kernel.config.database_url,
    );
    let report = strategy.backup(request.csv, request.native).await?;
    Ok(Json(json!({ "backup": report })))
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub table: Option<String>,
}

/// Without `?table=` returns a manifest of the backup's files; with it,
/// streams that table's CSV.
pub async fn download_backup(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
    Path(name): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> KernelResult<Response> {
    let point = restore::restore_point_by_name(
        &name,
        &kernel.config.backup_dir(),
        &kernel.config.migrations_audit_dir(),
    )?
    .ok_or_else(|| KernelError::NotFound("backup".into()))?;

    match query.table {
        None => {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(&point.csv_dir)
                .map_err(|e| KernelError::Internal(anyhow::anyhow!("read backup dir: {}", e)))?
                .flatten()
            {
                let meta = entry.metadata().ok();
                files.push(json!({
                    "name": entry.file_name().to_string_lossy(),
                    "bytes": meta.map(|m| m.len()),
                }));
            }
            Ok(Json(json!({ "backup": point, "files": files })).into_response())
        }
        Some(table) => {
            // The table name becomes a filename; reject anything path-like.
            if !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(KernelError::Validation("invalid table name".into()));
            }
            let path = point.csv_dir.join(format!("{}.csv", table));
            let contents = tokio::fs::read(&path)
                .await
                .map_err(|_| KernelError::NotFound(format!("table {} in backup", table)))?;
            let disposition = format!("attachment; filename=\"{}.csv\"", table);
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/csv".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                contents,
            )
                .into_response())
        }
    }
}

/// Upload a CSV backup: multipart with one part per table, named
/// `<table>.csv`, plus a `name` field carrying the backup directory name
/// (`csv_YYYYMMDD_HHMMSS_<hash8>`).
pub async fn upload_backup(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
    mut multipart: Multipart,
) -> KernelResult<Json<Value>> {
    let mut dir_name: Option<String> = None;
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| KernelError::Validation(format!("multipart: {}", e)))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        if field_name == "name" {
            let value = field
                .text()
                .await
                .map_err(|e| KernelError::Validation(format!("multipart: {}", e)))?;
            dir_name = Some(value);
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        if !file_name.ends_with(".csv")
            || !file_name
                .trim_end_matches(".csv")
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(KernelError::Validation(format!(
                "unexpected upload file '{}'",
                file_name
            )));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| KernelError::Validation(format!("multipart: {}", e)))?;
        files.push((file_name, bytes.to_vec()));
    }

    let dir_name =
        dir_name.ok_or_else(|| KernelError::Validation("missing 'name' field".into()))?;
    if !regex::Regex::new(r"^csv_\d{8}_\d{6}_[0-9a-f]+$")
        .unwrap()
        .is_match(&dir_name)
    {
        return Err(KernelError::Validation(
            "name must look like csv_YYYYMMDD_HHMMSS_<hash>".into(),
        ));
    }
    if files.is_empty() {
        return Err(KernelError::Validation("no CSV files uploaded".into()));
    }

    let target = kernel.config.backup_dir().join(&dir_name);
    std::fs::create_dir_all(&target)
        .map_err(|e| KernelError::Internal(anyhow::anyhow!("create upload dir: {}", e)))?;
    let mut written = Vec::new();
    for (file_name, bytes) in files {
        std::fs::write(target.join(&file_name), bytes)
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("write upload: {}", e)))?;
        written.push(file_name);
    }

    Ok(Json(json!({ "backup": dir_name, "files": written })))
}

// ------------------------------------------------------------------
// Schema maintenance
// ------------------------------------------------------------------

pub async fn schema_orphans(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
) -> KernelResult<Json<Value>> {
    let report = scan_orphans(&kernel.db, &kernel.registry).await?;
    Ok(Json(json!({ "orphans": report })))
}

pub async fn run_backfill(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
) -> KernelResult<Json<Value>> {
    let rows = migrator(&kernel).run_rename_backfills().await?;
    Ok(Json(json!({ "backfilled_rows": rows })))
}

// ------------------------------------------------------------------
// Restores
// ------------------------------------------------------------------

#[derive(Deserialize)]
pub struct FullRestoreRequest {
    /// Backup directory name, or omit and give `target_date`.
    #[serde(default)]
    pub backup_name: Option<String>,
    /// RFC 3339 timestamp; the closest earlier backup is used.
    #[serde(default)]
    pub target_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confirm: bool,
}

pub async fn restore_full(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(admin): AdminUser,
    Json(request): Json<FullRestoreRequest>,
) -> KernelResult<Json<Value>> {
    if !request.confirm {
        return Err(KernelError::Validation(
            "full restore destroys current data; pass confirm=true".into(),
        ));
    }
    let backup_dir = kernel.config.backup_dir();
    let migration_dir = kernel.config.migrations_audit_dir();

    let point = match (&request.backup_name, &request.target_date) {
        (Some(name), _) => restore::restore_point_by_name(name, &backup_dir, &migration_dir)?,
        (None, Some(target)) => restore::find_restore_point(*target, &backup_dir, &migration_dir)?,
        (None, None) => {
            return Err(KernelError::Validation(
                "give backup_name or target_date".into(),
            ))
        }
    }
    .ok_or_else(|| KernelError::NotFound("restore point".into()))?;

    tracing::warn!(admin = %admin.id, restore_point = %point.name(), "full rollback requested");
    let report = rollback_to_point(&kernel.db, &point, &migration_dir).await?;
    Ok(Json(json!({ "rollback": report })))
}

#[derive(Deserialize)]
pub struct CsvRestoreRequest {
    pub backup_name: String,
    /// Restrict the import to these tables; all entity tables otherwise.
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

/// Additive import: upserts backup rows into the existing schema. Rows
/// written after the backup are retained.
pub async fn restore_csv(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
    Json(request): Json<CsvRestoreRequest>,
) -> KernelResult<Json<Value>> {
    let point = restore::restore_point_by_name(
        &request.backup_name,
        &kernel.config.backup_dir(),
        &kernel.config.migrations_audit_dir(),
    )?
    .ok_or_else(|| KernelError::NotFound("backup".into()))?;

    let imported = match &request.tables {
        None => restore::import_csv_backup(&kernel.db, &point.csv_dir, false).await?,
        Some(tables) => {
            let mut imported = std::collections::BTreeMap::new();
            for table in tables {
                if !kernel.registry.contains(table) {
                    return Err(KernelError::Validation(format!(
                        "table {} is not registered",
                        table
                    )));
                }
                let file = point.csv_dir.join(format!("{}.csv", table));
                if !file.exists() {
                    return Err(KernelError::NotFound(format!(
                        "table {} in backup {}",
                        table, request.backup_name
                    )));
                }
                let count = import_table_csv(&kernel.db, table, &file, false).await?;
                imported.insert(table.clone(), count);
            }
            imported
        }
    };

    Ok(Json(json!({ "imported": imported })))
}

#[derive(Deserialize)]
pub struct RevertTableRequest {
    pub table: String,
    /// Point in time to revert to, RFC 3339.
    pub target: DateTime<Utc>,
}

pub async fn restore_revert(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(admin): AdminUser,
    Json(request): Json<RevertTableRequest>,
) -> KernelResult<Json<Value>> {
    let report = revert_table(
        &kernel.entities,
        &request.table,
        request.target,
        Some(&admin.id),
    )
    .await?;
    Ok(Json(json!({ "revert": report })))
}
