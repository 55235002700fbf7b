//! Diff-driven schema migration.
//!
//! On every start the migrator compares the entity registry against the live
//! database, generates additive DDL for the differences, records the applied
//! schema fingerprint in `_schema_migrations`, and runs the idempotent
//! rename backfills. Destructive operations are gated behind explicit policy
//! flags and never generated for tables still referenced as rename sources.

pub mod replay;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::common::{KernelError, KernelResult};
use crate::kernel::storage::dialect::{
    column_typedef, history_table_columns, table_columns,
};
use crate::kernel::storage::registry::{is_system_column, SYSTEM_COLUMNS};
use crate::kernel::storage::{Database, EntityRegistry, FieldDef};

/// One executable migration operation: neutral SQL plus parameters and a
/// human-readable description for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOp {
    pub sql: String,
    pub params: Vec<Option<String>>,
    pub description: String,
}

impl MigrationOp {
    fn ddl(sql: String, description: String) -> Self {
        Self {
            sql,
            params: vec![],
            description,
        }
    }
}

/// A detected difference between the registry and the live schema.
#[derive(Debug, Clone)]
pub enum SchemaChange {
    CreateTable {
        table: String,
    },
    RenameTable {
        table: String,
        old_table: String,
        old_columns: BTreeSet<String>,
    },
    AddColumn {
        table: String,
        field: FieldDef,
        /// Set when the new column is a rename of a still-present old column.
        renamed_from: Option<String>,
    },
    AddIndex {
        table: String,
        field: String,
    },
    DropColumn {
        table: String,
        column: String,
    },
    DropTable {
        table: String,
    },
}

impl SchemaChange {
    pub fn is_destructive(&self) -> bool {
        matches!(self, SchemaChange::DropColumn { .. } | SchemaChange::DropTable { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaChange::CreateTable { table } => format!("create table {}", table),
            SchemaChange::RenameTable { table, old_table, .. } => {
                format!("rename table {} -> {}", old_table, table)
            }
            SchemaChange::AddColumn { table, field, renamed_from } => match renamed_from {
                Some(old) => format!("rename column {}.{} -> {}", table, old, field.name),
                None => format!("add column {}.{}", table, field.name),
            },
            SchemaChange::AddIndex { table, field } => format!("add index {}.{}", table, field),
            SchemaChange::DropColumn { table, column } => {
                format!("drop column {}.{}", table, column)
            }
            SchemaChange::DropTable { table } => format!("drop table {}", table),
        }
    }
}

/// Summary returned by one migration run.
#[derive(Debug, Default, Serialize)]
pub struct MigrationReport {
    pub schema_hash: String,
    pub applied: bool,
    pub migration_id: Option<String>,
    pub changes: Vec<String>,
    pub backfilled_rows: u64,
}

/// Row in `_schema_migrations`, surfaced by the admin routes.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub id: i64,
    pub schema_hash: String,
    pub applied_at: String,
    pub operations: Vec<MigrationOp>,
}

pub struct AutoMigrator<'a> {
    db: &'a Database,
    registry: &'a EntityRegistry,
    audit_dir: PathBuf,
    allow_column_deletion: bool,
    allow_table_deletion: bool,
}

impl<'a> AutoMigrator<'a> {
    pub fn new(
        db: &'a Database,
        registry: &'a EntityRegistry,
        audit_dir: impl Into<PathBuf>,
        allow_column_deletion: bool,
        allow_table_deletion: bool,
    ) -> Self {
        Self {
            db,
            registry,
            audit_dir: audit_dir.into(),
            allow_column_deletion,
            allow_table_deletion,
        }
    }

    /// Detect and apply schema changes, then run rename backfills.
    ///
    /// With `dry_run`, detected operations are returned without touching the
    /// database or the audit directory.
    pub async fn migrate(&self, dry_run: bool) -> KernelResult<MigrationReport> {
        self.db.acquire_migration_lock().await?;
        let result = self.migrate_locked(dry_run).await;
        self.db.release_migration_lock().await?;
        result
    }

    async fn migrate_locked(&self, dry_run: bool) -> KernelResult<MigrationReport> {
        self.ensure_migrations_table().await?;

        let schema_hash = self.registry.schema_hash();
        let mut report = MigrationReport {
            schema_hash: schema_hash.clone(),
            ..Default::default()
        };

        if !self.is_schema_applied(&schema_hash).await? {
            let changes = self.detect_changes().await?;
            report.changes = changes.iter().map(|c| c.describe()).collect();

            if changes.is_empty() {
                if !dry_run {
                    self.record_migration(&schema_hash, &[]).await?;
                }
            } else {
                let migration_id = format!(
                    "{}_{}",
                    Utc::now().format("%Y%m%d_%H%M%S"),
                    &schema_hash[..8]
                );
                let operations = self.generate_sql(&changes);

                if dry_run {
                    return Ok(report);
                }

                for change in &changes {
                    if change.is_destructive() {
                        warn!(change = %change.describe(), "migration includes a destructive operation");
                    }
                }

                self.save_audit(&migration_id, &changes, &operations)?;
                self.apply_operations(&operations).await?;
                self.record_migration(&schema_hash, &operations).await?;

                info!(migration_id = %migration_id, operations = operations.len(), "applied migration");
                report.applied = true;
                report.migration_id = Some(migration_id);
            }
        }

        // Rename backfills run on every start. During blue-green switchover
        // the old instance keeps writing to old columns after the initial
        // copy ran; each statement is idempotent (WHERE new IS NULL).
        if !dry_run {
            report.backfilled_rows = self.run_rename_backfills().await?;
        }

        Ok(report)
    }

    async fn ensure_migrations_table(&self) -> KernelResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS [_schema_migrations] ([id] {}, [schema_hash] TEXT NOT NULL UNIQUE, [applied_at] TEXT NOT NULL, [operations] TEXT)",
            self.db.dialect().autoincrement_primary_key()
        );
        self.db.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn is_schema_applied(&self, schema_hash: &str) -> KernelResult<bool> {
        let rows = self
            .db
            .fetch_all(
                "SELECT 1 FROM [_schema_migrations] WHERE [schema_hash] = ?",
                &[Some(schema_hash.to_string())],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn record_migration(
        &self,
        schema_hash: &str,
        operations: &[MigrationOp],
    ) -> KernelResult<()> {
        let operations_json = serde_json::to_string(operations)
            .map_err(|e| KernelError::Internal(e.into()))?;
        self.db
            .execute(
                "INSERT INTO [_schema_migrations] ([schema_hash], [applied_at], [operations]) VALUES (?, ?, ?)",
                &[
                    Some(schema_hash.to_string()),
                    Some(Utc::now().to_rfc3339()),
                    Some(operations_json),
                ],
            )
            .await?;
        Ok(())
    }

    /// Entity tables currently in the database, excluding history/meta/system
    /// tables.
    async fn entity_tables(&self) -> KernelResult<BTreeSet<String>> {
        Ok(self
            .db
            .list_tables()
            .await?
            .into_iter()
            .filter(|t| {
                !t.starts_with('_') && !t.ends_with("_meta") && !t.ends_with("_history")
            })
            .collect())
    }

    async fn detect_changes(&self) -> KernelResult<Vec<SchemaChange>> {
        let mut changes = Vec::new();
        let db_tables = self.entity_tables().await?;

        for descriptor in self.registry.descriptors() {
            let table = &descriptor.table_name;
            if !db_tables.contains(table) {
                match &descriptor.renamed_from_table {
                    Some(old_table) if db_tables.contains(old_table) => {
                        let old_columns = self.db.column_names(old_table).await?;
                        changes.push(SchemaChange::RenameTable {
                            table: table.clone(),
                            old_table: old_table.clone(),
                            old_columns,
                        });
                    }
                    other => {
                        if let Some(missing) = other {
                            warn!(
                                table = %table,
                                renamed_from = %missing,
                                "rename source not present, treating as new table"
                            );
                        }
                        changes.push(SchemaChange::CreateTable { table: table.clone() });
                    }
                }
                continue;
            }

            // Table exists: diff columns (case-insensitive, skip system).
            let db_columns = self.db.column_names(table).await?;
            for field in &descriptor.fields {
                if is_system_column(&field.name) {
                    continue;
                }
                if !db_columns.contains(&field.name.to_lowercase()) {
                    let renamed_from = field.renamed_from.as_ref().and_then(|old| {
                        if db_columns.contains(&old.to_lowercase()) {
                            Some(old.clone())
                        } else {
                            warn!(
                                table = %table,
                                field = %field.name,
                                renamed_from = %old,
                                "rename source column not present, treating as new column"
                            );
                            None
                        }
                    });
                    changes.push(SchemaChange::AddColumn {
                        table: table.clone(),
                        field: field.clone(),
                        renamed_from,
                    });
                } else if field.indexed {
                    // Idempotent: CREATE INDEX IF NOT EXISTS (or swallowed
                    // duplicate error on MySQL).
                    changes.push(SchemaChange::AddIndex {
                        table: table.clone(),
                        field: field.name.clone(),
                    });
                }
            }

            if self.allow_column_deletion {
                let code_fields: BTreeSet<String> = descriptor
                    .fields
                    .iter()
                    .map(|f| f.name.to_lowercase())
                    .collect();
                for column in &db_columns {
                    if is_system_column(column) || code_fields.contains(column) {
                        continue;
                    }
                    changes.push(SchemaChange::DropColumn {
                        table: table.clone(),
                        column: column.clone(),
                    });
                }
            }
        }

        if self.allow_table_deletion {
            let code_tables: BTreeSet<String> = self.registry.table_names().into_iter().collect();
            let rename_sources: BTreeSet<String> =
                self.registry.rename_sources().into_iter().collect();
            for table in &db_tables {
                if code_tables.contains(table) || rename_sources.contains(table) {
                    continue;
                }
                changes.push(SchemaChange::DropTable { table: table.clone() });
            }
        }

        Ok(changes)
    }

    fn generate_sql(&self, changes: &[SchemaChange]) -> Vec<MigrationOp> {
        let mut operations = Vec::new();
        for change in changes {
            match change {
                SchemaChange::CreateTable { table } => {
                    operations.extend(self.create_table_ops(table));
                }
                SchemaChange::RenameTable {
                    table,
                    old_table,
                    old_columns,
                } => {
                    operations.extend(self.create_table_ops(table));
                    operations.extend(self.rename_table_copy_ops(table, old_table, old_columns));
                }
                SchemaChange::AddColumn {
                    table,
                    field,
                    renamed_from,
                } => {
                    operations.extend(self.add_column_ops(table, field, renamed_from.as_deref()));
                }
                SchemaChange::AddIndex { table, field } => {
                    operations.push(MigrationOp::ddl(
                        self.db.dialect().create_index_sql(table, field),
                        format!("Create index on {}.{}", table, field),
                    ));
                }
                SchemaChange::DropColumn { table, column } => {
                    operations.push(MigrationOp::ddl(
                        self.db.dialect().drop_column_sql(table, column),
                        format!("Drop column {} from {}", column, table),
                    ));
                    operations.push(MigrationOp::ddl(
                        self.db
                            .dialect()
                            .drop_column_sql(&format!("{}_history", table), column),
                        format!("Drop column {} from {}_history", column, table),
                    ));
                    operations.push(MigrationOp {
                        sql: format!("DELETE FROM [{}_meta] WHERE [name] = ?", table),
                        params: vec![Some(column.clone())],
                        description: format!("Remove {} from meta", column),
                    });
                }
                SchemaChange::DropTable { table } => {
                    for suffix in ["", "_meta", "_history"] {
                        operations.push(MigrationOp::ddl(
                            self.db.dialect().drop_table_sql(&format!("{}{}", table, suffix)),
                            format!("Drop table {}{}", table, suffix),
                        ));
                    }
                }
            }
        }
        operations
    }

    fn create_table_ops(&self, table: &str) -> Vec<MigrationOp> {
        let Some(descriptor) = self.registry.get(table) else {
            return vec![];
        };
        let dialect = self.db.dialect();
        let mut operations = Vec::new();

        operations.push(MigrationOp::ddl(
            dialect.create_table_sql(table, &table_columns(descriptor)),
            format!("Create table {}", table),
        ));

        for field in descriptor.fields.iter().filter(|f| f.indexed) {
            operations.push(MigrationOp::ddl(
                dialect.create_index_sql(table, &field.name),
                format!("Create index on {}.{}", table, field.name),
            ));
        }

        operations.push(MigrationOp::ddl(
            dialect.create_meta_table_sql(table),
            format!("Create meta table for {}", table),
        ));
        for field in &descriptor.fields {
            operations.push(MigrationOp {
                sql: dialect.meta_upsert_sql(table),
                params: vec![
                    Some(field.name.clone()),
                    Some(field.declared_type.as_str().to_string()),
                ],
                description: format!("Add {} to meta", field.name),
            });
        }

        if descriptor.keep_history {
            operations.push(MigrationOp::ddl(
                dialect.create_table_sql(
                    &descriptor.history_table(),
                    &history_table_columns(descriptor),
                ),
                format!("Create history table for {}", table),
            ));
        }

        operations
    }

    /// Copy rows from a renamed table into its successor. The old table is
    /// never dropped here; rollback stays possible.
    fn rename_table_copy_ops(
        &self,
        table: &str,
        old_table: &str,
        old_columns: &BTreeSet<String>,
    ) -> Vec<MigrationOp> {
        let Some(descriptor) = self.registry.get(table) else {
            return vec![];
        };
        let mut new_columns: BTreeSet<String> = descriptor
            .fields
            .iter()
            .map(|f| f.name.to_lowercase())
            .collect();
        new_columns.extend(SYSTEM_COLUMNS.iter().map(|c| c.to_string()));

        let shared: Vec<String> = new_columns.intersection(old_columns).cloned().collect();
        if shared.is_empty() {
            return vec![];
        }

        let dialect = self.db.dialect();
        let mut operations = Vec::new();

        let col_list: Vec<String> = shared.iter().map(|c| format!("[{}]", c)).collect();
        let select_sql = format!("SELECT {} FROM [{}]", col_list.join(", "), old_table);
        operations.push(MigrationOp::ddl(
            dialect.insert_ignore_sql(table, &shared, &select_sql),
            format!(
                "Copy data from {} to {} ({} columns)",
                old_table,
                table,
                shared.len()
            ),
        ));

        if descriptor.keep_history {
            let mut history_cols = shared.clone();
            history_cols.extend(
                crate::kernel::storage::registry::HISTORY_COLUMNS
                    .iter()
                    .map(|c| c.to_string()),
            );
            let hist_list: Vec<String> = history_cols.iter().map(|c| format!("[{}]", c)).collect();
            let history_select = format!(
                "SELECT {} FROM [{}_history]",
                hist_list.join(", "),
                old_table
            );
            operations.push(MigrationOp::ddl(
                dialect.insert_ignore_sql(
                    &descriptor.history_table(),
                    &history_cols,
                    &history_select,
                ),
                format!("Copy history from {} to {}", old_table, table),
            ));
        }

        operations
    }

    fn add_column_ops(
        &self,
        table: &str,
        field: &FieldDef,
        renamed_from: Option<&str>,
    ) -> Vec<MigrationOp> {
        let dialect = self.db.dialect();
        let mut operations = Vec::new();

        operations.push(MigrationOp::ddl(
            dialect.add_column_sql(table, &field.name, &column_typedef(field, false)),
            format!("Add column {} to {}", field.name, table),
        ));
        operations.push(MigrationOp::ddl(
            dialect.add_column_sql(
                &format!("{}_history", table),
                &field.name,
                &column_typedef(field, true),
            ),
            format!("Add column {} to {}_history", field.name, table),
        ));
        operations.push(MigrationOp {
            sql: dialect.meta_upsert_sql(table),
            params: vec![
                Some(field.name.clone()),
                Some(field.declared_type.as_str().to_string()),
            ],
            description: format!("Add {} to meta", field.name),
        });
        if field.indexed {
            operations.push(MigrationOp::ddl(
                dialect.create_index_sql(table, &field.name),
                format!("Create index on {}.{}", table, field.name),
            ));
        }

        if let Some(old) = renamed_from {
            for target in [table.to_string(), format!("{}_history", table)] {
                operations.push(MigrationOp::ddl(
                    format!(
                        "UPDATE [{}] SET [{}] = [{}] WHERE [{}] IS NULL",
                        target, field.name, old, field.name
                    ),
                    format!("Copy data from {} to {} in {} (rename)", old, field.name, target),
                ));
            }
        }

        operations
    }

    /// Execute operations sequentially, swallowing errors that only mean the
    /// operation already happened.
    async fn apply_operations(&self, operations: &[MigrationOp]) -> KernelResult<()> {
        for op in operations {
            match self.db.execute(&op.sql, &op.params).await {
                Ok(_) => {}
                Err(err) if is_idempotent_migration_error(&err) => {
                    continue;
                }
                Err(err) if is_missing_table_error(&err) => {
                    warn!(description = %op.description, error = %err, "migration step skipped (table not ready)");
                    continue;
                }
                Err(err) => {
                    return Err(KernelError::Internal(anyhow::anyhow!(
                        "migration failed at '{}': {}",
                        op.description,
                        err
                    )));
                }
            }
        }
        Ok(())
    }

    /// Backfill renamed columns and tables. Returns total rows copied.
    pub async fn run_rename_backfills(&self) -> KernelResult<u64> {
        let db_tables = self.entity_tables().await?;
        let mut total = 0u64;

        for descriptor in self.registry.descriptors() {
            let table = &descriptor.table_name;
            if !db_tables.contains(table) {
                continue;
            }

            // Column renames: main and history tables.
            let db_columns = self.db.column_names(table).await?;
            for field in &descriptor.fields {
                let Some(old) = &field.renamed_from else {
                    continue;
                };
                if !db_columns.contains(&old.to_lowercase()) {
                    continue;
                }
                let targets = if descriptor.keep_history {
                    vec![table.clone(), descriptor.history_table()]
                } else {
                    vec![table.clone()]
                };
                for target in targets {
                    let sql = format!(
                        "UPDATE [{}] SET [{}] = [{}] WHERE [{}] IS NULL AND [{}] IS NOT NULL",
                        target, field.name, old, field.name, old
                    );
                    // Column may not exist on first boot; treat as a no-op.
                    match self.db.execute(&sql, &[]).await {
                        Ok(affected) if affected > 0 => {
                            info!(table = %target, column = %field.name, rows = affected, "backfilled renamed column");
                            total += affected;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(table = %target, column = %field.name, error = %err, "rename backfill skipped");
                        }
                    }
                }
            }

            // Table renames: copy rows the old instance wrote after cutover.
            let Some(old_table) = &descriptor.renamed_from_table else {
                continue;
            };
            if !db_tables.contains(old_table) {
                continue;
            }
            let old_columns = self.db.column_names(old_table).await?;
            let new_columns = self.db.column_names(table).await?;
            let shared: Vec<String> = old_columns.intersection(&new_columns).cloned().collect();
            if shared.is_empty() {
                continue;
            }
            let col_list: Vec<String> = shared.iter().map(|c| format!("[{}]", c)).collect();
            let select_sql = format!(
                "SELECT {} FROM [{}] WHERE [{}].[id] NOT IN (SELECT [id] FROM [{}])",
                col_list.join(", "),
                old_table,
                old_table,
                table
            );
            let sql = self
                .db
                .dialect()
                .insert_ignore_sql(table, &shared, &select_sql);
            match self.db.execute(&sql, &[]).await {
                Ok(affected) if affected > 0 => {
                    info!(old_table = %old_table, table = %table, rows = affected, "backfilled renamed table");
                    total += affected;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(old_table = %old_table, table = %table, error = %err, "table rename backfill skipped");
                }
            }
        }

        Ok(total)
    }

    // ------------------------------------------------------------------
    // Audit files
    // ------------------------------------------------------------------

    fn save_audit(
        &self,
        migration_id: &str,
        changes: &[SchemaChange],
        operations: &[MigrationOp],
    ) -> KernelResult<()> {
        std::fs::create_dir_all(&self.audit_dir)
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("create audit dir: {}", e)))?;

        let has_destructive = changes.iter().any(|c| c.is_destructive());

        let mut sql_body = String::new();
        sql_body.push_str(&format!("-- Migration: {}\n", migration_id));
        sql_body.push_str("-- Backend-agnostic (uses [bracket] syntax)\n");
        sql_body.push_str(&format!("-- Generated: {}\n", Utc::now().to_rfc3339()));
        sql_body.push_str(&format!("-- Changes: {}\n", changes.len()));
        if has_destructive {
            sql_body.push_str("-- WARNING: This migration includes DELETIONS (data loss!)\n");
        }
        sql_body.push('\n');
        for op in operations {
            sql_body.push_str(&format!("-- {}\n", op.description));
            // Parameters are inlined as literals so the audit file replays
            // standalone on any backend.
            sql_body.push_str(&inline_params(&op.sql, &op.params));
            sql_body.push_str(";\n\n");
        }

        let sql_path = self.audit_dir.join(format!("{}.sql", migration_id));
        std::fs::write(&sql_path, sql_body)
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("write audit sql: {}", e)))?;

        let meta = serde_json::json!({
            "migration_id": migration_id,
            "timestamp": Utc::now().to_rfc3339(),
            "backend": self.db.backend().name(),
            "has_deletions": has_destructive,
            "changes": changes.iter().map(|c| c.describe()).collect::<Vec<_>>(),
        });
        let json_path = self.audit_dir.join(format!("{}.json", migration_id));
        std::fs::write(&json_path, serde_json::to_string_pretty(&meta).unwrap())
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("write audit json: {}", e)))?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Admin queries
    // ------------------------------------------------------------------

    pub async fn list_migrations(db: &Database) -> KernelResult<Vec<MigrationRecord>> {
        let rows = db
            .fetch_all(
                "SELECT [id], [schema_hash], [applied_at], [operations] FROM [_schema_migrations] ORDER BY [id] ASC",
                &[],
            )
            .await?;
        Ok(rows.into_iter().filter_map(parse_migration_row).collect())
    }

    pub async fn get_migration(
        db: &Database,
        schema_hash: &str,
    ) -> KernelResult<Option<MigrationRecord>> {
        let rows = db
            .fetch_all(
                "SELECT [id], [schema_hash], [applied_at], [operations] FROM [_schema_migrations] WHERE [schema_hash] = ?",
                &[Some(schema_hash.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next().and_then(parse_migration_row))
    }
}

fn parse_migration_row(row: Vec<Option<String>>) -> Option<MigrationRecord> {
    let mut it = row.into_iter();
    let id = it.next()??.parse().ok()?;
    let schema_hash = it.next()??;
    let applied_at = it.next()??;
    let operations = it
        .next()
        .flatten()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    Some(MigrationRecord {
        id,
        schema_hash,
        applied_at,
        operations,
    })
}

/// Substitute `?` placeholders with quoted literals. Placeholders inside
/// string literals are left untouched, matching the neutral-SQL scanner.
fn inline_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_string = false;
    let mut index = 0usize;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    out.push(chars.next().unwrap());
                } else {
                    in_string = false;
                }
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                out.push(c);
            }
            '?' if chars.peek() == Some(&'?') => {
                chars.next();
                out.push_str("??");
            }
            '?' => {
                match params.get(index).cloned().flatten() {
                    Some(value) => {
                        out.push('\'');
                        out.push_str(&value.replace('\'', "''"));
                        out.push('\'');
                    }
                    None => out.push_str("NULL"),
                }
                index += 1;
            }
            other => out.push(other),
        }
    }
    out
}

/// Errors that only mean "this operation already ran".
pub fn is_idempotent_migration_error(err: &KernelError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("already exists")
        || msg.contains("duplicate column")
        || msg.contains("duplicate key")
        || msg.contains("duplicate entry")
}

/// Ordering races during create: a statement referenced a table created by a
/// later operation. Logged and skipped; the next start converges.
pub fn is_missing_table_error(err: &KernelError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("no such table") || msg.contains("does not exist") || msg.contains("doesn't exist")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_error_classification() {
        let already = KernelError::Internal(anyhow::anyhow!("table \"users\" already exists"));
        assert!(is_idempotent_migration_error(&already));

        let duplicate = KernelError::Internal(anyhow::anyhow!("duplicate column name: email"));
        assert!(is_idempotent_migration_error(&duplicate));

        let syntax = KernelError::Internal(anyhow::anyhow!("syntax error"));
        assert!(!is_idempotent_migration_error(&syntax));
    }

    #[test]
    fn missing_table_error_classification() {
        let missing = KernelError::Internal(anyhow::anyhow!("no such table: users_history"));
        assert!(is_missing_table_error(&missing));
        let pg = KernelError::Internal(anyhow::anyhow!("relation \"users\" does not exist"));
        assert!(is_missing_table_error(&pg));
    }

    #[test]
    fn params_inline_as_quoted_literals() {
        let sql = "INSERT INTO [t_meta] ([name], [type]) VALUES (?, ?)";
        let params = vec![Some("o'brien".to_string()), Some("text".to_string())];
        assert_eq!(
            inline_params(sql, &params),
            "INSERT INTO [t_meta] ([name], [type]) VALUES ('o''brien', 'text')"
        );
    }

    #[test]
    fn inline_params_skips_string_literals() {
        let sql = "UPDATE [t] SET [a] = 'has ? inside' WHERE [b] = ?";
        let params = vec![Some("x".to_string())];
        assert_eq!(
            inline_params(sql, &params),
            "UPDATE [t] SET [a] = 'has ? inside' WHERE [b] = 'x'"
        );
    }

    #[test]
    fn change_descriptions() {
        let change = SchemaChange::AddColumn {
            table: "projects".into(),
            field: FieldDef::text("docker_hub_user"),
            renamed_from: Some("docker_user".into()),
        };
        assert_eq!(
            change.describe(),
            "rename column projects.docker_user -> docker_hub_user"
        );
        assert!(!change.is_destructive());
        assert!(SchemaChange::DropTable { table: "x".into() }.is_destructive());
    }
}
