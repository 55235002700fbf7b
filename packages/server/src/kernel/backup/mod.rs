//! Backup production: portable CSV snapshots plus native fast-path dumps.
//!
//! Directory names encode the schema fingerprint active at backup time
//! (`csv_<YYYYMMDD_HHMMSS>_<hash8>/`), which is what links a backup to the
//! migration audit file needed to rebuild its schema.

pub mod restore;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::common::{KernelError, KernelResult};
use crate::kernel::storage::{Backend, Database, EntityRegistry};

#[derive(Debug, Serialize)]
pub struct BackupReport {
    pub timestamp: String,
    pub schema_hash: String,
    pub csv_dir: Option<PathBuf>,
    pub native_file: Option<PathBuf>,
    pub tables: BTreeMap<String, u64>,
}

pub struct BackupStrategy<'a> {
    db: &'a Database,
    registry: &'a EntityRegistry,
    backup_dir: PathBuf,
    database_url: String,
}

impl<'a> BackupStrategy<'a> {
    pub fn new(
        db: &'a Database,
        registry: &'a EntityRegistry,
        backup_dir: impl Into<PathBuf>,
        database_url: &str,
    ) -> Self {
        Self {
            db,
            registry,
            backup_dir: backup_dir.into(),
            database_url: database_url.to_string(),
        }
    }

    /// Produce a backup. CSV is the portable default; the native snapshot is
    /// best-effort (requires the backend's dump tool on network backends).
    pub async fn backup(&self, csv: bool, native: bool) -> KernelResult<BackupReport> {
        std::fs::create_dir_all(&self.backup_dir)
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("create backup dir: {}", e)))?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let schema_hash = self.registry.schema_hash();
        let short_hash = &schema_hash[..8];

        let mut report = BackupReport {
            timestamp: timestamp.clone(),
            schema_hash: schema_hash.clone(),
            csv_dir: None,
            native_file: None,
            tables: BTreeMap::new(),
        };

        if csv {
            let dir = self
                .backup_dir
                .join(format!("csv_{}_{}", timestamp, short_hash));
            std::fs::create_dir_all(&dir)
                .map_err(|e| KernelError::Internal(anyhow::anyhow!("create csv dir: {}", e)))?;

            for descriptor in self.registry.descriptors() {
                let count = self
                    .export_table(&descriptor.table_name, &descriptor.all_columns(), &dir)
                    .await?;
                report.tables.insert(descriptor.table_name.clone(), count);

                if descriptor.keep_history
                    && self.db.table_exists(&descriptor.history_table()).await?
                {
                    let count = self
                        .export_table(
                            &descriptor.history_table(),
                            &descriptor.history_columns(),
                            &dir,
                        )
                        .await?;
                    report.tables.insert(descriptor.history_table(), count);
                }
            }

            self.write_metadata(&dir, &timestamp, &schema_hash, &report.tables)?;
            info!(dir = %dir.display(), tables = report.tables.len(), "csv backup written");
            report.csv_dir = Some(dir);
        }

        if native {
            report.native_file = self.native_backup(&timestamp, short_hash).await?;
        }

        Ok(report)
    }

    /// Export one table to `<dir>/<table>.csv` including soft-deleted rows.
    /// NULL values serialize as empty cells.
    async fn export_table(
        &self,
        table: &str,
        columns: &[String],
        dir: &std::path::Path,
    ) -> KernelResult<u64> {
        if !self.db.table_exists(table).await? {
            return Ok(0);
        }
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        let sql = format!(
            "SELECT {} FROM [{}] ORDER BY [id]",
            cols.join(", "),
            table
        );
        let rows = self.db.fetch_all(&sql, &[]).await?;

        let path = dir.join(format!("{}.csv", table));
        let mut writer = csv::Writer::from_path(&path)
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("open {}: {}", path.display(), e)))?;
        writer
            .write_record(columns)
            .map_err(|e| KernelError::Internal(e.into()))?;
        let mut count = 0u64;
        for row in rows {
            let record: Vec<String> = row.into_iter().map(|v| v.unwrap_or_default()).collect();
            writer
                .write_record(&record)
                .map_err(|e| KernelError::Internal(e.into()))?;
            count += 1;
        }
        writer.flush().map_err(|e| KernelError::Internal(e.into()))?;
        Ok(count)
    }

    fn write_metadata(
        &self,
        dir: &std::path::Path,
        timestamp: &str,
        schema_hash: &str,
        tables: &BTreeMap<String, u64>,
    ) -> KernelResult<()> {
        let meta = serde_json::json!({
            "timestamp": timestamp,
            "schema_hash": schema_hash,
            "backend": self.db.backend().name(),
            "tables": tables,
        });
        let path = dir.join(format!("metadata_{}.json", timestamp));
        std::fs::write(&path, serde_json::to_string_pretty(&meta).unwrap())
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("write metadata: {}", e)))?;
        Ok(())
    }

    /// Native snapshot. SQLite uses `VACUUM INTO` (consistent copy even with
    /// WAL); network backends shell out to their dump tool when present.
    async fn native_backup(
        &self,
        timestamp: &str,
        short_hash: &str,
    ) -> KernelResult<Option<PathBuf>> {
        match self.db.backend() {
            Backend::Sqlite => {
                let path = self
                    .backup_dir
                    .join(format!("native_{}_{}.db", timestamp, short_hash));
                let sql = format!("VACUUM INTO '{}'", path.display());
                self.db.execute(&sql, &[]).await?;
                info!(file = %path.display(), "native sqlite backup written");
                Ok(Some(path))
            }
            Backend::Postgres => {
                let path = self
                    .backup_dir
                    .join(format!("native_{}_{}.dump", timestamp, short_hash));
                self.run_dump_tool(
                    "pg_dump",
                    &["--format=custom", "--file", &path.to_string_lossy(), &self.database_url],
                    path.clone(),
                )
                .await
            }
            Backend::MySql => {
                let path = self
                    .backup_dir
                    .join(format!("native_{}_{}.sql", timestamp, short_hash));
                self.run_dump_tool(
                    "mysqldump",
                    &["--result-file", &path.to_string_lossy(), &self.database_url],
                    path.clone(),
                )
                .await
            }
        }
    }

    async fn run_dump_tool(
        &self,
        tool: &str,
        args: &[&str],
        path: PathBuf,
    ) -> KernelResult<Option<PathBuf>> {
        let status = tokio::process::Command::new(tool)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {
                info!(file = %path.display(), tool, "native backup written");
                Ok(Some(path))
            }
            Ok(status) => {
                warn!(tool, code = ?status.code(), "native backup tool failed, csv backup remains authoritative");
                Ok(None)
            }
            Err(e) => {
                warn!(tool, error = %e, "native backup tool unavailable");
                Ok(None)
            }
        }
    }
}
