// Admin CLI for migrations, backups and restores.
//
// Exit codes: 0 success, 1 configuration/validation error,
// 2 infrastructure (DB/KV) unavailable, 3 migration failed.

use std::process::ExitCode;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keelson_core::common::KernelError;
use keelson_core::kernel::backup::restore::{
    self, revert_table, rollback_to_point, scan_orphans,
};
use keelson_core::kernel::backup::BackupStrategy;
use keelson_core::kernel::migrate::AutoMigrator;
use keelson_core::kernel::storage::{Database, EntityStore};
use keelson_core::kernel::Kernel;
use keelson_core::Config;

const EXIT_CONFIG: u8 = 1;
const EXIT_INFRA: u8 = 2;
const EXIT_MIGRATION: u8 = 3;

#[derive(Parser)]
#[command(name = "admin_cli", about = "Keelson database administration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Diff the entity registry against the database and apply changes
    Migrate {
        /// Show planned operations without applying them
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the idempotent rename backfills
    Backfill,
    /// Produce a backup
    Backup {
        /// Skip the CSV export
        #[arg(long)]
        no_csv: bool,
        /// Also produce a native snapshot
        #[arg(long)]
        native: bool,
    },
    /// List applied migrations
    ListMigrations,
    /// List restore points
    ListBackups,
    /// List live tables/columns absent from the registry
    Orphans,
    /// Full rollback to a restore point (destructive)
    RestoreFull {
        /// Backup directory name (csv_YYYYMMDD_HHMMSS_<hash>)
        #[arg(long, conflicts_with = "target")]
        backup: Option<String>,
        /// Target time (RFC 3339); the closest earlier backup is used
        #[arg(long)]
        target: Option<DateTime<Utc>>,
        /// Required: this destroys current data
        #[arg(long)]
        confirm: bool,
    },
    /// Additive CSV import from a backup (no DDL, newer rows retained)
    RestoreCsv {
        #[arg(long)]
        backup: String,
    },
    /// Revert one historied table to a point in time
    Revert {
        #[arg(long)]
        table: String,
        /// Target time (RFC 3339)
        #[arg(long)]
        target: DateTime<Utc>,
    },
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<KernelError>() {
        Some(KernelError::Validation(_)) | Some(KernelError::NotFound(_)) => EXIT_CONFIG,
        Some(KernelError::Unavailable(_)) | Some(KernelError::Timeout(_)) => EXIT_INFRA,
        _ => EXIT_INFRA,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Database administration needs no token secret.
    if std::env::var("JWT_SECRET").is_err() {
        std::env::set_var("JWT_SECRET", "admin-cli");
    }
    let config = match Config::from_env().context("loading configuration") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let code = match e.downcast_ref::<MigrationFailed>() {
                Some(_) => EXIT_MIGRATION,
                None => exit_code_for(&e),
            };
            ExitCode::from(code)
        }
    }
}

/// Marker wrapped around migration errors so main maps them to exit code 3.
#[derive(Debug)]
struct MigrationFailed(String);

impl std::fmt::Display for MigrationFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "migration failed: {}", self.0)
    }
}

impl std::error::Error for MigrationFailed {}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir).context("creating data dir")?;
    let db = Database::connect(&config).await?;
    let registry = std::sync::Arc::new(Kernel::base_registry());

    let migrator = AutoMigrator::new(
        &db,
        &registry,
        config.migrations_audit_dir(),
        config.allow_column_deletion,
        config.allow_table_deletion,
    );

    match command {
        Command::Migrate { dry_run } => {
            let report = migrator
                .migrate(dry_run)
                .await
                .map_err(|e| anyhow::Error::new(MigrationFailed(e.to_string())))?;
            println!("schema hash: {}", report.schema_hash);
            if dry_run {
                if report.changes.is_empty() {
                    println!("schema is up to date");
                } else {
                    println!("planned changes:");
                    for change in &report.changes {
                        println!("  - {}", change);
                    }
                }
            } else if report.applied {
                println!(
                    "applied migration {} ({} changes, {} rows backfilled)",
                    report.migration_id.as_deref().unwrap_or("-"),
                    report.changes.len(),
                    report.backfilled_rows
                );
            } else {
                println!(
                    "schema already applied ({} rows backfilled)",
                    report.backfilled_rows
                );
            }
        }
        Command::Backfill => {
            let rows = migrator.run_rename_backfills().await?;
            println!("backfilled {} rows", rows);
        }
        Command::Backup { no_csv, native } => {
            let strategy =
                BackupStrategy::new(&db, &registry, config.backup_dir(), &config.database_url);
            let report = strategy.backup(!no_csv, native).await?;
            if let Some(dir) = &report.csv_dir {
                println!("csv backup: {}", dir.display());
            }
            if let Some(file) = &report.native_file {
                println!("native backup: {}", file.display());
            }
            for (table, rows) in &report.tables {
                println!("  {}: {} rows", table, rows);
            }
        }
        Command::ListMigrations => {
            let migrations = AutoMigrator::list_migrations(&db).await?;
            for migration in migrations {
                println!(
                    "{}  {}  {} operations  applied {}",
                    migration.id,
                    &migration.schema_hash[..8.min(migration.schema_hash.len())],
                    migration.operations.len(),
                    migration.applied_at
                );
            }
        }
        Command::ListBackups => {
            let points = restore::list_restore_points(
                &config.backup_dir(),
                &config.migrations_audit_dir(),
            )?;
            for point in points {
                println!(
                    "{}  native={}  migration={}",
                    point.name(),
                    point.native_file.is_some(),
                    point.migration_file.is_some()
                );
            }
        }
        Command::Orphans => {
            let report = scan_orphans(&db, &registry).await?;
            if report.tables.is_empty() && report.columns.is_empty() {
                println!("no orphans");
            }
            for table in &report.tables {
                println!("orphan table: {}", table);
            }
            for (table, columns) in &report.columns {
                println!("orphan columns in {}: {}", table, columns.join(", "));
            }
        }
        Command::RestoreFull {
            backup,
            target,
            confirm,
        } => {
            if !confirm {
                anyhow::bail!(KernelError::Validation(
                    "full restore destroys current data; pass --confirm".into()
                ));
            }
            let backup_dir = config.backup_dir();
            let migration_dir = config.migrations_audit_dir();
            let point = match (backup, target) {
                (Some(name), _) => {
                    restore::restore_point_by_name(&name, &backup_dir, &migration_dir)?
                }
                (None, Some(target)) => {
                    restore::find_restore_point(target, &backup_dir, &migration_dir)?
                }
                (None, None) => anyhow::bail!(KernelError::Validation(
                    "give --backup or --target".into()
                )),
            }
            .ok_or(KernelError::NotFound("restore point".into()))?;

            let report = rollback_to_point(&db, &point, &migration_dir).await?;
            println!(
                "rolled back to {} ({} migrations replayed, {} tables imported, native={})",
                report.restore_point,
                report.migrations_replayed,
                report.tables_imported.len(),
                report.used_native
            );
        }
        Command::RestoreCsv { backup } => {
            let point = restore::restore_point_by_name(
                &backup,
                &config.backup_dir(),
                &config.migrations_audit_dir(),
            )?
            .ok_or(KernelError::NotFound("backup".into()))?;
            let imported = restore::import_csv_backup(&db, &point.csv_dir, false).await?;
            for (table, rows) in imported {
                println!("{}: {} rows", table, rows);
            }
        }
        Command::Revert { table, target } => {
            let entities = EntityStore::new(db.clone(), registry.clone());
            let report = revert_table(&entities, &table, target, None).await?;
            println!(
                "reverted {} to {}: {} rows restored, {} soft-deleted",
                report.table, report.target, report.restored, report.soft_deleted
            );
        }
    }

    Ok(())
}
