//! Database facade over the supported backends.
//!
//! One `Database` wraps a sqlx pool for the configured backend plus the
//! matching dialect. All statements pass through the neutral-SQL translator;
//! rows come back as `Vec<Option<String>>` because every entity column is
//! stored as TEXT (values are serialized before INSERT).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row as _;
use tracing::warn;

use crate::common::{KernelError, KernelResult};
use crate::config::Config;

use super::dialect::{Backend, SqlDialect};

/// One result row: column values in select order, serialized as text.
pub type Row = Vec<Option<String>>;

/// Lock-contention retry policy: capped exponential backoff with jitter,
/// bounded by attempts and total elapsed time. Backoff sleeps run outside
/// any per-statement timeout so cancellation never cuts them short.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub total_budget: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            total_budget: Duration::from_secs(300),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        // +/- 25% jitter so contending writers desynchronize
        let jitter = rand::thread_rng().gen_range(0.75..1.25);
        capped.mul_f64(jitter)
    }
}

/// Whether an error is transient lock contention worth retrying.
fn is_lock_contention(err: &KernelError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("database is locked")
        || msg.contains("database table is locked")
        || msg.contains("database is busy")
        || msg.contains("lock wait timeout")
        || msg.contains("deadlock")
}

enum DbPool {
    Sqlite(sqlx::SqlitePool),
    Postgres(sqlx::PgPool),
    MySql(sqlx::MySqlPool),
}

pub struct Database {
    pool: DbPool,
    backend: Backend,
    dialect: Box<dyn SqlDialect>,
    retry: RetryPolicy,
}

impl Database {
    /// Connect to the configured backend. The embedded backend is created
    /// with WAL journaling, a 5s busy timeout, foreign keys on and NORMAL
    /// synchronous mode.
    pub async fn connect(config: &Config) -> KernelResult<Arc<Database>> {
        let backend = Backend::from_url(&config.database_url);
        let acquire_timeout = Duration::from_secs(config.pool_acquire_timeout_secs);

        let pool = match backend {
            Backend::Sqlite => {
                let options = SqliteConnectOptions::from_str(&config.database_url)
                    .map_err(|e| KernelError::Validation(format!("invalid DATABASE_URL: {}", e)))?
                    .create_if_missing(true)
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(5))
                    .foreign_keys(true)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
                let pool = SqlitePoolOptions::new()
                    .min_connections(config.pool_min_connections)
                    .max_connections(config.pool_max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect_with(options)
                    .await
                    .map_err(|e| KernelError::Unavailable(format!("sqlite connect: {}", e)))?;
                DbPool::Sqlite(pool)
            }
            Backend::Postgres => {
                let pool = PgPoolOptions::new()
                    .min_connections(config.pool_min_connections)
                    .max_connections(config.pool_max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(&config.database_url)
                    .await
                    .map_err(|e| KernelError::Unavailable(format!("postgres connect: {}", e)))?;
                DbPool::Postgres(pool)
            }
            Backend::MySql => {
                let pool = MySqlPoolOptions::new()
                    .min_connections(config.pool_min_connections)
                    .max_connections(config.pool_max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(&config.database_url)
                    .await
                    .map_err(|e| KernelError::Unavailable(format!("mysql connect: {}", e)))?;
                DbPool::MySql(pool)
            }
        };

        Ok(Arc::new(Database {
            pool,
            backend,
            dialect: backend.dialect(),
            retry: RetryPolicy::default(),
        }))
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// The sqlite database file path, if running on the embedded backend.
    pub fn sqlite_path(url: &str) -> Option<std::path::PathBuf> {
        url.strip_prefix("sqlite://")
            .or(Some(url))
            .filter(|p| !p.contains("://") && *p != ":memory:")
            .map(std::path::PathBuf::from)
    }

    async fn run_with_retry<T, F, Fut>(&self, mut op: F) -> KernelResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = KernelResult<T>>,
    {
        let started = std::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if is_lock_contention(&err)
                        && attempt < self.retry.max_attempts
                        && started.elapsed() < self.retry.total_budget =>
                {
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "database locked, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute a neutral-SQL statement, returning affected row count.
    pub async fn execute(&self, sql: &str, params: &[Option<String>]) -> KernelResult<u64> {
        let native = self.dialect.to_native(sql);
        self.run_with_retry(|| async {
            match &self.pool {
                DbPool::Sqlite(pool) => {
                    let mut query = sqlx::query(&native);
                    for p in params {
                        query = query.bind(p.as_deref());
                    }
                    Ok(query.execute(pool).await?.rows_affected())
                }
                DbPool::Postgres(pool) => {
                    let mut query = sqlx::query(&native);
                    for p in params {
                        query = query.bind(p.as_deref());
                    }
                    Ok(query.execute(pool).await?.rows_affected())
                }
                DbPool::MySql(pool) => {
                    let mut query = sqlx::query(&native);
                    for p in params {
                        query = query.bind(p.as_deref());
                    }
                    Ok(query.execute(pool).await?.rows_affected())
                }
            }
        })
        .await
    }

    /// Execute a neutral-SQL query, returning all rows as text values.
    pub async fn fetch_all(&self, sql: &str, params: &[Option<String>]) -> KernelResult<Vec<Row>> {
        let native = self.dialect.to_native(sql);
        self.run_with_retry(|| async {
            match &self.pool {
                DbPool::Sqlite(pool) => {
                    let mut query = sqlx::query(&native);
                    for p in params {
                        query = query.bind(p.as_deref());
                    }
                    let rows = query.fetch_all(pool).await?;
                    Ok(rows.iter().map(sqlite_row_values).collect())
                }
                DbPool::Postgres(pool) => {
                    let mut query = sqlx::query(&native);
                    for p in params {
                        query = query.bind(p.as_deref());
                    }
                    let rows = query.fetch_all(pool).await?;
                    Ok(rows.iter().map(pg_row_values).collect())
                }
                DbPool::MySql(pool) => {
                    let mut query = sqlx::query(&native);
                    for p in params {
                        query = query.bind(p.as_deref());
                    }
                    let rows = query.fetch_all(pool).await?;
                    Ok(rows.iter().map(mysql_row_values).collect())
                }
            }
        })
        .await
    }

    /// Execute the same statement for each parameter batch inside one
    /// transaction.
    pub async fn execute_many(
        &self,
        sql: &str,
        batches: &[Vec<Option<String>>],
    ) -> KernelResult<u64> {
        let mut tx = self.begin().await?;
        let mut affected = 0;
        for batch in batches {
            affected += self.tx_execute(&mut tx, sql, batch).await?;
        }
        tx.commit().await?;
        Ok(affected)
    }

    /// Begin a transaction on a dedicated pooled connection.
    pub async fn begin(&self) -> KernelResult<DbTransaction> {
        Ok(match &self.pool {
            DbPool::Sqlite(pool) => DbTransaction::Sqlite(pool.begin().await?),
            DbPool::Postgres(pool) => DbTransaction::Postgres(pool.begin().await?),
            DbPool::MySql(pool) => DbTransaction::MySql(pool.begin().await?),
        })
    }

    /// Execute a neutral-SQL statement inside an open transaction.
    pub async fn tx_execute(
        &self,
        tx: &mut DbTransaction,
        sql: &str,
        params: &[Option<String>],
    ) -> KernelResult<u64> {
        let native = self.dialect.to_native(sql);
        match tx {
            DbTransaction::Sqlite(inner) => {
                let mut query = sqlx::query(&native);
                for p in params {
                    query = query.bind(p.as_deref());
                }
                Ok(query.execute(&mut **inner).await?.rows_affected())
            }
            DbTransaction::Postgres(inner) => {
                let mut query = sqlx::query(&native);
                for p in params {
                    query = query.bind(p.as_deref());
                }
                Ok(query.execute(&mut **inner).await?.rows_affected())
            }
            DbTransaction::MySql(inner) => {
                let mut query = sqlx::query(&native);
                for p in params {
                    query = query.bind(p.as_deref());
                }
                Ok(query.execute(&mut **inner).await?.rows_affected())
            }
        }
    }

    /// Query inside an open transaction.
    pub async fn tx_fetch_all(
        &self,
        tx: &mut DbTransaction,
        sql: &str,
        params: &[Option<String>],
    ) -> KernelResult<Vec<Row>> {
        let native = self.dialect.to_native(sql);
        match tx {
            DbTransaction::Sqlite(inner) => {
                let mut query = sqlx::query(&native);
                for p in params {
                    query = query.bind(p.as_deref());
                }
                let rows = query.fetch_all(&mut **inner).await?;
                Ok(rows.iter().map(sqlite_row_values).collect())
            }
            DbTransaction::Postgres(inner) => {
                let mut query = sqlx::query(&native);
                for p in params {
                    query = query.bind(p.as_deref());
                }
                let rows = query.fetch_all(&mut **inner).await?;
                Ok(rows.iter().map(pg_row_values).collect())
            }
            DbTransaction::MySql(inner) => {
                let mut query = sqlx::query(&native);
                for p in params {
                    query = query.bind(p.as_deref());
                }
                let rows = query.fetch_all(&mut **inner).await?;
                Ok(rows.iter().map(mysql_row_values).collect())
            }
        }
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    pub async fn list_tables(&self) -> KernelResult<Vec<String>> {
        let rows = self.fetch_all(&self.dialect.list_tables_sql(), &[]).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    pub async fn list_columns(&self, table: &str) -> KernelResult<Vec<(String, String)>> {
        let sql = self.dialect.list_columns_sql();
        let rows = self
            .fetch_all(&sql, &[Some(table.to_string())])
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut it = row.into_iter();
                (
                    it.next().flatten().unwrap_or_default(),
                    it.next().flatten().unwrap_or_default(),
                )
            })
            .filter(|(name, _)| !name.is_empty())
            .collect())
    }

    /// Lowercased column names for case-insensitive diffing.
    pub async fn column_names(&self, table: &str) -> KernelResult<std::collections::BTreeSet<String>> {
        Ok(self
            .list_columns(table)
            .await?
            .into_iter()
            .map(|(name, _)| name.to_lowercase())
            .collect())
    }

    pub async fn table_exists(&self, table: &str) -> KernelResult<bool> {
        Ok(self.list_tables().await?.iter().any(|t| t == table))
    }

    /// Copy every table from a sqlite snapshot file into this database.
    /// ATTACH is per-connection state, so the whole copy is pinned to one
    /// pooled connection (and ATTACH cannot run inside a transaction).
    pub async fn restore_sqlite_snapshot(&self, snapshot: &std::path::Path) -> KernelResult<()> {
        let DbPool::Sqlite(pool) = &self.pool else {
            return Err(KernelError::Validation(
                "native sqlite restore requires the sqlite backend".into(),
            ));
        };
        let mut conn = pool.acquire().await?;

        let attach = format!(
            "ATTACH DATABASE '{}' AS backup_src",
            snapshot.display().to_string().replace('\'', "''")
        );
        sqlx::query(&attach).execute(&mut *conn).await?;

        let result = async {
            let tables: Vec<String> = sqlx::query_scalar(
                "SELECT name FROM backup_src.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )
            .fetch_all(&mut *conn)
            .await?;

            for table in &tables {
                let create_sql: Option<String> = sqlx::query_scalar(
                    "SELECT sql FROM backup_src.sqlite_master WHERE type = 'table' AND name = ?",
                )
                .bind(table)
                .fetch_optional(&mut *conn)
                .await?;
                if let Some(create_sql) = create_sql {
                    sqlx::query(&create_sql).execute(&mut *conn).await?;
                }
                let copy = format!(
                    "INSERT INTO main.\"{}\" SELECT * FROM backup_src.\"{}\"",
                    table, table
                );
                sqlx::query(&copy).execute(&mut *conn).await?;
            }
            Ok::<_, KernelError>(())
        }
        .await;

        // Detach even when the copy failed.
        let _ = sqlx::query("DETACH DATABASE backup_src")
            .execute(&mut *conn)
            .await;
        result
    }

    /// Take the cross-process migration lock. SQLite needs none (single
    /// writer per file); network backends use advisory locks.
    pub async fn acquire_migration_lock(&self) -> KernelResult<()> {
        match self.backend {
            Backend::Sqlite => Ok(()),
            Backend::Postgres => {
                // Key derived from "keelson.migrate"
                self.execute("SELECT pg_advisory_lock(8254170531)", &[]).await?;
                Ok(())
            }
            Backend::MySql => {
                self.execute("SELECT GET_LOCK('keelson.migrate', 300)", &[])
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn release_migration_lock(&self) -> KernelResult<()> {
        match self.backend {
            Backend::Sqlite => Ok(()),
            Backend::Postgres => {
                self.execute("SELECT pg_advisory_unlock(8254170531)", &[])
                    .await?;
                Ok(())
            }
            Backend::MySql => {
                self.execute("SELECT RELEASE_LOCK('keelson.migrate')", &[])
                    .await?;
                Ok(())
            }
        }
    }
}

/// An open transaction on one pooled connection. Scopes commit explicitly on
/// success; dropping without commit rolls back, so a released connection is
/// never left holding an open transaction.
pub enum DbTransaction {
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>),
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    MySql(sqlx::Transaction<'static, sqlx::MySql>),
}

impl DbTransaction {
    pub async fn commit(self) -> KernelResult<()> {
        match self {
            DbTransaction::Sqlite(tx) => tx.commit().await?,
            DbTransaction::Postgres(tx) => tx.commit().await?,
            DbTransaction::MySql(tx) => tx.commit().await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> KernelResult<()> {
        match self {
            DbTransaction::Sqlite(tx) => tx.rollback().await?,
            DbTransaction::Postgres(tx) => tx.rollback().await?,
            DbTransaction::MySql(tx) => tx.rollback().await?,
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Row decoding: entity columns are TEXT, but catalog queries and history
// version columns surface integers, so decode falls through numeric types.
// ----------------------------------------------------------------------

fn sqlite_row_values(row: &SqliteRow) -> Row {
    (0..row.columns().len())
        .map(|i| {
            if let Ok(v) = row.try_get::<Option<String>, _>(i) {
                return v;
            }
            if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
                return v.map(|x| x.to_string());
            }
            if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
                return v.map(|x| x.to_string());
            }
            if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
                return v.map(|b| String::from_utf8_lossy(&b).into_owned());
            }
            None
        })
        .collect()
}

fn pg_row_values(row: &PgRow) -> Row {
    (0..row.columns().len())
        .map(|i| {
            if let Ok(v) = row.try_get::<Option<String>, _>(i) {
                return v;
            }
            if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
                return v.map(|x| x.to_string());
            }
            if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
                return v.map(|x| x.to_string());
            }
            if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
                return v.map(|x| x.to_string());
            }
            if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
                return v.map(|x| (x as i32).to_string());
            }
            None
        })
        .collect()
}

fn mysql_row_values(row: &MySqlRow) -> Row {
    (0..row.columns().len())
        .map(|i| {
            if let Ok(v) = row.try_get::<Option<String>, _>(i) {
                return v;
            }
            if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
                return v.map(|x| x.to_string());
            }
            if let Ok(v) = row.try_get::<Option<u64>, _>(i) {
                return v.map(|x| x.to_string());
            }
            if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
                return v.map(|x| x.to_string());
            }
            if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
                return v.map(|b| String::from_utf8_lossy(&b).into_owned());
            }
            None
        })
        .collect()
}
