use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL. `sqlite://path`, `postgres://...` or `mysql://...`.
    pub database_url: String,
    /// Redis URL for queues / rate limits / idempotency. When unset the
    /// kernel falls back to an in-process store (single-node only).
    pub redis_url: Option<String>,
    /// Namespace prefix for every key in the shared store.
    pub kv_prefix: String,
    pub port: u16,
    pub jwt_secret: String,
    /// Root for persisted state: db file, `.db_backend` sentinel,
    /// `migrations_audit/` and `backups/`.
    pub data_dir: PathBuf,
    pub allowed_origins: Vec<String>,

    // Connection pool
    pub pool_min_connections: u32,
    pub pool_max_connections: u32,
    pub pool_acquire_timeout_secs: u64,

    // Migration policy
    pub allow_column_deletion: bool,
    pub allow_table_deletion: bool,

    // Auth policy
    pub registration_enabled: bool,
    /// Emails granted the admin role on registration.
    pub admin_emails: Vec<String>,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,

    // Reliability
    pub rate_limit_window_secs: u64,
    pub rate_limit_anonymous: u32,
    pub rate_limit_authenticated: u32,
    pub rate_limit_admin: u32,
    pub idempotency_ttl_secs: u64,
    /// Path prefixes excluded from idempotency capture (streaming routes).
    pub idempotency_exclude_paths: Vec<String>,
    pub stream_lease_limit: u32,
    pub stream_lease_ttl_secs: u64,

    // Worker pool
    pub worker_concurrency: usize,
    pub worker_queues: Vec<String>,

    /// Include error detail (source chains) in HTTP error bodies.
    pub debug_errors: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let data_dir: PathBuf = env::var("DATA_DIR").unwrap_or_else(|_| ".data".into()).into();

        Ok(Self {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| {
                format!("sqlite://{}", data_dir.join("keelson.db").display())
            }),
            redis_url: env::var("REDIS_URL").ok(),
            kv_prefix: env::var("KV_PREFIX").unwrap_or_else(|_| "keelson".into()),
            port: env_or("PORT", 8080u16)?,
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            data_dir,
            allowed_origins: env_list("ALLOWED_ORIGINS", &[]),

            pool_min_connections: env_or("DB_POOL_MIN", 1u32)?,
            pool_max_connections: env_or("DB_POOL_MAX", 10u32)?,
            pool_acquire_timeout_secs: env_or("DB_POOL_ACQUIRE_TIMEOUT_SECS", 30u64)?,

            allow_column_deletion: env_or("ALLOW_COLUMN_DELETION", false)?,
            allow_table_deletion: env_or("ALLOW_TABLE_DELETION", false)?,

            registration_enabled: env_or("REGISTRATION_ENABLED", true)?,
            admin_emails: env_list("ADMIN_EMAILS", &[]),
            access_token_ttl_secs: env_or("ACCESS_TOKEN_TTL_SECS", 3600i64)?,
            refresh_token_ttl_secs: env_or("REFRESH_TOKEN_TTL_SECS", 30 * 86400i64)?,

            rate_limit_window_secs: env_or("RATE_LIMIT_WINDOW_SECS", 60u64)?,
            rate_limit_anonymous: env_or("RATE_LIMIT_ANONYMOUS", 60u32)?,
            rate_limit_authenticated: env_or("RATE_LIMIT_AUTHENTICATED", 300u32)?,
            rate_limit_admin: env_or("RATE_LIMIT_ADMIN", 1000u32)?,
            idempotency_ttl_secs: env_or("IDEMPOTENCY_TTL_SECS", 86400u64)?,
            idempotency_exclude_paths: env_list("IDEMPOTENCY_EXCLUDE_PATHS", &["/stream", "/jobs/events"]),
            stream_lease_limit: env_or("STREAM_LEASE_LIMIT", 3u32)?,
            stream_lease_ttl_secs: env_or("STREAM_LEASE_TTL_SECS", 360u64)?,

            worker_concurrency: env_or("WORKER_CONCURRENCY", 4usize)?,
            worker_queues: env_list("WORKER_QUEUES", &["default"]),

            debug_errors: env_or("DEBUG_ERRORS", false)?,
        })
    }

    /// Directory holding append-only migration audit files.
    pub fn migrations_audit_dir(&self) -> PathBuf {
        self.data_dir.join("migrations_audit")
    }

    /// Directory holding CSV and native backups.
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Sentinel file recording which backend the data dir was written by.
    pub fn backend_sentinel(&self) -> PathBuf {
        self.data_dir.join(".db_backend")
    }
}
