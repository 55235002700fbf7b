//! The application kernel: every subsystem constructed once at
//! `Kernel::init` and shared by reference through the runtime struct. No
//! module-init side effects; tests build their own instances per case.

pub mod auth;
pub mod backup;
pub mod jobs;
pub mod kv;
pub mod migrate;
pub mod reliability;
pub mod saas;
pub mod storage;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::{KernelError, KernelResult};
use crate::config::Config;

use auth::{users_entity, TokenService, UserStore};
use backup::restore;
use jobs::{JobQueue, TaskRegistry, WorkerConfig, WorkerPool};
use kv::{KvStore, MemoryKv, RedisKv};
use migrate::AutoMigrator;
use reliability::{
    IdempotencyConfig, IdempotencyStore, RateLimitConfig, RateLimiter, StreamLeaseConfig,
    StreamLeaseLimiter,
};
use saas::{
    invites_entity, members_entity, workspaces_entity, InviteStore, MemberStore, WorkspaceAccess,
    WorkspaceStore,
};
use storage::{Database, EntityRegistry, EntityStore};

pub use migrate::{MigrationRecord, MigrationReport};

// ============================================================================
// Health checks
// ============================================================================

type HealthFuture = Pin<Box<dyn Future<Output = (bool, String)> + Send>>;
type HealthCheckFn = Box<dyn Fn() -> HealthFuture + Send + Sync>;

/// Named readiness checks, run concurrently by `/readyz`.
#[derive(Default)]
pub struct HealthRegistry {
    checks: Vec<(String, HealthCheckFn)>,
}

impl HealthRegistry {
    pub fn register<F, Fut>(&mut self, name: &str, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (bool, String)> + Send + 'static,
    {
        self.checks
            .push((name.to_string(), Box::new(move || Box::pin(check()))));
    }

    pub async fn run_all(&self) -> (bool, BTreeMap<String, String>) {
        let futures = self.checks.iter().map(|(name, check)| {
            let name = name.clone();
            async move {
                let (ok, message) = check().await;
                (name, ok, message)
            }
        });
        let results = futures::future::join_all(futures).await;

        let mut healthy = true;
        let mut report = BTreeMap::new();
        for (name, ok, message) in results {
            if !ok {
                healthy = false;
            }
            report.insert(name, message);
        }
        (healthy, report)
    }
}

// ============================================================================
// Kernel runtime
// ============================================================================

pub struct Kernel {
    pub config: Config,
    pub db: Arc<Database>,
    pub kv: Arc<dyn KvStore>,
    pub registry: Arc<EntityRegistry>,
    pub entities: EntityStore,
    pub jobs: Arc<JobQueue>,
    pub tasks: Arc<TaskRegistry>,
    pub tokens: Arc<TokenService>,
    pub users: Arc<UserStore>,
    pub workspaces: Arc<WorkspaceStore>,
    pub members: Arc<MemberStore>,
    pub invites: Arc<InviteStore>,
    pub access: Arc<WorkspaceAccess>,
    pub rate_limiter: Arc<RateLimiter>,
    pub idempotency: Arc<IdempotencyStore>,
    pub leases: Arc<StreamLeaseLimiter>,
    pub health: HealthRegistry,
}

impl Kernel {
    /// The kernel's own entities. Products extend this registry with their
    /// domain entities before calling `init`.
    pub fn base_registry() -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        registry.register(users_entity());
        registry.register(workspaces_entity());
        registry.register(members_entity());
        registry.register(invites_entity());
        registry
    }

    /// Construct the kernel: connect storage, run migrations, connect the
    /// key-value store, build every service. Migration failure aborts
    /// startup.
    pub async fn init(
        config: Config,
        registry: EntityRegistry,
        tasks: TaskRegistry,
    ) -> KernelResult<Arc<Kernel>> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("create data dir: {}", e)))?;

        let db = Database::connect(&config).await?;
        let registry = Arc::new(registry);

        let backend_swapped = Self::detect_backend_swap(&config, &db)?;

        let migrator = AutoMigrator::new(
            &db,
            &registry,
            config.migrations_audit_dir(),
            config.allow_column_deletion,
            config.allow_table_deletion,
        );
        let report = migrator.migrate(false).await?;
        info!(
            schema_hash = %&report.schema_hash[..8],
            applied = report.applied,
            backfilled = report.backfilled_rows,
            "schema migration complete"
        );

        if backend_swapped {
            Self::import_after_backend_swap(&config, &db).await;
        }
        Self::write_backend_sentinel(&config, &db)?;

        let kv: Arc<dyn KvStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisKv::connect(url).await?),
            None => {
                warn!("REDIS_URL not set, using in-process key-value store (single node only)");
                Arc::new(MemoryKv::new())
            }
        };

        let entities = EntityStore::new(db.clone(), registry.clone());
        let tasks = Arc::new(tasks);
        let jobs = Arc::new(JobQueue::new(kv.clone(), tasks.clone(), &config.kv_prefix));

        let tokens = Arc::new(TokenService::new(
            &config.jwt_secret,
            config.access_token_ttl_secs,
            config.refresh_token_ttl_secs,
        ));
        let users = UserStore::new(entities.clone());
        let workspaces = WorkspaceStore::new(entities.clone());
        let members = MemberStore::new(entities.clone());
        let invites = InviteStore::new(entities.clone());
        let access = WorkspaceAccess::new(members.clone());

        let rate_limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            RateLimitConfig {
                window_secs: config.rate_limit_window_secs,
                anonymous: config.rate_limit_anonymous,
                authenticated: config.rate_limit_authenticated,
                admin: config.rate_limit_admin,
                key_prefix: format!("{}:ratelimit", config.kv_prefix),
            },
        ));
        let idempotency = Arc::new(IdempotencyStore::new(
            kv.clone(),
            IdempotencyConfig {
                ttl_secs: config.idempotency_ttl_secs,
                key_prefix: format!("{}:idempotency", config.kv_prefix),
                exclude_paths: config.idempotency_exclude_paths.clone(),
            },
        ));
        let leases = Arc::new(StreamLeaseLimiter::new(
            kv.clone(),
            StreamLeaseConfig {
                limit: config.stream_lease_limit,
                ttl_secs: config.stream_lease_ttl_secs,
                key_prefix: format!("{}:stream_leases", config.kv_prefix),
            },
        ));

        let mut health = HealthRegistry::default();
        {
            let db = db.clone();
            health.register("database", move || {
                let db = db.clone();
                async move {
                    match db.fetch_all("SELECT 1", &[]).await {
                        Ok(_) => (true, "ok".to_string()),
                        Err(e) => (false, format!("query failed: {}", e)),
                    }
                }
            });
        }
        {
            let kv = kv.clone();
            health.register("kv", move || {
                let kv = kv.clone();
                async move {
                    match kv.ping().await {
                        Ok(_) => (true, "ok".to_string()),
                        Err(e) => (false, format!("ping failed: {}", e)),
                    }
                }
            });
        }

        Ok(Arc::new(Kernel {
            config,
            db,
            kv,
            registry,
            entities,
            jobs,
            tasks,
            tokens,
            users,
            workspaces,
            members,
            invites,
            access,
            rate_limiter,
            idempotency,
            leases,
            health,
        }))
    }

    /// Spawn the embedded worker pool. Deployments that run workers
    /// out-of-process skip this and run the same pool from their own binary.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut queues = self.tasks.queue_names();
        for queue in &self.config.worker_queues {
            if !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        let pool = Arc::new(WorkerPool::new(
            self.jobs.clone(),
            self.tasks.clone(),
            WorkerConfig {
                concurrency: self.config.worker_concurrency,
                queues,
                ..Default::default()
            },
        ));
        tokio::spawn(async move {
            if let Err(e) = pool.run(shutdown).await {
                error!(error = %e, "worker pool exited with error");
            }
        });
    }

    /// Compare the sentinel file against the live backend. A swap is only a
    /// warning; data is recovered from the latest CSV backup if one exists.
    fn detect_backend_swap(config: &Config, db: &Database) -> KernelResult<bool> {
        let sentinel = config.backend_sentinel();
        let Ok(recorded) = std::fs::read_to_string(&sentinel) else {
            return Ok(false);
        };
        let recorded = recorded.trim();
        if recorded.is_empty() || recorded == db.backend().name() {
            return Ok(false);
        }
        warn!(
            previous = %recorded,
            current = %db.backend().name(),
            "database backend changed since last run"
        );
        Ok(true)
    }

    async fn import_after_backend_swap(config: &Config, db: &Database) {
        let points = match restore::list_restore_points(
            &config.backup_dir(),
            &config.migrations_audit_dir(),
        ) {
            Ok(points) => points,
            Err(e) => {
                warn!(error = %e, "backend swap: no restore points available, continuing with empty database");
                return;
            }
        };
        let Some(latest) = points.first() else {
            warn!("backend swap: no CSV backup found, continuing with empty database");
            return;
        };
        match restore::import_csv_backup(db, &latest.csv_dir, true).await {
            Ok(tables) => {
                info!(backup = %latest.name(), tables = tables.len(), "imported latest CSV backup after backend swap");
            }
            Err(e) => {
                warn!(error = %e, "backend swap import failed, continuing with empty database");
            }
        }
    }

    fn write_backend_sentinel(config: &Config, db: &Database) -> KernelResult<()> {
        std::fs::write(config.backend_sentinel(), db.backend().name())
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("write backend sentinel: {}", e)))
    }
}
