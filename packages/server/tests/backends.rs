//! Live-backend integration tests: the Postgres dialect and the Redis
//! key-value store against real containers.
//!
//! Containers are started once on the first test and shared for the whole
//! run. The sqlite/MemoryKv suites cover behavior in depth; these tests
//! prove the same code paths hold on the network backends.

mod common;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

use keelson_core::kernel::jobs::{EnqueueOptions, JobPriority, JobQueue, TaskOptions, TaskRegistry};
use keelson_core::kernel::kv::{KvStore, RedisKv};
use keelson_core::kernel::migrate::AutoMigrator;
use keelson_core::kernel::storage::{Backend, Database, EntityStore};

use common::{notes_registry, test_config};

// =============================================================================
// Shared test infrastructure
// =============================================================================

/// Containers started once and reused by every test in this binary.
struct SharedBackends {
    db_url: String,
    redis_url: String,
    // Keep containers alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
    _redis: ContainerAsync<Redis>,
}

static SHARED: OnceCell<SharedBackends> = OnceCell::const_new();

impl SharedBackends {
    async fn init() -> Result<Self> {
        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;
        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgres://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let redis = Redis::default()
            .start()
            .await
            .context("Failed to start Redis container")?;
        let redis_host = redis.get_host().await?;
        let redis_port = redis.get_host_port_ipv4(6379).await?;
        let redis_url = format!("redis://{}:{}", redis_host, redis_port);

        Ok(Self {
            db_url,
            redis_url,
            _postgres: postgres,
            _redis: redis,
        })
    }

    async fn get() -> &'static Self {
        SHARED
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to start backend containers")
            })
            .await
    }
}

// =============================================================================
// Postgres storage
// =============================================================================

#[tokio::test]
async fn postgres_migrate_and_entity_roundtrip() {
    let infra = SharedBackends::get().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.database_url = infra.db_url.clone();

    let db = Database::connect(&config).await.unwrap();
    assert_eq!(db.backend(), Backend::Postgres);

    let registry = Arc::new(notes_registry());
    let migrator = AutoMigrator::new(&db, &registry, config.migrations_audit_dir(), false, false);
    migrator.migrate(false).await.unwrap();

    let tables = db.list_tables().await.unwrap();
    assert!(tables.contains(&"notes".to_string()));
    assert!(tables.contains(&"notes_history".to_string()));
    assert!(tables.contains(&"_schema_migrations".to_string()));

    // Applying the same schema again records nothing new.
    let report = migrator.migrate(false).await.unwrap();
    assert!(!report.applied);
    let migrations = AutoMigrator::list_migrations(&db).await.unwrap();
    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].schema_hash, registry.schema_hash());

    // The full entity path runs through the $N placeholder translation.
    let store = EntityStore::new(db.clone(), registry.clone());
    let saved = store
        .save(
            "notes",
            json!({"text": "on postgres", "author": "ada", "stars": 7}),
            Some("user-1"),
            None,
        )
        .await
        .unwrap();
    let id = saved["id"].as_str().unwrap().to_string();

    let fetched = store.get("notes", &id, false).await.unwrap().unwrap();
    assert_eq!(fetched["text"], json!("on postgres"));
    assert_eq!(fetched["stars"], json!(7));

    store
        .save("notes", json!({"id": id, "text": "updated"}), None, None)
        .await
        .unwrap();
    let history = store.history("notes", &id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1]["version"], json!(2));

    assert!(store.delete("notes", &id, None, false).await.unwrap());
    assert!(store.get("notes", &id, false).await.unwrap().is_none());
    assert!(store.get("notes", &id, true).await.unwrap().is_some());
}

// =============================================================================
// Redis key-value store
// =============================================================================

#[tokio::test]
async fn redis_sliding_window_and_leases() {
    let infra = SharedBackends::get().await;
    let kv = RedisKv::connect(&infra.redis_url).await.unwrap();
    kv.ping().await.unwrap();

    // Sliding window: the Lua script admits exactly `limit` requests.
    let window_key = format!("it:ratelimit:{}", Uuid::new_v4());
    for _ in 0..3 {
        let probe = kv.sliding_window_probe(&window_key, 60, 3).await.unwrap();
        assert!(probe.allowed);
    }
    let probe = kv.sliding_window_probe(&window_key, 60, 3).await.unwrap();
    assert!(!probe.allowed);
    assert_eq!(probe.count, 3);

    // Leases: capped acquire, refresh only while live, release frees a slot.
    let lease_key = format!("it:leases:{}", Uuid::new_v4());
    assert!(kv.lease_acquire(&lease_key, "l1", 60, 2).await.unwrap());
    assert!(kv.lease_acquire(&lease_key, "l2", 60, 2).await.unwrap());
    assert!(!kv.lease_acquire(&lease_key, "l3", 60, 2).await.unwrap());
    assert!(kv.lease_refresh(&lease_key, "l1", 60).await.unwrap());
    assert!(kv.zrem(&lease_key, "l1").await.unwrap());
    assert!(kv.lease_acquire(&lease_key, "l3", 60, 2).await.unwrap());
    assert!(!kv.lease_refresh(&lease_key, "l1", 60).await.unwrap());
}

#[tokio::test]
async fn redis_job_queue_dispatch() {
    let infra = SharedBackends::get().await;
    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(&infra.redis_url).await.unwrap());

    let mut registry = TaskRegistry::new();
    registry.register("echo", TaskOptions::default(), |ctx| async move {
        Ok(ctx.payload)
    });
    let registry = Arc::new(registry);

    // Unique prefix per run so reruns against the same container stay clean.
    let prefix = format!("it:{}", Uuid::new_v4());
    let queue = JobQueue::new(kv, registry, &prefix);

    let enqueue = |priority, id: &str| {
        let options = EnqueueOptions::builder().job_id(id).priority(priority).build();
        queue.enqueue("echo", json!({"n": id}), options)
    };
    enqueue(JobPriority::Low, "low-1").await.unwrap();
    enqueue(JobPriority::High, "high-1").await.unwrap();
    enqueue(JobPriority::Normal, "normal-1").await.unwrap();

    // Duplicate client job id is a no-op returning the existing record.
    let dup = enqueue(JobPriority::High, "high-1").await.unwrap();
    assert!(!dup.is_created());

    // Highest tier first, then FIFO; attempts count from the claim.
    let first = queue.claim("default").await.unwrap().unwrap();
    assert_eq!(first.job_id, "high-1");
    assert_eq!(first.attempts, 1);
    queue
        .complete(&first.job_id, Value::String("done".into()))
        .await
        .unwrap();

    let order: Vec<String> = [
        queue.claim("default").await.unwrap().unwrap().job_id,
        queue.claim("default").await.unwrap().unwrap().job_id,
    ]
    .into();
    assert_eq!(order, vec!["normal-1", "low-1"]);
    assert!(queue.claim("default").await.unwrap().is_none());

    let completed = queue.get("high-1").await.unwrap().unwrap();
    assert_eq!(completed.result, Some(Value::String("done".into())));

    let depths = queue.depths("default").await.unwrap();
    assert_eq!(depths.ready, 0);
    assert_eq!(depths.in_flight, 2); // normal-1 and low-1 still leased
}
