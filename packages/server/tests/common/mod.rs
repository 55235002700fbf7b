//! Shared helpers for integration tests: a file-backed sqlite config in a
//! temp dir, and a small registry with a historied test entity.

use std::path::Path;

use keelson_core::kernel::storage::{EntityDescriptor, EntityRegistry, FieldDef};
use keelson_core::Config;

pub fn test_config(data_dir: &Path) -> Config {
    Config {
        database_url: format!("sqlite://{}", data_dir.join("test.db").display()),
        redis_url: None,
        kv_prefix: "keelson-test".into(),
        port: 0,
        jwt_secret: "integration-test-secret".into(),
        data_dir: data_dir.to_path_buf(),
        allowed_origins: vec![],
        pool_min_connections: 1,
        pool_max_connections: 5,
        pool_acquire_timeout_secs: 5,
        allow_column_deletion: false,
        allow_table_deletion: false,
        registration_enabled: true,
        admin_emails: vec!["root@example.com".into()],
        access_token_ttl_secs: 3600,
        refresh_token_ttl_secs: 86400,
        rate_limit_window_secs: 60,
        rate_limit_anonymous: 1000,
        rate_limit_authenticated: 1000,
        rate_limit_admin: 1000,
        idempotency_ttl_secs: 3600,
        idempotency_exclude_paths: vec!["/stream".into()],
        stream_lease_limit: 2,
        stream_lease_ttl_secs: 60,
        worker_concurrency: 0,
        worker_queues: vec!["default".into()],
        debug_errors: false,
    }
}

pub fn notes_registry() -> EntityRegistry {
    let mut registry = EntityRegistry::new();
    registry.register(
        EntityDescriptor::new("notes")
            .field(FieldDef::text("text").not_null())
            .field(FieldDef::text("author").indexed())
            .field(FieldDef::integer("stars").default_value("0")),
    );
    registry
}
