// Keelson - Multi-Tenant Application Kernel
//
// This crate turns a bare axum router into a production service: authenticated
// request handling, durable background jobs, a schema-first entity store with
// automatic migration and point-in-time rollback, streaming concurrency caps,
// rate limiting and request idempotency, and a workspace/membership layer that
// product routes mount on top of.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
