//! Replay of migration audit files.
//!
//! Audit files are backend-agnostic (neutral `[bracket]` SQL), so a dump of
//! `migrations_audit/` replayed from empty reproduces the schema on any
//! supported backend. Used by full rollback and by operators moving between
//! backends.

use std::path::Path;

use tracing::{info, warn};

use crate::common::{KernelError, KernelResult};
use crate::kernel::storage::Database;

use super::{is_idempotent_migration_error, is_missing_table_error};

/// Split one audit file into executable statements. Comment lines are
/// dropped; statements are separated by `;` at line end.
pub fn parse_statements(contents: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        if current.trim_end().ends_with(';') {
            let stmt = current.trim().trim_end_matches(';').trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current.clear();
        } else {
            current.push('\n');
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.trim_end_matches(';').trim().to_string());
    }
    statements
}

/// Execute every statement of one audit file with the same idempotent-error
/// policy as live migration.
pub async fn replay_migration(db: &Database, path: &Path) -> KernelResult<usize> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| KernelError::Internal(anyhow::anyhow!("read {}: {}", path.display(), e)))?;
    let statements = parse_statements(&contents);
    let mut executed = 0;

    for statement in &statements {
        match db.execute(statement, &[]).await {
            Ok(_) => executed += 1,
            Err(err) if is_idempotent_migration_error(&err) => {}
            Err(err) if is_missing_table_error(&err) => {
                warn!(file = %path.display(), error = %err, "replay statement skipped");
            }
            Err(err) => {
                return Err(KernelError::Internal(anyhow::anyhow!(
                    "replay of {} failed: {}",
                    path.display(),
                    err
                )));
            }
        }
    }

    info!(file = %path.display(), statements = executed, "replayed migration");
    Ok(executed)
}
