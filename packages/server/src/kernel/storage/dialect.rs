//! Per-backend SQL generation and neutral-SQL translation.
//!
//! Higher layers emit SQL in a neutral dialect: `[identifier]` for quoted
//! identifiers and `?` for parameters (`??` escapes a literal question
//! mark). Each backend translates to its native quoting and placeholder
//! scheme before execution, and supplies the statements whose syntax
//! genuinely differs (upserts, insert-ignore, catalog queries).

use super::registry::{EntityDescriptor, FieldDef, HISTORY_COLUMNS, SYSTEM_COLUMNS};

/// The supported storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
    MySql,
}

impl Backend {
    pub fn from_url(url: &str) -> Backend {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Backend::Postgres
        } else if url.starts_with("mysql://") {
            Backend::MySql
        } else {
            Backend::Sqlite
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
            Backend::MySql => "mysql",
        }
    }

    pub fn parse(raw: &str) -> Option<Backend> {
        match raw.trim() {
            "sqlite" => Some(Backend::Sqlite),
            "postgres" => Some(Backend::Postgres),
            "mysql" => Some(Backend::MySql),
            _ => None,
        }
    }

    pub fn dialect(&self) -> Box<dyn SqlDialect> {
        match self {
            Backend::Sqlite => Box::new(SqliteDialect),
            Backend::Postgres => Box::new(PostgresDialect),
            Backend::MySql => Box::new(MySqlDialect),
        }
    }
}

pub trait SqlDialect: Send + Sync {
    fn backend(&self) -> Backend;

    /// Native quoting for one identifier.
    fn quote(&self, ident: &str) -> String;

    /// Native placeholder for the 1-based parameter index.
    fn placeholder(&self, index: usize) -> String;

    /// Translate neutral `[ident]` / `?` SQL to the native dialect.
    /// String literals are left untouched; `??` becomes a literal `?`.
    fn to_native(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len() + 16);
        let mut chars = sql.chars().peekable();
        let mut in_string = false;
        let mut param_index = 0usize;

        while let Some(c) = chars.next() {
            if in_string {
                out.push(c);
                if c == '\'' {
                    // '' is an escaped quote inside the literal
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
                '[' => {
                    let mut ident = String::new();
                    for ic in chars.by_ref() {
                        if ic == ']' {
                            break;
                        }
                        ident.push(ic);
                    }
                    out.push_str(&self.quote(&ident));
                }
                '?' => {
                    if chars.peek() == Some(&'?') {
                        chars.next();
                        out.push('?');
                    } else {
                        param_index += 1;
                        out.push_str(&self.placeholder(param_index));
                    }
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Upsert by primary key `id`, updating every non-id field.
    fn upsert_sql(&self, table: &str, fields: &[String]) -> String;

    /// `INSERT ... SELECT` that silently skips rows violating the primary
    /// key. Used by rename backfills and CSV import.
    fn insert_ignore_sql(&self, table: &str, columns: &[String], select_sql: &str) -> String;

    /// Catalog query returning one row per table with the name in column 0.
    fn list_tables_sql(&self) -> String;

    /// Catalog query returning `(column_name, data_type)` rows for a table.
    /// Takes the table name as its single parameter.
    fn list_columns_sql(&self) -> String;

    // ------------------------------------------------------------------
    // Neutral-SQL statement builders shared by all backends
    // ------------------------------------------------------------------

    fn create_table_sql(&self, table: &str, columns: &[(String, String)]) -> String {
        let cols: Vec<String> = columns
            .iter()
            .map(|(name, typedef)| format!("[{}] {}", name, typedef))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS [{}] ({})",
            table,
            cols.join(", ")
        )
    }

    /// Column definition for a monotonically assigned integer primary key.
    fn autoincrement_primary_key(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }

    fn create_meta_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS [{}_meta] ([name] TEXT PRIMARY KEY, [type] TEXT)",
            table
        )
    }

    fn meta_upsert_sql(&self, table: &str) -> String;

    fn entity_by_id_sql(&self, table: &str, columns: &[String], include_deleted: bool) -> String {
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        let mut sql = format!("SELECT {} FROM [{}] WHERE [id] = ?", cols.join(", "), table);
        if !include_deleted {
            sql.push_str(" AND [deleted_at] IS NULL");
        }
        sql
    }

    fn soft_delete_sql(&self, table: &str) -> String {
        format!(
            "UPDATE [{}] SET [deleted_at] = ?, [updated_at] = ?, [updated_by] = ? WHERE [id] = ? AND [deleted_at] IS NULL",
            table
        )
    }

    fn restore_entity_sql(&self, table: &str) -> String {
        format!(
            "UPDATE [{}] SET [deleted_at] = NULL, [updated_at] = ?, [updated_by] = ? WHERE [id] = ?",
            table
        )
    }

    fn add_column_sql(&self, table: &str, column: &str, typedef: &str) -> String {
        format!("ALTER TABLE [{}] ADD COLUMN [{}] {}", table, column, typedef)
    }

    fn drop_column_sql(&self, table: &str, column: &str) -> String {
        format!("ALTER TABLE [{}] DROP COLUMN [{}]", table, column)
    }

    fn create_index_sql(&self, table: &str, column: &str) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS [idx_{}_{}] ON [{}]([{}])",
            table, column, table, column
        )
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS [{}]", table)
    }
}

/// Column type definition for DDL: storage type plus preserved constraints.
/// History tables strip UNIQUE/NOT NULL/CHECK (append-only audit enforces no
/// business rules) but keep DEFAULT.
pub fn column_typedef(field: &FieldDef, for_history: bool) -> String {
    // Entity values are serialized before INSERT; storage is always TEXT.
    let mut typedef = String::from("TEXT");
    if !for_history {
        if field.unique {
            typedef.push_str(" UNIQUE");
        }
        if !field.nullable {
            typedef.push_str(" NOT NULL");
        }
    }
    if let Some(default) = &field.default {
        typedef.push_str(&format!(" DEFAULT '{}'", default.replace('\'', "''")));
    }
    if !for_history {
        if let Some(check) = &field.check_expr {
            typedef.push_str(&format!(" CHECK ({})", check));
        }
    }
    typedef
}

/// Full column list for CREATE TABLE: id, user fields, system columns.
pub fn table_columns(descriptor: &EntityDescriptor) -> Vec<(String, String)> {
    let mut columns = vec![("id".to_string(), "TEXT PRIMARY KEY".to_string())];
    for field in &descriptor.fields {
        columns.push((field.name.clone(), column_typedef(field, false)));
    }
    for system in SYSTEM_COLUMNS.iter().skip(1) {
        columns.push((system.to_string(), "TEXT".to_string()));
    }
    columns
}

/// Column list for the history table: no PRIMARY KEY on id, constraints
/// stripped, version/audit columns appended.
pub fn history_table_columns(descriptor: &EntityDescriptor) -> Vec<(String, String)> {
    let mut columns = vec![("id".to_string(), "TEXT NOT NULL".to_string())];
    for field in &descriptor.fields {
        columns.push((field.name.clone(), column_typedef(field, true)));
    }
    for system in SYSTEM_COLUMNS.iter().skip(1) {
        columns.push((system.to_string(), "TEXT".to_string()));
    }
    for (name, typedef) in HISTORY_COLUMNS.iter().zip([
        "INTEGER NOT NULL",
        "TEXT NOT NULL",
        "TEXT",
        "TEXT",
    ]) {
        columns.push((name.to_string(), typedef.to_string()));
    }
    columns
}

// ============================================================================
// SQLite
// ============================================================================

pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident)
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn upsert_sql(&self, table: &str, fields: &[String]) -> String {
        let cols: Vec<String> = fields.iter().map(|f| format!("[{}]", f)).collect();
        let params: Vec<&str> = fields.iter().map(|_| "?").collect();
        let updates: Vec<String> = fields
            .iter()
            .filter(|f| f.as_str() != "id")
            .map(|f| format!("[{}] = excluded.[{}]", f, f))
            .collect();
        format!(
            "INSERT INTO [{}] ({}) VALUES ({}) ON CONFLICT([id]) DO UPDATE SET {}",
            table,
            cols.join(", "),
            params.join(", "),
            updates.join(", ")
        )
    }

    fn insert_ignore_sql(&self, table: &str, columns: &[String], select_sql: &str) -> String {
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        format!(
            "INSERT OR IGNORE INTO [{}] ({}) {}",
            table,
            cols.join(", "),
            select_sql
        )
    }

    fn list_tables_sql(&self) -> String {
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'"
            .to_string()
    }

    fn list_columns_sql(&self) -> String {
        "SELECT name, type FROM pragma_table_info(?)".to_string()
    }

    fn meta_upsert_sql(&self, table: &str) -> String {
        format!(
            "INSERT INTO [{}_meta] ([name], [type]) VALUES (?, ?) ON CONFLICT([name]) DO UPDATE SET [type] = excluded.[type]",
            table
        )
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident)
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn upsert_sql(&self, table: &str, fields: &[String]) -> String {
        let cols: Vec<String> = fields.iter().map(|f| format!("[{}]", f)).collect();
        let params: Vec<&str> = fields.iter().map(|_| "?").collect();
        let updates: Vec<String> = fields
            .iter()
            .filter(|f| f.as_str() != "id")
            .map(|f| format!("[{}] = EXCLUDED.[{}]", f, f))
            .collect();
        format!(
            "INSERT INTO [{}] ({}) VALUES ({}) ON CONFLICT ([id]) DO UPDATE SET {}",
            table,
            cols.join(", "),
            params.join(", "),
            updates.join(", ")
        )
    }

    fn insert_ignore_sql(&self, table: &str, columns: &[String], select_sql: &str) -> String {
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        format!(
            "INSERT INTO [{}] ({}) {} ON CONFLICT ([id]) DO NOTHING",
            table,
            cols.join(", "),
            select_sql
        )
    }

    fn autoincrement_primary_key(&self) -> &'static str {
        "BIGSERIAL PRIMARY KEY"
    }

    fn list_tables_sql(&self) -> String {
        "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public' AND table_type = 'BASE TABLE'"
            .to_string()
    }

    fn list_columns_sql(&self) -> String {
        "SELECT column_name, data_type FROM information_schema.columns WHERE table_schema = 'public' AND table_name = ? ORDER BY ordinal_position"
            .to_string()
    }

    fn meta_upsert_sql(&self, table: &str) -> String {
        format!(
            "INSERT INTO [{}_meta] ([name], [type]) VALUES (?, ?) ON CONFLICT ([name]) DO UPDATE SET [type] = EXCLUDED.[type]",
            table
        )
    }
}

// ============================================================================
// MySQL
// ============================================================================

pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn backend(&self) -> Backend {
        Backend::MySql
    }

    fn quote(&self, ident: &str) -> String {
        format!("`{}`", ident)
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn upsert_sql(&self, table: &str, fields: &[String]) -> String {
        let cols: Vec<String> = fields.iter().map(|f| format!("[{}]", f)).collect();
        let params: Vec<&str> = fields.iter().map(|_| "?").collect();
        let updates: Vec<String> = fields
            .iter()
            .filter(|f| f.as_str() != "id")
            .map(|f| format!("[{}] = VALUES([{}])", f, f))
            .collect();
        format!(
            "INSERT INTO [{}] ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            table,
            cols.join(", "),
            params.join(", "),
            updates.join(", ")
        )
    }

    fn insert_ignore_sql(&self, table: &str, columns: &[String], select_sql: &str) -> String {
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        format!(
            "INSERT IGNORE INTO [{}] ({}) {}",
            table,
            cols.join(", "),
            select_sql
        )
    }

    fn autoincrement_primary_key(&self) -> &'static str {
        "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"
    }

    fn list_tables_sql(&self) -> String {
        "SELECT table_name FROM information_schema.tables WHERE table_schema = DATABASE()"
            .to_string()
    }

    fn list_columns_sql(&self) -> String {
        "SELECT column_name, data_type FROM information_schema.columns WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ordinal_position"
            .to_string()
    }

    fn meta_upsert_sql(&self, table: &str) -> String {
        format!(
            "INSERT INTO [{}_meta] ([name], [type]) VALUES (?, ?) ON DUPLICATE KEY UPDATE [type] = VALUES([type])",
            table
        )
    }

    fn create_index_sql(&self, table: &str, column: &str) -> String {
        // MySQL has no CREATE INDEX IF NOT EXISTS; duplicate-key errors are
        // swallowed by the idempotent-migration filter instead.
        format!(
            "CREATE INDEX [idx_{}_{}] ON [{}]([{}])",
            table, column, table, column
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::storage::registry::FieldDef;

    #[test]
    fn sqlite_translation_quotes_and_placeholders() {
        let dialect = SqliteDialect;
        let native = dialect.to_native("SELECT [id] FROM [users] WHERE [email] = ?");
        assert_eq!(native, "SELECT \"id\" FROM \"users\" WHERE \"email\" = ?");
    }

    #[test]
    fn postgres_placeholders_are_numbered() {
        let dialect = PostgresDialect;
        let native = dialect.to_native("UPDATE [t] SET [a] = ?, [b] = ? WHERE [id] = ?");
        assert_eq!(native, "UPDATE \"t\" SET \"a\" = $1, \"b\" = $2 WHERE \"id\" = $3");
    }

    #[test]
    fn mysql_uses_backticks() {
        let dialect = MySqlDialect;
        let native = dialect.to_native("SELECT [name] FROM [t] WHERE [x] = ?");
        assert_eq!(native, "SELECT `name` FROM `t` WHERE `x` = ?");
    }

    #[test]
    fn double_question_mark_escapes() {
        let dialect = PostgresDialect;
        let native = dialect.to_native("SELECT [a] FROM [t] WHERE [q] = '??' AND [b] = ?");
        // Inside the string literal nothing is touched; outside, ?? would
        // collapse to a literal ?.
        assert_eq!(
            native,
            "SELECT \"a\" FROM \"t\" WHERE \"q\" = '??' AND \"b\" = $1"
        );
        let escaped = dialect.to_native("SELECT ?? , ?");
        assert_eq!(escaped, "SELECT ? , $1");
    }

    #[test]
    fn string_literals_are_left_alone() {
        let dialect = SqliteDialect;
        let native = dialect.to_native("SELECT [a] FROM [t] WHERE [b] = 'it''s [not] a ?'");
        assert_eq!(
            native,
            "SELECT \"a\" FROM \"t\" WHERE \"b\" = 'it''s [not] a ?'"
        );
    }

    #[test]
    fn history_typedef_strips_constraints_keeps_default() {
        let field = FieldDef::text("status")
            .not_null()
            .unique()
            .default_value("pending")
            .check("[status] IN ('pending', 'done')");

        let main = column_typedef(&field, false);
        assert!(main.contains("NOT NULL"));
        assert!(main.contains("UNIQUE"));
        assert!(main.contains("CHECK"));
        assert!(main.contains("DEFAULT 'pending'"));

        let history = column_typedef(&field, true);
        assert_eq!(history, "TEXT DEFAULT 'pending'");
    }

    #[test]
    fn upsert_sql_excludes_id_from_update() {
        let dialect = SqliteDialect;
        let sql = dialect.upsert_sql("users", &["id".into(), "email".into()]);
        assert!(sql.contains("ON CONFLICT([id]) DO UPDATE SET [email] = excluded.[email]"));
        assert!(!sql.contains("[id] = excluded"));
    }

    #[test]
    fn backend_detection_from_url() {
        assert_eq!(Backend::from_url("sqlite://x.db"), Backend::Sqlite);
        assert_eq!(Backend::from_url("postgres://h/db"), Backend::Postgres);
        assert_eq!(Backend::from_url("postgresql://h/db"), Backend::Postgres);
        assert_eq!(Backend::from_url("mysql://h/db"), Backend::MySql);
        assert_eq!(Backend::from_url("./file.db"), Backend::Sqlite);
    }
}
