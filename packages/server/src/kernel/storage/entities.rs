//! Generic entity CRUD over the neutral storage interface.
//!
//! Entities are JSON objects persisted into all-TEXT columns; field values
//! are serialized before INSERT and deserialized on read using the declared
//! field types. Every write runs inside a transaction on one pooled
//! connection and mirrors the row into the entity's append-only history
//! table at `max(version) + 1`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::common::{db_id, KernelError, KernelResult};

use super::database::{Database, DbTransaction, Row};
use super::registry::{is_system_column, EntityDescriptor, EntityRegistry, FieldType};

/// Chunk size for `IN (...)` lists. SQLite caps host parameters near 999;
/// 900 leaves room for the other predicates.
const IN_CHUNK_SIZE: usize = 900;

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Serialize one field value to its TEXT representation.
pub fn serialize_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Deserialize a TEXT value back to JSON using the declared type.
pub fn deserialize_value(raw: Option<String>, declared: FieldType) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match declared {
        FieldType::Text => Value::String(raw),
        FieldType::Integer => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        FieldType::Real => raw
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(Value::String(raw)),
        FieldType::Boolean => match raw.as_str() {
            "1" | "true" | "True" => Value::Bool(true),
            "0" | "false" | "False" => Value::Bool(false),
            _ => Value::String(raw),
        },
        FieldType::Json => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
    }
}

/// Entity store: typed CRUD plus history bookkeeping for every registered
/// entity table.
#[derive(Clone)]
pub struct EntityStore {
    db: Arc<Database>,
    registry: Arc<EntityRegistry>,
}

impl EntityStore {
    pub fn new(db: Arc<Database>, registry: Arc<EntityRegistry>) -> Self {
        Self { db, registry }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    fn descriptor(&self, table: &str) -> KernelResult<&EntityDescriptor> {
        self.registry
            .get(table)
            .ok_or_else(|| KernelError::Validation(format!("unknown entity table: {}", table)))
    }

    /// Add system fields: id, timestamps, audit users. Unknown fields are
    /// rejected so typos cannot silently drop data.
    fn prepare(
        &self,
        descriptor: &EntityDescriptor,
        entity: &Value,
        user_id: Option<&str>,
    ) -> KernelResult<Map<String, Value>> {
        let Some(object) = entity.as_object() else {
            return Err(KernelError::Validation(
                "entity must be a JSON object".into(),
            ));
        };
        for key in object.keys() {
            if !is_system_column(key) && descriptor.field_named(key).is_none() {
                return Err(KernelError::Validation(format!(
                    "unknown field '{}' for entity '{}'",
                    key, descriptor.table_name
                )));
            }
        }

        let mut prepared = object.clone();
        let now = now_iso();
        let is_new = !prepared.contains_key("id")
            || prepared.get("id").map(|v| v.is_null()).unwrap_or(true);
        if is_new {
            prepared.insert("id".into(), Value::String(db_id()));
            prepared.insert("created_at".into(), Value::String(now.clone()));
            if let Some(uid) = user_id {
                prepared.insert("created_by".into(), Value::String(uid.to_string()));
            }
        } else if !prepared.contains_key("created_at") {
            prepared.insert("created_at".into(), Value::String(now.clone()));
        }
        prepared.insert("updated_at".into(), Value::String(now));
        if let Some(uid) = user_id {
            prepared.insert("updated_by".into(), Value::String(uid.to_string()));
        }
        Ok(prepared)
    }

    fn serialize_fields(prepared: &Map<String, Value>) -> BTreeMap<String, Option<String>> {
        prepared
            .iter()
            .map(|(k, v)| (k.clone(), serialize_value(v)))
            .collect()
    }

    fn row_to_value(&self, descriptor: &EntityDescriptor, columns: &[String], row: Row) -> Value {
        let mut object = Map::new();
        for (column, raw) in columns.iter().zip(row) {
            let declared = descriptor
                .field_named(column)
                .map(|f| f.declared_type)
                .unwrap_or(FieldType::Text);
            object.insert(column.clone(), deserialize_value(raw, declared));
        }
        Value::Object(object)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get(
        &self,
        table: &str,
        id: &str,
        include_deleted: bool,
    ) -> KernelResult<Option<Value>> {
        let descriptor = self.descriptor(table)?;
        let columns = descriptor.all_columns();
        let sql = self
            .db
            .dialect()
            .entity_by_id_sql(table, &columns, include_deleted);
        let mut rows = self.db.fetch_all(&sql, &[Some(id.to_string())]).await?;
        Ok(rows
            .pop()
            .map(|row| self.row_to_value(descriptor, &columns, row)))
    }

    /// Fetch many entities by ID in one logical call. IDs are deduplicated
    /// and chunked to stay under backend parameter limits; result order is
    /// not guaranteed.
    pub async fn get_many(
        &self,
        table: &str,
        ids: &[String],
        include_deleted: bool,
    ) -> KernelResult<Vec<Value>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut unique: Vec<String> = ids.to_vec();
        unique.sort();
        unique.dedup();

        let mut results = Vec::with_capacity(unique.len());
        for chunk in unique.chunks(IN_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let where_clause = format!("[id] IN ({})", placeholders);
            let params: Vec<Option<String>> = chunk.iter().map(|id| Some(id.clone())).collect();
            let mut rows = self
                .find(table, Some(&where_clause), &params, None, None, None, include_deleted)
                .await?;
            results.append(&mut rows);
        }
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn find(
        &self,
        table: &str,
        where_clause: Option<&str>,
        params: &[Option<String>],
        order_by: Option<&str>,
        limit: Option<u32>,
        offset: Option<u32>,
        include_deleted: bool,
    ) -> KernelResult<Vec<Value>> {
        let descriptor = self.descriptor(table)?;
        let columns = descriptor.all_columns();
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();

        let mut sql = format!("SELECT {} FROM [{}]", cols.join(", "), table);
        let mut predicates = Vec::new();
        if !include_deleted {
            predicates.push("[deleted_at] IS NULL".to_string());
        }
        if let Some(clause) = where_clause {
            predicates.push(format!("({})", clause));
        }
        if !predicates.is_empty() {
            sql.push_str(&format!(" WHERE {}", predicates.join(" AND ")));
        }
        if let Some(order) = order_by {
            sql.push_str(&format!(" ORDER BY {}", order));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        } else if offset.is_some() {
            // OFFSET needs a LIMIT clause on sqlite/mysql.
            sql.push_str(&format!(" LIMIT {}", i64::MAX));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        let rows = self.db.fetch_all(&sql, params).await?;
        Ok(rows
            .into_iter()
            .map(|row| self.row_to_value(descriptor, &columns, row))
            .collect())
    }

    pub async fn count(
        &self,
        table: &str,
        where_clause: Option<&str>,
        params: &[Option<String>],
        include_deleted: bool,
    ) -> KernelResult<u64> {
        self.descriptor(table)?;
        let mut sql = format!("SELECT COUNT(*) FROM [{}]", table);
        let mut predicates = Vec::new();
        if !include_deleted {
            predicates.push("[deleted_at] IS NULL".to_string());
        }
        if let Some(clause) = where_clause {
            predicates.push(format!("({})", clause));
        }
        if !predicates.is_empty() {
            sql.push_str(&format!(" WHERE {}", predicates.join(" AND ")));
        }
        let rows = self.db.fetch_all(&sql, params).await?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_ref())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Upsert one entity and append its history row. Returns the entity as
    /// stored, including generated id and timestamps.
    pub async fn save(
        &self,
        table: &str,
        entity: Value,
        user_id: Option<&str>,
        comment: Option<&str>,
    ) -> KernelResult<Value> {
        let mut saved = self
            .save_many(table, vec![entity], user_id, comment)
            .await?;
        saved
            .pop()
            .ok_or_else(|| KernelError::Internal(anyhow::anyhow!("save returned no entity")))
    }

    /// Batch upsert: one upsert statement per entity inside a single
    /// transaction, then one version lookup and one history insert batch.
    pub async fn save_many(
        &self,
        table: &str,
        entities: Vec<Value>,
        user_id: Option<&str>,
        comment: Option<&str>,
    ) -> KernelResult<Vec<Value>> {
        if entities.is_empty() {
            return Ok(vec![]);
        }
        let descriptor = self.descriptor(table)?;
        let columns = descriptor.all_columns();

        let mut prepared_all = Vec::with_capacity(entities.len());
        for entity in &entities {
            prepared_all.push(self.prepare(descriptor, entity, user_id)?);
        }
        let ids: Vec<String> = prepared_all
            .iter()
            .map(|p| {
                p.get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();

        let mut tx = self.db.begin().await?;

        // Upsert exactly the fields provided on each entity.
        for prepared in &prepared_all {
            let serialized = Self::serialize_fields(prepared);
            let fields: Vec<String> = serialized.keys().cloned().collect();
            let sql = self.db.dialect().upsert_sql(table, &fields);
            let params: Vec<Option<String>> = fields
                .iter()
                .map(|f| serialized.get(f).cloned().flatten())
                .collect();
            self.db.tx_execute(&mut tx, &sql, &params).await?;
        }

        // Read the rows back so history mirrors the full stored state.
        let placeholders = vec!["?"; ids.len()].join(",");
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        let select_sql = format!(
            "SELECT {} FROM [{}] WHERE [id] IN ({})",
            cols.join(", "),
            table,
            placeholders
        );
        let id_params: Vec<Option<String>> = ids.iter().map(|id| Some(id.clone())).collect();
        let stored_rows = self.db.tx_fetch_all(&mut tx, &select_sql, &id_params).await?;

        if descriptor.keep_history {
            self.append_history_rows(
                &mut tx,
                descriptor,
                &columns,
                &ids,
                &stored_rows,
                user_id,
                comment,
            )
            .await?;
        }

        tx.commit().await?;

        Ok(stored_rows
            .into_iter()
            .map(|row| self.row_to_value(descriptor, &columns, row))
            .collect())
    }

    /// One version lookup and one batched history insert for a set of rows
    /// already written in this transaction.
    #[allow(clippy::too_many_arguments)]
    async fn append_history_rows(
        &self,
        tx: &mut DbTransaction,
        descriptor: &EntityDescriptor,
        columns: &[String],
        ids: &[String],
        stored_rows: &[Row],
        user_id: Option<&str>,
        comment: Option<&str>,
    ) -> KernelResult<()> {
        let history_table = descriptor.history_table();
        let placeholders = vec!["?"; ids.len()].join(",");
        let version_sql = format!(
            "SELECT [id], MAX([version]) FROM [{}] WHERE [id] IN ({}) GROUP BY [id]",
            history_table, placeholders
        );
        let id_params: Vec<Option<String>> = ids.iter().map(|id| Some(id.clone())).collect();
        let version_rows = self.db.tx_fetch_all(tx, &version_sql, &id_params).await?;
        let mut versions: BTreeMap<String, i64> = BTreeMap::new();
        for row in version_rows {
            let mut it = row.into_iter();
            if let (Some(Some(id)), Some(Some(version))) = (it.next(), it.next()) {
                if let Ok(v) = version.parse::<i64>() {
                    versions.insert(id, v);
                }
            }
        }

        let history_columns = descriptor.history_columns();
        let col_list: Vec<String> = history_columns.iter().map(|c| format!("[{}]", c)).collect();
        let param_list = vec!["?"; history_columns.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO [{}] ({}) VALUES ({})",
            history_table,
            col_list.join(", "),
            param_list
        );

        let now = now_iso();
        for row in stored_rows {
            let id = columns
                .iter()
                .position(|c| c == "id")
                .and_then(|i| row.get(i).cloned().flatten())
                .unwrap_or_default();
            let next_version = versions.get(&id).copied().unwrap_or(0) + 1;

            let mut params: Vec<Option<String>> = row.clone();
            params.push(Some(next_version.to_string()));
            params.push(Some(now.clone()));
            params.push(user_id.map(|u| u.to_string()));
            params.push(comment.map(|c| c.to_string()));
            self.db.tx_execute(tx, &insert_sql, &params).await?;
        }
        Ok(())
    }

    /// Soft-delete by default; `permanent` removes the row outright (history
    /// rows are never touched; audit survives deletes).
    pub async fn delete(
        &self,
        table: &str,
        id: &str,
        user_id: Option<&str>,
        permanent: bool,
    ) -> KernelResult<bool> {
        let descriptor = self.descriptor(table)?;

        if permanent {
            let affected = self
                .db
                .execute(
                    &format!("DELETE FROM [{}] WHERE [id] = ?", table),
                    &[Some(id.to_string())],
                )
                .await?;
            return Ok(affected > 0);
        }

        let Some(_current) = self.get(table, id, true).await? else {
            return Ok(false);
        };

        let now = now_iso();
        let sql = self.db.dialect().soft_delete_sql(table);
        let affected = self
            .db
            .execute(
                &sql,
                &[
                    Some(now.clone()),
                    Some(now),
                    user_id.map(|u| u.to_string()),
                    Some(id.to_string()),
                ],
            )
            .await?;
        if affected == 0 {
            return Ok(false);
        }

        if descriptor.keep_history {
            self.snapshot_to_history(table, id, user_id, Some("Soft deleted"))
                .await?;
        }
        Ok(true)
    }

    /// Restore a soft-deleted entity.
    pub async fn restore(
        &self,
        table: &str,
        id: &str,
        user_id: Option<&str>,
    ) -> KernelResult<bool> {
        let descriptor = self.descriptor(table)?;
        let Some(current) = self.get(table, id, true).await? else {
            return Ok(false);
        };
        if current.get("deleted_at").map(|v| v.is_null()).unwrap_or(true) {
            return Ok(false);
        }

        let now = now_iso();
        let sql = self.db.dialect().restore_entity_sql(table);
        self.db
            .execute(
                &sql,
                &[
                    Some(now),
                    user_id.map(|u| u.to_string()),
                    Some(id.to_string()),
                ],
            )
            .await?;

        if descriptor.keep_history {
            self.snapshot_to_history(table, id, user_id, Some("Restored"))
                .await?;
        }
        Ok(true)
    }

    /// Copy the current row into history at the next version.
    async fn snapshot_to_history(
        &self,
        table: &str,
        id: &str,
        user_id: Option<&str>,
        comment: Option<&str>,
    ) -> KernelResult<()> {
        let descriptor = self.descriptor(table)?;
        let columns = descriptor.all_columns();
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        let select_sql = format!(
            "SELECT {} FROM [{}] WHERE [id] = ?",
            cols.join(", "),
            table
        );

        let mut tx = self.db.begin().await?;
        let rows = self
            .db
            .tx_fetch_all(&mut tx, &select_sql, &[Some(id.to_string())])
            .await?;
        if !rows.is_empty() {
            self.append_history_rows(
                &mut tx,
                descriptor,
                &columns,
                &[id.to_string()],
                &rows,
                user_id,
                comment,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// All history rows for an entity, oldest version first.
    pub async fn history(&self, table: &str, id: &str) -> KernelResult<Vec<Value>> {
        let descriptor = self.descriptor(table)?;
        let columns = descriptor.history_columns();
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        let sql = format!(
            "SELECT {} FROM [{}] WHERE [id] = ? ORDER BY [version] ASC",
            cols.join(", "),
            descriptor.history_table()
        );
        let rows = self.db.fetch_all(&sql, &[Some(id.to_string())]).await?;
        Ok(rows
            .into_iter()
            .map(|row| self.history_row_to_value(descriptor, &columns, row))
            .collect())
    }

    pub async fn get_version(
        &self,
        table: &str,
        id: &str,
        version: i64,
    ) -> KernelResult<Option<Value>> {
        let descriptor = self.descriptor(table)?;
        let columns = descriptor.history_columns();
        let cols: Vec<String> = columns.iter().map(|c| format!("[{}]", c)).collect();
        let sql = format!(
            "SELECT {} FROM [{}] WHERE [id] = ? AND [version] = ?",
            cols.join(", "),
            descriptor.history_table()
        );
        let mut rows = self
            .db
            .fetch_all(&sql, &[Some(id.to_string()), Some(version.to_string())])
            .await?;
        Ok(rows
            .pop()
            .map(|row| self.history_row_to_value(descriptor, &columns, row)))
    }

    fn history_row_to_value(
        &self,
        descriptor: &EntityDescriptor,
        columns: &[String],
        row: Row,
    ) -> Value {
        let mut object = Map::new();
        for (column, raw) in columns.iter().zip(row) {
            let declared = if column == "version" {
                FieldType::Integer
            } else {
                descriptor
                    .field_named(column)
                    .map(|f| f.declared_type)
                    .unwrap_or(FieldType::Text)
            };
            object.insert(column.clone(), deserialize_value(raw, declared));
        }
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_roundtrip_for_declared_types() {
        assert_eq!(serialize_value(&Value::Bool(true)), Some("1".into()));
        assert_eq!(
            deserialize_value(Some("1".into()), FieldType::Boolean),
            Value::Bool(true)
        );
        assert_eq!(
            deserialize_value(Some("42".into()), FieldType::Integer),
            Value::from(42)
        );
        assert_eq!(
            deserialize_value(Some("{\"a\":1}".into()), FieldType::Json),
            serde_json::json!({"a": 1})
        );
        assert_eq!(deserialize_value(None, FieldType::Text), Value::Null);
    }

    #[test]
    fn unparseable_values_fall_back_to_text() {
        assert_eq!(
            deserialize_value(Some("not-a-number".into()), FieldType::Integer),
            Value::String("not-a-number".into())
        );
    }

    #[test]
    fn json_objects_serialize_compact() {
        let value = serde_json::json!({"nested": {"k": "v"}});
        let raw = serialize_value(&value).unwrap();
        assert_eq!(
            deserialize_value(Some(raw), FieldType::Json),
            serde_json::json!({"nested": {"k": "v"}})
        );
    }
}
