//! Entity registry and schema fingerprinting.
//!
//! Entities declare their schema explicitly at startup; the registry is the
//! single source of truth the migration engine diffs against the live
//! database. Hashing is deterministic: sorted tables, sorted fields, stable
//! JSON, SHA-256.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Columns every entity table carries implicitly. They never appear in user
/// field lists and are skipped by the migration differ.
pub const SYSTEM_COLUMNS: [&str; 6] = [
    "id",
    "created_at",
    "updated_at",
    "deleted_at",
    "created_by",
    "updated_by",
];

/// Extra columns on history tables.
pub const HISTORY_COLUMNS: [&str; 4] = [
    "version",
    "history_timestamp",
    "history_user_id",
    "history_comment",
];

pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS.iter().any(|c| c.eq_ignore_ascii_case(name))
}

/// Declared type of an entity field. Storage is always TEXT (values are
/// serialized before INSERT); the declared type drives deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Boolean,
    Json,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Boolean => "boolean",
            FieldType::Json => "json",
        }
    }

    pub fn parse(raw: &str) -> FieldType {
        match raw.to_ascii_lowercase().as_str() {
            "integer" | "int" => FieldType::Integer,
            "real" | "float" => FieldType::Real,
            "boolean" | "bool" => FieldType::Boolean,
            "json" => FieldType::Json,
            _ => FieldType::Text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub declared_type: FieldType,
    pub default: Option<String>,
    pub nullable: bool,
    pub unique: bool,
    pub indexed: bool,
    pub check_expr: Option<String>,
    pub renamed_from: Option<String>,
}

impl FieldDef {
    pub fn new(name: &str, declared_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            declared_type,
            default: None,
            nullable: true,
            unique: false,
            indexed: false,
            check_expr: None,
            renamed_from: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn json(name: &str) -> Self {
        Self::new(name, FieldType::Json)
    }

    pub fn default_value(mut self, value: &str) -> Self {
        self.default = Some(value.to_string());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn check(mut self, expr: &str) -> Self {
        self.check_expr = Some(expr.to_string());
        self
    }

    pub fn renamed_from(mut self, old_name: &str) -> Self {
        self.renamed_from = Some(old_name.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub table_name: String,
    pub keep_history: bool,
    pub renamed_from_table: Option<String>,
    pub fields: Vec<FieldDef>,
}

impl EntityDescriptor {
    pub fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            keep_history: true,
            renamed_from_table: None,
            fields: Vec::new(),
        }
    }

    pub fn without_history(mut self) -> Self {
        self.keep_history = false;
        self
    }

    pub fn renamed_from(mut self, old_table: &str) -> Self {
        self.renamed_from_table = Some(old_table.to_string());
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn history_table(&self) -> String {
        format!("{}_history", self.table_name)
    }

    pub fn meta_table(&self) -> String {
        format!("{}_meta", self.table_name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All columns of the main table in declaration order: id, user fields,
    /// remaining system columns.
    pub fn all_columns(&self) -> Vec<String> {
        let mut columns = vec!["id".to_string()];
        columns.extend(self.field_names());
        columns.extend(
            SYSTEM_COLUMNS
                .iter()
                .skip(1)
                .map(|c| c.to_string()),
        );
        columns
    }

    /// Columns of the history table: main columns plus version/audit fields.
    pub fn history_columns(&self) -> Vec<String> {
        let mut columns = self.all_columns();
        columns.extend(HISTORY_COLUMNS.iter().map(|c| c.to_string()));
        columns
    }
}

/// Canonical serialization of one field for hashing. Key order is fixed by
/// struct declaration; maps use BTreeMap so JSON output is stable.
#[derive(Serialize)]
struct FieldFingerprint<'a> {
    #[serde(rename = "type")]
    declared_type: &'a str,
    default: &'a Option<String>,
    metadata: BTreeMap<&'static str, serde_json::Value>,
}

/// Process-wide registry of entity descriptors keyed by table name.
///
/// Constructed once at `Kernel::init` and shared by reference; tests build
/// their own per-case instances.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    entities: BTreeMap<String, EntityDescriptor>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: EntityDescriptor) {
        self.entities
            .insert(descriptor.table_name.clone(), descriptor);
    }

    pub fn get(&self, table_name: &str) -> Option<&EntityDescriptor> {
        self.entities.get(table_name)
    }

    pub fn contains(&self, table_name: &str) -> bool {
        self.entities.contains_key(table_name)
    }

    /// Descriptors in table-name order (BTreeMap iteration order).
    pub fn descriptors(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    /// Old table names still referenced as rename sources. Protected from
    /// `drop_table` even when table deletion is allowed.
    pub fn rename_sources(&self) -> Vec<String> {
        self.entities
            .values()
            .filter_map(|e| e.renamed_from_table.clone())
            .collect()
    }

    /// SHA-256 fingerprint over the canonical JSON serialization of every
    /// registered entity. Identical registries hash identically regardless
    /// of registration order.
    pub fn schema_hash(&self) -> String {
        let mut canonical: BTreeMap<&str, BTreeMap<&str, FieldFingerprint>> = BTreeMap::new();
        for (table, descriptor) in &self.entities {
            let mut fields = BTreeMap::new();
            for field in &descriptor.fields {
                let mut metadata: BTreeMap<&'static str, serde_json::Value> = BTreeMap::new();
                metadata.insert("nullable", field.nullable.into());
                metadata.insert("unique", field.unique.into());
                metadata.insert("index", field.indexed.into());
                if let Some(check) = &field.check_expr {
                    metadata.insert("check", check.clone().into());
                }
                if let Some(old) = &field.renamed_from {
                    metadata.insert("renamed_from", old.clone().into());
                }
                fields.insert(
                    field.name.as_str(),
                    FieldFingerprint {
                        declared_type: field.declared_type.as_str(),
                        default: &field.default,
                        metadata,
                    },
                );
            }
            canonical.insert(table.as_str(), fields);
        }

        let json = serde_json::to_string(&canonical).expect("schema serialization is infallible");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// First eight hex characters of the fingerprint, used in migration and
    /// backup file names.
    pub fn short_hash(&self) -> String {
        self.schema_hash()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_entity() -> EntityDescriptor {
        EntityDescriptor::new("notes")
            .field(FieldDef::text("text").not_null())
            .field(FieldDef::text("author").indexed())
    }

    #[test]
    fn hash_is_deterministic_across_registration_order() {
        let mut a = EntityRegistry::new();
        a.register(note_entity());
        a.register(EntityDescriptor::new("users").field(FieldDef::text("email").unique()));

        let mut b = EntityRegistry::new();
        b.register(EntityDescriptor::new("users").field(FieldDef::text("email").unique()));
        b.register(note_entity());

        assert_eq!(a.schema_hash(), b.schema_hash());
    }

    #[test]
    fn hash_changes_when_field_added() {
        let mut registry = EntityRegistry::new();
        registry.register(note_entity());
        let before = registry.schema_hash();

        registry.register(note_entity().field(FieldDef::text("pinned")));
        assert_ne!(before, registry.schema_hash());
    }

    #[test]
    fn hash_changes_on_metadata_change() {
        let mut a = EntityRegistry::new();
        a.register(EntityDescriptor::new("users").field(FieldDef::text("email")));
        let mut b = EntityRegistry::new();
        b.register(EntityDescriptor::new("users").field(FieldDef::text("email").unique()));
        assert_ne!(a.schema_hash(), b.schema_hash());
    }

    #[test]
    fn system_columns_are_implicit() {
        let descriptor = note_entity();
        let columns = descriptor.all_columns();
        assert_eq!(columns[0], "id");
        assert!(columns.contains(&"created_at".to_string()));
        assert!(columns.contains(&"deleted_at".to_string()));
        // User fields keep declaration order after id.
        assert_eq!(columns[1], "text");
        assert_eq!(columns[2], "author");
    }

    #[test]
    fn history_columns_extend_main_columns() {
        let descriptor = note_entity();
        let columns = descriptor.history_columns();
        assert!(columns.contains(&"version".to_string()));
        assert!(columns.contains(&"history_timestamp".to_string()));
    }

    #[test]
    fn rename_sources_are_collected() {
        let mut registry = EntityRegistry::new();
        registry.register(EntityDescriptor::new("projects").renamed_from("legacy_projects"));
        assert_eq!(registry.rename_sources(), vec!["legacy_projects".to_string()]);
    }

    #[test]
    fn short_hash_is_eight_chars() {
        let mut registry = EntityRegistry::new();
        registry.register(note_entity());
        assert_eq!(registry.short_hash().len(), 8);
    }
}
