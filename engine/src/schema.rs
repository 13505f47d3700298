//! Per-entity record schemas.
//!
//! Every row entering either store passes through [`Schema::parse`], which
//! checks the declared fields and extracts the identity and timestamp the sync
//! core needs. Entity-specific fields beyond those declared are kept verbatim.

use crate::{error::Result, Entity, Error, NaturalKey, Record, Stamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// ISO-8601 string or epoch milliseconds
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => Stamp::from_json(value).is_ok(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Render an `id` or natural-key value as a string.
///
/// Remote tables use both integer and uuid primary keys; either is accepted.
fn key_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Schema for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    /// Entity this schema describes
    pub entity: Entity,
    /// Field holding the stable business identifier
    pub natural_key: String,
    /// Candidate `*_at` fields, first present one is `updated_at`
    pub timestamp_fields: Vec<String>,
    /// Declared field definitions
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    /// Create a new entity schema.
    pub fn new(
        entity: Entity,
        natural_key: impl Into<String>,
        timestamp_fields: Vec<&str>,
        fields: Vec<FieldDef>,
    ) -> Self {
        Self {
            entity,
            natural_key: natural_key.into(),
            timestamp_fields: timestamp_fields.into_iter().map(String::from).collect(),
            fields,
        }
    }

    /// The field that receives a fresh stamp when a record is touched.
    pub fn primary_timestamp_field(&self) -> &str {
        self.timestamp_fields
            .first()
            .map(String::as_str)
            .unwrap_or("updated_at")
    }

    /// Validate a row against this schema.
    pub fn validate_row(&self, row: &serde_json::Value) -> Result<()> {
        let obj = row
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("row must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Validate a row and lift it into a [`Record`].
    pub fn parse(&self, row: serde_json::Value) -> Result<Record> {
        self.validate_row(&row)?;

        let serde_json::Value::Object(mut fields) = row else {
            return Err(Error::InvalidPayload("row must be an object".into()));
        };

        let id = fields
            .get("id")
            .and_then(key_string)
            .ok_or_else(|| Error::MissingRequiredField("id".into()))?;

        let natural_key = fields
            .get(&self.natural_key)
            .and_then(key_string)
            .map(NaturalKey::new)
            .ok_or_else(|| Error::MissingRequiredField(self.natural_key.clone()))?;

        let mut updated_at = None;
        for name in &self.timestamp_fields {
            match fields.get(name) {
                None | Some(serde_json::Value::Null) => continue,
                Some(value) => {
                    updated_at = Some(Stamp::from_json(value)?);
                    break;
                }
            }
        }

        // The reserved cache member never belongs to a record row.
        fields.remove(crate::record::CACHE_MEMBER);

        Ok(Record::from_parts(
            self.entity,
            id,
            natural_key,
            updated_at,
            self.primary_timestamp_field().to_string(),
            fields,
        ))
    }
}

/// Schemas for every synchronized entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Entity schemas by entity
    pub entities: BTreeMap<Entity, EntitySchema>,
}

impl Default for Schema {
    /// Schemas for the fellowship tables.
    fn default() -> Self {
        Schema::new()
            .with_entity(EntitySchema::new(
                Entity::Users,
                "email",
                vec!["updated_at", "created_at"],
                vec![
                    FieldDef::required("email", FieldType::String),
                    FieldDef::optional("name", FieldType::String),
                    FieldDef::optional("role", FieldType::String),
                    FieldDef::optional("updated_at", FieldType::Timestamp),
                    FieldDef::optional("created_at", FieldType::Timestamp),
                ],
            ))
            .with_entity(EntitySchema::new(
                Entity::Assignments,
                "id",
                vec!["updated_at", "created_at"],
                vec![
                    FieldDef::optional("title", FieldType::String),
                    FieldDef::optional("course_id", FieldType::Json),
                    FieldDef::optional("due_at", FieldType::Timestamp),
                    FieldDef::optional("updated_at", FieldType::Timestamp),
                    FieldDef::optional("created_at", FieldType::Timestamp),
                ],
            ))
            .with_entity(EntitySchema::new(
                Entity::Applications,
                "email",
                vec!["updated_at", "submitted_at", "created_at"],
                vec![
                    FieldDef::required("email", FieldType::String),
                    FieldDef::optional("status", FieldType::String),
                    FieldDef::optional("updated_at", FieldType::Timestamp),
                    FieldDef::optional("submitted_at", FieldType::Timestamp),
                    FieldDef::optional("created_at", FieldType::Timestamp),
                ],
            ))
    }
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }

    /// Add an entity to the schema.
    pub fn add_entity(&mut self, schema: EntitySchema) -> &mut Self {
        self.entities.insert(schema.entity, schema);
        self
    }

    /// Builder-style method to add an entity.
    pub fn with_entity(mut self, schema: EntitySchema) -> Self {
        self.add_entity(schema);
        self
    }

    /// Get an entity schema.
    pub fn entity(&self, entity: Entity) -> Result<&EntitySchema> {
        self.entities
            .get(&entity)
            .ok_or_else(|| Error::SchemaNotFound(entity.to_string()))
    }

    /// Validate a row for `entity` and lift it into a [`Record`].
    pub fn parse(&self, entity: Entity, row: serde_json::Value) -> Result<Record> {
        self.entity(entity)?.parse(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_user_row() {
        let schema = Schema::default();
        let row = json!({
            "id": "u-1",
            "email": "Ada@Example.com",
            "name": "Ada",
            "updated_at": "2024-03-01T10:00:00Z"
        });
        let record = schema.parse(Entity::Users, row).unwrap();

        assert_eq!(record.id(), "u-1");
        assert_eq!(record.natural_key().as_str(), "ada@example.com");
        assert_eq!(
            record.updated_at(),
            Some(Stamp::parse("2024-03-01T10:00:00Z").unwrap())
        );
        assert_eq!(record.row()["name"], "Ada");
    }

    #[test]
    fn integer_ids_are_accepted() {
        let schema = Schema::default();
        let record = schema
            .parse(Entity::Assignments, json!({"id": 42, "title": "Essay"}))
            .unwrap();
        assert_eq!(record.id(), "42");
        assert_eq!(record.natural_key().as_str(), "42");
        assert_eq!(record.updated_at(), None);
    }

    #[test]
    fn timestamp_falls_back_in_declared_order() {
        let schema = Schema::default();
        let record = schema
            .parse(
                Entity::Applications,
                json!({
                    "id": "a-1",
                    "email": "x@y.org",
                    "updated_at": null,
                    "submitted_at": "2024-02-01",
                    "created_at": "2024-01-01"
                }),
            )
            .unwrap();
        assert_eq!(record.updated_at(), Some(Stamp::parse("2024-02-01").unwrap()));
    }

    #[test]
    fn missing_natural_key_rejected() {
        let schema = Schema::default();
        let result = schema.parse(Entity::Users, json!({"id": "u-1", "name": "Ada"}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "email"));
    }

    #[test]
    fn missing_id_rejected() {
        let schema = Schema::default();
        let result = schema.parse(Entity::Users, json!({"email": "a@b.com"}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "id"));
    }

    #[test]
    fn blank_natural_key_rejected() {
        let schema = Schema::default();
        let result = schema.parse(Entity::Users, json!({"id": "u-1", "email": "   "}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "email"));
    }

    #[test]
    fn wrong_type_rejected() {
        let schema = Schema::default();
        let result = schema.parse(
            Entity::Users,
            json!({"id": "u-1", "email": "a@b.com", "name": 7}),
        );
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "name"));
    }

    #[test]
    fn malformed_timestamp_rejected() {
        let schema = Schema::default();
        let result = schema.parse(
            Entity::Users,
            json!({"id": "u-1", "email": "a@b.com", "updated_at": "soon"}),
        );
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "updated_at"));
    }

    #[test]
    fn non_object_rejected() {
        let schema = Schema::default();
        let result = schema.parse(Entity::Users, json!(["a@b.com"]));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn cache_member_is_stripped() {
        let schema = Schema::default();
        let record = schema
            .parse(
                Entity::Users,
                json!({"id": "u-1", "email": "a@b.com", "_cache": {"dirty": true}}),
            )
            .unwrap();
        assert!(record.row().get("_cache").is_none());
    }

    #[test]
    fn missing_entity_schema() {
        let schema = Schema::new();
        let result = schema.parse(Entity::Users, json!({"id": "u-1", "email": "a@b.com"}));
        assert!(matches!(result, Err(Error::SchemaNotFound(e)) if e == "users"));
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Timestamp.to_string(), "Timestamp");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn schema_serialization() {
        let schema = Schema::default();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
