//! Schema definition and validation.
//!
//! Schemas define the shape of each collection so local writes can be
//! rejected before they are applied and queued. Remote data is trusted and
//! never validated here.

use crate::{error::Result, CollectionName, Error, Fields, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Value type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    /// Any JSON number; prices are stored as doubles
    Float,
    Bool,
    /// Milliseconds since epoch
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    /// Whether a non-null JSON value has this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int | FieldType::Timestamp => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A named, typed field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Absent and `null` values are refused when set
    pub required: bool,
}

impl FieldDef {
    /// A field every write must carry.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// A field that may be absent or `null`.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    /// Check the value found for this field in a write.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        let value = match value {
            Some(Value::Null) | None if self.required => {
                return Err(Error::MissingRequiredField(self.name.clone()));
            }
            Some(Value::Null) | None => return Ok(()),
            Some(value) => value,
        };

        if self.field_type.accepts(value) {
            return Ok(());
        }
        Err(Error::TypeMismatch {
            field: self.name.clone(),
            expected: self.field_type.to_string(),
            got: describe(value).to_string(),
        })
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_f64() => "Float",
        Value::Number(_) => "Int",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Schema for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    /// Create a new collection schema.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Validate record fields against this schema. Unknown fields are allowed.
    pub fn validate_fields(&self, fields: &Fields) -> Result<()> {
        for field in &self.fields {
            field.validate(fields.get(&field.name))?;
        }
        Ok(())
    }

    /// Validate an arbitrary JSON payload, which must be an object.
    pub fn validate_payload(&self, payload: &Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;
        self.validate_fields(obj)
    }
}

/// The set of collections a replica may hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Checked against persisted snapshots
    pub version: SchemaVersion,
    pub collections: BTreeMap<CollectionName, CollectionSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: BTreeMap::new(),
        }
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection schema by name.
    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Names of all collections, sorted.
    pub fn collection_names(&self) -> Vec<CollectionName> {
        self.collections.keys().cloned().collect()
    }

    /// Validate a local write. Deletes pass `None` and only need a known collection.
    pub fn validate_write(&self, collection: &str, fields: Option<&Fields>) -> Result<()> {
        let collection_schema = self
            .collections
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;

        if let Some(fields) = fields {
            collection_schema.validate_fields(fields)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1).with_collection(CollectionSchema::new(
            "figuras",
            vec![
                FieldDef::required("nombre", FieldType::String),
                FieldDef::required("precio", FieldType::Float),
                FieldDef::optional("imagenUrl", FieldType::String),
            ],
        ))
    }

    #[test]
    fn validate_valid_payload() {
        let schema = test_schema();
        let collection = schema.get_collection("figuras").unwrap();

        let payload = json!({"nombre": "Goku", "precio": 30});
        assert!(collection.validate_payload(&payload).is_ok());

        let payload_with_optional =
            json!({"nombre": "Vegeta", "precio": 25.5, "imagenUrl": "https://img/1.png"});
        assert!(collection.validate_payload(&payload_with_optional).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = test_schema();
        let collection = schema.get_collection("figuras").unwrap();

        let result = collection.validate_payload(&json!({"nombre": "Goku"}));

        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "precio"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = test_schema();
        let collection = schema.get_collection("figuras").unwrap();

        let result = collection.validate_payload(&json!({"nombre": "Goku", "precio": "caro"}));

        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "precio"));
    }

    #[test]
    fn validate_null_required_field() {
        let schema = test_schema();
        let collection = schema.get_collection("figuras").unwrap();

        let result = collection.validate_payload(&json!({"nombre": null, "precio": 1}));

        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "nombre"));
    }

    #[test]
    fn validate_payload_must_be_object() {
        let schema = test_schema();
        let collection = schema.get_collection("figuras").unwrap();

        let result = collection.validate_payload(&json!(["nombre"]));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn validate_write_unknown_collection() {
        let schema = test_schema();
        let result = schema.validate_write("pedidos", None);
        assert!(matches!(result, Err(Error::CollectionNotFound(c)) if c == "pedidos"));
    }

    #[test]
    fn validate_write_delete_skips_fields() {
        let schema = test_schema();
        assert!(schema.validate_write("figuras", None).is_ok());

        let bad = json!({"nombre": 1}).as_object().cloned().unwrap();
        assert!(schema.validate_write("figuras", Some(&bad)).is_err());
    }

    #[test]
    fn collection_names_sorted() {
        let schema = test_schema()
            .with_collection(CollectionSchema::new("usuarios", vec![]))
            .with_collection(CollectionSchema::new("notificaciones", vec![]));
        assert_eq!(
            schema.collection_names(),
            vec!["figuras", "notificaciones", "usuarios"]
        );
    }

    #[test]
    fn timestamps_are_integers() {
        assert!(FieldType::Timestamp.accepts(&json!(1_706_745_600_000u64)));
        assert!(!FieldType::Timestamp.accepts(&json!(1.5)));
        assert!(!FieldType::Timestamp.accepts(&json!("2024-02-01")));
        assert!(FieldType::Float.accepts(&json!(30)));
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Timestamp.to_string(), "Timestamp");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn json_field_accepts_any() {
        let collection =
            CollectionSchema::new("events", vec![FieldDef::required("data", FieldType::Json)]);

        assert!(collection.validate_payload(&json!({"data": "string"})).is_ok());
        assert!(collection.validate_payload(&json!({"data": [1, 2, 3]})).is_ok());
        assert!(collection
            .validate_payload(&json!({"data": {"nested": "object"}}))
            .is_ok());
    }
}
