//! Collections of the KameHouseLaguna app.

use laguna_engine::{CollectionSchema, FieldDef, FieldType, Schema};

/// Current schema version. Bump when a collection changes shape.
pub const SCHEMA_VERSION: u32 = 1;

pub const FIGURAS: &str = "figuras";
pub const NOTIFICACIONES: &str = "notificaciones";
pub const USUARIOS: &str = "usuarios";

/// Schema for the figure catalogue, admin notifications and user profiles.
pub fn default_schema() -> Schema {
    Schema::new(SCHEMA_VERSION)
        .with_collection(CollectionSchema::new(
            FIGURAS,
            vec![
                FieldDef::required("nombre", FieldType::String),
                FieldDef::optional("descripcion", FieldType::String),
                FieldDef::optional("imagenUrl", FieldType::String),
                FieldDef::required("precio", FieldType::Float),
                FieldDef::optional("fechaCreacion", FieldType::Timestamp),
                FieldDef::optional("fechaActualizacion", FieldType::Timestamp),
            ],
        ))
        .with_collection(CollectionSchema::new(
            NOTIFICACIONES,
            vec![
                FieldDef::required("titulo", FieldType::String),
                FieldDef::required("mensaje", FieldType::String),
                FieldDef::optional("fecha", FieldType::Timestamp),
                FieldDef::optional("autorId", FieldType::String),
                FieldDef::optional("autorEmail", FieldType::String),
            ],
        ))
        .with_collection(CollectionSchema::new(
            USUARIOS,
            vec![
                FieldDef::required("email", FieldType::String),
                FieldDef::required("rol", FieldType::String),
                FieldDef::optional("fechaCreacion", FieldType::Timestamp),
                FieldDef::optional("ultimoAcceso", FieldType::Timestamp),
            ],
        ))
}
