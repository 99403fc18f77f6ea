// Fixed-layout schema catalog. Every schema describes a row as a sequence
// of fixed-size typed fields; the row cache derives its slot geometry from
// the schema's value size.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub type SchemaId = u32;
pub type SchemaVer = u16;

/// Supported field types. Strings are fixed-width: the declared size is
/// the reserved extent, shorter contents are zero-padded by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Null,
    String,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Bool,
}

impl FieldType {
    /// Default on-row extent of the type. String fields may override it
    /// via [`SchemaField::with_size`].
    pub fn default_size(self) -> usize {
        match self {
            FieldType::Null => 0,
            FieldType::String => 128,
            FieldType::Int16 => 2,
            FieldType::Int32 => 4,
            FieldType::Int64 => 8,
            FieldType::Float => 4,
            FieldType::Double => 8,
            FieldType::Bool => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaField {
    pub field_type: FieldType,
    pub name: String,
    pub size: usize,
}

impl SchemaField {
    pub fn new(field_type: FieldType, name: impl Into<String>) -> Self {
        Self {
            field_type,
            name: name.into(),
            size: field_type.default_size(),
        }
    }

    /// A field with an explicit extent (fixed-width strings).
    pub fn with_size(field_type: FieldType, name: impl Into<String>, size: usize) -> Self {
        Self {
            field_type,
            name: name.into(),
            size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub version: SchemaVer,
    pub id: SchemaId,
    pub primary_key_field: usize,
    pub fields: Vec<SchemaField>,
    value_size: usize,
}

impl Schema {
    fn new(name: String, id: SchemaId, primary_key_field: usize, fields: Vec<SchemaField>) -> Self {
        let value_size = fields.iter().map(|f| f.size).sum();
        Self {
            name,
            version: 0,
            id,
            primary_key_field,
            fields,
            value_size,
        }
    }

    /// Total fixed row payload size in bytes.
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Byte offset of field `idx` within the row payload.
    pub fn field_offset(&self, idx: usize) -> Option<usize> {
        if idx >= self.fields.len() {
            return None;
        }
        Some(self.fields[..idx].iter().map(|f| f.size).sum())
    }

    pub fn field_size(&self, idx: usize) -> Option<usize> {
        self.fields.get(idx).map(|f| f.size)
    }
}

/// Thread-safe schema catalog with id allocation. Schema ids start at 1;
/// 0 is never handed out.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: DashMap<SchemaId, Arc<Schema>>,
    next_id: AtomicU32,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: DashMap::new(),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn create(
        &self,
        name: impl Into<String>,
        primary_key_field: usize,
        fields: Vec<SchemaField>,
    ) -> Arc<Schema> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let schema = Arc::new(Schema::new(name.into(), id, primary_key_field, fields));
        self.schemas.insert(id, schema.clone());
        schema
    }

    pub fn find(&self, id: SchemaId) -> Option<Arc<Schema>> {
        self.schemas.get(&id).map(|s| s.clone())
    }

    pub fn id_by_name(&self, name: &str) -> Option<SchemaId> {
        self.schemas
            .iter()
            .find(|entry| entry.value().name == name)
            .map(|entry| *entry.key())
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
