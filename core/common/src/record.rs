//! Remote record model exchanged with the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::ZoneId;

/// Fully qualified address of a record on the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub zone: ZoneId,
    pub record_type: String,
    pub name: String,
}

impl RecordId {
    pub fn new(zone: ZoneId, record_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            zone,
            record_type: record_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zone, self.record_type, self.name)
    }
}

/// Reference to a binary asset held by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Store-assigned key used to download the payload.
    pub key: String,
    /// Payload size as reported by the store.
    pub size: Option<u64>,
}

/// A typed field value on a remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    StringList(Vec<String>),
    Asset(AssetRef),
}

/// A record as stored on the remote side.
///
/// `change_tag` is the server version used for optimistic concurrency: a save
/// whose tag does not match the server's current tag is rejected with
/// [`crate::Error::VersionConflict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RecordId,
    pub fields: BTreeMap<String, FieldValue>,
    /// Server version tag; `None` for records never saved.
    pub change_tag: Option<String>,
    /// Server-assigned modification time.
    pub server_modified_at: Option<DateTime<Utc>>,
}

impl RemoteRecord {
    /// Create an empty, never-saved record.
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
            change_tag: None,
            server_modified_at: None,
        }
    }

    pub fn record_type(&self) -> &str {
        &self.id.record_type
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn set(&mut self, field: &str, value: FieldValue) {
        self.fields.insert(field.to_string(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(FieldValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        match self.fields.get(field) {
            Some(FieldValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn double(&self, field: &str) -> Option<f64> {
        match self.fields.get(field) {
            Some(FieldValue::Double(v)) => Some(*v),
            Some(FieldValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn bool(&self, field: &str) -> Option<bool> {
        match self.fields.get(field) {
            Some(FieldValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn date(&self, field: &str) -> Option<DateTime<Utc>> {
        match self.fields.get(field) {
            Some(FieldValue::Date(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn string_list(&self, field: &str) -> Option<&[String]> {
        match self.fields.get(field) {
            Some(FieldValue::StringList(v)) => Some(v),
            _ => None,
        }
    }

    pub fn asset(&self, field: &str) -> Option<&AssetRef> {
        match self.fields.get(field) {
            Some(FieldValue::Asset(v)) => Some(v),
            _ => None,
        }
    }
}
