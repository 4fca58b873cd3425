//! Document-store abstraction used by the journal services.
//!
//! Records are JSON objects grouped into named collections. Queries support
//! equality filters on top-level fields and a single sort field; the store
//! assigns ids on insert and keeps a per-document revision for
//! compare-and-set.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("record must be a json object, got {0}")]
    NotAnObject(&'static str),
}

/// Equality predicate on a top-level record field.
///
/// A `null` value never matches, including fields that are absent or null.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// A stored record together with its store-assigned identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub revision: i64,
    pub data: Value,
}

impl Document {
    /// Deserialize the record, exposing the document id as an `id` field.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let mut data = self.data.clone();
        if let Value::Object(map) = &mut data {
            map.insert("id".to_string(), Value::String(self.id.clone()));
        }
        Ok(serde_json::from_value(data)?)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist `record` as a new document and return its generated id.
    async fn insert(&self, collection: &str, record: Value) -> Result<String, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Return at most `limit` documents matching every filter.
    ///
    /// Documents with equal sort keys come back in insertion order when
    /// ascending and reverse insertion order when descending.
    async fn query_top_n(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    async fn query_all(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Returns true if a document was removed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Atomically write `record` under `id` if the current revision matches.
    ///
    /// `expected_revision` of `None` means the document must not exist yet.
    /// A successful write creates revision 1 or bumps the revision by exactly
    /// one. Returns false, without writing, when the expectation does not hold.
    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected_revision: Option<i64>,
        record: Value,
    ) -> Result<bool, StoreError>;
}

/// Serialize `value` into a record suitable for [`DocumentStore::insert`].
pub fn to_record<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    let record = serde_json::to_value(value)?;
    ensure_object(&record)?;
    Ok(record)
}

pub(crate) fn ensure_object(record: &Value) -> Result<(), StoreError> {
    match record {
        Value::Object(_) => Ok(()),
        Value::Null => Err(StoreError::NotAnObject("null")),
        Value::Bool(_) => Err(StoreError::NotAnObject("bool")),
        Value::Number(_) => Err(StoreError::NotAnObject("number")),
        Value::String(_) => Err(StoreError::NotAnObject("string")),
        Value::Array(_) => Err(StoreError::NotAnObject("array")),
    }
}

pub(crate) fn validate_field(field: &str) -> Result<(), StoreError> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidQuery(format!(
            "field name '{}' must match [A-Za-z0-9_]+",
            field
        )))
    }
}

pub(crate) fn validate_query(
    filters: &[Filter],
    order_by: Option<&OrderBy>,
) -> Result<(), StoreError> {
    for filter in filters {
        validate_field(&filter.field)?;
    }
    if let Some(order) = order_by {
        validate_field(&order.field)?;
    }
    Ok(())
}
