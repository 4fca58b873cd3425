use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Document, DocumentStore, Filter, OrderBy, SortDirection, StoreError, ensure_object,
    validate_query,
};

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    document: Document,
}

/// In-process [`DocumentStore`] with the same query semantics as the SQLite
/// store. Nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Slot>>>,
    next_seq: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    async fn select(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        validate_query(filters, order_by)?;

        let collections = self.collections.read().await;
        let Some(slots) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<&Slot> = slots
            .iter()
            .filter(|slot| filters.iter().all(|f| matches(&slot.document.data, f)))
            .collect();

        match order_by {
            Some(order) => matched.sort_by(|a, b| {
                let ordering = compare_values(
                    a.document.data.get(&order.field),
                    b.document.data.get(&order.field),
                )
                .then(a.seq.cmp(&b.seq));
                match order.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            }),
            None => matched.sort_by_key(|slot| slot.seq),
        }

        Ok(matched
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|slot| slot.document.clone())
            .collect())
    }
}

/// Equality as SQLite sees `json_extract` values: booleans are the integers
/// 0 and 1, and null never matches.
fn matches(data: &Value, filter: &Filter) -> bool {
    if filter.value.is_null() {
        return false;
    }
    match data.get(&filter.field) {
        None | Some(Value::Null) => false,
        Some(actual) => match (as_number(actual), as_number(&filter.value)) {
            (Some(a), Some(b)) => a == b,
            (None, None) => actual == &filter.value,
            _ => false,
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Orders values the way SQLite orders `json_extract` results: missing and
/// null first, then numbers (booleans count as 0/1), then text.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) | Some(Value::Number(_)) => 1,
            Some(_) => 2,
        }
    }

    fn as_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => match (a, b) {
            (Some(x), Some(y)) if rank(a) == 1 => as_number(x)
                .unwrap_or(0.0)
                .total_cmp(&as_number(y).unwrap_or(0.0)),
            (Some(x), Some(y)) if rank(a) == 2 => as_text(x).cmp(&as_text(y)),
            _ => Ordering::Equal,
        },
        other => other,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, collection: &str, record: Value) -> Result<String, StoreError> {
        ensure_object(&record)?;
        let id = Uuid::new_v4().to_string();
        let slot = Slot {
            seq: self.next_seq(),
            document: Document {
                id: id.clone(),
                revision: 1,
                data: record,
            },
        };
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(slot);
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|slots| {
            slots
                .iter()
                .find(|slot| slot.document.id == id)
                .map(|slot| slot.document.clone())
        }))
    }

    async fn query_top_n(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.select(collection, filters, order_by, Some(limit)).await
    }

    async fn query_all(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
    ) -> Result<Vec<Document>, StoreError> {
        self.select(collection, filters, order_by, None).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections.write().await;
        let Some(slots) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let before = slots.len();
        slots.retain(|slot| slot.document.id != id);
        Ok(slots.len() < before)
    }

    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected_revision: Option<i64>,
        record: Value,
    ) -> Result<bool, StoreError> {
        ensure_object(&record)?;

        // The write lock is held across check and write.
        let mut collections = self.collections.write().await;
        let slots = collections.entry(collection.to_string()).or_default();
        let existing = slots.iter_mut().find(|slot| slot.document.id == id);

        match (existing, expected_revision) {
            (None, None) => {
                let seq = self.next_seq();
                slots.push(Slot {
                    seq,
                    document: Document {
                        id: id.to_string(),
                        revision: 1,
                        data: record,
                    },
                });
                Ok(true)
            }
            (Some(slot), Some(expected)) if slot.document.revision == expected => {
                slot.document.revision += 1;
                slot.document.data = record;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
